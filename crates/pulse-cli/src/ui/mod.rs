use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Print success message
pub fn success(msg: &str) {
    println!("{} {}", style("✔").green(), msg);
}

/// Print error message
pub fn error(msg: &str) {
    println!("{} {}", style("✖").red(), msg);
}

/// Print warning message
pub fn warn(msg: &str) {
    println!("{} {}", style("!").yellow(), msg);
}

/// Print info message (indented)
pub fn info(msg: &str) {
    println!("  {}", msg);
}

/// Print a header/title
pub fn header(msg: &str) {
    println!();
    println!("  {}", style(msg).bold());
    println!();
}

/// Dimmed secondary line
pub fn detail(msg: &str) {
    println!("    {}", style(msg).dim());
}

/// Create a spinner for indeterminate progress
pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(spinner_style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(spinner_style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// One status bullet with its flags as a colored marker.
pub fn bullet(content: &str, is_blocker: bool, is_in_progress: bool) {
    let marker = if is_blocker {
        style("blocked").red()
    } else if is_in_progress {
        style("ongoing").yellow()
    } else {
        style("done").green()
    };
    println!("  - [{}] {}", marker, content);
}
