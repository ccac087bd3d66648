//! Line grammars for model output.
//!
//! Both parsers are total: any text yields a result, malformed lines are
//! bucketed best-effort rather than reported.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static STATUS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^-?\s*\(blocker=(true|false),in-progress=(true|false)\)(.*)$").unwrap()
});

static CATEGORY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\s*\((general|repo|project|channel|team|user)\)(.*)$").unwrap());

pub const SINGLETON_TAG: &str = "general";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBullet {
    pub content: String,
    pub is_blocker: bool,
    pub is_in_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopedSummary {
    /// `repo`, `project`, `channel`, `team` or `user`.
    pub scope: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    pub general_summary: Option<String>,
    pub summaries: Vec<ScopedSummary>,
}

fn strip_trailing_periods(s: &str) -> &str {
    s.trim_end().trim_end_matches('.').trim()
}

fn strip_leading_dash(s: &str) -> &str {
    s.strip_prefix('-').unwrap_or(s).trim()
}

/// One record per non-blank line. Lines without the flag prefix default to
/// `blocker=false, in-progress=false`.
pub fn parse_status_update(text: &str) -> Vec<StatusBullet> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match STATUS_LINE.captures(line) {
            Some(caps) => StatusBullet {
                content: strip_trailing_periods(&caps[3]).to_string(),
                is_blocker: &caps[1] == "true",
                is_in_progress: &caps[2] == "true",
            },
            None => StatusBullet {
                content: strip_trailing_periods(strip_leading_dash(line)).to_string(),
                is_blocker: false,
                is_in_progress: false,
            },
        })
        .collect()
}

/// `(general)` keeps the last value; scoped tags append in order. A dash-led
/// untagged line counts as `default_scope`. Anything else is dropped.
pub fn parse_category_summary(text: &str, default_scope: &str) -> CategorySummary {
    let mut summary = CategorySummary::default();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(caps) = CATEGORY_LINE.captures(line) {
            let content = caps[2].trim().to_string();
            if &caps[1] == SINGLETON_TAG {
                summary.general_summary = Some(content);
            } else {
                summary.summaries.push(ScopedSummary {
                    scope: caps[1].to_string(),
                    content,
                });
            }
        } else if line.starts_with('-') && !line.contains("(general)") {
            summary.summaries.push(ScopedSummary {
                scope: default_scope.to_string(),
                content: strip_leading_dash(line).to_string(),
            });
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_prefix_sets_flags() {
        let bullets = parse_status_update("- (blocker=true,in-progress=false) Waiting on review...");
        assert_eq!(
            bullets,
            vec![StatusBullet {
                content: "Waiting on review".to_string(),
                is_blocker: true,
                is_in_progress: false,
            }]
        );
    }

    #[test]
    fn test_status_without_prefix_is_kept() {
        let text = "- Shipped the thing.\n\n   \n(blocker=false,in-progress=true) Migrating billing\nplain line";
        let bullets = parse_status_update(text);
        assert_eq!(bullets.len(), 3);
        assert_eq!(bullets[0].content, "Shipped the thing");
        assert!(!bullets[0].is_blocker && !bullets[0].is_in_progress);
        assert_eq!(bullets[1].content, "Migrating billing");
        assert!(bullets[1].is_in_progress);
        assert_eq!(bullets[2].content, "plain line");
    }

    #[test]
    fn test_malformed_prefix_falls_back() {
        let bullets = parse_status_update("- (blocker=maybe,in-progress=false) Unsure");
        assert_eq!(bullets[0].content, "(blocker=maybe,in-progress=false) Unsure");
        assert!(!bullets[0].is_blocker);
    }

    #[test]
    fn test_category_grammar() {
        let summary = parse_category_summary("(general) Busy week\n(repo) api: shipped v2", "repo");
        assert_eq!(summary.general_summary.as_deref(), Some("Busy week"));
        assert_eq!(
            summary.summaries,
            vec![ScopedSummary {
                scope: "repo".to_string(),
                content: "api: shipped v2".to_string(),
            }]
        );
    }

    #[test]
    fn test_category_last_general_wins_and_implicit_members() {
        let text = "- (general) First take\n- (channel) #eng: launch prep\n- #design: new icons\nrandom chatter\n- (general) Final take";
        let summary = parse_category_summary(text, "channel");
        assert_eq!(summary.general_summary.as_deref(), Some("Final take"));
        let contents: Vec<&str> = summary.summaries.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(contents, vec!["#eng: launch prep", "#design: new icons"]);
        assert!(summary.summaries.iter().all(|s| s.scope == "channel"));
    }

    #[test]
    fn test_empty_and_sentinel_input() {
        assert!(parse_status_update("").is_empty());
        assert_eq!(parse_category_summary("", "repo"), CategorySummary::default());

        let bullets = parse_status_update("No activity found during this period.");
        assert_eq!(bullets[0].content, "No activity found during this period");
        assert_eq!(
            parse_category_summary("No activity found during this period.", "repo"),
            CategorySummary::default()
        );
    }
}
