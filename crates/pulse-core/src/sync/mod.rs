//! Sync orchestration: generic adapter pipeline, status reporting and the step runner.

mod orchestrator;
mod pipeline;
mod status;

pub use orchestrator::{StepSummary, SyncOrchestrator, SyncOutcome, SyncRequest};
pub use pipeline::{run_adapter, AdapterReport, SyncStrategy};
pub use status::StatusReporter;
