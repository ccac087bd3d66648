//! Sync engine, agent runtime and output parsers for the pulse workspace.

pub mod agent;
pub mod config;
pub mod error;
pub mod fanout;
pub mod parser;
pub mod providers;
pub mod sync;

pub use agent::{AgentError, AgentRuntime, OpenAiChatModel, StoreUsageMeter};
pub use config::PulseConfig;
pub use error::{ProviderError, SyncError};
pub use fanout::{ChannelQueue, EventFanout, EventProjector, EventQueue};
pub use parser::{parse_category_summary, parse_status_update, CategorySummary, StatusBullet};
pub use providers::{ProviderRegistry, ProviderSync};
pub use sync::{SyncOrchestrator, SyncOutcome, SyncRequest};
