//! Tool-calling generation over the normalized store.

mod llm;
mod prompts;
mod runtime;
mod tools;
mod usage;

pub use llm::{
    ChatMessage, ChatModel, ChatRequest, ChatResponse, LlmError, OpenAiChatModel, Role, ToolCall,
    ToolDefinition,
};
pub use prompts::{summary_scope, MEMBER_SCOPE, NO_ACTIVITY_SENTINEL};
pub use runtime::{
    ActivitySummary, ActivitySummaryRequest, AgentRuntime, StatusSummary, StatusSummaryRequest, StatusUpdate,
    StatusUpdateRequest,
};
pub use tools::{AgentTool, ToolError, ToolRuntime, ToolScope};
pub use usage::{StoreUsageMeter, UsageKind, UsageMeter};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("organization {organization_id} used {used} of {limit} generations this period")]
    UsageLimitExceeded {
        organization_id: String,
        used: i64,
        limit: i64,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Model(#[from] LlmError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
