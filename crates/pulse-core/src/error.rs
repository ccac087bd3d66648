use thiserror::Error;

/// Failure talking to a provider API.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider}: request failed: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },

    #[error("{provider}: HTTP {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    /// The body arrived but signals failure (Slack `ok: false`, GraphQL `errors`).
    #[error("{provider}: {endpoint} rejected the request: {message}")]
    Rejected {
        provider: &'static str,
        endpoint: String,
        message: String,
    },

    #[error("{provider}: could not decode {endpoint}: {message}")]
    Decode {
        provider: &'static str,
        endpoint: String,
        message: String,
    },
}

impl ProviderError {
    /// Transport failures and HTTP error statuses. Inside a container loop
    /// these skip the container instead of failing the step.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transport { .. } | ProviderError::Status { .. })
    }

    pub fn provider(&self) -> &'static str {
        match self {
            ProviderError::Transport { provider, .. }
            | ProviderError::Status { provider, .. }
            | ProviderError::Rejected { provider, .. }
            | ProviderError::Decode { provider, .. } => provider,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("integration {0} not found")]
    MissingIntegration(i64),

    #[error("integration {0} already has a sync in progress")]
    AlreadyRunning(i64),

    #[error("sync run {0} not found")]
    UnknownSyncRun(i64),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("step {step} timed out after {secs}s")]
    StepTimeout { step: String, secs: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
