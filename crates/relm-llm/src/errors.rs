use thiserror::Error;

/// Errors surfaced by model clients.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),
    #[error("provider error: {0}")]
    Provider(String),
}

impl LlmError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }
}
