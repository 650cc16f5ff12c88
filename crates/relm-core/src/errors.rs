use thiserror::Error;

/// Top-level error type for the relm-core crate.
///
/// Code raised by user-supplied fragments never appears here: execution
/// faults are captured into [`crate::ExecutionResult::stderr`]. These
/// variants cover configuration mistakes and environment-level failures that
/// are fatal to the turn.
#[derive(Debug, Error)]
pub enum RelmError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("remote request timed out: {0}")]
    RemoteTimeout(String),
    #[error("sandbox lifecycle failure: {0}")]
    Sandbox(String),
    #[error("execution environment failure: {0}")]
    Environment(String),
    #[error("http transport failure: {0}")]
    Http(String),
    #[error(transparent)]
    Llm(#[from] relm_llm::LlmError),
}

impl RelmError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox(message.into())
    }

    pub fn environment(message: impl Into<String>) -> Self {
        Self::Environment(message.into())
    }
}

impl From<reqwest::Error> for RelmError {
    fn from(error: reqwest::Error) -> Self {
        Self::Http(error.to_string())
    }
}
