use async_trait::async_trait;

use crate::errors::LlmError;
use crate::types::Prompt;
use crate::usage::{ModelUsage, UsageSummary};

/// A single completion together with the usage it consumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: ModelUsage,
}

impl Completion {
    pub fn new(text: impl Into<String>, usage: ModelUsage) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }
}

/// Contract for a model provider wrapper.
///
/// Implementations are thin adapters over third-party APIs: given a prompt,
/// return text plus the usage of that call, and keep cumulative counters for
/// `usage_summary`. Construction of a concrete client must fail with
/// [`LlmError::Configuration`] when no model identifier is resolvable.
#[async_trait]
pub trait LmClient: Send + Sync {
    /// The model identifier requests are issued against.
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &Prompt) -> Result<Completion, LlmError>;

    /// Cumulative usage across every call made through this client.
    fn usage_summary(&self) -> UsageSummary;
}
