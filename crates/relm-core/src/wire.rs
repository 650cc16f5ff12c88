use relm_llm::{Prompt, UsageSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A completion request as it crosses a process or machine boundary: from
/// sandboxed code to the callback broker, and from the poller to the handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LmRequest {
    Single {
        prompt: Prompt,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Batched {
        prompts: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
}

/// Successful response to a single completion request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub response: String,
    pub model: String,
    pub usage: UsageSummary,
}

/// One slot of a batched completion. Success and failure are distinguished
/// structurally so consumers never have to sniff response text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchSlot {
    Ok { response: String },
    Error { error: String },
}

impl BatchSlot {
    /// Flatten to the text form delivered to sandboxed code, where a failed
    /// slot becomes an `Error: ...` marker string.
    pub fn into_text(self) -> String {
        match self {
            BatchSlot::Ok { response } => response,
            BatchSlot::Error { error } => format!("Error: {error}"),
        }
    }
}

/// Successful response to a batched completion request. Slot order matches
/// the input prompts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompleteBatchResponse {
    pub slots: Vec<BatchSlot>,
    pub model: String,
    pub usage: UsageSummary,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub error: String,
}

impl WireError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// An unanswered broker request, as listed by `GET /pending`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub id: Uuid,
    pub request: LmRequest,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingList {
    pub pending: Vec<PendingEntry>,
}

/// Payload posted to the broker to resolve a pending request. The `response`
/// value is delivered verbatim to the blocked enqueuer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RespondRequest {
    pub id: Uuid,
    pub response: Value,
}
