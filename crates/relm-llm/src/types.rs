use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// The shapes of input a completion call accepts.
///
/// Variant order matters for deserialization: a bare JSON string becomes
/// `Text`, an array of role/content objects becomes `Messages`, and anything
/// else falls through to `Structured`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Messages(Vec<Message>),
    Structured(Value),
}

impl Prompt {
    /// Short name used in model-facing metadata lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Prompt::Text(_) => "string",
            Prompt::Messages(_) => "message list",
            Prompt::Structured(_) => "object",
        }
    }

    /// Character length of each top-level chunk of the prompt.
    pub fn chunk_lengths(&self) -> Vec<usize> {
        match self {
            Prompt::Text(text) => vec![text.chars().count()],
            Prompt::Messages(messages) => messages
                .iter()
                .map(|message| message.content.chars().count())
                .collect(),
            Prompt::Structured(value) => match value {
                Value::Object(map) => map.values().map(value_char_len).collect(),
                Value::Array(items) => items.iter().map(value_char_len).collect(),
                other => vec![value_char_len(other)],
            },
        }
    }

    pub fn total_chars(&self) -> usize {
        self.chunk_lengths().iter().sum()
    }

    /// Flatten the prompt to plain text for clients that only take a string.
    pub fn to_text(&self) -> String {
        match self {
            Prompt::Text(text) => text.clone(),
            Prompt::Messages(messages) => messages
                .iter()
                .map(|message| message.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            Prompt::Structured(value) => value.to_string(),
        }
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Text(text)
    }
}

impl From<Vec<Message>> for Prompt {
    fn from(messages: Vec<Message>) -> Self {
        Prompt::Messages(messages)
    }
}

impl From<Value> for Prompt {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Prompt::Text(text),
            other => Prompt::Structured(other),
        }
    }
}

fn value_char_len(value: &Value) -> usize {
    match value {
        Value::String(text) => text.chars().count(),
        other => other.to_string().chars().count(),
    }
}
