use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Creation time of a conversation in milliseconds since the Unix epoch.
///
/// Doubles as the conversation identity; later conversations compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConversationId(pub i64);

impl ConversationId {
    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConversationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ConversationId)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Reasoning fragments streamed alongside the reply, kept out of `content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            reasoning: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            reasoning: None,
        }
    }

    /// Empty assistant entry that streamed deltas are folded into.
    pub fn placeholder() -> Self {
        Self::assistant(String::new())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: String,
    pub created_at: String,
    pub preview: String,
    pub message_count: usize,
}

const PREVIEW_CHARS: usize = 10;

impl ConversationSummary {
    pub fn new(id: ConversationId, messages: &[Message]) -> Self {
        let preview = messages
            .first()
            .map(|m| m.content.chars().take(PREVIEW_CHARS).collect::<String>())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "Empty Chat".to_string());
        let created_at = id
            .created_at()
            .map(|t| {
                t.with_timezone(&chrono::Local)
                    .format("%m-%d %H:%M")
                    .to_string()
            })
            .unwrap_or_default();

        Self {
            id: id.to_string(),
            created_at,
            preview,
            message_count: messages.len(),
        }
    }
}
