//! Chat messages and model responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// Author of a message.
///
/// Vendors disagree on the set of roles, so anything beyond the three common
/// ones is carried as an opaque label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    System,
    User,
    Assistant,
    Other(String),
}

impl Role {
    fn rank(&self) -> u8 {
        match self {
            Role::User => 0,
            Role::System => 1,
            Role::Assistant => 2,
            Role::Other(_) => 3,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Other(label) => label,
        }
    }
}

impl Ord for Role {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank()
            .cmp(&other.rank())
            .then_with(|| match (self, other) {
                (Role::Other(a), Role::Other(b)) => a.cmp(b),
                _ => Ordering::Equal,
            })
    }
}

impl PartialOrd for Role {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        match s.as_str() {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::Other(s),
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        Role::from(s.to_string())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Other(label) => label,
            known => known.as_str().to_string(),
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            role,
            content: content.into(),
            token_count: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_token_count(mut self, count: u32) -> Self {
        self.token_count = Some(count);
        self
    }
}

/// Normalized result of one model invocation.
///
/// Non-streaming calls produce a complete response with no chunks. Streaming
/// calls accumulate chunks in `streamed_content` until [`LlmResponse::finish`]
/// copies the joined text into `message.content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub message: Message,
    pub total_tokens: Option<u32>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    pub is_complete: bool,
    #[serde(default)]
    pub streamed_content: Vec<String>,
}

impl LlmResponse {
    /// A finished, non-streamed response.
    pub fn complete(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            message: Message::assistant(content),
            total_tokens: None,
            prompt_tokens: None,
            completion_tokens: None,
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
            finish_reason: None,
            refusal: None,
            is_complete: true,
            streamed_content: Vec::new(),
        }
    }

    /// An empty response that will be filled by stream chunks.
    pub fn partial() -> Self {
        Self {
            is_complete: false,
            ..Self::complete(String::new())
        }
    }

    pub fn with_usage(mut self, prompt: Option<u32>, completion: Option<u32>, total: Option<u32>) -> Self {
        self.prompt_tokens = prompt;
        self.completion_tokens = completion;
        self.total_tokens = total;
        self
    }

    pub fn with_finish_reason(mut self, reason: Option<String>) -> Self {
        self.finish_reason = reason;
        self
    }

    pub fn push_chunk(&mut self, chunk: impl Into<String>) {
        self.streamed_content.push(chunk.into());
    }

    /// Seal a streamed response: joined chunks become the canonical content.
    pub fn finish(&mut self) {
        let content = self.streamed_content.concat();
        let estimate = estimate_token_count(&content);
        self.message = Message::assistant(content).with_token_count(estimate);
        self.is_complete = true;
    }

    pub fn full_content(&self) -> String {
        if self.is_complete {
            self.message.content.clone()
        } else {
            self.streamed_content.concat()
        }
    }
}

/// Rough token estimate for display when a vendor reports no usage.
pub fn estimate_token_count(text: &str) -> u32 {
    let words = text.split_whitespace().count() as u32;
    words * 4 / 3
}
