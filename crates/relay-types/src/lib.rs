//! Shared types for the voice relay.
//!
//! Every crate in the workspace takes its cross-cutting domain types from
//! here: agents, conversation messages, caller registration state and the
//! audio format a session streams in. Nothing in this crate performs I/O.

pub mod agent;
pub mod audio;

pub use agent::Agent;
pub use audio::{AudioEncoding, AudioFormat};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Who authored a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The caller, as transcribed.
    User,
    /// The agent, as generated (or the configured greeting).
    Assistant,
}

impl MessageRole {
    /// Returns the stored label for this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stored role label is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown message role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for MessageRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// One persisted turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    /// Creation timestamp (ISO 8601).
    pub created_at: String,
}

impl ConversationMessage {
    /// Builds an unsaved message stamped with an empty timestamp.
    ///
    /// Used for prompt assembly where the timestamp is irrelevant.
    pub fn transient(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: String::new(),
        }
    }
}

/// Caller details gathered opportunistically during a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub caller_name: Option<String>,
    pub caller_phone: Option<String>,
}

impl Registration {
    /// True once both the caller's name and phone number are known.
    pub fn is_complete(&self) -> bool {
        self.caller_name.is_some() && self.caller_phone.is_some()
    }

    /// Fills any missing field from `other`, never overwriting a known value.
    ///
    /// Returns `true` if anything changed.
    pub fn absorb(&mut self, other: Registration) -> bool {
        let mut changed = false;
        if self.caller_name.is_none() && other.caller_name.is_some() {
            self.caller_name = other.caller_name;
            changed = true;
        }
        if self.caller_phone.is_none() && other.caller_phone.is_some() {
            self.caller_phone = other.caller_phone;
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_role_round_trips_through_labels() {
        for role in [MessageRole::User, MessageRole::Assistant] {
            assert_eq!(role.as_str().parse::<MessageRole>(), Ok(role));
        }
        assert_eq!(
            "system".parse::<MessageRole>(),
            Err(UnknownRole("system".to_string()))
        );
    }

    #[test]
    fn registration_absorb_keeps_known_values() {
        let mut reg = Registration {
            caller_name: Some("Priya".to_string()),
            caller_phone: None,
        };

        let changed = reg.absorb(Registration {
            caller_name: Some("Someone Else".to_string()),
            caller_phone: Some("9876543210".to_string()),
        });

        assert!(changed);
        assert_eq!(reg.caller_name.as_deref(), Some("Priya"));
        assert_eq!(reg.caller_phone.as_deref(), Some("9876543210"));
        assert!(reg.is_complete());

        assert!(!reg.absorb(Registration::default()));
    }
}
