//! Agent configuration.
//!
//! An `Agent` is a tenant-configured persona. A session loads it once at
//! start and never mutates it.

use serde::{Deserialize, Serialize};

/// A tenant-configured voice agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Public identifier used in session start payloads.
    pub agent_id: String,
    /// Owning tenant. `None` means the agent is not tenant-scoped.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Display name, also offered to the language model as the persona name.
    pub name: String,
    /// Persona instructions placed at the top of every prompt.
    #[serde(default)]
    pub system_prompt: String,
    /// Spoken as soon as the session starts. Empty disables the greeting.
    #[serde(default)]
    pub greeting: String,
    /// Provider voice selector (e.g. `aura-asteria-en`).
    pub voice: String,
    /// BCP 47 language tag used for transcription and synthesis.
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en-US".to_string()
}

impl Agent {
    /// Whether `client_id` may run sessions against this agent.
    pub fn belongs_to(&self, client_id: &str) -> bool {
        match &self.client_id {
            Some(owner) => owner == client_id,
            None => true,
        }
    }
}
