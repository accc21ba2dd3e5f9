use serde::{Deserialize, Serialize};
use std::fmt;

fn default_stt_model() -> String {
    "nova-2-phonecall".to_string()
}

fn default_listen_url() -> String {
    "wss://api.deepgram.com/v1/listen".to_string()
}

fn default_speak_url() -> String {
    "https://api.deepgram.com/v1/speak".to_string()
}

fn default_endpointing_ms() -> u32 {
    300
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    150
}

fn default_temperature() -> f32 {
    0.7
}

/// Credentials and endpoints for Deepgram, used for both streaming
/// transcription and speech synthesis.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeepgramConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    /// Streaming transcription model.
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
    #[serde(default = "default_listen_url")]
    pub listen_url: String,
    #[serde(default = "default_speak_url")]
    pub speak_url: String,
    /// Silence, in milliseconds, after which the provider finalizes an utterance.
    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u32,
}

impl Default for DeepgramConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            stt_model: default_stt_model(),
            listen_url: default_listen_url(),
            speak_url: default_speak_url(),
            endpointing_ms: default_endpointing_ms(),
        }
    }
}

impl fmt::Debug for DeepgramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeepgramConfig")
            .field("api_key", &"[REDACTED]")
            .field("stt_model", &self.stt_model)
            .field("listen_url", &self.listen_url)
            .field("speak_url", &self.speak_url)
            .field("endpointing_ms", &self.endpointing_ms)
            .finish()
    }
}

impl DeepgramConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }
}

/// Credentials and model selection for an OpenAI-compatible chat
/// completions endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    /// Replies are spoken aloud, so they are kept short.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_keys() {
        let deepgram = format!("{:?}", DeepgramConfig::new("dg-secret"));
        let openai = format!("{:?}", OpenAiConfig::new("sk-secret"));
        assert!(!deepgram.contains("dg-secret"));
        assert!(!openai.contains("sk-secret"));
        assert!(deepgram.contains("[REDACTED]"));
    }

    #[test]
    fn keys_are_never_serialized() {
        let json = serde_json::to_value(OpenAiConfig::new("sk-secret")).unwrap();
        assert!(json.get("api_key").is_none());
        assert_eq!(json["model"], "gpt-4o-mini");
    }
}
