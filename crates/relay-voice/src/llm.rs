//! Reply generation through an OpenAI-compatible chat completions API.

use crate::config::OpenAiConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use relay_types::{Agent, ConversationMessage, MessageRole, Registration};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Transport-level bound; the session applies its own, usually shorter, one.
const LLM_TIMEOUT: Duration = Duration::from_secs(60);

const SPOKEN_REPLY_INSTRUCTION: &str = "You are speaking with a caller on the phone. \
Reply in one to three short, natural sentences suitable for being read aloud. \
Do not use lists, markdown, or emoji.";

/// Everything one reply is generated from.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub persona: &'a Agent,
    /// Recent conversation, oldest first. May already end with `utterance`.
    pub history: &'a [ConversationMessage],
    pub utterance: &'a str,
    pub registration: &'a Registration,
}

/// Stateless reply generation.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<String, VoiceError>;

    /// Fails if the generator has no usable credentials.
    fn check_credentials(&self) -> Result<(), VoiceError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Assembles the bounded prompt for one turn.
///
/// The system message carries the persona and any caller details already
/// known. At most `history_limit` prior messages follow, then the new
/// utterance. A trailing history entry equal to the utterance is the
/// utterance itself, already persisted, and is not repeated.
pub fn build_prompt(request: &GenerationRequest<'_>, history_limit: usize) -> Vec<ChatMessage> {
    let mut system = String::new();
    if !request.persona.system_prompt.trim().is_empty() {
        system.push_str(request.persona.system_prompt.trim());
        system.push_str("\n\n");
    }
    if !request.persona.name.trim().is_empty() {
        system.push_str(&format!("Your name is {}. ", request.persona.name.trim()));
    }
    system.push_str(SPOKEN_REPLY_INSTRUCTION);

    let reg = request.registration;
    if reg.caller_name.is_some() || reg.caller_phone.is_some() {
        system.push_str("\n\nKnown caller details:");
        if let Some(name) = &reg.caller_name {
            system.push_str(&format!("\n- name: {name}"));
        }
        if let Some(phone) = &reg.caller_phone {
            system.push_str(&format!("\n- phone: {phone}"));
        }
    }

    let mut history = request.history;
    if let Some((last, rest)) = history.split_last() {
        if last.role == MessageRole::User && last.content == request.utterance {
            history = rest;
        }
    }
    let start = history.len().saturating_sub(history_limit);

    let mut messages = Vec::with_capacity(history.len() - start + 2);
    messages.push(ChatMessage::new("system", system));
    messages.extend(
        history[start..]
            .iter()
            .map(|m| ChatMessage::new(m.role.as_str(), m.content.clone())),
    );
    messages.push(ChatMessage::new("user", request.utterance));
    messages
}

/// [`ResponseGenerator`] backed by `{base_url}/chat/completions`.
#[derive(Debug, Clone)]
pub struct ChatCompletionsGenerator {
    config: OpenAiConfig,
    history_limit: usize,
    client: reqwest::Client,
}

impl ChatCompletionsGenerator {
    pub fn new(config: OpenAiConfig, history_limit: usize) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder().timeout(LLM_TIMEOUT).build()?;
        Ok(Self {
            config,
            history_limit,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ResponseGenerator for ChatCompletionsGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<String, VoiceError> {
        self.check_credentials()?;

        let body = ChatCompletionRequest {
            model: &self.config.model,
            messages: build_prompt(&request, self.history_limit),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VoiceError::Timeout("response generation", LLM_TIMEOUT)
                } else {
                    VoiceError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|wrapper| wrapper.error.message)
                .unwrap_or(text);
            return Err(VoiceError::Llm(format!("{status}: {message}")));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Llm(format!("unreadable completion: {e}")))?;

        let reply = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| VoiceError::Llm("completion had no content".into()))?;

        debug!(
            model = %self.config.model,
            agent_id = %request.persona.agent_id,
            reply_chars = reply.len(),
            "reply generated"
        );
        Ok(reply)
    }

    fn check_credentials(&self) -> Result<(), VoiceError> {
        if self.config.api_key.trim().is_empty() {
            return Err(VoiceError::Config("openai api_key is not set".into()));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}
