use crate::config::DeepgramConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use relay_types::AudioFormat;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Maximum text input size for TTS (64 KiB).
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Upper bound on one synthesis request, independent of the session's
/// response timeout.
const TTS_TIMEOUT: Duration = Duration::from_secs(30);

/// Stateless text-to-speech.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Converts `text` into encoded audio in the session's audio format.
    async fn synthesize(&self, text: &str, language: &str, voice: &str)
        -> Result<Vec<u8>, VoiceError>;

    /// Fails if the synthesizer has no usable credentials.
    fn check_credentials(&self) -> Result<(), VoiceError> {
        Ok(())
    }
}

/// Rejects input the provider would refuse anyway.
pub fn validate_text(text: &str) -> Result<(), VoiceError> {
    if text.trim().is_empty() {
        return Err(VoiceError::Tts("text must not be empty".to_string()));
    }
    if text.len() > MAX_TTS_INPUT_BYTES {
        return Err(VoiceError::Tts(format!(
            "text exceeds maximum size: {} bytes (limit: {} bytes)",
            text.len(),
            MAX_TTS_INPUT_BYTES
        )));
    }
    Ok(())
}

/// Speech synthesis through Deepgram's `/v1/speak` endpoint.
///
/// Audio comes back headerless (`container=none`) in the configured
/// format, ready to be base64-encoded into a media event.
#[derive(Debug, Clone)]
pub struct DeepgramSpeech {
    config: DeepgramConfig,
    format: AudioFormat,
    client: reqwest::Client,
}

impl DeepgramSpeech {
    pub fn new(config: DeepgramConfig, format: AudioFormat) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder().timeout(TTS_TIMEOUT).build()?;
        Ok(Self {
            config,
            format,
            client,
        })
    }

    fn speak_url(&self, voice: &str) -> Result<Url, VoiceError> {
        let mut url = Url::parse(&self.config.speak_url)
            .map_err(|e| VoiceError::Config(format!("invalid deepgram speak_url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("model", voice)
            .append_pair("encoding", self.format.encoding.as_str())
            .append_pair("sample_rate", &self.format.sample_rate.to_string())
            .append_pair("container", "none");
        Ok(url)
    }
}

#[async_trait]
impl SpeechSynthesizer for DeepgramSpeech {
    async fn synthesize(
        &self,
        text: &str,
        language: &str,
        voice: &str,
    ) -> Result<Vec<u8>, VoiceError> {
        validate_text(text)?;
        self.check_credentials()?;

        let url = self.speak_url(voice)?;
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Token {}", self.config.api_key))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VoiceError::Timeout("speech synthesis", TTS_TIMEOUT)
                } else {
                    VoiceError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!(
                "deepgram speak returned {status}: {body}"
            )));
        }

        let audio = response.bytes().await?.to_vec();
        debug!(
            voice,
            language,
            chars = text.len(),
            audio_bytes = audio.len(),
            "speech synthesized"
        );
        Ok(audio)
    }

    fn check_credentials(&self) -> Result<(), VoiceError> {
        if self.config.api_key.trim().is_empty() {
            return Err(VoiceError::Config("deepgram api_key is not set".into()));
        }
        Ok(())
    }
}
