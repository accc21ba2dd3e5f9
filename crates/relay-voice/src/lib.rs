//! Provider adapters for the real-time voice relay.
//!
//! A live call touches three external services: a streaming
//! speech-to-text provider, a language model and a speech synthesizer.
//! This crate wraps each behind a small trait so the session manager can be
//! driven by real providers in production and by stubs in tests:
//!
//! - [`TranscriptionProvider`] + [`SttLink`]: one streaming transcription
//!   connection per session, with queue-until-ready semantics.
//! - [`AudioFrameBuffer`]: coalesces small inbound chunks into frames sized
//!   for the transcription provider.
//! - [`SpeechSynthesizer`]: stateless text-to-speech.
//! - [`ResponseGenerator`]: stateless reply generation from a persona and
//!   the recent conversation.
//! - [`extract`]: best-effort caller name and phone extraction.

pub mod buffer;
pub mod config;
pub mod deepgram;
pub mod error;
pub mod extract;
pub mod llm;
pub mod stt;
pub mod tts;

pub use buffer::AudioFrameBuffer;
pub use config::{DeepgramConfig, OpenAiConfig};
pub use deepgram::DeepgramTranscriber;
pub use error::VoiceError;
pub use llm::{ChatCompletionsGenerator, GenerationRequest, ResponseGenerator};
pub use stt::{
    LinkState, ProviderCommand, ProviderStream, SttEvent, SttLink, SttOptions, Transcript,
    TranscriptionProvider,
};
pub use tts::{DeepgramSpeech, SpeechSynthesizer};
