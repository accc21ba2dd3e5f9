//! Deepgram streaming transcription over WebSocket.

use crate::config::DeepgramConfig;
use crate::error::VoiceError;
use crate::stt::{ProviderCommand, ProviderStream, SttOptions, Transcript, TranscriptionProvider};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use url::Url;

/// Deepgram drops idle streams after roughly ten seconds without data.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Streaming transcription backed by Deepgram's `/v1/listen` endpoint.
#[derive(Debug, Clone)]
pub struct DeepgramTranscriber {
    config: DeepgramConfig,
}

impl DeepgramTranscriber {
    pub fn new(config: DeepgramConfig) -> Self {
        Self { config }
    }

    /// Builds the listen URL carrying the stream parameters.
    pub fn listen_url(&self, options: &SttOptions) -> Result<Url, VoiceError> {
        let mut url = Url::parse(&self.config.listen_url)
            .map_err(|e| VoiceError::Config(format!("invalid deepgram listen_url: {e}")))?;

        url.query_pairs_mut()
            .append_pair("model", &self.config.stt_model)
            .append_pair("language", &options.language)
            .append_pair("encoding", options.format.encoding.as_str())
            .append_pair("sample_rate", &options.format.sample_rate.to_string())
            .append_pair("channels", &options.format.channels.to_string())
            .append_pair("interim_results", "true")
            .append_pair("punctuate", "true")
            .append_pair("endpointing", &self.config.endpointing_ms.to_string());

        Ok(url)
    }
}

#[async_trait]
impl TranscriptionProvider for DeepgramTranscriber {
    async fn connect(&self, options: &SttOptions) -> Result<ProviderStream, VoiceError> {
        self.check_credentials()?;

        let url = self.listen_url(options)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Stt(format!("invalid listen request: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.config.api_key))
            .map_err(|_| VoiceError::Config("deepgram api_key is not a valid header".into()))?;
        request.headers_mut().insert("Authorization", auth);

        let (socket, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| VoiceError::Timeout("deepgram handshake", CONNECT_TIMEOUT))?
            .map_err(|e| VoiceError::Stt(format!("deepgram connection failed: {e}")))?;

        info!(
            model = %self.config.stt_model,
            language = %options.language,
            "connected to deepgram"
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (transcript_tx, transcript_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(socket, cmd_rx, transcript_tx));

        Ok(ProviderStream {
            commands: cmd_tx,
            transcripts: transcript_rx,
        })
    }

    fn check_credentials(&self) -> Result<(), VoiceError> {
        if self.config.api_key.trim().is_empty() {
            return Err(VoiceError::Config("deepgram api_key is not set".into()));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "deepgram"
    }
}

async fn pump<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    mut commands: mpsc::UnboundedReceiver<ProviderCommand>,
    transcripts: mpsc::UnboundedSender<Result<Transcript, VoiceError>>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(ProviderCommand::Audio(frame)) => {
                        if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                            let _ = transcripts.send(Err(VoiceError::Stt(format!("audio send failed: {e}"))));
                            break;
                        }
                    }
                    Some(ProviderCommand::Close) | None => {
                        let close_stream = r#"{"type":"CloseStream"}"#;
                        let _ = sink.send(Message::Text(close_stream.into())).await;
                        let _ = sink.close().await;
                        debug!("deepgram stream closed");
                        break;
                    }
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => match parse_message(text.as_str()) {
                        Ok(Some(transcript)) => {
                            if transcripts.send(Ok(transcript)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = transcripts.send(Err(e));
                            break;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "deepgram closed the stream");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = transcripts.send(Err(VoiceError::Stt(format!("deepgram stream error: {e}"))));
                        break;
                    }
                    None => break,
                }
            }
            _ = keepalive.tick() => {
                let keepalive = r#"{"type":"KeepAlive"}"#;
                if let Err(e) = sink.send(Message::Text(keepalive.into())).await {
                    warn!("deepgram keepalive failed: {}", e);
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeepgramMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    channel: Option<DeepgramChannel>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    #[serde(default)]
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

/// Parses one server message. Metadata and empty results yield `None`.
fn parse_message(text: &str) -> Result<Option<Transcript>, VoiceError> {
    let message: DeepgramMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("ignoring unparseable deepgram message: {}", e);
            return Ok(None);
        }
    };

    match message.kind.as_str() {
        "Results" => {
            let Some(best) = message
                .channel
                .and_then(|channel| channel.alternatives.into_iter().next())
            else {
                return Ok(None);
            };
            if best.transcript.trim().is_empty() {
                return Ok(None);
            }
            Ok(Some(Transcript {
                text: best.transcript,
                is_final: message.is_final,
                confidence: best.confidence,
            }))
        }
        "Error" => Err(VoiceError::Stt(
            message
                .description
                .unwrap_or_else(|| "deepgram reported an error".to_string()),
        )),
        _ => Ok(None),
    }
}
