//! Streaming speech-to-text session adapter.
//!
//! [`SttLink`] owns exactly one streaming connection per voice session. The
//! handshake runs in the background; frames sent before it completes are
//! queued and flushed in FIFO order the moment the provider is ready. A
//! dropped provider connection is not reopened: the link becomes
//! [`LinkState::Unavailable`] for the rest of the session.

use crate::error::VoiceError;
use async_trait::async_trait;
use relay_types::AudioFormat;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A transcript segment reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// `true` once the provider will no longer revise this segment.
    pub is_final: bool,
    pub confidence: f32,
}

impl Transcript {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence: 0.0,
        }
    }

    pub fn finalized(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence: 1.0,
        }
    }
}

/// Per-session stream parameters.
#[derive(Debug, Clone)]
pub struct SttOptions {
    pub language: String,
    pub format: AudioFormat,
}

/// Instructions from the link to a connected provider stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCommand {
    Audio(Vec<u8>),
    /// Finish the stream and release the provider connection.
    Close,
}

/// The two halves of an established provider connection.
///
/// The provider keeps the connection alive until it sees
/// [`ProviderCommand::Close`], the command sender is dropped, or the remote
/// end fails. Ending `transcripts` signals that the connection is gone.
pub struct ProviderStream {
    pub commands: mpsc::UnboundedSender<ProviderCommand>,
    pub transcripts: mpsc::UnboundedReceiver<Result<Transcript, VoiceError>>,
}

/// A streaming transcription service.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Performs the streaming handshake. Resolves once the provider is
    /// ready to accept audio.
    async fn connect(&self, options: &SttOptions) -> Result<ProviderStream, VoiceError>;

    /// Fails if the provider has no usable credentials.
    fn check_credentials(&self) -> Result<(), VoiceError> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// What the link reports back to its session.
#[derive(Debug)]
pub enum SttEvent {
    Transcript(Transcript),
    /// The handshake failed or the provider dropped mid-stream. No further
    /// transcripts will arrive for this session.
    Unavailable(String),
}

/// Lifecycle of an [`SttLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Handshake in progress; frames are queued.
    Connecting,
    /// Frames are forwarded immediately.
    Ready,
    /// Provider failed; frames are dropped.
    Unavailable,
    /// Closed by the session; frames are dropped.
    Closed,
}

struct LinkInner {
    state: LinkState,
    backlog: VecDeque<Vec<u8>>,
    backlog_bytes: usize,
    commands: Option<mpsc::UnboundedSender<ProviderCommand>>,
}

/// One session's handle on its transcription stream.
pub struct SttLink {
    inner: Arc<Mutex<LinkInner>>,
    max_backlog_bytes: usize,
    task: JoinHandle<()>,
}

fn lock(inner: &Mutex<LinkInner>) -> MutexGuard<'_, LinkInner> {
    // Every critical section leaves the state consistent, so a poisoned
    // guard is still safe to use.
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SttLink {
    /// Starts the provider handshake in the background and returns at once.
    ///
    /// Transcripts and availability changes are delivered on `events`.
    /// Frames queued while connecting are capped at `max_backlog_bytes`;
    /// when the cap is exceeded the oldest frames are dropped.
    pub fn open(
        provider: Arc<dyn TranscriptionProvider>,
        options: SttOptions,
        max_backlog_bytes: usize,
        events: mpsc::UnboundedSender<SttEvent>,
    ) -> Self {
        let inner = Arc::new(Mutex::new(LinkInner {
            state: LinkState::Connecting,
            backlog: VecDeque::new(),
            backlog_bytes: 0,
            commands: None,
        }));

        let task = tokio::spawn(run_link(provider, options, inner.clone(), events));

        Self {
            inner,
            max_backlog_bytes,
            task,
        }
    }

    /// Forwards a frame, or queues it while the handshake is pending.
    ///
    /// Never blocks and never fails: frames sent after the link became
    /// unavailable or closed are dropped.
    pub fn send(&self, frame: Vec<u8>) {
        let mut inner = lock(&self.inner);
        match inner.state {
            LinkState::Ready => {
                let delivered = inner
                    .commands
                    .as_ref()
                    .is_some_and(|tx| tx.send(ProviderCommand::Audio(frame)).is_ok());
                if !delivered {
                    debug!("transcription stream already gone; frame dropped");
                }
            }
            LinkState::Connecting => {
                inner.backlog_bytes += frame.len();
                inner.backlog.push_back(frame);

                let mut dropped = 0;
                while inner.backlog_bytes > self.max_backlog_bytes && inner.backlog.len() > 1 {
                    if let Some(oldest) = inner.backlog.pop_front() {
                        inner.backlog_bytes -= oldest.len();
                        dropped += oldest.len();
                    }
                }
                if dropped > 0 {
                    warn!(
                        dropped_bytes = dropped,
                        limit = self.max_backlog_bytes,
                        "transcription backlog full; dropped oldest audio"
                    );
                }
            }
            LinkState::Unavailable | LinkState::Closed => {
                debug!(state = ?inner.state, "transcription unavailable; frame dropped");
            }
        }
    }

    /// Closes the provider stream. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state == LinkState::Closed {
            return false;
        }
        inner.state = LinkState::Closed;
        inner.backlog.clear();
        inner.backlog_bytes = 0;
        if let Some(tx) = inner.commands.take() {
            let _ = tx.send(ProviderCommand::Close);
        }
        true
    }

    pub fn state(&self) -> LinkState {
        lock(&self.inner).state
    }

    /// Number of frames waiting for the handshake.
    pub fn backlog_len(&self) -> usize {
        lock(&self.inner).backlog.len()
    }
}

impl Drop for SttLink {
    fn drop(&mut self) {
        if self.close() && !self.task.is_finished() {
            debug!("transcription link dropped without explicit close");
        }
    }
}

async fn run_link(
    provider: Arc<dyn TranscriptionProvider>,
    options: SttOptions,
    inner: Arc<Mutex<LinkInner>>,
    events: mpsc::UnboundedSender<SttEvent>,
) {
    let stream = match provider.connect(&options).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(provider = provider.name(), "transcription handshake failed: {}", e);
            mark_unavailable(&inner, &events, format!("transcription handshake failed: {e}"));
            return;
        }
    };

    let ProviderStream {
        commands,
        mut transcripts,
    } = stream;

    {
        let mut guard = lock(&inner);
        if guard.state == LinkState::Closed {
            // The session ended while we were connecting.
            let _ = commands.send(ProviderCommand::Close);
            return;
        }

        // Flush under the lock so no concurrent send can overtake the backlog.
        let flushed = guard.backlog.len();
        while let Some(frame) = guard.backlog.pop_front() {
            if commands.send(ProviderCommand::Audio(frame)).is_err() {
                break;
            }
        }
        guard.backlog.clear();
        guard.backlog_bytes = 0;
        guard.commands = Some(commands);
        guard.state = LinkState::Ready;

        info!(
            provider = provider.name(),
            language = %options.language,
            flushed_frames = flushed,
            "transcription link ready"
        );
    }

    let mut reason = "transcription stream ended".to_string();
    while let Some(result) = transcripts.recv().await {
        match result {
            Ok(transcript) => {
                if events.send(SttEvent::Transcript(transcript)).is_err() {
                    // Session is gone; nobody is listening.
                    break;
                }
            }
            Err(e) => {
                warn!(provider = provider.name(), "transcription stream error: {}", e);
                reason = format!("transcription stream failed: {e}");
                break;
            }
        }
    }

    mark_unavailable(&inner, &events, reason);
}

fn mark_unavailable(
    inner: &Mutex<LinkInner>,
    events: &mpsc::UnboundedSender<SttEvent>,
    reason: String,
) {
    let mut guard = lock(inner);
    if guard.state == LinkState::Closed {
        return;
    }
    guard.state = LinkState::Unavailable;
    guard.backlog.clear();
    guard.backlog_bytes = 0;
    guard.commands = None;
    drop(guard);

    let _ = events.send(SttEvent::Unavailable(reason));
}
