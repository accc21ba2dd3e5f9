//! Session manager: the state machine behind one voice connection.
//!
//! A [`Session`] is owned by its connection's socket task and driven by two
//! inputs: inbound client events and events from its transcription link.
//! Reply generation and speech synthesis run on spawned tasks so audio keeps
//! flowing while a reply is being prepared; at most one such cycle runs per
//! session at a time.

use crate::config::Config;
use crate::events::{InboundEvent, OutboundEvent, Outbox, StartPayload};
use crate::registry::SessionEntry;
use crate::AppState;
use base64::Engine;
use relay_db::DbPool;
use relay_store::{
    append_message, create_conversation, end_conversation, get_agent, recent_messages,
    update_registration, CreateConversationParams, StoreError,
};
use relay_types::{Agent, AudioFormat, MessageRole, Registration};
use relay_voice::extract::extract_registration;
use relay_voice::{
    AudioFrameBuffer, GenerationRequest, SttEvent, SttLink, SttOptions, VoiceError,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle of a session.
///
/// `Created -> Starting -> Active -> Stopping -> Closed`. A failed start goes
/// from `Starting` straight to `Closed`; a connection that never starts goes
/// from `Created` to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    Starting,
    Active,
    Stopping,
    Closed,
}

impl SessionPhase {
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Created, Closed)
                | (Starting, Active)
                | (Starting, Closed)
                | (Active, Stopping)
                | (Stopping, Closed)
        )
    }
}

/// Errors raised while driving a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid start payload: {0}")]
    InvalidStartPayload(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error(transparent)]
    Provider(#[from] VoiceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database unavailable: {0}")]
    Database(String),

    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SessionPhase,
        to: SessionPhase,
    },
}

/// Session tunables resolved from configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub audio_format: AudioFormat,
    pub frame_duration: Duration,
    pub max_backlog_bytes: usize,
    pub history_limit: usize,
    pub response_timeout: Duration,
    /// `None` disables idle eviction.
    pub idle_timeout: Option<Duration>,
    pub fallback_reply: String,
    pub client_diagnostics: bool,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            audio_format: config.audio.format(),
            frame_duration: config.audio.frame_duration(),
            max_backlog_bytes: config.audio.max_backlog_bytes,
            history_limit: config.session.history_limit,
            response_timeout: Duration::from_secs(config.session.response_timeout_secs),
            idle_timeout: match config.session.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            fallback_reply: config.session.fallback_reply.clone(),
            client_diagnostics: config.session.client_diagnostics,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What the socket loop should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// State that exists only once a session has started.
struct LiveSession {
    session_id: String,
    stream_sid: String,
    agent: Arc<Agent>,
    link: SttLink,
    registration: Registration,
    last_finalized: Option<String>,
}

/// One connection's session.
pub struct Session {
    state: Arc<AppState>,
    connection_id: String,
    outbox: Outbox,
    phase: SessionPhase,
    buffer: AudioFrameBuffer,
    stt_events: mpsc::UnboundedSender<SttEvent>,
    live: Option<LiveSession>,
    response_in_flight: Arc<AtomicBool>,
    last_activity: Instant,
}

impl Session {
    /// Creates a session in the `Created` phase.
    ///
    /// Transcription events for this session are delivered on the receiver
    /// paired with `stt_events`; the caller feeds them back through
    /// [`Session::handle_stt_event`].
    pub fn new(
        state: Arc<AppState>,
        connection_id: impl Into<String>,
        outbox: Outbox,
        stt_events: mpsc::UnboundedSender<SttEvent>,
    ) -> Self {
        let buffer = AudioFrameBuffer::for_duration(
            &state.settings.audio_format,
            state.settings.frame_duration,
        );
        Self {
            state,
            connection_id: connection_id.into(),
            outbox,
            phase: SessionPhase::Created,
            buffer,
            stt_events,
            live: None,
            response_in_flight: Arc::new(AtomicBool::new(false)),
            last_activity: Instant::now(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.live.as_ref().map(|live| live.session_id.as_str())
    }

    /// True while a reply cycle is running.
    pub fn is_responding(&self) -> bool {
        self.response_in_flight.load(Ordering::Acquire)
    }

    /// Records inbound activity.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// When the session becomes idle, if idle eviction is on.
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.state
            .settings
            .idle_timeout
            .map(|timeout| self.last_activity + timeout)
    }

    fn transition(&mut self, next: SessionPhase) -> Result<(), SessionError> {
        if !self.phase.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!(
            connection_id = %self.connection_id,
            from = ?self.phase,
            to = ?next,
            "session transition"
        );
        self.phase = next;
        Ok(())
    }

    /// Dispatches one inbound client event.
    pub async fn handle_event(&mut self, event: InboundEvent) -> Flow {
        match event {
            InboundEvent::Start { start, stream_sid } => {
                self.handle_start(start.extra_data, stream_sid.or(start.stream_sid))
                    .await
            }
            InboundEvent::Media { media } => {
                self.handle_media(&media.payload);
                Flow::Continue
            }
            InboundEvent::Stop { .. } => {
                self.handle_stop(true).await;
                Flow::Close
            }
            InboundEvent::Unknown => {
                tracing::debug!(connection_id = %self.connection_id, "ignoring unknown event");
                Flow::Continue
            }
        }
    }

    /// Starts the session. On failure the client gets an error event, the
    /// session is closed, and nothing is registered.
    pub async fn handle_start(
        &mut self,
        extra_data: Option<String>,
        stream_sid: Option<String>,
    ) -> Flow {
        if self.phase != SessionPhase::Created {
            tracing::warn!(
                connection_id = %self.connection_id,
                phase = ?self.phase,
                "start received on a session that already started; ignoring"
            );
            return Flow::Continue;
        }
        if let Err(e) = self.transition(SessionPhase::Starting) {
            tracing::error!(connection_id = %self.connection_id, "{}", e);
            return Flow::Close;
        }

        match self.start_session(extra_data, stream_sid).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    "session start failed: {}",
                    e
                );
                self.outbox.error(e.to_string());
                self.phase = SessionPhase::Closed;
                Flow::Close
            }
        }
    }

    async fn start_session(
        &mut self,
        extra_data: Option<String>,
        stream_sid: Option<String>,
    ) -> Result<(), SessionError> {
        let extra_data = extra_data
            .ok_or_else(|| SessionError::InvalidStartPayload("missing extraData".to_string()))?;
        let payload = StartPayload::decode(&extra_data).map_err(SessionError::InvalidStartPayload)?;

        let providers = &self.state.providers;
        providers.transcriber.check_credentials()?;
        providers.synthesizer.check_credentials()?;
        providers.generator.check_credentials()?;

        let agent_id = payload.agent_id.clone();
        let agent = with_conn(&self.state.pool, move |conn| get_agent(conn, &agent_id))
            .await
            .map_err(|e| match e {
                SessionError::Store(StoreError::AgentNotFound(id)) => SessionError::AgentNotFound(id),
                other => other,
            })?;

        if !agent.belongs_to(&payload.client_id) {
            tracing::warn!(
                agent_id = %agent.agent_id,
                client_id = %payload.client_id,
                "agent requested by a different tenant"
            );
            return Err(SessionError::AgentNotFound(payload.agent_id));
        }

        let session_id = Uuid::new_v4().to_string();
        let stream_sid = stream_sid
            .filter(|sid| !sid.trim().is_empty())
            .unwrap_or_else(|| session_id.clone());

        let params = CreateConversationParams {
            session_id: session_id.clone(),
            agent_id: agent.agent_id.clone(),
            client_id: payload.client_id.clone(),
            stream_sid: stream_sid.clone(),
        };
        with_conn(&self.state.pool, move |conn| create_conversation(conn, &params)).await?;

        let link = SttLink::open(
            providers.transcriber.clone(),
            SttOptions {
                language: agent.language.clone(),
                format: self.state.settings.audio_format,
            },
            self.state.settings.max_backlog_bytes,
            self.stt_events.clone(),
        );

        self.state.registry.insert(
            &self.connection_id,
            SessionEntry {
                session_id: session_id.clone(),
                agent_id: agent.agent_id.clone(),
                client_id: payload.client_id.clone(),
                stream_sid: stream_sid.clone(),
                started_at: chrono::Utc::now(),
            },
        );
        self.transition(SessionPhase::Active)?;

        tracing::info!(
            connection_id = %self.connection_id,
            session_id = %session_id,
            agent_id = %agent.agent_id,
            client_id = %payload.client_id,
            "session started"
        );

        self.outbox.emit(&OutboundEvent::Start {
            stream_sid: stream_sid.clone(),
            session_id: session_id.clone(),
            timestamp: crate::events::timestamp(),
        });

        let agent = Arc::new(agent);
        let greeting = agent.greeting.trim().to_string();
        self.live = Some(LiveSession {
            session_id,
            stream_sid,
            agent,
            link,
            registration: Registration::default(),
            last_finalized: None,
        });

        if !greeting.is_empty() {
            if let Some(turn) = self.turn() {
                tokio::spawn(async move { turn.speak(&greeting).await });
            }
        }

        Ok(())
    }

    /// Buffers one inbound audio chunk, forwarding a frame once enough
    /// audio has accumulated. Never waits on the provider.
    pub fn handle_media(&mut self, payload: &str) {
        if self.phase != SessionPhase::Active {
            tracing::debug!(
                connection_id = %self.connection_id,
                phase = ?self.phase,
                "media outside an active session; ignoring"
            );
            return;
        }
        let Some(live) = self.live.as_ref() else {
            return;
        };

        let chunk = match base64::engine::general_purpose::STANDARD.decode(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(session_id = %live.session_id, "undecodable media payload: {}", e);
                return;
            }
        };

        if let Some(frame) = self.buffer.push(&chunk) {
            live.link.send(frame);
        }
    }

    /// Stops the session. Safe to call repeatedly; only the first call on a
    /// live session does anything. Returns whether this call stopped it.
    pub async fn handle_stop(&mut self, acknowledge: bool) -> bool {
        match self.phase {
            SessionPhase::Stopping | SessionPhase::Closed => {
                tracing::debug!(connection_id = %self.connection_id, "session already stopped");
                return false;
            }
            SessionPhase::Created | SessionPhase::Starting => {
                self.phase = SessionPhase::Closed;
                if acknowledge {
                    self.outbox.emit(&OutboundEvent::stop());
                }
                return true;
            }
            SessionPhase::Active => {}
        }

        if let Err(e) = self.transition(SessionPhase::Stopping) {
            tracing::error!(connection_id = %self.connection_id, "{}", e);
        }

        if let Some(live) = self.live.as_ref() {
            live.link.close();
            let discarded = self.buffer.discard();
            self.state.registry.remove(&self.connection_id);

            let session_id = live.session_id.clone();
            if let Err(e) =
                with_conn(&self.state.pool, move |conn| end_conversation(conn, &session_id)).await
            {
                tracing::error!(session_id = %live.session_id, "failed to end conversation: {}", e);
            }

            tracing::info!(
                connection_id = %self.connection_id,
                session_id = %live.session_id,
                discarded_bytes = discarded,
                "session stopped"
            );
        }

        if acknowledge {
            self.outbox.emit(&OutboundEvent::stop());
        }
        if let Err(e) = self.transition(SessionPhase::Closed) {
            tracing::error!(connection_id = %self.connection_id, "{}", e);
        }
        true
    }

    /// Handles a transcript or availability change from the STT link.
    pub async fn handle_stt_event(&mut self, event: SttEvent) {
        if self.phase != SessionPhase::Active {
            return;
        }
        let Some(live) = self.live.as_mut() else {
            return;
        };

        match event {
            SttEvent::Transcript(transcript) => {
                self.outbox.emit(&OutboundEvent::Transcript {
                    text: transcript.text.clone(),
                    is_final: transcript.is_final,
                    timestamp: crate::events::timestamp(),
                });
                if !transcript.is_final {
                    return;
                }

                let text = transcript.text.trim();
                if text.is_empty() || live.last_finalized.as_deref() == Some(text) {
                    tracing::debug!(session_id = %live.session_id, "skipping empty or repeated final transcript");
                    return;
                }
                let text = text.to_string();
                live.last_finalized = Some(text.clone());
                self.handle_utterance(text).await;
            }
            SttEvent::Unavailable(reason) => {
                tracing::warn!(
                    session_id = %live.session_id,
                    reason = %reason,
                    "transcription unavailable for the rest of the session"
                );
                self.outbox.error("transcription unavailable");
                self.outbox.diagnostic(
                    "warn",
                    reason,
                    json!({ "provider": self.state.providers.transcriber.name() }),
                );
            }
        }
    }

    /// Records a finalized utterance and starts a reply if none is running.
    async fn handle_utterance(&mut self, text: String) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        let session_id = live.session_id.clone();

        let sid = session_id.clone();
        let content = text.clone();
        if let Err(e) = with_conn(&self.state.pool, move |conn| {
            append_message(conn, &sid, MessageRole::User, &content)
        })
        .await
        {
            tracing::error!(session_id = %session_id, "failed to persist user message: {}", e);
        }

        self.outbox.emit(&OutboundEvent::user_message(&text));

        if !live.registration.is_complete() && live.registration.absorb(extract_registration(&text)) {
            tracing::info!(
                session_id = %session_id,
                has_name = live.registration.caller_name.is_some(),
                has_phone = live.registration.caller_phone.is_some(),
                "caller details captured"
            );
            let sid = session_id.clone();
            let registration = live.registration.clone();
            if let Err(e) = with_conn(&self.state.pool, move |conn| {
                update_registration(conn, &sid, &registration)
            })
            .await
            {
                tracing::error!(session_id = %session_id, "failed to persist caller details: {}", e);
            }
        }

        let Some(guard) = InFlightGuard::acquire(&self.response_in_flight) else {
            tracing::info!(
                session_id = %session_id,
                "reply already in flight; utterance recorded without a new reply"
            );
            return;
        };
        if let Some(turn) = self.turn() {
            tokio::spawn(turn.respond(text, guard));
        }
    }

    fn turn(&self) -> Option<Turn> {
        let live = self.live.as_ref()?;
        Some(Turn {
            state: self.state.clone(),
            outbox: self.outbox.clone(),
            connection_id: self.connection_id.clone(),
            session_id: live.session_id.clone(),
            stream_sid: live.stream_sid.clone(),
            agent: live.agent.clone(),
            registration: live.registration.clone(),
        })
    }
}

/// Holds the session's `response_in_flight` flag for one reply cycle and
/// clears it when dropped, however the cycle ends.
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Everything a reply cycle needs, detached from the owning [`Session`].
#[derive(Clone)]
struct Turn {
    state: Arc<AppState>,
    outbox: Outbox,
    connection_id: String,
    session_id: String,
    stream_sid: String,
    agent: Arc<Agent>,
    registration: Registration,
}

impl Turn {
    /// Whether the session this turn belongs to is still live.
    fn is_live(&self) -> bool {
        self.state
            .registry
            .is_current(&self.connection_id, &self.session_id)
    }

    /// Generates a reply to `utterance` and speaks it. Generation failure
    /// speaks the fallback reply instead.
    async fn respond(self, utterance: String, _guard: InFlightGuard) {
        let settings = &self.state.settings;

        let sid = self.session_id.clone();
        let limit = settings.history_limit + 1;
        let history = match with_conn(&self.state.pool, move |conn| {
            recent_messages(conn, &sid, limit)
        })
        .await
        {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, "history unavailable: {}", e);
                Vec::new()
            }
        };

        let request = GenerationRequest {
            persona: &self.agent,
            history: &history,
            utterance: &utterance,
            registration: &self.registration,
        };
        let timeout = settings.response_timeout;
        let outcome =
            match tokio::time::timeout(timeout, self.state.providers.generator.generate(request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(VoiceError::Timeout("response generation", timeout)),
            };

        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, "reply generation failed: {}", e);
                self.outbox.diagnostic(
                    "warn",
                    format!("reply generation failed: {e}"),
                    json!({ "sessionId": self.session_id }),
                );
                settings.fallback_reply.clone()
            }
        };

        self.speak(&reply).await;
    }

    /// Persists `text` as an assistant message, shows it, and plays it.
    async fn speak(&self, text: &str) {
        if !self.is_live() {
            tracing::debug!(session_id = %self.session_id, "session ended; reply dropped");
            return;
        }

        let sid = self.session_id.clone();
        let content = text.to_string();
        if let Err(e) = with_conn(&self.state.pool, move |conn| {
            append_message(conn, &sid, MessageRole::Assistant, &content)
        })
        .await
        {
            tracing::error!(session_id = %self.session_id, "failed to persist reply: {}", e);
        }

        // The session may have stopped while the message was being written.
        if !self.is_live() {
            tracing::debug!(session_id = %self.session_id, "session ended; reply dropped");
            return;
        }

        self.outbox.emit(&OutboundEvent::ai_response(text));

        let timeout = self.state.settings.response_timeout;
        let synthesis = tokio::time::timeout(
            timeout,
            self.state
                .providers
                .synthesizer
                .synthesize(text, &self.agent.language, &self.agent.voice),
        )
        .await
        .unwrap_or(Err(VoiceError::Timeout("speech synthesis", timeout)));

        match synthesis {
            Ok(audio) => {
                if !self.is_live() {
                    tracing::debug!(session_id = %self.session_id, "session ended; audio dropped");
                    return;
                }
                self.outbox
                    .emit(&OutboundEvent::media(self.stream_sid.as_str(), &audio));
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, "speech synthesis failed: {}", e);
                self.outbox.diagnostic(
                    "warn",
                    format!("speech synthesis failed: {e}"),
                    json!({ "sessionId": self.session_id }),
                );
            }
        }
    }
}

/// Runs a store call on the blocking pool.
async fn with_conn<T, F>(pool: &DbPool, f: F) -> Result<T, SessionError>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| SessionError::Database(format!("pool error: {e}")))?;
        f(&conn).map_err(SessionError::from)
    })
    .await
    .map_err(|e| SessionError::Database(format!("task join error: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Providers;
    use relay_voice::{
        ProviderStream, ResponseGenerator, SpeechSynthesizer, TranscriptionProvider,
    };

    struct Idle;

    #[async_trait::async_trait]
    impl TranscriptionProvider for Idle {
        async fn connect(&self, _options: &SttOptions) -> Result<ProviderStream, VoiceError> {
            Err(VoiceError::Stt("not connected in unit tests".into()))
        }

        fn name(&self) -> &'static str {
            "idle"
        }
    }

    #[async_trait::async_trait]
    impl SpeechSynthesizer for Idle {
        async fn synthesize(&self, _: &str, _: &str, _: &str) -> Result<Vec<u8>, VoiceError> {
            Ok(Vec::new())
        }
    }

    #[async_trait::async_trait]
    impl ResponseGenerator for Idle {
        async fn generate(&self, _: GenerationRequest<'_>) -> Result<String, VoiceError> {
            Ok(String::new())
        }
    }

    fn stub_providers() -> Providers {
        let idle = Arc::new(Idle);
        Providers {
            transcriber: idle.clone(),
            synthesizer: idle.clone(),
            generator: idle,
        }
    }

    #[test]
    fn lifecycle_transitions() {
        use SessionPhase::*;
        assert!(Created.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Active));
        assert!(Starting.can_transition_to(Closed));
        assert!(Active.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Closed));
        assert!(Created.can_transition_to(Closed));

        assert!(!Created.can_transition_to(Active));
        assert!(!Active.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Active));
    }

    #[test]
    fn in_flight_guard_is_exclusive_and_resets_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        let first = InFlightGuard::acquire(&flag).expect("first acquire");
        assert!(InFlightGuard::acquire(&flag).is_none());
        drop(first);
        assert!(!flag.load(Ordering::Acquire));
        assert!(InFlightGuard::acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn in_flight_guard_resets_when_the_task_panics() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = InFlightGuard::acquire(&flag).unwrap();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            panic!("provider blew up");
        });
        assert!(handle.await.is_err());
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn settings_follow_config() {
        let mut config = Config::default();
        config.session.idle_timeout_secs = 0;
        config.audio.frame_ms = 20;
        let settings = SessionSettings::from_config(&config);
        assert!(settings.idle_timeout.is_none());
        assert_eq!(settings.frame_duration, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn media_buffer_is_sized_from_audio_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let pool = relay_db::create_pool(path.to_str().unwrap(), Default::default()).unwrap();
        let settings = SessionSettings {
            frame_duration: Duration::from_millis(20),
            ..SessionSettings::default()
        };
        let state = Arc::new(AppState::new(pool, stub_providers(), settings));

        let (tx, _rx) = mpsc::channel(4);
        let (stt_tx, _stt_rx) = mpsc::unbounded_channel();
        let session = Session::new(state, "conn-1", Outbox::new(tx, false), stt_tx);
        assert_eq!(session.buffer.threshold(), 160);
    }
}
