#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use relay_server::events::StartPayload;
use relay_server::session::SessionSettings;
use relay_server::{app, seed_agents, AppState, Providers};
use relay_types::Agent;
use relay_voice::{
    GenerationRequest, ProviderCommand, ProviderStream, ResponseGenerator, SpeechSynthesizer,
    SttOptions, Transcript, TranscriptionProvider, VoiceError,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transcription provider that records every command and lets the test
/// inject transcripts.
#[derive(Default)]
pub struct StubTranscriber {
    pub fail_handshake: bool,
    pub handshake_delay: Duration,
    connects: AtomicUsize,
    commands: Arc<Mutex<Vec<ProviderCommand>>>,
    transcripts: Arc<Mutex<Option<mpsc::UnboundedSender<Result<Transcript, VoiceError>>>>>,
}

impl StubTranscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_handshake: true,
            ..Self::default()
        })
    }

    pub fn delayed(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            handshake_delay: delay,
            ..Self::default()
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn audio_frames(&self) -> Vec<Vec<u8>> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                ProviderCommand::Audio(frame) => Some(frame.clone()),
                ProviderCommand::Close => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, ProviderCommand::Close))
            .count()
    }

    pub fn is_streaming(&self) -> bool {
        self.transcripts.lock().unwrap().is_some()
    }

    /// Waits until a session has completed the handshake.
    pub async fn wait_streaming(&self) {
        wait_until(|| self.is_streaming()).await;
    }

    pub fn push(&self, transcript: Transcript) {
        let guard = self.transcripts.lock().unwrap();
        let tx = guard.as_ref().expect("stub transcriber is not connected");
        tx.send(Ok(transcript)).expect("link is listening");
    }
}

#[async_trait]
impl TranscriptionProvider for StubTranscriber {
    async fn connect(&self, _options: &SttOptions) -> Result<ProviderStream, VoiceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.handshake_delay.is_zero() {
            tokio::time::sleep(self.handshake_delay).await;
        }
        if self.fail_handshake {
            return Err(VoiceError::Stt("stub handshake refused".into()));
        }

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (tr_tx, tr_rx) = mpsc::unbounded_channel();
        *self.transcripts.lock().unwrap() = Some(tr_tx);

        let commands = self.commands.clone();
        let transcripts = self.transcripts.clone();
        tokio::spawn(async move {
            while let Some(command) = cmd_rx.recv().await {
                let closing = command == ProviderCommand::Close;
                commands.lock().unwrap().push(command);
                if closing {
                    transcripts.lock().unwrap().take();
                }
            }
        });

        Ok(ProviderStream {
            commands: cmd_tx,
            transcripts: tr_rx,
        })
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

/// Synthesizer returning `audio:<text>` as the audio bytes.
#[derive(Default)]
pub struct StubSynthesizer {
    pub fail: AtomicBool,
    calls: AtomicUsize,
}

impl StubSynthesizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for StubSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        _language: &str,
        _voice: &str,
    ) -> Result<Vec<u8>, VoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::Tts("stub synthesis failed".into()));
        }
        Ok(format!("audio:{text}").into_bytes())
    }
}

/// Generator replying `reply to <utterance>`, optionally failing or
/// holding each call until released.
#[derive(Default)]
pub struct StubGenerator {
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    pub hang: bool,
}

impl StubGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_first(n: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(n),
            ..Self::default()
        })
    }

    /// Every call waits for a permit from [`StubGenerator::release`].
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        })
    }

    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            hang: true,
            ..Self::default()
        })
    }

    pub fn release(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponseGenerator for StubGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<String, VoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| VoiceError::Llm("gate closed".into()))?
                .forget();
        }
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(VoiceError::Llm("stub generation failed".into()));
        }
        Ok(format!("reply to {}", request.utterance))
    }
}

pub struct Stubs {
    pub transcriber: Arc<StubTranscriber>,
    pub synthesizer: Arc<StubSynthesizer>,
    pub generator: Arc<StubGenerator>,
}

impl Stubs {
    pub fn new() -> Self {
        Self::with(StubTranscriber::new(), StubGenerator::new())
    }

    pub fn with(transcriber: Arc<StubTranscriber>, generator: Arc<StubGenerator>) -> Self {
        Self {
            transcriber,
            synthesizer: StubSynthesizer::new(),
            generator,
        }
    }

    pub fn providers(&self) -> Providers {
        Providers {
            transcriber: self.transcriber.clone(),
            synthesizer: self.synthesizer.clone(),
            generator: self.generator.clone(),
        }
    }
}

pub fn agent(agent_id: &str, greeting: &str) -> Agent {
    Agent {
        agent_id: agent_id.to_string(),
        client_id: Some("acme".to_string()),
        name: "Ava".to_string(),
        system_prompt: "You answer questions for Acme Dental.".to_string(),
        greeting: greeting.to_string(),
        voice: "aura-asteria-en".to_string(),
        language: "en-US".to_string(),
    }
}

/// Builds state over a fresh on-disk database seeded with `agents`.
pub fn test_state(providers: Providers, settings: SessionSettings, agents: &[Agent]) -> (AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    let pool = relay_db::create_pool(path.to_str().unwrap(), relay_db::DbRuntimeSettings::default())
        .unwrap();
    {
        let conn = pool.get().unwrap();
        relay_db::run_migrations(&conn).unwrap();
        seed_agents(&conn, agents).unwrap();
    }
    (AppState::new(pool, providers, settings), dir)
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    _dir: TempDir,
}

pub async fn spawn_server(stubs: &Stubs, settings: SessionSettings, agents: &[Agent]) -> TestServer {
    let (state, dir) = test_state(stubs.providers(), settings, agents);
    let router = app(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        state,
        _dir: dir,
    }
}

pub struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    /// Connects and consumes the `connected` event.
    pub async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let mut client = Self { ws };
        let connected = client.expect("connected").await;
        assert!(connected["connectionId"].as_str().is_some_and(|id| !id.is_empty()));
        client
    }

    pub async fn send(&mut self, value: Value) {
        self.ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string().into())).await.unwrap();
    }

    pub async fn start(&mut self, agent_id: &str, client_id: &str, stream_sid: &str) {
        self.send(json!({
            "event": "start",
            "streamSid": stream_sid,
            "start": { "extraData": StartPayload::encode(agent_id, client_id) }
        }))
        .await;
    }

    pub async fn media(&mut self, audio: &[u8]) {
        self.send(json!({
            "event": "media",
            "media": { "payload": base64::engine::general_purpose::STANDARD.encode(audio) }
        }))
        .await;
    }

    pub async fn stop(&mut self) {
        self.send(json!({ "event": "stop", "stop": {} })).await;
    }

    /// Next JSON event, or `None` once the server has closed the socket.
    pub async fn next_event(&mut self) -> Option<Value> {
        loop {
            let msg = tokio::time::timeout(EVENT_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for an event");
            match msg {
                Some(Ok(Message::Text(text))) => {
                    return Some(serde_json::from_str(text.as_str()).unwrap())
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Next event, which must be `name`.
    pub async fn expect(&mut self, name: &str) -> Value {
        let event = self
            .next_event()
            .await
            .unwrap_or_else(|| panic!("socket closed while waiting for {name}"));
        assert_eq!(event["event"], name, "unexpected event: {event}");
        event
    }

    /// Skips events until one named `name` arrives.
    pub async fn find(&mut self, name: &str) -> Value {
        loop {
            let event = self
                .next_event()
                .await
                .unwrap_or_else(|| panic!("socket closed while waiting for {name}"));
            if event["event"] == name {
                return event;
            }
        }
    }

    /// Collects events until the server closes the socket.
    pub async fn drain(&mut self) -> Vec<Value> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

pub fn decode_media(event: &Value) -> String {
    let payload = event["media"]["payload"].as_str().expect("media payload");
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload).unwrap();
    String::from_utf8(bytes).unwrap()
}

/// Polls `condition` for up to five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
