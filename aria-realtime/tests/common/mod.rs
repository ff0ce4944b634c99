//! In-memory transport, capture and observer fakes shared by integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use aria_realtime::transport::{
    AudioCapture, ControlChannel, LocalAudio, PeerConnector, PeerOptions, PeerTransport,
    PlaybackSignal, SAMPLE_RATE, TransportEvent,
};
use aria_realtime::{
    AgentObserver, AgentState, Result, ToolExecutor, TranscriptEvent, VoiceAgent,
    VoiceAgentConfig, VoiceError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const CREDENTIAL: &str = "ek_test_credential";

pub const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";

pub const ANSWER_SDP: &str = "v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";

/// Everything observable, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Sent(Value),
    State(AgentState, AgentState),
    Transcript(TranscriptEvent),
    Error(String),
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Default)]
pub struct Log(Arc<Mutex<Vec<Entry>>>);

impl Log {
    pub fn push(&self, entry: Entry) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.0.lock().clone()
    }

    /// Frames written to the control channel.
    pub fn sent(&self) -> Vec<Value> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                Entry::Sent(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn sent_types(&self) -> Vec<String> {
        self.sent().iter().map(|v| v["type"].as_str().unwrap_or_default().to_string()).collect()
    }

    pub fn position(&self, predicate: impl Fn(&Entry) -> bool) -> Option<usize> {
        self.entries().iter().position(predicate)
    }

    pub fn count(&self, predicate: impl Fn(&Entry) -> bool) -> usize {
        self.entries().iter().filter(|e| predicate(e)).count()
    }
}

pub struct RecordingObserver {
    log: Log,
}

impl RecordingObserver {
    pub fn new(log: Log) -> Self {
        Self { log }
    }
}

#[async_trait]
impl AgentObserver for RecordingObserver {
    async fn on_state_change(&self, previous: AgentState, current: AgentState) {
        self.log.push(Entry::State(previous, current));
    }

    async fn on_transcript(&self, transcript: &TranscriptEvent) {
        self.log.push(Entry::Transcript(transcript.clone()));
    }

    async fn on_error(&self, error: &VoiceError) {
        self.log.push(Entry::Error(error.to_string()));
    }

    async fn on_connected(&self) {
        self.log.push(Entry::Connected);
    }

    async fn on_disconnected(&self) {
        self.log.push(Entry::Disconnected);
    }
}

/// Capture that either hands out a silent stream or refuses.
#[derive(Default)]
pub struct FakeCapture {
    deny: bool,
    pub acquired: AtomicUsize,
}

impl FakeCapture {
    pub fn denied() -> Self {
        Self { deny: true, acquired: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl AudioCapture for FakeCapture {
    async fn acquire(&self) -> Result<LocalAudio> {
        if self.deny {
            return Err(VoiceError::acquisition("microphone permission denied"));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let (_tx, rx) = mpsc::channel(1);
        Ok(LocalAudio::new(rx, SAMPLE_RATE))
    }
}

pub struct FakeControl {
    open: AtomicBool,
    closed: AtomicBool,
    log: Log,
}

impl FakeControl {
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

#[async_trait]
impl ControlChannel for FakeControl {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::transport("closed"));
        }
        let value: Value = serde_json::from_str(&frame)?;
        self.log.push(Entry::Sent(value));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Test-side handle to one transport the connector created.
#[derive(Clone)]
pub struct TransportHandle {
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub playback: mpsc::UnboundedSender<PlaybackSignal>,
    pub control: Arc<FakeControl>,
    pub closed: Arc<AtomicBool>,
    pub answer: Arc<Mutex<Option<String>>>,
}

impl TransportHandle {
    pub fn frame(&self, value: Value) {
        self.events.send(TransportEvent::Message(value.to_string())).unwrap();
    }

    pub fn raw(&self, text: &str) {
        self.events.send(TransportEvent::Message(text.to_string())).unwrap();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeTransport {
    control: Arc<FakeControl>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    playback: Option<mpsc::UnboundedReceiver<PlaybackSignal>>,
    closed: Arc<AtomicBool>,
    answer: Arc<Mutex<Option<String>>>,
    _audio: LocalAudio,
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn local_offer(&mut self) -> Result<String> {
        Ok(OFFER_SDP.to_string())
    }

    async fn apply_answer(&mut self, sdp: &str) -> Result<()> {
        *self.answer.lock() = Some(sdp.to_string());
        self.control.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn control(&self) -> Arc<dyn ControlChannel> {
        self.control.clone()
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }

    fn take_playback(&mut self) -> Option<mpsc::UnboundedReceiver<PlaybackSignal>> {
        self.playback.take()
    }

    async fn close(&mut self) {
        self.control.close().await;
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeConnector {
    log: Log,
    handles: Mutex<Vec<TransportHandle>>,
    pub last_options: Mutex<Option<PeerOptions>>,
}

impl FakeConnector {
    pub fn new(log: Log) -> Self {
        Self { log, ..Default::default() }
    }

    pub fn opened(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn handle(&self) -> TransportHandle {
        self.handles.lock().last().cloned().expect("no transport opened")
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn open(&self, options: &PeerOptions, audio: LocalAudio) -> Result<Box<dyn PeerTransport>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let control = Arc::new(FakeControl {
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            log: self.log.clone(),
        });
        let closed = Arc::new(AtomicBool::new(false));
        let answer = Arc::new(Mutex::new(None));

        *self.last_options.lock() = Some(options.clone());
        self.handles.lock().push(TransportHandle {
            events: events_tx,
            playback: playback_tx,
            control: control.clone(),
            closed: closed.clone(),
            answer: answer.clone(),
        });

        Ok(Box::new(FakeTransport {
            control,
            events: Some(events_rx),
            playback: Some(playback_rx),
            closed,
            answer,
            _audio: audio,
        }))
    }
}

/// Negotiation endpoint that answers every offer.
pub async fn negotiation_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/realtime"))
        .respond_with(ResponseTemplate::new(201).set_body_raw(ANSWER_SDP, "application/sdp"))
        .mount(&server)
        .await;
    server
}

pub fn config_for(server: &MockServer) -> VoiceAgentConfig {
    VoiceAgentConfig::new()
        .with_negotiation_url(format!("{}/v1/realtime", server.uri()))
        .with_tool_timeout(Duration::from_secs(2))
}

pub struct Harness {
    pub agent: Arc<VoiceAgent>,
    pub connector: Arc<FakeConnector>,
    pub capture: Arc<FakeCapture>,
    pub log: Log,
    pub server: MockServer,
}

impl Harness {
    pub async fn new(executor: Option<Arc<dyn ToolExecutor>>) -> Self {
        Self::with_server(negotiation_server().await, FakeCapture::default(), executor)
    }

    pub fn with_server(
        server: MockServer,
        capture: FakeCapture,
        executor: Option<Arc<dyn ToolExecutor>>,
    ) -> Self {
        let log = Log::default();
        let connector = Arc::new(FakeConnector::new(log.clone()));
        let capture = Arc::new(capture);
        let mut builder = VoiceAgent::builder()
            .config(config_for(&server))
            .capture(capture.clone())
            .connector(connector.clone())
            .observer(Arc::new(RecordingObserver::new(log.clone())));
        if let Some(executor) = executor {
            builder = builder.tool_executor(executor);
        }
        let agent = Arc::new(builder.build().unwrap());
        Self { agent, connector, capture, log, server }
    }

    /// A harness whose agent is already `Listening`.
    pub async fn connected(executor: Option<Arc<dyn ToolExecutor>>) -> Self {
        let harness = Self::new(executor).await;
        harness.agent.connect(CREDENTIAL).await.unwrap();
        assert_eq!(harness.agent.state(), AgentState::Listening);
        harness
    }

    pub fn transport(&self) -> TransportHandle {
        self.connector.handle()
    }

    pub async fn wait_for_state(&self, state: AgentState) {
        let mut rx = self.agent.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {state}, at {}", self.agent.state()))
            .unwrap();
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
