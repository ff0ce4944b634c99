//! The voice agent and its session event loop.
//!
//! A [`VoiceAgent`] owns at most one session. While a session is up, one
//! spawned task runs the event loop and is the only writer of conversation
//! state; `connect` and `disconnect` only touch state under the session slot
//! lock and a generation check.
//!
//! ```rust,ignore
//! let agent = VoiceAgent::builder()
//!     .capture(capture)
//!     .connector(connector)
//!     .tool_executor(tools)
//!     .build()?;
//!
//! agent.connect(ephemeral_key).await?;
//! agent.send_text("What's the weather in Fortaleza?").await?;
//! agent.disconnect().await;
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use secrecy::SecretString;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::bridge::{FunctionCallBridge, ReadyCall, ToolExecutor, resolve_call};
use crate::config::VoiceAgentConfig;
use crate::error::{Result, VoiceError};
use crate::events::{self, InboundEvent, OutboundMessage};
use crate::observer::{AgentObserver, NoOpObserver};
use crate::state::{AgentState, Conversation, Signal, Step, TranscriptEvent, transition};
use crate::transport::{
    self, AudioCapture, ControlChannel, PeerConnector, PeerTransport, PlaybackSignal,
    SdpSignaling, TransportEvent,
};

/// Builder for [`VoiceAgent`].
#[derive(Default)]
pub struct VoiceAgentBuilder {
    config: VoiceAgentConfig,
    capture: Option<Arc<dyn AudioCapture>>,
    connector: Option<Arc<dyn PeerConnector>>,
    tool_executor: Option<Arc<dyn ToolExecutor>>,
    observer: Option<Arc<dyn AgentObserver>>,
}

impl VoiceAgentBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    pub fn config(mut self, config: VoiceAgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the microphone source.
    pub fn capture(mut self, capture: Arc<dyn AudioCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Set the peer transport factory.
    pub fn connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Register the capability that executes server-issued function calls.
    pub fn tool_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tool_executor = Some(executor);
        self
    }

    /// Set the observer.
    pub fn observer(mut self, observer: Arc<dyn AgentObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the agent (does not connect yet).
    pub fn build(self) -> Result<VoiceAgent> {
        self.config.validate()?;
        let capture =
            self.capture.ok_or_else(|| VoiceError::config("An audio capture is required"))?;
        let connector =
            self.connector.ok_or_else(|| VoiceError::config("A peer connector is required"))?;
        let signaling = SdpSignaling::from_config(&self.config)?;
        let (state_tx, _) = watch::channel(AgentState::Idle);

        Ok(VoiceAgent {
            inner: Arc::new(AgentInner {
                config: self.config,
                signaling,
                capture,
                connector,
                tool_executor: self.tool_executor,
                observer: self.observer.unwrap_or_else(|| Arc::new(NoOpObserver)),
                conversation: Mutex::new(Conversation::default()),
                state_tx,
                slot: Mutex::new(Slot::Empty),
                generation: AtomicU64::new(0),
            }),
        })
    }
}

/// Realtime voice agent.
pub struct VoiceAgent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: VoiceAgentConfig,
    signaling: SdpSignaling,
    capture: Arc<dyn AudioCapture>,
    connector: Arc<dyn PeerConnector>,
    tool_executor: Option<Arc<dyn ToolExecutor>>,
    observer: Arc<dyn AgentObserver>,
    conversation: Mutex<Conversation>,
    state_tx: watch::Sender<AgentState>,
    /// Lock order: `slot` before `conversation`.
    slot: Mutex<Slot>,
    generation: AtomicU64,
}

enum Slot {
    Empty,
    Connecting(u64),
    Active(ActiveSession),
}

struct ActiveSession {
    id: String,
    inputs: mpsc::UnboundedSender<LoopInput>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

enum LoopInput {
    SendText { text: String, reply: oneshot::Sender<Result<()>> },
    ToolResult { call_id: String, output: String },
}

impl VoiceAgent {
    /// Create a new builder.
    pub fn builder() -> VoiceAgentBuilder {
        VoiceAgentBuilder::new()
    }

    /// Current state.
    pub fn state(&self) -> AgentState {
        self.inner.conversation.lock().state
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether a session is established.
    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.slot.lock(), Slot::Active(_))
    }

    /// Id of the established session.
    pub fn session_id(&self) -> Option<String> {
        match &*self.inner.slot.lock() {
            Slot::Active(session) => Some(session.id.clone()),
            _ => None,
        }
    }

    /// The configuration this agent was built with.
    pub fn config(&self) -> &VoiceAgentConfig {
        &self.inner.config
    }

    /// Open a session using a short-lived `credential`.
    ///
    /// Fails with [`VoiceError::AlreadyConnected`] if a session is active or
    /// being established, and with [`VoiceError::Cancelled`] if
    /// [`disconnect`](Self::disconnect) is called before it completes. On any
    /// other failure the agent moves to [`AgentState::Error`] and everything
    /// acquired so far is released.
    pub async fn connect(&self, credential: impl Into<String>) -> Result<()> {
        let credential = SecretString::from(credential.into());

        let (generation, step) = match self.inner.reserve() {
            Ok(reserved) => reserved,
            Err(e) => {
                self.inner.observer.on_error(&e).await;
                return Err(e);
            }
        };
        let mut attempt = ConnectAttempt::new(Arc::clone(&self.inner), generation);
        tracing::info!(generation, "connecting");
        self.inner.notify(&step).await;

        let result = self.establish(&credential, &mut attempt).await;
        if result.is_err() {
            attempt.close_transport().await;
        }
        attempt.settle();

        match result {
            Ok(()) => Ok(()),
            Err(e) if matches!(e, VoiceError::Cancelled) || !self.inner.is_current(generation) => {
                tracing::info!(generation, "connect superseded by disconnect");
                Err(VoiceError::Cancelled)
            }
            Err(e) => {
                tracing::error!(error = %e, "connect failed");
                if let Some(step) = self.inner.release_connecting(generation) {
                    self.inner.notify(&step).await;
                }
                self.inner.observer.on_error(&e).await;
                Err(e)
            }
        }
    }

    async fn establish(&self, credential: &SecretString, attempt: &mut ConnectAttempt) -> Result<()> {
        let inner = &self.inner;
        let generation = attempt.generation;

        let audio = inner.capture.acquire().await?;
        inner.ensure_current(generation)?;

        let opened = inner.connector.open(&inner.config.peer_options(), audio).await?;
        let peer = attempt.transport.insert(opened);
        self.negotiate(&mut **peer, credential, generation).await?;

        let (Some(events), Some(playback)) = (peer.take_events(), peer.take_playback()) else {
            return Err(VoiceError::transport("Transport event queues unavailable"));
        };
        let transport = attempt
            .transport
            .take()
            .ok_or_else(|| VoiceError::transport("Transport released during connect"))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let session_loop = SessionLoop {
            inner: Arc::clone(inner),
            generation,
            control: transport.control(),
            transport,
            bridge: FunctionCallBridge::new(),
            assistant_transcript: String::new(),
            inputs: inputs_tx.clone(),
        };

        let installed = {
            let mut slot = inner.slot.lock();
            if matches!(*slot, Slot::Connecting(g) if g == generation) {
                let step = inner.force(Signal::Connected);
                let span = aria_telemetry::session_span(
                    &session_id,
                    inner.config.model.as_deref().unwrap_or("default"),
                );
                let task = tokio::spawn(
                    session_loop
                        .run(Inputs {
                            events,
                            playback,
                            inputs: inputs_rx,
                            shutdown: shutdown_rx,
                            ready: ready_rx,
                        })
                        .instrument(span),
                );
                *slot = Slot::Active(ActiveSession {
                    id: session_id.clone(),
                    inputs: inputs_tx,
                    shutdown: shutdown_tx,
                    task,
                });
                Ok(step)
            } else {
                Err(session_loop)
            }
        };

        match installed {
            Ok(step) => {
                tracing::info!(session.id = %session_id, "session established");
                inner.notify(&step).await;
                inner.observer.on_connected().await;
                // The loop holds its events until the caller has seen the connect.
                let _ = ready_tx.send(());
                Ok(())
            }
            Err(mut session_loop) => {
                session_loop.transport.close().await;
                Err(VoiceError::Cancelled)
            }
        }
    }

    async fn negotiate(
        &self,
        transport: &mut dyn PeerTransport,
        credential: &SecretString,
        generation: u64,
    ) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_current(generation)?;

        let offer = transport.local_offer().await?;
        let span = aria_telemetry::negotiation_span(inner.signaling.endpoint().as_str());
        let answer = inner.signaling.exchange(credential, &offer).instrument(span).await?;
        inner.ensure_current(generation)?;

        transport.apply_answer(&answer).await?;
        inner.ensure_current(generation)
    }

    /// End the session, if any, and return to [`AgentState::Idle`].
    ///
    /// Safe to call at any time, including while `connect` is in flight and
    /// repeatedly. Always notifies `on_disconnected`.
    pub async fn disconnect(&self) {
        let (previous, step) = {
            let mut slot = self.inner.slot.lock();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            let previous = std::mem::replace(&mut *slot, Slot::Empty);
            (previous, self.inner.force(Signal::Disconnected))
        };

        if let Slot::Active(session) = previous {
            tracing::info!(session.id = %session.id, "disconnecting");
            let _ = session.shutdown.send(());
            // An observer may call disconnect from inside the loop itself.
            if tokio::task::try_id() != Some(session.task.id()) {
                if let Err(e) = session.task.await {
                    tracing::warn!(error = %e, "session task ended abnormally");
                }
            }
        }

        self.inner.notify(&step).await;
        self.inner.observer.on_disconnected().await;
    }

    /// Inject a user text turn.
    ///
    /// Fails with [`VoiceError::ChannelNotReady`] when there is no session or
    /// its control channel is not open.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let result = self.route_text(text.into()).await;
        if let Err(e) = &result {
            self.inner.observer.on_error(e).await;
        }
        result
    }

    async fn route_text(&self, text: String) -> Result<()> {
        let inputs = {
            match &*self.inner.slot.lock() {
                Slot::Active(session) => session.inputs.clone(),
                _ => return Err(VoiceError::ChannelNotReady),
            }
        };
        let (reply, response) = oneshot::channel();
        inputs
            .send(LoopInput::SendText { text, reply })
            .map_err(|_| VoiceError::ChannelNotReady)?;
        response.await.map_err(|_| VoiceError::ChannelNotReady)?
    }
}

impl fmt::Debug for VoiceAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceAgent")
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish()
    }
}

impl Drop for VoiceAgent {
    fn drop(&mut self) {
        let previous = {
            let mut slot = self.inner.slot.lock();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            std::mem::replace(&mut *slot, Slot::Empty)
        };
        if let Slot::Active(session) = previous {
            let _ = session.shutdown.send(());
        }
    }
}

impl AgentInner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn ensure_current(&self, generation: u64) -> Result<()> {
        if self.is_current(generation) { Ok(()) } else { Err(VoiceError::Cancelled) }
    }

    /// Claim the slot for a new connect attempt and enter `Connecting`.
    fn reserve(&self) -> Result<(u64, Step)> {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Empty) {
            return Err(VoiceError::AlreadyConnected);
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *slot = Slot::Connecting(generation);
        Ok((generation, self.force(Signal::ConnectRequested)))
    }

    /// Give up a failed connect attempt and enter `Error`.
    fn release_connecting(&self, generation: u64) -> Option<Step> {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Connecting(g) if g == generation) {
            return None;
        }
        *slot = Slot::Empty;
        Some(self.force(Signal::ConnectFailed))
    }

    /// Release the slot after the transport dropped and enter `Idle`.
    fn release_active(&self, generation: u64) -> Option<Step> {
        let mut slot = self.slot.lock();
        if !self.is_current(generation) || !matches!(*slot, Slot::Active(_)) {
            return None;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        *slot = Slot::Empty;
        Some(self.force(Signal::Disconnected))
    }

    fn plan(&self, signal: Signal) -> Step {
        transition(*self.conversation.lock(), signal)
    }

    /// Commit a planned step if `generation` is still live.
    fn commit(&self, generation: u64, step: &Step) -> bool {
        let mut conversation = self.conversation.lock();
        if !self.is_current(generation) {
            return false;
        }
        *conversation = step.next;
        self.publish(step.next.state);
        true
    }

    fn force(&self, signal: Signal) -> Step {
        let mut conversation = self.conversation.lock();
        let step = transition(*conversation, signal);
        *conversation = step.next;
        self.publish(step.next.state);
        step
    }

    fn publish(&self, state: AgentState) {
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    async fn notify(&self, step: &Step) {
        if step.state_changed() {
            tracing::debug!(from = %step.previous.state, to = %step.next.state, "state changed");
            self.observer.on_state_change(step.previous.state, step.next.state).await;
        }
    }
}

/// Releases an in-flight connect whose future was dropped before it settled.
struct ConnectAttempt {
    inner: Arc<AgentInner>,
    generation: u64,
    transport: Option<Box<dyn PeerTransport>>,
    settled: bool,
}

impl ConnectAttempt {
    fn new(inner: Arc<AgentInner>, generation: u64) -> Self {
        Self { inner, generation, transport: None, settled: false }
    }

    async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for ConnectAttempt {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let step = self.inner.release_connecting(self.generation);
        let transport = self.transport.take();
        if step.is_none() && transport.is_none() {
            return;
        }
        tracing::info!(generation = self.generation, "connect abandoned by caller");

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            if let Some(mut transport) = transport {
                transport.close().await;
            }
            if let Some(step) = step {
                inner.notify(&step).await;
                inner.observer.on_error(&VoiceError::Cancelled).await;
            }
        });
    }
}

struct Inputs {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    playback: mpsc::UnboundedReceiver<PlaybackSignal>,
    inputs: mpsc::UnboundedReceiver<LoopInput>,
    shutdown: oneshot::Receiver<()>,
    ready: oneshot::Receiver<()>,
}

enum Exit {
    Requested,
    Dropped(String),
}

struct SessionLoop {
    inner: Arc<AgentInner>,
    generation: u64,
    transport: Box<dyn PeerTransport>,
    control: Arc<dyn ControlChannel>,
    bridge: FunctionCallBridge,
    assistant_transcript: String,
    inputs: mpsc::UnboundedSender<LoopInput>,
}

impl SessionLoop {
    async fn run(mut self, queues: Inputs) {
        let Inputs { mut events, mut playback, mut inputs, mut shutdown, ready } = queues;

        tokio::select! {
            biased;
            _ = &mut shutdown => {
                self.teardown(Exit::Requested).await;
                return;
            }
            _ = ready => {}
        }

        let mut playback_open = true;
        let exit = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break Exit::Requested,
                event = events.recv() => match event {
                    Some(TransportEvent::ChannelOpen) => tracing::debug!("control channel open"),
                    Some(TransportEvent::Message(frame)) => self.handle_frame(&frame).await,
                    Some(TransportEvent::Closed(reason)) => break Exit::Dropped(reason),
                    None => break Exit::Dropped("transport event queue closed".to_string()),
                },
                Some(input) = inputs.recv() => self.handle_input(input).await,
                signal = playback.recv(), if playback_open => match signal {
                    Some(PlaybackSignal::Started) => self.apply(Signal::PlaybackStarted).await,
                    Some(PlaybackSignal::Paused) => self.apply(Signal::PlaybackPaused).await,
                    None => playback_open = false,
                },
            }
        };

        self.teardown(exit).await;
    }

    async fn handle_frame(&mut self, frame: &str) {
        let event = match events::decode(frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "dropping control frame");
                return;
            }
        };

        match event {
            InboundEvent::SessionLifecycle(kind) => tracing::debug!(event = %kind, "session event"),
            InboundEvent::SpeechStarted => self.apply(Signal::SpeechStarted).await,
            InboundEvent::SpeechStopped => self.apply(Signal::SpeechStopped).await,
            InboundEvent::UserTranscript(text) => {
                self.inner.observer.on_transcript(&TranscriptEvent::user(text)).await;
            }
            InboundEvent::ResponseStarted => {
                self.assistant_transcript.clear();
                self.apply(Signal::ResponseStarted).await;
            }
            InboundEvent::AssistantTranscriptDelta(delta) => {
                tracing::trace!(delta = %delta, "assistant transcript");
                self.assistant_transcript.push_str(&delta);
            }
            InboundEvent::AssistantTranscriptDone(text) => {
                let accumulated = std::mem::take(&mut self.assistant_transcript);
                let text = if text.is_empty() { accumulated } else { text };
                self.inner.observer.on_transcript(&TranscriptEvent::assistant(text)).await;
            }
            InboundEvent::AudioStreaming => self.apply(Signal::AudioStreaming).await,
            InboundEvent::ResponseCompleted => self.apply(Signal::ResponseCompleted).await,
            InboundEvent::FunctionArgumentsDelta { call_id, delta } => {
                if !self.bridge.append_arguments(&call_id, &delta) {
                    tracing::debug!(call.id = %call_id, "ignoring fragment for finished call");
                }
            }
            InboundEvent::FunctionCallAdded { call_id, name } => {
                if !self.bridge.record_name(&call_id, &name) {
                    tracing::debug!(call.id = %call_id, "ignoring item for finished call");
                }
            }
            InboundEvent::FunctionArgumentsDone { call_id, name, arguments } => {
                match self.bridge.complete(&call_id, name, arguments) {
                    Some(ready) => self.spawn_tool(ready),
                    None => tracing::debug!(call.id = %call_id, "ignoring repeated completion"),
                }
            }
            InboundEvent::ServerError { code, message } => {
                tracing::warn!(%code, %message, "server error");
                self.inner.observer.on_error(&VoiceError::server(code, message)).await;
            }
            InboundEvent::Ignored(kind) => tracing::trace!(event = %kind, "ignored event"),
        }
    }

    async fn handle_input(&mut self, input: LoopInput) {
        match input {
            LoopInput::SendText { text, reply } => {
                let result = self.send_text(&text).await;
                if reply.send(result).is_err() {
                    tracing::debug!("send_text caller went away");
                }
            }
            LoopInput::ToolResult { call_id, output } => {
                if self.bridge.get(&call_id).is_none() {
                    tracing::debug!(call.id = %call_id, "discarding result for unknown call");
                    return;
                }
                let message = OutboundMessage::FunctionResult { call_id: call_id.clone(), output };
                if let Err(e) = self.send(message).await {
                    tracing::warn!(call.id = %call_id, error = %e, "failed to submit tool result");
                    self.inner.observer.on_error(&e).await;
                }
                self.bridge.finish(&call_id);
            }
        }
    }

    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(OutboundMessage::UserText(text.to_string())).await?;
        self.inner.observer.on_transcript(&TranscriptEvent::user(text)).await;
        self.apply(Signal::TextSent).await;
        Ok(())
    }

    async fn send(&mut self, message: OutboundMessage) -> Result<()> {
        transport::send_all(self.control.as_ref(), message.encode()?).await
    }

    /// Run one signal through the state machine, cancelling first on barge-in.
    async fn apply(&mut self, signal: Signal) {
        let step = self.inner.plan(signal);
        if step.cancel_response {
            tracing::debug!("user barged in, cancelling response");
            if let Err(e) = self.send(OutboundMessage::CancelResponse).await {
                tracing::warn!(error = %e, "failed to cancel response");
                self.inner.observer.on_error(&e).await;
            }
        }
        if self.inner.commit(self.generation, &step) {
            self.inner.notify(&step).await;
        }
    }

    fn spawn_tool(&self, ready: ReadyCall) {
        let executor = self.inner.tool_executor.clone();
        let timeout = self.inner.config.tool_timeout;
        let inputs = self.inputs.clone();
        tokio::spawn(
            async move {
                let call_id = ready.call_id.clone();
                let output = resolve_call(executor, ready, timeout).await;
                if inputs.send(LoopInput::ToolResult { call_id, output }).is_err() {
                    tracing::debug!("session ended before tool result");
                }
            }
            .in_current_span(),
        );
    }

    async fn teardown(mut self, exit: Exit) {
        self.bridge.clear();
        self.control.close().await;
        self.transport.close().await;

        match exit {
            Exit::Requested => tracing::info!("session closed"),
            Exit::Dropped(reason) => {
                tracing::warn!(%reason, "transport dropped");
                if let Some(step) = self.inner.release_active(self.generation) {
                    self.inner.notify(&step).await;
                    self.inner.observer.on_error(&VoiceError::transport(reason)).await;
                    self.inner.observer.on_disconnected().await;
                }
            }
        }
    }
}
