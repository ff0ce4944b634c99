//! Conversation state machine.
//!
//! All state changes go through [`transition`], a pure function of the
//! current [`Conversation`] and one [`Signal`]. The session loop computes a
//! [`Step`], performs any side effect the step asks for (a response
//! cancellation on barge-in), and only then commits `step.next`.
//!
//! Signals come from two sources. Explicit ones are decoded from the control
//! channel (speech detection, response lifecycle, audio streaming). Secondary
//! ones come from local playback of the remote audio track. Secondary signals
//! can move the agent between `Speaking` and `Listening` but never while the
//! user is speaking.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The agent's conversational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// No session.
    #[default]
    Idle,
    /// `connect` is in progress.
    Connecting,
    /// Session up, waiting for the user.
    Listening,
    /// The user finished a turn or a response is being generated.
    Thinking,
    /// Remote audio is playing.
    Speaking,
    /// The last connect attempt failed.
    Error,
}

impl AgentState {
    /// Lower-case name used in logs and serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Error => "error",
        }
    }

    /// States that only exist while a session is established.
    pub fn is_in_session(&self) -> bool {
        matches!(self, Self::Listening | Self::Thinking | Self::Speaking)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The agent state together with the speech-detection flag it depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Conversation {
    /// Current state.
    pub state: AgentState,
    /// Set between speech-started and speech-stopped.
    pub user_speaking: bool,
}

impl Conversation {
    /// Conversation in `state` with the user silent.
    pub fn new(state: AgentState) -> Self {
        Self { state, user_speaking: false }
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// `connect` was invoked.
    ConnectRequested,
    /// Negotiation finished.
    Connected,
    /// Negotiation failed.
    ConnectFailed,
    /// Session torn down (by the caller or by the transport).
    Disconnected,
    /// Server VAD detected the start of user speech.
    SpeechStarted,
    /// Server VAD detected the end of user speech.
    SpeechStopped,
    /// The server started generating a response.
    ResponseStarted,
    /// Response audio is streaming.
    AudioStreaming,
    /// The server finished a response.
    ResponseCompleted,
    /// The caller injected a text turn.
    TextSent,
    /// Local playback of remote audio started.
    PlaybackStarted,
    /// Local playback of remote audio paused.
    PlaybackPaused,
}

impl Signal {
    /// Every signal, in declaration order.
    pub const ALL: [Signal; 12] = [
        Signal::ConnectRequested,
        Signal::Connected,
        Signal::ConnectFailed,
        Signal::Disconnected,
        Signal::SpeechStarted,
        Signal::SpeechStopped,
        Signal::ResponseStarted,
        Signal::AudioStreaming,
        Signal::ResponseCompleted,
        Signal::TextSent,
        Signal::PlaybackStarted,
        Signal::PlaybackPaused,
    ];

    /// Signals driven by `connect`/`disconnect` rather than by a live session.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::ConnectRequested | Self::Connected | Self::ConnectFailed | Self::Disconnected
        )
    }

    /// Playback-derived signals, which yield to explicit speech detection.
    pub fn is_secondary(&self) -> bool {
        matches!(self, Self::PlaybackStarted | Self::PlaybackPaused)
    }
}

/// Outcome of applying one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Conversation before the signal.
    pub previous: Conversation,
    /// Conversation after the signal.
    pub next: Conversation,
    /// The in-flight response must be cancelled before `next` is committed.
    pub cancel_response: bool,
}

impl Step {
    fn stay(current: Conversation) -> Self {
        Self { previous: current, next: current, cancel_response: false }
    }

    fn to(current: Conversation, next: Conversation) -> Self {
        Self { previous: current, next, cancel_response: false }
    }

    /// Whether the visible state differs.
    pub fn state_changed(&self) -> bool {
        self.previous.state != self.next.state
    }
}

/// Apply `signal` to `current`.
pub fn transition(current: Conversation, signal: Signal) -> Step {
    use AgentState::*;

    if !signal.is_lifecycle() && !current.state.is_in_session() {
        return Step::stay(current);
    }

    let speaking = current.user_speaking;
    match signal {
        Signal::ConnectRequested => Step::to(current, Conversation::new(Connecting)),
        Signal::Connected if current.state == Connecting => {
            Step::to(current, Conversation::new(Listening))
        }
        Signal::Connected => Step::stay(current),
        Signal::ConnectFailed => Step::to(current, Conversation::new(Error)),
        Signal::Disconnected => Step::to(current, Conversation::new(Idle)),

        Signal::SpeechStarted => Step {
            previous: current,
            next: Conversation { state: Listening, user_speaking: true },
            cancel_response: current.state == Speaking,
        },
        Signal::SpeechStopped => {
            Step::to(current, Conversation { state: Thinking, user_speaking: false })
        }
        Signal::ResponseStarted | Signal::TextSent => {
            Step::to(current, Conversation { state: Thinking, ..current })
        }
        Signal::AudioStreaming if current.state != Speaking && !speaking => {
            Step::to(current, Conversation { state: Speaking, ..current })
        }
        Signal::ResponseCompleted if !speaking => {
            Step::to(current, Conversation { state: Listening, ..current })
        }
        Signal::PlaybackStarted if !speaking && matches!(current.state, Listening | Thinking) => {
            Step::to(current, Conversation { state: Speaking, ..current })
        }
        Signal::PlaybackPaused if !speaking && current.state == Speaking => {
            Step::to(current, Conversation { state: Listening, ..current })
        }
        Signal::AudioStreaming
        | Signal::ResponseCompleted
        | Signal::PlaybackStarted
        | Signal::PlaybackPaused => Step::stay(current),
    }
}

/// Who produced a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human.
    User,
    /// The remote model.
    Assistant,
}

/// A finished utterance, emitted to the observer and never stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    /// Speaker.
    pub role: Role,
    /// Utterance text.
    pub text: String,
}

impl TranscriptEvent {
    /// A user transcript.
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    /// An assistant transcript.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, text: text.into() }
    }
}
