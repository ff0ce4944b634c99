//! Error types for the realtime voice agent.

use thiserror::Error;

/// Result type for realtime operations.
pub type Result<T> = std::result::Result<T, VoiceError>;

/// Errors that can occur while running a realtime voice session.
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone permission denied or device unavailable.
    #[error("Audio acquisition error: {0}")]
    Acquisition(String),

    /// SDP offer/answer exchange failed or returned a malformed answer.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Peer transport could not be created or was lost.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Inbound control message could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Tool execution failed.
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Server reported an error on the control channel.
    #[error("Server error: {code} - {message}")]
    Server {
        /// Error code from the server.
        code: String,
        /// Error message from the server.
        message: String,
    },

    /// Control channel is not open.
    #[error("Control channel not ready")]
    ChannelNotReady,

    /// A session is already active or being established.
    #[error("A realtime session is already active")]
    AlreadyConnected,

    /// The connect attempt was superseded by a disconnect.
    #[error("Connect attempt cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VoiceError {
    /// Create a new acquisition error.
    pub fn acquisition<S: Into<String>>(msg: S) -> Self {
        Self::Acquisition(msg.into())
    }

    /// Create a new negotiation error.
    pub fn negotiation<S: Into<String>>(msg: S) -> Self {
        Self::Negotiation(msg.into())
    }

    /// Create a new transport error.
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new decode error.
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new tool error.
    pub fn tool<S: Into<String>>(msg: S) -> Self {
        Self::Tool(msg.into())
    }

    /// Create a new server error.
    pub fn server<S: Into<String>>(code: S, message: S) -> Self {
        Self::Server { code: code.into(), message: message.into() }
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error ends a connect attempt (as opposed to being
    /// reported while a session keeps running).
    pub fn is_connect_fatal(&self) -> bool {
        matches!(
            self,
            Self::Acquisition(_) | Self::Negotiation(_) | Self::Transport(_) | Self::Config(_)
        )
    }
}
