//! # aria-realtime
//!
//! Connection manager for realtime voice agents.
//!
//! A [`VoiceAgent`] opens a low-latency audio session with a remote model over
//! a peer-to-peer transport, runs a control channel alongside the audio, and
//! keeps a conversation state machine in sync with what the server reports:
//!
//! ```text
//! idle ──connect──▶ connecting ──answer──▶ listening
//!                       └──failure──▶ error
//! listening ──speech stopped──▶ thinking ──audio──▶ speaking ──done──▶ listening
//! speaking ──user speech, response cancelled──▶ listening
//! any ──disconnect──▶ idle
//! ```
//!
//! ## Features
//!
//! - **Negotiation**: SDP offer/answer over HTTPS with a short-lived credential
//! - **Barge-in**: user speech during playback cancels the in-flight response
//! - **Tool calls**: streamed function-call arguments are accumulated, executed
//!   through a [`ToolExecutor`], and the result is fed back into the session
//! - **Pluggable transport**: the session logic only sees the traits in
//!   [`transport`]; the `webrtc` feature provides a `str0m` implementation
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use aria_realtime::{FnToolExecutor, VoiceAgent, VoiceAgentConfig};
//! use aria_realtime::transport::{ChannelCapture, NullSink};
//! use aria_realtime::transport::webrtc::WebRtcConnector;
//!
//! let agent = VoiceAgent::builder()
//!     .config(VoiceAgentConfig::from_env()?)
//!     .capture(Arc::new(ChannelCapture::new()))
//!     .connector(Arc::new(WebRtcConnector::new(Arc::new(NullSink))))
//!     .tool_executor(Arc::new(FnToolExecutor::new(|call| async move {
//!         Ok(format!("{{\"success\":true,\"tool\":\"{}\"}}", call.name))
//!     })))
//!     .build()?;
//!
//! agent.connect(ephemeral_key).await?;
//! ```

pub mod agent;
pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod observer;
pub mod state;
pub mod transport;

// Re-exports
pub use agent::{VoiceAgent, VoiceAgentBuilder};
pub use bridge::{FnToolExecutor, FunctionCall, FunctionCallBridge, PendingFunctionCall, ToolExecutor};
pub use config::{IceServer, VoiceAgentConfig};
pub use error::{Result, VoiceError};
pub use events::{ClientEvent, InboundEvent, OutboundMessage, ServerEvent};
pub use observer::{AgentObserver, NoOpObserver};
pub use state::{AgentState, Conversation, Role, Signal, Step, TranscriptEvent, transition};
