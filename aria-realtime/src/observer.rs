//! Caller-facing callbacks.

use async_trait::async_trait;

use crate::error::VoiceError;
use crate::state::{AgentState, TranscriptEvent};

/// Receives notifications from a [`VoiceAgent`](crate::VoiceAgent).
///
/// Callbacks run on the session's event loop; a slow callback delays the
/// next event. All methods default to doing nothing.
#[async_trait]
pub trait AgentObserver: Send + Sync {
    /// The agent state changed. Fires once per actual change.
    async fn on_state_change(&self, _previous: AgentState, _current: AgentState) {}

    /// A user or assistant utterance finished.
    async fn on_transcript(&self, _transcript: &TranscriptEvent) {}

    /// An error occurred. Connect failures are also returned from `connect`.
    async fn on_error(&self, _error: &VoiceError) {}

    /// The session is established.
    async fn on_connected(&self) {}

    /// The session ended, by request or because the transport dropped.
    async fn on_disconnected(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

#[async_trait]
impl AgentObserver for NoOpObserver {}
