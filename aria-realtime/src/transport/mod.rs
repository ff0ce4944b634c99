//! Peer transport abstractions.
//!
//! The session layer never touches sockets or codecs directly. It asks an
//! [`AudioCapture`] for the microphone, a [`PeerConnector`] for a transport
//! carrying that audio plus one control channel, and talks to the remote side
//! through [`PeerTransport`] and [`ControlChannel`].
//!
//! Inbound traffic arrives on two queues. [`TransportEvent`]s are explicit
//! (control-channel frames and channel lifecycle). [`PlaybackSignal`]s are
//! derived from the remote media track and only ever nudge the conversation
//! state.

pub mod signaling;
pub mod stun;
#[cfg(feature = "webrtc")]
pub mod webrtc;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::error::{Result, VoiceError};

pub use signaling::SdpSignaling;

/// Sample rate of PCM16 audio exchanged with the transport.
pub const SAMPLE_RATE: u32 = 24_000;

/// Samples in one 20 ms mono frame at [`SAMPLE_RATE`].
pub const FRAME_SAMPLES: usize = 480;

const CAPTURE_QUEUE_FRAMES: usize = 64;

/// Options handed to a [`PeerConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerOptions {
    /// Reachability-assist servers.
    pub ice_servers: Vec<IceServer>,
    /// Label of the control channel to create before the offer.
    pub channel_label: String,
    /// Remote silence after which playback counts as paused.
    pub playback_idle: Duration,
}

/// Captured microphone audio. Dropping it stops the capture.
#[derive(Debug)]
pub struct LocalAudio {
    frames: mpsc::Receiver<Vec<i16>>,
    sample_rate: u32,
}

impl LocalAudio {
    /// Wrap a stream of mono PCM16 frames.
    pub fn new(frames: mpsc::Receiver<Vec<i16>>, sample_rate: u32) -> Self {
        Self { frames, sample_rate }
    }

    /// Next captured frame, or `None` once capture stopped.
    pub async fn next_frame(&mut self) -> Option<Vec<i16>> {
        self.frames.recv().await
    }

    /// Sample rate of the captured frames.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Source of local microphone audio.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Start capturing. Fails with [`VoiceError::Acquisition`] when the
    /// device is unavailable or permission is denied.
    async fn acquire(&self) -> Result<LocalAudio>;
}

/// An [`AudioCapture`] fed by the caller.
///
/// Each `acquire` starts a fresh stream; frames pushed while no stream is
/// active are dropped.
#[derive(Debug, Default)]
pub struct ChannelCapture {
    sender: Mutex<Option<mpsc::Sender<Vec<i16>>>>,
}

impl ChannelCapture {
    /// Create an idle capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one PCM16 frame. Returns `false` if it was dropped.
    pub fn push(&self, frame: Vec<i16>) -> bool {
        let mut sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!("capture queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *sender = None;
                false
            }
        }
    }

    /// Whether a consumer currently holds the stream.
    pub fn is_active(&self) -> bool {
        self.sender.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl AudioCapture for ChannelCapture {
    async fn acquire(&self) -> Result<LocalAudio> {
        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE_FRAMES);
        *self.sender.lock() = Some(tx);
        Ok(LocalAudio::new(rx, SAMPLE_RATE))
    }
}

/// Destination for decoded remote audio.
pub trait AudioSink: Send + Sync {
    /// Play mono PCM16 samples at [`SAMPLE_RATE`].
    fn play(&self, samples: &[i16]);
}

/// Sink that discards audio.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn play(&self, _samples: &[i16]) {}
}

/// Explicit inbound traffic from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The control channel opened.
    ChannelOpen,
    /// One control-channel text frame.
    Message(String),
    /// The transport is gone.
    Closed(String),
}

/// Playback activity of the remote audio track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackSignal {
    /// Remote audio started playing.
    Started,
    /// Remote audio went quiet.
    Paused,
}

/// The bidirectional control/event channel.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Whether frames written now are delivered.
    fn is_open(&self) -> bool;

    /// Write one text frame.
    async fn send(&self, frame: String) -> Result<()>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// An established (or negotiating) peer connection.
#[async_trait]
pub trait PeerTransport: Send {
    /// The local SDP offer. Includes the audio track and the control channel.
    async fn local_offer(&mut self) -> Result<String>;

    /// Apply the remote SDP answer.
    async fn apply_answer(&mut self, sdp: &str) -> Result<()>;

    /// Handle to the control channel.
    fn control(&self) -> Arc<dyn ControlChannel>;

    /// Take the explicit event queue. Returns `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Take the playback queue. Returns `None` after the first call.
    fn take_playback(&mut self) -> Option<mpsc::UnboundedReceiver<PlaybackSignal>>;

    /// Close the control channel and the connection, stopping local media.
    async fn close(&mut self);
}

/// Factory for peer transports.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a transport sending `audio` as its outbound track.
    async fn open(&self, options: &PeerOptions, audio: LocalAudio) -> Result<Box<dyn PeerTransport>>;
}

/// Write an already-encoded sequence of frames, stopping at the first error.
pub(crate) async fn send_all(channel: &dyn ControlChannel, frames: Vec<String>) -> Result<()> {
    if !channel.is_open() {
        return Err(VoiceError::ChannelNotReady);
    }
    for frame in frames {
        channel.send(frame).await?;
    }
    Ok(())
}
