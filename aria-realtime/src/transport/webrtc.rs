//! WebRTC peer transport built on `str0m`.
//!
//! `str0m` is Sans-IO: [`WebRtcTransport`] owns the `Rtc` state machine and,
//! once the answer is applied, a driver task feeds it UDP datagrams and
//! timeouts, writes outbound control frames and captured audio, and turns its
//! events into [`TransportEvent`]s and [`PlaybackSignal`]s.
//!
//! Audio is mono PCM16 at 24 kHz on the local side and Opus on the wire.
//!
//! A host candidate is always gathered. The first configured STUN server that
//! answers adds a server-reflexive candidate. TURN relays are not used.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, MutSignals, SampleRate};
use parking_lot::Mutex;
use str0m::change::{SdpAnswer, SdpPendingOffer};
use str0m::channel::ChannelId;
use str0m::media::{Direction, Frequency, MediaKind, MediaTime, Mid, Pt};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::stun;
use super::{
    AudioSink, ControlChannel, FRAME_SAMPLES, LocalAudio, PeerConnector, PeerOptions,
    PeerTransport, PlaybackSignal, SAMPLE_RATE, TransportEvent,
};
use crate::error::{Result, VoiceError};

/// Upper bound on one STUN binding exchange.
const STUN_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum size of an encoded Opus frame in bytes.
const MAX_OPUS_FRAME_BYTES: usize = 4000;

/// Decoded samples per channel for the longest Opus frame (120 ms at 48 kHz).
const MAX_DECODED_SAMPLES: usize = 5760;

const MAX_DATAGRAM: usize = 2000;

/// Opus encoder/decoder pair for mono speech.
pub struct OpusCodec {
    encoder: Encoder,
    decoder: Decoder,
}

impl OpusCodec {
    /// Create a mono VoIP codec at `sample_rate` (8, 12, 16, 24 or 48 kHz).
    pub fn new(sample_rate: u32) -> Result<Self> {
        let rate = i32::try_from(sample_rate)
            .ok()
            .and_then(|rate| SampleRate::try_from(rate).ok())
            .ok_or_else(|| {
                VoiceError::transport(format!("Unsupported Opus sample rate {sample_rate}"))
            })?;

        let encoder = Encoder::new(rate, Channels::Mono, Application::Voip)
            .map_err(|e| VoiceError::transport(format!("Failed to create Opus encoder: {e}")))?;
        let decoder = Decoder::new(rate, Channels::Mono)
            .map_err(|e| VoiceError::transport(format!("Failed to create Opus decoder: {e}")))?;

        Ok(Self { encoder, decoder })
    }

    /// Encode one frame. At 24 kHz, 480 samples is 20 ms.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        let mut output = vec![0u8; MAX_OPUS_FRAME_BYTES];
        let len = self
            .encoder
            .encode(pcm, &mut output)
            .map_err(|e| VoiceError::transport(format!("Opus encode failed: {e}")))?;
        output.truncate(len);
        Ok(output)
    }

    /// Decode one packet.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        let mut output = vec![0i16; MAX_DECODED_SAMPLES];
        let packet = audiopus::packet::Packet::try_from(packet)
            .map_err(|e| VoiceError::transport(format!("Invalid Opus packet: {e}")))?;
        let signals = MutSignals::try_from(output.as_mut_slice())
            .map_err(|e| VoiceError::transport(format!("Opus output buffer: {e}")))?;
        let samples = self
            .decoder
            .decode(Some(packet), signals, false)
            .map_err(|e| VoiceError::transport(format!("Opus decode failed: {e}")))?;
        output.truncate(samples);
        Ok(output)
    }
}

/// [`PeerConnector`] producing [`WebRtcTransport`]s.
pub struct WebRtcConnector {
    sink: Arc<dyn AudioSink>,
}

impl WebRtcConnector {
    /// Decoded remote audio goes to `sink`.
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn open(&self, options: &PeerOptions, audio: LocalAudio) -> Result<Box<dyn PeerTransport>> {
        let ip = local_ip();
        let socket = UdpSocket::bind(SocketAddr::new(ip, 0))
            .await
            .map_err(|e| VoiceError::transport(format!("Failed to bind UDP socket: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| VoiceError::transport(format!("UDP socket has no address: {e}")))?;

        let mut rtc = Rtc::new(Instant::now());
        let candidate = Candidate::host(local_addr, "udp")
            .map_err(|e| VoiceError::transport(format!("Invalid host candidate: {e}")))?;
        rtc.add_local_candidate(candidate);

        match stun::reflexive_address(&socket, &options.ice_servers, STUN_TIMEOUT).await {
            Some(mapped) if mapped != local_addr => {
                match Candidate::server_reflexive(mapped, local_addr, "udp") {
                    Ok(candidate) => {
                        rtc.add_local_candidate(candidate);
                    }
                    Err(e) => tracing::warn!(%mapped, error = %e, "invalid server-reflexive candidate"),
                }
            }
            Some(_) => tracing::debug!("STUN mapping equals host address"),
            None => tracing::warn!("no STUN server answered, offering host candidate only"),
        }

        let offer = create_offer(&mut rtc, &options.channel_label)?;
        tracing::debug!(%local_addr, mid = %offer.mid, "created local offer");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let control = Arc::new(DataChannel::new(outbound_tx));

        Ok(Box::new(WebRtcTransport {
            offer_sdp: offer.sdp,
            setup: Some(Setup {
                rtc,
                pending: offer.pending,
                mid: offer.mid,
                channel: offer.channel,
                socket,
                local_addr,
                audio,
                sink: Arc::clone(&self.sink),
                events: events_tx,
                playback: playback_tx,
                outbound: outbound_rx,
                playback_idle: options.playback_idle,
            }),
            control,
            events: Some(events_rx),
            playback: Some(playback_rx),
            driver: None,
        }))
    }
}

struct Offer {
    sdp: String,
    pending: SdpPendingOffer,
    mid: Mid,
    channel: ChannelId,
}

/// Add one send/recv audio line and the control channel, then build the offer.
fn create_offer(rtc: &mut Rtc, label: &str) -> Result<Offer> {
    let mut changes = rtc.sdp_api();
    let mid = changes.add_media(MediaKind::Audio, Direction::SendRecv, None, None, None);
    let channel = changes.add_channel(label.to_string());
    let (offer, pending) = changes
        .apply()
        .ok_or_else(|| VoiceError::transport("Failed to generate SDP offer: no changes"))?;
    Ok(Offer { sdp: offer.to_sdp_string(), pending, mid, channel })
}

/// The interface address used to reach the internet, or loopback.
fn local_ip() -> IpAddr {
    let route = std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| socket.connect("8.8.8.8:80").map(|_| socket))
        .and_then(|socket| socket.local_addr());
    match route {
        Ok(addr) => addr.ip(),
        Err(e) => {
            tracing::warn!(error = %e, "no routable interface, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Everything the driver needs, held until the answer arrives.
struct Setup {
    rtc: Rtc,
    pending: SdpPendingOffer,
    mid: Mid,
    channel: ChannelId,
    socket: UdpSocket,
    local_addr: SocketAddr,
    audio: LocalAudio,
    sink: Arc<dyn AudioSink>,
    events: mpsc::UnboundedSender<TransportEvent>,
    playback: mpsc::UnboundedSender<PlaybackSignal>,
    outbound: mpsc::UnboundedReceiver<String>,
    playback_idle: Duration,
}

/// A `str0m` peer connection with one audio track and one data channel.
pub struct WebRtcTransport {
    offer_sdp: String,
    setup: Option<Setup>,
    control: Arc<DataChannel>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    playback: Option<mpsc::UnboundedReceiver<PlaybackSignal>>,
    driver: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn local_offer(&mut self) -> Result<String> {
        Ok(self.offer_sdp.clone())
    }

    async fn apply_answer(&mut self, sdp: &str) -> Result<()> {
        let Setup {
            mut rtc,
            pending,
            mid,
            channel,
            socket,
            local_addr,
            audio,
            sink,
            events,
            playback,
            outbound,
            playback_idle,
        } = self
            .setup
            .take()
            .ok_or_else(|| VoiceError::transport("SDP answer already applied"))?;

        let answer = SdpAnswer::from_sdp_string(sdp)
            .map_err(|e| VoiceError::negotiation(format!("Failed to parse SDP answer: {e}")))?;
        rtc.sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| VoiceError::negotiation(format!("Failed to apply SDP answer: {e}")))?;

        let (pt, clock_rate) = {
            let writer = rtc
                .writer(mid)
                .ok_or_else(|| VoiceError::negotiation("Audio track not negotiated"))?;
            let params = writer
                .payload_params()
                .next()
                .ok_or_else(|| VoiceError::negotiation("No audio codec in SDP answer"))?;
            (params.pt(), params.spec().clock_rate)
        };

        let driver = Driver {
            rtc,
            mid,
            channel,
            socket,
            local_addr,
            audio: Some(audio),
            codec: OpusCodec::new(SAMPLE_RATE)?,
            pt,
            clock_rate,
            rtp_offset: 0,
            capture_buffer: Vec::with_capacity(FRAME_SAMPLES * 2),
            sink,
            control: Arc::clone(&self.control),
            events,
            playback,
            outbound,
            playback_idle,
            last_media: None,
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(driver.run(shutdown_rx));
        self.driver = Some((shutdown_tx, task));
        tracing::info!(%mid, "WebRTC handshake complete");
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
        // Dropping an unanswered setup releases the socket and the capture.
        self.setup = None;
        if let Some((shutdown, task)) = self.driver.take() {
            let _ = shutdown.send(());
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "WebRTC driver ended abnormally");
            }
        }
    }
}

#[derive(Default)]
struct ChannelState {
    open: bool,
    closed: bool,
}

/// The control data channel. Writes fail until the peer opens it.
pub struct DataChannel {
    state: Mutex<ChannelState>,
    outbound: mpsc::UnboundedSender<String>,
}

impl DataChannel {
    fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self { state: Mutex::new(ChannelState::default()), outbound }
    }

    fn mark_open(&self) {
        self.state.lock().open = true;
    }
}

#[async_trait]
impl ControlChannel for DataChannel {
    fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.open && !state.closed
    }

    async fn send(&self, frame: String) -> Result<()> {
        if !self.is_open() {
            return Err(VoiceError::ChannelNotReady);
        }
        self.outbound
            .send(frame)
            .map_err(|_| VoiceError::transport("WebRTC driver stopped"))
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

struct Driver {
    rtc: Rtc,
    mid: Mid,
    channel: ChannelId,
    socket: UdpSocket,
    local_addr: SocketAddr,
    audio: Option<LocalAudio>,
    codec: OpusCodec,
    pt: Pt,
    clock_rate: Frequency,
    rtp_offset: u64,
    capture_buffer: Vec<i16>,
    sink: Arc<dyn AudioSink>,
    control: Arc<DataChannel>,
    events: mpsc::UnboundedSender<TransportEvent>,
    playback: mpsc::UnboundedSender<PlaybackSignal>,
    outbound: mpsc::UnboundedReceiver<String>,
    playback_idle: Duration,
    last_media: Option<Instant>,
}

impl Driver {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        let reason = loop {
            let deadline = match self.poll_outputs() {
                Ok(deadline) => deadline,
                Err(reason) => break reason,
            };
            let wait = self.next_wake(deadline);

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    self.rtc.disconnect();
                    // Let the disconnect reach the wire.
                    let _ = self.poll_outputs();
                    self.pause_playback();
                    return;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, source)) => self.receive(source, &buf[..len]),
                    Err(e) => tracing::debug!(error = %e, "UDP receive failed"),
                },
                Some(frame) = self.outbound.recv() => self.write_frame(&frame),
                frame = next_capture(&mut self.audio) => match frame {
                    Some(pcm) => self.write_audio(pcm),
                    None => {
                        tracing::debug!("local capture ended");
                        self.audio = None;
                    }
                },
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = self.rtc.handle_input(Input::Timeout(Instant::now())) {
                break format!("WebRTC timeout handling failed: {e}");
            }
            self.check_playback_idle();
        };

        tracing::warn!(%reason, "WebRTC connection lost");
        self.pause_playback();
        let _ = self.events.send(TransportEvent::Closed(reason));
    }

    /// Drain `str0m` output. Returns the next timeout deadline.
    fn poll_outputs(&mut self) -> std::result::Result<Instant, String> {
        loop {
            if !self.rtc.is_alive() {
                return Err("peer connection closed".to_string());
            }
            match self.rtc.poll_output() {
                Ok(Output::Timeout(deadline)) => return Ok(deadline),
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) =
                        self.socket.try_send_to(&transmit.contents, transmit.destination)
                    {
                        tracing::trace!(error = %e, "UDP send dropped");
                    }
                }
                Ok(Output::Event(event)) => self.handle_event(event)?,
                Err(e) => return Err(format!("WebRTC poll failed: {e}")),
            }
        }
    }

    fn handle_event(&mut self, event: Event) -> std::result::Result<(), String> {
        match event {
            Event::IceConnectionStateChange(IceConnectionState::Disconnected) => {
                return Err("ICE disconnected".to_string());
            }
            Event::IceConnectionStateChange(state) => {
                tracing::debug!(?state, "ICE state changed");
            }
            Event::ChannelOpen(id, label) if id == self.channel => {
                self.control.mark_open();
                tracing::info!(%label, "control channel open");
                let _ = self.events.send(TransportEvent::ChannelOpen);
            }
            Event::ChannelData(data) if data.id == self.channel => {
                match String::from_utf8(data.data) {
                    Ok(text) => {
                        let _ = self.events.send(TransportEvent::Message(text));
                    }
                    Err(e) => tracing::warn!(error = %e, "non UTF-8 control frame"),
                }
            }
            Event::ChannelClose(id) if id == self.channel => {
                return Err("control channel closed by peer".to_string());
            }
            Event::MediaData(media) if media.mid == self.mid => {
                match self.codec.decode(&media.data) {
                    Ok(pcm) => self.sink.play(&pcm),
                    Err(e) => tracing::debug!(error = %e, "dropping remote audio packet"),
                }
                if self.last_media.replace(Instant::now()).is_none() {
                    let _ = self.playback.send(PlaybackSignal::Started);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn receive(&mut self, source: SocketAddr, datagram: &[u8]) {
        let receive = match Receive::new(Protocol::Udp, source, self.local_addr, datagram) {
            Ok(receive) => receive,
            Err(e) => {
                tracing::trace!(error = %e, "ignoring datagram");
                return;
            }
        };
        if let Err(e) = self.rtc.handle_input(Input::Receive(Instant::now(), receive)) {
            tracing::debug!(error = %e, "failed to handle datagram");
        }
    }

    fn write_frame(&mut self, frame: &str) {
        let Some(mut channel) = self.rtc.channel(self.channel) else {
            tracing::warn!("control channel unavailable, dropping frame");
            return;
        };
        if let Err(e) = channel.write(false, frame.as_bytes()) {
            tracing::warn!(error = %e, "control channel write failed");
        }
    }

    fn write_audio(&mut self, pcm: Vec<i16>) {
        self.capture_buffer.extend_from_slice(&pcm);
        while self.capture_buffer.len() >= FRAME_SAMPLES {
            let frame: Vec<i16> = self.capture_buffer.drain(..FRAME_SAMPLES).collect();
            let packet = match self.codec.encode(&frame) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!(error = %e, "dropping captured frame");
                    continue;
                }
            };

            // RTP time runs at the negotiated clock rate, not the capture rate.
            let clock_hz = u64::from(self.clock_rate.get());
            let ticks = FRAME_SAMPLES as u64 * clock_hz / u64::from(SAMPLE_RATE);
            let rtp_time = MediaTime::new(self.rtp_offset, self.clock_rate);
            self.rtp_offset += ticks;

            let Some(writer) = self.rtc.writer(self.mid) else {
                tracing::warn!("audio track unavailable");
                return;
            };
            if let Err(e) = writer.write(self.pt, Instant::now(), rtp_time, packet) {
                tracing::debug!(error = %e, "audio track write failed");
            }
        }
    }

    fn next_wake(&self, deadline: Instant) -> Duration {
        let now = Instant::now();
        let mut wait = deadline.saturating_duration_since(now);
        if let Some(last) = self.last_media {
            let idle_at = last + self.playback_idle;
            wait = wait.min(idle_at.saturating_duration_since(now));
        }
        wait
    }

    fn check_playback_idle(&mut self) {
        if self.last_media.is_some_and(|last| last.elapsed() >= self.playback_idle) {
            self.pause_playback();
        }
    }

    fn pause_playback(&mut self) {
        if self.last_media.take().is_some() {
            let _ = self.playback.send(PlaybackSignal::Paused);
        }
    }
}

async fn next_capture(audio: &mut Option<LocalAudio>) -> Option<Vec<i16>> {
    match audio {
        Some(audio) => audio.next_frame().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_has_audio_and_data_channel() {
        let mut rtc = Rtc::new(Instant::now());
        let offer = create_offer(&mut rtc, "oai-events").unwrap();
        assert!(offer.sdp.contains("m=audio"), "missing audio line:\n{}", offer.sdp);
        assert!(offer.sdp.contains("webrtc-datachannel"), "missing data channel:\n{}", offer.sdp);
    }

    #[test]
    fn test_opus_roundtrip_preserves_frame_length() {
        let mut codec = OpusCodec::new(SAMPLE_RATE).unwrap();
        let pcm: Vec<i16> =
            (0..FRAME_SAMPLES).map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16).collect();
        let packet = codec.encode(&pcm).unwrap();
        assert!(!packet.is_empty());
        assert_eq!(codec.decode(&packet).unwrap().len(), FRAME_SAMPLES);
    }

    #[test]
    fn test_opus_rejects_unsupported_rate() {
        assert!(OpusCodec::new(44_100).is_err());
    }

    #[tokio::test]
    async fn test_data_channel_rejects_writes_until_open() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = DataChannel::new(tx);
        assert!(!channel.is_open());

        let err = channel.send("early".to_string()).await.unwrap_err();
        assert!(matches!(err, VoiceError::ChannelNotReady));
        assert!(rx.try_recv().is_err());

        channel.mark_open();
        assert!(channel.is_open());
        channel.send("hello".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_data_channel_rejects_writes_after_close() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = DataChannel::new(tx);
        channel.mark_open();
        channel.close().await;

        assert!(!channel.is_open());
        let err = channel.send("late".to_string()).await.unwrap_err();
        assert!(matches!(err, VoiceError::ChannelNotReady));
    }
}
