//! # Voice Console Example
//!
//! Connects a [`VoiceAgent`] over WebRTC, prints state changes and
//! transcripts, and forwards every line typed on stdin as a text turn.
//!
//! The microphone is simulated with silence, so the conversation is driven by
//! typed text. Remote audio is decoded and discarded.
//!
//! ## Prerequisites
//!
//! 1. A short-lived realtime credential minted by your backend.
//! 2. `cmake` installed (required by `audiopus` to build Opus from source).
//!
//! ## Environment Variables
//!
//! | Variable              | Required | Description                           |
//! |-----------------------|----------|---------------------------------------|
//! | `ARIA_EPHEMERAL_KEY`  | **Yes**  | Short-lived credential for the session|
//! | `ARIA_REALTIME_URL`   | No       | Negotiation endpoint override         |
//! | `ARIA_REALTIME_MODEL` | No       | Model appended as `?model=`           |
//!
//! ## Running
//!
//! ```sh
//! cargo run -p aria-realtime --example voice_console --features webrtc
//! ```
//!
//! Type a message and press enter. `/quit` disconnects.

use std::sync::Arc;
use std::time::Duration;

use aria_realtime::transport::webrtc::WebRtcConnector;
use aria_realtime::transport::{ChannelCapture, FRAME_SAMPLES, NullSink};
use aria_realtime::{
    AgentObserver, AgentState, FnToolExecutor, FunctionCall, Role, TranscriptEvent, VoiceAgent,
    VoiceAgentConfig, VoiceError,
};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

struct ConsoleObserver;

#[async_trait]
impl AgentObserver for ConsoleObserver {
    async fn on_state_change(&self, previous: AgentState, current: AgentState) {
        println!("[state] {previous} -> {current}");
    }

    async fn on_transcript(&self, transcript: &TranscriptEvent) {
        let who = match transcript.role {
            Role::User => "you",
            Role::Assistant => "agent",
        };
        println!("{who}: {}", transcript.text);
    }

    async fn on_error(&self, error: &VoiceError) {
        eprintln!("[error] {error}");
    }

    async fn on_disconnected(&self) {
        println!("[disconnected]");
    }
}

async fn handle_tool(call: FunctionCall) -> Result<String, VoiceError> {
    match call.name.as_str() {
        "get_time" => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_err(|e| VoiceError::tool(e.to_string()))?;
            Ok(serde_json::json!({ "success": true, "unix_seconds": now.as_secs() }).to_string())
        }
        other => Err(VoiceError::tool(format!("unknown tool '{other}'"))),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    aria_telemetry::init_telemetry("voice-console")?;

    let credential = std::env::var("ARIA_EPHEMERAL_KEY").expect("ARIA_EPHEMERAL_KEY env var is required");

    let capture = Arc::new(ChannelCapture::new());
    let agent = VoiceAgent::builder()
        .config(VoiceAgentConfig::from_env()?)
        .capture(capture.clone())
        .connector(Arc::new(WebRtcConnector::new(Arc::new(NullSink))))
        .tool_executor(Arc::new(FnToolExecutor::new(handle_tool)))
        .observer(Arc::new(ConsoleObserver))
        .build()?;

    // Silent microphone: one 20 ms frame per tick.
    let mic = capture.clone();
    let silence = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        loop {
            ticker.tick().await;
            mic.push(vec![0; FRAME_SAMPLES]);
        }
    });

    println!("Connecting...");
    agent.connect(credential).await?;
    println!("Connected, session {}", agent.session_id().unwrap_or_default());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "/quit" {
            break;
        }
        if line.is_empty() {
            continue;
        }
        if let Err(e) = agent.send_text(line).await {
            eprintln!("could not send: {e}");
        }
    }

    agent.disconnect().await;
    silence.abort();
    Ok(())
}
