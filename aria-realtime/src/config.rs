//! Configuration types for realtime voice sessions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceError};
use crate::transport::PeerOptions;

/// Default session-negotiation endpoint.
pub const DEFAULT_NEGOTIATION_URL: &str = "https://api.openai.com/v1/realtime";

/// Default realtime model.
pub const DEFAULT_MODEL: &str = "gpt-realtime";

/// Default STUN server.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Label of the control/event data channel.
pub const DEFAULT_CHANNEL_LABEL: &str = "oai-events";

/// A STUN or TURN server used to help the peer transport find a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:host:port`, `turn:host:port`, `turns:host:port`).
    pub urls: Vec<String>,
    /// TURN username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A STUN server without credentials.
    pub fn stun(url: impl Into<String>) -> Self {
        Self { urls: vec![url.into()], username: None, credential: None }
    }
}

/// Configuration for a [`VoiceAgent`](crate::VoiceAgent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceAgentConfig {
    /// Session-negotiation HTTP endpoint that accepts the SDP offer.
    pub negotiation_url: String,

    /// Model appended as `?model=` to the negotiation URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Reachability-assist servers handed to the peer transport.
    pub ice_servers: Vec<IceServer>,

    /// Label of the control data channel.
    pub channel_label: String,

    /// Timeout for the SDP exchange request.
    pub negotiation_timeout: Duration,

    /// Upper bound on a single tool invocation.
    pub tool_timeout: Duration,

    /// How long remote audio may be silent before playback counts as paused.
    pub playback_idle: Duration,
}

impl Default for VoiceAgentConfig {
    fn default() -> Self {
        Self {
            negotiation_url: DEFAULT_NEGOTIATION_URL.to_string(),
            model: Some(DEFAULT_MODEL.to_string()),
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            negotiation_timeout: Duration::from_secs(15),
            tool_timeout: Duration::from_secs(30),
            playback_idle: Duration::from_millis(300),
        }
    }
}

impl VoiceAgentConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from `ARIA_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("ARIA_REALTIME_URL") {
            config.negotiation_url = url;
        }
        if let Some(model) = lookup("ARIA_REALTIME_MODEL") {
            config.model = if model.trim().is_empty() { None } else { Some(model) };
        }
        if let Some(servers) = lookup("ARIA_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(IceServer::stun)
                .collect();
        }
        if let Some(ms) = lookup("ARIA_NEGOTIATION_TIMEOUT_MS") {
            config.negotiation_timeout = parse_millis("ARIA_NEGOTIATION_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("ARIA_TOOL_TIMEOUT_MS") {
            config.tool_timeout = parse_millis("ARIA_TOOL_TIMEOUT_MS", &ms)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the negotiation endpoint.
    pub fn with_negotiation_url(mut self, url: impl Into<String>) -> Self {
        self.negotiation_url = url.into();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Do not send a `model` query parameter.
    pub fn without_model(mut self) -> Self {
        self.model = None;
        self
    }

    /// Replace the ICE server list.
    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Set the negotiation timeout.
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Set the tool invocation timeout.
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Set the playback idle threshold.
    pub fn with_playback_idle(mut self, idle: Duration) -> Self {
        self.playback_idle = idle;
        self
    }

    /// Check the configuration for values the transport cannot work with.
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.negotiation_url).map_err(|e| {
            VoiceError::config(format!("Invalid negotiation URL '{}': {e}", self.negotiation_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(VoiceError::config(format!(
                "Negotiation URL must be http(s), got '{}'",
                url.scheme()
            )));
        }

        if self.ice_servers.iter().all(|server| server.urls.is_empty()) {
            return Err(VoiceError::config("At least one ICE server is required"));
        }
        for url in self.ice_servers.iter().flat_map(|s| s.urls.iter()) {
            if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:"))
            {
                return Err(VoiceError::config(format!("Unsupported ICE server URL '{url}'")));
            }
        }

        if self.channel_label.is_empty() {
            return Err(VoiceError::config("Control channel label cannot be empty"));
        }
        if self.negotiation_timeout.is_zero() || self.tool_timeout.is_zero() {
            return Err(VoiceError::config("Timeouts must be greater than zero"));
        }
        Ok(())
    }

    /// Options handed to the [`PeerConnector`](crate::transport::PeerConnector).
    pub fn peer_options(&self) -> PeerOptions {
        PeerOptions {
            ice_servers: self.ice_servers.clone(),
            channel_label: self.channel_label.clone(),
            playback_idle: self.playback_idle,
        }
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| VoiceError::config(format!("{key} must be milliseconds: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = VoiceAgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.channel_label, "oai-events");
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = VoiceAgentConfig::from_lookup(lookup(&[
            ("ARIA_REALTIME_URL", "http://127.0.0.1:9000/v1/realtime"),
            ("ARIA_REALTIME_MODEL", "gpt-realtime-mini"),
            ("ARIA_ICE_SERVERS", "stun:a.example:3478, stun:b.example:3478"),
            ("ARIA_TOOL_TIMEOUT_MS", "1500"),
        ]))
        .unwrap();

        assert_eq!(config.negotiation_url, "http://127.0.0.1:9000/v1/realtime");
        assert_eq!(config.model.as_deref(), Some("gpt-realtime-mini"));
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].urls[0], "stun:b.example:3478");
        assert_eq!(config.tool_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_from_lookup_rejects_bad_timeout() {
        let err = VoiceAgentConfig::from_lookup(lookup(&[("ARIA_TOOL_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }

    #[test]
    fn test_validate_requires_ice_server() {
        let err = VoiceAgentConfig::default().with_ice_servers(vec![]).validate().unwrap_err();
        assert!(err.to_string().contains("ICE server"));
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let err = VoiceAgentConfig::default()
            .with_negotiation_url("wss://api.example.com/realtime")
            .validate()
            .unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let err = VoiceAgentConfig::default()
            .with_tool_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }
}
