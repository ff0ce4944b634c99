//! SDP offer/answer exchange with the session-negotiation endpoint.
//!
//! The local offer is POSTed as `application/sdp`, authenticated with the
//! short-lived credential, and the response body is the remote answer.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::config::VoiceAgentConfig;
use crate::error::{Result, VoiceError};

/// JSON envelope some deployments wrap the answer in.
#[derive(Debug, serde::Deserialize)]
struct SdpAnswerEnvelope {
    sdp: String,
}

/// HTTP client for the negotiation endpoint.
#[derive(Debug, Clone)]
pub struct SdpSignaling {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

impl SdpSignaling {
    /// Create a client for `negotiation_url`, adding `?model=` when a model
    /// is given.
    pub fn new(negotiation_url: &str, model: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut endpoint = Url::parse(negotiation_url).map_err(|e| {
            VoiceError::config(format!("Invalid negotiation URL '{negotiation_url}': {e}"))
        })?;
        if let Some(model) = model {
            endpoint.query_pairs_mut().append_pair("model", model);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::negotiation(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, endpoint, timeout })
    }

    /// Create a client from the agent configuration.
    pub fn from_config(config: &VoiceAgentConfig) -> Result<Self> {
        Self::new(&config.negotiation_url, config.model.as_deref(), config.negotiation_timeout)
    }

    /// The URL offers are posted to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Exchange `offer_sdp` for the remote answer.
    ///
    /// A non-2xx status is reported with the response body verbatim. A 2xx
    /// body that is not an SDP document is a malformed answer.
    pub async fn exchange(&self, credential: &SecretString, offer_sdp: &str) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(credential.expose_secret())
            .header(reqwest::header::CONTENT_TYPE, "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VoiceError::negotiation(format!(
                        "SDP exchange timed out after {:?}",
                        self.timeout
                    ))
                } else {
                    VoiceError::negotiation(format!("SDP exchange request failed: {e}"))
                }
            })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.map_err(|e| {
            VoiceError::negotiation(format!("Failed to read SDP answer body: {e}"))
        })?;

        if !status.is_success() {
            return Err(VoiceError::negotiation(format!(
                "SDP exchange failed with status {status}: {body}"
            )));
        }

        let answer = if content_type.contains("application/json") {
            serde_json::from_str::<SdpAnswerEnvelope>(&body)
                .map(|envelope| envelope.sdp)
                .map_err(|e| VoiceError::negotiation(format!("Malformed SDP answer JSON: {e}")))?
        } else {
            body
        };

        if !answer.trim_start().starts_with("v=") {
            return Err(VoiceError::negotiation("Malformed SDP answer: missing 'v=' line"));
        }

        tracing::debug!(answer_len = answer.len(), "received SDP answer");
        Ok(answer)
    }
}
