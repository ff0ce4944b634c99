//! Function-call bridge.
//!
//! The server streams a function call as argument fragments keyed by call id,
//! optionally announces the tool name in a separate item event, and finally
//! marks the call complete. [`FunctionCallBridge`] accumulates that state;
//! [`resolve_call`] turns a completed call into exactly one result string,
//! whether the tool succeeded or not.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::error::{Result, VoiceError};

/// A function call whose arguments are still arriving.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingFunctionCall {
    /// Server-assigned call id.
    pub call_id: String,
    /// Tool name, once known.
    pub name: Option<String>,
    /// Concatenated argument fragments.
    pub arguments: String,
    /// Set once the call has been handed to the tool executor.
    pub in_flight: bool,
}

/// A parsed call handed to a [`ToolExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Server-assigned call id.
    pub call_id: String,
    /// Tool name.
    pub name: String,
    /// Parsed arguments.
    pub arguments: Value,
}

/// A completed call as reported by the server, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyCall {
    /// Server-assigned call id.
    pub call_id: String,
    /// Tool name, if any event carried one.
    pub name: Option<String>,
    /// Raw argument text.
    pub arguments: String,
}

impl ReadyCall {
    /// Validate the name and parse the arguments.
    pub fn parse(&self) -> Result<FunctionCall> {
        let name = self
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| VoiceError::tool("missing function name"))?;
        let arguments = serde_json::from_str(&self.arguments)
            .map_err(|e| VoiceError::tool(format!("invalid function arguments: {e}")))?;
        Ok(FunctionCall { call_id: self.call_id.clone(), name, arguments })
    }
}

/// Pending function calls for one session, keyed by call id.
///
/// Ids whose result was submitted are remembered for the rest of the
/// session; events that mention them again are ignored.
#[derive(Debug, Default)]
pub struct FunctionCallBridge {
    pending: HashMap<String, PendingFunctionCall>,
    finished: HashSet<String>,
}

impl FunctionCallBridge {
    /// Create an empty bridge.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, call_id: &str) -> &mut PendingFunctionCall {
        self.pending.entry(call_id.to_string()).or_insert_with(|| PendingFunctionCall {
            call_id: call_id.to_string(),
            ..Default::default()
        })
    }

    /// Append an argument fragment, creating the call if needed. Returns
    /// `false` if the call already finished.
    pub fn append_arguments(&mut self, call_id: &str, delta: &str) -> bool {
        if self.is_finished(call_id) {
            return false;
        }
        self.entry(call_id).arguments.push_str(delta);
        true
    }

    /// Record (or overwrite) the tool name, creating the call if needed.
    /// Returns `false` if the call already finished.
    pub fn record_name(&mut self, call_id: &str, name: &str) -> bool {
        if self.is_finished(call_id) {
            return false;
        }
        self.entry(call_id).name = Some(name.to_string());
        true
    }

    /// Mark a call complete and return it for execution.
    ///
    /// `name` and `arguments` from the completion event take precedence over
    /// what was accumulated. Returns `None` if the call is already in flight
    /// or finished.
    pub fn complete(
        &mut self,
        call_id: &str,
        name: Option<String>,
        arguments: Option<String>,
    ) -> Option<ReadyCall> {
        if self.is_finished(call_id) {
            return None;
        }
        let pending = self.entry(call_id);
        if pending.in_flight {
            return None;
        }
        pending.in_flight = true;
        if let Some(name) = name {
            pending.name = Some(name);
        }
        if let Some(arguments) = arguments {
            pending.arguments = arguments;
        }
        Some(ReadyCall {
            call_id: call_id.to_string(),
            name: pending.name.clone(),
            arguments: pending.arguments.clone(),
        })
    }

    /// Remove a call after its result was submitted. Returns whether the call
    /// was still pending.
    pub fn finish(&mut self, call_id: &str) -> bool {
        let removed = self.pending.remove(call_id).is_some();
        if removed {
            self.finished.insert(call_id.to_string());
        }
        removed
    }

    /// Whether a result for `call_id` was already submitted.
    pub fn is_finished(&self, call_id: &str) -> bool {
        self.finished.contains(call_id)
    }

    /// Look up a pending call.
    pub fn get(&self, call_id: &str) -> Option<&PendingFunctionCall> {
        self.pending.get(call_id)
    }

    /// Number of pending calls.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no call is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending call and forget finished ids.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.finished.clear();
    }
}

/// The external capability that runs tools on behalf of the model.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run the tool and return its result, passed to the model untouched.
    async fn execute(&self, call: &FunctionCall) -> Result<String>;
}

/// A [`ToolExecutor`] backed by an async closure.
pub struct FnToolExecutor<F> {
    handler: F,
}

impl<F> FnToolExecutor<F> {
    /// Wrap `handler`.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F, Fut> ToolExecutor for FnToolExecutor<F>
where
    F: Fn(FunctionCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    async fn execute(&self, call: &FunctionCall) -> Result<String> {
        (self.handler)(call.clone()).await
    }
}

/// The result string submitted for a call that could not be executed.
pub fn failure_result(message: impl AsRef<str>) -> String {
    serde_json::json!({ "success": false, "error": message.as_ref() }).to_string()
}

/// Produce the result string for a completed call.
///
/// Never fails: parse errors, a missing executor, executor errors and
/// timeouts all become a [`failure_result`].
pub async fn resolve_call(
    executor: Option<Arc<dyn ToolExecutor>>,
    ready: ReadyCall,
    timeout: Duration,
) -> String {
    let span = aria_telemetry::tool_call_span(
        ready.name.as_deref().unwrap_or("unknown"),
        &ready.call_id,
    );
    async move {
        let call = match ready.parse() {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(call.id = %ready.call_id, error = %e, "rejecting function call");
                return failure_result(tool_message(&e));
            }
        };

        let Some(executor) = executor else {
            tracing::warn!(tool.name = %call.name, "no tool executor registered");
            return failure_result("tool execution unavailable");
        };

        match tokio::time::timeout(timeout, executor.execute(&call)).await {
            Ok(Ok(output)) => {
                tracing::debug!(tool.name = %call.name, bytes = output.len(), "tool completed");
                output
            }
            Ok(Err(e)) => {
                tracing::warn!(tool.name = %call.name, error = %e, "tool failed");
                failure_result(tool_message(&e))
            }
            Err(_) => {
                tracing::warn!(tool.name = %call.name, ?timeout, "tool timed out");
                failure_result(format!("tool '{}' timed out after {timeout:?}", call.name))
            }
        }
    }
    .instrument(span)
    .await
}

fn tool_message(err: &VoiceError) -> String {
    match err {
        VoiceError::Tool(msg) => msg.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragments_accumulate_in_order() {
        let mut bridge = FunctionCallBridge::new();
        bridge.append_arguments("c1", "{\"loc");
        bridge.append_arguments("c1", "ation\":\"Paris\"}");
        bridge.record_name("c1", "get_weather");

        let ready = bridge.complete("c1", None, None).unwrap();
        assert_eq!(ready.arguments, "{\"location\":\"Paris\"}");
        assert_eq!(ready.name.as_deref(), Some("get_weather"));
    }

    #[test]
    fn test_done_arguments_are_authoritative() {
        let mut bridge = FunctionCallBridge::new();
        bridge.append_arguments("c1", "{\"partial");
        let ready = bridge.complete("c1", Some("t".into()), Some("{}".into())).unwrap();
        assert_eq!(ready.arguments, "{}");
    }

    #[test]
    fn test_duplicate_completion_is_ignored() {
        let mut bridge = FunctionCallBridge::new();
        assert!(bridge.complete("c1", Some("t".into()), Some("{}".into())).is_some());
        assert!(bridge.complete("c1", Some("t".into()), Some("{}".into())).is_none());
        assert!(bridge.finish("c1"));
        assert!(!bridge.finish("c1"));
    }

    #[test]
    fn test_finished_call_ignores_replayed_events() {
        let mut bridge = FunctionCallBridge::new();
        assert!(bridge.complete("c1", Some("t".into()), Some("{}".into())).is_some());
        assert!(bridge.finish("c1"));

        assert!(bridge.complete("c1", Some("t".into()), Some("{}".into())).is_none());
        assert!(!bridge.append_arguments("c1", "{\"late\":1}"));
        assert!(!bridge.record_name("c1", "t"));
        assert!(bridge.is_empty());
        assert!(bridge.is_finished("c1"));
    }

    #[test]
    fn test_name_recorded_after_arguments_is_kept() {
        let mut bridge = FunctionCallBridge::new();
        bridge.append_arguments("c1", "{}");
        bridge.record_name("c1", "first");
        bridge.record_name("c1", "second");
        assert_eq!(bridge.get("c1").unwrap().name.as_deref(), Some("second"));
        assert_eq!(bridge.len(), 1);
    }

    #[test]
    fn test_parse_requires_name() {
        let ready = ReadyCall { call_id: "c".into(), name: None, arguments: "{}".into() };
        let err = ready.parse().unwrap_err();
        assert_eq!(tool_message(&err), "missing function name");
    }

    #[test]
    fn test_failure_result_shape() {
        let value: Value = serde_json::from_str(&failure_result("boom")).unwrap();
        assert_eq!(value, serde_json::json!({"success": false, "error": "boom"}));
    }
}
