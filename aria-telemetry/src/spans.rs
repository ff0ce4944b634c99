//! Span helpers for realtime voice operations

use tracing::Span;

/// Span covering one realtime session, from negotiation to teardown.
///
/// # Example
/// ```
/// use aria_telemetry::session_span;
/// let span = session_span("5f0c…", "gpt-realtime");
/// let _enter = span.enter();
/// ```
pub fn session_span(session_id: &str, model: &str) -> Span {
    tracing::info_span!(
        "realtime.session",
        session.id = session_id,
        model.name = model,
        otel.kind = "client"
    )
}

/// Span for the SDP offer/answer HTTP exchange.
pub fn negotiation_span(endpoint: &str) -> Span {
    tracing::info_span!("realtime.negotiate", http.url = endpoint, otel.kind = "client")
}

/// Span for one server-issued function call.
pub fn tool_call_span(tool_name: &str, call_id: &str) -> Span {
    tracing::info_span!(
        "tool.call",
        tool.name = tool_name,
        call.id = call_id,
        otel.kind = "internal"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let names: Vec<&str> = [
                session_span("s1", "m"),
                negotiation_span("http://localhost"),
                tool_call_span("get_weather", "call_1"),
            ]
            .iter()
            .filter_map(|span| span.metadata().map(|m| m.name()))
            .collect();
            assert_eq!(names, vec!["realtime.session", "realtime.negotiate", "tool.call"]);
        });
    }
}
