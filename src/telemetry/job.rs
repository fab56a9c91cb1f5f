//! Delivery span helpers.
//!
//! One span per delivery, covering decode, handler call and the retry
//! decision. The `job.verdict` and `job.outcome` fields are filled in as
//! the worker learns them.

use tracing::Span;

/// Start a span for processing one delivery from `queue`.
pub fn start_delivery_span(queue: &str) -> Span {
    tracing::info_span!(
        "job.delivery",
        "job.queue" = queue,
        "job.envelope_id" = tracing::field::Empty,
        "job.attempts" = tracing::field::Empty,
        "job.verdict" = tracing::field::Empty,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record the decoded envelope's identity on the span.
pub fn record_envelope(span: &Span, envelope_id: &str, attempts: u32) {
    span.record("job.envelope_id", envelope_id);
    span.record("job.attempts", attempts);
}

/// Record what the handler said.
pub fn record_verdict(span: &Span, verdict: &str) {
    span.record("job.verdict", verdict);
}

/// Record what the runtime did about it ("acked", "retry", "dead_lettered", "discarded").
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("job.outcome", outcome);
}
