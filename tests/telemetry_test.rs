//! Integration tests for telemetry initialization and span helpers.

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    let config = expensio::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "expensio-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = expensio::telemetry::init_telemetry(config);
}

#[test]
fn delivery_span_records_envelope_verdict_and_outcome() {
    let span = expensio::telemetry::job::start_delivery_span("telegram_received_messages");
    expensio::telemetry::job::record_envelope(&span, "1700000000000-abcdefghi", 2);
    expensio::telemetry::job::record_verdict(&span, "error");
    expensio::telemetry::job::record_outcome(&span, "retry");
}

#[test]
fn metric_instruments_build_without_a_provider() {
    use opentelemetry::KeyValue;
    use expensio::telemetry::metrics;

    let queue = [KeyValue::new("queue", "q")];
    metrics::tasks_scheduled().add(
        1,
        &[KeyValue::new("queue", "q"), KeyValue::new("result", "ok")],
    );
    metrics::deliveries().add(1, &queue);
    metrics::retries().add(1, &queue);
    metrics::dead_lettered().add(1, &queue);
    metrics::discarded().add(1, &queue);
    metrics::queue_operations().add(1, &queue);
    metrics::handler_duration_ms().record(1.5, &queue);
}
