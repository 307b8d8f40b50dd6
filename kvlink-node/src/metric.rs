use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{KeyValue, global};
use std::sync::LazyLock;
use std::time::Instant;

struct PhaseMetrics {
    phase_count: Counter<u64>,
    phase_duration: Histogram<f64>,
}

impl PhaseMetrics {
    fn new() -> Self {
        let meter = global::meter("kvlink_node");
        let phase_count = meter
            .u64_counter("kvlink_node_phases")
            .with_description("Sample flow phases run by this node")
            .build();
        let phase_duration = meter
            .f64_histogram("kvlink_node_phase_duration")
            .with_description("Sample flow phase latency in seconds")
            .with_unit("s")
            .with_boundaries(
                [
                    0.001, // 1ms
                    0.005, // 5ms
                    0.01,  // 10ms
                    0.05,  // 50ms
                    0.1,   // 100ms
                    0.5,   // 500ms
                    1.0,   // 1s
                    5.0,   // 5s
                    30.0,  // 30s
                ]
                .into(),
            )
            .build();

        Self {
            phase_count,
            phase_duration,
        }
    }

    fn record(&self, phase: &'static str, status: &'static str, duration: f64) {
        let labels = [
            KeyValue::new("phase", phase),
            KeyValue::new("status", status),
        ];
        self.phase_count.add(1, &labels);
        self.phase_duration.record(duration, &labels);
    }
}

static PHASE_METRICS: LazyLock<PhaseMetrics> = LazyLock::new(PhaseMetrics::new);

pub fn record_phase<T, E>(phase: &'static str, result: &Result<T, E>, start: Instant) {
    let status = if result.is_ok() { "ok" } else { "error" };
    PHASE_METRICS.record(phase, status, start.elapsed().as_secs_f64());
}
