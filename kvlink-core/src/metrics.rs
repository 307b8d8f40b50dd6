use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};
use std::sync::OnceLock;

pub(crate) struct CoreMetrics {
    pub pool_used_bytes: UpDownCounter<i64>,
    pub pool_capacity_bytes: UpDownCounter<i64>,
    pub pool_largest_free_bytes: UpDownCounter<i64>,
    pub pool_alloc_failures: Counter<u64>,

    pub registered_bytes: UpDownCounter<i64>,
    pub registered_regions: UpDownCounter<i64>,

    pub client_channels: UpDownCounter<i64>,
    pub server_channels: UpDownCounter<i64>,
    pub heartbeat_expirations: Counter<u64>,

    pub transfer_bytes: Counter<u64>,
    pub transfer_ops: Counter<u64>,
    pub transfer_duration_ms: Histogram<f64>,
    pub transfer_failures: Counter<u64>,

    pub server_requests: Counter<u64>,
    pub server_rejections: Counter<u64>,

    pub block_transfers: Counter<u64>,
}

fn init_meter() -> Meter {
    global::meter("kvlink-core")
}

pub(crate) fn core_metrics() -> &'static CoreMetrics {
    static METRICS: OnceLock<CoreMetrics> = OnceLock::new();
    METRICS.get_or_init(|| {
        let meter = init_meter();

        CoreMetrics {
            pool_used_bytes: meter
                .i64_up_down_counter("kvlink_pool_used_bytes")
                .with_unit("bytes")
                .with_description("Current host pool usage in bytes")
                .build(),
            pool_capacity_bytes: meter
                .i64_up_down_counter("kvlink_pool_capacity_bytes")
                .with_unit("bytes")
                .with_description("Total host pool capacity in bytes")
                .build(),
            pool_largest_free_bytes: meter
                .i64_up_down_counter("kvlink_pool_largest_free_bytes")
                .with_unit("bytes")
                .with_description("Largest contiguous free region in the host pool")
                .build(),
            pool_alloc_failures: meter
                .u64_counter("kvlink_pool_alloc_failures_total")
                .with_description("Host pool allocations that could not be satisfied")
                .build(),

            registered_bytes: meter
                .i64_up_down_counter("kvlink_registered_bytes")
                .with_unit("bytes")
                .with_description("Bytes of memory registered for remote access")
                .build(),
            registered_regions: meter
                .i64_up_down_counter("kvlink_registered_regions")
                .with_description("Number of registered memory regions")
                .build(),

            client_channels: meter
                .i64_up_down_counter("kvlink_client_channels")
                .with_description("Open outgoing channels to remote engines")
                .build(),
            server_channels: meter
                .i64_up_down_counter("kvlink_server_channels")
                .with_description("Open incoming channels from remote engines")
                .build(),
            heartbeat_expirations: meter
                .u64_counter("kvlink_heartbeat_expirations_total")
                .with_description("Incoming channels closed for missing heartbeats")
                .build(),

            transfer_bytes: meter
                .u64_counter("kvlink_transfer_bytes_total")
                .with_unit("bytes")
                .with_description("Bytes moved by completed transfers")
                .build(),
            transfer_ops: meter
                .u64_counter("kvlink_transfer_ops_total")
                .with_description("Transfer op descriptors executed")
                .build(),
            transfer_duration_ms: meter
                .f64_histogram("kvlink_transfer_duration_ms")
                .with_unit("ms")
                .with_description("Synchronous transfer latency in milliseconds")
                .build(),
            transfer_failures: meter
                .u64_counter("kvlink_transfer_failures_total")
                .with_description("Transfers that returned an error")
                .build(),

            server_requests: meter
                .u64_counter("kvlink_server_requests_total")
                .with_description("Messages handled by the engine listener")
                .build(),
            server_rejections: meter
                .u64_counter("kvlink_server_rejections_total")
                .with_description("Transfer requests rejected by address validation")
                .build(),

            block_transfers: meter
                .u64_counter("kvlink_block_transfers_total")
                .with_description("Cache blocks pushed or pulled")
                .build(),
        }
    })
}
