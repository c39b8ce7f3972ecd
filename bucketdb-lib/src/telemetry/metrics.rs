use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::sync::Arc;

pub mod labels {
    pub const BUCKET_TYPE: &str = "bucket_type";
    pub const OPERATION: &str = "operation";
}

pub mod values {
    pub const OP_TAKE: &str = "take";
    pub const OP_TAKE_ELEVATED: &str = "take_elevated";
    pub const OP_TAKE_EXPONENTIAL: &str = "take_exponential";
    pub const OP_PUT: &str = "put";
    pub const OP_GET: &str = "get";
    pub const OP_DEL: &str = "del";
    pub const OP_RESET_ALL: &str = "reset_all";
}

#[derive(Clone)]
pub struct Metrics {
    pub take_requests_total: Counter<u64>,
    pub take_conformant_total: Counter<u64>,
    pub take_rejected_total: Counter<u64>,

    // Elevated rate limits
    pub erl_triggered_total: Counter<u64>,

    // Calls answered from the local skip cache
    pub skip_cache_hits_total: Counter<u64>,

    pub store_errors_total: Counter<u64>,
    pub store_duration_seconds: Histogram<f64>,

    pub wait_retries_total: Counter<u64>,
}

impl Metrics {
    pub fn new(meter: Meter) -> Self {
        Self {
            take_requests_total: meter
                .u64_counter("bucketdb_take_requests_total")
                .with_description("Total number of admission requests")
                .build(),
            take_conformant_total: meter
                .u64_counter("bucketdb_take_conformant_total")
                .with_description("Total number of admitted requests")
                .build(),
            take_rejected_total: meter
                .u64_counter("bucketdb_take_rejected_total")
                .with_description("Total number of rejected requests")
                .build(),

            erl_triggered_total: meter
                .u64_counter("bucketdb_erl_triggered_total")
                .with_description("Total number of elevated rate limit activations")
                .build(),

            skip_cache_hits_total: meter
                .u64_counter("bucketdb_skip_cache_hits_total")
                .with_description("Total number of requests answered without a store round trip")
                .build(),

            store_errors_total: meter
                .u64_counter("bucketdb_store_errors_total")
                .with_description("Total number of failed store calls")
                .build(),
            store_duration_seconds: meter
                .f64_histogram("bucketdb_store_duration_seconds")
                .with_description("Store call duration in seconds")
                .build(),

            wait_retries_total: meter
                .u64_counter("bucketdb_wait_retries_total")
                .with_description("Total number of delayed retries scheduled by wait")
                .build(),
        }
    }

    pub fn record_take(&self, bucket_type: &str, operation: &str, conformant: bool) {
        let attrs = [
            KeyValue::new(labels::BUCKET_TYPE, bucket_type.to_string()),
            KeyValue::new(labels::OPERATION, operation.to_string()),
        ];
        self.take_requests_total.add(1, &attrs);
        if conformant {
            self.take_conformant_total.add(1, &attrs);
        } else {
            self.take_rejected_total.add(1, &attrs);
        }
    }

    pub fn record_erl_triggered(&self, bucket_type: &str) {
        self.erl_triggered_total
            .add(1, &[KeyValue::new(labels::BUCKET_TYPE, bucket_type.to_string())]);
    }

    pub fn record_skip_cache_hit(&self, bucket_type: &str) {
        self.skip_cache_hits_total
            .add(1, &[KeyValue::new(labels::BUCKET_TYPE, bucket_type.to_string())]);
    }

    pub fn record_store_error(&self, operation: &str) {
        self.store_errors_total
            .add(1, &[KeyValue::new(labels::OPERATION, operation.to_string())]);
    }

    pub fn record_store_duration(&self, operation: &str, duration_secs: f64) {
        self.store_duration_seconds
            .record(duration_secs, &[KeyValue::new(labels::OPERATION, operation.to_string())]);
    }

    pub fn record_wait_retry(&self, bucket_type: &str) {
        self.wait_retries_total
            .add(1, &[KeyValue::new(labels::BUCKET_TYPE, bucket_type.to_string())]);
    }
}

pub fn init_metrics() -> Result<(Arc<Metrics>, Registry), Box<dyn std::error::Error + Send + Sync>>
{
    let registry = Registry::default();

    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;

    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();

    global::set_meter_provider(meter_provider);

    let meter = global::meter("bucketdb");
    let metrics = Arc::new(Metrics::new(meter));

    Ok((metrics, registry))
}
