//! Metrics for the invalidation pipeline.
//!
//! Recorded through the `metrics` facade; no exporter is installed here.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Jobs published.
    pub const PUBLISHED_TOTAL: &str = "inkflow_invalidation_published_total";
    /// Jobs skipped because the channel was not ready.
    pub const PUBLISH_SKIPPED_TOTAL: &str = "inkflow_invalidation_publish_skipped_total";
    /// Jobs whose publish failed or timed out.
    pub const PUBLISH_FAILED_TOTAL: &str = "inkflow_invalidation_publish_failed_total";

    /// Deliveries handled, by outcome.
    pub const JOBS_TOTAL: &str = "inkflow_invalidation_jobs_total";
    /// Deliveries that were redelivered.
    pub const REDELIVERED_TOTAL: &str = "inkflow_invalidation_redelivered_total";
    /// Cache keys deleted.
    pub const KEYS_DELETED_TOTAL: &str = "inkflow_invalidation_keys_deleted_total";
    /// Cache entries rebuilt.
    pub const REBUILT_TOTAL: &str = "inkflow_invalidation_rebuilt_total";
    /// Failed rebuilds.
    pub const REBUILD_FAILURES_TOTAL: &str = "inkflow_invalidation_rebuild_failures_total";
    /// Job handling duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "inkflow_invalidation_job_duration_seconds";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::PUBLISHED_TOTAL, "Total invalidation jobs published");
    describe_counter!(
        names::PUBLISH_SKIPPED_TOTAL,
        "Total invalidation jobs skipped because the broker channel was not ready"
    );
    describe_counter!(
        names::PUBLISH_FAILED_TOTAL,
        "Total invalidation jobs whose publish failed"
    );
    describe_counter!(names::JOBS_TOTAL, "Total invalidation deliveries handled");
    describe_counter!(names::REDELIVERED_TOTAL, "Total redelivered invalidation jobs");
    describe_counter!(names::KEYS_DELETED_TOTAL, "Total cache keys deleted by invalidation");
    describe_counter!(names::REBUILT_TOTAL, "Total cache entries rebuilt after invalidation");
    describe_counter!(names::REBUILD_FAILURES_TOTAL, "Total failed cache rebuilds");
    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Invalidation job handling duration in seconds"
    );
}

/// Publisher-side recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a published job.
    pub fn published(queue: &str) {
        counter!(names::PUBLISHED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a job skipped while disconnected.
    pub fn skipped(queue: &str) {
        counter!(names::PUBLISH_SKIPPED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a failed publish.
    pub fn failed(queue: &str) {
        counter!(names::PUBLISH_FAILED_TOTAL, "queue" => queue.to_string()).increment(1);
    }
}

/// Consumer-side recorder.
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record a handled delivery.
    pub fn job_handled(queue: &str, outcome: &'static str, redelivered: bool, duration: Duration) {
        counter!(names::JOBS_TOTAL, "queue" => queue.to_string(), "outcome" => outcome).increment(1);
        if redelivered {
            counter!(names::REDELIVERED_TOTAL, "queue" => queue.to_string()).increment(1);
        }
        histogram!(names::JOB_DURATION_SECONDS, "queue" => queue.to_string(), "outcome" => outcome)
            .record(duration.as_secs_f64());
    }

    /// Record the effect of a processed job.
    pub fn job_processed(keys_deleted: u64, rebuilt: usize, rebuild_failures: usize) {
        counter!(names::KEYS_DELETED_TOTAL).increment(keys_deleted);
        counter!(names::REBUILT_TOTAL).increment(rebuilt as u64);
        counter!(names::REBUILD_FAILURES_TOTAL).increment(rebuild_failures as u64);
    }
}
