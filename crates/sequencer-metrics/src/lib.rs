//! Metric handles exposed by the core (§1a, §6a `metricsNamespace`). The
//! core only ever increments/observes these; wiring a scrape endpoint or an
//! alerting transport belongs to the out-of-scope HTTP surface.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

/// One handle per metric the testable-properties section (§8) and the
/// admission backpressure scenario (§8 scenario 6) need visibility into.
pub struct SequencerMetrics {
    pub admissions_total: IntCounterVec,
    pub rejections_total: IntCounterVec,
    pub batches_committed_total: IntCounterVec,
    pub batches_failed_total: IntCounterVec,
    pub commit_latency_seconds: HistogramVec,
    pub merkle_append_latency_seconds: HistogramVec,
    pub cache_results_total: IntCounterVec,
    pub raft_term: IntGauge,
    pub raft_role: IntGauge,
    pub worker_pool_queue_depth: IntGauge,
}

impl SequencerMetrics {
    /// Registers every metric under `namespace` into `registry`. Call once
    /// per node at startup; components receive a cheap `Arc<Self>` clone.
    pub fn register(namespace: &str, registry: &Registry) -> prometheus::Result<Self> {
        let admissions_total = IntCounterVec::new(
            Opts::new("admissions_total", "Transactions admitted by priority").namespace(namespace),
            &["priority"],
        )?;
        let rejections_total = IntCounterVec::new(
            Opts::new("rejections_total", "Transactions rejected at admission by reason")
                .namespace(namespace),
            &["reason"],
        )?;
        let batches_committed_total = IntCounterVec::new(
            Opts::new("batches_committed_total", "Batches that reached commit").namespace(namespace),
            &["term"],
        )?;
        let batches_failed_total = IntCounterVec::new(
            Opts::new("batches_failed_total", "Batches abandoned before commit").namespace(namespace),
            &["reason"],
        )?;
        let commit_latency_seconds = HistogramVec::new(
            HistogramOpts::new("commit_latency_seconds", "ReplicationLog.append to quorum ack")
                .namespace(namespace),
            &["outcome"],
        )?;
        let merkle_append_latency_seconds = HistogramVec::new(
            HistogramOpts::new("merkle_append_latency_seconds", "appendBatch wall time by batch size bucket")
                .namespace(namespace),
            &["size_bucket"],
        )?;
        let cache_results_total = IntCounterVec::new(
            Opts::new("cache_results_total", "Cache lookups by tier and outcome").namespace(namespace),
            &["tier", "outcome"],
        )?;
        let raft_term = IntGauge::with_opts(Opts::new("raft_term", "Current Raft term").namespace(namespace))?;
        let raft_role = IntGauge::with_opts(
            Opts::new("raft_role", "0=follower 1=candidate 2=leader").namespace(namespace),
        )?;
        let worker_pool_queue_depth = IntGauge::with_opts(
            Opts::new("worker_pool_queue_depth", "Pending tasks in the worker pool queue").namespace(namespace),
        )?;

        registry.register(Box::new(admissions_total.clone()))?;
        registry.register(Box::new(rejections_total.clone()))?;
        registry.register(Box::new(batches_committed_total.clone()))?;
        registry.register(Box::new(batches_failed_total.clone()))?;
        registry.register(Box::new(commit_latency_seconds.clone()))?;
        registry.register(Box::new(merkle_append_latency_seconds.clone()))?;
        registry.register(Box::new(cache_results_total.clone()))?;
        registry.register(Box::new(raft_term.clone()))?;
        registry.register(Box::new(raft_role.clone()))?;
        registry.register(Box::new(worker_pool_queue_depth.clone()))?;

        Ok(Self {
            admissions_total,
            rejections_total,
            batches_committed_total,
            batches_failed_total,
            commit_latency_seconds,
            merkle_append_latency_seconds,
            cache_results_total,
            raft_term,
            raft_role,
            worker_pool_queue_depth,
        })
    }
}
