use anyhow::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Prometheus metrics for the ingestion pipeline.
///
/// One instance per engine; the registry is exposed for scraping or
/// test inspection.
#[derive(Clone)]
pub struct IngestMetrics {
    pub registry: Registry,
    pub notifications_received: IntCounter,
    pub precheck_drops: IntCounterVec,
    pub jobs_enqueued: IntCounter,
    pub dedup_hits: IntCounter,
    pub swaps_classified: IntCounter,
    pub splits_classified: IntCounter,
    pub rejections: IntCounterVec,
    pub records_persisted: IntCounter,
    pub duplicates_skipped: IntCounter,
    pub fanout_drops: IntCounter,
    pub queue_depth: IntGauge,
    pub tracked_accounts: IntGauge,
    pub reconnects: IntCounter,
    pub job_seconds: Histogram,
}

impl IngestMetrics {
    pub fn new(pipeline: &str) -> Result<Self> {
        let registry = Registry::new();

        let notifications_received = IntCounter::with_opts(
            Opts::new("notifications_received_total", "Transaction notifications received")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline),
        )?;
        let precheck_drops = IntCounterVec::new(
            Opts::new("precheck_drops_total", "Notifications dropped before enqueue")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline),
            &["reason"],
        )?;
        let jobs_enqueued = IntCounter::with_opts(
            Opts::new("jobs_enqueued_total", "Jobs accepted by the dedup layer")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline),
        )?;
        let dedup_hits = IntCounter::with_opts(
            Opts::new("dedup_hits_total", "Duplicate (signature, account) pairs short-circuited")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline),
        )?;
        let swaps_classified = IntCounter::with_opts(
            Opts::new("swaps_classified_total", "Single swaps classified")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline),
        )?;
        let splits_classified = IntCounter::with_opts(
            Opts::new("splits_classified_total", "Token-to-token routes split")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline),
        )?;
        let rejections = IntCounterVec::new(
            Opts::new("rejections_total", "Classifier rejections")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline),
            &["reason"],
        )?;
        let records_persisted = IntCounter::with_opts(
            Opts::new("records_persisted_total", "Trade records written")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline),
        )?;
        let duplicates_skipped = IntCounter::with_opts(
            Opts::new("duplicates_skipped_total", "Jobs skipped as already processed")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline),
        )?;
        let fanout_drops = IntCounter::with_opts(
            Opts::new("fanout_drops_total", "Fan-out events dropped on full channels")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline),
        )?;
        let queue_depth = IntGauge::with_opts(
            Opts::new("queue_depth", "Pending + active jobs")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline),
        )?;
        let tracked_accounts = IntGauge::with_opts(
            Opts::new("tracked_accounts", "Addresses in the subscription snapshot")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline),
        )?;
        let reconnects = IntCounter::with_opts(
            Opts::new("ws_reconnects_total", "Websocket reconnect attempts")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline),
        )?;
        let job_seconds = Histogram::with_opts(
            HistogramOpts::new("job_seconds", "Per-job processing time")
                .namespace("whaletrace")
                .const_label("pipeline", pipeline)
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        registry.register(Box::new(notifications_received.clone()))?;
        registry.register(Box::new(precheck_drops.clone()))?;
        registry.register(Box::new(jobs_enqueued.clone()))?;
        registry.register(Box::new(dedup_hits.clone()))?;
        registry.register(Box::new(swaps_classified.clone()))?;
        registry.register(Box::new(splits_classified.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(records_persisted.clone()))?;
        registry.register(Box::new(duplicates_skipped.clone()))?;
        registry.register(Box::new(fanout_drops.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(tracked_accounts.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(job_seconds.clone()))?;

        Ok(Self {
            registry,
            notifications_received,
            precheck_drops,
            jobs_enqueued,
            dedup_hits,
            swaps_classified,
            splits_classified,
            rejections,
            records_persisted,
            duplicates_skipped,
            fanout_drops,
            queue_depth,
            tracked_accounts,
            reconnects,
            job_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_count() {
        let metrics = IngestMetrics::new("whale").expect("metrics");
        metrics.notifications_received.inc();
        metrics.rejections.with_label_values(&["no_swapper"]).inc();
        metrics.rejections.with_label_values(&["no_swapper"]).inc();
        metrics.queue_depth.set(7);

        assert_eq!(metrics.notifications_received.get(), 1);
        assert_eq!(metrics.rejections.with_label_values(&["no_swapper"]).get(), 2);
        assert_eq!(metrics.queue_depth.get(), 7);
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_two_pipelines_do_not_collide() {
        let whale = IngestMetrics::new("whale").expect("whale metrics");
        let kol = IngestMetrics::new("kol").expect("kol metrics");
        whale.records_persisted.inc();
        assert_eq!(kol.records_persisted.get(), 0);
    }
}
