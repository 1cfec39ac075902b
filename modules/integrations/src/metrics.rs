use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Integration engine metrics.
///
/// The registry is owned by this struct and the handle is passed where it is
/// needed; nothing registers into a process-wide default.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub sync_records_total: IntCounterVec,
    pub sync_runs_total: IntCounterVec,
    pub webhook_events_total: IntCounterVec,
    pub spool_flush_total: IntCounterVec,
    pub write_jobs_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let sync_records_total = IntCounterVec::new(
            Opts::new("integrations_sync_records_total", "Records processed by sync runs"),
            &["record_type", "outcome"], // created|updated|deleted|unchanged|skipped|failed
        )
        .expect("metric");

        let sync_runs_total = IntCounterVec::new(
            Opts::new("integrations_sync_runs_total", "Sync runs by terminal result"),
            &["system", "result"], // completed|failed
        )
        .expect("metric");

        let webhook_events_total = IntCounterVec::new(
            Opts::new("integrations_webhook_events_total", "Inbound gateway events by outcome"),
            &["gateway", "outcome"], // enqueued|duplicate|env_mismatch|orphaned|ignored|rejected
        )
        .expect("metric");

        let spool_flush_total = IntCounterVec::new(
            Opts::new("integrations_spool_flush_total", "Write spool flushes"),
            &["trigger"], // threshold|explicit|drop
        )
        .expect("metric");

        let write_jobs_total = IntCounterVec::new(
            Opts::new("integrations_write_jobs_total", "Outbound write jobs by result"),
            &["system", "result"], // written|skipped|failed
        )
        .expect("metric");

        for collector in [
            &sync_records_total,
            &sync_runs_total,
            &webhook_events_total,
            &spool_flush_total,
            &write_jobs_total,
        ] {
            registry
                .register(Box::new(collector.clone()))
                .expect("register metric");
        }

        Self {
            registry,
            sync_records_total,
            sync_runs_total,
            webhook_events_total,
            spool_flush_total,
            write_jobs_total,
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = Metrics::new();
        metrics
            .webhook_events_total
            .with_label_values(&["tilled", "duplicate"])
            .inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("integrations_webhook_events_total"));
    }
}
