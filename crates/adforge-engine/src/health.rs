use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Per-provider call metrics, reported at the end of a run.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProviderMetrics {
    pub(crate) calls: u64,
    pub(crate) successes: u64,
    pub(crate) failures: u64,
    pub(crate) total_results: u64,
    pub(crate) total_latency: Duration,
    pub(crate) last_error: String,
}

impl ProviderMetrics {
    pub(crate) fn success_rate(&self) -> f64 {
        self.successes as f64 / (self.calls.max(1)) as f64
    }

    pub(crate) fn avg_latency(&self) -> Duration {
        self.total_latency / (self.successes.max(1)) as u32
    }

    pub(crate) fn avg_results(&self) -> f64 {
        self.total_results as f64 / (self.successes.max(1)) as f64
    }
}

#[derive(Default)]
pub(crate) struct HealthMonitor {
    metrics: Mutex<BTreeMap<String, ProviderMetrics>>,
}

impl HealthMonitor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_call(
        &self,
        provider: &str,
        success: bool,
        result_count: usize,
        latency: Duration,
        error: Option<&str>,
    ) {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        let m = metrics.entry(provider.to_string()).or_default();
        m.calls += 1;
        if success {
            m.successes += 1;
            m.total_results += result_count as u64;
            m.total_latency += latency;
        } else {
            m.failures += 1;
            if let Some(error) = error {
                m.last_error = error.chars().take(120).collect();
            }
        }
    }

    pub(crate) fn report(&self) -> BTreeMap<String, ProviderMetrics> {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn log_report(&self) {
        let report = self.report();
        if report.is_empty() {
            return;
        }
        tracing::info!("provider health:");
        for (name, m) in report {
            tracing::info!(
                "  {name}: calls={} success={:.0}% latency={:.2}s avg_results={:.1} failures={}",
                m.calls,
                m.success_rate() * 100.0,
                m.avg_latency().as_secs_f64(),
                m.avg_results(),
                m.failures,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_accumulate_per_provider() {
        let health = HealthMonitor::new();
        health.record_call("searx", true, 12, Duration::from_millis(200), None);
        health.record_call("searx", true, 8, Duration::from_millis(400), None);
        health.record_call("searx", false, 0, Duration::ZERO, Some("http 503"));
        health.record_call("other", true, 1, Duration::from_millis(50), None);

        let report = health.report();
        let searx = &report["searx"];
        assert_eq!(searx.calls, 3);
        assert_eq!(searx.failures, 1);
        assert!((searx.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(searx.avg_latency(), Duration::from_millis(300));
        assert!((searx.avg_results() - 10.0).abs() < 1e-9);
        assert_eq!(searx.last_error, "http 503");
        assert_eq!(report["other"].calls, 1);
    }
}
