//! Fan-in over ordered search providers.
//!
//! Providers are tried in priority order, each behind its own rate limiter
//! and circuit breaker. Results merge into one URL-deduplicated list;
//! iteration stops early once enough candidates have accumulated.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use adforge_core::config::SearchConfig;

use crate::health::HealthMonitor;
use crate::pace::{CircuitBreaker, RateLimiter};
use crate::providers::{Candidate, SearchProvider};

pub(crate) struct ProviderSlot {
    name: String,
    provider: Arc<dyn SearchProvider>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
}

pub(crate) struct SearchBroker {
    slots: Vec<ProviderSlot>,
    max_results: usize,
    sufficiency_threshold: usize,
    inter_provider_delay: Duration,
    health: Arc<HealthMonitor>,
}

impl SearchBroker {
    pub(crate) fn new(
        providers: Vec<Arc<dyn SearchProvider>>,
        cfg: &SearchConfig,
        health: Arc<HealthMonitor>,
    ) -> Self {
        let slots = providers
            .into_iter()
            .map(|provider| ProviderSlot {
                name: provider.name().to_string(),
                limiter: RateLimiter::new(cfg.rate_limit_per_sec),
                breaker: CircuitBreaker::new(
                    cfg.breaker_threshold,
                    Duration::from_secs_f64(cfg.breaker_cooldown_secs),
                ),
                provider,
            })
            .collect();
        Self {
            slots,
            max_results: cfg.max_results,
            sufficiency_threshold: cfg.sufficiency_threshold.max(1),
            inter_provider_delay: Duration::from_millis(cfg.inter_provider_delay_ms),
            health,
        }
    }

    /// Provider names in priority order (first = highest score bonus).
    pub(crate) fn provider_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }

    /// Query every provider in priority order until sufficiency. Transport
    /// failures are absorbed into breaker state; the broker itself never
    /// fails.
    pub(crate) async fn search(&self, query: &str) -> Vec<Candidate> {
        let mut combined: Vec<Candidate> = Vec::new();
        let mut seen_urls: HashSet<String> = HashSet::new();

        let last = self.slots.len().saturating_sub(1);
        for (slot_idx, slot) in self.slots.iter().enumerate() {
            if slot.breaker.is_open() {
                tracing::debug!(provider = %slot.name, "skipping provider, circuit breaker open");
                continue;
            }

            slot.limiter.wait().await;

            let started = Instant::now();
            match slot.provider.search(query, self.max_results).await {
                Ok(batch) => {
                    slot.breaker.record_success();
                    self.health
                        .record_call(&slot.name, true, batch.len(), started.elapsed(), None);
                    for candidate in batch {
                        if seen_urls.insert(candidate.url.clone()) {
                            combined.push(candidate);
                        }
                    }
                }
                Err(err) => {
                    slot.breaker.record_failure();
                    let msg = format!("{err:#}");
                    self.health
                        .record_call(&slot.name, false, 0, started.elapsed(), Some(&msg));
                    if err.downcast_ref::<crate::providers::ProviderError>().is_some() {
                        tracing::info!(provider = %slot.name, "provider throttled us");
                    } else {
                        tracing::warn!(provider = %slot.name, "search failed: {msg}");
                    }
                }
            }

            if combined.len() >= self.sufficiency_threshold {
                tracing::debug!(
                    count = combined.len(),
                    after = %slot.name,
                    "enough candidates, skipping remaining providers"
                );
                break;
            }

            if slot_idx != last && !self.inter_provider_delay.is_zero() {
                tokio::time::sleep(self.inter_provider_delay).await;
            }
        }

        combined.truncate(self.max_results);
        tracing::info!(query, count = combined.len(), "search complete");
        combined
    }
}
