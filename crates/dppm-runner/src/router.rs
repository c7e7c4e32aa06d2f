use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::provider::{ModelProvider, ProviderError};

/// Routing category for goal decomposition.
pub const DECOMPOSE: &str = "decompose";
/// Routing category for the pre-flight critique.
pub const CRITIQUE: &str = "critique";
/// Routing category for post-execution reflection.
pub const REFLECT: &str = "reflect";

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("all {attempts} providers failed for category '{category}'")]
    Exhausted { category: String, attempts: usize },

    #[error("run cancelled")]
    Cancelled,
}

/// One observed call outcome.
#[derive(Debug, Clone)]
pub struct RouteEvent {
    pub provider: String,
    pub category: String,
    pub won: bool,
    pub latency: Duration,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Age at which an event counts half as much as a fresh one.
    pub half_life: Duration,
    pub win_weight: f64,
    pub latency_weight: f64,
    pub cost_weight: f64,
    /// Events kept individually. Past this, the oldest are folded into
    /// per-(provider, category) decayed totals.
    pub max_events: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            half_life: Duration::from_secs(3600),
            win_weight: 0.5,
            latency_weight: 0.25,
            cost_weight: 0.15,
            max_events: 1024,
        }
    }
}

/// Aggregated view of one provider's history in one category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderStats {
    /// Recency-weighted win rate, smoothed toward 0.5.
    pub win_rate: f64,
    pub avg_latency_secs: f64,
    /// Sum of decay weights; roughly "effective number of samples".
    pub weight: f64,
}

/// A successful routed call.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub provider: String,
    pub text: String,
    pub latency: Duration,
}

/// Failure of a single provider call.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("cancelled")]
    Cancelled,
}

/// Decayed sums for one (provider, category), valid as of `at`.
#[derive(Debug, Clone, Copy)]
struct Folded {
    weight: f64,
    wins: f64,
    latency: f64,
    at: Instant,
}

impl Folded {
    /// Sums as they stand at `now`.
    fn decayed(&self, now: Instant, half_life: f64) -> (f64, f64, f64) {
        let d = decay(now.saturating_duration_since(self.at), half_life);
        (self.weight * d, self.wins * d, self.latency * d)
    }

    fn absorb(&mut self, e: &RouteEvent, half_life: f64) {
        let (at, carried, fresh) = if e.at >= self.at {
            (e.at, decay(e.at - self.at, half_life), 1.0)
        } else {
            (self.at, 1.0, decay(self.at - e.at, half_life))
        };
        self.weight = self.weight * carried + fresh;
        self.wins = self.wins * carried + if e.won { fresh } else { 0.0 };
        self.latency = self.latency * carried + fresh * e.latency.as_secs_f64();
        self.at = at;
    }
}

/// Recent events plus everything older folded into running totals.
#[derive(Default)]
struct RouteLog {
    recent: Vec<RouteEvent>,
    folded: HashMap<(String, String), Folded>,
}

impl RouteLog {
    fn compact(&mut self, keep: usize, half_life: f64) {
        if self.recent.len() <= keep {
            return;
        }
        let excess = self.recent.len() - keep;
        for e in self.recent.drain(..excess) {
            self.folded
                .entry((e.provider.clone(), e.category.clone()))
                .or_insert(Folded {
                    weight: 0.0,
                    wins: 0.0,
                    latency: 0.0,
                    at: e.at,
                })
                .absorb(&e, half_life);
        }
    }
}

fn decay(age: Duration, half_life: f64) -> f64 {
    0.5_f64.powf(age.as_secs_f64() / half_life)
}

/// Mixture-of-experts provider selection.
///
/// Ranking is recomputed from the log on every selection, so writers only
/// ever append and never race on a shared score. Exponential decay composes,
/// so folding old events into totals does not change the aggregate.
pub struct ModelRouter {
    providers: Vec<Arc<dyn ModelProvider>>,
    preferences: HashMap<String, f64>,
    config: RouterConfig,
    log: Mutex<RouteLog>,
}

impl ModelRouter {
    pub fn new(providers: Vec<Arc<dyn ModelProvider>>) -> Self {
        Self {
            providers,
            preferences: HashMap::new(),
            config: RouterConfig::default(),
            log: Mutex::new(RouteLog::default()),
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a fixed score boost for a provider, e.g. a user's preferred model.
    pub fn with_preference(mut self, provider: &str, boost: f64) -> Self {
        self.preferences.insert(provider.to_string(), boost);
        self
    }

    pub fn providers(&self) -> &[Arc<dyn ModelProvider>] {
        &self.providers
    }

    pub fn record(&self, provider: &str, category: &str, won: bool, latency: Duration) {
        let event = RouteEvent {
            provider: provider.to_string(),
            category: category.to_string(),
            won,
            latency,
            at: Instant::now(),
        };
        let max = self.config.max_events.max(1);
        let mut log = self.lock_log();
        log.recent.push(event);
        if log.recent.len() > max {
            // Fold in bulk so compaction runs once per `max / 2` records.
            log.compact(max / 2, self.half_life_secs());
        }
    }

    /// Snapshot of the events not yet folded into totals, oldest first.
    pub fn events(&self) -> Vec<RouteEvent> {
        self.lock_log().recent.clone()
    }

    fn lock_log(&self) -> MutexGuard<'_, RouteLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn half_life_secs(&self) -> f64 {
        self.config.half_life.as_secs_f64().max(f64::EPSILON)
    }

    pub fn stats(&self, provider: &str, category: &str) -> ProviderStats {
        let now = Instant::now();
        let half_life = self.half_life_secs();
        let log = self.lock_log();

        let (mut weight, mut wins, mut latency) = log
            .folded
            .get(&(provider.to_string(), category.to_string()))
            .map_or((0.0, 0.0, 0.0), |f| f.decayed(now, half_life));
        for e in log
            .recent
            .iter()
            .filter(|e| e.provider == provider && e.category == category)
        {
            let w = decay(now.saturating_duration_since(e.at), half_life);
            weight += w;
            if e.won {
                wins += w;
            }
            latency += w * e.latency.as_secs_f64();
        }

        // One pseudo-observation at 0.5 keeps new providers neutral.
        let win_rate = (wins + 0.5) / (weight + 1.0);
        let avg_latency_secs = if weight > 0.0 { latency / weight } else { 0.0 };
        ProviderStats {
            win_rate,
            avg_latency_secs,
            weight,
        }
    }

    pub fn score(&self, provider: &dyn ModelProvider, category: &str) -> f64 {
        let stats = self.stats(provider.name(), category);
        let inv_latency = 1.0 / (1.0 + stats.avg_latency_secs);
        let inv_cost = 1.0 / (1.0 + provider.cost_per_call().max(0.0));
        let boost = self.preferences.get(provider.name()).copied().unwrap_or(0.0);
        self.config.win_weight * stats.win_rate
            + self.config.latency_weight * inv_latency
            + self.config.cost_weight * inv_cost
            + boost
    }

    /// All providers, best first. Ties keep registration order.
    pub fn select(&self, category: &str) -> Vec<Arc<dyn ModelProvider>> {
        let mut scored: Vec<(f64, Arc<dyn ModelProvider>)> = self
            .providers
            .iter()
            .map(|p| (self.score(p.as_ref(), category), p.clone()))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().map(|(_, p)| p).collect()
    }

    /// The best `k` providers, for ensemble competition.
    pub fn select_top(&self, category: &str, k: usize) -> Vec<Arc<dyn ModelProvider>> {
        let mut ranked = self.select(category);
        ranked.truncate(k.max(1));
        ranked
    }

    /// Send `prompt` to the best provider, falling through the ranking on
    /// failure or timeout. Every attempt is recorded.
    pub async fn invoke(
        &self,
        category: &str,
        prompt: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RoutedResponse, RouterError> {
        let ranked = self.select(category);
        let mut attempts = 0;
        for provider in ranked {
            if cancel.is_cancelled() {
                return Err(RouterError::Cancelled);
            }
            attempts += 1;
            let started = Instant::now();
            match call(provider.as_ref(), prompt, timeout, cancel).await {
                Ok(text) => {
                    let latency = started.elapsed();
                    self.record(provider.name(), category, true, latency);
                    debug!(provider = provider.name(), category, ?latency, "routed call succeeded");
                    return Ok(RoutedResponse {
                        provider: provider.name().to_string(),
                        text,
                        latency,
                    });
                }
                Err(CallError::Cancelled) => return Err(RouterError::Cancelled),
                Err(CallError::Provider(e)) => {
                    self.record(provider.name(), category, false, started.elapsed());
                    warn!(provider = provider.name(), category, "provider failed, falling through: {e}");
                }
            }
        }
        Err(RouterError::Exhausted {
            category: category.to_string(),
            attempts,
        })
    }
}

/// One bounded, cancellable call to a single provider. Nothing is recorded.
pub async fn call(
    provider: &dyn ModelProvider,
    prompt: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String, CallError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(CallError::Cancelled),
        res = tokio::time::timeout(timeout, provider.invoke(prompt)) => match res {
            Ok(inner) => inner.map_err(CallError::from),
            Err(_) => Err(CallError::Provider(ProviderError::Timeout(timeout))),
        },
    }
}
