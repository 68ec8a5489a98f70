//! Data gateway: a single provider-agnostic view over both upstreams.
//!
//! Owns the failover policy (primary → secondary), per-provider token
//! buckets, per-operation deadlines, record normalization and the quote
//! cache. Providers stay dumb; every caller in the system goes through here.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tracing::{debug, warn};

use super::cache::{CacheKey, CacheStats, QuoteCache};
use super::provider::{ProviderError, ProviderInfo, QuoteProvider};
use super::rate_limiter::RateLimiter;
use super::{Fundamentals, HistoryBar, QuoteSnapshot, TickerRef};
use tide_common::config::DataConfig;

// ============================================================================
// Configuration
// ============================================================================

/// Gateway tuning knobs, derived from the data section of the config file.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub rate_limit_rps_primary: u32,
    pub rate_limit_rps_secondary: u32,
    pub cache_size: usize,
    pub ttl_reference: Duration,
    pub ttl_snapshot: Duration,
    pub ttl_history: Duration,
    pub ttl_fundamentals: Duration,
    pub reference_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_data_config(&DataConfig::default())
    }
}

impl GatewayConfig {
    /// Build from the shared configuration file section.
    pub fn from_data_config(data: &DataConfig) -> Self {
        Self {
            rate_limit_rps_primary: data.rate_limit_rps_primary,
            rate_limit_rps_secondary: data.rate_limit_rps_secondary,
            cache_size: data.cache_size,
            ttl_reference: Duration::from_secs(data.cache_ttl_reference_secs),
            ttl_snapshot: Duration::from_secs(data.cache_ttl_snapshot_secs),
            ttl_history: Duration::from_secs(data.cache_ttl_history_secs),
            ttl_fundamentals: Duration::from_secs(data.cache_ttl_fundamentals_secs),
            reference_timeout: Duration::from_secs(data.reference_timeout_secs),
            fetch_timeout: Duration::from_secs(data.fetch_timeout_secs),
        }
    }
}

// ============================================================================
// Sourced values
// ============================================================================

/// A value together with the provider that served it.
#[derive(Debug, Clone)]
pub struct Sourced<T> {
    pub value: T,
    pub source: &'static str,
}

/// Per-provider success counters for result reports.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SourceBreakdown {
    pub primary: u64,
    pub secondary: u64,
}

// ============================================================================
// Provider slot
// ============================================================================

struct ProviderSlot {
    provider: Arc<dyn QuoteProvider>,
    limiter: RateLimiter,
    role: &'static str,
    success_count: AtomicU64,
    error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl ProviderSlot {
    fn new(provider: Arc<dyn QuoteProvider>, role: &'static str, rps: u32) -> Self {
        let limiter = RateLimiter::from_rps(provider.name(), rps);
        Self {
            provider,
            limiter,
            role,
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_success: Mutex::new(None),
        }
    }

    fn record_success(&self) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        *self.last_success.lock().expect("slot lock poisoned") = Some(Utc::now());
    }

    fn record_error(&self, err: &ProviderError) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().expect("slot lock poisoned") = Some(err.to_string());
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.provider.name().to_string(),
            role: self.role.to_string(),
            success_count: self.success_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_error: self.last_error.lock().expect("slot lock poisoned").clone(),
            last_success: *self.last_success.lock().expect("slot lock poisoned"),
        }
    }
}

// ============================================================================
// Data Gateway
// ============================================================================

/// Merges the two quote providers behind one interface.
pub struct DataGateway {
    primary: ProviderSlot,
    secondary: ProviderSlot,
    cache: QuoteCache,
    config: GatewayConfig,
}

impl DataGateway {
    /// Create a gateway over an injected provider pair.
    pub fn new(
        primary: Arc<dyn QuoteProvider>,
        secondary: Arc<dyn QuoteProvider>,
        config: GatewayConfig,
    ) -> Self {
        let cache = QuoteCache::new(config.cache_size);
        Self {
            primary: ProviderSlot::new(primary, "primary", config.rate_limit_rps_primary),
            secondary: ProviderSlot::new(secondary, "secondary", config.rate_limit_rps_secondary),
            cache,
            config,
        }
    }

    /// Execute one operation with failover.
    ///
    /// Primary first; Unavailable, RateLimited and Malformed fall through to
    /// secondary. NotFound is authoritative and returns immediately. When
    /// both fail the stronger error propagates
    /// (Unavailable > Malformed > RateLimited > NotFound).
    async fn with_failover<T, F, Fut>(
        &self,
        op: &'static str,
        deadline: Duration,
        call: F,
    ) -> Result<Sourced<T>, ProviderError>
    where
        F: Fn(Arc<dyn QuoteProvider>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error: Option<ProviderError> = None;

        for slot in [&self.primary, &self.secondary] {
            let name = slot.provider.name();
            let deadline_at = Instant::now() + deadline;

            // The token bucket blocks up to the caller's deadline, then the
            // call degrades to a rate-limit error for this provider.
            if !slot.limiter.acquire_until(deadline_at).await {
                let err = ProviderError::RateLimited {
                    retry_after_secs: None,
                };
                slot.record_error(&err);
                debug!(provider = name, op, "Token bucket exhausted within deadline");
                last_error = Some(merge_error(last_error, err));
                continue;
            }

            let remaining = deadline_at.saturating_duration_since(Instant::now());
            let outcome = tokio::time::timeout(remaining, call(Arc::clone(&slot.provider))).await;

            let err = match outcome {
                Ok(Ok(value)) => {
                    slot.record_success();
                    return Ok(Sourced {
                        value,
                        source: name,
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Unavailable(format!("{} deadline exceeded", op)),
            };

            slot.record_error(&err);

            if !err.should_failover() {
                // NotFound: the backup will not know this ticker either
                return Err(err);
            }

            warn!(provider = name, op, error = %err, "Provider error, failing over");
            last_error = Some(merge_error(last_error, err));
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::Unavailable("no provider produced a result".into())))
    }

    // ========================================================================
    // Public operations (cached)
    // ========================================================================

    /// Full A-share reference roster.
    pub async fn reference_universe(&self) -> Result<Vec<TickerRef>, ProviderError> {
        let key = CacheKey::new("reference", "all");
        self.cache
            .get_with(key, self.config.ttl_reference, || async {
                let sourced = self
                    .with_failover("reference", self.config.reference_timeout, |p| async move {
                        p.load_reference_universe().await
                    })
                    .await?;
                Ok(sourced.value)
            })
            .await
    }

    /// Latest-session snapshot for one ticker.
    ///
    /// Normalization runs per provider, so a malformed primary record falls
    /// through to the secondary like any other Malformed error.
    pub async fn snapshot(&self, code: &str) -> Result<QuoteSnapshot, ProviderError> {
        let key = CacheKey::new("snapshot", code);
        let code_owned = code.to_string();
        self.cache
            .get_with(key, self.config.ttl_snapshot, || {
                let code = code_owned.clone();
                async move {
                    let sourced = self
                        .with_failover("snapshot", self.config.fetch_timeout, |p| {
                            let code = code.clone();
                            async move {
                                let mut batch = p.fetch_snapshot_batch(&[code.clone()]).await?;
                                let snapshot = batch.remove(&code).ok_or_else(|| {
                                    ProviderError::NotFound(format!("no snapshot for {}", code))
                                })?;
                                validate_snapshot(&snapshot)?;
                                Ok(snapshot)
                            }
                        })
                        .await?;
                    Ok(sourced.value)
                }
            })
            .await
    }

    /// Daily history for one ticker, oldest bar first.
    ///
    /// A provider returning any impossible bar is treated as Malformed and
    /// falls through to the backup.
    pub async fn history(
        &self,
        code: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HistoryBar>, ProviderError> {
        let key = CacheKey::new("history", format!("{}:{}:{}", code, from, to));
        let code_owned = code.to_string();
        self.cache
            .get_with(key, self.config.ttl_history, || {
                let code = code_owned.clone();
                async move {
                    let sourced = self
                        .with_failover("history", self.config.fetch_timeout, |p| {
                            let code = code.clone();
                            async move {
                                let bars = p.fetch_history(&code, from, to).await?;
                                for bar in &bars {
                                    if bar.close <= 0.0 || bar.volume < 0.0 {
                                        return Err(ProviderError::Malformed(format!(
                                            "invalid bar for {} on {}",
                                            code, bar.date
                                        )));
                                    }
                                }
                                Ok(bars)
                            }
                        })
                        .await?;
                    Ok(sourced.value)
                }
            })
            .await
    }

    /// Fundamental metrics for one ticker, tagged with the serving provider.
    pub async fn fundamentals(&self, code: &str) -> Result<Sourced<Fundamentals>, ProviderError> {
        let key = CacheKey::new("fundamentals", code);
        let code_owned = code.to_string();
        self.cache
            .get_with(key, self.config.ttl_fundamentals, || {
                let code = code_owned.clone();
                async move {
                    self.with_failover("fundamentals", self.config.fetch_timeout, |p| {
                        let code = code.clone();
                        async move { p.fetch_fundamentals(&code).await }
                    })
                    .await
                }
            })
            .await
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    /// Per-provider status counters.
    pub fn providers_info(&self) -> Vec<ProviderInfo> {
        vec![self.primary.info(), self.secondary.info()]
    }

    /// Cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

fn merge_error(previous: Option<ProviderError>, new: ProviderError) -> ProviderError {
    match previous {
        Some(prev) => prev.stronger(new),
        None => new,
    }
}

/// Reject snapshots that cannot be real sessions.
fn validate_snapshot(snapshot: &QuoteSnapshot) -> Result<(), ProviderError> {
    if snapshot.close <= 0.0 || snapshot.volume < 0.0 {
        return Err(ProviderError::Malformed(format!(
            "invalid snapshot for {} (close={}, volume={})",
            snapshot.code, snapshot.close, snapshot.volume
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
