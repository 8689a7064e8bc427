//! Per-provider call pacing.
//!
//! Every upstream request goes through [`RateGovernor::run_governed`]. Each
//! provider has its own lock, so pacing one provider never delays another.
//! Timing uses `tokio::time::Instant`, which tests drive with a paused clock.
//!
//! Counters are process-local. Running several instances against the same
//! API keys needs an external counter instead.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{MarketDataError, Result};

pub const DEFAULT_BAN: Duration = Duration::from_secs(60);
const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderLimits {
    /// Minimum spacing between two calls.
    pub cooldown: Duration,
    pub per_minute_limit: Option<u32>,
    pub daily_limit: Option<u32>,
}

impl ProviderLimits {
    pub fn cooldown(cooldown: Duration) -> Self {
        Self {
            cooldown,
            ..Self::default()
        }
    }

    pub fn with_per_minute(mut self, limit: u32) -> Self {
        self.per_minute_limit = Some(limit);
        self
    }

    pub fn with_daily(mut self, limit: u32) -> Self {
        self.daily_limit = Some(limit);
        self
    }
}

#[derive(Debug)]
struct ProviderState {
    limits: ProviderLimits,
    /// Start time of the latest granted call. May lie in the future while a
    /// caller waits for its reserved slot.
    last_request: Option<Instant>,
    rate_limited_until: Option<Instant>,
    day_start: Instant,
    request_count: u32,
    minute_window_start: Instant,
    minute_count: u32,
}

impl ProviderState {
    fn new(limits: ProviderLimits, now: Instant) -> Self {
        Self {
            limits,
            last_request: None,
            rate_limited_until: None,
            day_start: now,
            request_count: 0,
            minute_window_start: now,
            minute_count: 0,
        }
    }

    fn roll_day(&mut self, now: Instant) {
        if now.duration_since(self.day_start) >= DAY {
            self.day_start = now;
            self.request_count = 0;
        }
    }

    fn banned_for(&self, now: Instant) -> Option<Duration> {
        self.rate_limited_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    fn daily_exhausted(&self) -> bool {
        self.limits
            .daily_limit
            .is_some_and(|limit| self.request_count >= limit)
    }

    fn cooled_down(&self, now: Instant) -> bool {
        self.last_request
            .map_or(true, |last| now >= last + self.limits.cooldown)
    }

    /// Reserves the earliest slot that honours the per-minute window and the
    /// cooldown, and books it.
    fn reserve(&mut self, now: Instant) -> Instant {
        let mut slot = match self.last_request {
            Some(last) => now.max(last + self.limits.cooldown),
            None => now,
        };

        if let Some(limit) = self.limits.per_minute_limit {
            if slot >= self.minute_window_start + MINUTE {
                self.minute_window_start = slot;
                self.minute_count = 0;
            }
            if self.minute_count >= limit {
                slot = self.minute_window_start + MINUTE;
                self.minute_window_start = slot;
                self.minute_count = 0;
            }
            self.minute_count += 1;
        }

        self.last_request = Some(slot);
        self.request_count += 1;
        slot
    }
}

/// Snapshot of one provider's governance state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub available: bool,
    pub request_count: u32,
    pub daily_limit: Option<u32>,
    pub minute_count: u32,
    pub per_minute_limit: Option<u32>,
    pub banned_for_secs: Option<u64>,
}

#[derive(Debug)]
pub struct RateGovernor {
    states: HashMap<String, Arc<Mutex<ProviderState>>>,
    ban: Duration,
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl RateGovernor {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            ban: DEFAULT_BAN,
        }
    }

    /// Registers a provider. Providers are only known if registered before
    /// the governor is shared.
    pub fn register(mut self, provider: impl Into<String>, limits: ProviderLimits) -> Self {
        self.states.insert(
            provider.into(),
            Arc::new(Mutex::new(ProviderState::new(limits, Instant::now()))),
        );
        self
    }

    pub fn with_ban_duration(mut self, ban: Duration) -> Self {
        self.ban = ban;
        self
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    fn state(&self, provider: &str) -> Result<&Arc<Mutex<ProviderState>>> {
        self.states
            .get(provider)
            .ok_or_else(|| MarketDataError::ProviderUnavailable {
                provider: provider.to_string(),
            })
    }

    /// True when the cooldown has elapsed, no ban is active and the daily
    /// quota is not spent. Unknown providers are never available.
    pub async fn is_available(&self, provider: &str) -> bool {
        let Ok(state) = self.state(provider) else {
            return false;
        };
        let mut state = state.lock().await;
        let now = Instant::now();
        state.roll_day(now);
        state.cooled_down(now) && state.banned_for(now).is_none() && !state.daily_exhausted()
    }

    /// True unless the provider is banned, out of daily quota or unknown.
    ///
    /// Unlike [`is_available`](Self::is_available) this ignores the cooldown:
    /// a caller admitted here is queued by `run_governed` for its slot
    /// instead of being turned away.
    pub async fn accepts_calls(&self, provider: &str) -> bool {
        let Ok(state) = self.state(provider) else {
            return false;
        };
        let mut state = state.lock().await;
        let now = Instant::now();
        state.roll_day(now);
        state.banned_for(now).is_none() && !state.daily_exhausted()
    }

    /// Runs `call` as a governed request.
    ///
    /// Fails fast with `ProviderUnavailable` while banned or out of daily
    /// quota. Otherwise waits for per-minute capacity and the cooldown, books
    /// the call, and runs it. A `RateLimited` result bans the provider.
    pub async fn run_governed<T, F, Fut>(&self, provider: &str, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let state = self.state(provider)?;

        let slot = {
            let mut state = state.lock().await;
            let now = Instant::now();
            state.roll_day(now);
            if let Some(remaining) = state.banned_for(now) {
                debug!(
                    provider,
                    banned_secs = remaining.as_secs(),
                    "provider banned, refusing call"
                );
                return Err(MarketDataError::ProviderUnavailable {
                    provider: provider.to_string(),
                });
            }
            if state.daily_exhausted() {
                debug!(provider, "daily quota spent, refusing call");
                return Err(MarketDataError::ProviderUnavailable {
                    provider: provider.to_string(),
                });
            }
            state.reserve(now)
        };

        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!(provider, wait_ms = wait.as_millis() as u64, "waiting for call slot");
            tokio::time::sleep_until(slot).await;
        }

        let result = call().await;

        if let Err(MarketDataError::RateLimited { .. }) = &result {
            let mut state = state.lock().await;
            state.rate_limited_until = Some(Instant::now() + self.ban);
            warn!(provider, ban_secs = self.ban.as_secs(), "provider rate limited us, suspending");
        }

        result
    }

    pub async fn status(&self, provider: &str) -> Result<ProviderStatus> {
        let state = self.state(provider)?;
        let mut state = state.lock().await;
        let now = Instant::now();
        state.roll_day(now);
        let banned_for = state.banned_for(now);
        let minute_count = if now >= state.minute_window_start + MINUTE {
            0
        } else {
            state.minute_count
        };
        Ok(ProviderStatus {
            provider: provider.to_string(),
            available: state.cooled_down(now) && banned_for.is_none() && !state.daily_exhausted(),
            request_count: state.request_count,
            daily_limit: state.limits.daily_limit,
            minute_count,
            per_minute_limit: state.limits.per_minute_limit,
            banned_for_secs: banned_for.map(|d| d.as_secs()),
        })
    }
}
