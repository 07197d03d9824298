//! Exponential backoff with full jitter.
//!
//! [`BackoffSettings`] is the immutable configuration; [`Backoff`] is the
//! per-call state that walks the delay and RPC-timeout schedules towards their
//! caps and enforces the total budget (either a total timeout or a maximum
//! number of retries, never both).

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{GaxError, Result};

/// Upper bound used when a schedule has no configured cap.
const UNBOUNDED: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Retry delay and RPC timeout schedule.
///
/// Field names match the JSON client config (`retry_params`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    /// Delay before the first retry.
    pub initial_retry_delay_millis: u64,
    /// Factor applied to the delay after each retry.
    pub retry_delay_multiplier: f64,
    /// Cap on the retry delay.
    pub max_retry_delay_millis: u64,
    /// Timeout of the first attempt.
    pub initial_rpc_timeout_millis: Option<u64>,
    /// Factor applied to the attempt timeout after each retry.
    pub rpc_timeout_multiplier: Option<f64>,
    /// Cap on the attempt timeout.
    pub max_rpc_timeout_millis: Option<u64>,
    /// Budget for the whole call, across all attempts and sleeps.
    pub total_timeout_millis: Option<u64>,
    /// Maximum number of retries after the first attempt.
    pub max_retries: Option<u32>,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_retry_delay_millis: 100,
            retry_delay_multiplier: 1.3,
            max_retry_delay_millis: 60_000,
            initial_rpc_timeout_millis: None,
            rpc_timeout_multiplier: None,
            max_rpc_timeout_millis: None,
            total_timeout_millis: Some(600_000),
            max_retries: None,
        }
    }
}

impl BackoffSettings {
    /// Builds settings bounded by a total timeout.
    pub fn with_total_timeout(
        initial_retry_delay_millis: u64,
        retry_delay_multiplier: f64,
        max_retry_delay_millis: u64,
        initial_rpc_timeout_millis: Option<u64>,
        rpc_timeout_multiplier: Option<f64>,
        max_rpc_timeout_millis: Option<u64>,
        total_timeout_millis: u64,
    ) -> Self {
        Self {
            initial_retry_delay_millis,
            retry_delay_multiplier,
            max_retry_delay_millis,
            initial_rpc_timeout_millis,
            rpc_timeout_multiplier,
            max_rpc_timeout_millis,
            total_timeout_millis: Some(total_timeout_millis),
            max_retries: None,
        }
    }

    /// Builds settings bounded by a retry count.
    pub fn with_max_retries(
        initial_retry_delay_millis: u64,
        retry_delay_multiplier: f64,
        max_retry_delay_millis: u64,
        initial_rpc_timeout_millis: Option<u64>,
        rpc_timeout_multiplier: Option<f64>,
        max_rpc_timeout_millis: Option<u64>,
        max_retries: u32,
    ) -> Self {
        Self {
            initial_retry_delay_millis,
            retry_delay_multiplier,
            max_retry_delay_millis,
            initial_rpc_timeout_millis,
            rpc_timeout_multiplier,
            max_rpc_timeout_millis,
            total_timeout_millis: None,
            max_retries: Some(max_retries),
        }
    }

    /// Configured total budget. Zero means "not configured".
    pub fn total_timeout(&self) -> Option<Duration> {
        self.total_timeout_millis
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis)
    }

    /// Configured retry budget. Zero means "not configured".
    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries.filter(|retries| *retries > 0)
    }

    /// Rejects settings that configure both budgets or carry unusable
    /// multipliers.
    pub fn validate(&self) -> Result<()> {
        if self.total_timeout().is_some() && self.max_retries().is_some() {
            return Err(GaxError::invalid_argument(
                "Cannot set both totalTimeoutMillis and maxRetries in backoffSettings.",
            ));
        }
        let multipliers = [Some(self.retry_delay_multiplier), self.rpc_timeout_multiplier];
        if multipliers
            .into_iter()
            .flatten()
            .any(|factor| !factor.is_finite() || factor < 0.0)
        {
            return Err(GaxError::invalid_argument(
                "backoff multipliers must be finite and non-negative",
            ));
        }
        Ok(())
    }
}

/// Per-call backoff state.
#[derive(Clone, Debug)]
pub struct Backoff {
    settings: BackoffSettings,
    delay: Duration,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    retries: u32,
}

impl Backoff {
    /// Validates `settings` and starts the schedule at `now`.
    pub fn start(settings: &BackoffSettings, now: Instant) -> Result<Self> {
        settings.validate()?;
        let deadline = settings.total_timeout().map(|total| now + total);
        let mut timeout = settings.initial_rpc_timeout_millis.map(Duration::from_millis);
        if let Some(total) = settings.total_timeout() {
            timeout = Some(timeout.map_or(total, |t| t.min(total)));
        }
        Ok(Self {
            settings: settings.clone(),
            delay: Duration::from_millis(settings.initial_retry_delay_millis),
            timeout,
            deadline,
            retries: 0,
        })
    }

    /// Current (un-jittered) retry delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Timeout to attach to the next attempt.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Absolute deadline of the total budget, if one is configured.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Number of retries performed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    /// Sleep before the next retry: uniform in `[0, delay]`.
    pub fn jittered_delay(&self) -> Duration {
        self.jittered_delay_with(&mut rand::thread_rng())
    }

    pub fn jittered_delay_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let millis = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..=millis))
    }

    /// Moves to the next step of the schedule after a retry sleep.
    pub fn advance(&mut self, now: Instant) {
        let max_delay = Duration::from_millis(self.settings.max_retry_delay_millis);
        self.delay = scale(self.delay, self.settings.retry_delay_multiplier, max_delay);

        let max_timeout = self
            .settings
            .max_rpc_timeout_millis
            .map_or(UNBOUNDED, Duration::from_millis);
        let mut timeout = self.timeout.map(|current| {
            let factor = self.settings.rpc_timeout_multiplier.unwrap_or(1.0);
            scale(current, factor, max_timeout)
        });
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(now);
            timeout = Some(timeout.map_or(remaining, |t| t.min(remaining)));
        }
        self.timeout = timeout;
        self.retries = self.retries.saturating_add(1);
    }

    /// Fails with DEADLINE_EXCEEDED when the next attempt, which would be
    /// retry number `retries`, is outside the configured budget.
    pub fn check_budget(
        &self,
        now: Instant,
        retries: u32,
        api_name: &str,
        last_error: Option<&GaxError>,
    ) -> Result<()> {
        let retrying = last_error
            .map(|err| format!("retrying error {err} "))
            .unwrap_or_default();
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                return Err(GaxError::deadline_exceeded(format!(
                    "Total timeout of API {api_name} exceeded {} milliseconds {retrying}before any response was received.",
                    self.settings.total_timeout_millis.unwrap_or_default()
                )));
            }
            return Ok(());
        }
        if let Some(max_retries) = self.settings.max_retries() {
            if retries > max_retries {
                return Err(GaxError::deadline_exceeded(format!(
                    "Exceeded maximum number of retries {retrying}before any response was received"
                )));
            }
        }
        Ok(())
    }
}

fn scale(current: Duration, factor: f64, cap: Duration) -> Duration {
    let scaled = current.as_secs_f64() * factor;
    if !scaled.is_finite() || scaled >= cap.as_secs_f64() {
        cap
    } else {
        Duration::from_secs_f64(scaled.max(0.0))
    }
}
