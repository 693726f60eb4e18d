//! Per-key exponential backoff for controller error policies
//!
//! Error policies run per object key: consecutive failures on one key double
//! its requeue delay (with jitter, to avoid thundering herds) while other
//! keys are unaffected. A successful sync resets the key. Steady-state syncs
//! requeue at the full resync interval so a missed watch event is still
//! eventually corrected.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

/// Steady-state resync interval for hub controllers
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(600);

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Tracks consecutive failures per object key and produces exponentially
/// growing requeue delays.
pub struct ErrorBackoff {
    base: Duration,
    max: Duration,
    attempts: Mutex<HashMap<String, u32>>,
}

impl Default for ErrorBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl ErrorBackoff {
    /// Create a backoff with the given base and cap
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        match self.attempts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a failure for `key` and return the delay before the next retry.
    ///
    /// Delays follow `base × 2^(n-1)` for the nth consecutive failure, capped
    /// at the maximum, with 0.5–1.5× jitter applied below the cap.
    pub fn next_delay(&self, key: &str) -> Duration {
        let attempt = {
            let mut attempts = self.lock();
            let entry = attempts.entry(key.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };

        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max);

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * jitter).min(self.max)
    }

    /// Clear the failure count for `key` after a successful sync
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }
}
