//! Serialized, rate-limited, retrying access to the sheet backend.
//!
//! Every backend operation in the process funnels through one [Gateway].
//! A single internal lock totally orders the calls; before each backend
//! request the gateway sleeps out the remainder of the pacing interval plus
//! a jitter that widens with the observed worker population, and transient
//! backend errors are retried with capped exponential backoff. One gateway
//! call is one backend request; there are no partial writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use rowq_store::{SheetStore, StoreError};

/// Bounded exponential-backoff retry for transient backend errors.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }
}

/// Backoff before retry attempt `attempt` (1-based): the initial delay
/// doubled per prior attempt, capped at the policy maximum.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let doubled = policy
        .initial_delay
        .saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
    doubled.min(policy.max_delay)
}

/// Adaptive pacing applied before every backend request.
#[derive(Clone, Copy, Debug)]
pub struct RateLimit {
    /// Minimum spacing between consecutive backend requests.
    pub base_interval: Duration,
    /// Jitter added per active worker beyond the first.
    pub jitter_per_worker: Duration,
    /// Hard cap on the jitter span.
    pub jitter_cap: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(1),
            jitter_per_worker: Duration::from_millis(500),
            jitter_cap: Duration::from_secs(2),
        }
    }
}

/// Sleep needed before the next backend request.
///
/// `elapsed` is the time since the previous request (`None` for the first),
/// `active_workers` the latest population estimate, and `roll` a uniform
/// sample from `[0, 1)`. A lone worker gets deterministic spacing and no
/// jitter; each additional worker widens the jitter span until the cap.
pub fn pacing_delay(
    limit: &RateLimit,
    elapsed: Option<Duration>,
    active_workers: usize,
    roll: f64,
) -> Duration {
    let remaining = match elapsed {
        Some(elapsed) => limit.base_interval.saturating_sub(elapsed),
        None => Duration::ZERO,
    };
    let span = limit
        .jitter_per_worker
        .saturating_mul(active_workers.saturating_sub(1) as u32)
        .min(limit.jitter_cap);
    remaining + span.mul_f64(roll.clamp(0.0, 1.0))
}

/// Outcome classes of a gateway call. Either the call returned a fully
/// parsed value, or exactly one of these.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Transient backend errors outlasted the whole retry budget. Treated
    /// by callers as a missed loop iteration, never as row failure.
    #[error("transient backend errors exhausted after {attempts} attempts: {last}")]
    TransientExhausted { attempts: u32, last: String },
    /// The sheet does not exist. Permanent, except during first-contact
    /// initialization which answers it by creating the sheet.
    #[error("sheet '{0}' does not exist")]
    SheetMissing(String),
    /// Auth revoked, malformed range, poisoned state. Fatal to the worker.
    #[error("permanent backend error: {0}")]
    Permanent(String),
}

impl GatewayError {
    /// Transient exhaustion is a missed iteration, not a worker-fatal
    /// condition; everything else is.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::TransientExhausted { .. })
    }
}

struct Pacer {
    last_call: Option<Instant>,
}

/// The single process-wide mediator over the sheet backend.
pub struct Gateway {
    store: Arc<dyn SheetStore>,
    pacer: Mutex<Pacer>,
    limit: RateLimit,
    retry: RetryPolicy,
    active_workers: AtomicUsize,
}

impl Gateway {
    pub fn new(store: Arc<dyn SheetStore>, limit: RateLimit, retry: RetryPolicy) -> Self {
        Self {
            store,
            pacer: Mutex::new(Pacer { last_call: None }),
            limit,
            retry,
            active_workers: AtomicUsize::new(1),
        }
    }

    /// Updates the population estimate used for jitter sizing. Refreshed
    /// opportunistically by the orchestrator, at most once a minute.
    pub fn set_active_workers(&self, count: usize) {
        self.active_workers.store(count.max(1), Ordering::Relaxed);
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    pub fn read_all(&self, sheet: &str) -> Result<Vec<Vec<String>>, GatewayError> {
        self.call(|store| store.read_all(sheet))
    }

    pub fn read_row(&self, sheet: &str, row_number: usize) -> Result<Vec<String>, GatewayError> {
        self.call(|store| store.read_row(sheet, row_number))
    }

    pub fn append(&self, sheet: &str, row: &[String]) -> Result<(), GatewayError> {
        self.call(|store| store.append_row(sheet, row))
    }

    pub fn append_rows(&self, sheet: &str, rows: &[Vec<String>]) -> Result<(), GatewayError> {
        self.call(|store| store.append_rows(sheet, rows))
    }

    pub fn update_row(
        &self,
        sheet: &str,
        row_number: usize,
        row: &[String],
    ) -> Result<(), GatewayError> {
        self.call(|store| store.update_row(sheet, row_number, row))
    }

    /// Deletes by blanking the row in place, so peer row indices hold.
    pub fn delete_row(&self, sheet: &str, row_number: usize) -> Result<(), GatewayError> {
        self.call(|store| store.clear_row(sheet, row_number))
    }

    pub fn create_sheet(&self, sheet: &str) -> Result<(), GatewayError> {
        self.call(|store| store.create_sheet(sheet))
    }

    /// Runs one backend operation under the serialization lock, with pacing
    /// before every attempt and backoff between transient failures.
    fn call<T>(
        &self,
        op: impl Fn(&dyn SheetStore) -> Result<T, StoreError>,
    ) -> Result<T, GatewayError> {
        let mut pacer = self
            .pacer
            .lock()
            .map_err(|_| GatewayError::Permanent("gateway lock poisoned".to_string()))?;

        let mut attempt = 1;
        loop {
            let wait = pacing_delay(
                &self.limit,
                pacer.last_call.map(|at| at.elapsed()),
                self.active_workers(),
                rand::thread_rng().gen::<f64>(),
            );
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
            pacer.last_call = Some(Instant::now());

            match op(self.store.as_ref()) {
                Ok(value) => return Ok(value),
                Err(StoreError::SheetNotFound(sheet)) => {
                    return Err(GatewayError::SheetMissing(sheet));
                }
                Err(StoreError::Permanent(message)) => {
                    return Err(GatewayError::Permanent(message));
                }
                Err(StoreError::Transient(message)) => {
                    if attempt >= self.retry.attempts {
                        tracing::error!(
                            attempts = attempt,
                            error = %message,
                            "backend retries exhausted"
                        );
                        return Err(GatewayError::TransientExhausted {
                            attempts: attempt,
                            last: message,
                        });
                    }
                    let backoff = backoff_delay(&self.retry, attempt);
                    tracing::warn!(
                        attempt,
                        error = %message,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient backend error, retrying"
                    );
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
            }
        }
    }
}
