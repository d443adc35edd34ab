//! Worker configuration: required environment variables and protocol tuning.

use std::collections::HashMap;
use std::time::Duration;

use crate::gateway::{RateLimit, RetryPolicy};

const WORKER_NAME: &str = "WORKER_NAME";
const SPREADSHEET_ID: &str = "SPREADSHEET_ID";
const SERVICE_ACCOUNT_FILE: &str = "SERVICE_ACCOUNT_FILE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable '{0}' is required")]
    MissingVar(&'static str),
}

/// Identity and backend coordinates for one worker process.
///
/// An explicit value passed into the orchestrator at construction; there is
/// no process-wide configuration singleton.
#[derive(Clone, Debug)]
pub struct Config {
    /// Stable human identifier, unique per deployment.
    pub worker_name: String,
    /// Opaque workbook handle for the backend.
    pub spreadsheet_id: String,
    /// Path to backend credentials.
    pub service_account_file: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut envs = HashMap::new();
        for key in [WORKER_NAME, SPREADSHEET_ID, SERVICE_ACCOUNT_FILE] {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| -> Result<String, ConfigError> {
            envs.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingVar(key))
        };
        Ok(Self {
            worker_name: required(WORKER_NAME)?,
            spreadsheet_id: required(SPREADSHEET_ID)?,
            service_account_file: required(SERVICE_ACCOUNT_FILE)?,
        })
    }
}

/// Protocol tuning knobs. Defaults are the deployment values; tests shrink
/// the sleeps to zero.
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub rate_limit: RateLimit,
    pub retry: RetryPolicy,
    /// Window within which a heartbeat counts a worker as alive.
    pub active_window: Duration,
    /// How often the active-worker count is refreshed, at most.
    pub worker_refresh_interval: Duration,
    /// Leader lease time-to-live.
    pub lease_ttl: Duration,
    /// How often a held lease is renewed.
    pub lease_renew_interval: Duration,
    /// Age beyond which a CLAIMED row counts as abandoned.
    pub claim_ttl: Duration,
    /// Idle sleep between loop iterations when there is no work.
    pub poll_interval: Duration,
    /// Base for the read-back confirmation wait; the actual wait is a
    /// uniform sample from `[0.5 * base, 1.5 * base]`.
    pub readback_base: Duration,
    /// Task rows appended per backend request during fan-out.
    pub fanout_batch: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rate_limit: RateLimit::default(),
            retry: RetryPolicy::default(),
            active_window: Duration::from_secs(120),
            worker_refresh_interval: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(300),
            lease_renew_interval: Duration::from_secs(60),
            claim_ttl: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(5),
            readback_base: Duration::from_secs(2),
            fanout_batch: 10,
        }
    }
}

impl Settings {
    /// The read-back confirmation wait for a uniform `roll` in `[0, 1)`.
    pub fn readback_wait(&self, roll: f64) -> Duration {
        self.readback_base.mul_f64(0.5 + roll.clamp(0.0, 1.0))
    }
}

/// Converts a std duration to a chrono one for timestamp arithmetic.
pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
