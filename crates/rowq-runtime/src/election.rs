//! Lease-based leader election over the Leader Election sheet.
//!
//! A lease is an `(election_name, holder, expires_at)` row. The backend has
//! no compare-and-set, so two workers can both overwrite an expired lease;
//! the protocol tolerates the lost-update window with a read-back
//! confirmation: write, wait a jittered interval, re-read, and hold the
//! lease only if both the holder and the exact expiry we wrote survived.
//! The jitter matters: without it the last writer wins deterministically
//! and synchronized overwrites can livelock.

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::{chrono_duration, Settings};
use crate::gateway::{Gateway, GatewayError};
use crate::schema::{is_blank_row, LeaseRecord, ELECTION_SHEET};

/// The election coordinating Source fan-out.
pub const SOURCE_PROCESSOR_ELECTION: &str = "source_processor";

pub struct LeaderElection {
    election_name: String,
    worker_id: String,
}

impl LeaderElection {
    pub fn new(election_name: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            election_name: election_name.into(),
            worker_id: worker_id.into(),
        }
    }

    pub fn election_name(&self) -> &str {
        &self.election_name
    }

    /// Attempts to acquire (or renew) the lease. Returns whether this
    /// worker holds the lease after the read-back window closes.
    ///
    /// Holding a lease means: the first row for this election names us as
    /// holder with exactly the expiry we wrote. Anything else is a loss,
    /// including our own write being overwritten during the window.
    pub fn try_acquire(
        &self,
        gateway: &Gateway,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<bool, GatewayError> {
        let expires_at = now + chrono_duration(settings.lease_ttl);
        let desired = LeaseRecord {
            election_name: self.election_name.clone(),
            holder: self.worker_id.clone(),
            expires_at: Some(expires_at),
        };

        match self.find_lease(gateway)? {
            None => {
                gateway.append(ELECTION_SHEET, &desired.to_row())?;
            }
            Some((row_number, lease)) => {
                let renewing = lease.holder == self.worker_id;
                if !renewing && lease.is_valid(now) {
                    tracing::debug!(
                        election = %self.election_name,
                        holder = %lease.holder,
                        "lease held by another worker"
                    );
                    return Ok(false);
                }
                gateway.update_row(ELECTION_SHEET, row_number, &desired.to_row())?;
            }
        }

        self.confirm(gateway, settings, expires_at)
    }

    /// Voluntarily expires the lease so a peer can take over immediately.
    /// Best-effort: on a crash the lease simply runs out its TTL.
    pub fn release(
        &self,
        gateway: &Gateway,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        if let Some((row_number, lease)) = self.find_lease(gateway)? {
            if lease.holder == self.worker_id {
                let released = LeaseRecord {
                    expires_at: Some(now - chrono::Duration::seconds(1)),
                    ..lease
                };
                gateway.update_row(ELECTION_SHEET, row_number, &released.to_row())?;
                tracing::info!(election = %self.election_name, "released lease");
            }
        }
        Ok(())
    }

    /// First row matching this election, in sheet order. Concurrent first
    /// appends can leave duplicate rows behind; the first one is
    /// authoritative everywhere, so the extras stay inert.
    fn find_lease(
        &self,
        gateway: &Gateway,
    ) -> Result<Option<(usize, LeaseRecord)>, GatewayError> {
        let rows = gateway.read_all(ELECTION_SHEET)?;
        let mut matches = rows
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, row)| !is_blank_row(row.as_slice()))
            .map(|(index, row)| (index + 1, LeaseRecord::from_row(row)))
            .filter(|(_, lease)| lease.election_name == self.election_name);

        let first = matches.next();
        if matches.next().is_some() {
            tracing::warn!(
                election = %self.election_name,
                "duplicate election rows found; only the first is authoritative"
            );
        }
        Ok(first)
    }

    fn confirm(
        &self,
        gateway: &Gateway,
        settings: &Settings,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, GatewayError> {
        let wait = settings.readback_wait(rand::thread_rng().gen::<f64>());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }

        let held = match self.find_lease(gateway)? {
            Some((_, lease)) => {
                lease.holder == self.worker_id && lease.expires_at == Some(expires_at)
            }
            None => false,
        };
        if held {
            tracing::debug!(election = %self.election_name, "lease confirmed");
        } else {
            tracing::debug!(
                election = %self.election_name,
                "lease write lost during read-back window"
            );
        }
        Ok(held)
    }
}
