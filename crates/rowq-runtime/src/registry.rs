//! This worker's identity row in the Workers sheet.
//!
//! Exactly one row per worker name: startup adopts an existing row (keeping
//! its id and counters) or appends a fresh one. Peers never write each
//! other's rows, so heartbeat and counter updates are race-free by
//! ownership; the gateway serializes this process's own calls.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{chrono_duration, Settings};
use crate::gateway::{Gateway, GatewayError};
use crate::schema::{
    encode_timestamp, is_blank_row, WorkerRecord, WorkerStatus, WORKERS_SHEET,
};

pub struct WorkerRegistry {
    worker_id: String,
    worker_name: String,
    row_number: usize,
    active_window: chrono::Duration,
}

impl WorkerRegistry {
    /// Registers this worker, adopting the existing row for `worker_name`
    /// when one exists and appending a new one otherwise.
    pub fn register(
        gateway: &Gateway,
        worker_name: &str,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<Self, GatewayError> {
        let active_window = chrono_duration(settings.active_window);
        let rows = gateway.read_all(WORKERS_SHEET)?;

        let existing = rows
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, row)| !is_blank_row(row.as_slice()))
            .map(|(index, row)| (index + 1, WorkerRecord::from_row(row)))
            .find(|(_, record)| record.worker_name == worker_name);

        if let Some((row_number, mut record)) = existing {
            if let Some(last) = record.last_heartbeat {
                if record.status == WorkerStatus::Active && now - last < active_window {
                    tracing::warn!(
                        worker_name,
                        last_heartbeat = %encode_timestamp(last),
                        "adopting a worker row with a fresh heartbeat; \
                         another process may still be using this name"
                    );
                }
            }
            if record.worker_id.is_empty() {
                record.worker_id = Uuid::new_v4().to_string();
            }
            record.status = WorkerStatus::Active;
            record.last_heartbeat = Some(now);
            gateway.update_row(WORKERS_SHEET, row_number, &record.to_row())?;
            tracing::info!(
                worker_name,
                worker_id = %record.worker_id,
                row_number,
                tasks_processed = record.tasks_processed,
                "recovered worker session"
            );
            return Ok(Self {
                worker_id: record.worker_id,
                worker_name: worker_name.to_string(),
                row_number,
                active_window,
            });
        }

        let record = WorkerRecord::new(
            Uuid::new_v4().to_string(),
            worker_name.to_string(),
            now,
        );
        gateway.append(WORKERS_SHEET, &record.to_row())?;

        // Locate the appended row; concurrent appends can land first.
        let rows = gateway.read_all(WORKERS_SHEET)?;
        let row_number = rows
            .iter()
            .position(|row| WorkerRecord::from_row(row).worker_id == record.worker_id)
            .map(|index| index + 1)
            .ok_or_else(|| {
                GatewayError::Permanent("worker row not found after registration".to_string())
            })?;

        tracing::info!(
            worker_name,
            worker_id = %record.worker_id,
            row_number,
            "registered new worker"
        );
        Ok(Self {
            worker_id: record.worker_id,
            worker_name: worker_name.to_string(),
            row_number,
            active_window,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Writes the current time into this worker's heartbeat cell.
    pub fn send_heartbeat(&self, gateway: &Gateway, now: DateTime<Utc>) -> Result<(), GatewayError> {
        let mut record = self.own_record(gateway)?;
        if let Some(last) = record.last_heartbeat {
            if last > now {
                tracing::warn!(
                    recorded = %encode_timestamp(last),
                    now = %encode_timestamp(now),
                    "clock warp detected; heartbeat moving backwards"
                );
            }
        }
        record.status = WorkerStatus::Active;
        record.last_heartbeat = Some(now);
        gateway.update_row(WORKERS_SHEET, self.row_number, &record.to_row())
    }

    /// Number of workers with ACTIVE status and a heartbeat inside the
    /// active window. Stale peers are only discounted, never edited.
    pub fn active_workers(&self, gateway: &Gateway, now: DateTime<Utc>) -> Result<usize, GatewayError> {
        let rows = gateway.read_all(WORKERS_SHEET)?;
        Ok(rows
            .iter()
            .skip(1)
            .filter(|row| !is_blank_row(row.as_slice()))
            .map(|row| WorkerRecord::from_row(row))
            .filter(|record| {
                record.status == WorkerStatus::Active
                    && record
                        .last_heartbeat
                        .map(|last| now - last <= self.active_window)
                        .unwrap_or(false)
            })
            .count())
    }

    pub fn increment_tasks(&self, gateway: &Gateway) -> Result<u64, GatewayError> {
        let mut record = self.own_record(gateway)?;
        record.tasks_processed += 1;
        gateway.update_row(WORKERS_SHEET, self.row_number, &record.to_row())?;
        Ok(record.tasks_processed)
    }

    pub fn increment_sources(&self, gateway: &Gateway) -> Result<u64, GatewayError> {
        let mut record = self.own_record(gateway)?;
        record.sources_processed += 1;
        gateway.update_row(WORKERS_SHEET, self.row_number, &record.to_row())?;
        Ok(record.sources_processed)
    }

    /// Flips this worker to INACTIVE with one final heartbeat.
    pub fn mark_inactive(&self, gateway: &Gateway, now: DateTime<Utc>) -> Result<(), GatewayError> {
        let mut record = self.own_record(gateway)?;
        record.status = WorkerStatus::Inactive;
        record.last_heartbeat = Some(now);
        gateway.update_row(WORKERS_SHEET, self.row_number, &record.to_row())
    }

    fn own_record(&self, gateway: &Gateway) -> Result<WorkerRecord, GatewayError> {
        let row = gateway.read_row(WORKERS_SHEET, self.row_number)?;
        let record = WorkerRecord::from_row(&row);
        if record.worker_id != self.worker_id {
            return Err(GatewayError::Permanent(format!(
                "worker row {} no longer holds worker '{}'",
                self.row_number, self.worker_name
            )));
        }
        Ok(record)
    }
}
