//! The three-stage pipeline: claim, settle, and the dedup surfaces.
//!
//! A queue is a Pending/History/DLQ sheet triple with one row schema.
//! Claiming synthesizes at-most-one-winner ownership out of plain reads and
//! writes: write the claim, wait a jittered read-back window, re-read, and
//! keep the row only if our write survived. Settling is append-then-delete,
//! in that order, so a crash between the two can duplicate a record into
//! History but never lose it.

use std::collections::HashSet;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::{chrono_duration, Settings};
use crate::gateway::{Gateway, GatewayError};
use crate::schema::{
    is_blank_row, SourceRecord, TaskRecord, WorkStatus, SOURCES_DLQ_SHEET,
    SOURCES_HISTORY_SHEET, SOURCES_SHEET, TASKS_DLQ_SHEET, TASKS_HISTORY_SHEET, TASKS_SHEET,
};

/// A row that can move through a Pending/History/DLQ triple.
pub trait QueueItem: Clone {
    fn from_row(row: &[String]) -> Self;
    fn to_row(&self) -> Vec<String>;
    fn item_id(&self) -> &str;
    fn status(&self) -> &WorkStatus;
    fn assigned_worker(&self) -> &str;
    fn claimed_at(&self) -> Option<DateTime<Utc>>;
    fn begin_claim(&mut self, worker_id: &str, now: DateTime<Utc>);
    fn mark_done(&mut self, now: DateTime<Utc>);
    fn mark_failed(&mut self, now: DateTime<Utc>);
    /// Appends the DLQ error cell after the fixed columns.
    fn set_error(&mut self, message: &str);
}

impl QueueItem for TaskRecord {
    fn from_row(row: &[String]) -> Self {
        TaskRecord::from_row(row)
    }
    fn to_row(&self) -> Vec<String> {
        TaskRecord::to_row(self)
    }
    fn item_id(&self) -> &str {
        &self.id
    }
    fn status(&self) -> &WorkStatus {
        &self.status
    }
    fn assigned_worker(&self) -> &str {
        &self.assigned_worker
    }
    fn claimed_at(&self) -> Option<DateTime<Utc>> {
        self.claimed_at
    }
    fn begin_claim(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = WorkStatus::Claimed;
        self.assigned_worker = worker_id.to_string();
        self.claimed_at = Some(now);
    }
    fn mark_done(&mut self, now: DateTime<Utc>) {
        self.status = WorkStatus::Done;
        self.completed_at = Some(now);
    }
    fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.status = WorkStatus::Failed;
        self.completed_at = Some(now);
    }
    fn set_error(&mut self, message: &str) {
        self.extra.push(message.to_string());
    }
}

impl QueueItem for SourceRecord {
    fn from_row(row: &[String]) -> Self {
        SourceRecord::from_row(row)
    }
    fn to_row(&self) -> Vec<String> {
        SourceRecord::to_row(self)
    }
    fn item_id(&self) -> &str {
        &self.id
    }
    fn status(&self) -> &WorkStatus {
        &self.status
    }
    fn assigned_worker(&self) -> &str {
        &self.assigned_worker
    }
    fn claimed_at(&self) -> Option<DateTime<Utc>> {
        self.claimed_at
    }
    fn begin_claim(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = WorkStatus::Claimed;
        self.assigned_worker = worker_id.to_string();
        self.claimed_at = Some(now);
    }
    fn mark_done(&mut self, now: DateTime<Utc>) {
        self.status = WorkStatus::Done;
        self.completed_at = Some(now);
    }
    fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.status = WorkStatus::Failed;
        self.completed_at = Some(now);
    }
    fn set_error(&mut self, message: &str) {
        self.extra.push(message.to_string());
    }
}

/// The sheet triple backing one queue.
#[derive(Clone, Copy, Debug)]
pub struct QueueSheets {
    pub pending: &'static str,
    pub history: &'static str,
    pub dlq: &'static str,
}

pub const TASK_QUEUE: QueueSheets = QueueSheets {
    pending: TASKS_SHEET,
    history: TASKS_HISTORY_SHEET,
    dlq: TASKS_DLQ_SHEET,
};

pub const SOURCE_QUEUE: QueueSheets = QueueSheets {
    pending: SOURCES_SHEET,
    history: SOURCES_HISTORY_SHEET,
    dlq: SOURCES_DLQ_SHEET,
};

/// A claimed pending row: its sheet position plus the claimed record.
#[derive(Clone, Debug)]
pub struct ClaimedRow<T> {
    pub row_number: usize,
    pub item: T,
}

pub struct WorkQueue<T: QueueItem> {
    sheets: QueueSheets,
    _marker: PhantomData<fn() -> T>,
}

impl<T: QueueItem> WorkQueue<T> {
    pub const fn new(sheets: QueueSheets) -> Self {
        Self {
            sheets,
            _marker: PhantomData,
        }
    }

    pub fn sheets(&self) -> &QueueSheets {
        &self.sheets
    }

    /// A row is claimable when it is PENDING and unowned, or CLAIMED but
    /// abandoned past the claim TTL. A CLAIMED row without a readable
    /// claim timestamp cannot be aged, so it counts as abandoned.
    fn is_claimable(item: &T, now: DateTime<Utc>, claim_ttl: chrono::Duration) -> bool {
        match item.status() {
            WorkStatus::Pending => item.assigned_worker().is_empty(),
            WorkStatus::Claimed => item
                .claimed_at()
                .map(|at| now - at > claim_ttl)
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Claims the first claimable pending row, confirming each attempt via
    /// read-back. Losing the race for one candidate moves on to the next;
    /// `None` means the queue holds nothing claimable right now.
    pub fn claim_next(
        &self,
        gateway: &Gateway,
        worker_id: &str,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedRow<T>>, GatewayError> {
        let claim_ttl = chrono_duration(settings.claim_ttl);
        let rows = gateway.read_all(self.sheets.pending)?;

        for (index, row) in rows.iter().enumerate().skip(1) {
            let row_number = index + 1;
            if is_blank_row(row) {
                continue;
            }
            let item = T::from_row(row);
            if !Self::is_claimable(&item, now, claim_ttl) {
                continue;
            }
            if *item.status() == WorkStatus::Claimed {
                tracing::info!(
                    sheet = self.sheets.pending,
                    id = item.item_id(),
                    abandoned_by = item.assigned_worker(),
                    "reclaiming abandoned row"
                );
            }

            let mut claimed = item;
            claimed.begin_claim(worker_id, now);
            gateway.update_row(self.sheets.pending, row_number, &claimed.to_row())?;

            let wait = settings.readback_wait(rand::thread_rng().gen::<f64>());
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }

            let fresh = T::from_row(&gateway.read_row(self.sheets.pending, row_number)?);
            if fresh.assigned_worker() == worker_id && *fresh.status() == WorkStatus::Claimed {
                tracing::debug!(
                    sheet = self.sheets.pending,
                    id = claimed.item_id(),
                    row_number,
                    "claim confirmed"
                );
                return Ok(Some(ClaimedRow { row_number, item: claimed }));
            }
            tracing::debug!(
                sheet = self.sheets.pending,
                row_number,
                winner = fresh.assigned_worker(),
                "lost claim race, trying next candidate"
            );
        }
        Ok(None)
    }

    /// Rewrites a claimed row in place (id assignment, extraction results).
    pub fn update_claimed(
        &self,
        gateway: &Gateway,
        claimed: &ClaimedRow<T>,
    ) -> Result<(), GatewayError> {
        gateway.update_row(self.sheets.pending, claimed.row_number, &claimed.item.to_row())
    }

    /// Moves a claimed row to History as DONE. Returns false when the row
    /// is no longer ours, in which case nothing is written.
    pub fn settle_done(
        &self,
        gateway: &Gateway,
        claimed: &ClaimedRow<T>,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, GatewayError> {
        if !self.verify_ownership(gateway, claimed.row_number, worker_id)? {
            return Ok(false);
        }
        let mut item = claimed.item.clone();
        item.mark_done(now);
        // Append before delete: a crash here duplicates, never loses.
        gateway.append(self.sheets.history, &item.to_row())?;
        gateway.delete_row(self.sheets.pending, claimed.row_number)?;
        tracing::info!(sheet = self.sheets.history, id = item.item_id(), "settled DONE");
        Ok(true)
    }

    /// Moves a claimed row to the DLQ as FAILED with the error message in
    /// the trailing cell. Same ownership and ordering rules as
    /// [WorkQueue::settle_done].
    pub fn settle_failed(
        &self,
        gateway: &Gateway,
        claimed: &ClaimedRow<T>,
        worker_id: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, GatewayError> {
        if !self.verify_ownership(gateway, claimed.row_number, worker_id)? {
            return Ok(false);
        }
        let mut item = claimed.item.clone();
        item.mark_failed(now);
        item.set_error(error_message);
        gateway.append(self.sheets.dlq, &item.to_row())?;
        gateway.delete_row(self.sheets.pending, claimed.row_number)?;
        tracing::warn!(
            sheet = self.sheets.dlq,
            id = item.item_id(),
            error = error_message,
            "settled FAILED"
        );
        Ok(true)
    }

    /// Drops a claimed row without settling it anywhere; used for
    /// duplicates of already-settled work.
    pub fn discard(
        &self,
        gateway: &Gateway,
        claimed: &ClaimedRow<T>,
        worker_id: &str,
    ) -> Result<bool, GatewayError> {
        if !self.verify_ownership(gateway, claimed.row_number, worker_id)? {
            return Ok(false);
        }
        gateway.delete_row(self.sheets.pending, claimed.row_number)?;
        Ok(true)
    }

    /// Ids already settled into History or the DLQ.
    pub fn settled_ids(&self, gateway: &Gateway) -> Result<HashSet<String>, GatewayError> {
        let mut ids = HashSet::new();
        for sheet in [self.sheets.history, self.sheets.dlq] {
            collect_ids(gateway, sheet, &mut ids)?;
        }
        Ok(ids)
    }

    /// Ids currently sitting in Pending.
    pub fn pending_ids(&self, gateway: &Gateway) -> Result<HashSet<String>, GatewayError> {
        let mut ids = HashSet::new();
        collect_ids(gateway, self.sheets.pending, &mut ids)?;
        Ok(ids)
    }

    /// Re-reads the row's owner cell right before a critical write, so a
    /// stolen or recovered row is never settled twice.
    fn verify_ownership(
        &self,
        gateway: &Gateway,
        row_number: usize,
        worker_id: &str,
    ) -> Result<bool, GatewayError> {
        let row = gateway.read_row(self.sheets.pending, row_number)?;
        if is_blank_row(&row) {
            tracing::warn!(
                sheet = self.sheets.pending,
                row_number,
                "ownership check found a blank row; skipping write"
            );
            return Ok(false);
        }
        let owner_matches = T::from_row(&row).assigned_worker() == worker_id;
        if !owner_matches {
            tracing::warn!(
                sheet = self.sheets.pending,
                row_number,
                "ownership lost before settle; skipping write"
            );
        }
        Ok(owner_matches)
    }
}

fn collect_ids(
    gateway: &Gateway,
    sheet: &str,
    ids: &mut HashSet<String>,
) -> Result<(), GatewayError> {
    for row in gateway.read_all(sheet)?.iter().skip(1) {
        if is_blank_row(row) {
            continue;
        }
        if let Some(id) = row.first() {
            if !id.trim().is_empty() {
                ids.insert(id.trim().to_string());
            }
        }
    }
    Ok(())
}
