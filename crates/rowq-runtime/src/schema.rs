//! Sheet schemas and the positional row codec.
//!
//! Column order is part of the external contract: every sheet has a fixed
//! ordered header, records encode positionally, missing trailing cells are
//! padded on decode, and unknown trailing cells are carried through
//! round-trips (the DLQ error cell rides in that tail). Status cells decode
//! to an `Unknown` sentinel instead of failing, so one corrupted cell never
//! poisons a whole sheet scan.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::{Gateway, GatewayError};

pub const WORKERS_SHEET: &str = "Workers";
pub const SOURCES_SHEET: &str = "Sources";
pub const SOURCES_HISTORY_SHEET: &str = "Sources History";
pub const SOURCES_DLQ_SHEET: &str = "Sources DLQ";
pub const TASKS_SHEET: &str = "Tasks";
pub const TASKS_HISTORY_SHEET: &str = "Tasks History";
pub const TASKS_DLQ_SHEET: &str = "Tasks DLQ";
pub const ELECTION_SHEET: &str = "Leader Election";

pub const WORKERS_HEADER: &[&str] = &[
    "worker_id",
    "worker_name",
    "last_heartbeat",
    "status",
    "tasks_processed",
    "sources_processed",
];

pub const SOURCES_HEADER: &[&str] = &[
    "id",
    "url",
    "name",
    "video_count",
    "claimed_at",
    "completed_at",
    "status",
    "assigned_worker",
];

pub const TASKS_HEADER: &[&str] = &[
    "id",
    "source_id",
    "url",
    "name",
    "duration",
    "created_at",
    "claimed_at",
    "completed_at",
    "status",
    "assigned_worker",
];

pub const ELECTION_HEADER: &[&str] = &["election_name", "holder", "expires_at"];

/// Every sheet the runtime touches, paired with its header.
pub const ALL_SHEETS: &[(&str, &[&str])] = &[
    (WORKERS_SHEET, WORKERS_HEADER),
    (SOURCES_SHEET, SOURCES_HEADER),
    (SOURCES_HISTORY_SHEET, SOURCES_HEADER),
    (SOURCES_DLQ_SHEET, SOURCES_HEADER),
    (TASKS_SHEET, TASKS_HEADER),
    (TASKS_HISTORY_SHEET, TASKS_HEADER),
    (TASKS_DLQ_SHEET, TASKS_HEADER),
    (ELECTION_SHEET, ELECTION_HEADER),
];

/// Encodes a timestamp the way every sheet stores them: RFC 3339, UTC.
/// Nanosecond precision so any in-memory timestamp round-trips exactly.
pub fn encode_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Decodes a sheet timestamp cell. Blank or unparseable cells decode to
/// `None`; callers treat missing timestamps as "never".
pub fn decode_timestamp(cell: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(cell.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(String::as_str).unwrap_or("")
}

fn tail(row: &[String], from: usize) -> Vec<String> {
    if row.len() > from {
        row[from..].to_vec()
    } else {
        Vec::new()
    }
}

/// True when every cell of the row is blank. Cleared rows stay in place to
/// keep peer row indices stable, so all scans skip blank rows.
pub fn is_blank_row(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

/// Liveness state of a worker row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Active,
    Inactive,
    /// Anything outside the enum vocabulary; the raw cell is preserved.
    Unknown(String),
}

impl WorkerStatus {
    pub fn as_str(&self) -> &str {
        match self {
            WorkerStatus::Active => "ACTIVE",
            WorkerStatus::Inactive => "INACTIVE",
            WorkerStatus::Unknown(raw) => raw,
        }
    }

    pub fn parse(cell: &str) -> Self {
        match cell {
            "ACTIVE" => WorkerStatus::Active,
            "INACTIVE" => WorkerStatus::Inactive,
            other => WorkerStatus::Unknown(other.to_string()),
        }
    }
}

/// Pipeline state of a Source or Task row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkStatus {
    Pending,
    Claimed,
    Done,
    Failed,
    /// Anything outside the enum vocabulary. Never claimable.
    Unknown(String),
}

impl WorkStatus {
    pub fn as_str(&self) -> &str {
        match self {
            WorkStatus::Pending => "PENDING",
            WorkStatus::Claimed => "CLAIMED",
            WorkStatus::Done => "DONE",
            WorkStatus::Failed => "FAILED",
            WorkStatus::Unknown(raw) => raw,
        }
    }

    pub fn parse(cell: &str) -> Self {
        match cell {
            "PENDING" => WorkStatus::Pending,
            "CLAIMED" => WorkStatus::Claimed,
            "DONE" => WorkStatus::Done,
            "FAILED" => WorkStatus::Failed,
            other => WorkStatus::Unknown(other.to_string()),
        }
    }
}

/// One row of the Workers sheet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub worker_name: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub status: WorkerStatus,
    pub tasks_processed: u64,
    pub sources_processed: u64,
    /// Trailing columns beyond the fixed header, preserved on round-trip.
    pub extra: Vec<String>,
}

impl WorkerRecord {
    pub fn new(worker_id: String, worker_name: String, now: DateTime<Utc>) -> Self {
        Self {
            worker_id,
            worker_name,
            last_heartbeat: Some(now),
            status: WorkerStatus::Active,
            tasks_processed: 0,
            sources_processed: 0,
            extra: Vec::new(),
        }
    }

    pub fn from_row(row: &[String]) -> Self {
        Self {
            worker_id: cell(row, 0).to_string(),
            worker_name: cell(row, 1).to_string(),
            last_heartbeat: decode_timestamp(cell(row, 2)),
            status: WorkerStatus::parse(cell(row, 3)),
            tasks_processed: cell(row, 4).trim().parse().unwrap_or(0),
            sources_processed: cell(row, 5).trim().parse().unwrap_or(0),
            extra: tail(row, WORKERS_HEADER.len()),
        }
    }

    pub fn to_row(&self) -> Vec<String> {
        let mut row = vec![
            self.worker_id.clone(),
            self.worker_name.clone(),
            self.last_heartbeat.map(encode_timestamp).unwrap_or_default(),
            self.status.as_str().to_string(),
            self.tasks_processed.to_string(),
            self.sources_processed.to_string(),
        ];
        row.extend(self.extra.iter().cloned());
        row
    }
}

/// One row of a Sources sheet (Pending, History, or DLQ).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Empty until the leader assigns one on claim.
    pub id: String,
    pub url: String,
    pub name: String,
    pub video_count: Option<u64>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: WorkStatus,
    pub assigned_worker: String,
    pub extra: Vec<String>,
}

impl SourceRecord {
    /// A fresh PENDING source for programmatic submission.
    pub fn pending(id: String, url: String) -> Self {
        Self {
            id,
            url,
            name: String::new(),
            video_count: None,
            claimed_at: None,
            completed_at: None,
            status: WorkStatus::Pending,
            assigned_worker: String::new(),
            extra: Vec::new(),
        }
    }

    pub fn from_row(row: &[String]) -> Self {
        Self {
            id: cell(row, 0).to_string(),
            url: cell(row, 1).to_string(),
            name: cell(row, 2).to_string(),
            video_count: cell(row, 3).trim().parse().ok(),
            claimed_at: decode_timestamp(cell(row, 4)),
            completed_at: decode_timestamp(cell(row, 5)),
            status: WorkStatus::parse(cell(row, 6)),
            assigned_worker: cell(row, 7).to_string(),
            extra: tail(row, SOURCES_HEADER.len()),
        }
    }

    pub fn to_row(&self) -> Vec<String> {
        let mut row = vec![
            self.id.clone(),
            self.url.clone(),
            self.name.clone(),
            self.video_count.map(|n| n.to_string()).unwrap_or_default(),
            self.claimed_at.map(encode_timestamp).unwrap_or_default(),
            self.completed_at.map(encode_timestamp).unwrap_or_default(),
            self.status.as_str().to_string(),
            self.assigned_worker.clone(),
        ];
        row.extend(self.extra.iter().cloned());
        row
    }
}

/// One row of a Tasks sheet (Pending, History, or DLQ).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Canonical 11-character video id; the global dedup key.
    pub id: String,
    pub source_id: String,
    pub url: String,
    pub name: String,
    pub duration_seconds: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: WorkStatus,
    pub assigned_worker: String,
    pub extra: Vec<String>,
}

impl TaskRecord {
    pub fn from_row(row: &[String]) -> Self {
        Self {
            id: cell(row, 0).to_string(),
            source_id: cell(row, 1).to_string(),
            url: cell(row, 2).to_string(),
            name: cell(row, 3).to_string(),
            duration_seconds: cell(row, 4).trim().parse().ok(),
            created_at: decode_timestamp(cell(row, 5)),
            claimed_at: decode_timestamp(cell(row, 6)),
            completed_at: decode_timestamp(cell(row, 7)),
            status: WorkStatus::parse(cell(row, 8)),
            assigned_worker: cell(row, 9).to_string(),
            extra: tail(row, TASKS_HEADER.len()),
        }
    }

    pub fn to_row(&self) -> Vec<String> {
        let mut row = vec![
            self.id.clone(),
            self.source_id.clone(),
            self.url.clone(),
            self.name.clone(),
            self.duration_seconds
                .map(|n| n.to_string())
                .unwrap_or_default(),
            self.created_at.map(encode_timestamp).unwrap_or_default(),
            self.claimed_at.map(encode_timestamp).unwrap_or_default(),
            self.completed_at.map(encode_timestamp).unwrap_or_default(),
            self.status.as_str().to_string(),
            self.assigned_worker.clone(),
        ];
        row.extend(self.extra.iter().cloned());
        row
    }
}

/// One row of the Leader Election sheet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub election_name: String,
    pub holder: String,
    /// Unparseable expiry cells decode to `None` and count as expired.
    pub expires_at: Option<DateTime<Utc>>,
}

impl LeaseRecord {
    pub fn from_row(row: &[String]) -> Self {
        Self {
            election_name: cell(row, 0).to_string(),
            holder: cell(row, 1).to_string(),
            expires_at: decode_timestamp(cell(row, 2)),
        }
    }

    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.election_name.clone(),
            self.holder.clone(),
            self.expires_at.map(encode_timestamp).unwrap_or_default(),
        ]
    }

    /// A lease is valid only strictly before its expiry; `expires_at == now`
    /// counts as expired.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.holder.is_empty() && self.expires_at.map(|at| at > now).unwrap_or(false)
    }
}

/// Initializes a sheet on first contact: creates it if the workbook lacks
/// it, and writes the header row when the first row is empty.
pub fn ensure_sheet(
    gateway: &Gateway,
    sheet: &str,
    header: &[&str],
) -> Result<(), GatewayError> {
    let rows = match gateway.read_all(sheet) {
        Ok(rows) => rows,
        Err(GatewayError::SheetMissing(_)) => {
            gateway.create_sheet(sheet)?;
            Vec::new()
        }
        Err(e) => return Err(e),
    };

    let header_row: Vec<String> = header.iter().map(|c| (*c).to_string()).collect();
    match rows.first() {
        None => gateway.append(sheet, &header_row),
        Some(first) if is_blank_row(first) => gateway.update_row(sheet, 1, &header_row),
        Some(_) => Ok(()),
    }
}

/// Initializes every sheet the runtime uses.
pub fn ensure_all_sheets(gateway: &Gateway) -> Result<(), GatewayError> {
    for &(sheet, header) in ALL_SHEETS {
        ensure_sheet(gateway, sheet, header)?;
    }
    Ok(())
}
