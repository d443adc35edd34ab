//! Spreadsheet-coordinated worker fleet runtime.
//!
//! Independent worker processes coordinate through a sheet-shaped backend
//! whose only primitives are range reads, range writes, and row appends.
//! This crate synthesizes the rest: claim-based ownership of queued rows,
//! lease-based leader election, a Pending → History | DLQ pipeline for
//! sources and tasks, and a serialized, rate-limited, retrying gateway in
//! front of the backend.
//!
//! Embedding programs construct a [Config], pick a [rowq_store::SheetStore]
//! implementation, and drive an [Orchestrator]: one iteration at a time via
//! [Orchestrator::process_next_task], or with the blocking
//! [Orchestrator::run] loop.

pub mod config;
pub mod election;
pub mod extractor;
pub mod gateway;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod schema;
pub mod shutdown;

pub use config::{Config, ConfigError, Settings};
pub use election::{LeaderElection, SOURCE_PROCESSOR_ELECTION};
pub use extractor::{
    is_canonical_video_id, parse_video_id, ExtractError, SourceExtractor, SourceMetadata,
    VideoEntry,
};
pub use gateway::{Gateway, GatewayError, RateLimit, RetryPolicy};
pub use orchestrator::{Orchestrator, TaskCallback};
pub use pipeline::{ClaimedRow, QueueItem, QueueSheets, WorkQueue, SOURCE_QUEUE, TASK_QUEUE};
pub use registry::WorkerRegistry;
pub use schema::{
    LeaseRecord, SourceRecord, TaskRecord, WorkStatus, WorkerRecord, WorkerStatus,
};
pub use shutdown::{ShutdownState, ShutdownToken};
