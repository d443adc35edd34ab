//! The worker orchestrator: claim a task, run the callback, settle; else
//! become leader, fan a source out into tasks.
//!
//! One instance per worker process. The loop is synchronous and every
//! backend touch goes through the gateway, so within this process all
//! operations are totally ordered. Task work takes priority over source
//! work: fan-out is useless while existing tasks are not draining.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use rowq_store::SheetStore;

use crate::config::{Config, Settings};
use crate::election::{LeaderElection, SOURCE_PROCESSOR_ELECTION};
use crate::extractor::{is_canonical_video_id, parse_video_id, SourceExtractor, SourceMetadata};
use crate::gateway::{Gateway, GatewayError};
use crate::pipeline::{WorkQueue, SOURCE_QUEUE, TASK_QUEUE};
use crate::registry::WorkerRegistry;
use crate::schema::{ensure_all_sheets, SourceRecord, TaskRecord, WorkStatus, TASKS_SHEET};
use crate::shutdown::ShutdownToken;

/// Per-task processing callback. Returning `Err` sends the task to the DLQ
/// with the message in its error cell.
pub type TaskCallback<'a> = dyn FnMut(&str) -> Result<(), String> + 'a;

pub struct Orchestrator {
    config: Config,
    settings: Settings,
    gateway: Arc<Gateway>,
    registry: WorkerRegistry,
    tasks: WorkQueue<TaskRecord>,
    sources: WorkQueue<SourceRecord>,
    election: LeaderElection,
    extractor: Option<Box<dyn SourceExtractor>>,
    shutdown_token: ShutdownToken,
    last_worker_refresh: Option<Instant>,
    /// `Some` while we believe we hold the source-processor lease.
    last_lease_renewal: Option<Instant>,
    stopped: bool,
}

impl Orchestrator {
    pub fn new(config: Config, store: Arc<dyn SheetStore>) -> Result<Self, GatewayError> {
        Self::with_settings(config, Settings::default(), store)
    }

    pub fn with_settings(
        config: Config,
        settings: Settings,
        store: Arc<dyn SheetStore>,
    ) -> Result<Self, GatewayError> {
        let gateway = Arc::new(Gateway::new(store, settings.rate_limit, settings.retry));

        // First contact doubles as the startup health check: an unreachable
        // or misconfigured backend fails construction.
        ensure_all_sheets(&gateway)?;

        let now = Utc::now();
        let registry = WorkerRegistry::register(&gateway, &config.worker_name, &settings, now)?;
        let election = LeaderElection::new(SOURCE_PROCESSOR_ELECTION, registry.worker_id());

        let mut orchestrator = Self {
            config,
            settings,
            gateway,
            registry,
            tasks: WorkQueue::new(TASK_QUEUE),
            sources: WorkQueue::new(SOURCE_QUEUE),
            election,
            extractor: None,
            shutdown_token: ShutdownToken::new(),
            last_worker_refresh: None,
            last_lease_renewal: None,
            stopped: false,
        };
        orchestrator.refresh_active_workers(now);
        Ok(orchestrator)
    }

    /// Enables the leader/source path. Workers without an extractor only
    /// drain tasks.
    pub fn with_extractor(mut self, extractor: Box<dyn SourceExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn worker_id(&self) -> &str {
        self.registry.worker_id()
    }

    /// Token the embedding program wires its signal handler to.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Appends a new PENDING source for the fleet to pick up.
    pub fn add_source(&self, url: &str) -> Result<SourceRecord, GatewayError> {
        let source = SourceRecord::pending(Uuid::new_v4().to_string(), url.to_string());
        self.gateway
            .append(SOURCE_QUEUE.pending, &source.to_row())?;
        tracing::info!(id = %source.id, url, "source queued");
        Ok(source)
    }

    /// Writes this worker's heartbeat and opportunistically refreshes the
    /// active-worker count used for rate-limit jitter.
    pub fn send_heartbeat(&mut self) -> Result<(), GatewayError> {
        let now = Utc::now();
        self.registry.send_heartbeat(&self.gateway, now)?;
        self.refresh_active_workers(now);
        Ok(())
    }

    /// One iteration of the work loop. Returns whether any work was done:
    /// a task settled (either way), or a source fanned out.
    pub fn process_next_task(&mut self, callback: &mut TaskCallback<'_>) -> Result<bool, GatewayError> {
        let now = Utc::now();

        loop {
            let Some(claimed) =
                self.tasks
                    .claim_next(&self.gateway, self.registry.worker_id(), &self.settings, now)?
            else {
                break;
            };

            // A duplicate of settled work means a fan-out was replayed after
            // a crash; drop it without running the callback.
            if self.tasks.settled_ids(&self.gateway)?.contains(claimed.item.id.as_str()) {
                tracing::warn!(id = %claimed.item.id, "duplicate of settled task; discarding");
                self.tasks
                    .discard(&self.gateway, &claimed, self.registry.worker_id())?;
                continue;
            }

            tracing::info!(id = %claimed.item.id, url = %claimed.item.url, "task claimed");
            let outcome = callback(&claimed.item.url);
            let settled_at = Utc::now();
            match outcome {
                Ok(()) => {
                    if self.tasks.settle_done(
                        &self.gateway,
                        &claimed,
                        self.registry.worker_id(),
                        settled_at,
                    )? {
                        self.registry.increment_tasks(&self.gateway)?;
                    }
                }
                Err(message) => {
                    self.tasks.settle_failed(
                        &self.gateway,
                        &claimed,
                        self.registry.worker_id(),
                        &message,
                        settled_at,
                    )?;
                }
            }
            return Ok(true);
        }

        // Take the extractor for the duration of the round so it can be
        // passed by reference while the round mutates self.
        let Some(extractor) = self.extractor.take() else {
            return Ok(false);
        };
        let outcome = match self.ensure_leadership(now) {
            Ok(true) => self.process_one_source(extractor.as_ref(), Utc::now()),
            Ok(false) => Ok(false),
            Err(error) => Err(error),
        };
        self.extractor = Some(extractor);
        outcome
    }

    /// Idempotent graceful release: final heartbeat with INACTIVE status,
    /// and the lease handed back if held.
    pub fn shutdown(&mut self) -> Result<(), GatewayError> {
        if self.stopped {
            return Ok(());
        }
        let now = Utc::now();
        if self.last_lease_renewal.is_some() {
            if let Err(error) = self.election.release(&self.gateway, now) {
                tracing::warn!(%error, "lease release failed; it will expire on its own");
            }
            self.last_lease_renewal = None;
        }
        self.registry.mark_inactive(&self.gateway, now)?;
        self.stopped = true;
        tracing::info!(worker = self.registry.worker_name(), "worker shut down");
        Ok(())
    }

    /// Blocking main loop: heartbeat, one unit of work, idle sleep when
    /// there is none. Runs until the shutdown token leaves RUNNING, then
    /// settles in-flight state and returns.
    pub fn run(&mut self, mut callback: impl FnMut(&str) -> Result<(), String>) -> Result<(), GatewayError> {
        tracing::info!(
            worker = self.registry.worker_name(),
            spreadsheet = %self.config.spreadsheet_id,
            "worker loop starting"
        );
        while self.shutdown_token.is_running() {
            if let Err(error) = self.send_heartbeat() {
                if !error.is_transient() {
                    return Err(error);
                }
                tracing::warn!(%error, "heartbeat missed");
                self.idle_sleep();
                continue;
            }

            match self.process_next_task(&mut callback) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("nothing to do");
                    self.idle_sleep();
                }
                Err(error) if error.is_transient() => {
                    tracing::warn!(%error, "iteration missed on backend trouble");
                    self.idle_sleep();
                }
                Err(error) => return Err(error),
            }
        }

        tracing::info!("shutdown requested, finishing up");
        self.shutdown()?;
        self.shutdown_token.terminate();
        Ok(())
    }

    /// Renews (or acquires) the source-processor lease, skipping the
    /// backend round-trip while a recent renewal is still fresh.
    fn ensure_leadership(&mut self, now: DateTime<Utc>) -> Result<bool, GatewayError> {
        if let Some(renewed) = self.last_lease_renewal {
            if renewed.elapsed() < self.settings.lease_renew_interval {
                return Ok(true);
            }
        }
        let held = self.election.try_acquire(&self.gateway, &self.settings, now)?;
        if held {
            self.last_lease_renewal = Some(Instant::now());
        } else if self.last_lease_renewal.take().is_some() {
            // In-flight source work stays CLAIMED; stale-claim recovery
            // will pick it up.
            tracing::warn!("source-processor lease lost");
        }
        Ok(held)
    }

    /// One leader round: claim one source, extract, fan out, settle. One
    /// source per iteration so task work can interleave.
    fn process_one_source(
        &mut self,
        extractor: &dyn SourceExtractor,
        now: DateTime<Utc>,
    ) -> Result<bool, GatewayError> {
        let Some(mut claimed) =
            self.sources
                .claim_next(&self.gateway, self.registry.worker_id(), &self.settings, now)?
        else {
            // Nothing queued; hand the lease back so another worker can
            // take over when sources appear.
            self.election.release(&self.gateway, now)?;
            self.last_lease_renewal = None;
            return Ok(false);
        };

        if claimed.item.id.is_empty() {
            claimed.item.id = Uuid::new_v4().to_string();
            self.sources.update_claimed(&self.gateway, &claimed)?;
        }

        tracing::info!(id = %claimed.item.id, url = %claimed.item.url, "source claimed");
        let extraction = extractor.extract(&claimed.item.url);
        match extraction {
            Ok(metadata) => {
                let created = self.fan_out(&claimed.item.id, &metadata, now)?;
                claimed.item.name = metadata.name.clone();
                claimed.item.video_count = Some(metadata.videos.len() as u64);
                self.sources.update_claimed(&self.gateway, &claimed)?;
                if self.sources.settle_done(
                    &self.gateway,
                    &claimed,
                    self.registry.worker_id(),
                    Utc::now(),
                )? {
                    self.registry.increment_sources(&self.gateway)?;
                }
                tracing::info!(
                    id = %claimed.item.id,
                    tasks_created = created,
                    "source fanned out"
                );
            }
            Err(error) => {
                tracing::warn!(id = %claimed.item.id, %error, "extraction failed");
                self.sources.settle_failed(
                    &self.gateway,
                    &claimed,
                    self.registry.worker_id(),
                    &error.to_string(),
                    Utc::now(),
                )?;
            }
        }
        Ok(true)
    }

    /// Appends one task per new video, in batches. Ids already present in
    /// Pending, History, or the DLQ are skipped, which makes fan-out
    /// idempotent under leader crash and retry. Entries without a canonical
    /// 11-character id are rejected individually.
    fn fan_out(
        &self,
        source_id: &str,
        metadata: &SourceMetadata,
        now: DateTime<Utc>,
    ) -> Result<usize, GatewayError> {
        let mut seen = self.tasks.pending_ids(&self.gateway)?;
        seen.extend(self.tasks.settled_ids(&self.gateway)?);

        let mut batch: Vec<Vec<String>> = Vec::new();
        let mut created = 0;
        let mut rejected = 0;

        for video in &metadata.videos {
            let id = if is_canonical_video_id(&video.id) {
                video.id.clone()
            } else if let Some(id) = parse_video_id(&video.url) {
                id.to_string()
            } else {
                tracing::warn!(
                    url = %video.url,
                    raw_id = %video.id,
                    "video entry without a canonical id; rejected"
                );
                rejected += 1;
                continue;
            };
            if !seen.insert(id.clone()) {
                tracing::debug!(%id, "video already tracked; skipped");
                continue;
            }

            let task = TaskRecord {
                id,
                source_id: source_id.to_string(),
                url: video.url.clone(),
                name: video.title.clone(),
                duration_seconds: video.duration_seconds,
                created_at: Some(now),
                claimed_at: None,
                completed_at: None,
                status: WorkStatus::Pending,
                assigned_worker: String::new(),
                extra: Vec::new(),
            };
            batch.push(task.to_row());
            if batch.len() >= self.settings.fanout_batch {
                self.gateway.append_rows(TASKS_SHEET, &batch)?;
                created += batch.len();
                batch.clear();
            }
        }
        if !batch.is_empty() {
            created += batch.len();
            self.gateway.append_rows(TASKS_SHEET, &batch)?;
        }
        if rejected > 0 {
            tracing::warn!(rejected, "video entries rejected during fan-out");
        }
        Ok(created)
    }

    fn refresh_active_workers(&mut self, now: DateTime<Utc>) {
        if let Some(refreshed) = self.last_worker_refresh {
            if refreshed.elapsed() < self.settings.worker_refresh_interval {
                return;
            }
        }
        match self.registry.active_workers(&self.gateway, now) {
            Ok(count) => {
                self.gateway.set_active_workers(count);
                self.last_worker_refresh = Some(Instant::now());
            }
            Err(error) => {
                tracing::warn!(%error, "active-worker refresh failed; keeping previous count");
            }
        }
    }

    /// Poll-interval sleep in short slices so a shutdown signal cuts the
    /// wait short.
    fn idle_sleep(&self) {
        let deadline = Instant::now() + self.settings.poll_interval;
        while self.shutdown_token.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{RateLimit, RetryPolicy};
    use rowq_store::InMemorySheetStore;

    fn test_settings() -> Settings {
        Settings {
            rate_limit: RateLimit {
                base_interval: Duration::ZERO,
                jitter_per_worker: Duration::ZERO,
                jitter_cap: Duration::ZERO,
            },
            retry: RetryPolicy {
                attempts: 2,
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            readback_base: Duration::ZERO,
            poll_interval: Duration::ZERO,
            ..Settings::default()
        }
    }

    fn config(name: &str) -> Config {
        Config {
            worker_name: name.to_string(),
            spreadsheet_id: "workbook-test".to_string(),
            service_account_file: "/dev/null".to_string(),
        }
    }

    #[test]
    fn without_an_extractor_the_source_path_is_skipped() {
        let store = InMemorySheetStore::new();
        let mut orchestrator =
            Orchestrator::with_settings(config("alpha"), test_settings(), Arc::new(store.clone()))
                .expect("construct");
        orchestrator.add_source("https://youtube.com/playlist?list=X").expect("queue");

        let mut callback = |_: &str| -> Result<(), String> { panic!("no tasks exist") };
        let worked = orchestrator
            .process_next_task(&mut callback)
            .expect("iterate");
        assert!(!worked, "no tasks and no extractor means no work");

        // the source is still pending and unclaimed
        let rows = store.read_all(SOURCE_QUEUE.pending).expect("read");
        let source = SourceRecord::from_row(&rows[1]);
        assert_eq!(source.status, WorkStatus::Pending);
        assert!(source.assigned_worker.is_empty());
    }

    #[test]
    fn add_source_appends_a_pending_row_with_an_id() {
        let store = InMemorySheetStore::new();
        let orchestrator =
            Orchestrator::with_settings(config("alpha"), test_settings(), Arc::new(store.clone()))
                .expect("construct");

        let source = orchestrator
            .add_source("https://youtube.com/playlist?list=X")
            .expect("queue");
        assert!(!source.id.is_empty());

        let rows = store.read_all(SOURCE_QUEUE.pending).expect("read");
        assert_eq!(rows.len(), 2);
        let stored = SourceRecord::from_row(&rows[1]);
        assert_eq!(stored.id, source.id);
        assert_eq!(stored.status, WorkStatus::Pending);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let store = InMemorySheetStore::new();
        let mut orchestrator =
            Orchestrator::with_settings(config("alpha"), test_settings(), Arc::new(store.clone()))
                .expect("construct");
        orchestrator.shutdown().expect("first shutdown");
        let ops_after_first = store.op_count();
        orchestrator.shutdown().expect("second shutdown");
        assert_eq!(store.op_count(), ops_after_first, "second shutdown is a no-op");
    }
}
