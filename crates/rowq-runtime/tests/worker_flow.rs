//! Whole-worker scenarios driven against the in-process sheet store.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use rowq_runtime::schema::{
    ELECTION_SHEET, SOURCES_DLQ_SHEET, SOURCES_HISTORY_SHEET, SOURCES_SHEET, TASKS_DLQ_SHEET,
    TASKS_HISTORY_SHEET, TASKS_SHEET, WORKERS_SHEET,
};
use rowq_runtime::{
    Config, ExtractError, Orchestrator, RateLimit, RetryPolicy, Settings, SourceMetadata,
    SourceRecord, TaskRecord, VideoEntry, WorkStatus, WorkerRecord, WorkerStatus,
};
use rowq_store::{InMemorySheetStore, SheetStore};

fn fast_settings() -> Settings {
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

fn worker(name: &str, store: &InMemorySheetStore) -> Orchestrator {
    Orchestrator::with_settings(config(name), fast_settings(), Arc::new(store.clone()))
        .expect("worker construction")
}

fn playlist_extractor(name: &str, ids: &[&str]) -> Box<dyn rowq_runtime::SourceExtractor> {
    let name = name.to_string();
    let videos: Vec<VideoEntry> = ids
        .iter()
        .map(|id| VideoEntry {
            id: (*id).to_string(),
            url: format!("https://youtu.be/{id}"),
            title: format!("video {id}"),
            duration_seconds: Some(60),
        })
        .collect();
    Box::new(move |_: &str| -> Result<SourceMetadata, ExtractError> {
        Ok(SourceMetadata {
            name: name.clone(),
            videos: videos.clone(),
        })
    })
}

fn pending_task_row(id: &str) -> Vec<String> {
    TaskRecord {
        id: id.to_string(),
        source_id: "s-1".to_string(),
        url: format!("https://youtu.be/{id}"),
        name: format!("video {id}"),
        duration_seconds: Some(60),
        created_at: Some(Utc::now()),
        claimed_at: None,
        completed_at: None,
        status: WorkStatus::Pending,
        assigned_worker: String::new(),
        extra: Vec::new(),
    }
    .to_row()
}

fn non_blank_rows(store: &InMemorySheetStore, sheet: &str) -> Vec<Vec<String>> {
    store
        .read_all(sheet)
        .expect("read sheet")
        .into_iter()
        .skip(1)
        .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .collect()
}

#[test]
fn cold_start_initializes_every_sheet_and_registers_the_worker() {
    let store = InMemorySheetStore::new();
    let orchestrator = worker("alpha", &store);

    for sheet in [
        WORKERS_SHEET,
        SOURCES_SHEET,
        SOURCES_HISTORY_SHEET,
        SOURCES_DLQ_SHEET,
        TASKS_SHEET,
        TASKS_HISTORY_SHEET,
        TASKS_DLQ_SHEET,
        ELECTION_SHEET,
    ] {
        let rows = store.read_all(sheet).expect("sheet exists");
        assert!(!rows.is_empty(), "sheet '{sheet}' is missing its header");
        assert!(!rows[0].is_empty(), "sheet '{sheet}' has a blank header");
    }

    let workers = non_blank_rows(&store, WORKERS_SHEET);
    assert_eq!(workers.len(), 1);
    let record = WorkerRecord::from_row(&workers[0]);
    assert_eq!(record.worker_id, orchestrator.worker_id());
    assert_eq!(record.worker_name, "alpha");
    assert_eq!(record.status, WorkerStatus::Active);
    assert!(record.last_heartbeat.is_some());
    assert_eq!(record.tasks_processed, 0);
    assert_eq!(record.sources_processed, 0);
}

#[test]
fn leader_fans_a_source_out_into_tasks_and_settles_it() {
    let store = InMemorySheetStore::new();

    // A manually queued source: no id yet, just a URL.
    let source = SourceRecord::pending(String::new(), "https://youtube.com/playlist?list=X".into());
    let mut orchestrator = worker("alpha", &store)
        .with_extractor(playlist_extractor("X", &["aaaaaaaaaaa", "bbbbbbbbbbb", "ccccccccccc"]));
    store
        .append_row(SOURCES_SHEET, &source.to_row())
        .expect("queue source");

    let mut callback = |_: &str| -> Result<(), String> { panic!("no task exists yet") };
    assert!(orchestrator
        .process_next_task(&mut callback)
        .expect("leader cycle"));

    let history = non_blank_rows(&store, SOURCES_HISTORY_SHEET);
    assert_eq!(history.len(), 1);
    let settled = SourceRecord::from_row(&history[0]);
    assert_eq!(settled.status, WorkStatus::Done);
    assert_eq!(settled.name, "X");
    assert_eq!(settled.video_count, Some(3));
    assert!(!settled.id.is_empty(), "the leader assigns a source id on claim");
    assert!(settled.completed_at.is_some());

    assert!(non_blank_rows(&store, SOURCES_SHEET).is_empty());

    let mut ids: Vec<String> = non_blank_rows(&store, TASKS_SHEET)
        .iter()
        .map(|row| TaskRecord::from_row(row))
        .map(|task| {
            assert_eq!(task.status, WorkStatus::Pending);
            assert_eq!(task.source_id, settled.id);
            assert!(task.assigned_worker.is_empty());
            task.id
        })
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["aaaaaaaaaaa", "bbbbbbbbbbb", "ccccccccccc"]);

    // the worker counts the source it processed
    let record = WorkerRecord::from_row(&non_blank_rows(&store, WORKERS_SHEET)[0]);
    assert_eq!(record.sources_processed, 1);
}

#[test]
fn fan_out_is_idempotent_across_repeated_extractions() {
    let store = InMemorySheetStore::new();
    let mut orchestrator = worker("alpha", &store)
        .with_extractor(playlist_extractor("X", &["aaaaaaaaaaa", "bbbbbbbbbbb"]));

    orchestrator
        .add_source("https://youtube.com/playlist?list=X")
        .expect("queue");
    orchestrator
        .add_source("https://youtube.com/playlist?list=X&again=1")
        .expect("queue");

    let mut callback = |_: &str| -> Result<(), String> { Err("tasks untouched".into()) };
    // First call fans out and creates the two tasks; from then on the task
    // path takes priority, so drain both tasks, then let the leader take the
    // second source.
    assert!(orchestrator.process_next_task(&mut callback).expect("fan out"));
    let after_first: Vec<String> = non_blank_rows(&store, TASKS_SHEET)
        .iter()
        .map(|row| TaskRecord::from_row(row).id)
        .collect();
    assert_eq!(after_first.len(), 2);

    assert!(orchestrator.process_next_task(&mut callback).expect("task 1"));
    assert!(orchestrator.process_next_task(&mut callback).expect("task 2"));
    assert!(orchestrator
        .process_next_task(&mut callback)
        .expect("second source"));

    // The second extraction yielded the same video ids: nothing new may
    // appear anywhere in the pipeline.
    let pending_now = non_blank_rows(&store, TASKS_SHEET);
    assert!(pending_now.is_empty(), "duplicate tasks were appended");
    let dlq_ids: Vec<String> = non_blank_rows(&store, TASKS_DLQ_SHEET)
        .iter()
        .map(|row| TaskRecord::from_row(row).id)
        .collect();
    assert_eq!(dlq_ids.len(), 2);

    let history = non_blank_rows(&store, SOURCES_HISTORY_SHEET);
    assert_eq!(history.len(), 2);
    let second = SourceRecord::from_row(&history[1]);
    assert_eq!(second.video_count, Some(2), "count reflects extraction, not new rows");
}

#[test]
fn failing_callback_sends_the_task_to_the_dlq_with_the_error() {
    let store = InMemorySheetStore::new();
    let mut orchestrator = worker("alpha", &store);
    store
        .append_row(TASKS_SHEET, &pending_task_row("vvvvvvvvvvv"))
        .expect("seed");

    let mut callback = |_: &str| -> Result<(), String> { Err("network down".into()) };
    assert!(orchestrator
        .process_next_task(&mut callback)
        .expect("iterate"));

    assert!(non_blank_rows(&store, TASKS_SHEET).is_empty());
    let dlq = non_blank_rows(&store, TASKS_DLQ_SHEET);
    assert_eq!(dlq.len(), 1);
    let failed = TaskRecord::from_row(&dlq[0]);
    assert_eq!(failed.id, "vvvvvvvvvvv");
    assert_eq!(failed.status, WorkStatus::Failed);
    assert_eq!(failed.assigned_worker, orchestrator.worker_id());
    assert_eq!(failed.extra, vec!["network down".to_string()]);

    // a failed task does not count as processed
    let record = WorkerRecord::from_row(&non_blank_rows(&store, WORKERS_SHEET)[0]);
    assert_eq!(record.tasks_processed, 0);
}

#[test]
fn one_task_feeds_exactly_one_of_two_competing_workers() {
    let store = InMemorySheetStore::new();
    let mut w1 = worker("alpha", &store);
    let mut w2 = worker("beta", &store);
    store
        .append_row(TASKS_SHEET, &pending_task_row("aaaaaaaaaaa"))
        .expect("seed");

    let processed = RefCell::new(Vec::new());
    let mut callback = |url: &str| -> Result<(), String> {
        processed.borrow_mut().push(url.to_string());
        Ok(())
    };

    let first = w1.process_next_task(&mut callback).expect("w1 iterate");
    let second = w2.process_next_task(&mut callback).expect("w2 iterate");
    assert!(first);
    assert!(!second, "the loser's iteration reports no work");
    assert_eq!(processed.borrow().len(), 1);

    // exactly one completion across the fleet
    let history = non_blank_rows(&store, TASKS_HISTORY_SHEET);
    assert_eq!(history.len(), 1);
    let totals: u64 = non_blank_rows(&store, WORKERS_SHEET)
        .iter()
        .map(|row| WorkerRecord::from_row(row).tasks_processed)
        .sum();
    assert_eq!(totals, 1);
}

#[test]
fn abandoned_claims_are_recovered_and_finished() {
    let store = InMemorySheetStore::new();
    let mut orchestrator = worker("alpha", &store);

    let mut abandoned = TaskRecord::from_row(&pending_task_row("aaaaaaaaaaa"));
    abandoned.status = WorkStatus::Claimed;
    abandoned.assigned_worker = "w-crashed".to_string();
    abandoned.claimed_at = Some(Utc::now() - chrono::Duration::minutes(20));
    store
        .append_row(TASKS_SHEET, &abandoned.to_row())
        .expect("seed");

    let mut callback = |_: &str| -> Result<(), String> { Ok(()) };
    assert!(orchestrator
        .process_next_task(&mut callback)
        .expect("iterate"));

    let history = non_blank_rows(&store, TASKS_HISTORY_SHEET);
    assert_eq!(history.len(), 1);
    let finished = TaskRecord::from_row(&history[0]);
    assert_eq!(finished.id, "aaaaaaaaaaa");
    assert_eq!(finished.status, WorkStatus::Done);
    assert_eq!(finished.assigned_worker, orchestrator.worker_id());
    assert!(non_blank_rows(&store, TASKS_SHEET).is_empty());
}

#[test]
fn a_pending_duplicate_of_settled_work_is_discarded_without_processing() {
    let store = InMemorySheetStore::new();
    let mut orchestrator = worker("alpha", &store);

    store
        .append_row(TASKS_SHEET, &pending_task_row("aaaaaaaaaaa"))
        .expect("seed pending");
    let mut done = TaskRecord::from_row(&pending_task_row("aaaaaaaaaaa"));
    done.status = WorkStatus::Done;
    store
        .append_row(TASKS_HISTORY_SHEET, &done.to_row())
        .expect("seed history");

    let mut callback =
        |_: &str| -> Result<(), String> { panic!("duplicate must not reach the callback") };
    let worked = orchestrator
        .process_next_task(&mut callback)
        .expect("iterate");
    assert!(!worked, "discarding a duplicate is not work");

    assert!(non_blank_rows(&store, TASKS_SHEET).is_empty());
    assert_eq!(non_blank_rows(&store, TASKS_HISTORY_SHEET).len(), 1);
}

#[test]
fn extraction_failure_sends_the_source_to_the_dlq() {
    let store = InMemorySheetStore::new();
    let mut orchestrator = worker("alpha", &store).with_extractor(Box::new(
        |url: &str| -> Result<SourceMetadata, ExtractError> {
            Err(ExtractError(format!("unsupported url: {url}")))
        },
    ));
    orchestrator
        .add_source("https://youtube.com/playlist?list=broken")
        .expect("queue");

    let mut callback = |_: &str| -> Result<(), String> { panic!("no tasks exist") };
    assert!(orchestrator
        .process_next_task(&mut callback)
        .expect("iterate"));

    assert!(non_blank_rows(&store, SOURCES_SHEET).is_empty());
    let dlq = non_blank_rows(&store, SOURCES_DLQ_SHEET);
    assert_eq!(dlq.len(), 1);
    let failed = SourceRecord::from_row(&dlq[0]);
    assert_eq!(failed.status, WorkStatus::Failed);
    assert_eq!(
        failed.extra,
        vec!["unsupported url: https://youtube.com/playlist?list=broken".to_string()]
    );
    assert!(non_blank_rows(&store, TASKS_SHEET).is_empty());
}

#[test]
fn videos_without_canonical_ids_are_rejected_individually() {
    let store = InMemorySheetStore::new();
    let videos = vec![
        VideoEntry {
            id: "aaaaaaaaaaa".to_string(),
            url: "https://youtu.be/aaaaaaaaaaa".to_string(),
            title: "good".to_string(),
            duration_seconds: Some(60),
        },
        VideoEntry {
            // broken id, but recoverable from the URL
            id: "oops".to_string(),
            url: "https://youtu.be/bbbbbbbbbbb".to_string(),
            title: "recoverable".to_string(),
            duration_seconds: None,
        },
        VideoEntry {
            id: "bad".to_string(),
            url: "https://example.com/nothing-here".to_string(),
            title: "hopeless".to_string(),
            duration_seconds: None,
        },
    ];
    let mut orchestrator = worker("alpha", &store).with_extractor(Box::new(
        move |_: &str| -> Result<SourceMetadata, ExtractError> {
            Ok(SourceMetadata {
                name: "mixed".to_string(),
                videos: videos.clone(),
            })
        },
    ));
    orchestrator
        .add_source("https://youtube.com/playlist?list=M")
        .expect("queue");

    let mut callback = |_: &str| -> Result<(), String> { panic!("no tasks exist") };
    assert!(orchestrator
        .process_next_task(&mut callback)
        .expect("iterate"));

    let mut ids: Vec<String> = non_blank_rows(&store, TASKS_SHEET)
        .iter()
        .map(|row| TaskRecord::from_row(row).id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["aaaaaaaaaaa", "bbbbbbbbbbb"]);

    // the source itself still settles as DONE
    let history = non_blank_rows(&store, SOURCES_HISTORY_SHEET);
    assert_eq!(SourceRecord::from_row(&history[0]).status, WorkStatus::Done);
}

#[test]
fn successful_tasks_increment_the_worker_counter_and_land_in_history() {
    let store = InMemorySheetStore::new();
    let mut orchestrator = worker("alpha", &store);
    store
        .append_row(TASKS_SHEET, &pending_task_row("aaaaaaaaaaa"))
        .expect("seed");

    let mut callback = |_: &str| -> Result<(), String> { Ok(()) };
    assert!(orchestrator
        .process_next_task(&mut callback)
        .expect("iterate"));
    assert!(!orchestrator
        .process_next_task(&mut callback)
        .expect("drained"));

    let history = non_blank_rows(&store, TASKS_HISTORY_SHEET);
    assert_eq!(history.len(), 1);
    assert_eq!(
        TaskRecord::from_row(&history[0]).status,
        WorkStatus::Done
    );
    let record = WorkerRecord::from_row(&non_blank_rows(&store, WORKERS_SHEET)[0]);
    assert_eq!(record.tasks_processed, 1);
}

#[test]
fn graceful_shutdown_marks_the_worker_inactive() {
    let store = InMemorySheetStore::new();
    let mut orchestrator = worker("alpha", &store);
    orchestrator.shutdown().expect("shutdown");

    let record = WorkerRecord::from_row(&non_blank_rows(&store, WORKERS_SHEET)[0]);
    assert_eq!(record.status, WorkerStatus::Inactive);
}
