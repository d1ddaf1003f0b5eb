mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{config, docs, processor, request, Behavior, MockModel, MockStore};
use rx_harvest::services::output_store::read_records;
use rx_harvest::services::{CheckpointEntry, CheckpointStore, MemoryCheckpointStore, Outcome};
use rx_harvest::{AppError, ConfigError, ExtractionRecord, ReadStatus};
use tokio_test::{assert_err, assert_ok};

/// 每个文档在输出中的记录数
async fn record_counts(path: &std::path::Path) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for record in assert_ok!(read_records(path).await) {
        *counts.entry(record.document_id).or_insert(0) += 1;
    }
    counts
}

/// 在文件名的第一个多字节字符中间截断的记录行
fn torn_line(id: &str, name: &str) -> Vec<u8> {
    let doc = rx_harvest::DocumentRef::new(id, name, "application/pdf");
    let line = serde_json::to_vec(&ExtractionRecord::failed(&doc, "stale")).unwrap();
    let first_wide = name.chars().find(|c| c.len_utf8() > 1).unwrap();
    let mut buf = [0u8; 4];
    let needle = first_wide.encode_utf8(&mut buf).as_bytes();
    let at = line
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap();
    line[..at + 1].to_vec()
}

fn done_entry(id: &str) -> CheckpointEntry {
    let doc = rx_harvest::DocumentRef::new(id, format!("{}.pdf", id), "application/pdf");
    let record = ExtractionRecord {
        read_status: ReadStatus::Success,
        ..ExtractionRecord::failed(&doc, "ok")
    };
    CheckpointEntry::from_record(&record)
}

#[tokio::test]
async fn test_every_document_gets_exactly_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MockStore::new(docs(120)));
    let model = Arc::new(MockModel::new(Behavior::Good).with_delay(5));

    let summary = assert_ok!(
        processor(config(), store.clone(), model.clone())
            .run(&request(&dir, 20, false))
            .await
    );

    assert_eq!(summary.total, 120);
    assert_eq!(summary.processed, 120);
    assert_eq!(summary.success, 120);
    assert_eq!(summary.tokens_in, 120_000);
    assert!(!summary.interrupted);

    let counts = record_counts(&dir.path().join("out.jsonl")).await;
    assert_eq!(counts.len(), 120);
    assert!(counts.values().all(|&n| n == 1));
    assert!(model.max_in_flight.load(Ordering::SeqCst) <= 20);
}

#[tokio::test]
async fn test_concurrent_and_sequential_runs_agree() {
    let parallel_dir = tempfile::tempdir().unwrap();
    let sequential_dir = tempfile::tempdir().unwrap();

    let mut store = MockStore::new(docs(40));
    store.missing.insert("d7".into());
    store.missing.insert("d31".into());
    let store = Arc::new(store);

    let parallel_model = Arc::new(MockModel::new(Behavior::Good).with_delay(8));
    let parallel = assert_ok!(
        processor(config(), store.clone(), parallel_model.clone())
            .run(&request(&parallel_dir, 20, false))
            .await
    );

    let sequential_model = Arc::new(MockModel::new(Behavior::Good).with_delay(2));
    let sequential = assert_ok!(
        processor(config(), store.clone(), sequential_model.clone())
            .run(&request(&sequential_dir, 1, false))
            .await
    );

    assert_eq!(sequential_model.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(parallel.success, sequential.success);
    assert_eq!(parallel.failed, sequential.failed);
    assert_eq!(parallel.failed, 2);

    let mut a: Vec<_> = assert_ok!(read_records(&parallel_dir.path().join("out.jsonl")).await)
        .into_iter()
        .map(|r| (r.document_id, r.read_status))
        .collect();
    let mut b: Vec<_> = assert_ok!(read_records(&sequential_dir.path().join("out.jsonl")).await)
        .into_iter()
        .map(|r| (r.document_id, r.read_status))
        .collect();
    a.sort_by(|x, y| x.0.cmp(&y.0));
    b.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_worker_count_out_of_range_rejected_before_listing() {
    let dir = tempfile::tempdir().unwrap();

    for workers in [0, 51] {
        let store = Arc::new(MockStore::new(docs(3)));
        let model = Arc::new(MockModel::new(Behavior::Good));
        let err = assert_err!(
            processor(config(), store.clone(), model.clone())
                .run(&request(&dir, workers, false))
                .await
        );

        assert!(matches!(
            err,
            AppError::Config(ConfigError::WorkerCountOutOfRange { value, min: 1, max: 50 }) if value == workers
        ));
        assert_eq!(store.list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn test_bounds_are_inclusive() {
    for workers in [1, 50] {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MockStore::new(docs(2)));
        let model = Arc::new(MockModel::new(Behavior::Good));
        let summary = assert_ok!(
            processor(config(), store, model)
                .run(&request(&dir, workers, false))
                .await
        );
        assert_eq!(summary.processed, 2);
    }
}

#[tokio::test]
async fn test_empty_listing_gives_zero_summary() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MockStore::new(Vec::new()));
    let model = Arc::new(MockModel::new(Behavior::Good));

    let summary = assert_ok!(
        processor(config(), store, model.clone())
            .run(&request(&dir, 10, false))
            .await
    );

    assert_eq!(summary.total, 0);
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.snapshot.estimated_cost, 0.0);
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    assert!(record_counts(&dir.path().join("out.jsonl")).await.is_empty());
}

#[tokio::test]
async fn test_retry_ceiling_for_always_transient_model() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MockStore::new(docs(4)));
    let model = Arc::new(MockModel::new(Behavior::AlwaysTransient));

    let mut checkpoint = MemoryCheckpointStore::new(100);
    let summary = assert_ok!(
        processor(config(), store.clone(), model.clone())
            .run_with(&request(&dir, 2, false), &mut checkpoint)
            .await
    );

    assert_eq!(summary.failed, 4);
    for doc in docs(4) {
        assert_eq!(model.calls_for(&doc.id), 3);
    }
    assert_eq!(store.fetch_calls.load(Ordering::SeqCst), 12);

    let state = checkpoint.persisted();
    assert_eq!(state.entries.len(), 4);
    assert!(state
        .entries
        .values()
        .all(|e| e.outcome == Outcome::FailedPermanent && e.failures == 1));
}

#[tokio::test]
async fn test_single_permanent_failure_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MockStore::new(docs(5));
    store.missing.insert("d2".into());
    let store = Arc::new(store);
    let model = Arc::new(MockModel::new(Behavior::Good));

    let summary = assert_ok!(
        processor(config(), store.clone(), model.clone())
            .run(&request(&dir, 3, false))
            .await
    );

    assert_eq!(summary.success, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(store.fetch_calls.load(Ordering::SeqCst), 5);
    assert_eq!(model.calls_for("d2"), 0);

    let records = assert_ok!(read_records(&dir.path().join("out.jsonl")).await);
    let failed: Vec<_> = records
        .iter()
        .filter(|r| r.read_status == ReadStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].document_id, "d2");
    assert!(failed[0].comment.contains("Permanent error after 1 attempt(s)"));
}

#[tokio::test]
async fn test_listing_failure_is_fatal_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MockStore::new(docs(3));
    store.list_failures = 10;
    let store = Arc::new(store);
    let model = Arc::new(MockModel::new(Behavior::Good));

    let err = assert_err!(
        processor(config(), store.clone(), model)
            .run(&request(&dir, 2, false))
            .await
    );
    assert!(matches!(err, AppError::Listing { .. }));
    assert_eq!(store.list_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_listing_recovers_from_transient_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MockStore::new(docs(3));
    store.list_failures = 2;
    let store = Arc::new(store);
    let model = Arc::new(MockModel::new(Behavior::Good));

    let summary = assert_ok!(
        processor(config(), store, model)
            .run(&request(&dir, 2, false))
            .await
    );
    assert_eq!(summary.processed, 3);
}

#[tokio::test]
async fn test_interrupted_run_resumes_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MockStore::new(docs(30)));

    // 第一次运行：第 5 次模型调用后触发停止
    let first_model = Arc::new(MockModel::new(Behavior::Good).stopping_after(5));
    let first = processor(config(), store.clone(), first_model.clone());
    assert!(first_model.stop.set(first.stop_handle()).is_ok());
    let interrupted = assert_ok!(first.run(&request(&dir, 2, false)).await);

    assert!(interrupted.interrupted);
    assert!(interrupted.processed >= 5);
    assert!(interrupted.processed < 30);
    assert_eq!(interrupted.processed + interrupted.not_dispatched, 30);

    // 第二次运行：续跑，只处理剩余文档
    let second_model = Arc::new(MockModel::new(Behavior::Good));
    let resumed = assert_ok!(
        processor(config(), store.clone(), second_model.clone())
            .run(&request(&dir, 4, true))
            .await
    );

    assert!(!resumed.interrupted);
    assert_eq!(resumed.processed, 30);
    assert_eq!(resumed.resumed, interrupted.processed);
    assert_eq!(
        second_model.calls.load(Ordering::SeqCst),
        30 - interrupted.processed
    );

    let counts = record_counts(&dir.path().join("out.jsonl")).await;
    assert_eq!(counts.len(), 30);
    assert!(counts.values().all(|&n| n == 1));

    // 第三次运行：全部已完成，不再调用模型
    let third_model = Arc::new(MockModel::new(Behavior::Good));
    let noop = assert_ok!(
        processor(config(), store, third_model.clone())
            .run(&request(&dir, 4, true))
            .await
    );
    assert_eq!(noop.resumed, 30);
    assert_eq!(third_model.calls.load(Ordering::SeqCst), 0);
    assert_eq!(record_counts(&dir.path().join("out.jsonl")).await.len(), 30);
}

#[tokio::test]
async fn test_crash_between_output_and_checkpoint_flush() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.jsonl");

    // 崩溃前：d0..d2 已写入输出，d3 只写了半行，但断点只落盘了 d0、d1
    let mut content = Vec::new();
    for doc in docs(3) {
        let stale = ExtractionRecord::failed(&doc, "stale");
        content.extend(serde_json::to_vec(&stale).unwrap());
        content.push(b'\n');
    }
    content.extend_from_slice(&torn_line("d3", "處方_003.pdf"));
    std::fs::write(&output, content).unwrap();

    let mut checkpoint =
        MemoryCheckpointStore::with_entries(100, [done_entry("d0"), done_entry("d1")]);

    let store = Arc::new(MockStore::new(docs(5)));
    let model = Arc::new(MockModel::new(Behavior::Good));
    let summary = assert_ok!(
        processor(config(), store, model.clone())
            .run_with(&request(&dir, 3, true), &mut checkpoint)
            .await
    );

    assert_eq!(summary.resumed, 2);
    assert_eq!(summary.processed, 5);
    assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    assert_eq!(model.calls_for("d0"), 0);

    let records = assert_ok!(read_records(&output).await);
    let counts = record_counts(&output).await;
    assert_eq!(counts.len(), 5);
    assert!(counts.values().all(|&n| n == 1));
    let d2 = records.iter().find(|r| r.document_id == "d2").unwrap();
    assert_eq!(d2.read_status, ReadStatus::Success);

    assert_eq!(checkpoint.persisted().done_ids().len(), 5);
}

#[tokio::test]
async fn test_resume_after_tail_torn_inside_multibyte_name() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.jsonl");
    let names = ["處方_甲.pdf", "rezept_ä.pdf", "処方箋.pdf", "ordonnance_é.pdf"];
    let listing: Vec<_> = names
        .iter()
        .enumerate()
        .map(|(i, name)| rx_harvest::DocumentRef::new(format!("d{}", i), *name, "application/pdf"))
        .collect();

    let mut store = MockStore::new(listing);
    store.missing.insert("d1".into());
    let store = Arc::new(store);
    let summary = assert_ok!(
        processor(config(), store.clone(), Arc::new(MockModel::new(Behavior::Good)))
            .run(&request(&dir, 2, false))
            .await
    );
    assert_eq!(summary.processed, 4);

    // 模拟一次崩溃：最后一行写到一半停在多字节字符中间
    let mut content = std::fs::read(&output).unwrap();
    content.extend_from_slice(&torn_line("d9", "處方_半行.pdf"));
    std::fs::write(&output, content).unwrap();

    let model = Arc::new(MockModel::new(Behavior::Good));
    let resumed = assert_ok!(
        processor(config(), store, model.clone())
            .run(&request(&dir, 2, true))
            .await
    );

    assert_eq!(resumed.resumed, 3);
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    let records = assert_ok!(read_records(&output).await);
    assert_eq!(records.len(), 4);
    assert!(records.iter().any(|r| r.document_name == "処方箋.pdf"));
    assert!(!String::from_utf8_lossy(&std::fs::read(&output).unwrap()).contains("d9"));
}

#[tokio::test]
async fn test_failed_documents_retried_on_resume() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MockStore::new(docs(3));
    store.missing.insert("d1".into());
    let store = Arc::new(store);

    let mut checkpoint = MemoryCheckpointStore::new(100);
    let model = Arc::new(MockModel::new(Behavior::Good));
    assert_ok!(
        processor(config(), store.clone(), model)
            .run_with(&request(&dir, 2, false), &mut checkpoint)
            .await
    );

    // 再次续跑：d1 被重新派发，失败次数累加
    let model = Arc::new(MockModel::new(Behavior::Good));
    let summary = assert_ok!(
        processor(config(), store.clone(), model)
            .run_with(&request(&dir, 2, true), &mut checkpoint)
            .await
    );
    assert_eq!(summary.resumed, 2);
    assert_eq!(summary.failed, 1);

    let state = assert_ok!(checkpoint.load().await);
    assert_eq!(state.failure_counts().get("d1"), Some(&2));
    assert_eq!(record_counts(&dir.path().join("out.jsonl")).await.get("d1"), Some(&1));
}

#[tokio::test]
async fn test_failed_documents_skipped_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MockStore::new(docs(3));
    store.missing.insert("d1".into());
    let store = Arc::new(store);
    let config = rx_harvest::Config {
        retry_failed_on_resume: false,
        ..config()
    };

    let mut checkpoint = MemoryCheckpointStore::new(100);
    let model = Arc::new(MockModel::new(Behavior::Good));
    assert_ok!(
        processor(config.clone(), store.clone(), model)
            .run_with(&request(&dir, 2, false), &mut checkpoint)
            .await
    );

    let fetches_before = store.fetch_calls.load(Ordering::SeqCst);
    let model = Arc::new(MockModel::new(Behavior::Good));
    let summary = assert_ok!(
        processor(config, store.clone(), model.clone())
            .run_with(&request(&dir, 2, true), &mut checkpoint)
            .await
    );

    assert_eq!(summary.resumed, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(store.fetch_calls.load(Ordering::SeqCst), fetches_before);
    assert_eq!(record_counts(&dir.path().join("out.jsonl")).await.len(), 3);
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_surfaced() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("checkpoint.json"), "{ not json").unwrap();

    let store = Arc::new(MockStore::new(docs(2)));
    let model = Arc::new(MockModel::new(Behavior::Good));
    let err = assert_err!(
        processor(config(), store, model.clone())
            .run(&request(&dir, 2, true))
            .await
    );

    assert!(matches!(err, AppError::CorruptCheckpoint { .. }));
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_checkpoint_flushes_in_batches() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MockStore::new(docs(7)));
    let model = Arc::new(MockModel::new(Behavior::Good));

    let mut checkpoint = MemoryCheckpointStore::new(3);
    assert_ok!(
        processor(config(), store, model)
            .run_with(&request(&dir, 1, false), &mut checkpoint)
            .await
    );

    // 7 个结果：第 3、6 个时各落盘一次，结束时再落盘一次
    assert_eq!(checkpoint.flush_count, 3);
    assert_eq!(checkpoint.persisted().done_ids().len(), 7);
}
