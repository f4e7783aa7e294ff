use super::*;
use crate::core::{KVStore, StoreAdapter};
use std::sync::Arc;
use tempfile::TempDir;

fn file_config(dir: &TempDir, queue_capacity: usize) -> TransactionLogConfig {
    TransactionLogConfig {
        backend: BackendConfig::File(FileLogConfig {
            path: dir.path().join("transaction.log"),
            ..Default::default()
        }),
        queue_capacity,
        durability: DurabilityMode::Async,
    }
}

async fn open_file_log(dir: &TempDir) -> TransactionLog {
    TransactionLog::open(&file_config(dir, 16)).await.unwrap()
}

/// Drain a replay stream completely, events first
async fn collect(stream: ReplayStream) -> (Vec<Event>, Vec<PersistenceError>) {
    let ReplayStream {
        mut events,
        mut errors,
    } = stream;

    let mut out = Vec::new();
    while let Some(event) = events.recv().await {
        out.push(event);
    }
    let mut errs = Vec::new();
    while let Some(error) = errors.recv().await {
        errs.push(error);
    }
    (out, errs)
}

#[tokio::test]
async fn test_file_log_assigns_sequences_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_file_log(&dir).await;
    let store = KVStore::new();

    let recovered = ReplayEngine::new().run(&log, &store).await.unwrap();
    assert_eq!(recovered, RecoveryInfo::default());

    log.submit_put("x", "1").await.unwrap();
    log.submit_put("x", "2").await.unwrap();
    log.submit_delete("y").await.unwrap();
    log.close().await;

    let (events, errors) = collect(log.replay_events()).await;
    assert!(errors.is_empty());
    assert_eq!(
        events,
        vec![
            Event::persisted(1, EventType::Put, "x".into(), "1".into()),
            Event::persisted(2, EventType::Put, "x".into(), "2".into()),
            Event::persisted(3, EventType::Delete, "y".into(), String::new()),
        ]
    );
}

#[tokio::test]
async fn test_sequence_continues_after_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let log = open_file_log(&dir).await;
        ReplayEngine::new().run(&log, &KVStore::new()).await.unwrap();
        for i in 0..3 {
            log.submit_put(&format!("k{}", i), "v").await.unwrap();
        }
        log.close().await;
    }

    let log = open_file_log(&dir).await;
    let store = KVStore::new();
    let recovered = ReplayEngine::new().run(&log, &store).await.unwrap();

    assert_eq!(recovered.events_applied, 3);
    assert_eq!(recovered.last_sequence, 3);
    assert_eq!(store.len(), 3);

    log.submit_put("k3", "v").await.unwrap();
    log.close().await;

    let (events, errors) = collect(log.replay_events()).await;
    assert!(errors.is_empty());
    let sequences: Vec<u64> = events.iter().map(Event::sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_reopen_without_replay_does_not_reuse_sequences() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("transaction.log"),
        "1\t0\ta\t1\n2\t0\tb\t2\n",
    )
    .unwrap();

    let log = open_file_log(&dir).await;
    assert_eq!(log.last_sequence(), 2);

    log.start().unwrap();
    log.submit_put("c", "3").await.unwrap();
    log.close().await;

    let (events, _) = collect(log.replay_events()).await;
    assert_eq!(events.last().unwrap().sequence(), 3);
}

#[tokio::test]
async fn test_replay_put_delete_put_leaves_last_value() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("transaction.log"),
        "1\t0\ta\t1\n2\t1\ta\t\n3\t0\ta\t2\n",
    )
    .unwrap();

    let log = open_file_log(&dir).await;
    let store = KVStore::new();
    let recovered = ReplayEngine::new().run(&log, &store).await.unwrap();

    assert_eq!(store.get("a").unwrap(), "2");
    assert_eq!(recovered.puts, 2);
    assert_eq!(recovered.deletes, 1);
    log.close().await;
}

#[tokio::test]
async fn test_replay_put_then_delete_leaves_key_absent() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("transaction.log"), "1\t0\ta\t1\n2\t1\ta\t\n").unwrap();

    let log = open_file_log(&dir).await;
    let store = KVStore::new();
    ReplayEngine::new().run(&log, &store).await.unwrap();

    assert!(!store.contains("a"));
    assert!(store.is_empty());
    log.close().await;
}

#[tokio::test]
async fn test_corrupt_record_stops_replay_with_one_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("transaction.log"),
        "1\t0\ta\t1\n2\t0\tb\t2\nnot a record\n4\t0\tc\t3\n",
    )
    .unwrap();

    let log = open_file_log(&dir).await;
    let (events, errors) = collect(log.replay_events()).await;

    let sequences: Vec<u64> = events.iter().map(Event::sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        PersistenceError::Decode { position: 3, .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_corrupt_record_after_valid_ones_applies_every_valid_one() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("transaction.log"),
        "1\t0\ta\t1\n2\t0\tb\t2\n3\t0\tc\t3\nnot a record\n",
    )
    .unwrap();
    let log = open_file_log(&dir).await;

    for _ in 0..100 {
        let store = KVStore::new();
        let err = apply_stream(log.replay_events(), &store).await.unwrap_err();

        assert!(matches!(err, PersistenceError::Decode { position: 4, .. }));
        assert_eq!(store.len(), 3);
        assert_eq!(store.get("c").unwrap(), "3");
    }
}

#[tokio::test]
async fn test_corrupt_log_keeps_engine_out_of_live_state() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("transaction.log"), "1\t5\ta\t1\n").unwrap();

    let log = open_file_log(&dir).await;
    let mut engine = ReplayEngine::new();
    let err = engine.run(&log, &KVStore::new()).await.unwrap_err();

    assert!(matches!(err, PersistenceError::UnknownEventType(5)));
    assert_eq!(engine.state(), ReplayState::Replaying);
    assert!(!log.is_started());
}

#[tokio::test]
async fn test_out_of_order_sequence_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("transaction.log"),
        "2\t0\ta\t1\n2\t0\tb\t2\n",
    )
    .unwrap();

    let log = open_file_log(&dir).await;
    let (events, errors) = collect(log.replay_events()).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(
        errors[..],
        [PersistenceError::OutOfSequence {
            previous: 2,
            found: 2
        }]
    ));
}

#[tokio::test]
async fn test_partial_trailing_record_does_not_swallow_next_append() {
    let dir = tempfile::tempdir().unwrap();
    // last record lost its terminator
    std::fs::write(dir.path().join("transaction.log"), "1\t0\ta\t1").unwrap();

    let log = open_file_log(&dir).await;
    let store = KVStore::new();
    ReplayEngine::new().run(&log, &store).await.unwrap();
    log.submit_put("b", "2").await.unwrap();
    log.close().await;

    let (events, errors) = collect(log.replay_events()).await;
    assert!(errors.is_empty());
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].key(), "b");
    assert_eq!(events[1].sequence(), 2);
}

#[tokio::test]
async fn test_concurrent_submitters_keep_per_caller_order() {
    const CALLERS: usize = 8;
    const PER_CALLER: usize = 25;

    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(TransactionLog::open(&file_config(&dir, 4)).await.unwrap());
    ReplayEngine::new().run(&log, &KVStore::new()).await.unwrap();

    let mut handles = Vec::new();
    for caller in 0..CALLERS {
        let log = Arc::clone(&log);
        handles.push(tokio::spawn(async move {
            for n in 0..PER_CALLER {
                log.submit_put(&format!("caller{}", caller), &n.to_string())
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    log.close().await;

    let (events, errors) = collect(log.replay_events()).await;
    assert!(errors.is_empty());
    assert_eq!(events.len(), CALLERS * PER_CALLER);

    let sequences: Vec<u64> = events.iter().map(Event::sequence).collect();
    let expected: Vec<u64> = (1..=(CALLERS * PER_CALLER) as u64).collect();
    assert_eq!(sequences, expected);

    for caller in 0..CALLERS {
        let key = format!("caller{}", caller);
        let values: Vec<usize> = events
            .iter()
            .filter(|e| e.key() == key)
            .map(|e| e.value().parse().unwrap())
            .collect();
        assert_eq!(values, (0..PER_CALLER).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_replay_reproduces_directly_applied_state() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(open_file_log(&dir).await);
    let live = Arc::new(KVStore::new());
    ReplayEngine::new().run(&log, live.as_ref()).await.unwrap();

    let layer = PersistenceLayer::new(Arc::clone(&live), Arc::clone(&log), DurabilityMode::Async);
    let expected = KVStore::new();

    // small linear congruential generator, deterministic across runs
    let mut seed: u64 = 0x2545_f491;
    for i in 0..300 {
        seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        let key = format!("key{}", (seed >> 33) % 12);
        if (seed >> 20) % 3 == 0 {
            layer.delete(&key).await.unwrap();
            expected.delete(&key).unwrap();
        } else {
            let value = format!("v{}\t{}", i, seed % 97);
            layer.put(&key, &value).await.unwrap();
            expected.put(&key, &value).unwrap();
        }
    }
    log.close().await;

    let replayed = KVStore::new();
    let recovered = apply_stream(log.replay_events(), &replayed).await.unwrap();

    assert_eq!(recovered.events_applied, 300);
    assert_eq!(replayed.keys(), expected.keys());
    assert_eq!(live.keys(), expected.keys());
    for key in expected.keys() {
        assert_eq!(replayed.get(&key).unwrap(), expected.get(&key).unwrap());
    }
}

#[tokio::test]
async fn test_sync_durability_appends_before_returning() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(open_file_log(&dir).await);
    let store = Arc::new(KVStore::new());
    ReplayEngine::new().run(&log, store.as_ref()).await.unwrap();

    let layer = PersistenceLayer::new(Arc::clone(&store), Arc::clone(&log), DurabilityMode::Sync);
    layer.put("a", "1").await.unwrap();
    layer.delete("a").await.unwrap();

    // no close: both records must already be on disk
    let contents = std::fs::read_to_string(dir.path().join("transaction.log")).unwrap();
    assert_eq!(contents, "1\t0\ta\t1\n2\t1\ta\t\n");
    assert_eq!(log.last_sequence(), 2);
    assert!(store.is_empty());
    log.close().await;
}

#[tokio::test]
async fn test_sync_durability_leaves_store_untouched_when_log_closed() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(open_file_log(&dir).await);
    let store = Arc::new(KVStore::new());
    ReplayEngine::new().run(&log, store.as_ref()).await.unwrap();
    log.close().await;

    let layer = PersistenceLayer::new(Arc::clone(&store), Arc::clone(&log), DurabilityMode::Sync);
    let err = layer.put("a", "1").await.unwrap_err();

    assert!(matches!(err, crate::core::KvError::LogUnavailable(_)));
    assert!(!store.contains("a"));
}

#[tokio::test]
async fn test_layer_rejects_empty_key() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(open_file_log(&dir).await);
    let store = Arc::new(KVStore::new());
    let layer = PersistenceLayer::new(store, Arc::clone(&log), DurabilityMode::Async);

    assert!(matches!(
        layer.put("", "v").await,
        Err(crate::core::KvError::InvalidKey(_))
    ));
    assert!(matches!(
        layer.delete("").await,
        Err(crate::core::KvError::InvalidKey(_))
    ));
}

#[tokio::test]
async fn test_submit_after_close_fails() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_file_log(&dir).await;
    log.start().unwrap();
    log.close().await;

    assert!(matches!(
        log.submit_put("a", "1").await,
        Err(PersistenceError::WriterClosed)
    ));
}

#[tokio::test]
async fn test_start_twice_fails() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_file_log(&dir).await;

    log.start().unwrap();
    assert!(matches!(log.start(), Err(PersistenceError::AlreadyStarted)));
    log.close().await;
}

#[tokio::test]
async fn test_engine_is_terminal_in_live_state() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_file_log(&dir).await;
    let mut engine = ReplayEngine::new();

    engine.run(&log, &KVStore::new()).await.unwrap();
    assert_eq!(engine.state(), ReplayState::Live);

    let err = engine.run(&log, &KVStore::new()).await.unwrap_err();
    assert!(matches!(err, PersistenceError::AlreadyLive));
    log.close().await;
}

#[tokio::test]
async fn test_verify_does_not_start_writer() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("transaction.log"), "1\t0\ta\t1\n2\t0\tb\t2\n").unwrap();

    let log = open_file_log(&dir).await;
    let (recovered, scratch) = verify(&log).await.unwrap();

    assert_eq!(recovered.events_applied, 2);
    assert_eq!(scratch.len(), 2);
    assert!(!log.is_started());
}

#[tokio::test]
async fn test_error_receiver_is_handed_out_once() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_file_log(&dir).await;

    let errors = log.take_errors();
    assert!(errors.is_some());
    assert!(log.take_errors().is_none());

    log.start().unwrap();
    log.close().await;

    // the channel closes once the writer is gone
    let mut errors = errors.unwrap();
    assert!(errors.recv().await.is_none());
}

#[tokio::test]
async fn test_open_creates_missing_directories() {
    let dir = tempfile::tempdir().unwrap();
    let config = TransactionLogConfig {
        backend: BackendConfig::File(FileLogConfig {
            path: dir.path().join("nested/data/transaction.log"),
            fsync_mode: FsyncMode::Never,
            fsync_interval_ms: 1000,
        }),
        queue_capacity: 16,
        durability: DurabilityMode::Async,
    };

    let log = TransactionLog::open(&config).await.unwrap();
    assert_eq!(log.backend_name(), "file");
    assert_eq!(log.last_sequence(), 0);
    assert!(dir.path().join("nested/data/transaction.log").exists());
}

#[tokio::test]
async fn test_open_fails_when_path_is_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config = TransactionLogConfig {
        backend: BackendConfig::File(FileLogConfig {
            path: dir.path().to_path_buf(),
            ..Default::default()
        }),
        queue_capacity: 16,
        durability: DurabilityMode::Async,
    };

    let err = TransactionLog::open(&config).await.err().unwrap();
    assert!(matches!(err, PersistenceError::Schema(_)));
}
