//! Crash-recovery sweeps: requeue of orphaned running runs, adoption of
//! orphaned paused runs, terminal cleanup, and idempotence.

use chrono::Utc;
use rustc_hash::FxHashMap;

use runloom::config::EngineConfig;
use runloom::engine::Engine;
use runloom::event::{EventsBus, RecoveredPhase, RunEventKind};
use runloom::sched::RecoveryCoordinator;
use runloom::storage::StoragePort;
use runloom::types::{Lease, QueueItem, QueueStatus, RunDebugOptions, RunRecord, RunStatus};

mod common;
use common::*;

fn seeded_run(id: &str, status: RunStatus) -> RunRecord {
    let mut run = RunRecord::queued(
        id.into(),
        "f1".into(),
        FxHashMap::default(),
        RunDebugOptions::default(),
        3,
        Utc::now(),
    );
    run.status = status;
    run
}

async fn seed_orphaned_running(storage: &StoragePort, id: &str) {
    storage.runs.save(seeded_run(id, RunStatus::Running)).await.unwrap();
    let mut item = QueueItem::queued(id.into(), "f1".into(), 0, Utc::now());
    item.status = QueueStatus::Running;
    item.attempt = 1;
    item.lease = Some(Lease::new("old", Utc::now() - chrono::Duration::seconds(120)));
    storage.queue.enqueue(item).await.unwrap();
}

#[tokio::test]
async fn orphaned_running_run_is_requeued_and_completes() {
    let storage = StoragePort::in_memory();
    storage
        .flows
        .save(single_node_flow("f1", "succeed"))
        .await
        .unwrap();
    seed_orphaned_running(&storage, "r1").await;

    // Starting the engine runs recovery before the scheduler claims.
    let engine = Engine::start(fast_config(), storage, test_registry())
        .await
        .unwrap();

    let report = engine.recovery_report();
    assert_eq!(report.requeued_running, vec!["r1".to_string()]);
    assert!(report.adopted_paused.is_empty());
    assert!(report.cleaned_terminal.is_empty());

    let run = wait_for_status(&engine, "r1", RunStatus::Succeeded).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(engine.storage().queue.get("r1").await.unwrap().is_none());

    let events = engine.get_events("r1").await.unwrap();
    let recovered = events.iter().any(|e| {
        matches!(
            e.kind,
            RunEventKind::RunRecovered {
                phase: RecoveredPhase::RequeuedRunning
            }
        )
    });
    assert!(recovered);
    engine.shutdown().await;
}

#[tokio::test]
async fn recovery_requeue_resets_queue_state_but_keeps_attempt() {
    let storage = StoragePort::in_memory();
    seed_orphaned_running(&storage, "r1").await;
    let bus = EventsBus::new(storage.events.clone());
    let config = std::sync::Arc::new(EngineConfig::default());
    let coordinator = RecoveryCoordinator::new(storage.clone(), bus, config);

    let report = coordinator.run("owner-new").await.unwrap();
    assert_eq!(report.requeued_running, vec!["r1".to_string()]);

    let item = storage.queue.get("r1").await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Queued);
    assert!(item.lease.is_none());
    assert_eq!(item.attempt, 1);
    let run = storage.runs.get("r1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Queued);
}

#[tokio::test]
async fn orphaned_paused_run_is_adopted_and_stays_paused() {
    let storage = StoragePort::in_memory();
    storage.runs.save(seeded_run("p1", RunStatus::Paused)).await.unwrap();
    let mut item = QueueItem::queued("p1".into(), "f1".into(), 0, Utc::now());
    item.status = QueueStatus::Paused;
    item.lease = Some(Lease::new("old", Utc::now() - chrono::Duration::seconds(120)));
    storage.queue.enqueue(item).await.unwrap();

    let bus = EventsBus::new(storage.events.clone());
    let config = std::sync::Arc::new(EngineConfig::default());
    let coordinator = RecoveryCoordinator::new(storage.clone(), bus, config);
    let report = coordinator.run("owner-new").await.unwrap();
    assert_eq!(report.adopted_paused, vec!["p1".to_string()]);

    let item = storage.queue.get("p1").await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Paused);
    let lease = item.lease.unwrap();
    assert_eq!(lease.owner_id, "owner-new");
    assert!(lease.expires_at > Utc::now());
    // The pause persists; no scheduler will claim it.
    let run = storage.runs.get("p1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Paused);
}

#[tokio::test]
async fn terminal_stragglers_are_cleaned() {
    let storage = StoragePort::in_memory();
    storage
        .runs
        .save(seeded_run("done", RunStatus::Succeeded))
        .await
        .unwrap();
    storage
        .queue
        .enqueue(QueueItem::queued("done".into(), "f1".into(), 0, Utc::now()))
        .await
        .unwrap();

    let bus = EventsBus::new(storage.events.clone());
    let config = std::sync::Arc::new(EngineConfig::default());
    let coordinator = RecoveryCoordinator::new(storage.clone(), bus, config);
    let report = coordinator.run("owner-new").await.unwrap();
    assert_eq!(report.cleaned_terminal, vec!["done".to_string()]);
    assert!(storage.queue.get("done").await.unwrap().is_none());
}

#[tokio::test]
async fn running_recovery_twice_is_a_no_op() {
    let storage = StoragePort::in_memory();
    seed_orphaned_running(&storage, "r1").await;
    storage.runs.save(seeded_run("p1", RunStatus::Paused)).await.unwrap();
    let mut paused = QueueItem::queued("p1".into(), "f1".into(), 0, Utc::now());
    paused.status = QueueStatus::Paused;
    paused.lease = Some(Lease::new("old", Utc::now()));
    storage.queue.enqueue(paused).await.unwrap();
    storage
        .runs
        .save(seeded_run("done", RunStatus::Canceled))
        .await
        .unwrap();
    storage
        .queue
        .enqueue(QueueItem::queued("done".into(), "f1".into(), 0, Utc::now()))
        .await
        .unwrap();

    let bus = EventsBus::new(storage.events.clone());
    let config = std::sync::Arc::new(EngineConfig::default());
    let coordinator = RecoveryCoordinator::new(storage.clone(), bus, config);

    let first = coordinator.run("owner-new").await.unwrap();
    assert!(!first.is_empty());
    let second = coordinator.run("owner-new").await.unwrap();
    assert!(second.is_empty(), "second sweep found work: {second:?}");
}

#[tokio::test]
async fn adopted_paused_run_can_be_resumed_by_requeue() {
    let storage = StoragePort::in_memory();
    storage
        .flows
        .save(single_node_flow("f1", "succeed"))
        .await
        .unwrap();
    storage.runs.save(seeded_run("p1", RunStatus::Paused)).await.unwrap();
    let mut item = QueueItem::queued("p1".into(), "f1".into(), 0, Utc::now());
    item.status = QueueStatus::Paused;
    item.attempt = 1;
    item.lease = Some(Lease::new("old", Utc::now() - chrono::Duration::seconds(10)));
    storage.queue.enqueue(item).await.unwrap();

    let engine = Engine::start(fast_config(), storage, test_registry())
        .await
        .unwrap();
    assert_eq!(engine.recovery_report().adopted_paused, vec!["p1".to_string()]);

    // No live walker holds the run, so resume re-queues it for a fresh
    // at-least-once execution.
    engine.resume_run("p1").await.unwrap();
    let run = wait_for_status(&engine, "p1", RunStatus::Succeeded).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    engine.shutdown().await;
}

#[tokio::test]
async fn queue_item_without_run_record_is_dropped() {
    let storage = StoragePort::in_memory();
    storage
        .queue
        .enqueue(QueueItem::queued("ghost".into(), "f1".into(), 0, Utc::now()))
        .await
        .unwrap();

    let bus = EventsBus::new(storage.events.clone());
    let config = std::sync::Arc::new(EngineConfig::default());
    let coordinator = RecoveryCoordinator::new(storage.clone(), bus, config);
    let report = coordinator.run("owner-new").await.unwrap();
    assert_eq!(report.cleaned_terminal, vec!["ghost".to_string()]);
    assert!(storage.queue.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn recovered_run_patch_is_visible_before_scheduling() {
    let storage = StoragePort::in_memory();
    seed_orphaned_running(&storage, "r1").await;
    let bus = EventsBus::new(storage.events.clone());
    let config = std::sync::Arc::new(EngineConfig::default());
    RecoveryCoordinator::new(storage.clone(), bus, config)
        .run("owner-new")
        .await
        .unwrap();

    // A second consistency pass: the run record and queue item agree.
    let run = storage.runs.get("r1").await.unwrap().unwrap();
    let item = storage.queue.get("r1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(item.status, QueueStatus::Queued);
}
