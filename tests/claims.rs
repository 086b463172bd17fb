//! Claim Protocol Integration Tests
//!
//! Concurrent claimers against one file-backed store, lease takeover and
//! completion idempotence.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use common::Harness;
use storyreel::domain::{EventType, Stage, Subject, UnitRef};
use storyreel::store::{ClaimOptions, CompleteOutcome, Store};

#[test]
fn test_exactly_one_concurrent_claimer_wins() {
    let harness = Harness::new();
    harness.planned_item("A fact that fits in one scene only.", 1);
    let db = harness.settings.paths.database.clone();

    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|n| {
            let db = db.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let store = Store::open(&db).unwrap();
                barrier.wait();
                store
                    .claim_next(Stage::Media, &format!("w{n}"), &ClaimOptions::default())
                    .unwrap()
            })
        })
        .collect();

    let claims: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(claims.len(), 1);
    assert_eq!(harness.store.live_claims().unwrap().len(), 1);
}

#[test]
fn test_draining_workers_claim_disjoint_units() {
    let harness = Harness::new();
    harness.planned_item("First fact, split into six scenes.", 6);
    harness.planned_item("Second fact, split into six scenes.", 6);
    let db = harness.settings.paths.database.clone();

    let handles: Vec<_> = (0..4)
        .map(|n| {
            let db = db.clone();
            thread::spawn(move || {
                let store = Store::open(&db).unwrap();
                let mut mine = Vec::new();
                while let Some(claim) = store
                    .claim_next(Stage::Media, &format!("w{n}"), &ClaimOptions::default())
                    .unwrap()
                {
                    mine.push(claim.unit.id);
                }
                mine
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.join().unwrap() {
            total += 1;
            assert!(seen.insert(id), "unit {id} was claimed twice");
        }
    }
    assert_eq!(total, 12);
    assert_eq!(seen.len(), 12);
}

#[test]
fn test_completion_is_idempotent() {
    let harness = Harness::new();
    harness.planned_item("A fact that fits in one scene only.", 1);
    let store = &harness.store;
    let options = ClaimOptions::default();

    let claim = store.claim_next(Stage::Media, "w1", &options).unwrap().unwrap();
    assert_eq!(
        store.complete(&claim, None, None, 5).unwrap(),
        CompleteOutcome::Completed
    );
    let first = store.sentinel(claim.unit, Stage::Media).unwrap();

    // The claim is gone; a replay leaves the sentinel alone
    assert_eq!(
        store.complete(&claim, None, None, 5).unwrap(),
        CompleteOutcome::ClaimLost
    );
    assert_eq!(store.sentinel(claim.unit, Stage::Media).unwrap(), first);

    assert!(store.claim_next(Stage::Media, "w2", &options).unwrap().is_none());

    let completions = store
        .events_for(Subject::Unit(claim.unit), Some(Stage::Media))
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::Completed)
        .count();
    assert_eq!(completions, 1);
}

#[test]
fn test_expired_lease_is_taken_over() {
    let harness = Harness::new();
    harness.planned_item("A fact that fits in one scene only.", 1);
    let store = &harness.store;
    let expired = ClaimOptions {
        lease: chrono::Duration::zero(),
        max_failures: None,
    };

    let stale = store.claim_next(Stage::Media, "slow", &expired).unwrap().unwrap();
    thread::sleep(std::time::Duration::from_millis(20));
    let fresh = store.claim_next(Stage::Media, "fast", &expired).unwrap().unwrap();
    assert_eq!(stale.unit, fresh.unit);
    assert_ne!(stale.token, fresh.token);

    // The original holder finishes late; its result is discarded
    assert_eq!(
        store.complete(&stale, None, None, 100).unwrap(),
        CompleteOutcome::ClaimLost
    );
    assert!(!store.sentinel(fresh.unit, Stage::Media).unwrap().is_set());

    assert_eq!(
        store.complete(&fresh, None, None, 10).unwrap(),
        CompleteOutcome::Completed
    );

    let events: Vec<_> = store
        .events_for(Subject::Unit(fresh.unit), Some(Stage::Media))
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(events.contains(&EventType::Reclaimed));
}

#[test]
fn test_item_stage_waits_for_every_segment() {
    let harness = Harness::new();
    let item = harness.planned_item("A fact told across two scenes.", 2);
    let store = &harness.store;
    let options = ClaimOptions::default();

    let tasks = store.segment_tasks_for(item).unwrap();
    let first = UnitRef::segment_task(tasks[0].id);

    for stage in Stage::in_scope(storyreel::domain::Scope::Segment) {
        let claim = store.claim_next(stage, "w", &options).unwrap().unwrap();
        assert_eq!(claim.unit, first);
        store.complete(&claim, None, None, 1).unwrap();
    }

    assert!(!store.fan_in_ready(item, Stage::Transition).unwrap());
    assert!(store
        .claim_next(Stage::Transition, "w", &options)
        .unwrap()
        .is_none());
    assert_eq!(
        store.unit_status(UnitRef::work_item(item), Stage::Transition).unwrap(),
        storyreel::StageStatus::Pending
    );
}
