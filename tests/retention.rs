//! Retention Integration Tests
//!
//! The sweep only ever touches finished work items.

mod common;

use common::{FakeImages, Fakes, Harness};
use storyreel::core::RetentionSweep;
use storyreel::domain::{ArtifactKind, EventType, Scope, Stage, Subject, UnitRef};

#[test]
fn test_unfinished_items_are_left_alone() {
    tokio_test::block_on(async {
        let harness = Harness::new();
        let item = harness.planned_item("Wombats produce cube-shaped droppings.", 2);
        let fakes = Fakes::new(FakeImages::new());
        let collaborators = fakes.collaborators();

        for stage in Stage::in_scope(Scope::Segment) {
            harness.worker(stage, &collaborators).run().await.unwrap();
        }

        let layout = harness.settings.layout();
        let segment = harness.store.segments_for(item).unwrap()[0].id;
        let clip = layout.path_for(ArtifactKind::SegmentClip, segment);
        assert!(clip.is_file());

        let summary = RetentionSweep::new(harness.store.clone(), layout)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.items, 0);
        assert_eq!(summary.removed, 0);
        assert!(clip.is_file());

        let swept = harness
            .store
            .events_for(Subject::Unit(UnitRef::work_item(item)), None)
            .unwrap()
            .iter()
            .any(|e| e.event_type == EventType::Swept);
        assert!(!swept);
    });
}

#[tokio::test]
async fn test_sweep_records_an_event_per_item() {
    let harness = Harness::new();
    let first = harness.planned_item("Wombats produce cube-shaped droppings.", 2);
    let second = harness.planned_item("A day on Venus is longer than its year.", 2);
    let fakes = Fakes::new(FakeImages::new());
    let collaborators = fakes.collaborators();

    for stage in Stage::ALL {
        harness.worker(stage, &collaborators).run().await.unwrap();
    }

    let summary = RetentionSweep::new(harness.store.clone(), harness.settings.layout())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.items, 2);

    for item in [first, second] {
        let events = harness
            .store
            .events_for(Subject::Unit(UnitRef::work_item(item)), None)
            .unwrap();
        let swept = events
            .iter()
            .filter(|e| e.event_type == EventType::Swept)
            .count();
        assert_eq!(swept, 1, "item {item}");
    }
}
