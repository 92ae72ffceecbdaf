use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use deepdive_supervisor::bus::SessionEvent;
use deepdive_supervisor::models::diagram::ValidationState;
use deepdive_supervisor::repair::{spawn_driver, DiagramRepairLoop, DiagramValidator};
use deepdive_supervisor::worker::WorkerEvent;

use super::test_helpers::{
    count_matching, fast_config, record_events, snapshot, start_params, supervisor_with,
    wait_until, FakeValidator,
};

const BROKEN_BLOCK: &str = "```mermaid\n%% broken\nflowchart TD\n```\n";

fn good_block(label: &str) -> String {
    format!("```mermaid\nflowchart TD\n    {label}\n```\n")
}

#[tokio::test]
async fn document_without_diagrams_is_a_no_op() {
    let (supervisor, _factory, _store) = supervisor_with(fast_config()).await;
    let validator = FakeValidator::new();
    let repair = DiagramRepairLoop::new(
        Arc::clone(&supervisor),
        validator.clone() as Arc<dyn DiagramValidator>,
        &fast_config().repair,
    );

    let report = repair.run("# Notes\n\nProse only.\n").await.unwrap();
    assert!(report.blocks.is_empty());
    assert_eq!(report.cycles, 0);
    assert_eq!(validator.call_count(), 0);
}

#[tokio::test]
async fn single_invalid_block_is_repaired_in_one_cycle() {
    let (supervisor, factory, _store) = supervisor_with(fast_config()).await;
    let (_sub, events) = record_events(&supervisor);
    supervisor.start(start_params("document the flows")).await.unwrap();

    let validator = FakeValidator::new();
    let repair = DiagramRepairLoop::new(
        Arc::clone(&supervisor),
        validator.clone() as Arc<dyn DiagramValidator>,
        &fast_config().repair,
    );

    let document = format!(
        "# Flows\n\n{}\n{}\n{}\n{}",
        good_block("A --> B"),
        BROKEN_BLOCK,
        good_block("C --> D"),
        good_block("E --> F"),
    );
    let corrected = format!(
        "# Flows\n\n{}\n{}\n{}\n{}",
        good_block("A --> B"),
        good_block("B --> C"),
        good_block("C --> D"),
        good_block("E --> F"),
    );
    factory.latest().queue_document(&corrected);

    let report = repair.run(&document).await.unwrap();

    assert_eq!(report.cycles, 1);
    assert!(report.all_valid());
    assert_eq!(report.blocks.len(), 4);
    assert_eq!(report.blocks[1].fix_attempts, 1);
    for index in [0, 2, 3] {
        assert_eq!(report.blocks[index].fix_attempts, 0);
    }
    assert_eq!(report.document, corrected);

    // One consolidated corrective prompt, naming the failing block only.
    let prompts = factory.latest().prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("diagram 2"), "got {}", prompts[0]);
    assert!(prompts[0].contains("parse error"), "got {}", prompts[0]);
    assert!(!prompts[0].contains("diagram 1"), "got {}", prompts[0]);

    // Four initial validations plus one re-validation of the fixed block.
    assert_eq!(validator.call_count(), 5);
    assert_eq!(
        count_matching(&events, |e| matches!(
            e,
            SessionEvent::DiagramsUnresolved { .. }
        )),
        0
    );
}

#[tokio::test]
async fn exhausted_cycles_surface_unresolved_blocks() {
    let mut config = fast_config();
    config.repair.cycle_limit = 2;
    let (supervisor, factory, _store) = supervisor_with(config.clone()).await;
    let (_sub, events) = record_events(&supervisor);
    supervisor.start(start_params("document the flows")).await.unwrap();

    let validator = FakeValidator::new();
    let repair = DiagramRepairLoop::new(
        Arc::clone(&supervisor),
        validator.clone() as Arc<dyn DiagramValidator>,
        &config.repair,
    );

    // The worker keeps returning a still-broken diagram.
    factory.latest().queue_document(BROKEN_BLOCK);
    factory.latest().queue_document(BROKEN_BLOCK);

    let report = repair.run(BROKEN_BLOCK).await.unwrap();

    assert_eq!(report.cycles, 2);
    assert!(!report.all_valid());
    assert_eq!(report.blocks[0].validation, ValidationState::Invalid);
    assert_eq!(report.blocks[0].fix_attempts, 2);
    assert_eq!(factory.latest().prompt_count(), 2);

    let unresolved = snapshot(&events)
        .into_iter()
        .find_map(|event| match event {
            SessionEvent::DiagramsUnresolved { blocks } => Some(blocks),
            _ => None,
        })
        .unwrap();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].index, 0);
    assert_eq!(unresolved[0].fix_attempts, 2);
}

#[tokio::test]
async fn corrected_document_missing_the_block_counts_as_invalid() {
    let mut config = fast_config();
    config.repair.cycle_limit = 1;
    let (supervisor, factory, _store) = supervisor_with(config.clone()).await;
    let (_sub, events) = record_events(&supervisor);
    supervisor.start(start_params("document the flows")).await.unwrap();

    let validator = FakeValidator::new();
    let repair = DiagramRepairLoop::new(
        Arc::clone(&supervisor),
        validator.clone() as Arc<dyn DiagramValidator>,
        &config.repair,
    );

    // The "correction" dropped the diagram entirely.
    factory.latest().queue_document("# Flows\n\nNo diagrams left.\n");

    let report = repair.run(BROKEN_BLOCK).await.unwrap();

    assert_eq!(report.cycles, 1);
    assert_eq!(report.blocks[0].validation, ValidationState::Invalid);
    assert_eq!(report.blocks[0].fix_attempts, 1);
    assert_eq!(
        report.blocks[0].last_error.as_deref(),
        Some("block missing from the corrected document")
    );
    assert_eq!(
        count_matching(&events, |e| matches!(
            e,
            SessionEvent::DiagramsUnresolved { .. }
        )),
        1
    );
}

#[tokio::test]
async fn dropped_block_shifting_later_diagrams_is_not_a_fix() {
    let mut config = fast_config();
    config.repair.cycle_limit = 1;
    let (supervisor, factory, _store) = supervisor_with(config.clone()).await;
    let (_sub, events) = record_events(&supervisor);
    supervisor.start(start_params("document the flows")).await.unwrap();

    let validator = FakeValidator::new();
    let repair = DiagramRepairLoop::new(
        Arc::clone(&supervisor),
        validator.clone() as Arc<dyn DiagramValidator>,
        &config.repair,
    );

    let document = format!(
        "# Flows\n\n{}\n{}\n{}",
        good_block("A --> B"),
        BROKEN_BLOCK,
        good_block("C --> D"),
    );
    // The "correction" deletes the broken diagram outright, shifting the
    // last (valid) diagram onto the broken one's position.
    let corrected = format!(
        "# Flows\n\n{}\n{}",
        good_block("A --> B"),
        good_block("C --> D"),
    );
    factory.latest().queue_document(&corrected);

    let report = repair.run(&document).await.unwrap();

    assert_eq!(report.cycles, 1);
    assert!(!report.all_valid(), "a dropped block must not read as fixed");
    assert_eq!(report.blocks[1].validation, ValidationState::Invalid);
    assert_eq!(report.blocks[1].fix_attempts, 1);
    assert_eq!(
        report.blocks[1].last_error.as_deref(),
        Some("block missing from the corrected document")
    );
    assert_eq!(report.blocks[0].validation, ValidationState::Valid);
    assert_eq!(report.blocks[2].validation, ValidationState::Valid);

    // Three initial validations; the shifted survivor is never mistaken
    // for a corrected version of the broken block.
    assert_eq!(validator.call_count(), 3);

    let unresolved = snapshot(&events)
        .into_iter()
        .find_map(|event| match event {
            SessionEvent::DiagramsUnresolved { blocks } => Some(blocks),
            _ => None,
        })
        .unwrap();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].index, 1);
}

#[tokio::test]
async fn driver_runs_a_pass_for_each_completed_document() {
    let (supervisor, factory, _store) = supervisor_with(fast_config()).await;
    supervisor.start(start_params("document the flows")).await.unwrap();

    let validator = FakeValidator::new();
    let repair = Arc::new(DiagramRepairLoop::new(
        Arc::clone(&supervisor),
        validator.clone() as Arc<dyn DiagramValidator>,
        &fast_config().repair,
    ));
    let cancel = CancellationToken::new();
    let (_driver_sub, driver) = spawn_driver(repair, supervisor.bus(), cancel.clone());

    let worker = factory.latest();
    worker.queue_document(&good_block("A --> B"));
    worker.emit(WorkerEvent::DocumentComplete {
        markdown: BROKEN_BLOCK.to_owned(),
    });

    // The driver validates the draft, prompts once, and accepts the fix.
    assert!(wait_until(Duration::from_secs(2), || worker.prompt_count() == 1).await);
    assert!(wait_until(Duration::from_secs(2), || validator.call_count() == 2).await);

    cancel.cancel();
    driver.await.unwrap();
}
