use std::time::Duration;

use deepdive_supervisor::bus::SessionEvent;
use deepdive_supervisor::models::session::SessionState;
use deepdive_supervisor::worker::WorkerEvent;
use deepdive_supervisor::AppError;

use super::test_helpers::{
    count_matching, fast_config, record_events, snapshot, start_params, supervisor_with,
    wait_until,
};

#[tokio::test]
async fn start_creates_a_running_session() {
    let (supervisor, factory, store) = supervisor_with(fast_config()).await;
    let (_sub, events) = record_events(&supervisor);

    let session_id = supervisor
        .start(start_params("map the storage layer"))
        .await
        .unwrap();

    assert!(!session_id.is_empty());
    assert_eq!(supervisor.current_state().await, Some(SessionState::Running));
    assert_eq!(factory.created(), 1);

    let recorded = snapshot(&events);
    assert_eq!(
        recorded.first(),
        Some(&SessionEvent::Started {
            session_id: session_id.clone()
        })
    );

    let record = store.get_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(record.prompt, "map the storage layer");
}

#[tokio::test]
async fn second_start_is_rejected_while_active() {
    let (supervisor, factory, _store) = supervisor_with(fast_config()).await;
    supervisor.start(start_params("first")).await.unwrap();

    let err = supervisor.start(start_params("second")).await.unwrap_err();
    assert!(matches!(err, AppError::Config(_)), "got {err}");
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn prompts_reach_the_worker() {
    let (supervisor, factory, _store) = supervisor_with(fast_config()).await;
    supervisor.start(start_params("explore")).await.unwrap();

    supervisor.prompt("dig into the cache layer").await.unwrap();
    assert_eq!(
        factory.latest().prompts(),
        vec!["dig into the cache layer".to_owned()]
    );
}

#[tokio::test]
async fn prompt_without_a_session_is_rejected() {
    let (supervisor, _factory, _store) = supervisor_with(fast_config()).await;
    let err = supervisor.prompt("anyone there?").await.unwrap_err();
    assert!(matches!(err, AppError::SessionEnded(_)), "got {err}");
}

#[tokio::test]
async fn stop_is_idempotent_and_publishes_once() {
    let (supervisor, factory, _store) = supervisor_with(fast_config()).await;
    supervisor.start(start_params("explore")).await.unwrap();
    let (_sub, events) = record_events(&supervisor);

    supervisor.stop().await.unwrap();
    supervisor.stop().await.unwrap();

    assert_eq!(supervisor.current_state().await, Some(SessionState::Stopped));
    assert_eq!(
        count_matching(&events, |e| matches!(e, SessionEvent::Stopped)),
        1
    );
    assert!(factory.latest().abort_count() >= 1);

    let err = supervisor.prompt("too late").await.unwrap_err();
    assert!(matches!(err, AppError::SessionEnded(_)), "got {err}");
}

#[tokio::test]
async fn abort_cancels_without_ending_the_session() {
    let (supervisor, factory, _store) = supervisor_with(fast_config()).await;

    // No session: a no-op, not an error.
    supervisor.abort().await;

    supervisor.start(start_params("explore")).await.unwrap();
    supervisor.abort().await;

    assert_eq!(factory.latest().abort_count(), 1);
    assert_eq!(supervisor.current_state().await, Some(SessionState::Running));
    supervisor.prompt("still here").await.unwrap();
}

#[tokio::test]
async fn worker_events_flow_in_order_and_fold_into_stats() {
    let (supervisor, factory, store) = supervisor_with(fast_config()).await;
    let (_sub, events) = record_events(&supervisor);
    let session_id = supervisor.start(start_params("explore")).await.unwrap();

    let worker = factory.latest();
    worker.emit(WorkerEvent::Message {
        role: "assistant".into(),
        text: "scanning the module tree".into(),
    });
    worker.emit(WorkerEvent::Usage {
        input_tokens: 120,
        output_tokens: 340,
        cost_usd: 0.02,
    });
    worker.emit(WorkerEvent::DocumentComplete {
        markdown: "# Findings".into(),
    });

    let delivered = wait_until(Duration::from_secs(2), || {
        count_matching(&events, |e| matches!(e, SessionEvent::Worker(_))) == 3
    })
    .await;
    assert!(delivered, "worker events were not forwarded");

    let worker_events: Vec<WorkerEvent> = snapshot(&events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Worker(inner) => Some(inner),
            _ => None,
        })
        .collect();
    assert!(matches!(worker_events[0], WorkerEvent::Message { .. }));
    assert!(matches!(worker_events[1], WorkerEvent::Usage { .. }));
    assert!(matches!(worker_events[2], WorkerEvent::DocumentComplete { .. }));

    let stats = supervisor.stats().await.unwrap();
    assert_eq!(stats.messages, 1);
    assert_eq!(stats.input_tokens, 120);
    assert_eq!(stats.output_tokens, 340);
    assert!((stats.cost_usd - 0.02).abs() < 1e-9);

    // Each event is persisted before it is published, so by now the
    // store already reflects all three.
    let record = store.get_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(record.stats.messages, 1);
    assert_eq!(store.history_len(&session_id).await.unwrap(), 3);
}

#[tokio::test]
async fn initial_factory_failure_fails_the_session() {
    let (supervisor, factory, _store) = supervisor_with(fast_config()).await;
    let (_sub, events) = record_events(&supervisor);
    factory.fail_times(1);

    let err = supervisor.start(start_params("explore")).await.unwrap_err();
    assert!(matches!(err, AppError::WorkerCreation(_)), "got {err}");
    assert_eq!(supervisor.current_state().await, Some(SessionState::Failed));

    // Failed without consuming the restart budget.
    assert_eq!(supervisor.session().await.unwrap().restart_count, 0);
    assert_eq!(
        count_matching(&events, |e| matches!(e, SessionEvent::Failed { .. })),
        1
    );
    assert_eq!(
        count_matching(&events, |e| matches!(e, SessionEvent::Restarted { .. })),
        0
    );
    assert_eq!(factory.created(), 0);
}
