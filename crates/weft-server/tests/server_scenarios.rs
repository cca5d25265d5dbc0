//! End-to-end scenarios against the full server facade.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use weft_orchestration::testing::{MockAgent, MockAgentBuilder};
use weft_orchestration::SpawnRequest;
use weft_server::{
    PendingQuestion, ServerConfig, WeftServer, WeftServerBuilder, EPHEMERAL_AGENTS_TOOL,
};
use weft_types::{Agent, MessagePayload, ProgressEvent, WeftError};

fn server_with_limit(limit: usize) -> Arc<WeftServer> {
    WeftServerBuilder::new()
        .config(ServerConfig { llm_concurrency_limit: limit, ..ServerConfig::default() })
        .build()
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn clarification_happy_path() {
    let server = WeftServerBuilder::new().build();
    let (tx, mut rx) = mpsc::channel(1);
    server.questions().register(PendingQuestion {
        id: "q1".into(),
        prompt: "ok?".into(),
        answer_tx: Some(tx),
        created_at: chrono::Utc::now(),
    });

    let result = server.answer_clarification_question("q1", "Yes").await.unwrap();
    assert!(result.success);
    assert!(result.accepted);
    assert_eq!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.unwrap().unwrap(),
        "Yes"
    );
    assert_eq!(server.questions().count(), 0);
    server.stop().await;
}

#[tokio::test]
async fn clarification_timeout_on_blocked_channel() {
    let server = WeftServerBuilder::new().build();
    // Capacity-1 channel with no receiver draining it.
    let (tx, _rx) = mpsc::channel(1);
    tx.send("occupied".to_string()).await.unwrap();
    server.questions().register(PendingQuestion {
        id: "q1".into(),
        prompt: "ok?".into(),
        answer_tx: Some(tx),
        created_at: chrono::Utc::now(),
    });

    let result = server.answer_clarification_question("q1", "Yes").await.unwrap();
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("answer channel closed or timeout"));
    assert_eq!(server.questions().count(), 0);
    server.stop().await;
}

#[tokio::test]
async fn question_events_feed_the_pending_map() {
    let server = WeftServerBuilder::new().build();
    server.progress().emit(
        "s1",
        ProgressEvent::QuestionAsked { id: "q7".into(), prompt: "which one?".into() },
    );
    assert_eq!(server.questions().count(), 1);

    server.progress().emit("s1", ProgressEvent::QuestionAnswered { question_id: "q7".into() });
    assert_eq!(server.questions().count(), 0);
    server.stop().await;
}

#[tokio::test(start_paused = true)]
async fn coordinator_injection_end_to_end() {
    let server = WeftServerBuilder::new().build();
    let coordinator: Arc<MockAgent> = MockAgentBuilder::new("demo").coordinator("demo").build();
    server.add_agent(coordinator.clone()).unwrap();
    server.add_agent(MockAgentBuilder::new("demo:worker").build()).unwrap();

    let (session_id, _outcome) = server.weave("demo", "", "hello").await.unwrap();
    assert_eq!(coordinator.chat_count(), 1);
    // First session use registered the ephemeral-agents tool.
    assert!(coordinator.tools().contains(&EPHEMERAL_AGENTS_TOOL.to_string()));

    // A worker reports back over the point-to-point queue.
    server
        .send_async("demo:worker", "demo", "status", MessagePayload::text("ack"), HashMap::new())
        .unwrap();

    let chats = coordinator.chats();
    wait_for(|| chats.lock().unwrap().len() >= 2).await;
    let recorded = chats.lock().unwrap();
    let injected = &recorded[1];
    assert_eq!(injected.0, session_id);
    assert!(injected.1.starts_with("[MESSAGE FROM demo:worker]:\n\nack"));
    drop(recorded);

    server.stop().await;
}

#[tokio::test(start_paused = true)]
async fn spawn_cascade_cleanup() {
    let server = WeftServerBuilder::new().build();
    server.add_agent(MockAgentBuilder::new("lead").build()).unwrap();
    let worker_a = MockAgentBuilder::new("worker-a").build();
    let worker_b = MockAgentBuilder::new("worker-b").build();
    server.add_agent(worker_a.clone()).unwrap();
    server.add_agent(worker_b.clone()).unwrap();

    let parent = server.create_session("lead").await.unwrap();
    for base in ["worker-a", "worker-b"] {
        server
            .spawn_sub_agent(SpawnRequest {
                parent_session_id: parent.id.clone(),
                parent_agent_id: "lead".into(),
                base_agent_id: base.into(),
                auto_subscribe_topics: vec!["t".into()],
                ..Default::default()
            })
            .await
            .unwrap();
    }

    // Both spawned agents receive a broadcast on the shared topic.
    let receipt =
        server.publish("t", "lead", MessagePayload::text("fan out"), HashMap::new()).unwrap();
    assert_eq!(receipt.delivered, 2);
    wait_for(|| worker_a.chat_count() >= 1 && worker_b.chat_count() >= 1).await;

    // Deleting the parent session despawns every child before returning.
    server.delete_session(&parent.id).await.unwrap();
    assert_eq!(server.health().spawned_agents, 0);

    let receipt =
        server.publish("t", "lead", MessagePayload::text("anyone?"), HashMap::new()).unwrap();
    assert_eq!(receipt.delivered, 0);

    server.stop().await;
}

#[tokio::test(start_paused = true)]
async fn llm_concurrency_stays_bounded() {
    let server = server_with_limit(2);
    server.add_agent(MockAgentBuilder::new("lead").build()).unwrap();
    let worker = MockAgentBuilder::new("worker").delay(Duration::from_millis(100)).build();
    server.add_agent(worker.clone()).unwrap();

    let parent = server.create_session("lead").await.unwrap();
    for _ in 0..10 {
        server
            .spawn_sub_agent(SpawnRequest {
                parent_session_id: parent.id.clone(),
                parent_agent_id: "lead".into(),
                base_agent_id: "worker".into(),
                auto_subscribe_topics: vec!["fan".into()],
                ..Default::default()
            })
            .await
            .unwrap();
    }

    // One publish wakes all ten spawned loops at once.
    let receipt =
        server.publish("fan", "lead", MessagePayload::text("go"), HashMap::new()).unwrap();
    assert_eq!(receipt.delivered, 10);

    wait_for(|| worker.chat_count() >= 10).await;
    assert!(
        worker.peak_concurrency() <= 2,
        "observed {} concurrent chats over the limit of 2",
        worker.peak_concurrency()
    );

    server.stop().await;
}

#[tokio::test]
async fn stream_weave_ends_with_completed_event() {
    let server = WeftServerBuilder::new().build();
    server.add_agent(MockAgentBuilder::new("demo").reply("all done").build()).unwrap();

    let (_session, mut rx) = server.stream_weave("demo", "", "hi").await.unwrap();
    let mut last = None;
    while let Some(event) = rx.recv().await {
        last = Some(event);
    }
    match last.unwrap() {
        ProgressEvent::Completed { text, cost_usd } => {
            assert_eq!(text, "all done");
            assert!(cost_usd > 0.0);
        }
        other => panic!("expected terminal Completed, got {other:?}"),
    }
    server.stop().await;
}

#[tokio::test]
async fn unknown_agent_lists_available_ids() {
    let server = WeftServerBuilder::new().build();
    server.add_agent(MockAgentBuilder::new("alpha").build()).unwrap();
    server.add_agent(MockAgentBuilder::new("beta").build()).unwrap();

    let err = server.weave("ghost", "", "hi").await.unwrap_err();
    match err {
        WeftError::NotFound(detail) => {
            assert!(detail.contains("alpha"));
            assert!(detail.contains("beta"));
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
    server.stop().await;
}

#[tokio::test(start_paused = true)]
async fn session_subscription_streams_new_messages() {
    let server = WeftServerBuilder::new().build();
    server.add_agent(MockAgentBuilder::new("demo").reply("hi there").build()).unwrap();

    let session = server.create_session("demo").await.unwrap();
    let mut rx = server.subscribe_to_session(&session.id).await.unwrap();

    server.weave("demo", &session.id, "hello").await.unwrap();

    // The 500 ms tick forwards the user message and the agent reply.
    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.content, "hello");
    assert_eq!(second.content, "hi there");
    assert!(!first.id.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn pattern_lifecycle_events_are_broadcast() {
    use weft_types::{PatternEventKind, PatternStep, WorkflowPattern};

    let server = WeftServerBuilder::new().build();
    let (_id, mut rx) = server.stream_pattern_updates().unwrap();

    let pattern = WorkflowPattern {
        name: "report".into(),
        description: None,
        steps: vec![PatternStep {
            id: "s".into(),
            agent: "demo".into(),
            prompt: "go".into(),
            depends_on: vec![],
        }],
    };
    server.create_pattern(pattern.clone(), false).unwrap();
    assert!(matches!(
        server.create_pattern(pattern.clone(), false),
        Err(WeftError::AlreadyExists(_))
    ));
    server.create_pattern(pattern.clone(), true).unwrap();
    server.delete_pattern("report").unwrap();

    // Invalid pattern: broadcast a validation failure, return InvalidArgument.
    let invalid = WorkflowPattern { name: "empty".into(), description: None, steps: vec![] };
    assert!(matches!(server.create_pattern(invalid, false), Err(WeftError::InvalidArgument(_))));

    let kinds: Vec<PatternEventKind> = [
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
    ]
    .into_iter()
    .map(|event| event.kind)
    .collect();
    assert_eq!(
        kinds,
        vec![
            PatternEventKind::PatternCreated,
            PatternEventKind::PatternModified,
            PatternEventKind::PatternDeleted,
            PatternEventKind::PatternValidationFailed,
        ]
    );
    server.stop().await;
}

#[tokio::test]
async fn health_reflects_subsystems() {
    let server = WeftServerBuilder::new().build();
    server.add_agent(MockAgentBuilder::new("alpha").build()).unwrap();

    let health = server.health();
    assert_eq!(health.agent_count, 1);
    assert_eq!(health.default_agent.as_deref(), Some("alpha"));
    assert!(health.communication);
    assert!(!health.orchestrator);
    assert!(!health.scheduler);
    server.stop().await;
}

#[tokio::test]
async fn disabled_communication_answers_unavailable() {
    let server = WeftServerBuilder::new()
        .config(ServerConfig { enable_communication: false, ..ServerConfig::default() })
        .build();

    let err =
        server.publish("t", "a", MessagePayload::text("x"), HashMap::new()).unwrap_err();
    assert!(matches!(err, WeftError::Unavailable(_)));
    let err = server
        .send_async("a", "b", "t", MessagePayload::text("x"), HashMap::new())
        .unwrap_err();
    assert!(matches!(err, WeftError::Unavailable(_)));
    server.stop().await;
}
