use convoy::protocol::{EscalationAction, Event, HealthStatus, Request};
use convoy_node::sweeper::{HealthWatcher, SlaSweeper};
use convoy_tests::harness::{client::TestClient, node::TestNode, unwrap_ok_data, wait_for_event};
use std::time::Duration;

const FAST_TODO: &str = r#"
[sla.todo]
ping_mins = 0
reassign_mins = 60
escalate_mins = 120
"#;

#[tokio::test]
async fn sweep_pushes_escalation_to_assignee_and_creator() {
    let node = TestNode::spawn_with(FAST_TODO).await.unwrap();
    let mut alice = TestClient::connect_as(&node.socket_path, "alice").await.unwrap();
    let mut bob = TestClient::connect_as(&node.socket_path, "bob").await.unwrap();

    let task = alice
        .create_task_with("renew certificates", Default::default(), Some("bob"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut sweeper = SlaSweeper::new();
    let fresh = sweeper.sweep(&node.state).await;
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].action, EscalationAction::Ping);

    for client in [&mut bob, &mut alice] {
        let event = wait_for_event(client, Duration::from_secs(2), |e| {
            matches!(e, Event::Escalation { .. })
        })
        .await
        .expect("escalation should be pushed");
        match event {
            Event::Escalation { escalation } => assert_eq!(escalation.task_id, task.id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    // Already reported; nothing new on the next pass.
    assert!(sweeper.sweep(&node.state).await.is_empty());
}

#[tokio::test]
async fn ping_does_not_count_as_a_violation() {
    let node = TestNode::spawn_with(FAST_TODO).await.unwrap();
    let mut alice = TestClient::connect_as(&node.socket_path, "alice").await.unwrap();
    alice
        .create_task_with("tidy dashboards", Default::default(), Some("bob"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    SlaSweeper::new().sweep(&node.state).await;
    let health = node.state.health.lock().await;
    assert!(health.record("bob").is_none_or(|r| r.sla_violations == 0));
}

#[tokio::test]
async fn context_saturation_records_a_violation() {
    let node = TestNode::spawn().await.unwrap();
    let mut bob = TestClient::connect_as(&node.socket_path, "bob").await.unwrap();
    let task = bob.create_task("summarize the design doc").await.unwrap();

    unwrap_ok_data(
        bob.call(Request::ReportProgress {
            task_id: task.id.clone(),
            note: None,
            tokens_used: None,
            token_budget: None,
            context_used_pct: Some(97.0),
            checkpoint: true,
            session_ended: false,
        })
        .await
        .unwrap(),
    );

    let escalations = unwrap_ok_data(bob.call(Request::AdaptiveSlaCheck).await.unwrap()).unwrap();
    assert_eq!(escalations.as_array().unwrap().len(), 1);
    assert_eq!(escalations[0]["detail"]["trigger"], "context_saturation");

    let fresh = SlaSweeper::new().sweep(&node.state).await;
    assert_eq!(fresh.len(), 1);
    let view = node.state.health.lock().await.get_health("bob").unwrap();
    assert_eq!(view.sla_violations, 1);
    assert_eq!(view.status, HealthStatus::Degraded);
}

#[tokio::test]
async fn disconnect_is_broadcast_as_health_change() {
    let node = TestNode::spawn().await.unwrap();
    let mut alice = TestClient::connect_as(&node.socket_path, "alice").await.unwrap();
    let bob = TestClient::connect_as(&node.socket_path, "bob").await.unwrap();

    let mut watcher = HealthWatcher::new();
    watcher.poll(&node.state).await;

    drop(bob);
    // Let the daemon notice the closed socket.
    for _ in 0..50 {
        if node.state.sessions.lock().await.count("bob") == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(watcher.poll(&node.state).await, 1);

    let event = wait_for_event(&mut alice, Duration::from_secs(2), |e| {
        matches!(e, Event::HealthChanged { .. })
    })
    .await
    .expect("alice should see bob go offline");
    match event {
        Event::HealthChanged { account, from, to } => {
            assert_eq!(account, "bob");
            assert_eq!(from, Some(HealthStatus::Healthy));
            assert_eq!(to, HealthStatus::Critical);
        }
        other => panic!("unexpected event {other:?}"),
    }
}
