use convoy::protocol::{ErrorCode, Event, Request};
use convoy_tests::harness::{
    client::TestClient, node::TestNode, unwrap_error_code, unwrap_ok_data, wait_for_event,
};
use std::time::Duration;

#[tokio::test]
async fn handoff_pushes_task_assigned_to_the_target() {
    let node = TestNode::spawn().await.unwrap();
    let mut alice = TestClient::connect_as(&node.socket_path, "alice").await.unwrap();
    let mut bob = TestClient::connect_as(&node.socket_path, "bob").await.unwrap();

    let task = alice.create_task("review the incident report").await.unwrap();
    unwrap_ok_data(alice.handoff(&task.id, "bob").await.unwrap());

    let event = wait_for_event(&mut bob, Duration::from_secs(2), |e| {
        matches!(e, Event::TaskAssigned { .. })
    })
    .await
    .expect("bob should be told about the handoff");
    match event {
        Event::TaskAssigned { task_id, from, .. } => {
            assert_eq!(task_id, task.id);
            assert_eq!(from, "alice");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let accepted = unwrap_ok_data(
        bob.call(Request::HandoffAccept {
            task_id: task.id.clone(),
        })
        .await
        .unwrap(),
    )
    .unwrap();
    assert_eq!(accepted["handoffPending"], false);
    assert_eq!(accepted["assignee"], "bob");
}

#[tokio::test]
async fn chain_stops_at_the_depth_limit() {
    let node = TestNode::spawn_with(
        r#"
        [delegation]
        max_depth = 2
        "#,
    )
    .await
    .unwrap();
    let mut alice = TestClient::connect_as(&node.socket_path, "alice").await.unwrap();
    let mut bob = TestClient::connect_as(&node.socket_path, "bob").await.unwrap();

    let task = alice.create_task("chase the flaky test").await.unwrap();
    unwrap_ok_data(alice.handoff(&task.id, "bob").await.unwrap());

    let resp = bob.handoff(&task.id, "carol").await.unwrap();
    assert_eq!(unwrap_error_code(&resp), ErrorCode::DepthExceeded);

    // The blocked hop is on record and holds the chain.
    let stored = bob.get_task(&task.id).await.unwrap();
    assert_eq!(stored.assignee.as_deref(), Some("bob"));
    let pending = stored.delegation.pending().expect("blocked hop recorded");
    assert_eq!(pending.to, "carol");
    assert_eq!(pending.depth, 2);

    let resp = bob.handoff(&task.id, "alice").await.unwrap();
    assert_eq!(unwrap_error_code(&resp), ErrorCode::DepthExceeded);
}

#[tokio::test]
async fn reauthorization_completes_the_blocked_hop() {
    let node = TestNode::spawn_with(
        r#"
        [delegation]
        max_depth = 2
        reauthorize = ["alice"]
        reauthorize_ceiling = 4
        "#,
    )
    .await
    .unwrap();
    let mut alice = TestClient::connect_as(&node.socket_path, "alice").await.unwrap();
    let mut bob = TestClient::connect_as(&node.socket_path, "bob").await.unwrap();
    let mut carol = TestClient::connect_as(&node.socket_path, "carol").await.unwrap();

    let task = alice.create_task("rebuild search index").await.unwrap();
    unwrap_ok_data(alice.handoff(&task.id, "bob").await.unwrap());
    let resp = bob.handoff(&task.id, "carol").await.unwrap();
    assert_eq!(unwrap_error_code(&resp), ErrorCode::DepthExceeded);

    let over_ceiling = alice
        .call(Request::ReauthorizeDelegation {
            task_id: task.id.clone(),
            max_depth: 9,
            reason: "carol owns the indexer".into(),
        })
        .await
        .unwrap();
    assert_eq!(unwrap_error_code(&over_ceiling), ErrorCode::Forbidden);

    let resp = alice
        .call(Request::ReauthorizeDelegation {
            task_id: task.id.clone(),
            max_depth: 3,
            reason: "carol owns the indexer".into(),
        })
        .await
        .unwrap();
    let task_json = unwrap_ok_data(resp).unwrap();
    assert_eq!(task_json["assignee"], "carol");

    let event = wait_for_event(&mut carol, Duration::from_secs(2), |e| {
        matches!(e, Event::TaskAssigned { .. })
    })
    .await;
    assert!(event.is_some());

    let resp = alice
        .call(Request::ReauthorizeDelegation {
            task_id: task.id,
            max_depth: 3,
            reason: "again".into(),
        })
        .await
        .unwrap();
    assert_eq!(unwrap_error_code(&resp), ErrorCode::NotFound);
}

#[tokio::test]
async fn open_circuit_refuses_handoffs() {
    let node = TestNode::spawn_with(
        r#"
        [circuit_breaker]
        threshold = 1
        "#,
    )
    .await
    .unwrap();
    let mut alice = TestClient::connect_as(&node.socket_path, "alice").await.unwrap();

    let task = alice
        .create_task_with("first try", Default::default(), Some("bob"))
        .await
        .unwrap();
    for status in [
        convoy::protocol::TaskStatus::InProgress,
        convoy::protocol::TaskStatus::ReadyForReview,
    ] {
        unwrap_ok_data(alice.update_status(&task.id, status, None, None, None).await.unwrap());
    }
    unwrap_ok_data(
        alice
            .update_status(
                &task.id,
                convoy::protocol::TaskStatus::Rejected,
                None,
                Some("wrong branch"),
                None,
            )
            .await
            .unwrap(),
    );

    let next = alice.create_task("second try").await.unwrap();
    let resp = alice.handoff(&next.id, "bob").await.unwrap();
    assert_eq!(unwrap_error_code(&resp), ErrorCode::CircuitOpen);

    let ranked = unwrap_ok_data(
        alice
            .call(Request::SuggestAssignee {
                task_id: None,
                exclude: vec![],
            })
            .await
            .unwrap(),
    )
    .unwrap();
    let names: Vec<&str> = ranked
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["account"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["carol"]);
}
