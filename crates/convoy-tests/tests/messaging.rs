use convoy::protocol::{Event, Request};
use convoy_tests::harness::{client::TestClient, node::TestNode, unwrap_ok_data, wait_for_event};
use std::time::Duration;

#[tokio::test]
async fn message_is_pushed_and_stored() {
    let node = TestNode::spawn().await.unwrap();
    let mut alice = TestClient::connect_as(&node.socket_path, "alice").await.unwrap();
    let mut bob = TestClient::connect_as(&node.socket_path, "bob").await.unwrap();

    let id = alice
        .send_message("bob", "can you take the on-call handover tonight?")
        .await
        .unwrap();

    let event = wait_for_event(&mut bob, Duration::from_secs(2), |e| {
        matches!(e, Event::NewMessage { .. })
    })
    .await
    .expect("bob should be notified");
    match event {
        Event::NewMessage {
            message_id,
            from,
            preview,
        } => {
            assert_eq!(message_id, id);
            assert_eq!(from, "alice");
            assert!(preview.starts_with("can you take"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert_eq!(bob.count_unread().await.unwrap(), 1);
    let read = bob.read_messages(true).await.unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].body, "can you take the on-call handover tonight?");
    assert_eq!(bob.count_unread().await.unwrap(), 0);

    // Alice's own inbox is untouched.
    assert_eq!(alice.count_unread().await.unwrap(), 0);
}

#[tokio::test]
async fn offline_recipient_reads_later() {
    let node = TestNode::spawn().await.unwrap();
    let mut alice = TestClient::connect_as(&node.socket_path, "alice").await.unwrap();
    alice.send_message("carol", "first").await.unwrap();
    alice.send_message("carol", "second").await.unwrap();

    let mut carol = TestClient::connect_as(&node.socket_path, "carol").await.unwrap();
    let read = carol.read_messages(false).await.unwrap();
    let bodies: Vec<&str> = read.iter().map(|m| m.body.as_str()).collect();
    assert!(bodies.contains(&"first"));
    assert!(bodies.contains(&"second"));
    assert!(carol.take_events().is_empty());
}

#[tokio::test]
async fn events_reach_every_connection_of_the_account() {
    let node = TestNode::spawn().await.unwrap();
    let mut alice = TestClient::connect_as(&node.socket_path, "alice").await.unwrap();
    let mut bob_cli = TestClient::connect_as(&node.socket_path, "bob").await.unwrap();
    let mut bob_ide = TestClient::connect_as(&node.socket_path, "bob").await.unwrap();

    alice.send_message("bob", "ping").await.unwrap();
    for client in [&mut bob_cli, &mut bob_ide] {
        let got = wait_for_event(client, Duration::from_secs(2), |e| {
            matches!(e, Event::NewMessage { .. })
        })
        .await;
        assert!(got.is_some());
    }

    let accounts = unwrap_ok_data(alice.call(Request::ListAccounts).await.unwrap()).unwrap();
    let bob = accounts
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["name"] == "bob")
        .unwrap();
    assert_eq!(bob["sessions"], 2);
}
