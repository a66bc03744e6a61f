mod common;

use common::{TestGateway, is_ping};
use gw_protocol::{CommandResult, Status, StreamMessage};
use gw_test_utils::TestWsClient;

fn chat_subscription() -> CommandResult {
    CommandResult {
        status: Status::Success,
        streams: vec!["messages_1".to_owned()],
        transmissions: vec![r#"{"type":"confirm_subscription","identifier":"chat_1"}"#.to_owned()],
        ..CommandResult::default()
    }
}

#[tokio::test]
async fn subscribe_confirm_then_broadcast_arrives_with_its_position() {
    let gateway = TestGateway::start().await;
    gateway
        .command_server
        .on_command("subscribe", "chat_1", chat_subscription());

    let mut client = TestWsClient::connect(&gateway.ws_url("id=u:1")).await.unwrap();
    client.recv_until(|f| f.contains("welcome")).await.unwrap();

    client
        .send(r#"{"command":"subscribe","identifier":"chat_1"}"#)
        .await
        .unwrap();
    let confirm = client.recv_until(|f| !is_ping(f)).await.unwrap();
    assert_eq!(confirm, r#"{"type":"confirm_subscription","identifier":"chat_1"}"#);

    gateway
        .node
        .handle_pubsub(br#"{"stream":"messages_1","data":"hi"}"#)
        .await;

    let frame = client.recv_until(|f| !is_ping(f)).await.unwrap();
    let epoch = gateway.node.broker().epoch();
    assert_eq!(
        frame,
        format!(
            r#"{{"identifier":"chat_1","message":"hi","stream_id":"messages_1","epoch":"{epoch}","offset":1}}"#
        )
    );
}

#[tokio::test]
async fn every_subscriber_receives_the_broadcast() {
    let gateway = TestGateway::start().await;
    gateway
        .command_server
        .on_command("subscribe", "chat_1", chat_subscription());

    let mut first = TestWsClient::connect(&gateway.ws_url("id=u:1")).await.unwrap();
    let mut second = TestWsClient::connect(&gateway.ws_url("id=u:2")).await.unwrap();
    for client in [&mut first, &mut second] {
        client.recv_until(|f| f.contains("welcome")).await.unwrap();
        client
            .send(r#"{"command":"subscribe","identifier":"chat_1"}"#)
            .await
            .unwrap();
        client
            .recv_until(|f| f.contains("confirm_subscription"))
            .await
            .unwrap();
    }

    gateway
        .node
        .broadcast(StreamMessage::new("messages_1", "\"fan\""))
        .await;

    for client in [&mut first, &mut second] {
        let frame = client
            .recv_until(|f| f.contains(r#""message":"fan""#))
            .await
            .unwrap();
        assert!(frame.contains(r#""offset":1"#));
    }
}

#[tokio::test]
async fn broadcasts_on_other_streams_do_not_leak() {
    let gateway = TestGateway::start().await;
    gateway
        .command_server
        .on_command("subscribe", "chat_1", chat_subscription());

    let mut client = TestWsClient::connect(&gateway.ws_url("id=u:1")).await.unwrap();
    client.recv_until(|f| f.contains("welcome")).await.unwrap();
    client
        .send(r#"{"command":"subscribe","identifier":"chat_1"}"#)
        .await
        .unwrap();
    client
        .recv_until(|f| f.contains("confirm_subscription"))
        .await
        .unwrap();

    gateway
        .node
        .broadcast(StreamMessage::new("other_stream", "\"nope\""))
        .await;
    gateway
        .node
        .broadcast(StreamMessage::new("messages_1", "\"yes\""))
        .await;

    let frame = client
        .recv_until(|f| !is_ping(f))
        .await
        .unwrap();
    assert!(frame.contains(r#""message":"yes""#), "got: {frame}");
}

#[tokio::test]
async fn unsubscribed_clients_stop_receiving() {
    let gateway = TestGateway::start().await;
    gateway
        .command_server
        .on_command("subscribe", "chat_1", chat_subscription());

    let mut client = TestWsClient::connect(&gateway.ws_url("id=u:1")).await.unwrap();
    client.recv_until(|f| f.contains("welcome")).await.unwrap();
    client
        .send(r#"{"command":"subscribe","identifier":"chat_1"}"#)
        .await
        .unwrap();
    client
        .recv_until(|f| f.contains("confirm_subscription"))
        .await
        .unwrap();

    client
        .send(r#"{"command":"unsubscribe","identifier":"chat_1"}"#)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    gateway
        .node
        .broadcast(StreamMessage::new("messages_1", "\"silent\""))
        .await;
    gateway
        .node
        .broadcast(StreamMessage::new("messages_1", "\"still silent\""))
        .await;

    // Only pings from here on.
    loop {
        match client.recv_timeout(std::time::Duration::from_secs(1)).await {
            Ok(frame) if is_ping(&frame) => continue,
            Ok(frame) => panic!("unexpected frame: {frame}"),
            Err(_) => break,
        }
    }
}
