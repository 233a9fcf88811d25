//! Integration tests for session authentication, resumption and expiry.

mod common;

use common::{TestClient, TestServer};
use replicad::state::DefaultResolver;
use replicad::state::client_object::SYSTEM_MESSAGE;
use replicad_proto::{AuthResponse, DEvent, DownstreamMessage, EventKind, UpstreamMessage, Value};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn ping_is_answered_with_server_time() {
    let server = TestServer::spawn().await.expect("Failed to spawn test server");
    let mut client = TestClient::connect(server.addr, "alice").await.unwrap();

    client
        .send(UpstreamMessage::Ping { client_stamp: 42 })
        .await
        .unwrap();
    let (client_stamp, server_stamp) = client
        .recv_until(|message| match message {
            DownstreamMessage::Pong {
                client_stamp,
                server_stamp,
            } => Some((client_stamp, server_stamp)),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(client_stamp, 42);
    assert!(server_stamp > 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn static_auth_rejects_unknown_users() {
    let server = TestServer::spawn_with(
        "[auth]\nmode = \"static\"\n\n[auth.users]\nalice = \"wonderland\"\n",
        Arc::new(DefaultResolver),
    )
    .await
    .expect("Failed to spawn test server");

    assert_eq!(
        TestClient::try_auth(server.addr, "alice", "wonderland").await.unwrap(),
        AuthResponse::Accepted
    );
    assert_eq!(
        TestClient::try_auth(server.addr, "alice", "looking-glass").await.unwrap(),
        AuthResponse::Rejected {
            reason: "m.invalid_password".into()
        }
    );
    assert_eq!(
        TestClient::try_auth(server.addr, "bob", "").await.unwrap(),
        AuthResponse::Rejected {
            reason: "m.no_such_user".into()
        }
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn resumed_session_keeps_its_object_and_backlog() {
    let server = TestServer::spawn().await.expect("Failed to spawn test server");
    let client = TestClient::connect(server.addr, "alice").await.unwrap();
    let oid = client.client_oid();
    client.disconnect();

    let clients = Arc::clone(&server.clients);
    server
        .wait_for(|| clients.session("alice").is_some_and(|s| !s.is_attached()))
        .await
        .unwrap();

    for name in ["first", "second"] {
        server.omgr.post_event(DEvent::attribute_changed(oid, "username", name));
    }

    let mut client = TestClient::reconnect(server.addr, "alice").await.unwrap();
    assert_eq!(client.client_oid(), oid);
    assert_eq!(server.clients.session_count(), 1);

    for expected in ["first", "second"] {
        let event = client.next_event(oid).await.unwrap();
        match event.kind {
            EventKind::AttributeChanged { name, value, .. } => {
                assert_eq!(name, "username");
                assert_eq!(value, Value::from(expected));
            }
            other => panic!("expected a username change, got {other:?}"),
        }
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn second_connection_replaces_the_first() {
    let server = TestServer::spawn().await.expect("Failed to spawn test server");
    let mut first = TestClient::connect(server.addr, "alice").await.unwrap();
    let second = TestClient::reconnect(server.addr, "alice").await.unwrap();

    assert_eq!(first.client_oid(), second.client_oid());
    assert!(first.closed_within(Duration::from_secs(2)).await);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn logoff_ends_the_session_and_destroys_the_client_object() {
    let server = TestServer::spawn().await.expect("Failed to spawn test server");
    let client = TestClient::connect(server.addr, "alice").await.unwrap();
    let oid = client.client_oid();

    let mut watcher = TestClient::connect(server.addr, "watcher").await.unwrap();
    assert_eq!(
        watcher.subscribe(oid).await.unwrap().unwrap_err(),
        format!("m.access_denied\t{oid}")
    );

    client.logoff().await.unwrap();
    let clients = Arc::clone(&server.clients);
    server.wait_for(|| clients.session("alice").is_none()).await.unwrap();

    assert_eq!(
        watcher.subscribe(oid).await.unwrap().unwrap_err(),
        format!("m.no_such_object\t{oid}")
    );
    assert_eq!(server.clients.session_count(), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn detached_session_expires_after_the_grace_period() {
    let server = TestServer::spawn_with(
        "[session]\ngrace_period = 0\nflush_interval = 1\n",
        Arc::new(DefaultResolver),
    )
    .await
    .expect("Failed to spawn test server");

    let client = TestClient::connect(server.addr, "alice").await.unwrap();
    client.disconnect();

    let clients = Arc::clone(&server.clients);
    server.wait_for(|| clients.session_count() == 0).await.unwrap();

    server.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_connected_clients() {
    let server = TestServer::spawn().await.expect("Failed to spawn test server");
    let mut client = TestClient::connect(server.addr, "alice").await.unwrap();

    let stats = server.stop().await.unwrap();
    assert!(stats.units_processed > 0);
    assert!(client.closed_within(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn reboot_warning_reaches_connected_clients() {
    let server = TestServer::spawn().await.expect("Failed to spawn test server");
    let mut client = TestClient::connect(server.addr, "alice").await.unwrap();
    let oid = client.client_oid();

    server.reboot.schedule_reboot_in(Duration::from_secs(10 * 60), "admin");
    assert!(server.reboot.will_shutdown_soon());

    let event = client.next_event(oid).await.unwrap();
    match event.kind {
        EventKind::Message { name, args } => {
            assert_eq!(name, SYSTEM_MESSAGE);
            assert_eq!(
                args,
                vec![Value::from("m.reboot_warning\t10\tm.reboot_msg_standard")]
            );
        }
        other => panic!("expected a system message, got {other:?}"),
    }

    server.reboot.cancel_reboot();
    server.stop().await.unwrap();
}
