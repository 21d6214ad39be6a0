use std::time::Duration;
use teamflow::protocol::{ChangeKind, ErrorCode, Event, Request, Response};
use teamflow_tests::harness::client::TestClient;
use teamflow_tests::harness::node::TestNode;
use teamflow_tests::harness::{assert_code, init_tracing, poll_context_until, unwrap_ok_data};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const WAIT: Duration = Duration::from_secs(3);

async fn shared_session(alice: &mut TestClient) -> (String, String) {
    let template = alice.create_template("ops", &["triage"]).await.unwrap();
    let session = alice.create_session(&template.id, "incident 42").await.unwrap();
    alice.add_member(&session.id, "bob", &[]).await.unwrap();
    (session.id, template.steps[0].id.clone())
}

#[tokio::test]
async fn subscriber_is_told_after_commit() {
    init_tracing();
    let node = TestNode::spawn(&["alice", "bob"]).await.unwrap();
    let mut alice = TestClient::connect(&node, "alice").await.unwrap();
    let mut bob = TestClient::connect(&node, "bob").await.unwrap();
    let (session_id, step_id) = shared_session(&mut alice).await;

    bob.subscribe(&session_id, "bob").await.unwrap();
    alice.assign(&session_id, &step_id, "bob", false).await.unwrap();

    let event = bob.next_event(WAIT).await.expect("bob should hear the assignment");
    assert_eq!(
        event,
        Event::SessionChanged {
            session_id: session_id.clone(),
            change: ChangeKind::Assignments,
        }
    );
    // The refetch triggered by the event already sees the write.
    let ctx = bob.context(&session_id).await.unwrap();
    assert_eq!(ctx.viewer.lane_cursor.as_deref(), Some(step_id.as_str()));
    assert!(ctx.steps[0].can_complete);

    // A rejected write broadcasts nothing.
    assert_code(
        alice.assign(&session_id, &step_id, "bob", false).await,
        ErrorCode::Conflict,
    );
    assert!(bob.next_event(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn subscribe_checks_identity_and_membership() {
    init_tracing();
    let node = TestNode::spawn(&["alice", "bob", "mallory"]).await.unwrap();
    let mut alice = TestClient::connect(&node, "alice").await.unwrap();
    let mut mallory = TestClient::connect(&node, "mallory").await.unwrap();
    let (session_id, _) = shared_session(&mut alice).await;

    assert_code(mallory.subscribe(&session_id, "bob").await, ErrorCode::Forbidden);
    assert_code(mallory.subscribe(&session_id, "mallory").await, ErrorCode::Forbidden);
    assert_code(mallory.subscribe("no-such-session", "mallory").await, ErrorCode::NotFound);
    assert_eq!(node.state.bus().subscriber_count(&session_id), 0);

    let mut anonymous = TestClient::connect_anonymous(&node).await.unwrap();
    assert_code(anonymous.subscribe(&session_id, "alice").await, ErrorCode::Unauthenticated);

    // The connection survives failed requests.
    let resp = anonymous.try_request(Request::Health).await.unwrap();
    assert!(unwrap_ok_data(resp).is_some());
}

#[tokio::test]
async fn removed_member_stops_receiving_events() {
    init_tracing();
    let node = TestNode::spawn(&["alice", "bob"]).await.unwrap();
    let mut alice = TestClient::connect(&node, "alice").await.unwrap();
    let mut bob = TestClient::connect(&node, "bob").await.unwrap();
    let (session_id, _) = shared_session(&mut alice).await;
    bob.subscribe(&session_id, "bob").await.unwrap();

    alice
        .request(Request::RemoveMember {
            session_id: session_id.clone(),
            user_id: "bob".into(),
        })
        .await
        .unwrap();
    let event = bob.next_event(WAIT).await.expect("bob should hear his removal");
    assert_eq!(event.session_id(), session_id);

    alice.say(&session_id, "bob is gone").await.unwrap();
    assert!(bob.next_event(Duration::from_millis(200)).await.is_none());
    assert_code(bob.context(&session_id).await, ErrorCode::Forbidden);
}

#[tokio::test]
async fn deleting_a_session_notifies_and_closes() {
    init_tracing();
    let node = TestNode::spawn(&["alice", "bob"]).await.unwrap();
    let mut alice = TestClient::connect(&node, "alice").await.unwrap();
    let mut bob = TestClient::connect(&node, "bob").await.unwrap();
    let (session_id, _) = shared_session(&mut alice).await;
    bob.subscribe(&session_id, "bob").await.unwrap();

    alice
        .request(Request::DeleteSession {
            session_id: session_id.clone(),
        })
        .await
        .unwrap();
    let event = bob.next_event(WAIT).await.unwrap();
    assert_eq!(
        event,
        Event::SessionChanged {
            session_id: session_id.clone(),
            change: ChangeKind::SessionDeleted,
        }
    );
    assert_eq!(node.state.bus().subscriber_count(&session_id), 0);
    assert_code(bob.context(&session_id).await, ErrorCode::NotFound);
}

#[tokio::test]
async fn malformed_frames_get_an_error_and_keep_the_connection() {
    init_tracing();
    let node = TestNode::spawn(&["alice"]).await.unwrap();
    let stream = tokio::net::TcpStream::connect(node.addr).await.unwrap();
    let (r, mut w) = stream.into_split();
    let mut lines = BufReader::new(r).lines();

    let hello: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert!(matches!(hello, Response::Hello { .. }));

    w.write_all(b"{\"type\":\"launch_rockets\"}\n").await.unwrap();
    let resp: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    match resp {
        Response::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRequest),
        other => panic!("expected an error, got {other:?}"),
    }

    w.write_all(b"{\"type\":\"health\"}\n").await.unwrap();
    let resp: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert!(matches!(resp, Response::Ok { .. }));
}

#[tokio::test]
async fn progress_is_visible_to_other_members() {
    init_tracing();
    let node = TestNode::spawn(&["alice", "bob"]).await.unwrap();
    let mut alice = TestClient::connect(&node, "alice").await.unwrap();
    let mut bob = TestClient::connect(&node, "bob").await.unwrap();
    let (session_id, step_id) = shared_session(&mut alice).await;
    alice.assign(&session_id, &step_id, "alice", false).await.unwrap();

    // Bob cannot see alice's open step yet.
    let ctx = bob.context(&session_id).await.unwrap();
    assert!(!ctx.steps[0].visible);
    assert!(ctx.steps[0].content.is_none());

    let ssid = alice.context(&session_id).await.unwrap().steps[0]
        .session_step_id
        .clone();
    alice.complete(&ssid).await.unwrap();

    let ctx = poll_context_until(&mut bob, &session_id, WAIT, |ctx| ctx.steps[0].is_completed).await;
    assert!(ctx.steps[0].visible);
    assert_eq!(ctx.steps[0].completed_by.as_deref(), Some("alice"));
}
