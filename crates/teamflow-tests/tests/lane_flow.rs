use teamflow::protocol::ErrorCode;
use teamflow_core::model::Capability;
use teamflow_tests::harness::client::TestClient;
use teamflow_tests::harness::node::TestNode;
use teamflow_tests::harness::{assert_code, init_tracing, step_named};

struct Launch {
    session_id: String,
    s1: String,
    s2: String,
    s3: String,
}

/// Steps [S1,S2,S3] all assigned to alice; S2 also assigned to bob with
/// delegation, and carol standing in for bob's lane.
async fn launch(alice: &mut TestClient) -> Launch {
    let template = alice
        .create_template("release", &["S1", "S2", "S3"])
        .await
        .unwrap();
    let session = alice.create_session(&template.id, "v2.0").await.unwrap();
    alice.add_member(&session.id, "bob", &[]).await.unwrap();
    alice
        .add_member(&session.id, "carol", &[Capability::Chat])
        .await
        .unwrap();

    let order = template.step_order();
    for step_id in &order {
        alice.assign(&session.id, step_id, "alice", false).await.unwrap();
    }
    alice.assign(&session.id, &order[1], "bob", true).await.unwrap();
    alice
        .add_lane_delegate(&session.id, "bob", "carol")
        .await
        .unwrap();

    let ctx = alice.context(&session.id).await.unwrap();
    Launch {
        session_id: session.id.clone(),
        s1: step_named(&ctx, "S1").session_step_id.clone(),
        s2: step_named(&ctx, "S2").session_step_id.clone(),
        s3: step_named(&ctx, "S3").session_step_id.clone(),
    }
}

#[tokio::test]
async fn delegate_completes_shared_step() {
    init_tracing();
    let node = TestNode::spawn(&["alice", "bob", "carol"]).await.unwrap();
    let mut alice = TestClient::connect(&node, "alice").await.unwrap();
    let mut carol = TestClient::connect(&node, "carol").await.unwrap();
    let l = launch(&mut alice).await;

    let ctx = carol.context(&l.session_id).await.unwrap();
    let visible: Vec<&str> = ctx
        .steps
        .iter()
        .filter(|s| s.visible)
        .map(|s| s.session_step_id.as_str())
        .collect();
    assert_eq!(visible, vec![l.s2.as_str()]);
    assert!(ctx.viewer.lane_cursor.is_none());
    assert_eq!(ctx.viewer.active_lanes.len(), 1);
    assert_eq!(ctx.viewer.active_lanes[0].assignee_user_id, "bob");

    assert_code(alice.complete(&l.s3).await, ErrorCode::Forbidden);
    alice.complete(&l.s1).await.unwrap();

    let done = carol.complete(&l.s2).await.unwrap();
    assert_eq!(done.completed_by.as_deref(), Some("carol"));

    // Alice's own copy of S2 is already done; a second completion is refused.
    assert_code(alice.complete(&l.s2).await, ErrorCode::Conflict);
    let ctx = alice.context(&l.session_id).await.unwrap();
    assert_eq!(ctx.viewer.lane_cursor.as_deref(), Some(step_named(&ctx, "S3").step_id.as_str()));

    alice.complete(&l.s3).await.unwrap();
    let ctx = alice.context(&l.session_id).await.unwrap();
    assert!(ctx.steps.iter().all(|s| s.is_completed));
    assert!(ctx.viewer.lane_cursor.is_none());
}

#[tokio::test]
async fn racing_completions_produce_one_winner() {
    init_tracing();
    let node = TestNode::spawn(&["alice", "bob", "carol"]).await.unwrap();
    let mut alice = TestClient::connect(&node, "alice").await.unwrap();
    let mut carol = TestClient::connect(&node, "carol").await.unwrap();
    let l = launch(&mut alice).await;
    alice.complete(&l.s1).await.unwrap();

    let (a, c) = tokio::join!(alice.complete(&l.s2), carol.complete(&l.s2));
    let outcomes = [a.is_ok(), c.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1, "{outcomes:?}");
    let (winner, loser) = if a.is_ok() { ("alice", c) } else { ("carol", a) };
    assert_code(loser, ErrorCode::Conflict);

    let ctx = alice.context(&l.session_id).await.unwrap();
    assert_eq!(step_named(&ctx, "S2").completed_by.as_deref(), Some(winner));
}

#[tokio::test]
async fn delegation_management_rules() {
    init_tracing();
    let node = TestNode::spawn(&["alice", "bob", "carol", "dave"]).await.unwrap();
    let mut alice = TestClient::connect(&node, "alice").await.unwrap();
    let mut bob = TestClient::connect(&node, "bob").await.unwrap();
    let mut carol = TestClient::connect(&node, "carol").await.unwrap();
    let l = launch(&mut alice).await;

    // Carol does not own bob's lane and cannot manage assignments.
    assert_code(
        carol.add_lane_delegate(&l.session_id, "bob", "alice").await,
        ErrorCode::Forbidden,
    );
    // Bob can manage his own lane but only with participants.
    assert_code(
        bob.add_lane_delegate(&l.session_id, "bob", "dave").await,
        ErrorCode::Validation,
    );
    assert_code(
        bob.add_lane_delegate(&l.session_id, "bob", "bob").await,
        ErrorCode::Validation,
    );
    // Re-adding an existing lane delegate is accepted.
    bob.add_lane_delegate(&l.session_id, "bob", "carol")
        .await
        .unwrap();

    assert_code(
        bob.assign(&l.session_id, "whatever", "bob", false).await,
        ErrorCode::Forbidden,
    );
}
