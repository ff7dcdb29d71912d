//! Method protocol integration tests
//!
//! Tests calls between databases, locally and across nodes:
//! - Local round trip through the method-dispatch indexer
//! - Remote round trip through remote-handle and shadow copies
//! - Results stay pending until delivered, then are durable
//! - Leaving a remote community drops the shadow copies on both sides
//! - Timeouts when nobody answers
//! - Replays never execute a call twice
//! - Origin checks on remote-handle

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use agora::db::schemas::{IndexState, Member, MethodResult, ResultCode, UserRef};
use agora::db::Record;
use agora::methods::{GetResultOpts, RemoteHandleRequest};
use agora::social;
use agora::store::ListOpts;
use agora::AgoraError;

use common::{citizen, single_node, two_nodes, A, B};

// =============================================================================
// Local calls
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_local_join_round_trip() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    citizen(&node, "bob").await;
    let club = node
        .create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();

    let membership = social::join_community(&node, "bob@a.example", "club@a.example", None)
        .await
        .unwrap();
    assert_eq!(membership.community.db_url, club.url());

    let member = club.table::<Member>().get("bob@a.example").await.unwrap().unwrap();
    assert!(member.roles.is_empty());

    let results = club.table::<MethodResult>().list(&ListOpts::new()).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1.code, ResultCode::Success);
}

#[tokio::test(start_paused = true)]
async fn test_local_call_resolves_within_one_poll() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    let bob = citizen(&node, "bob").await;
    node.create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();
    let poll_interval = node.protocol().config().poll_interval;

    let started = Instant::now();
    let handle = node
        .protocol()
        .call(&bob.public, "club@a.example", "community-join", json!({}))
        .await
        .unwrap();
    // Local targets are indexed before `call` returns
    let immediate = node
        .protocol()
        .get_result(&bob.public, "club@a.example", &handle.call_url, GetResultOpts::no_wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(immediate.code, ResultCode::Success);

    let waited = node
        .protocol()
        .get_result(&bob.public, "club@a.example", &handle.call_url, GetResultOpts::wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(waited, immediate);
    assert!(started.elapsed() < poll_interval);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_method_is_reported() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    citizen(&node, "bob").await;
    node.create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();

    let err = social::invoke(&node, "bob@a.example", "club@a.example", "community-fly", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AgoraError::NotFound(_)), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let (_federation, node) = single_node().await;
    let alice = citizen(&node, "alice").await;
    citizen(&node, "bob").await;

    // Citizen databases run no method-dispatch indexer
    let handle = node
        .protocol()
        .call(&alice.public, "bob@a.example", "community-join", json!({}))
        .await
        .unwrap();

    let started = Instant::now();
    let result = node
        .protocol()
        .get_result(
            &alice.public,
            "bob@a.example",
            &handle.call_url,
            GetResultOpts::wait().timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(started.elapsed() >= Duration::from_secs(2));

    let no_wait = node
        .protocol()
        .get_result(&alice.public, "bob@a.example", &handle.call_url, GetResultOpts::no_wait())
        .await
        .unwrap();
    assert!(no_wait.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_replayed_call_runs_once() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    let bob = citizen(&node, "bob").await;
    let club = node
        .create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();
    social::join_community(&node, "bob@a.example", "club@a.example", None)
        .await
        .unwrap();

    // Forget how far the dispatcher got and replay bob's log
    club.table::<IndexState>()
        .del(&IndexState::key_for("method-dispatch", bob.public.url()))
        .await
        .unwrap();
    node.engine()
        .catch_up(&club, Some(vec![bob.public.url().to_string()]))
        .await
        .unwrap();

    let results = club.table::<MethodResult>().list(&ListOpts::new()).await.unwrap();
    assert_eq!(results.len(), 1);
    let members = club.table::<Member>().list(&ListOpts::new()).await.unwrap();
    assert_eq!(members.len(), 2);
}

// =============================================================================
// Remote calls
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_remote_join_round_trip() {
    let (_federation, a, b) = two_nodes().await;
    citizen(&a, "alice").await;
    let carol = citizen(&b, "carol").await;
    let club = a
        .create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();

    social::join_community(&b, "carol@b.example", "club@a.example", None)
        .await
        .unwrap();

    // The community admitted carol on its own node
    let member = club.table::<Member>().get("carol@b.example").await.unwrap().unwrap();
    assert_eq!(member.user.db_url, carol.public.url());

    // Each side now holds a shadow copy of the other
    let shadow_club = b.registry().public_db("club@a.example").unwrap();
    assert!(!shadow_club.writable());
    let shadow_carol = a.registry().public_db("carol@b.example").unwrap();
    assert!(!shadow_carol.writable());
}

#[tokio::test(start_paused = true)]
async fn test_remote_handle_checks_origin() {
    let (_federation, a, b) = two_nodes().await;
    citizen(&a, "alice").await;
    let carol = citizen(&b, "carol").await;
    let club = a
        .create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();

    let handle = b
        .protocol()
        .call(&carol.public, "club@a.example", "community-join", json!({}))
        .await
        .unwrap();
    let request = RemoteHandleRequest {
        target: UserRef {
            user_id: "club@a.example".into(),
            db_url: club.url().to_string(),
        },
        caller: carol.user_ref(),
        call_url: handle.call_url.clone(),
    };

    let err = a.handle_remote(&request, "https://evil.example").await.unwrap_err();
    assert!(matches!(err, AgoraError::Configuration(_)), "got {err:?}");

    a.handle_remote(&request, &format!("https://{B}")).await.unwrap();
    let result = club.table::<MethodResult>().get(&handle.call_url).await.unwrap().unwrap();
    assert_eq!(result.code, ResultCode::Success);
}

#[tokio::test(start_paused = true)]
async fn test_remote_handle_rejects_foreign_targets() {
    let (_federation, a, b) = two_nodes().await;
    let alice = citizen(&a, "alice").await;
    let carol = citizen(&b, "carol").await;

    let request = RemoteHandleRequest {
        target: alice.user_ref(),
        caller: carol.user_ref(),
        call_url: format!("{}method-calls/1", carol.public.url()),
    };
    // alice is hosted on a, not b
    let err = b.handle_remote(&request, A).await.unwrap_err();
    assert!(matches!(err, AgoraError::Configuration(_) | AgoraError::NotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn test_remote_result_pending_until_delivered() {
    let (federation, a, b) = two_nodes().await;
    citizen(&a, "alice").await;
    let carol = citizen(&b, "carol").await;
    let club = a
        .create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();

    federation.hold_deliveries(A, true);
    let handle = b
        .protocol()
        .call(&carol.public, "club@a.example", "community-join", json!({}))
        .await
        .unwrap();
    // Let the first notification fail
    tokio::time::sleep(Duration::from_millis(10)).await;

    let pending = b
        .protocol()
        .get_result(&carol.public, "club@a.example", &handle.call_url, GetResultOpts::no_wait())
        .await
        .unwrap();
    assert!(pending.is_none());
    assert!(club.table::<MethodResult>().get(&handle.call_url).await.unwrap().is_none());

    // The poll loop re-sends the notification once deliveries resume
    federation.hold_deliveries(A, false);
    let result = b
        .protocol()
        .get_result(
            &carol.public,
            "club@a.example",
            &handle.call_url,
            GetResultOpts::wait().timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.code, ResultCode::Success);
    assert!(club.table::<Member>().get("carol@b.example").await.unwrap().is_some());

    // Durable: later lookups need no delivery at all
    federation.hold_deliveries(A, true);
    let again = b
        .protocol()
        .get_result(&carol.public, "club@a.example", &handle.call_url, GetResultOpts::no_wait())
        .await
        .unwrap();
    assert_eq!(again, Some(result));
}

#[tokio::test(start_paused = true)]
async fn test_leaving_remote_community_unloads_shadows() {
    let (_federation, a, b) = two_nodes().await;
    citizen(&a, "alice").await;
    let carol = citizen(&b, "carol").await;
    let club = a
        .create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();

    social::join_community(&b, "carol@b.example", "club@a.example", None)
        .await
        .unwrap();
    assert!(b.registry().is_loaded(club.url()));
    assert!(a.registry().is_loaded(carol.public.url()));

    assert!(social::leave_community(&b, "carol@b.example", "club@a.example", None)
        .await
        .unwrap());
    // Let re-sent notifications settle
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(club.table::<Member>().get("carol@b.example").await.unwrap().is_none());
    assert!(!b.registry().is_loaded(club.url()));
    assert!(!a.registry().is_loaded(carol.public.url()));
}
