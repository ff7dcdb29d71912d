//! Indexing integration tests
//!
//! Tests the server tallies and citizen notifications built from user logs:
//! - Vote, reaction, thread and follower tallies follow edits and deletions
//! - Notifications for the owner of the subject, never for self-actions
//! - Concurrent writers never lose a tally update
//! - Concurrent triggers on one source apply every entry once
//! - Index positions resume instead of replaying
//! - Replaying a source from scratch leaves indexes unchanged

mod common;

use std::sync::Arc;

use futures::future::join_all;

use agora::db::schemas::{
    FollowIndex, IndexState, Notification, NotificationKind, ReactionTally, SubjectRef, ThreadIndex,
    Vote, VoteTally,
};
use agora::db::Database;
use agora::index::notifications;
use agora::index::tallies::{tally_key, COMMENTS_ID, FOLLOWS_ID, REACTIONS_ID, VOTES_ID};
use agora::social;
use agora::store::ListOpts;
use agora::Node;

use common::{citizen, single_node};

/// Every index row a replay could disturb.
#[derive(Debug, PartialEq)]
struct IndexSnapshot {
    votes: Vec<(String, VoteTally)>,
    reactions: Vec<(String, ReactionTally)>,
    threads: Vec<(String, ThreadIndex)>,
    follows: Vec<(String, FollowIndex)>,
    notifications: Vec<(String, Notification)>,
}

async fn snapshot(node: &Node, private: &Database) -> IndexSnapshot {
    let server = node.server_public();
    let all = ListOpts::new();
    IndexSnapshot {
        votes: server.table::<VoteTally>().list(&all).await.unwrap(),
        reactions: server.table::<ReactionTally>().list(&all).await.unwrap(),
        threads: server.table::<ThreadIndex>().list(&all).await.unwrap(),
        follows: server.table::<FollowIndex>().list(&all).await.unwrap(),
        notifications: private.table::<Notification>().list(&all).await.unwrap(),
    }
}

async fn vote_tally(node: &Node, subject_url: &str) -> Option<VoteTally> {
    node.server_public()
        .table::<VoteTally>()
        .get(&tally_key(subject_url))
        .await
        .unwrap()
}

// =============================================================================
// Server tallies
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_vote_tally_follows_edits() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    citizen(&node, "bob").await;
    citizen(&node, "carol").await;
    let post = social::create_post(&node, "alice@a.example", "hello", None).await.unwrap();

    social::put_vote(&node, "bob@a.example", &post.url, 1).await.unwrap();
    social::put_vote(&node, "carol@a.example", &post.url, -1).await.unwrap();
    let votes = vote_tally(&node, &post.url).await.unwrap();
    assert_eq!(votes.subject_url, post.url);
    assert_eq!((votes.upvotes.len(), votes.downvotes.len()), (1, 1));

    // Changing a vote moves it instead of counting it twice
    social::put_vote(&node, "bob@a.example", &post.url, -1).await.unwrap();
    let votes = vote_tally(&node, &post.url).await.unwrap();
    assert_eq!((votes.upvotes.len(), votes.downvotes.len()), (0, 2));

    assert!(social::del_vote(&node, "carol@a.example", &post.url).await.unwrap());
    assert!(social::del_vote(&node, "bob@a.example", &post.url).await.unwrap());
    assert!(vote_tally(&node, &post.url).await.is_none());
    assert!(!social::del_vote(&node, "bob@a.example", &post.url).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_reaction_tally() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    citizen(&node, "bob").await;
    citizen(&node, "carol").await;
    let post = social::create_post(&node, "alice@a.example", "hello", None).await.unwrap();

    social::put_reaction(&node, "bob@a.example", &post.url, "like").await.unwrap();
    social::put_reaction(&node, "carol@a.example", &post.url, "like").await.unwrap();
    social::put_reaction(&node, "bob@a.example", &post.url, "fire").await.unwrap();

    let tally = node
        .server_public()
        .table::<ReactionTally>()
        .get(&tally_key(&post.url))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tally.reactions["like"].len(), 2);
    assert_eq!(tally.reactions["fire"].len(), 1);

    social::del_reaction(&node, "bob@a.example", &post.url, "fire").await.unwrap();
    let tally = node
        .server_public()
        .table::<ReactionTally>()
        .get(&tally_key(&post.url))
        .await
        .unwrap()
        .unwrap();
    assert!(!tally.reactions.contains_key("fire"));
}

#[tokio::test(start_paused = true)]
async fn test_thread_index_counts_nested_replies() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    citizen(&node, "bob").await;
    citizen(&node, "carol").await;
    let post = social::create_post(&node, "alice@a.example", "hello", None).await.unwrap();

    let reply = social::create_comment(&node, "bob@a.example", "hi", &post.url, None, None)
        .await
        .unwrap();
    let nested = social::create_comment(
        &node,
        "carol@a.example",
        "hi bob",
        &post.url,
        Some(&reply.url),
        None,
    )
    .await
    .unwrap();

    let thread = node
        .server_public()
        .table::<ThreadIndex>()
        .get(&tally_key(&post.url))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(thread.reply_count(), 2);
    assert_eq!(thread.replies[&reply.url], post.url);
    assert_eq!(thread.replies[&nested.url], reply.url);
}

#[tokio::test(start_paused = true)]
async fn test_follow_index() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    citizen(&node, "bob").await;
    citizen(&node, "carol").await;

    social::follow(&node, "bob@a.example", "alice@a.example").await.unwrap();
    social::follow(&node, "carol@a.example", "alice@a.example").await.unwrap();
    let followers = node
        .server_public()
        .table::<FollowIndex>()
        .get(&tally_key("alice@a.example"))
        .await
        .unwrap()
        .unwrap();
    assert!(followers.followers.contains("bob@a.example"));
    assert_eq!(followers.followers.len(), 2);

    social::unfollow(&node, "bob@a.example", "alice@a.example").await.unwrap();
    let followers = node
        .server_public()
        .table::<FollowIndex>()
        .get(&tally_key("alice@a.example"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(followers.followers.len(), 1);
}

// =============================================================================
// Notifications
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_notifications_for_replies_and_votes() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    citizen(&node, "bob").await;
    social::follow(&node, "alice@a.example", "bob@a.example").await.unwrap();

    let post = social::create_post(&node, "alice@a.example", "hello", None).await.unwrap();
    social::create_comment(&node, "bob@a.example", "hi", &post.url, None, None)
        .await
        .unwrap();
    social::put_vote(&node, "bob@a.example", &post.url, 1).await.unwrap();
    // Own actions never notify
    social::put_vote(&node, "alice@a.example", &post.url, 1).await.unwrap();

    let notifications = social::list_notifications(&node, "alice@a.example", 10)
        .await
        .unwrap();
    let kinds: Vec<NotificationKind> = notifications.iter().map(|n| n.kind).collect();
    assert_eq!(notifications.len(), 2);
    assert!(kinds.contains(&NotificationKind::Comment));
    assert!(kinds.contains(&NotificationKind::Vote));
    assert!(notifications.iter().all(|n| n.author == "bob@a.example"));
    assert!(notifications
        .iter()
        .all(|n| n.subject_url.as_deref() == Some(post.url.as_str())));

    // Retracting the vote retracts its notification
    social::del_vote(&node, "bob@a.example", &post.url).await.unwrap();
    let notifications = social::list_notifications(&node, "alice@a.example", 10)
        .await
        .unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::Comment);
}

#[tokio::test(start_paused = true)]
async fn test_follow_notification() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    citizen(&node, "bob").await;
    social::follow(&node, "alice@a.example", "bob@a.example").await.unwrap();
    social::follow(&node, "bob@a.example", "alice@a.example").await.unwrap();

    let notifications = social::list_notifications(&node, "alice@a.example", 10)
        .await
        .unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::Follow);
}

// =============================================================================
// Concurrency and positions
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_votes_are_all_counted() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    let voters: Vec<String> = (0..8).map(|i| format!("voter{i}")).collect();
    for voter in &voters {
        citizen(&node, voter).await;
    }
    let post = social::create_post(&node, "alice@a.example", "hello", None).await.unwrap();

    let results = join_all(voters.iter().map(|voter| {
        let node = &node;
        let url = post.url.clone();
        let user_id = format!("{voter}@a.example");
        async move { social::put_vote(node, &user_id, &url, 1).await }
    }))
    .await;
    assert!(results.iter().all(|r| r.is_ok()));

    let votes = node
        .server_public()
        .table::<VoteTally>()
        .get(&tally_key(&post.url))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(votes.upvotes.len(), voters.len());
}

#[tokio::test(start_paused = true)]
async fn test_positions_advance_per_source() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    let bob = citizen(&node, "bob").await;
    let post = social::create_post(&node, "alice@a.example", "hello", None).await.unwrap();
    social::put_vote(&node, "bob@a.example", &post.url, 1).await.unwrap();

    let state = node
        .engine()
        .index_state(node.server_public(), VOTES_ID, bob.public.url())
        .await
        .unwrap()
        .unwrap();
    let seq = state.last_indexed_seq;
    assert!(seq > 0);

    // Nothing new: catching up again leaves the position and tally alone
    node.engine()
        .catch_up(node.server_public(), Some(vec![bob.public.url().to_string()]))
        .await
        .unwrap();
    let again = node
        .engine()
        .index_state(node.server_public(), VOTES_ID, bob.public.url())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.last_indexed_seq, seq);
    assert!(node
        .engine()
        .lowest_start(node.server_public(), bob.public.url())
        .await
        .unwrap()
        <= seq);
}

#[tokio::test(start_paused = true)]
async fn test_replay_from_scratch_is_idempotent() {
    let (_federation, node) = single_node().await;
    let alice = citizen(&node, "alice").await;
    let bob = citizen(&node, "bob").await;
    let carol = citizen(&node, "carol").await;
    social::follow(&node, "alice@a.example", "bob@a.example").await.unwrap();
    social::follow(&node, "bob@a.example", "alice@a.example").await.unwrap();

    let post = social::create_post(&node, "alice@a.example", "hello", None).await.unwrap();
    let reply = social::create_comment(&node, "bob@a.example", "hi", &post.url, None, None)
        .await
        .unwrap();
    social::create_comment(&node, "carol@a.example", "hey", &post.url, Some(&reply.url), None)
        .await
        .unwrap();
    social::put_vote(&node, "bob@a.example", &post.url, 1).await.unwrap();
    social::put_vote(&node, "bob@a.example", &post.url, -1).await.unwrap();
    social::put_vote(&node, "carol@a.example", &post.url, 1).await.unwrap();
    social::put_reaction(&node, "bob@a.example", &post.url, "like").await.unwrap();
    social::put_reaction(&node, "bob@a.example", &post.url, "fire").await.unwrap();
    social::del_reaction(&node, "bob@a.example", &post.url, "fire").await.unwrap();

    let before = snapshot(&node, &alice.private).await;
    assert_eq!(before.votes.len(), 1);
    assert_eq!(before.threads.len(), 1);
    assert!(!before.notifications.is_empty());

    // Forget every position and replay all sources from the start
    let sources = [&alice, &bob, &carol];
    let server_states = node.server_public().table::<IndexState>();
    for indexer in [VOTES_ID, REACTIONS_ID, COMMENTS_ID, FOLLOWS_ID] {
        for source in sources {
            server_states
                .del(&IndexState::key_for(indexer, source.public.url()))
                .await
                .unwrap();
        }
    }
    let private_states = alice.private.table::<IndexState>();
    for source in sources {
        private_states
            .del(&IndexState::key_for(notifications::ID, source.public.url()))
            .await
            .unwrap();
    }
    node.engine().catch_up(node.server_public(), None).await.unwrap();
    node.engine().catch_up(&alice.private, None).await.unwrap();

    assert_eq!(snapshot(&node, &alice.private).await, before);
    let state = node
        .engine()
        .index_state(node.server_public(), VOTES_ID, bob.public.url())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        state.last_indexed_seq,
        bob.public.store().current_seq().await.unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_on_one_source() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    let bob = citizen(&node, "bob").await;

    let mut posts = Vec::new();
    for i in 0..12 {
        let post = social::create_post(&node, "alice@a.example", &format!("post {i}"), None)
            .await
            .unwrap();
        posts.push(post.url);
    }

    // Written straight to the log so no trigger has seen them yet
    let votes = bob.public.table::<Vote>();
    for url in &posts {
        votes
            .put(
                &Vote::key_for(url),
                &Vote {
                    subject: SubjectRef::new(url.as_str()).unwrap(),
                    vote: 1,
                    created_at: "2026-01-01T00:00:00Z".into(),
                },
            )
            .await
            .unwrap();
    }

    let triggers: Vec<_> = (0..16)
        .map(|_| {
            let engine = Arc::clone(node.engine());
            let source = bob.public.url().to_string();
            tokio::spawn(async move { engine.on_change(&source, None).await })
        })
        .collect();
    for trigger in triggers {
        trigger.await.unwrap();
    }

    for url in &posts {
        let tally = vote_tally(&node, url).await.unwrap();
        assert_eq!(tally.upvotes.len(), 1, "{url}");
        assert!(tally.downvotes.is_empty());
    }
    let state = node
        .engine()
        .index_state(node.server_public(), VOTES_ID, bob.public.url())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        state.last_indexed_seq,
        bob.public.store().current_seq().await.unwrap()
    );
}
