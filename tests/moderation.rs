//! Community moderation integration tests
//!
//! Tests administration through method calls:
//! - Bans block joins, across nodes too
//! - Removing members, with and without a ban
//! - Roles grant permissions to non-admins
//! - Items are created by managers and move between members

mod common;

use agora::db::schemas::{permissions, Ban, Item, Member, Membership, Profile, PROFILE_KEY};
use agora::social;
use agora::AgoraError;
use tokio_test::{assert_err, assert_ok};

use common::{citizen, single_node, two_nodes};

#[tokio::test(start_paused = true)]
async fn test_ban_blocks_join() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    citizen(&node, "eve").await;
    let club = node
        .create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();

    social::put_ban(&node, "alice@a.example", "club@a.example", "eve@a.example", Some("spam"))
        .await
        .unwrap();
    let ban = club.table::<Ban>().get("eve@a.example").await.unwrap().unwrap();
    assert_eq!(ban.reason.as_deref(), Some("spam"));

    let err = social::join_community(&node, "eve@a.example", "club@a.example", None)
        .await
        .unwrap_err();
    match err {
        AgoraError::Permissions(message) => assert!(message.contains("spam")),
        other => panic!("unexpected {other:?}"),
    }
    let eve = node.citizen("eve@a.example").unwrap();
    assert!(eve
        .public
        .table::<Membership>()
        .get("club@a.example")
        .await
        .unwrap()
        .is_none());

    social::delete_ban(&node, "alice@a.example", "club@a.example", "eve@a.example")
        .await
        .unwrap();
    social::join_community(&node, "eve@a.example", "club@a.example", None)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_ban_blocks_remote_join() {
    let (_federation, a, b) = two_nodes().await;
    citizen(&a, "alice").await;
    citizen(&b, "eve").await;
    a.create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();

    social::put_ban(&a, "alice@a.example", "club@a.example", "eve@b.example", None)
        .await
        .unwrap();
    let err = social::join_community(&b, "eve@b.example", "club@a.example", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AgoraError::Permissions(_)), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn test_remove_member_with_ban() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    citizen(&node, "bob").await;
    let club = node
        .create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();
    social::join_community(&node, "bob@a.example", "club@a.example", None)
        .await
        .unwrap();

    social::remove_member(&node, "alice@a.example", "club@a.example", "bob@a.example", true, Some("rude"))
        .await
        .unwrap();
    assert!(club.table::<Member>().get("bob@a.example").await.unwrap().is_none());
    assert!(club.table::<Ban>().get("bob@a.example").await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_members_cannot_moderate_without_role() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    citizen(&node, "bob").await;
    citizen(&node, "carl").await;
    let club = node
        .create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();
    for user in ["bob@a.example", "carl@a.example"] {
        social::join_community(&node, user, "club@a.example", None)
            .await
            .unwrap();
    }

    let err = social::remove_member(&node, "carl@a.example", "club@a.example", "bob@a.example", false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AgoraError::Permissions(_)), "got {err:?}");

    social::put_role(
        &node,
        "alice@a.example",
        "club@a.example",
        "moderator",
        &[permissions::REMOVE_MEMBER],
    )
    .await
    .unwrap();
    social::set_member_roles(
        &node,
        "alice@a.example",
        "club@a.example",
        "carl@a.example",
        &["moderator".to_string()],
    )
    .await
    .unwrap();

    social::remove_member(&node, "carl@a.example", "club@a.example", "bob@a.example", false, None)
        .await
        .unwrap();
    assert!(club.table::<Member>().get("bob@a.example").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_update_community_profile_needs_permission() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    citizen(&node, "bob").await;
    let club = node
        .create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();
    social::join_community(&node, "bob@a.example", "club@a.example", None)
        .await
        .unwrap();

    let profile = Profile {
        display_name: "The Better Club".into(),
        description: Some("Now with snacks".into()),
    };
    assert!(social::update_community_profile(&node, "bob@a.example", "club@a.example", &profile)
        .await
        .is_err());
    social::update_community_profile(&node, "alice@a.example", "club@a.example", &profile)
        .await
        .unwrap();

    let stored = club.table::<Profile>().get(PROFILE_KEY).await.unwrap().unwrap();
    assert_eq!(stored.display_name, "The Better Club");
}

#[tokio::test(start_paused = true)]
async fn test_items_move_between_members() {
    let (_federation, node) = single_node().await;
    citizen(&node, "alice").await;
    citizen(&node, "bob").await;
    citizen(&node, "stranger").await;
    let club = node
        .create_community("alice@a.example", "club", "The Club")
        .await
        .unwrap();
    social::join_community(&node, "bob@a.example", "club@a.example", None)
        .await
        .unwrap();

    assert_err!(social::create_item(&node, "bob@a.example", "club@a.example", "gold", 5, None).await);
    let created = assert_ok!(
        social::create_item(&node, "alice@a.example", "club@a.example", "gold", 5, None).await
    );
    let key = created["key"].as_str().unwrap().to_string();

    // Partial transfer splits the item
    let moved = assert_ok!(
        social::transfer_item(&node, "alice@a.example", "club@a.example", &key, Some(2), "bob@a.example").await
    );
    let split_key = moved["key"].as_str().unwrap();
    assert_ne!(split_key, key);
    let items = club.table::<Item>();
    assert_eq!(items.get(&key).await.unwrap().unwrap().qty, 3);
    let split = items.get(split_key).await.unwrap().unwrap();
    assert_eq!((split.owner.user_id.as_str(), split.qty), ("bob@a.example", 2));

    // Only members can receive, and only owners can give
    assert_err!(
        social::transfer_item(&node, "alice@a.example", "club@a.example", &key, None, "stranger@a.example").await
    );
    assert_err!(
        social::transfer_item(&node, "bob@a.example", "club@a.example", &key, None, "alice@a.example").await
    );
}
