//! Subscriptions
//!
//! A subscription is never stored: it is derived from the relationship tables
//! of the indexing database (or of its owner's public database) every time it
//! is needed.
//!
//! | Indexing database | Subscribes to |
//! |---|---|
//! | private citizen | followed users, joined communities, the owner's public db |
//! | public server | every user in the `users` table |
//! | public community | every member |

pub mod resolver;

pub use resolver::{ReconcileReport, SubscriptionResolver};

use std::collections::BTreeMap;

use crate::db::schemas::{Follow, Member, Membership, ServerUser};
use crate::db::{Database, DatabaseRegistry, SubscriptionKind};
use crate::store::ListOpts;
use crate::types::{AgoraError, Result};

/// One subscribed source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub user_id: String,
    pub db_url: String,
}

/// Sources `db` indexes, deduplicated by database url and sorted.
pub async fn compute_subscriptions(
    registry: &DatabaseRegistry,
    db: &Database,
) -> Result<Vec<Subscription>> {
    let mut by_url: BTreeMap<String, String> = BTreeMap::new();

    match db.subscription() {
        None => {}
        Some(SubscriptionKind::CitizenIndex) => {
            let owner = db.user_id().ok_or_else(|| {
                AgoraError::Internal(format!("Citizen index {} has no owner", db.url()))
            })?;
            let public = registry.public_db(owner).ok_or_else(|| {
                AgoraError::NotFound(format!("Public database of {owner} is not loaded"))
            })?;

            by_url.insert(public.url().to_string(), owner.to_string());
            for (_, follow) in public.table::<Follow>().list(&ListOpts::new()).await? {
                by_url.insert(follow.subject.db_url, follow.subject.user_id);
            }
            for (_, membership) in public.table::<Membership>().list(&ListOpts::new()).await? {
                by_url.insert(membership.community.db_url, membership.community.user_id);
            }
        }
        Some(SubscriptionKind::ServerIndex) => {
            for (_, user) in db.table::<ServerUser>().list(&ListOpts::new()).await? {
                by_url.insert(user.db_url, user.user_id);
            }
        }
        Some(SubscriptionKind::CommunityMembers) => {
            for (_, member) in db.table::<Member>().list(&ListOpts::new()).await? {
                by_url.insert(member.user.db_url, member.user.user_id);
            }
        }
    }

    Ok(by_url
        .into_iter()
        .map(|(db_url, user_id)| Subscription { user_id, db_url })
        .collect())
}

/// Database urls `db` indexes.
pub async fn compute_subscribed_urls(registry: &DatabaseRegistry, db: &Database) -> Result<Vec<String>> {
    Ok(compute_subscriptions(registry, db)
        .await?
        .into_iter()
        .map(|s| s.db_url)
        .collect())
}
