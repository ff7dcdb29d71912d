//! Issue tracker
//!
//! Background failures (an indexer that cannot apply an entry, an external
//! database that cannot be loaded) are recorded here instead of crashing the
//! node. Issues are deduplicated by id; repeated reports bump a counter. An
//! issue may carry a recovery action that an operator can trigger through the
//! HTTP surface.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::types::{AgoraError, Result};

/// Recovery action attached to an issue.
pub type RecoverFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A reported problem.
#[derive(Clone)]
pub struct Issue {
    pub id: String,
    pub description: String,
    pub cause: String,
    pub error: String,
    recover: Option<RecoverFn>,
}

impl Issue {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        cause: impl Into<String>,
        error: impl ToString,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            cause: cause.into(),
            error: error.to_string(),
            recover: None,
        }
    }

    /// Attach a recovery action.
    pub fn with_recover<F, Fut>(mut self, recover: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.recover = Some(Arc::new(move || -> BoxFuture<'static, Result<()>> {
            Box::pin(recover())
        }));
        self
    }

    pub fn can_recover(&self) -> bool {
        self.recover.is_some()
    }
}

impl std::fmt::Debug for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Issue")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("cause", &self.cause)
            .field("error", &self.error)
            .field("can_recover", &self.can_recover())
            .finish()
    }
}

struct TrackedIssue {
    issue: Issue,
    occurrences: u32,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Serializable view of a tracked issue.
#[derive(Debug, Clone, Serialize)]
pub struct IssueSummary {
    pub id: String,
    pub description: String,
    pub cause: String,
    pub error: String,
    pub can_recover: bool,
    pub occurrences: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl From<&TrackedIssue> for IssueSummary {
    fn from(tracked: &TrackedIssue) -> Self {
        Self {
            id: tracked.issue.id.clone(),
            description: tracked.issue.description.clone(),
            cause: tracked.issue.cause.clone(),
            error: tracked.issue.error.clone(),
            can_recover: tracked.issue.can_recover(),
            occurrences: tracked.occurrences,
            first_seen: tracked.first_seen,
            last_seen: tracked.last_seen,
        }
    }
}

#[derive(Default)]
pub struct IssueTracker {
    issues: DashMap<String, TrackedIssue>,
    ignored: DashSet<String>,
}

impl IssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an issue. Returns true if it was not already tracked.
    pub fn add(&self, issue: Issue) -> bool {
        if self.ignored.contains(&issue.id) {
            debug!(issue_id = %issue.id, "Ignoring dismissed issue");
            return false;
        }

        let now = Utc::now();
        match self.issues.entry(issue.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let tracked = occupied.get_mut();
                tracked.occurrences += 1;
                tracked.last_seen = now;
                tracked.issue = issue;
                false
            }
            Entry::Vacant(vacant) => {
                warn!(
                    issue_id = %issue.id,
                    cause = %issue.cause,
                    error = %issue.error,
                    "{}",
                    issue.description
                );
                vacant.insert(TrackedIssue {
                    issue,
                    occurrences: 1,
                    first_seen: now,
                    last_seen: now,
                });
                true
            }
        }
    }

    /// Drop an issue whose condition went away on its own.
    pub fn clear(&self, id: &str) -> bool {
        self.issues.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<IssueSummary> {
        self.issues.get(id).map(|t| IssueSummary::from(&*t))
    }

    /// All tracked issues, oldest first.
    pub fn list(&self) -> Vec<IssueSummary> {
        let mut all: Vec<IssueSummary> = self
            .issues
            .iter()
            .map(|t| IssueSummary::from(&*t))
            .collect();
        all.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Run the issue's recovery action. The issue is removed on success and
    /// keeps the new error on failure.
    pub async fn recover(&self, id: &str) -> Result<()> {
        let recover = {
            let tracked = self
                .issues
                .get(id)
                .ok_or_else(|| AgoraError::NotFound(format!("Issue {id}")))?;
            tracked
                .issue
                .recover
                .clone()
                .ok_or_else(|| AgoraError::Validation(format!("Issue {id} cannot be recovered")))?
        };

        match recover().await {
            Ok(()) => {
                self.issues.remove(id);
                info!(issue_id = %id, "Issue recovered");
                Ok(())
            }
            Err(e) => {
                if let Some(mut tracked) = self.issues.get_mut(id) {
                    tracked.issue.error = e.to_string();
                    tracked.last_seen = Utc::now();
                }
                warn!(issue_id = %id, error = %e, "Issue recovery failed");
                Err(e)
            }
        }
    }

    /// Remove an issue, optionally ignoring future reports with the same id.
    pub fn dismiss(&self, id: &str, ignore_future: bool) -> Result<()> {
        let removed = self.issues.remove(id).is_some();
        if ignore_future {
            self.ignored.insert(id.to_string());
        }
        if removed || ignore_future {
            info!(issue_id = %id, ignore_future, "Issue dismissed");
            Ok(())
        } else {
            Err(AgoraError::NotFound(format!("Issue {id}")))
        }
    }
}
