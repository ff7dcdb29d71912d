//! Social operations
//!
//! What a citizen does: follow people, join communities, post, comment, vote
//! and react. Writes go to the citizen's own public database and are indexed
//! right away; anything that needs another database's consent goes through
//! the method protocol and waits for its result.

pub mod content;
pub mod relationships;

pub use content::{
    create_comment, create_post, del_reaction, del_vote, list_notifications, put_reaction,
    put_vote, update_profile, CreatedRecord,
};
pub use relationships::{
    create_item, delete_ban, follow, join_community, leave_community, put_ban, put_role,
    remove_member, set_member_roles, transfer_item, unfollow, update_community_profile,
};

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::db::schemas::{MethodResult, ResultCode};
use crate::node::Node;
use crate::types::{AgoraError, Result};

/// Turn a recorded result into the caller's view of it.
pub fn into_details(result: MethodResult) -> Result<Value> {
    if result.code.is_success() {
        return Ok(result.details);
    }
    let message = result
        .details
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("no details")
        .to_string();
    Err(match result.code {
        ResultCode::ValidationFailed => AgoraError::Validation(message),
        ResultCode::PermissionDenied => AgoraError::Permissions(message),
        ResultCode::NotFound | ResultCode::MethodNotFound => AgoraError::NotFound(message),
        ResultCode::Success | ResultCode::Error => AgoraError::Internal(message),
    })
}

/// Call `method` on `target_id` from a local citizen and wait for the result.
pub async fn invoke(
    node: &Node,
    caller_id: &str,
    target_id: &str,
    method: &str,
    args: Value,
    timeout: Option<Duration>,
) -> Result<Value> {
    let citizen = node.citizen(caller_id)?;
    let result = node
        .protocol()
        .call_and_wait(&citizen.public, target_id, method, args, timeout)
        .await?;
    debug!(
        caller = %caller_id,
        target = %target_id,
        method,
        code = ?result.code,
        "Method result received"
    );
    into_details(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::SubjectRef;
    use serde_json::json;

    fn result(code: ResultCode, details: Value) -> MethodResult {
        MethodResult {
            call: SubjectRef::new("agora://aa/method-calls/1").unwrap(),
            code,
            details,
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_into_details() {
        let ok = into_details(result(ResultCode::Success, json!({"left": true}))).unwrap();
        assert_eq!(ok["left"], true);

        let denied = into_details(result(
            ResultCode::PermissionDenied,
            json!({"message": "bob is banned"}),
        ));
        match denied {
            Err(AgoraError::Permissions(message)) => assert_eq!(message, "bob is banned"),
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            into_details(result(ResultCode::MethodNotFound, json!({}))),
            Err(AgoraError::NotFound(_))
        ));
        assert!(matches!(
            into_details(result(ResultCode::Error, json!(null))),
            Err(AgoraError::Internal(_))
        ));
    }
}
