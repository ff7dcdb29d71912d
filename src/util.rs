//! Key, URL and identity helpers shared across modules.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::types::{AgoraError, Result};

/// URL scheme of every database and record URL.
pub const DB_URL_SCHEME: &str = "agora://";

static LAST_TICK: AtomicU64 = AtomicU64::new(0);

/// Time-ordered table key.
///
/// Unix milliseconds shifted left by 16 bits plus a counter, rendered as 15
/// lowercase hex digits. Keys are strictly increasing within a process, so
/// lexicographic order equals creation order.
pub fn time_key() -> String {
    let now = (Utc::now().timestamp_millis().max(0) as u64) << 16;
    let mut prev = LAST_TICK.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_TICK.compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return format!("{:015x}", next),
            Err(actual) => prev = actual,
        }
    }
}

/// Current time, RFC 3339 in UTC.
pub fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Deterministic 32-hex-digit key derived from arbitrary input.
pub fn hash_key(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..16])
}

/// Fresh random database key (32 bytes, hex).
pub fn random_db_key() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Database URL for a key.
pub fn db_url_for_key(key: &str) -> String {
    format!("{DB_URL_SCHEME}{key}/")
}

/// Split `name@domain`.
pub fn split_user_id(user_id: &str) -> Result<(&str, &str)> {
    match user_id.split_once('@') {
        Some((name, domain)) if !name.is_empty() && !domain.is_empty() => Ok((name, domain)),
        _ => Err(AgoraError::Validation(format!(
            "Invalid user id (expected name@domain): {user_id}"
        ))),
    }
}

/// Domain half of a user id.
pub fn domain_of(user_id: &str) -> Result<&str> {
    split_user_id(user_id).map(|(_, domain)| domain)
}

/// Usernames are 1-32 chars of `[a-z0-9_-]`.
pub fn validate_username(username: &str) -> Result<()> {
    let valid = !username.is_empty()
        && username.len() <= 32
        && username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AgoraError::Validation(format!("Invalid username: {username:?}")))
    }
}

/// A parsed record URL: `agora://<db key>/<table>/<key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUrl {
    pub db_url: String,
    pub table: String,
    pub key: String,
}

impl RecordUrl {
    pub fn new(db_url: &str, table: &str, key: &str) -> Self {
        Self {
            db_url: db_url.to_string(),
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    pub fn parse(url: &str) -> Result<Self> {
        let invalid = || AgoraError::Validation(format!("Invalid record URL: {url}"));
        let rest = url.strip_prefix(DB_URL_SCHEME).ok_or_else(invalid)?;
        let (db_key, path) = rest.split_once('/').ok_or_else(invalid)?;
        let (table, key) = path.split_once('/').ok_or_else(invalid)?;
        if db_key.is_empty() || table.is_empty() || key.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(&db_url_for_key(db_key), table, key))
    }
}

impl std::fmt::Display for RecordUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}/{}", self.db_url, self.table, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_keys_strictly_increase() {
        let keys: Vec<String> = (0..500).map(|_| time_key()).collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
            assert_eq!(pair[0].len(), pair[1].len());
        }
    }

    #[test]
    fn test_record_url_parse() {
        let url = "agora://abcd/posts/00018f";
        let parsed = RecordUrl::parse(url).unwrap();
        assert_eq!(parsed.db_url, "agora://abcd/");
        assert_eq!(parsed.table, "posts");
        assert_eq!(parsed.key, "00018f");
        assert_eq!(parsed.to_string(), url);
    }

    #[test]
    fn test_record_url_rejects_db_url() {
        assert!(RecordUrl::parse("agora://abcd/").is_err());
        assert!(RecordUrl::parse("https://abcd/posts/1").is_err());
    }

    #[test]
    fn test_user_id_helpers() {
        assert_eq!(split_user_id("bob@b.example").unwrap(), ("bob", "b.example"));
        assert_eq!(domain_of("bob@b.example").unwrap(), "b.example");
        assert!(split_user_id("bob").is_err());
        assert!(split_user_id("@b.example").is_err());
    }

    #[test]
    fn test_hash_key_is_stable() {
        assert_eq!(hash_key("x"), hash_key("x"));
        assert_ne!(hash_key("x"), hash_key("y"));
        assert_eq!(hash_key("x").len(), 32);
    }

    #[test]
    fn test_validate_username() {
        assert!(validate_username("alice_01").is_ok());
        assert!(validate_username("Alice").is_err());
        assert!(validate_username("").is_err());
    }
}
