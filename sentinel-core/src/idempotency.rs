//! Idempotency record types.
//!
//! State machine per key:
//!
//! ```text
//! NoRecord ── begin() ──→ Processing ──┬── complete() ──→ Completed
//!    ↑                                 └── fail() ──────→ Failed
//!    └──────────────── TTL expiry ─────────────────────────┘
//! ```
//!
//! The fingerprint is fixed at creation. A `Completed` record never changes
//! again; it only disappears when its TTL runs out.

use crate::{expiry_after, EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// SHA-256 digest (hex) identifying "the same logical request".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash method + path + optional query + body.
    ///
    /// Each field is length-prefixed, so bytes can never migrate from one
    /// field into its neighbour and still hash the same. A missing query
    /// hashes like an empty one.
    pub fn from_request(method: &str, path: &str, query: Option<&str>, body: &[u8]) -> Self {
        let method = method.to_ascii_uppercase();
        let mut hasher = Sha256::new();
        let fields: [&[u8]; 4] = [
            method.as_bytes(),
            path.as_bytes(),
            query.unwrap_or("").as_bytes(),
            body,
        ];
        for field in fields {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already computed digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Processing => "processing",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, IdempotencyStatus::Processing)
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a repeat request finds a `Failed` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailedPolicy {
    /// Replay the stored failure on every repeat
    ReplayFailure,
    /// Allow exactly one fresh attempt, then replay whatever that produced
    RetryOnce,
}

/// A response captured for verbatim replay.
///
/// Bodies and header values are opaque bytes, stored hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status_code: u16,
    #[serde(with = "hex_bytes")]
    pub body: Vec<u8>,
    /// Header pairs in their original order
    pub headers: Vec<StoredHeader>,
}

/// One response header; the value is kept byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    pub name: String,
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status_code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            body: body.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(StoredHeader {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// First value stored for `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_slice())
    }
}

mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(D::Error::custom)
    }
}

/// The record persisted per idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub http_method: Option<String>,
    pub path: Option<String>,
    pub fingerprint: Fingerprint,
    pub status: IdempotencyStatus,
    pub response: Option<StoredResponse>,
    /// Error description when `Failed`
    pub error: Option<String>,
    /// Set at creation; only the holder of a matching token may finish it
    pub generation: EntityId,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub client_id: Option<String>,
    /// Under `FailedPolicy::RetryOnce`, whether the one fresh attempt is still available
    pub retry_allowed: bool,
}

impl IdempotencyRecord {
    /// A new `Processing` record owned by a fresh generation.
    pub fn processing(key: &str, fingerprint: Fingerprint, ttl: Duration, now: Timestamp) -> Self {
        Self {
            key: key.to_string(),
            http_method: None,
            path: None,
            fingerprint,
            status: IdempotencyStatus::Processing,
            response: None,
            error: None,
            generation: Uuid::now_v7(),
            created_at: now,
            expires_at: expiry_after(now, ttl),
            client_id: None,
            retry_allowed: true,
        }
    }

    pub fn with_request(mut self, method: &str, path: &str) -> Self {
        self.http_method = Some(method.to_string());
        self.path = Some(path.to_string());
        self
    }

    pub fn with_client(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Remaining TTL, used when rewriting the record in place.
    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    /// Token proving ownership of this generation.
    pub fn token(&self) -> IdempotencyToken {
        IdempotencyToken {
            key: self.key.clone(),
            generation: self.generation,
        }
    }
}

/// Handed to the single winner of `begin`; required to complete or fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyToken {
    pub key: String,
    pub generation: EntityId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_fingerprint_deterministic() {
        let a = Fingerprint::from_request("POST", "/orders", None, br#"{"qty":1}"#);
        let b = Fingerprint::from_request("post", "/orders", None, br#"{"qty":1}"#);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_different_for_different_inputs() {
        let body = br#"{"qty":1}"#;
        let base = Fingerprint::from_request("POST", "/orders", None, body);

        assert_ne!(base, Fingerprint::from_request("PUT", "/orders", None, body));
        assert_ne!(base, Fingerprint::from_request("POST", "/carts", None, body));
        assert_ne!(base, Fingerprint::from_request("POST", "/orders", Some("a=1"), body));
        assert_ne!(base, Fingerprint::from_request("POST", "/orders", None, br#"{"qty":2}"#));
    }

    #[test]
    fn test_fingerprint_fields_do_not_bleed() {
        assert_ne!(
            Fingerprint::from_request("POST", "/a|", None, b"x"),
            Fingerprint::from_request("POST", "/a", None, b"|x")
        );
        assert_ne!(
            Fingerprint::from_request("POST", "/a", Some("q"), b""),
            Fingerprint::from_request("POST", "/a", None, b"q")
        );
        assert_eq!(
            Fingerprint::from_request("POST", "/a", None, b""),
            Fingerprint::from_request("POST", "/a", Some(""), b"")
        );
    }

    #[test]
    fn test_stored_response_keeps_raw_bytes_compactly() -> Result<(), serde_json::Error> {
        let response = StoredResponse::new(201, vec![0u8, 0xff, b'{'])
            .with_header("content-type", "application/json")
            .with_header("x-raw", vec![0x80u8, b'a']);

        let json = serde_json::to_value(&response)?;
        assert_eq!(json["body"], "00ff7b");
        assert_eq!(json["headers"][1]["value"], "8061");

        let decoded: StoredResponse = serde_json::from_value(json)?;
        assert_eq!(decoded, response);
        assert_eq!(decoded.header("X-Raw"), Some(&[0x80u8, b'a'][..]));
        assert_eq!(decoded.header("missing"), None);
        Ok(())
    }

    #[test]
    fn test_processing_record_defaults() {
        let now = Utc::now();
        let fp = Fingerprint::from_hex("abc");
        let record = IdempotencyRecord::processing("k", fp.clone(), Duration::from_secs(60), now);

        assert_eq!(record.status, IdempotencyStatus::Processing);
        assert_eq!(record.fingerprint, fp);
        assert_eq!(record.expires_at, now + chrono::Duration::seconds(60));
        assert!(record.retry_allowed);
        assert_eq!(record.token().generation, record.generation);
    }

    #[test]
    fn test_status_terminal() {
        assert!(!IdempotencyStatus::Processing.is_terminal());
        assert!(IdempotencyStatus::Completed.is_terminal());
        assert!(IdempotencyStatus::Failed.is_terminal());
    }
}
