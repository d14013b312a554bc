//! Column codecs: JSON payloads, millisecond timestamps, ids, content
//! hashes and secret obfuscation.

use crate::error::{DbError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::str::FromStr;

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Next `updated_at` for a row last written at `previous`. Strictly
/// increases so conditional updates never match a stale snapshot.
pub(crate) fn next_version(previous: DateTime<Utc>) -> i64 {
    now_millis().max(to_millis(previous) + 1)
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

/// Parses a persisted id column, treating failure as corrupt data.
pub(crate) fn parse_col<T>(column: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| DbError::invalid_data(format!("column {}: {}", column, e)))
}

pub(crate) fn parse_opt_col<T>(column: &str, raw: Option<&str>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.filter(|s| !s.is_empty())
        .map(|s| parse_col(column, s))
        .transpose()
}

/// Decodes an integer enum tag column.
pub(crate) fn tag_col<T>(column: &str, tag: i64, from_tag: fn(i32) -> Option<T>) -> Result<T> {
    i32::try_from(tag)
        .ok()
        .and_then(from_tag)
        .ok_or_else(|| DbError::invalid_data(format!("column {}: unknown tag {}", column, tag)))
}

/// Lowercase hex SHA-256 of sheet content.
pub fn sha256_hex(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn keystream(key: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 32);
    let mut counter: u64 = 0;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(counter.to_le_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

/// Obfuscates a data-source secret under the workspace key.
pub fn obfuscate(key: &[u8], plaintext: &str) -> String {
    let stream = keystream(key, plaintext.len());
    let bytes: Vec<u8> = plaintext
        .as_bytes()
        .iter()
        .zip(stream)
        .map(|(b, k)| b ^ k)
        .collect();
    STANDARD.encode(bytes)
}

pub fn deobfuscate(key: &[u8], encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| DbError::invalid_data(format!("secret: {}", e)))?;
    let stream = keystream(key, bytes.len());
    let plain: Vec<u8> = bytes.iter().zip(stream).map(|(b, k)| b ^ k).collect();
    String::from_utf8(plain).map_err(|e| DbError::invalid_data(format!("secret: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_is_lowercase_64() {
        let digest = sha256_hex("SELECT 1;");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(digest, sha256_hex("SELECT 1;"));
    }

    #[test]
    fn test_obfuscation_hides_and_restores() {
        let key = b"workspace-key";
        let hidden = obfuscate(key, "s3cret-password");
        assert!(!hidden.contains("s3cret"));
        assert_eq!(deobfuscate(key, &hidden).unwrap(), "s3cret-password");
        assert_ne!(deobfuscate(b"other", &hidden).ok().as_deref(), Some("s3cret-password"));
    }

    #[test]
    fn test_next_version_strictly_increases() {
        let future = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(next_version(future), to_millis(future) + 1);
        let past = Utc::now() - chrono::Duration::seconds(60);
        assert!(next_version(past) > to_millis(past) + 1);
    }

    #[test]
    fn test_tag_col_rejects_unknown() {
        use changeflow_protocol::IssueStatus;
        assert_eq!(
            tag_col("status", 1, IssueStatus::from_tag).unwrap(),
            IssueStatus::Open
        );
        assert!(tag_col("status", 99, IssueStatus::from_tag).is_err());
    }
}
