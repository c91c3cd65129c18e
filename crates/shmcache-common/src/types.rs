//! Core type definitions for shmcache
//!
//! This module defines the blob naming scheme shared with the coordinator,
//! lease modes, and miss-lookup results.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Escape character used by the blob-name encoding. Buckets and keys may
/// not contain it, which keeps the encoding injective.
pub const NAME_ESCAPE: char = '~';

/// Prefix for not-yet-published temporary files under the storage root
pub const TEMP_PREFIX: &str = "~~tmp~";

/// Canonical name of a cached blob, derived from `(bucket, key, consistency)`.
///
/// The encoding is `("~" if consistency) + bucket + "~" + key` with every
/// `/` in the key replaced by `~`. Client and coordinator compute it
/// identically, so both sides agree on blob identity.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobName(String);

impl BlobName {
    /// Encode a blob name from bucket, key, and the consistency flag.
    ///
    /// Rejects buckets and keys containing the escape character `~`, and
    /// empty buckets or keys.
    pub fn new(bucket: &str, key: &str, consistency: bool) -> Result<Self> {
        if bucket.is_empty() {
            return Err(Error::invalid_argument("bucket must not be empty"));
        }
        if key.is_empty() {
            return Err(Error::invalid_argument("key must not be empty"));
        }
        if bucket.contains(NAME_ESCAPE) {
            return Err(Error::invalid_argument(format!(
                "bucket {bucket:?} contains reserved character '~'"
            )));
        }
        if key.contains(NAME_ESCAPE) {
            return Err(Error::invalid_argument(format!(
                "key {key:?} contains reserved character '~'"
            )));
        }
        let prefix = if consistency { "~" } else { "" };
        Ok(Self(format!(
            "{prefix}{bucket}~{}",
            key.replace('/', "~")
        )))
    }

    /// Wrap an already-encoded name (e.g. received from the coordinator)
    #[must_use]
    pub fn from_encoded(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Decode back into `(bucket, key, consistency)`.
    ///
    /// Round-trips any name produced by [`BlobName::new`], including keys
    /// that contained `/`.
    pub fn decode(&self) -> Result<(String, String, bool)> {
        let consistency = self.0.starts_with(NAME_ESCAPE);
        let body = if consistency { &self.0[1..] } else { &self.0[..] };
        let (bucket, key) = body
            .split_once(NAME_ESCAPE)
            .ok_or_else(|| Error::invalid_argument(format!("malformed blob name {:?}", self.0)))?;
        if bucket.is_empty() || key.is_empty() {
            return Err(Error::invalid_argument(format!(
                "malformed blob name {:?}",
                self.0
            )));
        }
        Ok((bucket.to_string(), key.replace(NAME_ESCAPE, "/"), consistency))
    }

    /// True if this name participates in lease-based consistency
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.0.starts_with(NAME_ESCAPE)
    }

    /// Get the encoded name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of a temporary artifact for this blob, tagged with a
    /// disambiguator (writer sequence + random, or a replay version).
    #[must_use]
    pub fn temp_name(&self, disambiguator: &str) -> String {
        format!("{TEMP_PREFIX}{}{NAME_ESCAPE}{disambiguator}", self.0)
    }
}

impl fmt::Display for BlobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for BlobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobName({})", self.0)
    }
}

/// Lease mode requested from the coordinator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    /// Wire representation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    /// Parse the wire representation
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            other => Err(Error::invalid_argument(format!("unknown lock mode {other:?}"))),
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the freshest copy of a blob lives, per the coordinator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    /// No copy is cached anywhere; fall back to the backing store or an
    /// empty stream
    Absent,
    /// The local published file is current
    UseLocal,
    /// One or more peer nodes hold the freshest copy
    Peers(Vec<String>),
}

impl Location {
    /// Parse the coordinator's `;`-separated location field
    #[must_use]
    pub fn parse(field: &str) -> Self {
        let addrs: Vec<&str> = field.split(';').filter(|a| !a.is_empty()).collect();
        match addrs.first() {
            None => Self::Absent,
            Some(first) if first.contains("use_local") => Self::UseLocal,
            Some(_) => Self::Peers(addrs.iter().map(|a| (*a).to_string()).collect()),
        }
    }

    /// First peer address, if any
    #[must_use]
    pub fn primary_peer(&self) -> Option<&str> {
        match self {
            Self::Peers(addrs) => addrs.first().map(String::as_str),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_name_encoding() {
        let name = BlobName::new("bucket1", "a/b", false).unwrap();
        assert_eq!(name.as_str(), "bucket1~a~b");

        let consistent = BlobName::new("bucket1", "a/b", true).unwrap();
        assert_eq!(consistent.as_str(), "~bucket1~a~b");
        assert!(consistent.is_consistent());
        assert!(!name.is_consistent());
    }

    #[test]
    fn test_blob_name_round_trip() {
        for (bucket, key) in [
            ("bucket1", "a/b"),
            ("b", "deeply/nested/path/file.txt"),
            ("data", "plain"),
        ] {
            for consistency in [false, true] {
                let name = BlobName::new(bucket, key, consistency).unwrap();
                let (b, k, c) = name.decode().unwrap();
                assert_eq!((b.as_str(), k.as_str(), c), (bucket, key, consistency));
            }
        }
    }

    #[test]
    fn test_blob_name_injective() {
        // Distinct (bucket, key) pairs over a key space without '~' must
        // encode to distinct names.
        let inputs = [
            ("b", "a/c"),
            ("b", "a/c/d"),
            ("b", "ac"),
            ("ba", "c"),
            ("b", "a"),
        ];
        let mut seen = std::collections::HashSet::new();
        for (bucket, key) in inputs {
            let name = BlobName::new(bucket, key, false).unwrap();
            assert!(seen.insert(name.as_str().to_string()), "collision on {bucket}/{key}");
        }
    }

    #[test]
    fn test_blob_name_rejects_escape() {
        assert!(BlobName::new("buc~ket", "k", false).is_err());
        assert!(BlobName::new("bucket", "k~ey", false).is_err());
        assert!(BlobName::new("", "key", false).is_err());
        assert!(BlobName::new("bucket", "", false).is_err());
    }

    #[test]
    fn test_temp_name() {
        let name = BlobName::new("bucket1", "a/b", false).unwrap();
        assert_eq!(name.temp_name("7-42"), "~~tmp~bucket1~a~b~7-42");
    }

    #[test]
    fn test_location_parse() {
        assert_eq!(Location::parse(""), Location::Absent);
        assert_eq!(Location::parse("use_local"), Location::UseLocal);
        assert_eq!(
            Location::parse("10.0.0.1:1988;10.0.0.2:1988;"),
            Location::Peers(vec!["10.0.0.1:1988".into(), "10.0.0.2:1988".into()])
        );
        assert_eq!(
            Location::parse("10.0.0.1:1988").primary_peer(),
            Some("10.0.0.1:1988")
        );
    }

    #[test]
    fn test_lock_mode_wire() {
        assert_eq!(LockMode::Read.as_str(), "read");
        assert_eq!(LockMode::parse("write").unwrap(), LockMode::Write);
        assert!(LockMode::parse("rw").is_err());
    }
}
