//! CGS KV - consensus-ordered log and versioned key/value stores.
//!
//! Every mutation of the governance ledger is a single atomic append to a
//! replicated, totally-ordered log. The version of a key is the (epoch, seqno)
//! pair of its last write; comparing seqnos alone is unsafe because seqno
//! numbering restarts after a leadership change.

#![deny(unsafe_code)]

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors surfaced by the log and the versioned stores.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KvError {
    #[error(
        "The specified item already exists. If the intent was to update the existing item then \
         retry the request after reading the latest version of the resource and setting the \
         version on the request."
    )]
    AlreadyExists,

    #[error(
        "The operation specified a version that is different from the version available at the \
         server, that is, an optimistic concurrency error. Retry the request after reading the \
         latest version of the resource and updating the version on the request."
    )]
    PreconditionFailed,

    #[error("A version must not be supplied when creating a new item.")]
    VersionSuppliedForNewItem,

    #[error("View for given sequence number not known to the node at this time.")]
    ViewNotKnown,

    #[error("'{0}' is not a valid version string.")]
    InvalidVersion(String),
}

/// Position of the last write to a key: the log seqno plus the epoch that was
/// in effect at that seqno.
///
/// Rendered as `"<epoch>.<seqno>"` on the wire. Opaque to callers beyond
/// equality, but internally totally ordered (epoch first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub epoch: u64,
    pub seqno: u64,
}

impl Version {
    pub fn new(epoch: u64, seqno: u64) -> Self {
        Self { epoch, seqno }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.epoch, self.seqno)
    }
}

impl FromStr for Version {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KvError::InvalidVersion(s.to_string());
        let (epoch, seqno) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            epoch: epoch.parse().map_err(|_| invalid())?,
            seqno: seqno.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Commit status of a transaction id as observed by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum TxStatus {
    /// The write is durably ordered at this position.
    Committed,
    /// The seqno is beyond the log tip; the write may still land.
    Pending,
    /// A later epoch reused the seqno; the write was lost to a rollback.
    Invalid,
    /// The node no longer retains view history for this seqno.
    Unknown,
}

/// The replicated, totally-ordered log that serializes all ledger mutations.
///
/// This in-process model keeps the properties the ledger core depends on:
/// one seqno per request-level write, an epoch that advances on leadership
/// change, and seqno reuse across epochs after a rollback.
#[derive(Debug)]
pub struct ConsensusLog {
    epoch: u64,
    next_seqno: u64,
    /// Epoch in effect for each retained seqno; index 0 is `first_retained`.
    views: Vec<u64>,
    first_retained: u64,
}

impl ConsensusLog {
    pub fn new() -> Self {
        Self {
            epoch: 2,
            next_seqno: 1,
            views: Vec::new(),
            first_retained: 1,
        }
    }

    /// Assign the next seqno under the current epoch. One append per
    /// request-level write; all stores touched by that write share it.
    pub fn append(&mut self) -> u64 {
        let seqno = self.next_seqno;
        self.next_seqno += 1;
        self.views.push(self.epoch);
        seqno
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    /// Highest seqno this node has ordered.
    pub fn last_committed(&self) -> u64 {
        self.next_seqno - 1
    }

    /// The epoch that was in effect at `seqno`, or `None` if the history has
    /// been compacted away or the seqno was never appended.
    pub fn epoch_for(&self, seqno: u64) -> Option<u64> {
        if seqno < self.first_retained || seqno >= self.next_seqno {
            return None;
        }
        let idx = (seqno - self.first_retained) as usize;
        self.views.get(idx).copied()
    }

    /// Full version for a previously appended seqno.
    pub fn version_at(&self, seqno: u64) -> Result<Version, KvError> {
        let epoch = self.epoch_for(seqno).ok_or(KvError::ViewNotKnown)?;
        Ok(Version { epoch, seqno })
    }

    /// Leadership change without data loss: later writes carry a new epoch.
    pub fn advance_epoch(&mut self) {
        self.epoch += 1;
    }

    /// Crash-and-re-elect simulation: discard every write after `seqno` and
    /// bump the epoch, so discarded seqnos are reused under the new epoch.
    pub fn rollback_to(&mut self, seqno: u64) {
        let retain = seqno.saturating_sub(self.first_retained - 1) as usize;
        self.views.truncate(retain);
        self.next_seqno = seqno + 1;
        self.epoch += 1;
        tracing::debug!(seqno, epoch = self.epoch, "log rolled back");
    }

    /// Drop view history for seqnos below `seqno`. Reads of older versions
    /// surface `ViewNotKnown` until the caller retries against a node that
    /// still has the history.
    pub fn compact_views_before(&mut self, seqno: u64) {
        if seqno <= self.first_retained {
            return;
        }
        let drop = (seqno - self.first_retained).min(self.views.len() as u64);
        self.views.drain(..drop as usize);
        self.first_retained += drop;
    }

    /// Commit status for a transaction id, used by the status-polling surface.
    pub fn status_of(&self, version: Version) -> TxStatus {
        if version.seqno > self.last_committed() {
            return TxStatus::Pending;
        }
        match self.epoch_for(version.seqno) {
            Some(epoch) if epoch == version.epoch => TxStatus::Committed,
            Some(_) => TxStatus::Invalid,
            None => TxStatus::Unknown,
        }
    }
}

impl Default for ConsensusLog {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    seqno: u64,
}

/// A string-keyed store whose writes are ordered by the shared consensus log.
///
/// The store records the seqno of each key's last write; the full
/// `(epoch, seqno)` version is recovered through the log so that a stale
/// version from a superseded epoch can never pass the precondition check.
#[derive(Debug)]
pub struct TypedStore<T> {
    name: &'static str,
    entries: HashMap<String, Entry<T>>,
}

impl<T> TypedStore<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: HashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn seqno_of_previous_write(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|e| e.seqno)
    }

    /// Version of the last write to `key`, or `Ok(None)` for an absent key.
    pub fn version_of(&self, key: &str, log: &ConsensusLog) -> Result<Option<Version>, KvError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(entry) => log.version_at(entry.seqno).map(Some),
        }
    }

    /// Record a write at an already-appended seqno. Used when several stores
    /// are mutated inside one request-level log entry.
    pub fn set(&mut self, key: impl Into<String>, value: T, seqno: u64) {
        self.entries.insert(key.into(), Entry { value, seqno });
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        self.entries.remove(key).map(|e| e.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), &e.value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Optimistic-concurrency write.
    ///
    /// - key absent: `expected` must be absent, else `VersionSuppliedForNewItem`;
    /// - key present: `expected` must equal the stored `(epoch, seqno)` pair,
    ///   else `AlreadyExists` (absent) or `PreconditionFailed` (mismatch).
    ///
    /// On success the write consumes its own log append and the new version
    /// is returned.
    pub fn put_versioned(
        &mut self,
        key: impl Into<String>,
        value: T,
        expected: Option<Version>,
        log: &mut ConsensusLog,
    ) -> Result<Version, KvError> {
        let key = key.into();
        match self.entries.get(&key) {
            None => {
                if expected.is_some() {
                    return Err(KvError::VersionSuppliedForNewItem);
                }
            }
            Some(entry) => {
                let current = log.version_at(entry.seqno)?;
                match expected {
                    None => return Err(KvError::AlreadyExists),
                    Some(v) if v != current => return Err(KvError::PreconditionFailed),
                    Some(_) => {}
                }
            }
        }

        let seqno = log.append();
        let version = Version {
            epoch: log.current_epoch(),
            seqno,
        };
        tracing::trace!(store = self.name, key = %key, %version, "versioned write");
        self.entries.insert(key, Entry { value, seqno });
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store() -> (TypedStore<serde_json::Value>, ConsensusLog) {
        (TypedStore::new("test"), ConsensusLog::new())
    }

    #[test]
    fn version_string_roundtrip() {
        let v = Version::new(2, 17);
        assert_eq!(v.to_string(), "2.17");
        assert_eq!("2.17".parse::<Version>().unwrap(), v);
        assert_eq!(
            "banana".parse::<Version>(),
            Err(KvError::InvalidVersion("banana".to_string()))
        );
        assert_eq!(
            "2.x".parse::<Version>(),
            Err(KvError::InvalidVersion("2.x".to_string()))
        );
    }

    #[test]
    fn create_then_update_requires_exact_version() {
        let (mut store, mut log) = store();

        let v1 = store
            .put_versioned("k1", serde_json::json!({"a": 1}), None, &mut log)
            .unwrap();

        // Second blind create conflicts.
        assert_eq!(
            store.put_versioned("k1", serde_json::json!({}), None, &mut log),
            Err(KvError::AlreadyExists)
        );

        // Stale version is rejected.
        let stale = Version::new(v1.epoch, v1.seqno + 10);
        assert_eq!(
            store.put_versioned("k1", serde_json::json!({}), Some(stale), &mut log),
            Err(KvError::PreconditionFailed)
        );

        // Exact version succeeds and produces a fresh version.
        let v2 = store
            .put_versioned("k1", serde_json::json!({"a": 2}), Some(v1), &mut log)
            .unwrap();
        assert!(v2 > v1);
        assert_eq!(store.get("k1"), Some(&serde_json::json!({"a": 2})));
    }

    #[test]
    fn version_on_new_item_is_rejected() {
        let (mut store, mut log) = store();
        assert_eq!(
            store.put_versioned(
                "fresh",
                serde_json::json!(1),
                Some(Version::new(2, 1)),
                &mut log
            ),
            Err(KvError::VersionSuppliedForNewItem)
        );
    }

    #[test]
    fn epoch_rollback_reusing_a_seqno_fails_stale_writes() {
        let (mut store, mut log) = store();

        let v1 = store
            .put_versioned("k", serde_json::json!("first"), None, &mut log)
            .unwrap();
        let v2 = store
            .put_versioned("k", serde_json::json!("second"), Some(v1), &mut log)
            .unwrap();

        // The primary crashes; the log rolls back past the second write and a
        // new leader reuses the same seqno for an unrelated write to the key.
        log.rollback_to(v2.seqno - 1);
        let seqno = log.append();
        assert_eq!(seqno, v2.seqno);
        store.set("k", serde_json::json!("rewritten"), seqno);

        // A client holding v2 sees the same seqno but a superseded epoch; the
        // index alone would have matched.
        let current = store.version_of("k", &log).unwrap().unwrap();
        assert_eq!(current.seqno, v2.seqno);
        assert_ne!(current.epoch, v2.epoch);
        assert_eq!(
            store.put_versioned("k", serde_json::json!("stale"), Some(v2), &mut log),
            Err(KvError::PreconditionFailed)
        );

        // The holder of the post-rollback version can still write.
        store
            .put_versioned("k", serde_json::json!("fresh"), Some(current), &mut log)
            .unwrap();
    }

    #[test]
    fn compacted_view_history_surfaces_view_not_known() {
        let (mut store, mut log) = store();
        let v1 = store
            .put_versioned("old", serde_json::json!(1), None, &mut log)
            .unwrap();
        for _ in 0..5 {
            log.append();
        }

        log.compact_views_before(v1.seqno + 1);
        assert_eq!(store.version_of("old", &log), Err(KvError::ViewNotKnown));
        assert_eq!(
            store.put_versioned("old", serde_json::json!(2), Some(v1), &mut log),
            Err(KvError::ViewNotKnown)
        );
    }

    #[test]
    fn transaction_status_reflects_rollbacks() {
        let mut log = ConsensusLog::new();
        let s1 = log.append();
        let committed = Version::new(log.current_epoch(), s1);
        assert_eq!(log.status_of(committed), TxStatus::Committed);

        let ahead = Version::new(log.current_epoch(), s1 + 5);
        assert_eq!(log.status_of(ahead), TxStatus::Pending);

        let s2 = log.append();
        let lost = Version::new(log.current_epoch(), s2);
        log.rollback_to(s1);
        log.append();
        assert_eq!(log.status_of(lost), TxStatus::Invalid);

        log.compact_views_before(s2);
        assert_eq!(log.status_of(committed), TxStatus::Unknown);
    }

    #[derive(Debug, Clone)]
    enum WriteOp {
        /// Write with the current stored version (or none for a fresh key).
        Correct,
        /// Write with no version.
        Blind,
        /// Write with a fabricated stale version.
        Stale,
    }

    fn op_strategy() -> impl Strategy<Value = Vec<WriteOp>> {
        proptest::collection::vec(
            prop_oneof![
                Just(WriteOp::Correct),
                Just(WriteOp::Blind),
                Just(WriteOp::Stale),
            ],
            1..24,
        )
    }

    proptest! {
        /// A write succeeds iff its supplied version equals the current stored
        /// version, or is absent when no value exists yet.
        #[test]
        fn property_write_succeeds_iff_version_matches(ops in op_strategy()) {
            let (mut store, mut log) = store();
            let mut current: Option<Version> = None;

            for (i, op) in ops.into_iter().enumerate() {
                let value = serde_json::json!(i);
                match op {
                    WriteOp::Correct => {
                        let v = store
                            .put_versioned("k", value, current, &mut log)
                            .expect("matching version must succeed");
                        current = Some(v);
                    }
                    WriteOp::Blind => {
                        let result = store.put_versioned("k", value, None, &mut log);
                        match current {
                            None => current = Some(result.expect("fresh blind write")),
                            Some(_) => prop_assert_eq!(result, Err(KvError::AlreadyExists)),
                        }
                    }
                    WriteOp::Stale => {
                        let stale = Version::new(99, 10_000 + i as u64);
                        let result = store.put_versioned("k", value, Some(stale), &mut log);
                        match current {
                            None => prop_assert_eq!(
                                result,
                                Err(KvError::VersionSuppliedForNewItem)
                            ),
                            Some(_) => prop_assert_eq!(result, Err(KvError::PreconditionFailed)),
                        }
                    }
                }
            }
        }
    }
}
