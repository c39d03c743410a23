//! Fsck reporting sink.
//!
//! Every inconsistency the LRU checkers detect goes through
//! [`FsckSink::report`], which decides whether the caller may correct it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Category of an LRU inconsistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsckErrKind {
    /// An allocation record implies an index entry that does not exist.
    AllocKeyToMissingLruEntry,
    /// An index entry disagrees with its allocation record.
    LruEntryBad,
    /// An index entry names a bucket on a device that does not exist.
    LruEntryToInvalidBucket,
    /// A stored key fails structural validation.
    LruKeyInvalid,
}

impl FsckErrKind {
    /// Whether a checker may act on a `Fix` verdict for this kind.
    #[must_use]
    pub fn is_fixable(self) -> bool {
        !matches!(self, Self::LruKeyInvalid)
    }
}

impl fmt::Display for FsckErrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocKeyToMissingLruEntry => write!(f, "alloc_key_to_missing_lru_entry"),
            Self::LruEntryBad => write!(f, "lru_entry_bad"),
            Self::LruEntryToInvalidBucket => write!(f, "lru_entry_to_invalid_bucket"),
            Self::LruKeyInvalid => write!(f, "lru_key_invalid"),
        }
    }
}

/// Answer of the sink to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsckVerdict {
    Fix,
    Ignore,
}

impl FsckVerdict {
    #[must_use]
    pub fn should_fix(self) -> bool {
        self == Self::Fix
    }
}

/// Destination for fsck reports.
pub trait FsckSink: Send + Sync {
    fn report(&self, kind: FsckErrKind, msg: &str) -> FsckVerdict;
}

/// Whether a pass may repair what it finds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixPolicy {
    /// Report only (`fsck -n`).
    #[default]
    ReadOnly,
    /// Report and repair (`fsck -y`).
    Repair,
}

/// One report received by a [`PolicySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsckRecord {
    pub kind: FsckErrKind,
    pub msg: String,
    pub verdict: FsckVerdict,
}

/// Sink answering every report from a fixed [`FixPolicy`] and keeping a log.
#[derive(Debug, Default)]
pub struct PolicySink {
    policy: FixPolicy,
    records: Mutex<Vec<FsckRecord>>,
}

impl PolicySink {
    #[must_use]
    pub fn new(policy: FixPolicy) -> Self {
        Self {
            policy,
            records: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn policy(&self) -> FixPolicy {
        self.policy
    }

    #[must_use]
    pub fn records(&self) -> Vec<FsckRecord> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn count(&self, kind: FsckErrKind) -> usize {
        self.records.lock().iter().filter(|r| r.kind == kind).count()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl FsckSink for PolicySink {
    fn report(&self, kind: FsckErrKind, msg: &str) -> FsckVerdict {
        let verdict = match self.policy {
            FixPolicy::Repair if kind.is_fixable() => FsckVerdict::Fix,
            _ => FsckVerdict::Ignore,
        };
        warn!(
            target: "lru::fsck",
            event = "fsck_report",
            kind = %kind,
            fixing = verdict.should_fix(),
            "{msg}"
        );
        self.records.lock().push(FsckRecord {
            kind,
            msg: msg.to_owned(),
            verdict,
        });
        verdict
    }
}
