#![forbid(unsafe_code)]
//! Error types for the bucket LRU index.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Key structure | `KeyError` | `lru-types` | Encoding range violations and sentinel keys found on read |
//! | Runtime | `LruError` | `lru-error` (this crate) | Everything returned by the mutator, the checkers and the host |
//!
//! `lru-error` does not depend on `lru-types`. The `KeyError` → `LruError`
//! conversion lives in `lru-host`, which depends on both.
//!
//! Consistency problems (missing, wrong or dangling index entries) are *not*
//! errors: they are reported through the fsck sink and recorded as findings.
//! Only structural key violations and failures propagated from the host
//! (transaction conflicts, I/O, resource exhaustion) surface as `LruError`.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `InvalidKey` | `EINVAL` |
//! | `TransactionConflict` | `EAGAIN` |
//! | `RestartsExhausted` | `EBUSY` |
//! | `DeviceNotFound` | `ENODEV` |
//! | `NoSpace` | `ENOSPC` |

use thiserror::Error;

/// Unified error type for LRU index operations.
#[derive(Debug, Error)]
pub enum LruError {
    /// Operating system I/O error (wraps `std::io::Error`). Raised by hosts
    /// backed by real storage; the in-memory host never does I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Host-side metadata is inconsistent in a way this layer cannot report
    /// as an fsck finding.
    #[error("corrupt metadata: {0}")]
    Corruption(String),

    /// A key violates the structural rules of the index (e.g. a persisted
    /// key with the time=0 sentinel). Never auto-fixed.
    #[error("invalid lru key: {0}")]
    InvalidKey(String),

    /// Optimistic-concurrency conflict. The whole transaction must be
    /// restarted by the driver loop.
    #[error("transaction {txn} conflicts on {slot}: snapshot={snapshot}, observed={observed}")]
    TransactionConflict {
        txn: u64,
        slot: String,
        snapshot: u64,
        observed: u64,
    },

    /// The driver loop gave up after too many conflicts.
    #[error("transaction restarted {attempts} times without committing")]
    RestartsExhausted { attempts: usize },

    /// A bucket was addressed on a device that is not present.
    #[error("device {0} not present")]
    DeviceNotFound(u16),

    /// A bounded host resource (write buffer, transaction staging) is full.
    #[error("no space left in {0}")]
    NoSpace(String),
}

impl LruError {
    /// Whether the error asks the driver loop to retry the transaction.
    #[must_use]
    pub fn is_restart(&self) -> bool {
        matches!(self, Self::TransactionConflict { .. })
    }

    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption(_) => libc::EIO,
            Self::InvalidKey(_) => libc::EINVAL,
            Self::TransactionConflict { .. } => libc::EAGAIN,
            Self::RestartsExhausted { .. } => libc::EBUSY,
            Self::DeviceNotFound(_) => libc::ENODEV,
            Self::NoSpace(_) => libc::ENOSPC,
        }
    }
}

/// Result alias using `LruError`.
pub type Result<T> = std::result::Result<T, LruError>;
