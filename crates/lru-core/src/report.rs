//! Findings produced by the LRU consistency passes.

use lru_codec::lru_pos_to_text;
use lru_host::FsckErrKind;
use lru_types::KeyPos;
use serde::Serialize;
use std::fmt;

/// One inconsistency, as reported to the fsck sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LruFinding {
    pub kind: FsckErrKind,
    /// Index position the finding is about.
    pub pos: KeyPos,
    pub detail: String,
    /// Whether a repair was queued.
    pub fixed: bool,
}

impl fmt::Display for LruFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.fixed { "fixed" } else { "unfixed" };
        write!(
            f,
            "[{}] {} ({status})",
            self.kind,
            lru_pos_to_text(self.pos)
        )
    }
}

/// Outcome of one checker pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LruCheckReport {
    /// Keys (or allocation records) visited.
    pub keys_scanned: u64,
    pub findings: Vec<LruFinding>,
    /// Targeted write-buffer flushes the pass forced.
    pub buffer_flushes: u64,
}

impl LruCheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Number of findings for which a repair was queued.
    #[must_use]
    pub fn fixes(&self) -> usize {
        self.findings.iter().filter(|f| f.fixed).count()
    }

    #[must_use]
    pub fn count(&self, kind: FsckErrKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }
}

impl fmt::Display for LruCheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "scanned {} keys, {} findings ({} fixed), {} buffer flushes",
            self.keys_scanned,
            self.findings.len(),
            self.fixes(),
            self.buffer_flushes,
        )?;
        for finding in &self.findings {
            writeln!(f, "  {finding}")?;
        }
        Ok(())
    }
}

/// Combined result of [`crate::run_lru_fsck`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LruFsckReport {
    /// Index to allocation records.
    pub lrus: LruCheckReport,
    /// Allocation records to index.
    pub alloc_refs: LruCheckReport,
}

impl LruFsckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.lrus.is_clean() && self.alloc_refs.is_clean()
    }

    #[must_use]
    pub fn fixes(&self) -> usize {
        self.lrus.fixes() + self.alloc_refs.fixes()
    }
}

impl fmt::Display for LruFsckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "check_lrus: {}", self.lrus)?;
        write!(f, "check_alloc_to_lru_refs: {}", self.alloc_refs)
    }
}
