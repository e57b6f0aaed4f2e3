//! Core types shared by the writer and readers

use std::fmt;

use serde::{Deserialize, Serialize};

/// Document id, local to a segment or global across a composite reader
pub type DocId = u32;

/// Largest number of documents an index, or any composite view of it,
/// can hold: the positive range of a signed 32-bit id
pub const MAX_DOCS: u32 = i32::MAX as u32;

/// Lifecycle of an [`IndexWriter`](super::IndexWriter)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriterState {
    /// Open, nothing changed since the last commit
    OpenClean,
    /// Open with buffered or uncommitted changes
    OpenDirty,
    Closed,
    RolledBack,
}

impl WriterState {
    pub fn is_open(self) -> bool {
        matches!(self, WriterState::OpenClean | WriterState::OpenDirty)
    }
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriterState::OpenClean => "open (clean)",
            WriterState::OpenDirty => "open (dirty)",
            WriterState::Closed => "closed",
            WriterState::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_docs() {
        assert_eq!(MAX_DOCS, 2_147_483_647);
        assert_eq!(MAX_DOCS as u64 + 1, 1u64 << 31);
    }

    #[test]
    fn test_writer_state() {
        assert!(WriterState::OpenDirty.is_open());
        assert!(!WriterState::RolledBack.is_open());
        assert_eq!(WriterState::OpenClean.to_string(), "open (clean)");
    }
}
