//! Per-segment metadata recorded in commit points

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::file_names::{doc_values_updates_file_name, live_docs_file_name};

/// Diagnostics key naming how a segment was produced
pub const SOURCE_KEY: &str = "source";
pub const SOURCE_FLUSH: &str = "flush";
pub const SOURCE_MERGE: &str = "merge";
pub const SOURCE_ADD_INDEXES: &str = "addIndexes";

/// Write-once description of a segment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Unique name, `_N`
    pub name: String,
    /// Documents in the segment, deleted ones included
    pub max_doc: u32,
    /// Codec the segment was written with
    pub codec: String,
    /// Files written by the codec. Live docs and doc values update files
    /// are not listed here.
    pub files: Vec<String>,
    /// Total size of `files`
    pub size_bytes: u64,
    pub diagnostics: BTreeMap<String, String>,
}

impl SegmentInfo {
    pub fn source(&self) -> Option<&str> {
        self.diagnostics.get(SOURCE_KEY).map(String::as_str)
    }
}

/// A segment as referenced by one commit: the immutable info plus the
/// deletion and doc values update generations in effect
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCommitInfo {
    pub info: SegmentInfo,
    /// Generation of the live docs file; 0 when the segment has no deletes
    pub del_gen: u64,
    pub del_count: u32,
    /// Generation of the doc values updates file; 0 when never updated
    pub dv_gen: u64,
}

impl SegmentCommitInfo {
    pub fn new(info: SegmentInfo) -> Self {
        Self {
            info,
            del_gen: 0,
            del_count: 0,
            dv_gen: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn max_doc(&self) -> u32 {
        self.info.max_doc
    }

    pub fn num_docs(&self) -> u32 {
        self.info.max_doc.saturating_sub(self.del_count)
    }

    pub fn has_deletions(&self) -> bool {
        self.del_count > 0
    }

    pub fn live_docs_file(&self) -> Option<String> {
        if self.del_gen == 0 {
            None
        } else {
            Some(live_docs_file_name(&self.info.name, self.del_gen))
        }
    }

    pub fn doc_values_updates_file(&self) -> Option<String> {
        if self.dv_gen == 0 {
            None
        } else {
            Some(doc_values_updates_file_name(&self.info.name, self.dv_gen))
        }
    }

    /// Every file this commit of the segment needs
    pub fn files(&self) -> Vec<String> {
        let mut files = self.info.files.clone();
        files.extend(self.live_docs_file());
        files.extend(self.doc_values_updates_file());
        files
    }

    pub fn size_bytes(&self) -> u64 {
        self.info.size_bytes
    }

    /// Fraction of documents that are deleted
    pub fn delete_ratio(&self) -> f64 {
        if self.info.max_doc == 0 {
            0.0
        } else {
            self.del_count as f64 / self.info.max_doc as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, max_doc: u32) -> SegmentInfo {
        let mut diagnostics = BTreeMap::new();
        diagnostics.insert(SOURCE_KEY.to_string(), SOURCE_FLUSH.to_string());
        SegmentInfo {
            name: name.to_string(),
            max_doc,
            codec: "Tessera10".to_string(),
            files: vec![format!("{}.tim", name), format!("{}.pst", name)],
            size_bytes: 100,
            diagnostics,
        }
    }

    #[test]
    fn test_files_include_live_docs() {
        let mut seg = SegmentCommitInfo::new(info("_3", 10));
        assert_eq!(seg.files(), vec!["_3.tim", "_3.pst"]);
        assert_eq!(seg.info.source(), Some(SOURCE_FLUSH));

        seg.del_gen = 2;
        seg.del_count = 4;
        assert_eq!(seg.files(), vec!["_3.tim", "_3.pst", "_3_2.liv"]);
        seg.dv_gen = 1;
        assert_eq!(seg.files(), vec!["_3.tim", "_3.pst", "_3_2.liv", "_3_1.dvd"]);
        assert_eq!(seg.num_docs(), 6);
        assert!((seg.delete_ratio() - 0.4).abs() < 1e-9);
    }
}
