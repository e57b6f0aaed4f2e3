//! Invariant checking framework for correctness verification
//!
//! Each invariant inspects a [`DirectoryReader`] and reports a
//! [`Violation`] when the view it gives of the index is inconsistent.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::codec::{FieldStats, PostingsEnum, TermStats, TermsEnum};
use crate::index::DirectoryReader;

/// A violation of an invariant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub invariant: String,
    pub description: String,
    pub context: HashMap<String, String>,
}

impl Violation {
    fn new(invariant: &dyn Invariant, description: String) -> Self {
        Self {
            invariant: invariant.name().to_string(),
            description,
            context: HashMap::new(),
        }
    }

    fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "INVARIANT VIOLATION: {}", self.invariant)?;
        writeln!(f, "  Description: {}", self.description)?;
        if !self.context.is_empty() {
            writeln!(f, "  Context:")?;
            for (key, value) in &self.context {
                writeln!(f, "    {}: {}", key, value)?;
            }
        }
        Ok(())
    }
}

/// Trait for invariant checkers
pub trait Invariant: Send + Sync {
    /// Name of the invariant
    fn name(&self) -> &str;

    /// Check the invariant against a reader
    fn check(&self, reader: &DirectoryReader) -> Result<(), Violation>;

    /// Human-readable description
    fn description(&self) -> &str {
        "No description provided"
    }
}

/// Check all invariants and return violations
pub fn check_all_invariants(reader: &DirectoryReader, invariants: &[Box<dyn Invariant>]) -> Vec<Violation> {
    invariants
        .iter()
        .filter_map(|invariant| invariant.check(reader).err())
        .collect()
}

/// Every invariant below
pub fn default_invariants() -> Vec<Box<dyn Invariant>> {
    vec![
        Box::new(DocBasesMonotonic),
        Box::new(NumDocsWithinMaxDoc),
        Box::new(StatsMatchRecount),
        Box::new(CommitFilesExist),
    ]
}

// ============================================================================
// CONCRETE INVARIANTS
// ============================================================================

/// Leaf doc bases start at 0 and advance by each leaf's max_doc
pub struct DocBasesMonotonic;

impl Invariant for DocBasesMonotonic {
    fn name(&self) -> &str {
        "DocBasesMonotonic"
    }

    fn description(&self) -> &str {
        "Each leaf starts where the previous one ends"
    }

    fn check(&self, reader: &DirectoryReader) -> Result<(), Violation> {
        let mut expected = 0u64;
        for leaf in reader.leaves() {
            if leaf.doc_base as u64 != expected {
                return Err(Violation::new(self, format!("leaf {} starts at the wrong doc", leaf.ord))
                    .with("leaf", leaf.reader.name())
                    .with("doc_base", leaf.doc_base)
                    .with("expected", expected));
            }
            expected += leaf.reader.max_doc() as u64;
        }
        if expected != reader.max_doc() as u64 {
            return Err(Violation::new(self, "max_doc differs from the sum over leaves".to_string())
                .with("max_doc", reader.max_doc())
                .with("sum", expected));
        }
        Ok(())
    }
}

/// Live docs never exceed max_doc, and each leaf's deletions account for
/// the difference
pub struct NumDocsWithinMaxDoc;

impl Invariant for NumDocsWithinMaxDoc {
    fn name(&self) -> &str {
        "NumDocsWithinMaxDoc"
    }

    fn description(&self) -> &str {
        "numDocs <= maxDoc, per leaf and overall"
    }

    fn check(&self, reader: &DirectoryReader) -> Result<(), Violation> {
        if reader.num_docs() > reader.max_doc() {
            return Err(Violation::new(self, "more live docs than docs".to_string())
                .with("num_docs", reader.num_docs())
                .with("max_doc", reader.max_doc()));
        }
        for leaf in reader.leaves() {
            let deleted = leaf.reader.deleted_docs().map_or(0, |d| d.len());
            if leaf.reader.num_docs() as u64 + deleted != leaf.reader.max_doc() as u64 {
                return Err(Violation::new(self, "deletions do not account for missing docs".to_string())
                    .with("leaf", leaf.reader.name())
                    .with("num_docs", leaf.reader.num_docs())
                    .with("deleted", deleted)
                    .with("max_doc", leaf.reader.max_doc()));
            }
        }
        Ok(())
    }
}

/// Term and field statistics equal an exhaustive recount of the postings,
/// deleted docs included
pub struct StatsMatchRecount;

impl StatsMatchRecount {
    fn check_field(&self, reader: &DirectoryReader, field: &str, has_freqs: bool) -> Result<(), Violation> {
        let io_violation = |e: std::io::Error| Violation::new(self, format!("I/O error: {}", e)).with("field", field);
        let mut terms = match reader.terms(field).map_err(|e| {
            Violation::new(self, format!("cannot enumerate terms: {}", e)).with("field", field)
        })? {
            Some(terms) => terms,
            None => return Ok(()),
        };

        let mut recount = FieldStats::default();
        let mut docs = RoaringBitmap::new();
        while terms.next().map_err(io_violation)? {
            let mut counted = TermStats::default();
            let mut postings = terms.postings().map_err(io_violation)?;
            while let Some(posting) = postings.next().map_err(io_violation)? {
                counted.doc_freq += 1;
                counted.total_term_freq += if has_freqs { posting.freq.max(1) as u64 } else { 1 };
                docs.insert(posting.doc);
            }
            drop(postings);
            if terms.stats() != counted {
                return Err(Violation::new(self, "term stats differ from recount".to_string())
                    .with("field", field)
                    .with("term", String::from_utf8_lossy(terms.term()))
                    .with("stats", format!("{:?}", terms.stats()))
                    .with("recount", format!("{:?}", counted)));
            }
            recount.term_count += 1;
            recount.sum_doc_freq += counted.doc_freq as u64;
            recount.sum_total_term_freq += counted.total_term_freq;
        }
        recount.doc_count = docs.len() as u32;

        let stored = reader.field_stats(field).unwrap_or_default();
        // term_count is per segment; terms shared by segments are counted
        // once by the recount
        let comparable = FieldStats {
            term_count: recount.term_count,
            ..stored
        };
        if comparable != recount {
            return Err(Violation::new(self, "field stats differ from recount".to_string())
                .with("field", field)
                .with("stats", format!("{:?}", stored))
                .with("recount", format!("{:?}", recount)));
        }
        Ok(())
    }
}

impl Invariant for StatsMatchRecount {
    fn name(&self) -> &str {
        "StatsMatchRecount"
    }

    fn description(&self) -> &str {
        "docFreq, totalTermFreq and field stats equal a recount of the postings"
    }

    fn check(&self, reader: &DirectoryReader) -> Result<(), Violation> {
        let mut fields: Vec<(String, bool)> = Vec::new();
        let mut seen = BTreeSet::new();
        for leaf in reader.leaves() {
            for info in leaf.reader.source().field_infos().iter() {
                if let Some(options) = info.index_options {
                    if seen.insert(info.name.clone()) {
                        fields.push((info.name.clone(), options.has_freqs()));
                    }
                }
            }
        }
        for (field, has_freqs) in fields {
            self.check_field(reader, &field, has_freqs)?;
        }
        Ok(())
    }
}

/// Every file the reader's segment list references exists
pub struct CommitFilesExist;

impl Invariant for CommitFilesExist {
    fn name(&self) -> &str {
        "CommitFilesExist"
    }

    fn description(&self) -> &str {
        "No file referenced by the commit is missing"
    }

    fn check(&self, reader: &DirectoryReader) -> Result<(), Violation> {
        let dir = reader.directory();
        let include_segments_file = !reader.is_near_real_time();
        let missing: Vec<String> = reader
            .segment_infos()
            .files(include_segments_file)
            .into_iter()
            .filter(|file| !dir.file_exists(file))
            .collect();
        if !missing.is_empty() {
            return Err(Violation::new(self, format!("{} referenced file(s) missing", missing.len()))
                .with("generation", reader.generation())
                .with("missing", format!("{:?}", missing)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::config::{IndexWriterConfig, MergeSchedulerConfig};
    use crate::directory::{Directory, RamDirectory};
    use crate::index::{IndexWriter, NoMergePolicy};
    use crate::testing::{build_random_index, RandomIndexOptions};

    #[test]
    fn test_invariants_hold_for_random_index() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        let config = IndexWriterConfig::new()
            .with_merge_policy(Arc::new(NoMergePolicy))
            .with_merge_scheduler(MergeSchedulerConfig::Serial)
            .with_max_buffered_docs(50);
        let writer = IndexWriter::open(dir.clone(), config).unwrap();
        let options = RandomIndexOptions {
            docs: 200,
            ..Default::default()
        };
        let live = build_random_index(&writer, &mut StdRng::seed_from_u64(1), &options).unwrap();
        writer.commit().unwrap();

        let reader = DirectoryReader::open(dir).unwrap();
        assert_eq!(reader.num_docs() as usize, live.len());
        let violations = check_all_invariants(&reader, &default_invariants());
        assert!(violations.is_empty(), "{:?}", violations);

        let nrt = writer.reader().unwrap();
        assert!(check_all_invariants(&nrt, &default_invariants()).is_empty());
    }

    #[test]
    fn test_missing_file_is_reported() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        let writer = IndexWriter::open(dir.clone(), IndexWriterConfig::new()).unwrap();
        let mut doc = crate::models::Document::new();
        doc.add_text("body", "hello");
        writer.add_document(&doc).unwrap();
        writer.close().unwrap();

        let reader = DirectoryReader::open(dir.clone()).unwrap();
        let victim = reader.segment_infos().segments[0].info.files[0].clone();
        dir.delete_file(&victim).unwrap();
        let violation = CommitFilesExist.check(&reader).unwrap_err();
        assert_eq!(violation.invariant, "CommitFilesExist");
        assert!(violation.to_string().contains(&victim));
    }
}
