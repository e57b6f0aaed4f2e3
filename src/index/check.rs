//! Read-only consistency check of the latest commit

use std::fmt;

use roaring::RoaringBitmap;
use tracing::{info, warn};

use super::segment_infos::SegmentInfos;
use super::segment_reader::{LeafReader, SegmentReader};
use crate::codec::{FieldStats, SegmentSource, TermStats};
use crate::directory::Directory;
use crate::error::Result;

/// Outcome of checking one segment
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentStatus {
    pub name: String,
    pub max_doc: u32,
    pub num_docs: u32,
    pub del_gen: u64,
    pub dv_gen: u64,
    pub fields: usize,
    pub terms: u64,
    pub postings: u64,
    pub problems: Vec<String>,
}

impl SegmentStatus {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckIndexReport {
    pub generation: u64,
    pub segments: Vec<SegmentStatus>,
    /// Files the commit references that do not exist
    pub missing_files: Vec<String>,
}

impl CheckIndexReport {
    pub fn is_clean(&self) -> bool {
        self.missing_files.is_empty() && self.segments.iter().all(SegmentStatus::is_clean)
    }

    pub fn problem_count(&self) -> usize {
        self.missing_files.len() + self.segments.iter().map(|s| s.problems.len()).sum::<usize>()
    }
}

impl fmt::Display for CheckIndexReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "segments_{}: {} segment(s)", self.generation, self.segments.len())?;
        for seg in &self.segments {
            let status = if seg.is_clean() { "OK" } else { "BROKEN" };
            writeln!(
                f,
                "  {} maxDoc={} numDocs={} delGen={} dvGen={} fields={} terms={} postings={} [{}]",
                seg.name,
                seg.max_doc,
                seg.num_docs,
                seg.del_gen,
                seg.dv_gen,
                seg.fields,
                seg.terms,
                seg.postings,
                status
            )?;
            for problem in &seg.problems {
                writeln!(f, "    - {}", problem)?;
            }
        }
        for file in &self.missing_files {
            writeln!(f, "  missing file: {}", file)?;
        }
        if self.is_clean() {
            write!(f, "No problems found")
        } else {
            write!(f, "{} problem(s) found", self.problem_count())
        }
    }
}

/// Check every segment of the latest commit. Never writes to `dir`.
pub fn check_index(dir: &dyn Directory) -> Result<CheckIndexReport> {
    let infos = SegmentInfos::read_latest(dir)?;
    let mut report = CheckIndexReport {
        generation: infos.generation,
        ..Default::default()
    };

    for file in infos.files(true) {
        if !dir.file_exists(&file) {
            report.missing_files.push(file);
        }
    }

    for info in infos.iter() {
        let mut status = SegmentStatus {
            name: info.name().to_string(),
            max_doc: info.max_doc(),
            num_docs: info.num_docs(),
            del_gen: info.del_gen,
            dv_gen: info.dv_gen,
            ..Default::default()
        };
        if info.del_count > info.max_doc() {
            status
                .problems
                .push(format!("{} deletions exceed maxDoc {}", info.del_count, info.max_doc()));
        }
        // Opening verifies checksums, the deletion count and the range of
        // updated docs
        match SegmentReader::open(dir, info) {
            Ok(reader) => {
                if reader.num_docs() > reader.max_doc() {
                    status.problems.push(format!(
                        "numDocs {} exceeds maxDoc {}",
                        reader.num_docs(),
                        reader.max_doc()
                    ));
                }
                check_source(reader.source(), &mut status);
            }
            Err(e) => status.problems.push(format!("cannot open: {}", e)),
        }
        if !status.is_clean() {
            warn!(segment = %status.name, problems = status.problems.len(), "Segment failed check");
        }
        report.segments.push(status);
    }

    info!(
        generation = report.generation,
        segments = report.segments.len(),
        problems = report.problem_count(),
        "Checked index"
    );
    Ok(report)
}

/// Walk every posting of `source`, recounting term and field statistics
pub(crate) fn check_source(source: &dyn SegmentSource, status: &mut SegmentStatus) {
    let max_doc = source.max_doc();
    let fields: Vec<String> = source.field_infos().indexed_fields().map(str::to_string).collect();
    status.fields = source.field_infos().len();

    for field in fields {
        if let Err(problem) = check_field(source, &field, max_doc, status) {
            status.problems.push(problem);
        }
    }
}

fn check_field(
    source: &dyn SegmentSource,
    field: &str,
    max_doc: u32,
    status: &mut SegmentStatus,
) -> std::result::Result<(), String> {
    let has_freqs = source
        .field_infos()
        .get(field)
        .and_then(|f| f.index_options)
        .map_or(false, |o| o.has_freqs());
    let io_err = |e: std::io::Error| format!("field {}: {}", field, e);

    let mut terms = match source.terms(field).map_err(io_err)? {
        Some(terms) => terms,
        None => return Ok(()),
    };
    let mut recount = FieldStats::default();
    let mut docs = RoaringBitmap::new();
    let mut previous_term: Option<Vec<u8>> = None;

    while terms.next().map_err(io_err)? {
        let term = terms.term().to_vec();
        if previous_term.as_ref().map_or(false, |p| *p >= term) {
            status
                .problems
                .push(format!("field {}: terms out of order at {:?}", field, String::from_utf8_lossy(&term)));
        }
        let mut counted = TermStats::default();
        let mut last_doc: Option<u32> = None;
        let mut postings = terms.postings().map_err(io_err)?;
        while let Some(posting) = postings.next().map_err(io_err)? {
            if posting.doc >= max_doc {
                status.problems.push(format!(
                    "field {} term {:?}: doc {} out of range (maxDoc {})",
                    field,
                    String::from_utf8_lossy(&term),
                    posting.doc,
                    max_doc
                ));
            }
            if last_doc.map_or(false, |d| d >= posting.doc) {
                status.problems.push(format!(
                    "field {} term {:?}: doc {} after {:?}",
                    field,
                    String::from_utf8_lossy(&term),
                    posting.doc,
                    last_doc
                ));
            }
            last_doc = Some(posting.doc);
            docs.insert(posting.doc);
            counted.doc_freq += 1;
            counted.total_term_freq += if has_freqs { posting.freq.max(1) as u64 } else { 1 };
        }
        drop(postings);

        let stored = terms.stats();
        if stored != counted {
            status.problems.push(format!(
                "field {} term {:?}: stats {:?} but postings recount {:?}",
                field,
                String::from_utf8_lossy(&term),
                stored,
                counted
            ));
        }
        status.terms += 1;
        status.postings += counted.doc_freq as u64;
        recount.term_count += 1;
        recount.sum_doc_freq += counted.doc_freq as u64;
        recount.sum_total_term_freq += counted.total_term_freq;
        previous_term = Some(term);
    }
    recount.doc_count = docs.len() as u32;

    match source.field_stats(field) {
        Some(stored) if stored == recount => {}
        Some(stored) => status.problems.push(format!(
            "field {}: field stats {:?} but recount {:?}",
            field, stored, recount
        )),
        None => status.problems.push(format!("field {}: terms without field stats", field)),
    }
    Ok(())
}
