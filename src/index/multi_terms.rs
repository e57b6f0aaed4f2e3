//! Sorted union of several segments' term enumerations
//!
//! Each sub enumeration is paired with a [`DocMapping`] that turns its
//! segment-local doc ids into ids of the combined view: a plain rebase for
//! composite readers, or a compacting map that drops deleted docs for
//! merges. Per-term statistics are the sums over the segments that hold
//! the term.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::codec::{Posting, PostingsEnum, TermStats, TermsEnum};

/// Marks a doc dropped by a compacting map
pub const DROPPED: u32 = u32::MAX;

/// How a segment's doc ids map into the combined id space
#[derive(Clone, Debug)]
pub enum DocMapping {
    /// Add `base`. `deleted` is consulted only by live-only postings.
    Rebase {
        base: u32,
        deleted: Option<Arc<RoaringBitmap>>,
    },
    /// Look the new id up; [`DROPPED`] removes the doc
    Compact { map: Arc<Vec<u32>> },
}

impl DocMapping {
    fn map(&self, doc: u32, live_only: bool) -> Option<u32> {
        match self {
            DocMapping::Rebase { base, deleted } => {
                if live_only && deleted.as_ref().map_or(false, |d| d.contains(doc)) {
                    None
                } else {
                    Some(base + doc)
                }
            }
            DocMapping::Compact { map } => match map.get(doc as usize) {
                Some(&mapped) if mapped != DROPPED => Some(mapped),
                _ => None,
            },
        }
    }
}

struct Sub<'a> {
    terms: Box<dyn TermsEnum + 'a>,
    mapping: DocMapping,
}

/// Merged term enumeration over several segments
pub struct MultiTermsEnum<'a> {
    subs: Vec<Sub<'a>>,
    queue: BinaryHeap<Reverse<(Vec<u8>, usize)>>,
    /// Subs positioned on the current term, in segment order
    current: Vec<usize>,
    term: Vec<u8>,
    /// Every sub must advance before the next term is known
    refill_all: bool,
}

impl<'a> MultiTermsEnum<'a> {
    pub fn new(subs: Vec<(Box<dyn TermsEnum + 'a>, DocMapping)>) -> Self {
        Self {
            subs: subs
                .into_iter()
                .map(|(terms, mapping)| Sub { terms, mapping })
                .collect(),
            queue: BinaryHeap::new(),
            current: Vec::new(),
            term: Vec::new(),
            refill_all: true,
        }
    }

    /// Number of segments contributing to the current term
    pub fn matching_subs(&self) -> usize {
        self.current.len()
    }

    /// Postings of the current term skipping deleted docs
    pub fn live_postings(&self) -> io::Result<MultiPostingsEnum<'_>> {
        self.build_postings(true)
    }

    fn build_postings(&self, live_only: bool) -> io::Result<MultiPostingsEnum<'_>> {
        let mut subs = Vec::with_capacity(self.current.len());
        for &i in &self.current {
            let sub = &self.subs[i];
            subs.push((sub.terms.postings()?, &sub.mapping));
        }
        Ok(MultiPostingsEnum {
            subs,
            upto: 0,
            live_only,
        })
    }

    fn push(&mut self, i: usize) {
        self.queue.push(Reverse((self.subs[i].terms.term().to_vec(), i)));
    }
}

impl<'a> TermsEnum for MultiTermsEnum<'a> {
    fn next(&mut self) -> io::Result<bool> {
        if self.refill_all {
            self.queue.clear();
            for i in 0..self.subs.len() {
                if self.subs[i].terms.next()? {
                    self.push(i);
                }
            }
            self.refill_all = false;
        } else {
            let current = std::mem::take(&mut self.current);
            for &i in &current {
                if self.subs[i].terms.next()? {
                    self.push(i);
                }
            }
        }

        self.current.clear();
        let (term, first) = match self.queue.pop() {
            Some(Reverse(top)) => top,
            None => {
                self.term.clear();
                return Ok(false);
            }
        };
        self.current.push(first);
        while let Some(Reverse((next, _))) = self.queue.peek() {
            if *next != term {
                break;
            }
            if let Some(Reverse((_, i))) = self.queue.pop() {
                self.current.push(i);
            }
        }
        self.current.sort_unstable();
        self.term = term;
        Ok(true)
    }

    fn term(&self) -> &[u8] {
        &self.term
    }

    fn stats(&self) -> TermStats {
        let mut stats = TermStats::default();
        for &i in &self.current {
            stats.add(self.subs[i].terms.stats());
        }
        stats
    }

    fn seek_exact(&mut self, term: &[u8]) -> io::Result<bool> {
        self.queue.clear();
        self.current.clear();
        for i in 0..self.subs.len() {
            if self.subs[i].terms.seek_exact(term)? {
                self.current.push(i);
            }
        }
        self.term = term.to_vec();
        self.refill_all = true;
        Ok(!self.current.is_empty())
    }

    /// Every doc of the current term, deleted ones included
    fn postings(&self) -> io::Result<Box<dyn PostingsEnum + '_>> {
        Ok(Box::new(self.build_postings(false)?))
    }
}

/// Concatenation of the current term's postings across segments.
///
/// Segments are visited in order and mappings are monotonic, so doc ids
/// come out increasing.
pub struct MultiPostingsEnum<'a> {
    subs: Vec<(Box<dyn PostingsEnum + 'a>, &'a DocMapping)>,
    upto: usize,
    live_only: bool,
}

impl<'a> PostingsEnum for MultiPostingsEnum<'a> {
    fn next(&mut self) -> io::Result<Option<Posting>> {
        while self.upto < self.subs.len() {
            let (postings, mapping) = &mut self.subs[self.upto];
            match postings.next()? {
                Some(mut posting) => {
                    if let Some(doc) = mapping.map(posting.doc, self.live_only) {
                        posting.doc = doc;
                        return Ok(Some(posting));
                    }
                }
                None => self.upto += 1,
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SegmentSource;
    use crate::config::TokenizerConfig;
    use crate::index::DocumentsBuffer;
    use crate::models::Document;
    use crate::tokenizer::StandardAnalyzer;

    fn buffer(texts: &[&str]) -> DocumentsBuffer {
        let mut buffer =
            DocumentsBuffer::new(Arc::new(StandardAnalyzer::new(&TokenizerConfig::default())));
        for text in texts {
            let mut doc = Document::new();
            doc.add_text("body", text);
            buffer.add_document(&doc).unwrap();
        }
        buffer
    }

    fn rebase(base: u32) -> DocMapping {
        DocMapping::Rebase {
            base,
            deleted: None,
        }
    }

    fn docs(postings: &mut dyn PostingsEnum) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(p) = postings.next().unwrap() {
            out.push(p.doc);
        }
        out
    }

    #[test]
    fn test_union_in_term_order_with_summed_stats() {
        let a = buffer(&["apple cherry", "cherry"]);
        let b = buffer(&["banana cherry cherry"]);
        let mut terms = MultiTermsEnum::new(vec![
            (a.terms("body").unwrap().unwrap(), rebase(0)),
            (b.terms("body").unwrap().unwrap(), rebase(2)),
        ]);

        let mut seen = Vec::new();
        while terms.next().unwrap() {
            seen.push((
                String::from_utf8(terms.term().to_vec()).unwrap(),
                terms.stats(),
                docs(&mut *terms.postings().unwrap()),
            ));
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, "apple");
        assert_eq!(seen[1].0, "banana");
        assert_eq!(seen[1].2, vec![2]);
        assert_eq!(seen[2].0, "cherry");
        assert_eq!(seen[2].1, TermStats { doc_freq: 3, total_term_freq: 4 });
        assert_eq!(seen[2].2, vec![0, 1, 2]);
    }

    #[test]
    fn test_seek_then_next() {
        let a = buffer(&["alpha delta"]);
        let b = buffer(&["charlie delta echo"]);
        let mut terms = MultiTermsEnum::new(vec![
            (a.terms("body").unwrap().unwrap(), rebase(0)),
            (b.terms("body").unwrap().unwrap(), rebase(1)),
        ]);

        assert!(terms.seek_exact(b"delta").unwrap());
        assert_eq!(terms.matching_subs(), 2);
        assert_eq!(terms.stats().doc_freq, 2);
        assert!(terms.next().unwrap());
        assert_eq!(terms.term(), b"echo");

        assert!(!terms.seek_exact(b"bravo").unwrap());
        assert!(terms.next().unwrap());
        assert_eq!(terms.term(), b"charlie");
        assert!(terms.next().unwrap());
        assert_eq!(terms.term(), b"delta");
    }

    #[test]
    fn test_live_postings_and_compaction() {
        let a = buffer(&["x", "x y", "x"]);
        let mut deleted = RoaringBitmap::new();
        deleted.insert(1);
        let deleted = Arc::new(deleted);

        let mut terms = MultiTermsEnum::new(vec![(
            a.terms("body").unwrap().unwrap(),
            DocMapping::Rebase {
                base: 10,
                deleted: Some(deleted),
            },
        )]);
        assert!(terms.seek_exact(b"x").unwrap());
        assert_eq!(docs(&mut *terms.postings().unwrap()), vec![10, 11, 12]);
        assert_eq!(docs(&mut terms.live_postings().unwrap()), vec![10, 12]);

        let map = Arc::new(vec![0, DROPPED, 1]);
        let mut compact =
            MultiTermsEnum::new(vec![(a.terms("body").unwrap().unwrap(), DocMapping::Compact { map })]);
        assert!(compact.seek_exact(b"x").unwrap());
        assert_eq!(docs(&mut *compact.postings().unwrap()), vec![0, 1]);
        assert!(compact.seek_exact(b"y").unwrap());
        assert!(docs(&mut *compact.postings().unwrap()).is_empty());
    }
}
