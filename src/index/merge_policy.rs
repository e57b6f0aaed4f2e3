//! Merge policy decision protocol
//!
//! A policy is a pure function of the segment list: it never runs merges,
//! only proposes groups of segments. Returning `None` means "nothing to
//! do", including for forced requests a policy does not support.

use std::collections::HashSet;
use std::fmt;

use super::segment_info::SegmentCommitInfo;
use super::segment_infos::SegmentInfos;

/// What prompted a merge decision
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergeTrigger {
    SegmentFlush,
    MergeFinished,
    /// `maybe_merge` called by the user
    Explicit,
    ForcedDeletes,
    Closing,
}

/// Why a merge was proposed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeReason {
    /// Regular policy decision
    Natural,
    /// Part of `force_merge`
    Forced,
    /// Reclaiming deleted docs for `force_merge_deletes`
    ForcedDeletes,
}

/// One group of segments to be replaced by a single merged segment
#[derive(Clone, Debug, PartialEq)]
pub struct OneMerge {
    /// Names of the input segments
    pub segments: Vec<String>,
    /// Sum of the inputs' sizes
    pub estimated_bytes: u64,
    /// Policy-specific rank, lower is better
    pub score: f64,
    pub reason: MergeReason,
}

impl OneMerge {
    pub fn new(segments: &[&SegmentCommitInfo], reason: MergeReason) -> Self {
        Self {
            segments: segments.iter().map(|s| s.name().to_string()).collect(),
            estimated_bytes: segments.iter().map(|s| s.size_bytes()).sum(),
            score: 0.0,
            reason,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn overlaps(&self, names: &[String]) -> bool {
        self.segments.iter().any(|s| names.contains(s))
    }
}

/// Disjoint merges proposed in one decision
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeSpecification {
    pub merges: Vec<OneMerge>,
}

impl MergeSpecification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, merge: OneMerge) {
        self.merges.push(merge);
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }

    /// `None` when empty, the way policies report "nothing to do"
    pub fn into_option(self) -> Option<Self> {
        if self.merges.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

/// State of the writer a policy may consult
#[derive(Clone, Debug, Default)]
pub struct MergeContext {
    merging: HashSet<String>,
}

impl MergeContext {
    pub fn new(merging: HashSet<String>) -> Self {
        Self { merging }
    }

    /// True when the segment is part of a scheduled or running merge
    pub fn is_merging(&self, segment: &str) -> bool {
        self.merging.contains(segment)
    }

    pub fn merging_count(&self) -> usize {
        self.merging.len()
    }
}

/// Chooses which segments to merge.
///
/// Implementations must never propose a segment for which
/// [`MergeContext::is_merging`] is true, and proposed groups must be
/// disjoint.
pub trait MergePolicy: Send + Sync + fmt::Debug {
    /// Regular merges after a flush, a finished merge or an explicit call
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        infos: &SegmentInfos,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification>;

    /// Merges bringing the index down to at most `max_segment_count`
    /// segments
    fn find_forced_merges(
        &self,
        infos: &SegmentInfos,
        max_segment_count: usize,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification>;

    /// Merges rewriting segments with deletions
    fn find_forced_deletes_merges(
        &self,
        infos: &SegmentInfos,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification>;
}

/// Never merges
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        _infos: &SegmentInfos,
        _ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        None
    }

    fn find_forced_merges(
        &self,
        _infos: &SegmentInfos,
        _max_segment_count: usize,
        _ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        None
    }

    fn find_forced_deletes_merges(
        &self,
        _infos: &SegmentInfos,
        _ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        None
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use super::*;
    use crate::index::segment_info::SegmentInfo;

    /// Segment list with the given (size in bytes, max_doc, deleted) triples
    pub fn infos(segments: &[(u64, u32, u32)]) -> SegmentInfos {
        let mut infos = SegmentInfos::new();
        for &(size_bytes, max_doc, del_count) in segments {
            let name = infos.next_segment_name();
            let mut seg = SegmentCommitInfo::new(SegmentInfo {
                files: vec![format!("{}.tim", name)],
                name,
                max_doc,
                codec: "Tessera10".to_string(),
                size_bytes,
                diagnostics: BTreeMap::new(),
            });
            seg.del_count = del_count;
            seg.del_gen = if del_count > 0 { 1 } else { 0 };
            infos.segments.push(seg);
        }
        infos
    }

    pub fn merging(names: &[&str]) -> MergeContext {
        MergeContext::new(names.iter().map(|n| n.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_no_merge_policy_declines_everything() {
        let infos = infos(&[(100, 10, 5); 30]);
        let ctx = MergeContext::default();
        for trigger in [
            MergeTrigger::SegmentFlush,
            MergeTrigger::MergeFinished,
            MergeTrigger::Explicit,
            MergeTrigger::ForcedDeletes,
            MergeTrigger::Closing,
        ] {
            assert!(NoMergePolicy.find_merges(trigger, &infos, &ctx).is_none());
        }
        assert!(NoMergePolicy.find_forced_merges(&infos, 1, &ctx).is_none());
        assert!(NoMergePolicy.find_forced_deletes_merges(&infos, &ctx).is_none());
    }

    #[test]
    fn test_one_merge() {
        let infos = infos(&[(100, 10, 0), (50, 5, 0)]);
        let segs: Vec<_> = infos.iter().collect();
        let merge = OneMerge::new(&segs, MergeReason::Forced);
        assert_eq!(merge.segments, vec!["_0", "_1"]);
        assert_eq!(merge.estimated_bytes, 150);
        assert!(merge.overlaps(&["_1".to_string()]));
        assert!(!merge.overlaps(&["_2".to_string()]));
        assert!(MergeSpecification::new().into_option().is_none());
    }
}
