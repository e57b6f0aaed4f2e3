//! Level-based merge policies
//!
//! Segments are assigned a level `log(size) / log(merge_factor)`. Walking
//! the segment list from the largest level down, every contiguous run of
//! `merge_factor` segments within `LEVEL_LOG_SPAN` of the top level is
//! merged. Only adjacent segments are ever merged, so doc order is kept.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::merge_policy::{
    MergeContext, MergePolicy, MergeReason, MergeSpecification, MergeTrigger, OneMerge,
};
use super::segment_info::SegmentCommitInfo;
use super::segment_infos::SegmentInfos;
use super::types::MAX_DOCS;

/// Width of a level: segments within this many levels of the largest in
/// a window merge together
pub const LEVEL_LOG_SPAN: f64 = 0.75;

/// Configuration shared by the log merge policies. Sizes are in the
/// policy's unit: bytes for [`LogByteSizeMergePolicy`], documents for
/// [`LogDocMergePolicy`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogMergePolicyConfig {
    /// Segments merged at once, and the ratio between levels
    pub merge_factor: usize,
    /// Segments smaller than this all share the lowest level
    pub min_merge_size: u64,
    /// Segments larger than this are never merged
    pub max_merge_size: u64,
    /// Like `max_merge_size`, for forced merges
    pub max_merge_size_for_forced: u64,
    /// Segments with more docs than this are never merged
    pub max_merge_docs: u32,
    /// Scale sizes down by the deleted ratio
    pub calibrate_size_by_deletes: bool,
}

impl LogMergePolicyConfig {
    pub fn byte_size() -> Self {
        Self {
            merge_factor: 10,
            // 1.6MB
            min_merge_size: 1_677_721,
            max_merge_size: u64::MAX,
            max_merge_size_for_forced: u64::MAX,
            max_merge_docs: MAX_DOCS,
            calibrate_size_by_deletes: true,
        }
    }

    pub fn doc_count() -> Self {
        Self {
            min_merge_size: 1000,
            ..Self::byte_size()
        }
    }
}

impl Default for LogMergePolicyConfig {
    fn default() -> Self {
        Self::byte_size()
    }
}

/// Unit a log policy measures segments in
pub trait SizeMeasure: Send + Sync + std::fmt::Debug + Default {
    fn raw_size(info: &SegmentCommitInfo) -> u64;

    fn default_config() -> LogMergePolicyConfig;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ByteSize;

impl SizeMeasure for ByteSize {
    fn raw_size(info: &SegmentCommitInfo) -> u64 {
        info.size_bytes()
    }

    fn default_config() -> LogMergePolicyConfig {
        LogMergePolicyConfig::byte_size()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DocCount;

impl SizeMeasure for DocCount {
    fn raw_size(info: &SegmentCommitInfo) -> u64 {
        info.max_doc() as u64
    }

    fn default_config() -> LogMergePolicyConfig {
        LogMergePolicyConfig::doc_count()
    }
}

/// Level-based merge policy, generic over the size unit
#[derive(Clone, Debug)]
pub struct LogMergePolicy<M: SizeMeasure> {
    config: LogMergePolicyConfig,
    _measure: PhantomData<M>,
}

/// Levels by segment byte size
pub type LogByteSizeMergePolicy = LogMergePolicy<ByteSize>;

/// Levels by segment document count
pub type LogDocMergePolicy = LogMergePolicy<DocCount>;

impl<M: SizeMeasure> Default for LogMergePolicy<M> {
    fn default() -> Self {
        Self::new(M::default_config())
    }
}

impl<M: SizeMeasure> LogMergePolicy<M> {
    pub fn new(config: LogMergePolicyConfig) -> Self {
        Self {
            config,
            _measure: PhantomData,
        }
    }

    pub fn config(&self) -> &LogMergePolicyConfig {
        &self.config
    }

    fn merge_factor(&self) -> usize {
        self.config.merge_factor.max(2)
    }

    fn size(&self, info: &SegmentCommitInfo) -> u64 {
        let raw = M::raw_size(info);
        if self.config.calibrate_size_by_deletes {
            (raw as f64 * (1.0 - info.delete_ratio())) as u64
        } else {
            raw
        }
    }

    fn too_large(&self, info: &SegmentCommitInfo, max_size: u64) -> bool {
        self.size(info) > max_size || info.max_doc() > self.config.max_merge_docs
    }

    /// Forced merge of `segments` into `max_segment_count`, merging the
    /// last segments in chunks of `merge_factor`
    fn forced_max_num_segments(
        &self,
        segments: &[&SegmentCommitInfo],
        max_segment_count: usize,
    ) -> MergeSpecification {
        let factor = self.merge_factor();
        let mut spec = MergeSpecification::new();
        let mut last = segments.len();

        while last >= max_segment_count + factor - 1 && last >= factor {
            spec.add(OneMerge::new(&segments[last - factor..last], MergeReason::Forced));
            last -= factor;
        }

        if spec.is_empty() {
            if max_segment_count == 1 {
                if last > 1 || (last == 1 && segments[0].has_deletions()) {
                    spec.add(OneMerge::new(&segments[..last], MergeReason::Forced));
                }
            } else if last > max_segment_count {
                // Merge the window of adjacent segments with the smallest
                // total size that brings the count down
                let window = last - max_segment_count + 1;
                let mut best_start = 0;
                let mut best_size = u64::MAX;
                for start in 0..=(last - window) {
                    let total: u64 = segments[start..start + window].iter().map(|s| self.size(s)).sum();
                    let balanced = start == 0 || total < 2 * self.size(segments[start - 1]);
                    if total < best_size && balanced {
                        best_start = start;
                        best_size = total;
                    }
                }
                spec.add(OneMerge::new(
                    &segments[best_start..best_start + window],
                    MergeReason::Forced,
                ));
            }
        }
        spec
    }

    /// Contiguous forced merges that never touch an over-sized segment
    fn forced_by_size(&self, segments: &[&SegmentCommitInfo]) -> MergeSpecification {
        let max_size = self.config.max_merge_size_for_forced;
        let factor = self.merge_factor();
        let mut spec = MergeSpecification::new();
        let mut run: Vec<&SegmentCommitInfo> = Vec::new();

        for &seg in segments.iter().rev() {
            if self.too_large(seg, max_size) {
                flush_run(&mut run, &mut spec);
                continue;
            }
            run.push(seg);
            if run.len() == factor {
                flush_run(&mut run, &mut spec);
            }
        }
        flush_run(&mut run, &mut spec);
        spec
    }
}

/// Add a run collected back to front, unless merging it is pointless
fn flush_run(run: &mut Vec<&SegmentCommitInfo>, spec: &mut MergeSpecification) {
    run.reverse();
    if run.len() > 1 || (run.len() == 1 && run[0].has_deletions()) {
        spec.add(OneMerge::new(run, MergeReason::Forced));
    }
    run.clear();
}

impl<M: SizeMeasure> MergePolicy for LogMergePolicy<M> {
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        infos: &SegmentInfos,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        let factor = self.merge_factor();
        let norm = (factor as f64).ln();
        let segments: Vec<&SegmentCommitInfo> = infos.iter().collect();
        let levels: Vec<f64> = segments
            .iter()
            .map(|s| (self.size(s).max(1) as f64).ln() / norm)
            .collect();

        let level_floor = if self.config.min_merge_size == 0 {
            0.0
        } else {
            (self.config.min_merge_size as f64).ln() / norm
        };

        let mut spec = MergeSpecification::new();
        let mut start = 0;
        while start < segments.len() {
            let max_level = levels[start..].iter().cloned().fold(f64::MIN, f64::max);
            let level_bottom = if max_level <= level_floor {
                // All remaining segments are small: one level
                -1.0
            } else {
                let bottom = max_level - LEVEL_LOG_SPAN;
                if bottom < level_floor && max_level >= level_floor {
                    level_floor
                } else {
                    bottom
                }
            };

            let upto = match (start..segments.len()).rev().find(|&i| levels[i] >= level_bottom) {
                Some(upto) => upto,
                None => break,
            };

            let mut end = start + factor;
            while end <= upto + 1 {
                let window = &segments[start..end];
                let any_too_large = window
                    .iter()
                    .any(|s| self.too_large(s, self.config.max_merge_size));
                let any_merging = window.iter().any(|s| ctx.is_merging(s.name()));
                if !any_too_large && !any_merging {
                    spec.add(OneMerge::new(window, MergeReason::Natural));
                }
                start = end;
                end = start + factor;
            }
            start = upto + 1;
        }

        if !spec.is_empty() {
            debug!(?trigger, merges = spec.merges.len(), "Log policy selected merges");
        }
        spec.into_option()
    }

    fn find_forced_merges(
        &self,
        infos: &SegmentInfos,
        max_segment_count: usize,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        let max_segment_count = max_segment_count.max(1);
        // Merges must stay contiguous; wait for running ones to finish
        if infos.iter().any(|s| ctx.is_merging(s.name())) {
            return None;
        }
        let segments: Vec<&SegmentCommitInfo> = infos.iter().collect();
        let merged = segments.len() < max_segment_count
            || (segments.len() == max_segment_count
                && (max_segment_count > 1 || !segments[0].has_deletions()));
        if segments.is_empty() || merged {
            return None;
        }

        let any_too_large = segments
            .iter()
            .any(|s| self.too_large(s, self.config.max_merge_size_for_forced));
        let spec = if any_too_large {
            self.forced_by_size(&segments)
        } else {
            self.forced_max_num_segments(&segments, max_segment_count)
        };
        spec.into_option()
    }

    fn find_forced_deletes_merges(
        &self,
        infos: &SegmentInfos,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        let factor = self.merge_factor();
        let segments: Vec<&SegmentCommitInfo> = infos.iter().collect();
        let mut spec = MergeSpecification::new();
        let mut first: Option<usize> = None;

        for (i, seg) in segments.iter().enumerate() {
            let candidate = seg.has_deletions() && !ctx.is_merging(seg.name());
            match (candidate, first) {
                (true, None) => first = Some(i),
                (true, Some(f)) if i - f == factor => {
                    spec.add(OneMerge::new(&segments[f..i], MergeReason::ForcedDeletes));
                    first = Some(i);
                }
                (false, Some(f)) => {
                    spec.add(OneMerge::new(&segments[f..i], MergeReason::ForcedDeletes));
                    first = None;
                }
                _ => {}
            }
        }
        if let Some(f) = first {
            spec.add(OneMerge::new(&segments[f..], MergeReason::ForcedDeletes));
        }
        spec.into_option()
    }
}
