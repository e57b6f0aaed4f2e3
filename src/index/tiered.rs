//! Tiered merge policy
//!
//! Segment size & merge policy:
//! - a segment's size is its byte size scaled down by its deleted ratio
//! - the index is allowed roughly `segments_per_tier` segments per tier,
//!   each tier `max_merge_at_once` times larger than the one below
//! - merges never produce segments over `max_merged_segment_bytes`
//! - among candidate windows the one with the lowest score wins; the
//!   score favors even-sized inputs, smaller merges and reclaiming
//!   deleted docs

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::merge_policy::{
    MergeContext, MergePolicy, MergeReason, MergeSpecification, MergeTrigger, OneMerge,
};
use super::segment_info::SegmentCommitInfo;
use super::segment_infos::SegmentInfos;

/// Configuration for the tiered merge policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredMergePolicyConfig {
    /// Segments smaller than this are treated as this size (default: 2MB)
    pub floor_segment_bytes: u64,
    /// Allowed segments per tier (default: 10)
    pub segments_per_tier: f64,
    /// Maximum segments merged at once by regular merges (default: 10)
    pub max_merge_at_once: usize,
    /// Maximum segments merged at once by forced merges (default: 30)
    pub max_merge_at_once_explicit: usize,
    /// Maximum size of a merged segment (default: 5GB)
    pub max_merged_segment_bytes: u64,
    /// Exponent rewarding merges that reclaim deletes (default: 2.0)
    pub reclaim_deletes_weight: f64,
    /// Minimum percentage of deleted docs for `force_merge_deletes`
    /// (default: 10.0)
    pub force_merge_deletes_pct: f64,
}

impl Default for TieredMergePolicyConfig {
    fn default() -> Self {
        Self {
            floor_segment_bytes: 2 * 1024 * 1024,
            segments_per_tier: 10.0,
            max_merge_at_once: 10,
            max_merge_at_once_explicit: 30,
            max_merged_segment_bytes: 5 * 1024 * 1024 * 1024,
            reclaim_deletes_weight: 2.0,
            force_merge_deletes_pct: 10.0,
        }
    }
}

/// Tiered merge policy implementation
#[derive(Clone, Debug, Default)]
pub struct TieredMergePolicy {
    config: TieredMergePolicyConfig,
}

/// A segment with its deletion-adjusted size
struct SizedSegment<'a> {
    info: &'a SegmentCommitInfo,
    size: u64,
}

impl TieredMergePolicy {
    pub fn new(config: TieredMergePolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TieredMergePolicyConfig {
        &self.config
    }

    fn segment_size(info: &SegmentCommitInfo) -> u64 {
        let bytes = info.size_bytes() as f64;
        (bytes * (1.0 - info.delete_ratio())) as u64
    }

    fn floor_size(&self, bytes: u64) -> u64 {
        bytes.max(self.config.floor_segment_bytes)
    }

    /// Segments sorted by adjusted size, largest first
    fn sorted<'a>(&self, infos: &'a SegmentInfos) -> Vec<SizedSegment<'a>> {
        let mut sorted: Vec<SizedSegment<'a>> = infos
            .iter()
            .map(|info| SizedSegment {
                info,
                size: Self::segment_size(info),
            })
            .collect();
        sorted.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.info.name().cmp(b.info.name())));
        sorted
    }

    /// How many segments the index may hold before merging is due
    fn allowed_segment_count(&self, total_bytes: u64, min_segment_bytes: u64) -> f64 {
        let mut level_size = self.floor_size(min_segment_bytes) as f64;
        let mut bytes_left = total_bytes as f64;
        let mut allowed = 0.0;
        let per_tier = self.config.segments_per_tier;
        loop {
            let level_count = bytes_left / level_size;
            if level_count < per_tier || level_size >= self.config.max_merged_segment_bytes as f64 {
                allowed += level_count.ceil();
                break;
            }
            allowed += per_tier;
            bytes_left -= per_tier * level_size;
            level_size *= self.config.max_merge_at_once as f64;
        }
        allowed.max(per_tier)
    }

    /// Lower is better
    fn score(&self, candidate: &[&SizedSegment<'_>], hit_too_large: bool) -> f64 {
        let mut total_before = 0u64;
        let mut total_after = 0u64;
        let mut total_after_floored = 0u64;
        for seg in candidate {
            total_before += seg.info.size_bytes();
            total_after += seg.size;
            total_after_floored += self.floor_size(seg.size);
        }

        let skew = if hit_too_large {
            1.0 / self.config.max_merge_at_once as f64
        } else {
            self.floor_size(candidate[0].size) as f64 / total_after_floored.max(1) as f64
        };
        // Gently favor smaller merges
        let size_factor = (total_after.max(1) as f64).powf(0.05);
        let non_del_ratio = if total_before == 0 {
            1.0
        } else {
            total_after as f64 / total_before as f64
        };
        skew * size_factor * non_del_ratio.powf(self.config.reclaim_deletes_weight)
    }
}

impl MergePolicy for TieredMergePolicy {
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        infos: &SegmentInfos,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        if infos.is_empty() {
            return None;
        }
        let sorted = self.sorted(infos);
        let max_merged = self.config.max_merged_segment_bytes;

        let mut total_bytes = 0u64;
        let mut min_segment_bytes = u64::MAX;
        let mut merging_bytes = 0u64;
        for seg in &sorted {
            if ctx.is_merging(seg.info.name()) {
                merging_bytes += seg.size;
            } else if seg.size < max_merged / 2 {
                total_bytes += seg.size;
            }
            min_segment_bytes = min_segment_bytes.min(seg.size);
        }

        // Skip segments that are already too large to merge further
        let too_big = sorted.iter().take_while(|s| s.size >= max_merged / 2).count();
        let allowed = self.allowed_segment_count(total_bytes, min_segment_bytes);

        let mut eligible: Vec<&SizedSegment<'_>> = sorted[too_big..]
            .iter()
            .filter(|s| !ctx.is_merging(s.info.name()))
            .collect();

        let mut spec = MergeSpecification::new();
        let max_at_once = self.config.max_merge_at_once.max(2);
        // A running merge that will produce a max-sized segment blocks
        // further merges of that size
        let max_merge_is_running = merging_bytes >= max_merged;

        while eligible.len() as f64 > allowed && eligible.len() >= 2 {
            let mut best: Option<(Vec<usize>, f64, bool)> = None;
            let last_start = eligible.len().saturating_sub(max_at_once);
            for start in 0..=last_start {
                let mut candidate = Vec::new();
                let mut total = 0u64;
                let mut hit_too_large = false;
                for idx in start..eligible.len() {
                    if candidate.len() >= max_at_once {
                        break;
                    }
                    let size = eligible[idx].size;
                    if total + size > max_merged {
                        hit_too_large = true;
                        continue;
                    }
                    candidate.push(idx);
                    total += size;
                }
                if candidate.len() < 2 {
                    continue;
                }
                if hit_too_large && max_merge_is_running {
                    continue;
                }
                let segs: Vec<&SizedSegment<'_>> = candidate.iter().map(|&i| eligible[i]).collect();
                let score = self.score(&segs, hit_too_large);
                if best.as_ref().map_or(true, |(_, s, _)| score < *s) {
                    best = Some((candidate, score, hit_too_large));
                }
            }

            let (chosen, score, _) = match best {
                Some(best) => best,
                None => break,
            };
            let infos_chosen: Vec<&SegmentCommitInfo> =
                chosen.iter().map(|&i| eligible[i].info).collect();
            debug!(
                ?trigger,
                segments = infos_chosen.len(),
                score,
                "Tiered policy selected merge"
            );
            spec.add(OneMerge::new(&infos_chosen, MergeReason::Natural).with_score(score));
            eligible = eligible
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !chosen.contains(i))
                .map(|(_, s)| s)
                .collect();
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
        let sorted = self.sorted(infos);
        let mut eligible: Vec<&SizedSegment<'_>> = sorted
            .iter()
            .filter(|s| !ctx.is_merging(s.info.name()))
            .collect();

        let already_merged = eligible.len() < max_segment_count
            || (eligible.len() == max_segment_count
                && (max_segment_count > 1 || !eligible[0].info.has_deletions()));
        if eligible.is_empty() || already_merged {
            return None;
        }

        let chunk = self.config.max_merge_at_once_explicit.max(2);
        let mut spec = MergeSpecification::new();
        // Merge the smallest segments first, a full chunk at a time
        while eligible.len() >= max_segment_count + chunk - 1 {
            let start = eligible.len() - chunk;
            let segs: Vec<&SegmentCommitInfo> = eligible[start..].iter().map(|s| s.info).collect();
            spec.add(OneMerge::new(&segs, MergeReason::Forced));
            eligible.truncate(start);
        }

        if spec.is_empty() {
            let count = if eligible.len() > max_segment_count {
                eligible.len() - max_segment_count + 1
            } else {
                // A single segment with deletions merges with itself
                1
            };
            let start = eligible.len() - count;
            let segs: Vec<&SegmentCommitInfo> = eligible[start..].iter().map(|s| s.info).collect();
            spec.add(OneMerge::new(&segs, MergeReason::Forced));
        }

        debug!(merges = spec.merges.len(), max_segment_count, "Tiered policy forced merges");
        spec.into_option()
    }

    fn find_forced_deletes_merges(
        &self,
        infos: &SegmentInfos,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        let threshold = self.config.force_merge_deletes_pct;
        let eligible: Vec<&SegmentCommitInfo> = self
            .sorted(infos)
            .into_iter()
            .filter(|s| !ctx.is_merging(s.info.name()))
            .filter(|s| s.info.delete_ratio() * 100.0 > threshold)
            .map(|s| s.info)
            .collect();

        let mut spec = MergeSpecification::new();
        for group in eligible.chunks(self.config.max_merge_at_once_explicit.max(1)) {
            let segs: Vec<&SegmentCommitInfo> = group.to_vec();
            spec.add(OneMerge::new(&segs, MergeReason::ForcedDeletes));
        }
        spec.into_option()
    }
}
