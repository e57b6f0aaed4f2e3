//! Segment-structured index: writer, merging and point-in-time readers
//!
//! # Architecture
//!
//! ```text
//! IndexWriter ──► DocumentsBuffer ──flush──► segment (via Codec)
//!      │                                        │
//!      ├── MergePolicy (tiered / log) ──► MergeQueue ──► merger
//!      ├── IndexFileDeleter (ref-counted files, deletion policy)
//!      └── commit ──► pending_segments_N ──rename──► segments_N
//!
//! DirectoryReader ──► CompositeReader ──► SegmentReader per segment
//! ```
//!
//! A commit is the `segments_N` file with the highest generation. Readers
//! never see partially written state: a new segment list becomes visible
//! only through a new commit, or through a near-real-time reader taken
//! from the writer.

mod buffer;
mod check;
mod composite;
mod deletes;
mod deletion_policy;
mod file_deleter;
pub mod file_names;
mod log_merge;
mod merge_policy;
mod merge_scheduler;
mod merger;
mod multi_terms;
mod reader;
mod segment_info;
mod segment_infos;
mod segment_reader;
mod tiered;
mod types;
mod writer;

pub use buffer::DocumentsBuffer;
pub use check::{check_index, CheckIndexReport, SegmentStatus};
pub use composite::{CompositeReader, LeafContext};
pub use deletes::{DeleteQuery, NumericRangeQuery, TermsQuery};
pub use deletion_policy::{CommitPoint, IndexDeletionPolicy, KeepAllCommits, KeepOnlyLastCommit};
pub use log_merge::{
    ByteSize, DocCount, LogByteSizeMergePolicy, LogDocMergePolicy, LogMergePolicy,
    LogMergePolicyConfig, SizeMeasure,
};
pub use merge_policy::{
    MergeContext, MergePolicy, MergeReason, MergeSpecification, MergeTrigger, NoMergePolicy,
    OneMerge,
};
pub use multi_terms::{MultiPostingsEnum, MultiTermsEnum};
pub use reader::DirectoryReader;
pub use segment_info::{SegmentCommitInfo, SegmentInfo};
pub use segment_infos::SegmentInfos;
pub use segment_reader::{LeafReader, SegmentReader};
pub use tiered::{TieredMergePolicy, TieredMergePolicyConfig};
pub use types::{DocId, WriterState, MAX_DOCS};
pub use writer::IndexWriter;
