//! Which commit points survive a new commit

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::segment_infos::SegmentInfos;

/// A commit as seen by deletion policies and readers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitPoint {
    pub generation: u64,
    pub segments_file: String,
    /// Every file the commit references, its `segments_N` included
    pub files: BTreeSet<String>,
    pub user_data: BTreeMap<String, String>,
    pub segment_count: usize,
}

impl CommitPoint {
    pub fn from_infos(infos: &SegmentInfos) -> Option<Self> {
        let segments_file = infos.segments_file_name()?;
        Some(Self {
            generation: infos.generation,
            segments_file,
            files: infos.files(true),
            user_data: infos.user_data.clone(),
            segment_count: infos.len(),
        })
    }
}

/// Decides which commits to delete.
///
/// Both hooks receive the retained commits oldest first and return the
/// generations to delete. The newest commit is never deleted, whatever
/// the policy returns.
pub trait IndexDeletionPolicy: Send + Sync + fmt::Debug {
    /// Called once when a writer opens an existing index
    fn on_init(&self, commits: &[CommitPoint]) -> Vec<u64>;

    /// Called after every successful commit
    fn on_commit(&self, commits: &[CommitPoint]) -> Vec<u64>;
}

/// Keep only the newest commit
#[derive(Clone, Copy, Debug, Default)]
pub struct KeepOnlyLastCommit;

impl KeepOnlyLastCommit {
    fn all_but_last(commits: &[CommitPoint]) -> Vec<u64> {
        match commits.split_last() {
            Some((_, older)) => older.iter().map(|c| c.generation).collect(),
            None => Vec::new(),
        }
    }
}

impl IndexDeletionPolicy for KeepOnlyLastCommit {
    fn on_init(&self, commits: &[CommitPoint]) -> Vec<u64> {
        Self::all_but_last(commits)
    }

    fn on_commit(&self, commits: &[CommitPoint]) -> Vec<u64> {
        Self::all_but_last(commits)
    }
}

/// Never delete a commit
#[derive(Clone, Copy, Debug, Default)]
pub struct KeepAllCommits;

impl IndexDeletionPolicy for KeepAllCommits {
    fn on_init(&self, _commits: &[CommitPoint]) -> Vec<u64> {
        Vec::new()
    }

    fn on_commit(&self, _commits: &[CommitPoint]) -> Vec<u64> {
        Vec::new()
    }
}
