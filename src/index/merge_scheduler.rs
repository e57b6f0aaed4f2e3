//! Merge bookkeeping and execution threads
//!
//! [`MergeQueue`] tracks merges the policy proposed (pending) and merges
//! being executed (running), rejecting any merge that shares a segment
//! with one already registered. [`MergeScheduler`] decides which thread
//! executes them.

use std::collections::HashSet;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use tracing::{debug, warn};

use super::merge_policy::{MergeContext, OneMerge};
use crate::config::MergeSchedulerConfig;

/// Pending and running merges
#[derive(Debug)]
pub struct MergeQueue {
    pending: Vec<OneMerge>,
    /// Inputs of the merges currently executing
    running: Vec<Vec<String>>,
    max_concurrent: usize,
}

impl MergeQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            pending: Vec::new(),
            running: Vec::new(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Register a merge. Returns false, dropping it, if it shares a
    /// segment with a pending or running merge.
    pub fn register(&mut self, merge: OneMerge) -> bool {
        let overlaps = self.running.iter().any(|running| merge.overlaps(running))
            || self.pending.iter().any(|pending| merge.overlaps(&pending.segments));
        if overlaps || merge.segments.is_empty() {
            debug!(segments = ?merge.segments, "Rejected overlapping merge");
            return false;
        }
        self.pending.push(merge);
        true
    }

    /// Next merge to execute, if a slot is free
    pub fn next_merge(&mut self) -> Option<OneMerge> {
        if self.running.len() >= self.max_concurrent || self.pending.is_empty() {
            return None;
        }
        let merge = self.pending.remove(0);
        self.running.push(merge.segments.clone());
        Some(merge)
    }

    /// Mark a merge as complete
    pub fn complete_merge(&mut self, segments: &[String]) {
        if let Some(pos) = self.running.iter().position(|running| running == segments) {
            self.running.remove(pos);
        }
    }

    /// Drop merges not yet started
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn has_running(&self) -> bool {
        !self.running.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }

    /// Segments a policy must not select
    pub fn context(&self) -> MergeContext {
        let merging: HashSet<String> = self
            .pending
            .iter()
            .flat_map(|m| m.segments.iter())
            .chain(self.running.iter().flatten())
            .cloned()
            .collect();
        MergeContext::new(merging)
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where merges execute
pub enum MergeScheduler {
    /// On the thread that triggered them
    Serial,
    /// On background worker threads
    Concurrent {
        sender: Option<Sender<Job>>,
        workers: Vec<JoinHandle<()>>,
    },
}

impl MergeScheduler {
    pub fn new(config: &MergeSchedulerConfig) -> Self {
        match config {
            MergeSchedulerConfig::Serial => MergeScheduler::Serial,
            MergeSchedulerConfig::Concurrent { .. } => {
                let threads = config.max_threads();
                let (sender, receiver) = channel::unbounded::<Job>();
                let workers = (0..threads)
                    .filter_map(|i| {
                        let receiver = receiver.clone();
                        thread::Builder::new()
                            .name(format!("tessera-merge-{}", i))
                            .spawn(move || {
                                for job in receiver.iter() {
                                    job();
                                }
                            })
                            .map_err(|e| warn!(error = %e, "Failed to spawn merge thread"))
                            .ok()
                    })
                    .collect();
                MergeScheduler::Concurrent {
                    sender: Some(sender),
                    workers,
                }
            }
        }
    }

    /// Run `job` `copies` times: inline for the serial scheduler, on the
    /// worker threads otherwise
    pub fn dispatch(&self, copies: usize, job: impl Fn() + Send + Sync + Clone + 'static) {
        match self {
            MergeScheduler::Serial => job(),
            MergeScheduler::Concurrent { sender, workers } => {
                let sender = match sender {
                    Some(sender) if !workers.is_empty() => sender,
                    // No workers (spawn failed or shut down): run inline
                    _ => return job(),
                };
                for _ in 0..copies.max(1) {
                    let job = job.clone();
                    if sender.send(Box::new(move || job())).is_err() {
                        warn!("Merge threads are gone, dropping merge job");
                        break;
                    }
                }
            }
        }
    }

    /// Stop accepting jobs and join the workers once queued jobs finish
    pub fn shutdown(&mut self) {
        if let MergeScheduler::Concurrent { sender, workers } = self {
            sender.take();
            for worker in workers.drain(..) {
                if worker.join().is_err() {
                    warn!("Merge thread panicked");
                }
            }
        }
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MergeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeScheduler::Serial => f.write_str("Serial"),
            MergeScheduler::Concurrent { workers, .. } => f
                .debug_struct("Concurrent")
                .field("workers", &workers.len())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::index::merge_policy::MergeReason;

    fn merge(segments: &[&str], score: f64) -> OneMerge {
        OneMerge {
            segments: segments.iter().map(|s| s.to_string()).collect(),
            estimated_bytes: 1000,
            score,
            reason: MergeReason::Natural,
        }
    }

    #[test]
    fn test_merge_queue() {
        let mut queue = MergeQueue::new(2);

        let merge1 = merge(&["_1", "_2"], 50.0);
        let merge2 = merge(&["_3", "_4"], 30.0);

        assert!(queue.register(merge1.clone()));
        assert!(queue.register(merge2));
        assert!(queue.has_pending());

        let first = queue.next_merge();
        assert_eq!(first.as_ref().map(|m| m.segments.clone()), Some(merge1.segments.clone()));
        assert_eq!(queue.running_count(), 1);

        assert!(queue.next_merge().is_some());
        assert_eq!(queue.running_count(), 2);

        // Should not get another merge (at max concurrent)
        assert!(queue.register(merge(&["_5", "_6"], 1.0)));
        assert!(queue.next_merge().is_none());

        queue.complete_merge(&merge1.segments);
        assert_eq!(queue.running_count(), 1);
        assert!(queue.next_merge().is_some());
    }

    #[test]
    fn test_overlapping_merges() {
        let mut queue = MergeQueue::new(2);

        assert!(queue.register(merge(&["_1", "_2"], 50.0)));
        assert!(queue.next_merge().is_some());

        // Overlaps with the running merge (segment _2)
        assert!(!queue.register(merge(&["_2", "_3"], 30.0)));
        assert!(queue.next_merge().is_none());

        // Overlaps with a pending merge
        assert!(queue.register(merge(&["_4", "_5"], 10.0)));
        assert!(!queue.register(merge(&["_5"], 10.0)));

        let ctx = queue.context();
        assert!(ctx.is_merging("_1"));
        assert!(ctx.is_merging("_5"));
        assert!(!ctx.is_merging("_3"));
        assert!(!queue.is_idle());

        queue.clear_pending();
        queue.complete_merge(&["_1".to_string(), "_2".to_string()]);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_serial_runs_inline() {
        let scheduler = MergeScheduler::new(&MergeSchedulerConfig::Serial);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler.dispatch(3, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_runs_on_workers() {
        let mut scheduler = MergeScheduler::new(&MergeSchedulerConfig::Concurrent { max_threads: 2 });
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler.dispatch(3, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.shutdown();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
