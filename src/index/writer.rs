//! The index writer: single owner of an index directory
//!
//! Lifecycle:
//! - `open` takes the directory's write lock and holds it until `close`,
//!   `rollback` or drop
//! - documents, deletes and doc values updates are buffered, then flushed
//!   into new segments
//!   when the buffer grows past its limits or on `flush`/`commit`
//! - merges selected by the merge policy run on the merge scheduler and
//!   atomically replace their inputs in the in-memory segment list
//! - `commit` makes the current segment list durable; `rollback` returns
//!   to the last commit
//!
//! All mutations of the segment list happen under one mutex. Merges read
//! sealed segments outside it and only take it to publish their result.
//! Lock order: writer state, then the file deleter.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use roaring::RoaringBitmap;
use tracing::{debug, error, info, warn};

use super::buffer::DocumentsBuffer;
use super::deletes::{BufferedDeletes, BufferedUpdates, DeleteQuery, TermsQuery};
use super::file_deleter::IndexFileDeleter;
use super::file_names::{
    doc_values_updates_file_name, last_commit_generation, live_docs_file_name,
    pending_segments_file_name,
};
use super::merge_policy::{MergeContext, MergeSpecification, MergeTrigger, OneMerge};
use super::merge_scheduler::{MergeQueue, MergeScheduler};
use super::merger::{merge_segments, MergeInput, MergedSegment};
use super::multi_terms::DROPPED;
use super::reader::DirectoryReader;
use super::segment_info::{
    SegmentCommitInfo, SegmentInfo, SOURCE_ADD_INDEXES, SOURCE_FLUSH, SOURCE_KEY, SOURCE_MERGE,
};
use super::segment_infos::{SegmentInfos, SegmentInfosHolder};
use super::segment_reader::{LeafReader, SegmentParts, SegmentReader};
use super::types::{DocId, WriterState, MAX_DOCS};
use crate::codec::{self, Codec, DocValueUpdate, DocValuesUpdates, SegmentSource};
use crate::config::{IndexWriterConfig, OpenMode};
use crate::directory::{delete_with_prefix, Directory, Lock, WRITE_LOCK_NAME};
use crate::error::{Result, TesseraError};
use crate::models::{DocValuesType, Document, Term};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Open,
    /// Shutting down: waiting for running merges
    Closing,
    Closed,
    RolledBack,
}

/// A segment of the in-memory segment list with its current deletions
/// and doc values updates
struct PooledSegment {
    /// The segment as written by the codec
    base: Arc<dyn SegmentSource>,
    /// `base` seen through `updates`
    core: Arc<dyn SegmentSource>,
    /// Replaced, never mutated, so readers can share it
    deleted: Arc<RoaringBitmap>,
    /// Deletions not yet written to a live docs file
    dirty: bool,
    updates: Arc<DocValuesUpdates>,
    /// Updates not yet written to an update file
    updates_dirty: bool,
}

impl PooledSegment {
    fn new(base: Arc<dyn SegmentSource>, deleted: RoaringBitmap) -> Self {
        Self {
            core: base.clone(),
            base,
            dirty: !deleted.is_empty(),
            deleted: Arc::new(deleted),
            updates: Arc::new(DocValuesUpdates::new()),
            updates_dirty: false,
        }
    }

    fn from_parts(parts: SegmentParts) -> Self {
        Self {
            core: parts.source(),
            base: parts.base,
            deleted: parts.deleted.unwrap_or_default(),
            dirty: false,
            updates: parts.updates,
            updates_dirty: false,
        }
    }

    /// Layer `more` over the current updates
    fn add_updates(&mut self, more: &DocValuesUpdates) {
        let mut updates = (*self.updates).clone();
        updates.apply(more);
        self.updates = Arc::new(updates);
        self.core = codec::with_updates(self.base.clone(), &self.updates);
        self.updates_dirty = true;
    }
}

/// Phase one of a commit, waiting for phase two
struct PendingCommit {
    infos: SegmentInfos,
    /// Files pinned until the commit lands or is abandoned
    files: Vec<String>,
}

/// A merge taken off the queue
struct MergeJob {
    merge: OneMerge,
    name: String,
    /// Writer epoch when the merge started; rollback and delete_all bump it
    epoch: u64,
    inputs: Vec<MergeInput>,
    /// Doc values updates of each input when the merge started
    updates: Vec<Arc<DocValuesUpdates>>,
}

struct WriterShared {
    lifecycle: Lifecycle,
    lock: Option<Box<dyn Lock>>,
    infos: SegmentInfos,
    pool: HashMap<String, PooledSegment>,
    buffer: DocumentsBuffer,
    deletes: BufferedDeletes,
    updates: BufferedUpdates,
    queue: MergeQueue,
    epoch: u64,
    pending_commit: Option<PendingCommit>,
    last_merge_error: Option<TesseraError>,
    /// Version of the infos last committed by, or opened by, this writer;
    /// `None` until the index has a commit this writer agrees with
    committed_version: Option<u64>,
    /// Highest commit generation used in the directory
    last_generation: u64,
}

impl WriterShared {
    fn has_changes(&self) -> bool {
        !self.buffer.is_empty()
            || !self.deletes.is_empty()
            || !self.updates.is_empty()
            || self.committed_version != Some(self.infos.version)
    }
}

pub(crate) struct WriterInner {
    dir: Arc<dyn Directory>,
    config: IndexWriterConfig,
    codec: Arc<dyn Codec>,
    state: Mutex<WriterShared>,
    merges_changed: Condvar,
    deleter: Mutex<IndexFileDeleter>,
    /// Bumped on every change visible to a near-real-time reader
    change_version: AtomicU64,
    closed: AtomicBool,
    committed: SegmentInfosHolder,
}

/// Adds, updates and deletes documents, and owns commits.
///
/// At most one writer can be open per directory.
pub struct IndexWriter {
    inner: Arc<WriterInner>,
    scheduler: MergeScheduler,
}

fn diagnostics(source: &str) -> BTreeMap<String, String> {
    let mut diagnostics = BTreeMap::new();
    diagnostics.insert(SOURCE_KEY.to_string(), source.to_string());
    diagnostics.insert("version".to_string(), crate::VERSION.to_string());
    diagnostics
}

impl IndexWriter {
    /// Open a writer, taking the directory's write lock.
    ///
    /// Fails with `LockHeld` if another writer holds it. The lock is
    /// released again whenever opening fails.
    pub fn open(dir: Arc<dyn Directory>, config: IndexWriterConfig) -> Result<Self> {
        let lock = dir.obtain_lock(WRITE_LOCK_NAME).map_err(|e| {
            warn!(directory = ?dir, error = %e, "Cannot obtain write lock");
            e
        })?;

        let codec = codec::lookup(&config.codec)
            .ok_or_else(|| TesseraError::InvalidArgument(format!("unknown codec {}", config.codec)))?;

        let files = dir.list_all()?;
        let latest = last_commit_generation(&files);
        let (infos, committed) = match (config.open_mode, latest) {
            (OpenMode::Append, None) => {
                return Err(TesseraError::IndexNotFound(format!("{:?}", dir)));
            }
            (_, None) => (SegmentInfos::new(), SegmentInfos::new()),
            (OpenMode::Create, Some(_)) => {
                // Keep the counter so new segment names never collide
                let committed = SegmentInfos::read_latest(dir.as_ref())?;
                let mut infos = committed.clone();
                infos.segments.clear();
                infos.user_data.clear();
                infos.changed();
                (infos, committed)
            }
            (_, Some(_)) => {
                let committed = SegmentInfos::read_latest(dir.as_ref())?;
                (committed.clone(), committed)
            }
        };

        let mut pool = HashMap::with_capacity(infos.len());
        for info in infos.iter() {
            let parts = SegmentParts::open(dir.as_ref(), info)?;
            pool.insert(info.name().to_string(), PooledSegment::from_parts(parts));
        }

        let deleter = IndexFileDeleter::open(dir.clone(), config.deletion_policy.clone(), &infos)?;

        info!(
            generation = committed.generation,
            segments = infos.len(),
            mode = ?config.open_mode,
            "Opened index writer"
        );

        let committed_version = latest.map(|_| committed.version);
        let state = WriterShared {
            lifecycle: Lifecycle::Open,
            lock: Some(lock),
            infos,
            pool,
            buffer: DocumentsBuffer::new(config.analyzer.clone()),
            deletes: BufferedDeletes::new(),
            updates: BufferedUpdates::new(),
            queue: MergeQueue::new(config.merge_scheduler.max_threads()),
            epoch: 0,
            pending_commit: None,
            last_merge_error: None,
            committed_version,
            last_generation: latest.unwrap_or(0),
        };

        let scheduler = MergeScheduler::new(&config.merge_scheduler);
        let inner = Arc::new(WriterInner {
            dir,
            codec,
            state: Mutex::new(state),
            merges_changed: Condvar::new(),
            deleter: Mutex::new(deleter),
            change_version: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            committed: SegmentInfosHolder::new(committed),
            config,
        });
        Ok(Self { inner, scheduler })
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.inner.dir
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.inner.config
    }

    pub fn state(&self) -> WriterState {
        let state = self.inner.state.lock();
        match state.lifecycle {
            Lifecycle::Open if state.has_changes() => WriterState::OpenDirty,
            Lifecycle::Open => WriterState::OpenClean,
            Lifecycle::Closing | Lifecycle::Closed => WriterState::Closed,
            Lifecycle::RolledBack => WriterState::RolledBack,
        }
    }

    /// Buffer a document
    pub fn add_document(&self, doc: &Document) -> Result<()> {
        let flushed = {
            let mut guard = self.inner.lock_open()?;
            let state = &mut *guard;
            self.inner.ensure_capacity(state, 1)?;
            state.buffer.add_document(doc)?;
            self.inner.bump();
            self.inner.maybe_flush(state)?
        };
        if flushed {
            self.trigger_merges(MergeTrigger::SegmentFlush)?;
        }
        Ok(())
    }

    /// Atomically delete every document containing `term` and add `doc`
    pub fn update_document(&self, term: Term, doc: &Document) -> Result<()> {
        let flushed = {
            let mut guard = self.inner.lock_open()?;
            let state = &mut *guard;
            self.inner.ensure_capacity(state, 1)?;
            let upto = state.buffer.max_doc();
            state.buffer.add_document(doc)?;
            // Applies to docs buffered before the new one
            state.deletes.add(Arc::new(TermsQuery::single(term)), upto);
            self.inner.bump();
            self.inner.maybe_flush(state)?
        };
        if flushed {
            self.trigger_merges(MergeTrigger::SegmentFlush)?;
        }
        Ok(())
    }

    /// Delete every document containing `term`
    pub fn delete_documents(&self, term: Term) -> Result<()> {
        self.delete_by_query(Arc::new(TermsQuery::single(term)))
    }

    /// Delete every document containing any of `terms`
    pub fn delete_terms(&self, terms: Vec<Term>) -> Result<()> {
        self.delete_by_query(Arc::new(TermsQuery::new(terms)))
    }

    /// Delete every document the query matches, among the documents
    /// added before this call
    pub fn delete_by_query(&self, query: Arc<dyn DeleteQuery>) -> Result<()> {
        let mut state = self.inner.lock_open()?;
        let upto = state.buffer.max_doc();
        debug!(query = ?query, upto, "Buffered delete");
        state.deletes.add(query, upto);
        self.inner.bump();
        Ok(())
    }

    /// Set the numeric doc value of `field` on every document containing
    /// `term`, among the documents added before this call
    pub fn update_numeric_doc_value(&self, term: Term, field: &str, value: i64) -> Result<()> {
        self.update_doc_value(term, field, DocValueUpdate::Numeric(value))
    }

    /// Set the binary doc value of `field` on every document containing
    /// `term`, among the documents added before this call
    pub fn update_binary_doc_value(&self, term: Term, field: &str, value: Vec<u8>) -> Result<()> {
        self.update_doc_value(term, field, DocValueUpdate::Binary(value))
    }

    fn update_doc_value(&self, term: Term, field: &str, value: DocValueUpdate) -> Result<()> {
        let mut guard = self.inner.lock_open()?;
        let state = &mut *guard;
        self.inner.check_updatable(state, field, value.doc_values_type())?;
        let upto = state.buffer.max_doc();
        debug!(term = ?term, field, upto, "Buffered doc values update");
        state.updates.add(term, field, value, upto);
        self.inner.bump();
        Ok(())
    }

    /// Add the live documents of the latest commit of every index in
    /// `dirs` as one new segment.
    ///
    /// The source indexes are write-locked while they are read, so no
    /// writer may be open on them. Buffered changes are flushed first.
    pub fn add_indexes(&self, dirs: &[Arc<dyn Directory>]) -> Result<()> {
        let own = Arc::as_ptr(&self.inner.dir) as *const ();
        if dirs.iter().any(|dir| Arc::as_ptr(dir) as *const () == own) {
            return Err(TesseraError::InvalidArgument(
                "cannot add an index to itself".to_string(),
            ));
        }

        let mut locks = Vec::with_capacity(dirs.len());
        for dir in dirs {
            locks.push(dir.obtain_lock(WRITE_LOCK_NAME)?);
        }
        let mut inputs = Vec::new();
        let mut live_docs = 0u64;
        for dir in dirs {
            let infos = SegmentInfos::read_latest(dir.as_ref())?;
            for info in infos.iter() {
                let parts = SegmentParts::open(dir.as_ref(), info)?;
                live_docs += info.num_docs() as u64;
                inputs.push(MergeInput {
                    name: info.name().to_string(),
                    core: parts.source(),
                    deleted: parts.deleted.unwrap_or_default(),
                });
            }
        }
        if live_docs == 0 {
            debug!(indexes = dirs.len(), "No documents to add");
            return Ok(());
        }

        let name = {
            let mut guard = self.inner.lock_open()?;
            let state = &mut *guard;
            self.inner.ensure_capacity(state, live_docs)?;
            self.inner.flush_locked(state)?;
            state.infos.next_segment_name()
        };
        info!(segment = %name, indexes = dirs.len(), segments = inputs.len(), "Adding indexes");
        let merged = merge_segments(self.inner.dir.as_ref(), self.inner.codec.as_ref(), &name, inputs)?;
        drop(locks);

        {
            let mut guard = match self.inner.lock_open() {
                Ok(guard) => guard,
                Err(e) => {
                    self.inner.discard_merge(&name);
                    return Err(e);
                }
            };
            let state = &mut *guard;
            if let Err(e) = self.inner.ensure_capacity(state, merged.written.max_doc as u64) {
                self.inner.discard_merge(&name);
                return Err(e);
            }
            let info = SegmentCommitInfo::new(SegmentInfo {
                name: name.clone(),
                max_doc: merged.written.max_doc,
                codec: self.inner.codec.name().to_string(),
                files: merged.written.files,
                size_bytes: merged.written.size_bytes,
                diagnostics: diagnostics(SOURCE_ADD_INDEXES),
            });
            state
                .pool
                .insert(name.clone(), PooledSegment::new(merged.core, RoaringBitmap::new()));
            state.infos.segments.push(info);
            state.infos.changed();
            self.inner.bump();
            self.inner.deleter.lock().checkpoint(&state.infos, false);
        }
        info!(segment = %name, docs = live_docs, "Added indexes");
        self.trigger_merges(MergeTrigger::Explicit)
    }

    /// Drop every segment and everything buffered
    pub fn delete_all(&self) -> Result<()> {
        let mut guard = self.inner.lock_open()?;
        guard.epoch += 1;
        guard.queue.clear_pending();
        while guard.queue.has_running() {
            self.inner.merges_changed.wait(&mut guard);
        }
        if guard.lifecycle != Lifecycle::Open {
            return Err(TesseraError::AlreadyClosed);
        }
        let state = &mut *guard;
        state.buffer.clear();
        state.deletes.clear();
        state.updates.clear();
        state.infos.segments.clear();
        state.pool.clear();
        state.infos.changed();
        self.inner.bump();
        self.inner.deleter.lock().checkpoint(&state.infos, false);
        info!("Deleted all documents");
        Ok(())
    }

    /// Record user data with the next commit
    pub fn set_commit_data(&self, data: BTreeMap<String, String>) -> Result<()> {
        let mut state = self.inner.lock_open()?;
        state.infos.user_data = data;
        state.infos.changed();
        Ok(())
    }

    /// User data the next commit will record
    pub fn commit_data(&self) -> BTreeMap<String, String> {
        self.inner.state.lock().infos.user_data.clone()
    }

    /// Documents in the index and the buffer, deleted ones included
    pub fn max_doc(&self) -> DocId {
        let state = self.inner.state.lock();
        (state.infos.total_max_doc() + state.buffer.max_doc() as u64) as DocId
    }

    /// Live documents; buffered deletes are not counted until flushed
    pub fn num_docs(&self) -> DocId {
        let state = self.inner.state.lock();
        (state.infos.total_num_docs() + state.buffer.num_docs() as u64) as DocId
    }

    /// Snapshot of the in-memory segment list
    pub fn segment_infos(&self) -> SegmentInfos {
        self.inner.state.lock().infos.clone()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.state.lock().infos.len()
    }

    /// Generation of the last commit this writer knows of
    pub fn committed_generation(&self) -> u64 {
        self.inner.committed.generation()
    }

    /// Flush buffered documents and deletes into a new segment
    pub fn flush(&self) -> Result<()> {
        let flushed = {
            let mut guard = self.inner.lock_open()?;
            self.inner.flush_locked(&mut guard)?
        };
        if flushed {
            self.trigger_merges(MergeTrigger::SegmentFlush)?;
        }
        Ok(())
    }

    /// Phase one of a two-phase commit: flush and durably write
    /// `pending_segments_N`. Finish with `commit`, abandon with `rollback`.
    pub fn prepare_commit(&self) -> Result<()> {
        let mut guard = self.inner.lock_open()?;
        self.inner.prepare_commit_locked(&mut guard)
    }

    /// Make every change so far durable
    pub fn commit(&self) -> Result<()> {
        let mut guard = self.inner.lock_open()?;
        let state = &mut *guard;
        if state.pending_commit.is_none() {
            if !state.has_changes() {
                debug!("Nothing to commit");
                return Ok(());
            }
            self.inner.prepare_commit_locked(state)?;
        }
        self.inner.finish_commit(state)
    }

    /// Discard everything since the last commit and release the lock
    pub fn rollback(&self) -> Result<()> {
        self.inner.shutdown(Lifecycle::RolledBack)
    }

    /// Commit pending changes (unless `commit_on_close` is off), wait for
    /// merges and release the lock. A merge failure recorded while
    /// running is returned after the writer is closed.
    pub fn close(&self) -> Result<()> {
        if !self.inner.config.commit_on_close {
            self.wait_for_merges();
            return self.inner.shutdown(Lifecycle::Closed);
        }

        {
            let mut guard = match self.inner.lock_open() {
                Ok(guard) => guard,
                Err(TesseraError::AlreadyClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            self.inner.flush_locked(&mut guard)?;
        }
        self.trigger_merges(MergeTrigger::Closing)?;
        self.wait_for_merges();

        let merge_error = {
            let mut guard = self.inner.state.lock();
            if guard.lifecycle != Lifecycle::Open {
                return Ok(());
            }
            let state = &mut *guard;
            if state.pending_commit.is_none() && state.has_changes() {
                self.inner.prepare_commit_locked(state)?;
            }
            self.inner.finish_commit(state)?;
            state.lifecycle = Lifecycle::Closed;
            state.queue.clear_pending();
            state.lock = None;
            self.inner.closed.store(true, Ordering::SeqCst);
            state.last_merge_error.take()
        };
        self.inner.merges_changed.notify_all();
        info!("Closed index writer");

        match merge_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Near-real-time reader over everything added so far, without
    /// committing
    pub fn reader(&self) -> Result<DirectoryReader> {
        let (reader, flushed) = self.inner.nrt_reader()?;
        if flushed {
            self.trigger_merges(MergeTrigger::SegmentFlush)?;
        }
        Ok(reader)
    }

    /// Ask the merge policy for merges now
    pub fn maybe_merge(&self) -> Result<()> {
        self.trigger_merges(MergeTrigger::Explicit)
    }

    /// Merge until the policy considers the index to have at most
    /// `max_segments` segments, or declines to merge further
    pub fn force_merge(&self, max_segments: usize) -> Result<()> {
        if max_segments == 0 {
            return Err(TesseraError::InvalidArgument(
                "max_segments must be at least 1".to_string(),
            ));
        }
        info!(max_segments, "Forcing merge");
        let policy = self.inner.config.merge_policy.clone();
        self.run_forced(|infos, ctx| policy.find_forced_merges(infos, max_segments, ctx))
    }

    /// Merge away segments with many deleted docs
    pub fn force_merge_deletes(&self) -> Result<()> {
        info!("Forcing merge of deletes");
        let policy = self.inner.config.merge_policy.clone();
        self.run_forced(|infos, ctx| policy.find_forced_deletes_merges(infos, ctx))
    }

    fn run_forced(
        &self,
        find: impl Fn(&SegmentInfos, &MergeContext) -> Option<MergeSpecification>,
    ) -> Result<()> {
        {
            let mut guard = self.inner.lock_open()?;
            self.inner.flush_locked(&mut guard)?;
            guard.last_merge_error = None;
        }
        loop {
            let registered = {
                let mut guard = self.inner.lock_open()?;
                let state = &mut *guard;
                if let Some(e) = state.last_merge_error.take() {
                    return Err(e);
                }
                let ctx = state.queue.context();
                let registered = match find(&state.infos, &ctx) {
                    Some(spec) => self.inner.register(state, spec),
                    None => 0,
                };
                if registered == 0 && state.queue.is_idle() {
                    break;
                }
                registered
            };
            if registered > 0 {
                self.dispatch(registered);
            }
            self.wait_for_merges();
        }
        Ok(())
    }

    /// Block until no merge is pending or running
    pub fn wait_for_merges(&self) {
        let mut guard = self.inner.state.lock();
        loop {
            if !guard.queue.has_running() {
                if !guard.queue.has_pending() || guard.lifecycle != Lifecycle::Open {
                    break;
                }
                MutexGuard::unlocked(&mut guard, || self.dispatch(1));
                if guard.queue.has_running() || !guard.queue.has_pending() {
                    continue;
                }
            }
            self.inner
                .merges_changed
                .wait_for(&mut guard, Duration::from_millis(100));
        }
    }

    fn trigger_merges(&self, trigger: MergeTrigger) -> Result<()> {
        let registered = {
            let mut guard = self.inner.lock_open()?;
            let state = &mut *guard;
            let ctx = state.queue.context();
            match self.inner.config.merge_policy.find_merges(trigger, &state.infos, &ctx) {
                Some(spec) => self.inner.register(state, spec),
                None => 0,
            }
        };
        if registered > 0 {
            self.dispatch(registered);
        }
        Ok(())
    }

    fn dispatch(&self, merges: usize) {
        let inner = self.inner.clone();
        self.scheduler.dispatch(merges, move || inner.run_pending_merges());
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if self.inner.config.commit_on_close && !self.inner.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                warn!(error = %e, "Commit on drop failed, discarding pending changes");
            }
        }
        if let Err(e) = self.inner.shutdown(Lifecycle::Closed) {
            warn!(error = %e, "Failed to shut down index writer");
        }
        self.scheduler.shutdown();
    }
}

impl std::fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriter")
            .field("directory", &self.inner.dir)
            .field("state", &self.state())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl WriterInner {
    fn lock_open(&self) -> Result<MutexGuard<'_, WriterShared>> {
        let state = self.state.lock();
        if state.lifecycle != Lifecycle::Open {
            return Err(TesseraError::AlreadyClosed);
        }
        Ok(state)
    }

    fn bump(&self) {
        self.change_version.fetch_add(1, Ordering::SeqCst);
    }

    fn ensure_capacity(&self, state: &WriterShared, extra: u64) -> Result<()> {
        let requested = state.infos.total_max_doc() + state.buffer.max_doc() as u64 + extra;
        if requested > MAX_DOCS as u64 {
            return Err(TesseraError::CapacityExceeded {
                requested,
                limit: MAX_DOCS,
            });
        }
        Ok(())
    }

    fn maybe_flush(&self, state: &mut WriterShared) -> Result<bool> {
        let limits = &self.config.buffer;
        if state.buffer.max_doc() as usize >= limits.max_buffered_docs
            || state.buffer.ram_bytes_used() >= limits.ram_buffer_bytes
        {
            self.flush_locked(state)
        } else {
            Ok(false)
        }
    }

    /// Turn the buffer into a segment and apply buffered deletes.
    /// Returns true when a new segment was published.
    ///
    /// If writing the segment fails nothing is published and the buffer
    /// is kept.
    fn flush_locked(&self, state: &mut WriterShared) -> Result<bool> {
        if state.buffer.is_empty() && state.deletes.is_empty() && state.updates.is_empty() {
            return Ok(false);
        }

        let in_buffer = state.deletes.buffered_matches(&state.buffer)?;
        for doc in in_buffer.iter() {
            state.buffer.delete(doc);
        }

        let mut segment_deletes = Vec::new();
        if !state.deletes.is_empty() {
            for info in state.infos.iter() {
                if let Some(pooled) = state.pool.get(info.name()) {
                    let mut matches = state.deletes.segment_matches(pooled.core.as_ref())?;
                    matches -= pooled.deleted.as_ref();
                    if !matches.is_empty() {
                        segment_deletes.push((info.name().to_string(), matches));
                    }
                }
            }
        }

        let buffer_updates = state.updates.buffered_updates(&state.buffer)?;
        let mut segment_updates = Vec::new();
        if !state.updates.is_empty() {
            for info in state.infos.iter() {
                if let Some(pooled) = state.pool.get(info.name()) {
                    let found = state.updates.segment_updates(pooled.core.as_ref())?;
                    if !found.is_empty() {
                        segment_updates.push((info.name().to_string(), found));
                    }
                }
            }
        }

        let flushed = if state.buffer.num_docs() > 0 {
            Some(self.write_buffer(state)?)
        } else {
            None
        };

        let mut deleted_docs = 0u64;
        for (name, matches) in segment_deletes {
            if let Some(pooled) = state.pool.get_mut(&name) {
                deleted_docs += matches.len();
                let mut deleted = (*pooled.deleted).clone();
                deleted |= matches;
                let count = deleted.len() as u32;
                pooled.deleted = Arc::new(deleted);
                pooled.dirty = true;
                if let Some(info) = state.infos.get_mut(&name) {
                    info.del_count = count;
                }
            }
        }
        if deleted_docs > 0 {
            debug!(docs = deleted_docs, "Applied deletes to flushed segments");
        }
        for (name, found) in segment_updates {
            if let Some(pooled) = state.pool.get_mut(&name) {
                debug!(segment = %name, values = found.len(), "Applied doc values updates");
                pooled.add_updates(&found);
            }
        }

        let published = flushed.is_some();
        if let Some((info, mut pooled)) = flushed {
            if !buffer_updates.is_empty() {
                pooled.add_updates(&buffer_updates);
            }
            state.pool.insert(info.name().to_string(), pooled);
            state.infos.segments.push(info);
        }
        self.drop_fully_deleted(state);

        state.buffer.clear();
        state.deletes.clear();
        state.updates.clear();
        state.infos.changed();
        self.bump();
        self.deleter.lock().checkpoint(&state.infos, false);
        Ok(published)
    }

    fn write_buffer(&self, state: &mut WriterShared) -> Result<(SegmentCommitInfo, PooledSegment)> {
        let name = state.infos.next_segment_name();
        let dir = self.dir.as_ref();
        let written = match self.codec.write_segment(dir, &name, &state.buffer) {
            Ok(written) => written,
            Err(e) => {
                delete_with_prefix(dir, &format!("{}.", name));
                error!(segment = %name, error = %e, "Flush failed");
                return Err(TesseraError::durability("flush", e));
            }
        };
        let core = match self.codec.open_segment(dir, &name, written.max_doc) {
            Ok(core) => core,
            Err(e) => {
                delete_with_prefix(dir, &format!("{}.", name));
                return Err(e);
            }
        };

        let deleted = state.buffer.deleted_docs().clone();
        let mut info = SegmentCommitInfo::new(SegmentInfo {
            name: name.clone(),
            max_doc: written.max_doc,
            codec: self.codec.name().to_string(),
            files: written.files,
            size_bytes: written.size_bytes,
            diagnostics: diagnostics(SOURCE_FLUSH),
        });
        info.del_count = deleted.len() as u32;
        info!(
            segment = %name,
            docs = info.max_doc(),
            deleted = info.del_count,
            bytes = info.size_bytes(),
            "Flushed segment"
        );
        Ok((info, PooledSegment::new(core, deleted)))
    }

    /// Remove segments without live docs, unless a merge is reading them
    fn drop_fully_deleted(&self, state: &mut WriterShared) {
        let ctx = state.queue.context();
        let doomed: HashSet<String> = state
            .infos
            .iter()
            .filter(|s| s.num_docs() == 0 && !ctx.is_merging(s.name()))
            .map(|s| s.name().to_string())
            .collect();
        if doomed.is_empty() {
            return;
        }
        for name in &doomed {
            debug!(segment = %name, "Dropping fully deleted segment");
            state.pool.remove(name);
        }
        state.infos.segments.retain(|s| !doomed.contains(s.name()));
    }

    /// Persist deletions not yet on disk, each as a new deletion
    /// generation of its segment
    fn write_live_docs(&self, state: &mut WriterShared) -> Result<()> {
        let mut result = Ok(());
        let mut written = 0;
        for info in state.infos.segments.iter_mut() {
            let pooled = match state.pool.get_mut(info.name()) {
                Some(pooled) if pooled.dirty => pooled,
                _ => continue,
            };
            let mut del_gen = info.del_gen + 1;
            while self.dir.file_exists(&live_docs_file_name(info.name(), del_gen)) {
                del_gen += 1;
            }
            if let Err(e) = self.codec.write_live_docs(self.dir.as_ref(), info.name(), del_gen, &pooled.deleted) {
                let _ = self.dir.delete_file(&live_docs_file_name(info.name(), del_gen));
                result = Err(TesseraError::durability("write live docs", e));
                break;
            }
            info.del_gen = del_gen;
            info.del_count = pooled.deleted.len() as u32;
            pooled.dirty = false;
            written += 1;
        }
        if written > 0 {
            debug!(segments = written, "Wrote live docs");
            state.infos.changed();
            self.deleter.lock().checkpoint(&state.infos, false);
        }
        result
    }

    /// Persist doc values updates not yet on disk, each as a new update
    /// generation of its segment
    fn write_doc_values_updates(&self, state: &mut WriterShared) -> Result<()> {
        let mut written = 0;
        for info in state.infos.segments.iter_mut() {
            let pooled = match state.pool.get_mut(info.name()) {
                Some(pooled) if pooled.updates_dirty => pooled,
                _ => continue,
            };
            let mut dv_gen = info.dv_gen + 1;
            while self.dir.file_exists(&doc_values_updates_file_name(info.name(), dv_gen)) {
                dv_gen += 1;
            }
            let result = self
                .codec
                .write_doc_values_updates(self.dir.as_ref(), info.name(), dv_gen, &pooled.updates);
            if let Err(e) = result {
                let _ = self.dir.delete_file(&doc_values_updates_file_name(info.name(), dv_gen));
                if written > 0 {
                    state.infos.changed();
                    self.deleter.lock().checkpoint(&state.infos, false);
                }
                return Err(TesseraError::durability("write doc values updates", e));
            }
            info.dv_gen = dv_gen;
            pooled.updates_dirty = false;
            written += 1;
        }
        if written > 0 {
            debug!(segments = written, "Wrote doc values updates");
            state.infos.changed();
            self.deleter.lock().checkpoint(&state.infos, false);
        }
        Ok(())
    }

    /// Reject updates of fields the index does not hold doc values of
    /// that type for
    fn check_updatable(&self, state: &WriterShared, field: &str, kind: DocValuesType) -> Result<()> {
        let sources = std::iter::once(state.buffer.field_infos())
            .chain(state.pool.values().map(|pooled| pooled.core.field_infos()));
        let mut found = false;
        for infos in sources {
            match infos.get(field).and_then(|f| f.doc_values) {
                Some(existing) if existing != kind => {
                    return Err(TesseraError::InvalidArgument(format!(
                        "field {} has {:?} doc values, cannot update with {:?}",
                        field, existing, kind
                    )));
                }
                Some(_) => found = true,
                None => {}
            }
        }
        if !found {
            return Err(TesseraError::InvalidArgument(format!(
                "field {} has no {:?} doc values to update",
                field, kind
            )));
        }
        Ok(())
    }

    fn prepare_commit_locked(&self, state: &mut WriterShared) -> Result<()> {
        if state.pending_commit.is_some() {
            return Err(TesseraError::InvalidArgument(
                "prepare_commit was already called".to_string(),
            ));
        }
        self.flush_locked(state)?;
        self.write_live_docs(state)?;
        self.write_doc_values_updates(state)?;

        let mut infos = state.infos.clone();
        let files: Vec<String> = infos.files(false).into_iter().collect();
        self.dir
            .sync(&files)
            .map_err(|e| TesseraError::durability("sync", e))?;
        let generation = state.last_generation + 1;
        infos.write_pending(self.dir.as_ref(), generation)?;
        state.last_generation = generation;
        infos.generation = generation;

        self.deleter.lock().incref(files.iter());
        debug!(generation, segments = infos.len(), "Prepared commit");
        state.pending_commit = Some(PendingCommit { infos, files });
        Ok(())
    }

    fn finish_commit(&self, state: &mut WriterShared) -> Result<()> {
        let pending = match state.pending_commit.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };
        let generation = pending.infos.generation;

        let mut deleter = self.deleter.lock();
        if let Err(e) = SegmentInfos::finish_commit(self.dir.as_ref(), generation) {
            error!(generation, error = %e, "Commit failed");
            let _ = self.dir.delete_file(&pending_segments_file_name(generation));
            deleter.decref(pending.files.iter());
            return Err(e);
        }
        deleter.checkpoint(&state.infos, false);
        deleter.add_commit(&pending.infos);
        deleter.decref(pending.files.iter());
        drop(deleter);

        state.committed_version = Some(pending.infos.version);
        state.infos.generation = generation;
        info!(generation, segments = pending.infos.len(), "Committed");
        self.committed.store(pending.infos);
        Ok(())
    }

    /// Discard uncommitted changes, return to the last commit and
    /// release the write lock
    fn shutdown(&self, end: Lifecycle) -> Result<()> {
        let mut guard = self.state.lock();
        if guard.lifecycle != Lifecycle::Open {
            return Ok(());
        }
        guard.lifecycle = Lifecycle::Closing;
        guard.epoch += 1;
        guard.queue.clear_pending();
        while guard.queue.has_running() {
            self.merges_changed.wait(&mut guard);
        }

        let state = &mut *guard;
        state.buffer.clear();
        state.deletes.clear();
        state.updates.clear();
        let committed = self.committed.snapshot();

        let mut deleter = self.deleter.lock();
        if let Some(pending) = state.pending_commit.take() {
            let _ = self
                .dir
                .delete_file(&pending_segments_file_name(pending.infos.generation));
            deleter.decref(pending.files.iter());
        }
        state.infos.segments = committed.segments.clone();
        state.infos.user_data = committed.user_data.clone();
        state.infos.generation = committed.generation;
        state.infos.changed();
        state.pool.clear();
        deleter.checkpoint(&state.infos, false);
        deleter.refresh();
        drop(deleter);

        state.lifecycle = end;
        state.lock = None;
        self.closed.store(true, Ordering::SeqCst);
        self.bump();
        drop(guard);
        self.merges_changed.notify_all();

        match end {
            Lifecycle::RolledBack => info!(generation = committed.generation, "Rolled back"),
            _ => info!("Closed index writer without commit"),
        }
        Ok(())
    }

    fn register(&self, state: &mut WriterShared, spec: MergeSpecification) -> usize {
        let mut registered = 0;
        for merge in spec.merges {
            let (segments, reason, bytes) = (merge.segments.len(), merge.reason, merge.estimated_bytes);
            if state.queue.register(merge) {
                info!(segments, reason = ?reason, bytes, "Selected merge");
                registered += 1;
            }
        }
        registered
    }

    /// Execute queued merges until none is left or every slot is busy
    fn run_pending_merges(&self) {
        loop {
            let job = {
                let mut guard = self.state.lock();
                if guard.lifecycle != Lifecycle::Open {
                    return;
                }
                let state = &mut *guard;
                let merge = match state.queue.next_merge() {
                    Some(merge) => merge,
                    None => return,
                };
                match self.start_merge(state, merge) {
                    Some(job) => job,
                    None => {
                        drop(guard);
                        self.merges_changed.notify_all();
                        continue;
                    }
                }
            };

            let result = merge_segments(
                self.dir.as_ref(),
                self.codec.as_ref(),
                &job.name,
                job.inputs.clone(),
            );

            let mut guard = self.state.lock();
            let state = &mut *guard;
            let succeeded = match result {
                Ok(merged) => {
                    self.commit_merge(state, &job, merged);
                    true
                }
                Err(e) => {
                    error!(segment = %job.name, error = %e, "Merge failed");
                    state.last_merge_error = Some(e);
                    false
                }
            };
            state.queue.complete_merge(&job.merge.segments);
            if succeeded && state.lifecycle == Lifecycle::Open {
                let ctx = state.queue.context();
                if let Some(spec) =
                    self.config
                        .merge_policy
                        .find_merges(MergeTrigger::MergeFinished, &state.infos, &ctx)
                {
                    self.register(state, spec);
                }
            }
            drop(guard);
            self.merges_changed.notify_all();
        }
    }

    fn start_merge(&self, state: &mut WriterShared, merge: OneMerge) -> Option<MergeJob> {
        let mut inputs = Vec::with_capacity(merge.segments.len());
        let mut updates = Vec::with_capacity(merge.segments.len());
        for name in &merge.segments {
            match (state.infos.get(name), state.pool.get(name)) {
                (Some(_), Some(pooled)) => {
                    inputs.push(MergeInput {
                        name: name.clone(),
                        core: pooled.core.clone(),
                        deleted: pooled.deleted.clone(),
                    });
                    updates.push(pooled.updates.clone());
                }
                _ => {
                    debug!(segment = %name, "Merge input is gone, skipping merge");
                    state.queue.complete_merge(&merge.segments);
                    return None;
                }
            }
        }
        let name = state.infos.next_segment_name();
        info!(
            segment = %name,
            inputs = inputs.len(),
            reason = ?merge.reason,
            "Starting merge"
        );
        Some(MergeJob {
            merge,
            name,
            epoch: state.epoch,
            inputs,
            updates,
        })
    }

    /// Swap a finished merge into the segment list, carrying over
    /// deletions and doc values updates that happened while it ran
    fn commit_merge(&self, state: &mut WriterShared, job: &MergeJob, merged: MergedSegment) {
        let stale = state.lifecycle != Lifecycle::Open
            || state.epoch != job.epoch
            || job.inputs.iter().any(|i| state.infos.get(&i.name).is_none());
        if stale {
            debug!(segment = %job.name, "Discarding merge of a superseded segment list");
            self.discard_merge(&job.name);
            return;
        }

        let mut deleted = RoaringBitmap::new();
        for (input, map) in job.inputs.iter().zip(&merged.doc_maps) {
            let current = match state.pool.get(&input.name) {
                Some(pooled) if !Arc::ptr_eq(&pooled.deleted, &input.deleted) => &pooled.deleted,
                _ => continue,
            };
            for doc in current.iter() {
                if input.deleted.contains(doc) {
                    continue;
                }
                if let Some(&mapped) = map.get(doc as usize) {
                    if mapped != DROPPED {
                        deleted.insert(mapped);
                    }
                }
            }
        }

        let mut carried = DocValuesUpdates::new();
        for ((input, map), seen) in job.inputs.iter().zip(&merged.doc_maps).zip(&job.updates) {
            let current = match state.pool.get(&input.name) {
                Some(pooled) if !Arc::ptr_eq(&pooled.updates, seen) => &pooled.updates,
                _ => continue,
            };
            for (field, doc, value) in current.iter() {
                if seen.get(field, doc) == Some(value) {
                    continue;
                }
                if let Some(&mapped) = map.get(doc as usize) {
                    if mapped != DROPPED {
                        carried.set(field, mapped, value.clone());
                    }
                }
            }
        }

        let position = job
            .inputs
            .iter()
            .filter_map(|i| state.infos.position(&i.name))
            .min()
            .unwrap_or(state.infos.len());
        let names: HashSet<&str> = job.inputs.iter().map(|i| i.name.as_str()).collect();
        state.infos.segments.retain(|s| !names.contains(s.name()));
        for input in &job.inputs {
            state.pool.remove(&input.name);
        }

        let max_doc = merged.written.max_doc;
        if max_doc > 0 && deleted.len() < max_doc as u64 {
            let mut info = SegmentCommitInfo::new(SegmentInfo {
                name: job.name.clone(),
                max_doc,
                codec: self.codec.name().to_string(),
                files: merged.written.files,
                size_bytes: merged.written.size_bytes,
                diagnostics: diagnostics(SOURCE_MERGE),
            });
            info.del_count = deleted.len() as u32;
            let at = position.min(state.infos.len());
            state.infos.segments.insert(at, info);
            let mut pooled = PooledSegment::new(merged.core, deleted);
            if !carried.is_empty() {
                pooled.add_updates(&carried);
            }
            state.pool.insert(job.name.clone(), pooled);
        } else {
            debug!(segment = %job.name, "Merged segment has no live docs");
            self.discard_merge(&job.name);
        }

        state.infos.changed();
        self.bump();
        self.deleter.lock().checkpoint(&state.infos, false);
        info!(
            segment = %job.name,
            replaced = job.inputs.len(),
            docs = max_doc,
            segments = state.infos.len(),
            "Published merged segment"
        );
    }

    fn discard_merge(&self, name: &str) {
        delete_with_prefix(self.dir.as_ref(), &format!("{}.", name));
    }

    /// Flush, then snapshot the segment list as a reader. Returns the
    /// reader and whether a segment was flushed.
    fn nrt_reader(self: &Arc<Self>) -> Result<(DirectoryReader, bool)> {
        let mut guard = self.lock_open()?;
        let state = &mut *guard;
        let flushed = self.flush_locked(state)?;

        let mut leaves: Vec<Arc<dyn LeafReader>> = Vec::with_capacity(state.infos.len());
        for info in state.infos.iter() {
            let pooled = state
                .pool
                .get(info.name())
                .ok_or_else(|| TesseraError::CorruptSegment {
                    segment: info.name().to_string(),
                    reason: "missing from the writer's segment pool".to_string(),
                })?;
            leaves.push(Arc::new(SegmentReader::new(
                info.clone(),
                pooled.core.clone(),
                Some(pooled.deleted.clone()),
            )));
        }

        let files: Vec<String> = state.infos.files(false).into_iter().collect();
        self.deleter.lock().incref(files.iter());
        let link = WriterLink {
            writer: Arc::downgrade(self),
            version: self.change_version.load(Ordering::SeqCst),
            files,
        };
        let reader = DirectoryReader::from_writer(self.dir.clone(), state.infos.clone(), leaves, link)?;
        Ok((reader, flushed))
    }
}

/// Tie from a near-real-time reader to the writer that produced it.
///
/// Holds a reference on every file of the reader's segments while the
/// writer is open.
pub(crate) struct WriterLink {
    writer: Weak<WriterInner>,
    version: u64,
    files: Vec<String>,
}

impl WriterLink {
    fn open_writer(&self) -> Option<Arc<WriterInner>> {
        self.writer
            .upgrade()
            .filter(|writer| !writer.closed.load(Ordering::SeqCst))
    }

    /// Whether the writer changed since the reader was opened; `None`
    /// once the writer is closed
    pub(crate) fn is_current(&self) -> Option<bool> {
        let writer = self.open_writer()?;
        Some(writer.change_version.load(Ordering::SeqCst) == self.version)
    }

    /// A fresh reader from the writer; `None` once the writer is closed
    pub(crate) fn reopen(&self) -> Option<Result<DirectoryReader>> {
        let writer = self.open_writer()?;
        Some(writer.nrt_reader().map(|(reader, _)| reader))
    }
}

impl Drop for WriterLink {
    fn drop(&mut self) {
        // A closed writer's counts are stale; the next writer cleans up
        if let Some(writer) = self.open_writer() {
            writer.deleter.lock().decref(self.files.iter());
        }
    }
}
