//! Integration tests for the writer lifecycle: locking, commits, rollback
//! and reader freshness

use std::collections::BTreeMap;
use std::sync::Arc;

use tempfile::TempDir;
use tessera::index::{
    DirectoryReader, IndexWriter, KeepAllCommits, NoMergePolicy, TieredMergePolicy, WriterState,
};
use tessera::{
    Directory, Document, FsDirectory, IndexWriterConfig, MergeSchedulerConfig, OpenMode,
    RamDirectory, TesseraError, Term,
};

fn fs_dir(temp: &TempDir) -> Arc<dyn Directory> {
    Arc::new(FsDirectory::open(temp.path().join("index")).unwrap())
}

fn serial_config() -> IndexWriterConfig {
    IndexWriterConfig::new()
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(MergeSchedulerConfig::Serial)
}

fn create_test_doc(id: u32, body: &str) -> Document {
    let mut doc = Document::new();
    doc.add_keyword("id", &id.to_string());
    doc.add_text("body", body);
    doc
}

fn bodies(reader: &DirectoryReader) -> Vec<String> {
    let mut out = Vec::new();
    for doc in 0..reader.max_doc() {
        if reader.is_deleted(doc) {
            continue;
        }
        let stored = reader.document(doc).unwrap();
        out.push(stored.get_text("body").unwrap_or_default().to_string());
    }
    out.sort();
    out
}

#[test]
fn test_second_writer_fails_with_lock_held() {
    let temp = TempDir::new().unwrap();
    let dir = fs_dir(&temp);
    let writer = IndexWriter::open(dir.clone(), serial_config()).unwrap();

    match IndexWriter::open(dir.clone(), serial_config()) {
        Err(e @ TesseraError::LockHeld(_)) => assert!(e.is_retriable()),
        other => panic!("expected LockHeld, got {:?}", other.map(|_| ())),
    }

    writer.close().unwrap();
    let reopened = IndexWriter::open(dir, serial_config()).unwrap();
    reopened.rollback().unwrap();
}

#[test]
fn test_failed_open_releases_lock() {
    let temp = TempDir::new().unwrap();
    let dir = fs_dir(&temp);

    let append = serial_config().with_open_mode(OpenMode::Append);
    assert!(matches!(
        IndexWriter::open(dir.clone(), append),
        Err(TesseraError::IndexNotFound(_))
    ));
    let unknown_codec = serial_config().with_codec("NoSuchCodec");
    assert!(matches!(
        IndexWriter::open(dir.clone(), unknown_codec),
        Err(TesseraError::InvalidArgument(_))
    ));

    // Neither failure left the lock behind
    let writer = IndexWriter::open(dir.clone(), serial_config()).unwrap();
    assert!(!dir.file_exists("segments_1"));
    writer.close().unwrap();
    assert!(dir.file_exists("segments_1"));
    assert!(!dir.file_exists("write.lock"));
}

#[test]
fn test_is_current_tracks_commits() {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let writer = IndexWriter::open(dir.clone(), serial_config()).unwrap();
    for i in 0..3 {
        writer.add_document(&create_test_doc(i, "some text")).unwrap();
    }
    writer.commit().unwrap();

    let reader = DirectoryReader::open(dir.clone()).unwrap();
    assert!(reader.is_current().unwrap());

    // Uncommitted work does not make it stale
    writer.add_document(&create_test_doc(3, "more")).unwrap();
    writer.flush().unwrap();
    assert!(reader.is_current().unwrap());
    writer.rollback().unwrap();
    assert!(reader.is_current().unwrap());

    // A commit holding only a delete does
    let writer = IndexWriter::open(dir.clone(), serial_config()).unwrap();
    writer.delete_documents(Term::text("id", "1")).unwrap();
    writer.commit().unwrap();
    assert!(!reader.is_current().unwrap());

    let fresh = reader.open_if_changed().unwrap().unwrap();
    assert!(fresh.is_current().unwrap());
    assert_eq!(fresh.num_docs(), 2);
    assert_eq!(reader.num_docs(), 3);
    writer.close().unwrap();
}

#[test]
fn test_rollback_after_updates_restores_last_commit() {
    let temp = TempDir::new().unwrap();
    let dir = fs_dir(&temp);
    let config = serial_config().with_max_buffered_docs(2);

    let writer = IndexWriter::open(dir.clone(), config.clone()).unwrap();
    for i in 0..5 {
        writer.add_document(&create_test_doc(i, &format!("original {}", i))).unwrap();
    }
    writer.commit().unwrap();
    let before = DirectoryReader::open(dir.clone()).unwrap();
    let committed = bodies(&before);
    assert_eq!(committed.len(), 5);
    let committed_segments: Vec<String> =
        before.segment_infos().iter().map(|s| s.name().to_string()).collect();

    for i in 0..3 {
        writer
            .update_document(Term::text("id", &i.to_string()), &create_test_doc(i, &format!("updated {}", i)))
            .unwrap();
    }
    // The small buffer forced a flush of the updates
    assert!(writer
        .segment_infos()
        .iter()
        .any(|s| !committed_segments.contains(&s.name().to_string())));
    assert_eq!(writer.state(), WriterState::OpenDirty);

    writer.rollback().unwrap();
    assert_eq!(writer.state(), WriterState::RolledBack);
    assert!(matches!(writer.commit(), Err(TesseraError::AlreadyClosed)));

    let reader = DirectoryReader::open(dir.clone()).unwrap();
    assert_eq!(reader.num_docs(), 5);
    assert_eq!(bodies(&reader), committed);

    // Files of the discarded segments are gone
    let writer = IndexWriter::open(dir.clone(), config).unwrap();
    assert_eq!(writer.num_docs(), 5);
    let referenced = writer.segment_infos().files(true);
    for file in dir.list_all().unwrap() {
        if file != "write.lock" {
            assert!(referenced.contains(&file), "unreferenced file {}", file);
        }
    }
    writer.close().unwrap();
}

#[test]
fn test_two_phase_commit() {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let writer = IndexWriter::open(dir.clone(), serial_config()).unwrap();
    writer.add_document(&create_test_doc(1, "one")).unwrap();
    writer.commit().unwrap();

    writer.add_document(&create_test_doc(2, "two")).unwrap();
    writer.prepare_commit().unwrap();
    assert!(dir.file_exists("pending_segments_2"));
    assert!(matches!(writer.prepare_commit(), Err(TesseraError::InvalidArgument(_))));
    assert_eq!(DirectoryReader::open(dir.clone()).unwrap().num_docs(), 1);

    writer.commit().unwrap();
    assert!(!dir.file_exists("pending_segments_2"));
    assert_eq!(DirectoryReader::open(dir.clone()).unwrap().num_docs(), 2);

    // Abandoning a prepared commit
    writer.add_document(&create_test_doc(3, "three")).unwrap();
    writer.prepare_commit().unwrap();
    writer.rollback().unwrap();
    assert!(!dir.file_exists("pending_segments_3"));
    let reader = DirectoryReader::open(dir).unwrap();
    assert_eq!(reader.num_docs(), 2);
    assert_eq!(reader.generation(), 2);
}

#[test]
fn test_commit_user_data_round_trips() {
    let temp = TempDir::new().unwrap();
    let dir = fs_dir(&temp);
    let writer = IndexWriter::open(dir.clone(), serial_config()).unwrap();
    writer.add_document(&create_test_doc(1, "hello")).unwrap();

    let mut data = BTreeMap::new();
    data.insert("checkpoint".to_string(), "42".to_string());
    data.insert("source".to_string(), "kafka".to_string());
    writer.set_commit_data(data.clone()).unwrap();
    writer.close().unwrap();

    // Reopened from a fresh handle, as after a restart
    let dir = fs_dir(&temp);
    let reader = DirectoryReader::open(dir.clone()).unwrap();
    assert_eq!(reader.user_data(), &data);

    let writer = IndexWriter::open(dir, serial_config()).unwrap();
    assert_eq!(writer.commit_data(), data);
    assert_eq!(writer.state(), WriterState::OpenClean);
    writer.close().unwrap();
}

#[test]
fn test_delete_all_and_create_mode() {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let writer = IndexWriter::open(dir.clone(), serial_config()).unwrap();
    for i in 0..10 {
        writer.add_document(&create_test_doc(i, "x")).unwrap();
    }
    writer.commit().unwrap();
    writer.delete_all().unwrap();
    assert_eq!(writer.max_doc(), 0);
    writer.add_document(&create_test_doc(100, "survivor")).unwrap();
    writer.close().unwrap();
    assert_eq!(DirectoryReader::open(dir.clone()).unwrap().num_docs(), 1);

    let create = serial_config().with_open_mode(OpenMode::Create);
    let writer = IndexWriter::open(dir.clone(), create).unwrap();
    assert_eq!(writer.num_docs(), 0);
    assert_eq!(writer.state(), WriterState::OpenDirty);
    // Readers still see the old commit until the new one lands
    assert_eq!(DirectoryReader::open(dir.clone()).unwrap().num_docs(), 1);
    writer.close().unwrap();
    assert_eq!(DirectoryReader::open(dir).unwrap().num_docs(), 0);
}

#[test]
fn test_close_without_commit_discards_changes() {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let writer = IndexWriter::open(dir.clone(), serial_config()).unwrap();
    writer.add_document(&create_test_doc(1, "kept")).unwrap();
    writer.close().unwrap();

    let config = serial_config().with_commit_on_close(false);
    let writer = IndexWriter::open(dir.clone(), config).unwrap();
    writer.add_document(&create_test_doc(2, "dropped")).unwrap();
    writer.close().unwrap();
    assert_eq!(writer.state(), WriterState::Closed);
    assert_eq!(DirectoryReader::open(dir.clone()).unwrap().num_docs(), 1);

    // Nor does dropping such a writer
    {
        let config = serial_config().with_commit_on_close(false);
        let writer = IndexWriter::open(dir.clone(), config).unwrap();
        writer.add_document(&create_test_doc(3, "dropped")).unwrap();
    }
    assert_eq!(DirectoryReader::open(dir.clone()).unwrap().num_docs(), 1);
    assert!(!dir.file_exists("write.lock"));
}

#[test]
fn test_keep_all_commits_allows_point_in_time_readers() {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let config = serial_config()
        .with_merge_policy(Arc::new(TieredMergePolicy::default()))
        .with_deletion_policy(Arc::new(KeepAllCommits));
    let writer = IndexWriter::open(dir.clone(), config).unwrap();
    for round in 0..3u32 {
        writer.add_document(&create_test_doc(round, "doc")).unwrap();
        let mut data = BTreeMap::new();
        data.insert("round".to_string(), round.to_string());
        writer.set_commit_data(data).unwrap();
        writer.commit().unwrap();
    }
    writer.force_merge(1).unwrap();
    writer.close().unwrap();

    let commits = DirectoryReader::list_commits(dir.as_ref()).unwrap();
    assert_eq!(commits.len(), 4);
    for (i, commit) in commits.iter().take(3).enumerate() {
        let reader = DirectoryReader::open_commit(dir.clone(), commit).unwrap();
        assert_eq!(reader.num_docs() as usize, i + 1);
        assert_eq!(reader.user_data().get("round"), Some(&i.to_string()));
    }
    assert_eq!(commits[3].segment_count, 1);
}

#[test]
fn test_concurrent_adds_from_many_threads() {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let config = IndexWriterConfig::new()
        .with_max_buffered_docs(37)
        .with_merge_scheduler(MergeSchedulerConfig::Concurrent { max_threads: 2 });
    let writer = Arc::new(IndexWriter::open(dir.clone(), config).unwrap());

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let writer = writer.clone();
            std::thread::spawn(move || {
                for i in 0..250u32 {
                    writer.add_document(&create_test_doc(t * 1000 + i, "threaded body")).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    writer.commit().unwrap();
    writer.wait_for_merges();
    writer.close().unwrap();

    let reader = DirectoryReader::open(dir).unwrap();
    assert_eq!(reader.num_docs(), 1000);
    assert_eq!(reader.doc_freq(&Term::text("body", "threaded")).unwrap(), 1000);
}
