//! Integration tests for merging: forced merges, concurrent merges,
//! merge failures and the reads a merge performs

use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;
use tessera::codec::{PostingsEnum, TermsEnum};
use tessera::index::{
    DirectoryReader, IndexWriter, LogDocMergePolicy, LogMergePolicyConfig, SegmentInfos,
    TieredMergePolicy, TieredMergePolicyConfig,
};
use tessera::testing::prelude::*;
use tessera::testing::ID_FIELD;
use tessera::{
    Directory, Document, FsDirectory, IndexWriterConfig, MergeSchedulerConfig, RamDirectory,
    TesseraError, Term,
};

fn create_test_doc(id: u32) -> Document {
    let mut doc = Document::new();
    doc.add_keyword("id", &id.to_string());
    doc.add_text("body", &format!("document number {} word{}", id, id % 7));
    doc.add_int("n", id as i64);
    doc
}

fn tiered_config() -> IndexWriterConfig {
    IndexWriterConfig::new()
        .with_merge_policy(Arc::new(TieredMergePolicy::default()))
        .with_merge_scheduler(MergeSchedulerConfig::Serial)
}

#[test]
fn test_force_merge_to_one_segment_keeps_docs() {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let writer = IndexWriter::open(dir.clone(), tiered_config().with_max_buffered_docs(10)).unwrap();
    for i in 0..95 {
        writer.add_document(&create_test_doc(i)).unwrap();
    }
    for i in (0..95).step_by(5) {
        writer.delete_documents(Term::text("id", &i.to_string())).unwrap();
    }
    writer.flush().unwrap();
    assert!(writer.segment_count() > 1);
    let num_docs = writer.num_docs();
    assert_eq!(num_docs, 76);

    writer.force_merge(1).unwrap();
    assert_eq!(writer.segment_count(), 1);
    assert_eq!(writer.num_docs(), num_docs);
    // Deleted docs were dropped by the merge
    assert_eq!(writer.max_doc(), num_docs);
    writer.commit().unwrap();

    let reader = DirectoryReader::open(dir).unwrap();
    assert_eq!(reader.leaves().len(), 1);
    assert_eq!(reader.num_docs(), 76);
    assert!(!reader.has_deletions());
    assert_eq!(reader.doc_freq(&Term::text("id", "5")).unwrap(), 0);
    assert_eq!(reader.doc_freq(&Term::text("id", "6")).unwrap(), 1);
    assert!(check_all_invariants(&reader, &default_invariants()).is_empty());
}

#[test]
fn test_force_merge_rejects_zero_segments() {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let writer = IndexWriter::open(dir, tiered_config()).unwrap();
    assert!(matches!(writer.force_merge(0), Err(TesseraError::InvalidArgument(_))));
    writer.close().unwrap();
}

#[test]
fn test_random_index_invariants_after_merges() {
    let temp = TempDir::new().unwrap();
    let dir: Arc<dyn Directory> = Arc::new(FsDirectory::open(temp.path()).unwrap());
    let writer = IndexWriter::open(dir.clone(), tiered_config().with_max_buffered_docs(40)).unwrap();

    let options = RandomIndexOptions {
        docs: 600,
        ..Default::default()
    };
    let live = build_random_index(&writer, &mut StdRng::seed_from_u64(42), &options).unwrap();
    writer.commit().unwrap();

    let reader = DirectoryReader::open(dir.clone()).unwrap();
    assert_eq!(reader.num_docs() as usize, live.len());
    let violations = check_all_invariants(&reader, &default_invariants());
    assert!(violations.is_empty(), "{:?}", violations);

    writer.force_merge(3).unwrap();
    assert!(writer.segment_count() <= 3);
    writer.commit().unwrap();

    let merged = reader.open_if_changed().unwrap().unwrap();
    assert_eq!(merged.num_docs() as usize, live.len());
    let violations = check_all_invariants(&merged, &default_invariants());
    assert!(violations.is_empty(), "{:?}", violations);

    for id in 0..options.docs {
        let hits = merged.postings(&Term::text(ID_FIELD, &id.to_string())).unwrap();
        let expected = usize::from(live.contains(&id));
        assert_eq!(hits.len(), expected, "id {}", id);
    }
    writer.close().unwrap();
}

#[test]
fn test_concurrent_merges_while_indexing() {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let policy = LogDocMergePolicy::new(LogMergePolicyConfig {
        merge_factor: 3,
        min_merge_size: 10,
        ..LogMergePolicyConfig::doc_count()
    });
    let config = IndexWriterConfig::new()
        .with_merge_policy(Arc::new(policy))
        .with_merge_scheduler(MergeSchedulerConfig::Concurrent { max_threads: 3 })
        .with_max_buffered_docs(10);
    let writer = Arc::new(IndexWriter::open(dir.clone(), config).unwrap());

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let writer = writer.clone();
            thread::spawn(move || {
                for i in 0..150 {
                    writer.add_document(&create_test_doc(t * 1000 + i)).unwrap();
                    if i % 40 == 0 {
                        writer.delete_documents(Term::text("id", &(t * 1000 + i).to_string())).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    writer.flush().unwrap();
    writer.wait_for_merges();
    writer.commit().unwrap();
    // 4 threads, 4 deletes each
    assert_eq!(writer.num_docs(), 600 - 16);
    assert!(writer.segment_count() < 60);

    let reader = DirectoryReader::open(dir).unwrap();
    assert_eq!(reader.num_docs(), 584);
    let violations = check_all_invariants(&reader, &default_invariants());
    assert!(violations.is_empty(), "{:?}", violations);
    writer.close().unwrap();
}

#[test]
fn test_failed_merge_leaves_inputs_intact() {
    let ram = RamDirectory::new();
    let faulty = FaultyDirectory::new(Arc::new(ram));
    let dir: Arc<dyn Directory> = Arc::new(faulty.clone());
    let writer = IndexWriter::open(dir.clone(), tiered_config().with_max_buffered_docs(5)).unwrap();
    for i in 0..20 {
        writer.add_document(&create_test_doc(i)).unwrap();
    }
    writer.commit().unwrap();
    let before = writer.segment_infos();
    assert_eq!(before.len(), 4);

    faulty.fail_outputs_after(0);
    let err = writer.force_merge(1).unwrap_err();
    assert!(matches!(err, TesseraError::Io(_) | TesseraError::Durability { .. }), "{:?}", err);
    assert!(faulty.injected() > 0);

    // Nothing was swapped in and nothing half-written remains
    let after = writer.segment_infos();
    let names = |infos: &SegmentInfos| -> Vec<String> {
        infos.iter().map(|s| s.name().to_string()).collect()
    };
    assert_eq!(names(&after), names(&before));
    let referenced = after.files(true);
    for file in dir.list_all().unwrap() {
        if file != "write.lock" {
            assert!(referenced.contains(&file), "leftover {}", file);
        }
    }
    assert_eq!(writer.reader().unwrap().num_docs(), 20);

    // The same merge succeeds once the directory recovers
    faulty.heal();
    writer.force_merge(1).unwrap();
    assert_eq!(writer.segment_count(), 1);
    writer.commit().unwrap();
    let reader = DirectoryReader::open(dir).unwrap();
    assert_eq!(reader.num_docs(), 20);
    assert!(check_all_invariants(&reader, &default_invariants()).is_empty());
}

#[test]
fn test_merge_reads_pooled_segments() {
    let ram = RamDirectory::new();
    let dir: Arc<dyn Directory> = Arc::new(ram.clone());
    let writer = IndexWriter::open(dir, tiered_config()).unwrap();
    for i in 0..20 {
        writer.add_document(&create_test_doc(i)).unwrap();
        if i % 5 == 4 {
            writer.flush().unwrap();
        }
    }
    assert_eq!(writer.segment_count(), 4);

    let opened = ram.inputs_opened();
    writer.force_merge(1).unwrap();
    let merge_reads = ram.inputs_opened() - opened;
    // Opening the merged segment, and nothing per input segment
    assert!(merge_reads <= 5, "merge opened {} inputs", merge_reads);

    // A full scan of every term over the merged segment reads no files
    let reader = writer.reader().unwrap();
    let opened = ram.inputs_opened();
    let mut terms = reader.terms("body").unwrap().unwrap();
    let mut postings = 0;
    while terms.next().unwrap() {
        if terms.term() >= b"word0".as_slice() && terms.term() <= b"word6".as_slice() {
            let mut docs = terms.live_postings().unwrap();
            while docs.next().unwrap().is_some() {
                postings += 1;
            }
        }
    }
    assert_eq!(postings, 20);
    assert_eq!(ram.inputs_opened(), opened);
    writer.close().unwrap();
}

#[test]
fn test_force_merge_deletes_reclaims_space() {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let config = tiered_config().with_max_buffered_docs(20);
    let writer = IndexWriter::open(dir.clone(), config).unwrap();
    for i in 0..60 {
        writer.add_document(&create_test_doc(i)).unwrap();
    }
    // Half of the first segment
    for i in 0..10 {
        writer.delete_documents(Term::text("id", &i.to_string())).unwrap();
    }
    writer.commit().unwrap();
    assert_eq!(writer.max_doc(), 60);

    writer.force_merge_deletes().unwrap();
    assert_eq!(writer.num_docs(), 50);
    assert_eq!(writer.max_doc(), 50);
    writer.close().unwrap();

    let reader = DirectoryReader::open(dir).unwrap();
    assert!(!reader.has_deletions());
}

#[test]
fn test_custom_tiered_config_from_json() {
    let config: TieredMergePolicyConfig =
        serde_json::from_str(r#"{"segments_per_tier": 2.0, "max_merge_at_once": 2}"#).unwrap();
    assert_eq!(config.max_merge_at_once_explicit, 30);

    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let writer = IndexWriter::open(
        dir,
        IndexWriterConfig::new()
            .with_merge_policy(Arc::new(TieredMergePolicy::new(config)))
            .with_merge_scheduler(MergeSchedulerConfig::Serial),
    )
    .unwrap();
    for i in 0..12 {
        writer.add_document(&create_test_doc(i)).unwrap();
        writer.flush().unwrap();
    }
    writer.wait_for_merges();
    // Natural merges kicked in on flush
    assert!(writer.segment_count() < 12);
    assert_eq!(writer.num_docs(), 12);
    writer.close().unwrap();
}

fn build_source(ids: std::ops::Range<u32>, deleted: &[u32]) -> Arc<dyn Directory> {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let writer = IndexWriter::open(dir.clone(), tiered_config().with_max_buffered_docs(4)).unwrap();
    for id in ids {
        writer.add_document(&create_test_doc(id)).unwrap();
    }
    for id in deleted {
        writer.delete_documents(Term::text("id", &id.to_string())).unwrap();
    }
    writer.close().unwrap();
    dir
}

#[test]
fn test_add_indexes_copies_live_docs() {
    let first = build_source(0..10, &[3]);
    let second = build_source(10..15, &[]);
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let writer = IndexWriter::open(dir.clone(), tiered_config()).unwrap();
    writer.add_document(&create_test_doc(100)).unwrap();

    writer.add_indexes(&[first.clone(), second]).unwrap();
    writer.commit().unwrap();
    // The buffered doc was flushed first, then the added segment
    assert_eq!(writer.segment_count(), 2);
    let infos = writer.segment_infos();
    let added = &infos.segments[1];
    assert_eq!(added.max_doc(), 14);
    assert!(!added.has_deletions());
    assert_eq!(added.info.source(), Some("addIndexes"));

    let reader = DirectoryReader::open(dir).unwrap();
    assert_eq!(reader.num_docs(), 15);
    assert!(reader.postings(&Term::text("id", "3")).unwrap().is_empty());
    assert_eq!(reader.postings(&Term::text("id", "14")).unwrap().len(), 1);
    writer.close().unwrap();

    // Sources are unchanged and unlocked again
    assert_eq!(DirectoryReader::open(first.clone()).unwrap().num_docs(), 9);
    IndexWriter::open(first, tiered_config()).unwrap().close().unwrap();
}

#[test]
fn test_add_indexes_refuses_locked_or_own_index() {
    let source = build_source(0..3, &[]);
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let writer = IndexWriter::open(dir.clone(), tiered_config()).unwrap();

    let other = IndexWriter::open(source.clone(), tiered_config()).unwrap();
    assert!(matches!(
        writer.add_indexes(&[source.clone()]),
        Err(TesseraError::LockHeld(_))
    ));
    other.close().unwrap();

    assert!(matches!(
        writer.add_indexes(&[dir.clone()]),
        Err(TesseraError::InvalidArgument(_))
    ));
    assert!(matches!(
        writer.add_indexes(&[Arc::new(RamDirectory::new())]),
        Err(TesseraError::IndexNotFound(_))
    ));
    assert_eq!(writer.segment_count(), 0);

    writer.add_indexes(&[source]).unwrap();
    assert_eq!(writer.num_docs(), 3);
    writer.close().unwrap();
}
