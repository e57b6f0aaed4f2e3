use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::SeedableRng;

use tessera::index::{DirectoryReader, IndexWriter, NoMergePolicy, TieredMergePolicy};
use tessera::testing::random_document;
use tessera::{Directory, IndexWriterConfig, MergeSchedulerConfig, RamDirectory, Term};

fn serial_config() -> IndexWriterConfig {
    IndexWriterConfig::new()
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(MergeSchedulerConfig::Serial)
}

fn build_segments(segments: u64, docs_per_segment: u64) -> Arc<dyn Directory> {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let writer = IndexWriter::open(dir.clone(), serial_config()).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    for id in 0..segments * docs_per_segment {
        writer.add_document(&random_document(&mut rng, id)).unwrap();
        if (id + 1) % docs_per_segment == 0 {
            writer.flush().unwrap();
        }
    }
    writer.close().unwrap();
    dir
}

// Benchmark: buffering and flushing documents
fn bench_add_documents(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_documents");
    group.measurement_time(Duration::from_secs(10));

    for &batch_size in [100u64, 1000, 5000].iter() {
        group.throughput(Throughput::Elements(batch_size));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &batch_size| {
            let mut rng = StdRng::seed_from_u64(3);
            let docs: Vec<_> = (0..batch_size).map(|id| random_document(&mut rng, id)).collect();
            b.iter_batched(
                || {
                    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
                    IndexWriter::open(dir, serial_config().with_max_buffered_docs(1000)).unwrap()
                },
                |writer| {
                    for doc in &docs {
                        writer.add_document(doc).unwrap();
                    }
                    writer.commit().unwrap();
                    black_box(writer.num_docs())
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

// Benchmark: merging many small segments into one
fn bench_force_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("force_merge");
    group.sample_size(10);

    for &segments in [4u64, 16].iter() {
        group.throughput(Throughput::Elements(segments * 500));
        group.bench_with_input(BenchmarkId::from_parameter(segments), &segments, |b, &segments| {
            b.iter_batched(
                || build_segments(segments, 500),
                |dir| {
                    let config = IndexWriterConfig::new()
                        .with_merge_policy(Arc::new(TieredMergePolicy::default()))
                        .with_merge_scheduler(MergeSchedulerConfig::Serial);
                    let writer = IndexWriter::open(dir, config).unwrap();
                    writer.force_merge(1).unwrap();
                    writer.close().unwrap();
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

// Benchmark: term lookups across segments
fn bench_term_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("term_lookup");
    let dir = build_segments(8, 1000);
    let reader = DirectoryReader::open(dir).unwrap();

    group.bench_function("doc_freq", |b| {
        let mut id = 0u64;
        b.iter(|| {
            id = (id + 7919) % 8000;
            black_box(reader.doc_freq(&Term::text("id", &id.to_string())).unwrap())
        });
    });
    group.bench_function("postings", |b| {
        b.iter(|| black_box(reader.postings(&Term::text("body", "alpha")).unwrap().len()));
    });
    group.finish();
}

criterion_group!(benches, bench_add_documents, bench_force_merge, bench_term_lookup);
criterion_main!(benches);
