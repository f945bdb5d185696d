//! Select path benchmarks.
//!
//! Run with: `cargo bench --bench select_paths`
//! Compare baselines: `cargo bench --bench select_paths -- --baseline main`
//!
//! These measure the paths a busy repository hits per request: the
//! prefix/set select with its sorted merges, partition hashing, mutation
//! re-indexing, and the resumption-token codec.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use oai_jazz::store::{intersect_sorted, union_sorted};
use oai_jazz::{OaiJazz, Partition, ResumptionToken, SelectQuery, StoreConfig};

const STORE_SIZE: usize = 10_000;

fn populated_store() -> OaiJazz {
    let mut jazz = OaiJazz::in_memory(StoreConfig::default()).unwrap();
    for i in 0..STORE_SIZE {
        let sets: &[&str] = match i % 4 {
            0 => &["a:b:c"],
            1 => &["a:b"],
            2 => &["d"],
            _ => &[],
        };
        jazz.add_oai_record(&format!("oai:rec:{}", i), sets, &["oai_dc"])
            .unwrap();
    }
    jazz
}

fn bench_oai_select(c: &mut Criterion) {
    let jazz = populated_store();
    let mut group = c.benchmark_group("oai_select");
    group.throughput(Throughput::Elements(1));

    let mut prefix_only = SelectQuery::new("oai_dc");
    prefix_only.batch_size = 200;
    group.bench_function("prefix_only", |b| {
        b.iter(|| jazz.oai_select(black_box(&prefix_only)).unwrap())
    });

    // Middle of the stamp range: binary-search slicing, not a head read.
    let mut resumed = SelectQuery::new("oai_dc");
    resumed.batch_size = 200;
    resumed.continue_after = jazz.newest_stamp() - (STORE_SIZE as u64 / 2);
    group.bench_function("resumed_mid_range", |b| {
        b.iter(|| jazz.oai_select(black_box(&resumed)).unwrap())
    });

    let mut with_sets = SelectQuery::new("oai_dc");
    with_sets.batch_size = 200;
    with_sets.sets = vec!["a:b".to_string(), "d".to_string()];
    group.bench_function("set_union_intersect", |b| {
        b.iter(|| jazz.oai_select(black_box(&with_sets)).unwrap())
    });

    let mut partitioned = SelectQuery::new("oai_dc");
    partitioned.batch_size = 200;
    partitioned.partition = Some(Partition::new(vec![1], 4).unwrap());
    group.bench_function("partition_filtered", |b| {
        b.iter(|| jazz.oai_select(black_box(&partitioned)).unwrap())
    });

    let mut counted = SelectQuery::new("oai_dc");
    counted.batch_size = 200;
    counted.should_count_hits = true;
    group.bench_function("count_hits", |b| {
        b.iter(|| jazz.oai_select(black_box(&counted)).unwrap())
    });

    group.finish();
}

fn bench_sorted_merges(c: &mut Criterion) {
    let mut group = c.benchmark_group("sorted_merges");

    let evens: Vec<u64> = (0..100_000u64).map(|i| i * 2).collect();
    let threes: Vec<u64> = (0..66_000u64).map(|i| i * 3).collect();
    let sparse: Vec<u64> = (0..1_000u64).map(|i| i * 97).collect();
    group.throughput(Throughput::Elements(evens.len() as u64));

    group.bench_function("union_two", |b| {
        b.iter(|| union_sorted(black_box(&[&evens, &threes])))
    });
    group.bench_function("union_three", |b| {
        b.iter(|| union_sorted(black_box(&[&evens, &threes, &sparse])))
    });
    group.bench_function("intersect", |b| {
        b.iter(|| intersect_sorted(black_box(&evens), black_box(&threes)))
    });

    group.finish();
}

fn bench_partition_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");
    group.throughput(Throughput::Elements(1));

    let partition = Partition::new(vec![1, 3], 4).unwrap();
    group.bench_function("matches", |b| {
        b.iter(|| partition.matches(black_box("oai:repository.example.org:record:123456")))
    });
    group.bench_function("hash_bucket", |b| {
        b.iter(|| Partition::hash_bucket(black_box("oai:repository.example.org:record:123456")))
    });

    group.finish();
}

fn bench_mutations(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutations");
    group.throughput(Throughput::Elements(1));

    // Update path: every iteration re-stamps the same identifier, moving
    // its index entries from the old stamp to a fresh one.
    let mut jazz = populated_store();
    group.bench_function("update_existing", |b| {
        b.iter(|| jazz.add_oai_record("oai:rec:5000", &["a:b:c"], &["oai_dc"]).unwrap())
    });

    group.finish();
}

fn bench_resumption_token(c: &mut Criterion) {
    let mut group = c.benchmark_group("resumption_token");
    group.throughput(Throughput::Elements(1));

    let token = ResumptionToken {
        metadata_prefix: "oai_dc".to_string(),
        continue_after: 1_700_000_000_000_000,
        from: "2020-05-01T00:00:00Z".to_string(),
        until: "2020-06-01T00:00:00Z".to_string(),
        set_spec: "a:b:c".to_string(),
        partition: Some(Partition::new(vec![1, 3], 4).unwrap()),
    };
    let wire = token.encode();

    group.bench_function("encode", |b| b.iter(|| black_box(&token).encode()));
    group.bench_function("decode", |b| {
        b.iter(|| ResumptionToken::decode(black_box(&wire)).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_oai_select,
    bench_sorted_merges,
    bench_partition_hash,
    bench_mutations,
    bench_resumption_token
);
criterion_main!(benches);
