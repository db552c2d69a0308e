use criterion::{criterion_group, criterion_main, Criterion};
use kg_identity_core::{
    combine_ids, compare_inferred_instances, reconcile_documents, IdNamespace, IndexedDocument,
    SpaceName, Timestamp,
};
use serde_json::json;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

fn bench_space() -> SpaceName {
    match SpaceName::new("bench") {
        Ok(space) => space,
        Err(err) => panic!("invalid bench space: {err}"),
    }
}

/// Documents linked pairwise into chains of `chain_length`, so clustering has to close
/// long transitive paths.
fn mk_documents(count: usize, chain_length: usize) -> Vec<IndexedDocument> {
    let space = bench_space();
    (0..count)
        .map(|index| {
            let chain = index / chain_length;
            let link = index % chain_length;
            let mut document = IndexedDocument::new(Uuid::new_v4(), space.clone());
            document.identifiers.insert(format!("https://example.org/{chain}/{link}"));
            document.identifiers.insert(format!("https://example.org/{chain}/{}", link + 1));
            document.indexed_at = Some(Timestamp(
                OffsetDateTime::UNIX_EPOCH + Duration::seconds(i64::try_from(index).unwrap_or(0)),
            ));
            document
                .properties
                .insert("http://schema.org/name".to_string(), json!(format!("name {index}")));
            document
        })
        .collect()
}

fn bench_combine_ids(c: &mut Criterion) {
    let documents = mk_documents(10_000, 8);
    c.bench_function("combine_ids_10k_chained", |b| {
        b.iter(|| {
            let clusters = combine_ids(&documents);
            assert_eq!(clusters.len(), 1_250);
        });
    });
}

fn bench_reconcile(c: &mut Criterion) {
    let namespace = IdNamespace::default();
    let documents = mk_documents(2_000, 4);
    let existing = reconcile_documents(&documents, &namespace);
    c.bench_function("reconcile_and_diff_2k", |b| {
        b.iter(|| {
            let computed = reconcile_documents(&documents, &namespace);
            let result = compare_inferred_instances(existing.clone(), computed);
            assert_eq!(result.unchanged, 500);
        });
    });
}

criterion_group!(benches, bench_combine_ids, bench_reconcile);
criterion_main!(benches);
