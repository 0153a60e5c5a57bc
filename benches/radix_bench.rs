use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pixels_cache::layout::{write_magic, RADIX_OFFSET};
use pixels_cache::radix::disk;
use pixels_cache::{CacheIdx, CacheKey, MappedRegion, RadixTree};
use tempfile::TempDir;

fn bench_lookup(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let region = MappedRegion::new(dir.path().join("index"), 8 * 1024 * 1024).unwrap();
    write_magic(&region).unwrap();

    let keys: Vec<CacheKey> = (0..50_000u32)
        .map(|i| CacheKey::new((i % 97) as u64, (i / 97) as u16, (i % 331) as u16))
        .collect();
    let mut tree = RadixTree::new();
    for (i, k) in keys.iter().enumerate() {
        tree.put(*k, CacheIdx::new(i as u64 * 64, 64));
    }
    tree.serialize(&region, RADIX_OFFSET).unwrap();

    c.bench_function("serialized_lookup_hit", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 7919) % keys.len();
            black_box(disk::lookup(&region, keys[i]).unwrap())
        })
    });

    c.bench_function("serialized_lookup_miss", |b| {
        b.iter(|| black_box(disk::lookup(&region, CacheKey::new(u64::MAX, 0, 0)).unwrap()))
    });

    c.bench_function("in_memory_get", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 7919) % keys.len();
            black_box(tree.get(keys[i]))
        })
    });
}

criterion_group!(benches, bench_lookup);
criterion_main!(benches);
