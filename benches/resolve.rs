//! Resolution and listing benchmarks, cached versus uncached

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use layerfs::{FsOptions, LayeredFs};
use std::fs;
use tempfile::{tempdir, TempDir};

fn build(cache_enabled: bool) -> (Vec<TempDir>, LayeredFs) {
    let engine = LayeredFs::with_options(FsOptions {
        cache_enabled,
        ..FsOptions::default()
    });
    let mut dirs = Vec::new();
    for layer in 0..4 {
        let dir = tempdir().unwrap();
        for i in 0..50 {
            let p = dir.path().join(format!("pkg{}/lib/file{}_{}.txt", i % 5, layer, i));
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, b"data").unwrap();
        }
        let label = format!("layer{}", layer);
        engine
            .add_layer(dir.path(), false, Some(label.as_str()))
            .unwrap();
        dirs.push(dir);
    }
    (dirs, engine)
}

fn bench_resolve(c: &mut Criterion) {
    for cache in [true, false] {
        let (_dirs, engine) = build(cache);
        let name = if cache { "resolve_cached" } else { "resolve_uncached" };
        c.bench_function(name, |b| {
            b.iter(|| black_box(engine.resolve("pkg3/lib/file3_48.txt").unwrap()))
        });
    }
}

fn bench_entries(c: &mut Criterion) {
    let (_dirs, engine) = build(true);
    c.bench_function("entries_merged", |b| {
        b.iter(|| black_box(engine.entries("pkg1/lib").unwrap()))
    });
}

criterion_group!(benches, bench_resolve, bench_entries);
criterion_main!(benches);
