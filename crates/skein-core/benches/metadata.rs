use criterion::{black_box, criterion_group, criterion_main, Criterion};
use skein_core::Metadata;

fn bench_set_get(c: &mut Criterion) {
    c.bench_function("metadata_set_8_keys", |b| {
        b.iter(|| {
            let mut md = Metadata::new();
            for i in 0..8 {
                md.set(&format!("x-key-{i}"), "value").unwrap();
            }
            black_box(md)
        })
    });

    let mut md = Metadata::new();
    for i in 0..8 {
        md.set(&format!("x-key-{i}"), "value").unwrap();
    }
    c.bench_function("metadata_get_hit", |b| {
        b.iter(|| black_box(md.get_text("x-key-7")))
    });
    c.bench_function("metadata_get_miss", |b| {
        b.iter(|| black_box(md.get_text("x-absent")))
    });
}

fn bench_append(c: &mut Criterion) {
    c.bench_function("metadata_append_multi_value", |b| {
        b.iter(|| {
            let mut md = Metadata::new();
            for _ in 0..16 {
                md.append("x-tag", "v").unwrap();
            }
            black_box(md)
        })
    });
}

criterion_group!(benches, bench_set_get, bench_append);
criterion_main!(benches);
