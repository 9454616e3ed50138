use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use piece_tree::{LineEnding, PieceTree, StringBuffer};

fn build_tree(text: &str) -> PieceTree {
    PieceTree::new(
        vec![StringBuffer::new(text.to_string())],
        LineEnding::Lf,
        false,
    )
}

fn sample_text(size: usize) -> String {
    let mut text = String::with_capacity(size + 32);
    while text.len() < size {
        text.push_str("the quick brown fox jumps over the lazy dog\n");
    }
    text.truncate(size);
    text
}

fn bench_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("creation");

    for size in [1_000, 10_000, 100_000].iter() {
        let text = sample_text(*size);

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("piece_tree", size), size, |b, _| {
            b.iter(|| {
                let tree = build_tree(black_box(text.as_str()));
                black_box(tree);
            })
        });

        group.bench_with_input(BenchmarkId::new("ropey", size), size, |b, _| {
            b.iter(|| {
                let rope = ropey::Rope::from_str(black_box(text.as_str()));
                black_box(rope);
            })
        });

        group.bench_with_input(BenchmarkId::new("string", size), size, |b, _| {
            b.iter(|| {
                let string = black_box(text.clone());
                black_box(string);
            })
        });
    }
    group.finish();
}

fn bench_insert_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [1_000, 10_000, 100_000].iter() {
        let text = sample_text(*size);
        let insert_text = "INSERTED";

        group.throughput(Throughput::Elements(1));

        group.bench_with_input(BenchmarkId::new("piece_tree_middle", size), size, |b, _| {
            b.iter_batched(
                || build_tree(text.as_str()),
                |mut tree| {
                    tree.insert(black_box(size / 2), black_box(insert_text), false);
                    black_box(tree);
                },
                criterion::BatchSize::SmallInput,
            )
        });

        group.bench_with_input(BenchmarkId::new("ropey_middle", size), size, |b, _| {
            b.iter_batched(
                || ropey::Rope::from_str(text.as_str()),
                |mut rope| {
                    rope.insert(black_box(size / 2), black_box(insert_text));
                    black_box(rope);
                },
                criterion::BatchSize::SmallInput,
            )
        });

        group.bench_with_input(BenchmarkId::new("string_middle", size), size, |b, _| {
            b.iter_batched(
                || text.clone(),
                |mut string| {
                    string.insert_str(black_box(size / 2), black_box(insert_text));
                    black_box(string);
                },
                criterion::BatchSize::SmallInput,
            )
        });

        group.bench_with_input(
            BenchmarkId::new("piece_tree_append_run", size),
            size,
            |b, _| {
                b.iter_batched(
                    || build_tree(text.as_str()),
                    |mut tree| {
                        for _ in 0..64 {
                            let end = tree.get_length();
                            tree.insert(black_box(end), black_box("x"), false);
                        }
                        black_box(tree);
                    },
                    criterion::BatchSize::SmallInput,
                )
            },
        );
    }
    group.finish();
}

fn bench_delete_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("delete");

    for size in [1_000, 10_000, 100_000].iter() {
        let text = sample_text(*size);
        let delete_size = size / 10;
        let start = size / 2 - delete_size / 2;

        group.throughput(Throughput::Elements(delete_size as u64));

        group.bench_with_input(BenchmarkId::new("piece_tree_middle", size), size, |b, _| {
            b.iter_batched(
                || build_tree(text.as_str()),
                |mut tree| {
                    tree.delete(black_box(start), black_box(delete_size));
                    black_box(tree);
                },
                criterion::BatchSize::SmallInput,
            )
        });

        group.bench_with_input(BenchmarkId::new("ropey_middle", size), size, |b, _| {
            b.iter_batched(
                || ropey::Rope::from_str(text.as_str()),
                |mut rope| {
                    rope.remove(black_box(start..start + delete_size));
                    black_box(rope);
                },
                criterion::BatchSize::SmallInput,
            )
        });

        group.bench_with_input(BenchmarkId::new("string_middle", size), size, |b, _| {
            b.iter_batched(
                || text.clone(),
                |mut string| {
                    string.replace_range(black_box(start..start + delete_size), "");
                    black_box(string);
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_line_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("line_access");

    for size in [10_000, 100_000].iter() {
        let text = sample_text(*size);
        let tree = build_tree(text.as_str());
        let rope = ropey::Rope::from_str(text.as_str());
        let line_count = tree.get_line_count();

        group.throughput(Throughput::Elements(line_count as u64));

        group.bench_with_input(BenchmarkId::new("piece_tree", size), &tree, |b, tree| {
            b.iter(|| {
                for line in 1..=tree.get_line_count() {
                    black_box(tree.get_line_content(black_box(line)));
                }
            })
        });

        group.bench_with_input(BenchmarkId::new("ropey", size), &rope, |b, rope| {
            b.iter(|| {
                for line in 0..rope.len_lines() {
                    black_box(rope.line(black_box(line)));
                }
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_creation,
    bench_insert_operations,
    bench_delete_operations,
    bench_line_access
);
criterion_main!(benches);
