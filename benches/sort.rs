use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::seq::SliceRandom;

use xsorted::{ExternalSorter, ExternalSorterBuilder};

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort");
    group.sample_size(10);

    let mut input: Vec<u64> = (0..200_000).collect();
    input.shuffle(&mut rand::thread_rng());

    for partition_size in [1_000, 8_192, 50_000] {
        let sorter: ExternalSorter = ExternalSorterBuilder::new()
            .with_partition_size(partition_size)
            .build()
            .unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(partition_size), &input, |b, i| {
            b.iter(|| {
                let sorted = sorter.sort(i.iter().copied()).unwrap();
                sorted.for_each(|item| {
                    item.unwrap();
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
