use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use evtree::iter::EVT_ITER_VISIBLE;
use evtree::{
    Allocator, EntryIn, EvTree, EvtConfig, EvtFilter, EvtIter, ImmediateFree, IterOptions, MemPool, Probe,
    Rect, Resolver,
};
use evtree::resolve::Candidate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

const VALUE: [u8; 64] = [b'v'; 64];

fn new_tree(order: u16) -> EvTree {
    let pool: Arc<dyn Allocator> = Arc::new(MemPool::with_capacity(256 << 20));
    EvTree::create(EvtConfig::with_order(order), pool, Arc::new(ImmediateFree))
        .expect("Failed to create tree")
}

/// Random overlapping writes of up to 64 indices, one epoch each
fn random_rects(count: usize, space: u64, seed: u64) -> Vec<Rect> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let lo = rng.gen_range(0..space);
            let len = rng.gen_range(1..=64u64);
            Rect::new(lo, lo + len - 1, i as u64 + 1, 0)
        })
        .collect()
}

fn populate(tree: &mut EvTree, rects: &[Rect]) {
    for rect in rects {
        let bytes = &VALUE[..rect.width() as usize];
        tree.insert(EntryIn::data(*rect, 1, bytes)).expect("Failed to insert");
    }
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.measurement_time(Duration::from_secs(5));
    group.sample_size(30);

    for order in [4u16, 16, 64] {
        let rects = random_rects(2_000, 100_000, 42);
        group.bench_with_input(BenchmarkId::new("random", order), &order, |b, &order| {
            b.iter(|| {
                let mut tree = new_tree(order);
                populate(&mut tree, &rects);
                black_box(tree.depth().expect("Failed to read depth"))
            })
        });
    }

    let sequential: Vec<Rect> = (0..2_000u64).map(|i| Rect::new(i * 8, i * 8 + 7, 1, 0)).collect();
    group.bench_function("sequential", |b| {
        b.iter(|| {
            let mut tree = new_tree(16);
            populate(&mut tree, &sequential);
            black_box(tree.len().expect("Failed to count"))
        })
    });

    group.finish();
}

fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("find");
    group.measurement_time(Duration::from_secs(5));

    let mut tree = new_tree(16);
    let rects = random_rects(10_000, 100_000, 7);
    populate(&mut tree, &rects);
    let mut rng = StdRng::seed_from_u64(99);

    for width in [16u64, 256, 4096] {
        group.bench_with_input(BenchmarkId::new("visible", width), &width, |b, &width| {
            b.iter(|| {
                let lo = rng.gen_range(0..100_000u64);
                let filter = EvtFilter::new(lo, lo + width - 1, rects.len() as u64);
                black_box(tree.find(&filter).expect("Failed to find").len())
            })
        });
    }

    group.bench_function("find_same", |b| {
        b.iter(|| {
            let rect = rects[rng.gen_range(0..rects.len())];
            black_box(tree.find_same(&rect).expect("Failed to find record"))
        })
    });

    group.finish();
}

fn bench_iterate(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterate");
    group.measurement_time(Duration::from_secs(5));

    let mut tree = new_tree(16);
    populate(&mut tree, &random_rects(5_000, 50_000, 11));

    for (name, options) in [
        ("embedded", IterOptions::default()),
        ("visible", IterOptions::from_flags(EVT_ITER_VISIBLE).expect("Invalid flags")),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut iter = EvtIter::prepare(&mut tree, options, EvtFilter::all()).expect("Failed to prepare");
                iter.probe(Probe::First).expect("Failed to probe");
                let mut count = 0usize;
                while iter.fetch().is_ok() {
                    count += 1;
                    if iter.next().is_err() {
                        break;
                    }
                }
                black_box(count)
            })
        });
    }

    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");

    for count in [16usize, 256, 4096] {
        let candidates: Vec<Candidate> = random_rects(count, 10_000, 3)
            .into_iter()
            .map(|rect| Candidate { rect, punch: false })
            .collect();
        let mut resolver = Resolver::new();
        group.bench_with_input(BenchmarkId::from_parameter(count), &candidates, |b, candidates| {
            b.iter(|| black_box(resolver.resolve(candidates, None).visible_width()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_find, bench_iterate, bench_resolve);
criterion_main!(benches);
