//! Benchmarks for observation delivery.
//!
//! Performance budgets:
//! - observe() with 4 reads: < 2μs
//! - single mutation + delivery, 1 observer: < 2μs
//! - one transaction touching 16 cells, 64 observers: < 50μs
//! - tracked get() outside any frame: < 20ns
//!
//! Run with: cargo bench -p ftui-observe --bench delivery_bench

use std::hint::black_box;
use std::rc::Rc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ftui_observe::{
    Animation, Observable, TimelineDriver, Transaction, install_driver, observe, run_pending,
    with_transaction,
};

fn cells(n: usize) -> Vec<Observable<u64>> {
    (0..n).map(|_| Observable::new(0)).collect()
}

// =============================================================================
// Registration & reads
// =============================================================================

fn bench_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("observe/register");
    let source = cells(4);

    group.bench_function("observe_4_reads", |b| {
        b.iter(|| {
            let watched = source.clone();
            let token = observe(move |_| {
                black_box(watched.iter().map(Observable::get).sum::<u64>());
            });
            black_box(token)
        })
    });

    group.bench_function("get_outside_frame", |b| {
        let cell = Observable::new(7u64);
        b.iter(|| black_box(cell.get()))
    });

    group.finish();
}

// =============================================================================
// Delivery fan-out
// =============================================================================

fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("observe/fanout");

    for &observers in &[1usize, 16, 64] {
        let source = cells(16);
        let tokens: Vec<_> = (0..observers)
            .map(|i| {
                let watched: Vec<_> = source.iter().skip(i % 4).step_by(4).cloned().collect();
                observe(move |_| {
                    black_box(watched.iter().map(Observable::get).sum::<u64>());
                })
            })
            .collect();

        group.bench_with_input(
            BenchmarkId::new("single_mutation", observers),
            &source,
            |b, source| {
                b.iter(|| {
                    source[0].update(|v| *v += 1);
                    run_pending()
                })
            },
        );

        group.bench_with_input(
            BenchmarkId::new("transaction_16_cells", observers),
            &source,
            |b, source| {
                b.iter(|| {
                    with_transaction(Transaction::default(), || {
                        for cell in source {
                            cell.update(|v| *v += 1);
                        }
                    });
                    run_pending()
                })
            },
        );

        drop(tokens);
    }

    group.finish();
}

// =============================================================================
// Animated delivery
// =============================================================================

fn bench_animated(c: &mut Criterion) {
    let mut group = c.benchmark_group("observe/animated");
    let driver = Rc::new(TimelineDriver::new());
    let previous = install_driver(driver.clone());
    let cell = Observable::new(0u64);
    let _token = {
        let cell = cell.clone();
        observe(move |_| {
            black_box(cell.get());
        })
    };

    group.bench_function("interrupting_effect", |b| {
        b.iter(|| {
            let txn = Transaction::animated(Animation::default()).on_complete(|ok| {
                black_box(ok);
            });
            cell.update(|v| *v += 1);
            with_transaction(txn, || cell.update(|v| *v += 1));
            run_pending()
        })
    });

    driver.finish_all();
    install_driver(previous);
    group.finish();
}

criterion_group!(benches, bench_register, bench_fanout, bench_animated);
criterion_main!(benches);
