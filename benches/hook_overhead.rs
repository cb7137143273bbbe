/// Hook overhead benchmarks
///
/// Measures the per-call cost the tracer adds to instrumented code: one
/// enter/exit pair, nested pairs, and contended recording from several threads.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use latencywatch::config::TracerConfig;
use latencywatch::{FunctionId, ThreadKey, Tracer};
use std::sync::Arc;
use std::thread;

fn tracer() -> Tracer {
    Tracer::new(TracerConfig::default().enabled()).expect("tracer")
}

fn bench_enter_exit_pair(c: &mut Criterion) {
    let tracer = tracer();
    let function = FunctionId::new("bench::leaf", "benches/hook_overhead.rs", 1);
    let thread = ThreadKey::current();

    c.bench_function("enter_exit_pair", |b| {
        b.iter(|| {
            tracer.notify_call_enter(thread, function.clone());
            black_box(tracer.notify_call_exit(thread, &function));
        })
    });

    c.bench_function("call_guard", |b| {
        b.iter(|| {
            let _guard = tracer.enter(function.clone());
        })
    });
}

fn bench_disabled(c: &mut Criterion) {
    let tracer = Tracer::new(TracerConfig::default()).expect("tracer");
    let function = FunctionId::new("bench::leaf", "benches/hook_overhead.rs", 1);

    c.bench_function("disabled_call_guard", |b| {
        b.iter(|| {
            let _guard = tracer.enter(black_box(function.clone()));
        })
    });
}

fn bench_nested(c: &mut Criterion) {
    let mut group = c.benchmark_group("nested_depth");
    let tracer = tracer();
    let thread = ThreadKey::current();
    let functions: Vec<FunctionId> = (0..64)
        .map(|i| FunctionId::new(format!("bench::level{}", i), "benches/hook_overhead.rs", i))
        .collect();

    for depth in [1usize, 8, 64] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                for function in &functions[..depth] {
                    tracer.notify_call_enter(thread, function.clone());
                }
                for function in functions[..depth].iter().rev() {
                    black_box(tracer.notify_call_exit(thread, function));
                }
            })
        });
    }
    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_threads");
    group.sample_size(20);

    for threads in [2usize, 4] {
        group.throughput(Throughput::Elements((threads * 1000) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let tracer = Arc::new(tracer());
            let function = FunctionId::new("bench::shared", "benches/hook_overhead.rs", 1);
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let tracer = Arc::clone(&tracer);
                        let function = function.clone();
                        thread::spawn(move || {
                            let thread = ThreadKey::current();
                            for _ in 0..1000 {
                                tracer.notify_call_enter(thread, function.clone());
                                tracer.notify_call_exit(thread, &function);
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().expect("bench thread");
                }
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_enter_exit_pair,
    bench_disabled,
    bench_nested,
    bench_contended
);
criterion_main!(benches);
