//! Benchmarks for the hot paths of the binding layer against the fake engine.
//!
//! - Scopes: registering and bulk-releasing handles.
//! - Call frames: pointer calls to a utility function.
//! - Variant bridge: encode/decode of plain values and strings.
//! - Virtual dispatch: engine-side calls through the trampoline table.
//!
//! ## Profiling with Puffin
//!
//! ```bash
//! cargo bench --features profile-with-puffin -- --profile-time 5
//! ```

use std::hint::black_box;
use std::ptr;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use gdbridge::frame::{CallFrame, EntryPoint};
use gdbridge::methods::UtilityFunction;
use gdbridge::prelude::*;
use gdbridge::sys::{ConstTypePtr, TypePtr};
use gdbridge::variant::{decode, encode};
use gdbridge_core::testing::{self, FakeEngine};

#[cfg(feature = "profile-with-puffin")]
static FRAME_VIEW: std::sync::OnceLock<puffin::GlobalFrameView> = std::sync::OnceLock::new();

#[cfg(feature = "profile-with-puffin")]
fn setup_profiler() {
    puffin::set_scopes_on(true);
    FRAME_VIEW.get_or_init(puffin::GlobalFrameView::default);
}

#[cfg(not(feature = "profile-with-puffin"))]
fn setup_profiler() {}

#[cfg(feature = "profile-with-puffin")]
fn end_profiling_frame() {
    puffin::GlobalProfiler::lock().new_frame();
}

#[cfg(not(feature = "profile-with-puffin"))]
fn end_profiling_frame() {}

#[cfg(feature = "profile-with-puffin")]
fn print_profiling_stats() {
    let Some(frame_view) = FRAME_VIEW.get() else {
        println!("Profiler not initialized");
        return;
    };
    let view = frame_view.lock();
    let frames = view.recent_frames().count();
    println!("\n=== Profiling: {frames} frames recorded ===\n");
}

#[cfg(not(feature = "profile-with-puffin"))]
fn print_profiling_stats() {}

fn scope_benchmarks(c: &mut Criterion) {
    setup_profiler();
    let engine = FakeEngine::new();
    let ctx = Context::new(engine.runtime());

    let mut group = c.benchmark_group("scope");
    for count in [1usize, 16, 256] {
        group.bench_function(format!("register_and_end_{count}"), |b| {
            b.iter(|| {
                let life = ctx.scope();
                for _ in 0..count {
                    black_box(GString::new_in(&life));
                }
                life.end();
                end_profiling_frame();
            });
        });
    }
    group.bench_function("nested_children_8", |b| {
        b.iter(|| {
            let root = ctx.scope();
            let mut current = root.clone();
            for _ in 0..8 {
                current = current.child();
                black_box(GString::new_in(&current));
            }
            root.end();
            end_profiling_frame();
        });
    });
    group.finish();
    print_profiling_stats();
}

fn frame_benchmarks(c: &mut Criterion) {
    setup_profiler();
    let engine = FakeEngine::new();
    let runtime = engine.runtime();
    let ctx = Context::new(runtime.clone());
    let life = ctx.scope();
    let absi = UtilityFunction::resolve(runtime.api(), "absi", testing::ABSI_HASH).unwrap();

    let mut group = c.benchmark_group("frame");
    group.bench_function("utility_ptrcall", |b| {
        b.iter(|| {
            let mut frame = CallFrame::open(&runtime);
            frame.push(&black_box(-42i64));
            unsafe { frame.invoke(EntryPoint::Utility(absi), ptr::null_mut()) };
            let value: i64 = unsafe { frame.result(&life) };
            frame.close();
            end_profiling_frame();
            black_box(value)
        });
    });
    group.finish();
    life.end();
    print_profiling_stats();
}

fn variant_benchmarks(c: &mut Criterion) {
    setup_profiler();
    let engine = FakeEngine::new();
    let ctx = Context::new(engine.runtime());

    let mut group = c.benchmark_group("variant");
    group.bench_function("int_round_trip", |b| {
        b.iter_batched(
            || ctx.scope(),
            |life| {
                let value = decode::<i64>(&encode(&black_box(7i64), &life), &life);
                life.end();
                black_box(value)
            },
            BatchSize::SmallInput,
        );
    });
    group.bench_function("vector3_round_trip", |b| {
        b.iter_batched(
            || ctx.scope(),
            |life| {
                let value = decode::<Vector3>(&encode(&Vector3::new(1.0, 2.0, 3.0), &life), &life);
                life.end();
                black_box(value)
            },
            BatchSize::SmallInput,
        );
    });
    group.bench_function("string_round_trip", |b| {
        b.iter_batched(
            || ctx.scope(),
            |life| {
                let value = "hello".to_variant(&life).to::<String>(&life);
                life.end();
                black_box(value)
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
    print_profiling_stats();
}

struct Counter {
    total: i64,
}

fn dispatch_benchmarks(c: &mut Criterion) {
    setup_profiler();
    let engine = FakeEngine::new();
    let registry = ClassRegistry::new(engine.runtime());
    let class = ClassBuilder::new("BenchCounter", "Node", |_| Counter { total: 0 }).virtual_method(
        "_step",
        |counter: &mut Counter, by: i64| {
            counter.total += by;
            counter.total
        },
    );
    registry.register(class).unwrap();
    let object = engine.construct("BenchCounter");

    let mut group = c.benchmark_group("dispatch");
    group.bench_function("virtual_one_arg", |b| {
        let by = 1i64;
        let args = [&by as *const i64 as ConstTypePtr];
        let mut out = 0i64;
        b.iter(|| {
            engine.call_virtual(object, "_step", &args, &mut out as *mut i64 as TypePtr);
            end_profiling_frame();
            black_box(out)
        });
    });
    group.finish();
    engine.destroy_object(object);
    registry.unregister_all();
    print_profiling_stats();
}

criterion_group!(benches, scope_benchmarks, frame_benchmarks, variant_benchmarks, dispatch_benchmarks);
criterion_main!(benches);
