//! Performance benchmarks for fieldsync-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fieldsync_engine::{
    apply_resolution, decode_operation, encode_operation, sort_for_drain, ConflictContext,
    EntityRef, Fields, Method, Operation, OperationKind, Resolution, Side,
};
use serde_json::{json, Value};

const KINDS: [OperationKind; 8] = [
    OperationKind::Completion,
    OperationKind::StatusChange,
    OperationKind::Assignment,
    OperationKind::Waste,
    OperationKind::PartsUsage,
    OperationKind::Signature,
    OperationKind::Attachment,
    OperationKind::Note,
];

fn queued_ops(count: usize) -> Vec<Operation> {
    (0..count)
        .map(|i| {
            Operation::new(
                format!("op_{i}"),
                KINDS[i % KINDS.len()].clone(),
                Method::Patch,
                format!("/work-orders/{}", i % 50),
                json!({"status": "en_route", "version": i}),
                // interleave stamps so sorting does real work
                ((i * 7919) % count) as u64,
                5,
            )
            .map(|op| op.with_entity(EntityRef::new("work_order", (i % 50).to_string())))
            .unwrap()
        })
        .collect()
}

fn snapshot(width: usize, seed: &str) -> Fields {
    let mut fields = Fields::new();
    for i in 0..width {
        let value = if i % 3 == 0 {
            json!(format!("{seed}-{i}"))
        } else {
            json!(i)
        };
        fields.insert(format!("field_{i}"), value);
    }
    fields.insert("status".into(), json!(seed));
    fields.insert("version".into(), json!(seed.len()));
    fields
}

fn bench_drain_ordering(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_ordering");

    for size in [100, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("sort_for_drain", size), size, |b, &size| {
            let ops = queued_ops(size);
            b.iter(|| {
                let mut ops = ops.clone();
                sort_for_drain(black_box(&mut ops));
                ops
            })
        });
    }

    group.finish();
}

fn bench_conflicts(c: &mut Criterion) {
    let mut group = c.benchmark_group("conflicts");

    for width in [10, 100, 1_000].iter() {
        let context = ConflictContext::build(
            &snapshot(*width, "local"),
            &snapshot(*width, "server-copy"),
            0,
        );

        group.bench_with_input(
            BenchmarkId::new("differing_fields", width),
            &context,
            |b, context| b.iter(|| black_box(context).differing_fields()),
        );

        group.bench_with_input(
            BenchmarkId::new("apply_resolution", width),
            &context,
            |b, context| {
                let mut resolution = Resolution::for_context(context);
                if resolution.choice("status").is_some() {
                    resolution.choose("status", Side::Local).unwrap();
                }
                b.iter(|| apply_resolution(black_box(context), black_box(&resolution)))
            },
        );
    }

    group.finish();
}

fn bench_persistence(c: &mut Criterion) {
    let mut group = c.benchmark_group("persistence");
    let op = queued_ops(1).remove(0);
    let stored: Value = encode_operation(&op);

    group.bench_function("encode_operation", |b| {
        b.iter(|| encode_operation(black_box(&op)))
    });

    group.bench_function("decode_operation", |b| {
        b.iter(|| decode_operation("op:op_0", black_box(stored.clone())))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_drain_ordering,
    bench_conflicts,
    bench_persistence,
);

criterion_main!(benches);
