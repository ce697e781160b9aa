use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{json, Value};
use stockroom_core::{Reference, ServerId, TempId};
use stockroom_inventory::{PRODUCTS, STOCK_INS};
use stockroom_sync::projection::{project, EntitySnapshot, ProjectionInput, ViewOrder};
use stockroom_sync::record::{
    Draft, EntityRecord, Fields, IdentityMapping, PendingCreate, PendingDelete, PendingUpdate,
    RetryMeta,
};

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

fn cached(id: String, body: Value, refs: &[(&str, String)]) -> EntityRecord {
    let now = Utc::now();
    EntityRecord {
        id: ServerId::new(id),
        fields: fields(body),
        references: refs
            .iter()
            .map(|(k, v)| (k.to_string(), ServerId::new(v.clone())))
            .collect(),
        created_at: now,
        updated_at: now,
    }
}

/// `n` cached products with stock-ins, a tenth of them edited, a tenth
/// deleted, and `n / 5` unsynced products each with an unsynced stock-in.
fn input(n: usize) -> ProjectionInput {
    let now = Utc::now();
    let mut products = EntitySnapshot::default();
    let mut stock_ins = EntitySnapshot::default();

    for i in 0..n {
        let pid = format!("p-{i}");
        products
            .cache
            .push(cached(pid.clone(), json!({"name": format!("item {i}"), "sku": i}), &[]));
        stock_ins.cache.push(cached(
            format!("s-{i}"),
            json!({"quantity": i % 17}),
            &[("productId", pid.clone())],
        ));
        if i % 10 == 0 {
            products.updates.push(PendingUpdate::new(
                ServerId::new(pid.clone()),
                Draft::new().field("name", format!("renamed {i}")),
                now,
            ));
        }
        if i % 10 == 5 {
            products.deletes.push(PendingDelete {
                target: ServerId::new(pid),
                deleted_by: None,
                deleted_at: now,
                retry: RetryMeta::default(),
            });
        }
    }

    for i in 0..n / 5 {
        let temp = TempId::new();
        products.creates.push(PendingCreate::new(
            temp,
            Draft::new().field("name", format!("new {i}")),
            now,
        ));
        if i % 2 == 0 {
            products.ledger.push(IdentityMapping {
                temp_id: temp,
                server_id: ServerId::new(format!("p-new-{i}")),
                synced_at: now,
            });
        }
        stock_ins.creates.push(PendingCreate::new(
            TempId::new(),
            Draft {
                fields: fields(json!({"quantity": 1})),
                references: BTreeMap::from([("productId".to_string(), Reference::Temporary(temp))]),
            },
            now,
        ));
    }

    ProjectionInput::new()
        .with(PRODUCTS, products)
        .with(STOCK_INS, stock_ins)
}

fn bench_projection(c: &mut Criterion) {
    let registry = stockroom_inventory::registry().unwrap();
    let mut group = c.benchmark_group("projection");

    for n in [100usize, 1_000, 10_000] {
        let input = input(n);
        group.throughput(Throughput::Elements(n as u64 * 2));
        group.bench_with_input(BenchmarkId::new("unsynced_first", n), &input, |b, input| {
            b.iter(|| project(black_box(&registry), black_box(input), ViewOrder::UnsyncedFirst));
        });
        group.bench_with_input(BenchmarkId::new("stored", n), &input, |b, input| {
            b.iter(|| project(black_box(&registry), black_box(input), ViewOrder::Stored));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_projection);
criterion_main!(benches);
