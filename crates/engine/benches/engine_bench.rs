use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use engine::{ActionDef, Schema, StateMachineDef, load, patch};
use event_store::{EventMeta, InMemoryStore, Message, Store};
use serde_json::json;

fn bench_patch_nested(c: &mut Criterion) {
    let original = json!({
        "profile": {"name": "a", "tags": ["x", "y"]},
        "totals": {"opened": 10, "closed": 4},
    });
    let partial = json!({
        "totals": {"closed": 5},
        "profile": {"tags": ["x", "y", "z"]},
    });

    c.bench_function("engine/patch_nested", |b| {
        b.iter(|| {
            let merged = patch(&original, &partial);
            assert_eq!(merged["totals"]["closed"], 5);
        });
    });
}

fn bench_load_fold_500(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let machine = StateMachineDef::new("Counter", || json!({"total": 0}))
        .patch("Incremented", |state, event| {
            json!({"total": state["total"].as_i64().unwrap_or(0)
                + event.data["by"].as_i64().unwrap_or(0)})
        })
        .action(
            "Increment",
            ActionDef::new(|payload, _, _| Ok(vec![Message::new("Incremented", payload.clone())]))
                .schema(Schema::any()),
        );

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    rt.block_on(async {
        for _ in 0..500 {
            store
                .commit(
                    "counter-1",
                    &[Message::new("Incremented", json!({"by": 1}))],
                    EventMeta::new("corr-1"),
                    None,
                )
                .await
                .unwrap();
        }
    });

    c.bench_function("engine/load_fold_500", |b| {
        b.iter(|| {
            rt.block_on(async {
                let snapshot = load(store.as_ref(), &machine, "counter-1", None)
                    .await
                    .unwrap();
                assert_eq!(snapshot.state["total"], 500);
            });
        });
    });
}

criterion_group!(benches, bench_patch_nested, bench_load_fold_500);
criterion_main!(benches);
