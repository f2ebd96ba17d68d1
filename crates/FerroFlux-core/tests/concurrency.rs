//! §8 concurrency properties: P6 (single-flight blueprint compile), P7 (pool
//! bound), P9 (cancellation liveness).

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{conn, node};
use ferroflux_core::{
    BlockSpecBuilder, EngineManager, EngineManagerConfig, Executor, GenericInstance, Schema,
};
use tokio_util::sync::CancellationToken;

/// P6: N concurrent `acquire` calls for the same cold key compile the
/// blueprint exactly once.
#[tokio::test]
async fn p6_single_flight_compile() {
    let compile_count = Arc::new(AtomicUsize::new(0));

    let spec = BlockSpecBuilder::new("Counted").add_output("O").build();
    let counter = compile_count.clone();
    let registry = common::registry_with(vec![GenericInstance::template(spec, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        |io: &mut ferroflux_core::GenericInstanceIo, _ctx: &ferroflux_core::ComputeContext| {
            io.set_output("O", ferroflux_core::Signal::scalar(1.0));
            Ok(())
        }
    })]);

    let manager = EngineManager::new(EngineManagerConfig::default());
    manager.register_business("biz", registry);

    let schema = Schema { nodes: vec![node("n", "Counted")], connections: vec![] };

    let mut handles = Vec::new();
    for _ in 0..16 {
        let manager = manager.clone();
        let schema = schema.clone();
        handles.push(tokio::spawn(async move {
            let scoped = manager.acquire("biz", &schema).await.unwrap();
            drop(scoped);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    // The blueprint itself is built exactly once no matter how many
    // `acquire` calls raced on the same cold key; the compile-lock serializes
    // the miss path so only the first caller through it runs `Compiler::compile`.
    assert_eq!(manager.stats().blueprint_count, 1);
    // The factory also runs once per `spawn_plan` (pool miss), so this is
    // just confirming the schema compiled and instantiated at all.
    assert!(compile_count.load(Ordering::SeqCst) >= 1);
}

/// P7: the pool for a key never exceeds its configured capacity even when
/// far more engines are returned than the cap allows.
#[tokio::test]
async fn p7_pool_never_exceeds_capacity() {
    let registry = common::registry_with(vec![common::add_one_block()]);
    let config = EngineManagerConfig { pool_capacity_per_key: 2, ..EngineManagerConfig::default() };
    let manager = EngineManager::new(config);
    manager.register_business("biz", registry);

    let schema = Schema { nodes: vec![node("n", "AddOne")], connections: vec![] };

    let mut handles = Vec::new();
    for _ in 0..10 {
        let manager = manager.clone();
        let schema = schema.clone();
        handles.push(tokio::spawn(async move {
            let scoped = manager.acquire("biz", &schema).await.unwrap();
            drop(scoped);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let key = EngineManager::cache_key("biz", &schema);
    assert!(manager.pool_depth(&key) <= 2);
}

/// P9: cancelling a running `async_run` causes every task to finish (no
/// signal left unset) within a bounded time, even though later steps never
/// actually compute.
#[tokio::test]
async fn p9_cancellation_is_live() {
    let registry = common::registry_with(vec![common::add_one_block()]);
    let schema = Schema {
        nodes: vec![node("n0", "AddOne"), node("n1", "AddOne"), node("n2", "AddOne")],
        connections: vec![conn("c0", "n0", "O", "n1", "I"), conn("c1", "n1", "O", "n2", "I")],
    };

    let mut plan = ferroflux_core::Compiler::compile(&schema, &registry).unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let report = tokio::time::timeout(Duration::from_secs(2), Executor::async_run(&mut plan, token))
        .await
        .expect("async_run must return promptly once cancelled, not hang");

    // Cancellation short-circuits before any node computes in this test
    // (token is pre-cancelled), so the run completes with no error.
    report.outcome.unwrap();
}
