//! End-to-end tests for the load -> step -> feedback -> schedule loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};

use tempo_core::feedback;
use tempo_core::ipc::ThreadChannel;
use tempo_core::module::{Callable, Fetcher, FunctionRegistry, RegistryLoader};
use tempo_core::{
    CompiledModule, Controller, Engine, EngineProxy, EngineSnapshot, ExecutionConfig,
    FeedbackMapping, FrameScheduler, LoadError, ModuleCache, OutputSpec, Record, StepEngine,
    TimerScheduler,
};

// =============================================================================
// Test Helpers
// =============================================================================

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {}", other),
    }
}

fn outputs(names: &[&str]) -> OutputSpec {
    names
        .iter()
        .map(|name| (name.to_string(), Default::default()))
        .collect()
}

fn registry() -> Arc<FunctionRegistry> {
    let int = |i: &Record, key: &str| i.get(key).and_then(Value::as_i64).unwrap_or(0);
    let mut registry = FunctionRegistry::new();
    registry
        .register("arith.sum", move |i: &Record| Ok(json!(int(i, "a") + int(i, "b"))))
        .register("grid.copy", |i: &Record| {
            i.get("rows").cloned().ok_or_else(|| "rows missing".to_string())
        })
        .register("counter.next", move |i: &Record| Ok(json!(int(i, "count") + 1)));
    Arc::new(registry)
}

/// Serves manifests from memory; `mem://flaky` answers 404 until fixed.
#[derive(Default)]
struct MemoryFetcher {
    transfers: AtomicUsize,
    flaky_fixed: AtomicBool,
}

impl MemoryFetcher {
    fn manifest(location: &str) -> Option<&'static str> {
        match location {
            "mem://sum" | "mem://flaky" => Some(r#"{"exports":{"_sum":"arith.sum"}}"#),
            "mem://grid" => Some(r#"{"exports":{"_next_state":"grid.copy"}}"#),
            "mem://counter" => Some(r#"{"exports":{"_next":"counter.next"}}"#),
            _ => None,
        }
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, location: &str) -> BoxFuture<'static, Result<Vec<u8>, LoadError>> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        let broken = location == "mem://flaky" && !self.flaky_fixed.load(Ordering::SeqCst);
        let manifest = Self::manifest(location);
        async move {
            tokio::task::yield_now().await;
            match manifest {
                Some(body) if !broken => Ok(body.as_bytes().to_vec()),
                _ => Err(LoadError::Transfer {
                    status: 404,
                    message: "Not Found".to_string(),
                }),
            }
        }
        .boxed()
    }
}

fn cache(fetcher: &Arc<MemoryFetcher>) -> ModuleCache {
    let fetcher: Arc<dyn Fetcher> = Arc::clone(fetcher) as Arc<dyn Fetcher>;
    ModuleCache::new(fetcher, Arc::new(RegistryLoader::new(registry())))
}

fn collect(controller: &Controller) -> Arc<Mutex<Vec<EngineSnapshot>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    controller.subscribe(move |s| sink.lock().unwrap().push(s.clone()));
    seen
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_sum_single_step() {
    let fetcher = Arc::new(MemoryFetcher::default());
    let module = cache(&fetcher).load("mem://sum").await.unwrap();
    let mut engine = Engine::new(
        module,
        outputs(&["sum"]),
        ExecutionConfig::Single,
        record(json!({ "a": 3, "b": 4 })),
    );

    let snap = engine.step();

    assert_eq!(snap.outputs, Some(record(json!({ "sum": 7, "step": 1 }))));
    assert_eq!(snap.step_count, 1);
    assert_eq!(snap.error, None);
}

#[tokio::test]
async fn test_single_mode_step_field_tracks_count() {
    let fetcher = Arc::new(MemoryFetcher::default());
    let module = cache(&fetcher).load("mem://sum").await.unwrap();
    let mut engine = Engine::new(
        module,
        outputs(&["sum"]),
        ExecutionConfig::Single,
        record(json!({ "a": 1, "b": 1 })),
    );

    for n in 1..=5u64 {
        let snap = engine.step();
        assert_eq!(snap.step_count, n);
        assert_eq!(snap.input["step"], json!(n));
    }
}

#[tokio::test]
async fn test_grid_feedback() {
    let fetcher = Arc::new(MemoryFetcher::default());
    let module = cache(&fetcher).load("mem://grid").await.unwrap();
    let rows = json!([[0, 1], [1, 0]]);
    let mut engine = Engine::new(
        module,
        outputs(&["next_state"]),
        ExecutionConfig::continuous(vec![FeedbackMapping::new("next_state", "rows")]),
        record(json!({ "rows": rows })),
    );

    let snap = engine.step();

    assert_eq!(snap.outputs.unwrap()["next_state"], rows);
    assert_eq!(engine.snapshot().input["rows"], rows);
}

#[tokio::test]
async fn test_missing_output_leaves_count() {
    let fetcher = Arc::new(MemoryFetcher::default());
    let module = cache(&fetcher).load("mem://sum").await.unwrap();
    let mut engine = Engine::new(
        module,
        outputs(&["sum", "product"]),
        ExecutionConfig::Single,
        record(json!({ "a": 1, "b": 2 })),
    );

    let snap = engine.step();

    assert_eq!(snap.step_count, 0);
    assert!(snap.error.unwrap().contains("product"));
}

#[tokio::test]
async fn test_concurrent_loads_share_one_transfer() {
    let fetcher = Arc::new(MemoryFetcher::default());
    let cache = cache(&fetcher);

    let (a, b) = tokio::join!(cache.load("mem://sum"), cache.load("mem://sum"));

    assert_eq!(fetcher.transfers.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
}

#[tokio::test]
async fn test_failed_load_is_retried() {
    let fetcher = Arc::new(MemoryFetcher::default());
    let cache = cache(&fetcher);

    let err = cache.load("mem://flaky").await.unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert!(!cache.contains("mem://flaky"));

    fetcher.flaky_fixed.store(true, Ordering::SeqCst);
    let module = cache.load("mem://flaky").await.unwrap();

    assert_eq!(module.location(), "mem://flaky");
    assert_eq!(fetcher.transfers.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_play_one_tick_then_pause() {
    let fetcher = Arc::new(MemoryFetcher::default());
    let module = cache(&fetcher).load("mem://counter").await.unwrap();
    let engine = Engine::new(
        module,
        outputs(&["next"]),
        ExecutionConfig::continuous(vec![FeedbackMapping::new("next", "count")]),
        record(json!({ "count": 0 })),
    );

    let controller = Controller::new(Arc::new(TimerScheduler::new()));
    controller.init(Box::new(engine), None).await;
    let seen = collect(&controller);

    controller.play(Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(101)).await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(seen.lock().unwrap()[0].step_count, 1);

    controller.pause();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_frame_scheduler_drives_controller() {
    let fetcher = Arc::new(MemoryFetcher::default());
    let module = cache(&fetcher).load("mem://counter").await.unwrap();
    let engine = Engine::new(
        module,
        outputs(&["next"]),
        ExecutionConfig::continuous(vec![FeedbackMapping::new("next", "count")]),
        record(json!({ "count": 0 })),
    );

    let controller = Controller::new(Arc::new(FrameScheduler::with_frame_rate(60)));
    controller.init(Box::new(engine), None).await;
    let seen = collect(&controller);

    controller.play_limited(Duration::from_millis(50), Some(3));
    tokio::time::sleep(Duration::from_secs(2)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2].input["count"], json!(3));
    assert!(!controller.is_playing());
}

#[test]
fn test_feedback_leaves_untargeted_keys() {
    let input = record(json!({ "a": 1, "b": [1, 2], "c": { "d": true }, "e": null }));
    let outs = record(json!({ "x": 10, "y": { "z": "deep" } }));

    let cases = [
        vec![],
        vec![FeedbackMapping::new("x", "a")],
        vec![FeedbackMapping::new("x", "new"), FeedbackMapping::new("y.z", "c.d")],
        vec![FeedbackMapping::new("missing", "b")],
        vec![FeedbackMapping::new("y", "e"), FeedbackMapping::new("x", "e")],
    ];

    for mappings in cases {
        let next = feedback::apply(&mappings, &outs, &input);
        let targets: Vec<&str> = mappings
            .iter()
            .map(|m| m.to_input.split('.').next().unwrap())
            .collect();
        for (key, value) in &input {
            if !targets.contains(&key.as_str()) {
                assert_eq!(next.get(key), Some(value), "key {} changed by {:?}", key, mappings);
            }
        }
    }
}

#[tokio::test]
async fn test_controller_over_worker_thread() {
    let fetcher = Arc::new(MemoryFetcher::default());
    let channel = ThreadChannel::spawn(cache(&fetcher)).unwrap();
    let proxy = EngineProxy::start(
        Box::new(channel),
        "mem://counter",
        &outputs(&["next"]),
        &ExecutionConfig::continuous(vec![FeedbackMapping::new("next", "count")]),
        &record(json!({ "count": 5 })),
    )
    .await
    .unwrap();

    let controller = Controller::new(Arc::new(TimerScheduler::new()));
    controller.init(Box::new(proxy), None).await;
    let seen = collect(&controller);

    controller.step().await;
    let snap = controller.step().await;

    assert_eq!(snap.step_count, 2);
    assert_eq!(snap.input["count"], json!(7));
    assert_eq!(seen.lock().unwrap().len(), 2);

    controller.destroy().await;
    let after = controller.step().await;
    assert_eq!(after.error.as_deref(), Some("engine not initialized"));
}

#[tokio::test]
async fn test_modules_from_closures() {
    let double: Callable = Arc::new(|i: &Record| {
        Ok(json!(i.get("x").and_then(Value::as_f64).unwrap_or(0.0) * 2.0))
    });
    let module = Arc::new(CompiledModule::from_exports("mem://inline", [("_double", double)]));
    let mut engine: Box<dyn StepEngine> = Box::new(Engine::new(
        module,
        outputs(&["double"]),
        ExecutionConfig::continuous(vec![FeedbackMapping::new("double", "x")]),
        record(json!({ "x": 1.5 })),
    ));

    let history = tempo_core::run_iterations(&mut engine, 3).await;

    let values: Vec<f64> = history
        .iter()
        .map(|h| h.outputs["double"].as_f64().unwrap())
        .collect();
    assert_eq!(values, vec![3.0, 6.0, 12.0]);
}
