//! Play/pause/step coordination over an engine and a scheduler.
//!
//! The controller is `Idle` or `Playing`. While playing exactly one tick is
//! pending; each tick steps the engine, broadcasts the snapshot and re-arms
//! the scheduler, unless the step failed or the iteration limit was reached,
//! in which case playback stops.
//!
//! ```text
//!   Idle ──play(interval)──▶ Playing ──tick──▶ Playing (re-armed)
//!    ▲                          │  │
//!    └────────pause()───────────┘  └──tick with error / limit──▶ Idle
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::FutureExt;

use crate::engine::StepEngine;
use crate::schedule::{Scheduler, TimerHandle};
use crate::types::{EngineSnapshot, ExecutionConfig, InputSchema, Record};
use crate::validate::{InputValidator, validate_input};

/// Interval used when a continuous config carries no playback speed.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);

/// Lower bound applied to configured playback speeds.
pub const MIN_INTERVAL: Duration = Duration::from_millis(50);

/// Scheduling interval for a config's playback speed (milliseconds per step).
pub fn playback_interval(config: &ExecutionConfig) -> Duration {
    config
        .playback_speed()
        .unwrap_or(DEFAULT_INTERVAL)
        .max(MIN_INTERVAL)
}

/// Callback receiving every snapshot the controller reports.
pub type Listener = Arc<dyn Fn(&EngineSnapshot) + Send + Sync>;

struct PlayState {
    playing: bool,
    interval: Duration,
    pending: Option<TimerHandle>,
    // Bumped on every arm; a tick only acts if it carries the current value.
    generation: u64,
    max_iterations: Option<u64>,
    last: EngineSnapshot,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

struct Validation {
    validator: Arc<dyn InputValidator>,
    schema: InputSchema,
}

struct Inner {
    scheduler: Arc<dyn Scheduler>,
    engine: tokio::sync::Mutex<Option<Box<dyn StepEngine>>>,
    state: Mutex<PlayState>,
    subscribers: Mutex<Subscribers>,
    validation: Mutex<Option<Validation>>,
}

/// Cheaply cloneable handle to a controller session.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

/// Returned by [`Controller::subscribe`].
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    /// Stop receiving snapshots. No-op if the controller is gone.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner.subscribers).listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Worker teardown joins threads and waits on processes, so it runs on the
/// blocking pool.
async fn shutdown_engine(mut engine: Box<dyn StepEngine>) {
    if let Err(e) = tokio::task::spawn_blocking(move || engine.shutdown()).await {
        tracing::warn!("Engine shutdown failed: {}", e);
    }
}

impl Controller {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                scheduler,
                engine: tokio::sync::Mutex::new(None),
                state: Mutex::new(PlayState {
                    playing: false,
                    interval: DEFAULT_INTERVAL,
                    pending: None,
                    generation: 0,
                    max_iterations: None,
                    last: EngineSnapshot::default(),
                }),
                subscribers: Mutex::new(Subscribers::default()),
                validation: Mutex::new(None),
            }),
        }
    }

    /// Check every input against `schema` before stepping.
    pub fn with_validator(self, validator: Arc<dyn InputValidator>, schema: InputSchema) -> Self {
        *lock(&self.inner.validation) = Some(Validation { validator, schema });
        self
    }

    /// Bind a new engine, replacing (and shutting down) any previous one.
    ///
    /// Stops playback and broadcasts the new engine's snapshot.
    pub async fn init(&self, engine: Box<dyn StepEngine>, initial_input: Option<Record>) {
        self.pause();

        let snapshot = {
            let mut slot = self.inner.engine.lock().await;
            if let Some(old) = slot.take() {
                shutdown_engine(old).await;
            }
            let engine = slot.insert(engine);
            if let Some(input) = initial_input {
                engine.set_input(input);
            }
            engine.snapshot()
        };

        tracing::info!("Controller bound to new engine");
        self.publish(snapshot);
    }

    /// Start autoplay at `interval`. No-op while already playing.
    pub fn play(&self, interval: Duration) {
        self.play_limited(interval, None);
    }

    /// Start autoplay with the pacing and iteration limit of `config`.
    pub fn play_config(&self, config: &ExecutionConfig) {
        self.play_limited(playback_interval(config), config.max_iterations());
    }

    /// Start autoplay, pausing once the step count reaches `max_iterations`.
    ///
    /// Stays idle when the step count is already at the limit.
    pub fn play_limited(&self, interval: Duration, max_iterations: Option<u64>) {
        let mut state = lock(&self.inner.state);
        if state.playing {
            return;
        }
        if let Some(max) = max_iterations.filter(|max| state.last.step_count >= *max) {
            tracing::debug!(
                "Already at {} of {} iterations, not playing",
                state.last.step_count,
                max
            );
            return;
        }
        state.playing = true;
        state.interval = interval;
        state.max_iterations = max_iterations;
        let handle = self.arm(&mut state);
        state.pending = Some(handle);
        tracing::debug!("Playing every {:?}", interval);
    }

    /// Stop autoplay, cancelling the pending tick. Idempotent.
    pub fn pause(&self) {
        let mut state = lock(&self.inner.state);
        state.playing = false;
        if let Some(handle) = state.pending.take() {
            self.inner.scheduler.cancel(handle);
            tracing::debug!("Paused");
        }
    }

    /// Change the autoplay interval. While playing this is a pause followed
    /// by a play, so the pending tick is replaced rather than modified.
    pub fn set_interval(&self, interval: Duration) {
        if self.is_playing() {
            let max_iterations = lock(&self.inner.state).max_iterations;
            self.pause();
            self.play_limited(interval, max_iterations);
        } else {
            lock(&self.inner.state).interval = interval;
        }
    }

    /// Step once and broadcast the result. Does not affect autoplay.
    pub async fn step(&self) -> EngineSnapshot {
        let snapshot = self.run_step().await;
        self.publish(snapshot.clone());
        snapshot
    }

    /// Replace the engine's input and broadcast the resulting snapshot.
    pub async fn set_input(&self, input: Record) {
        let snapshot = {
            let mut slot = self.inner.engine.lock().await;
            match slot.as_mut() {
                Some(engine) => {
                    engine.set_input(input);
                    engine.snapshot()
                }
                None => return,
            }
        };
        self.publish(snapshot);
    }

    /// Register a listener for every subsequent snapshot.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EngineSnapshot) + Send + Sync + 'static,
    {
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.listeners.push((id, Arc::new(listener)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.inner.state).playing
    }

    pub fn step_count(&self) -> u64 {
        lock(&self.inner.state).last.step_count
    }

    pub fn interval(&self) -> Duration {
        lock(&self.inner.state).interval
    }

    /// Last snapshot reported to subscribers.
    ///
    /// After a rejected input this carries the validation error, while the
    /// engine's own snapshot stays error-free because no step ran.
    pub fn last_snapshot(&self) -> EngineSnapshot {
        lock(&self.inner.state).last.clone()
    }

    /// Stop playback, shut the engine down and drop every listener.
    pub async fn destroy(&self) {
        self.pause();
        if let Some(engine) = self.inner.engine.lock().await.take() {
            shutdown_engine(engine).await;
        }
        lock(&self.inner.subscribers).listeners.clear();
        tracing::debug!("Controller destroyed");
    }

    fn arm(&self, state: &mut PlayState) -> TimerHandle {
        state.generation += 1;
        let generation = state.generation;
        let weak = Arc::downgrade(&self.inner);

        self.inner.scheduler.schedule(
            state.interval,
            async move {
                if let Some(inner) = weak.upgrade() {
                    Controller { inner }.tick(generation).await;
                }
            }
            .boxed(),
        )
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = lock(&self.inner.state);
        state.playing && state.generation == generation
    }

    async fn tick(self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }

        let snapshot = self.run_step().await;

        {
            let mut state = lock(&self.inner.state);
            // Paused or re-armed while the step ran.
            if state.playing && state.generation == generation {
                let limit_reached = state
                    .max_iterations
                    .is_some_and(|max| snapshot.step_count >= max);

                if snapshot.is_error() || limit_reached {
                    state.playing = false;
                    state.pending = None;
                    if limit_reached {
                        tracing::info!("Reached {} iterations, pausing", snapshot.step_count);
                    } else {
                        tracing::warn!("Step failed, pausing: {}", snapshot.error.as_deref().unwrap_or_default());
                    }
                } else {
                    let handle = self.arm(&mut state);
                    state.pending = Some(handle);
                }
            }
        }

        self.publish(snapshot);
    }

    /// Step the engine, or report why it could not be stepped. Validation
    /// failures leave the engine untouched and exist only in the returned
    /// snapshot.
    async fn run_step(&self) -> EngineSnapshot {
        let mut slot = self.inner.engine.lock().await;
        let Some(engine) = slot.as_mut() else {
            return self.last_snapshot().with_error("engine not initialized");
        };

        let validation_error = {
            let validation = lock(&self.inner.validation);
            validation.as_ref().and_then(|v| {
                validate_input(v.validator.as_ref(), &engine.snapshot().input, &v.schema).err()
            })
        };
        if let Some(errors) = validation_error {
            return engine.snapshot().with_error(errors.to_string());
        }

        engine.step().await
    }

    /// Record `snapshot` as the latest and hand it to every current listener.
    fn publish(&self, snapshot: EngineSnapshot) {
        lock(&self.inner.state).last = snapshot.clone();

        // Listeners added during this broadcast wait for the next one.
        let listeners: Vec<Listener> = lock(&self.inner.subscribers)
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                tracing::warn!("Snapshot listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use crate::engine::Engine;
    use crate::module::{Callable, CompiledModule};
    use crate::schedule::TimerScheduler;
    use crate::types::{ContinuousConfig, FeedbackMapping, OutputField, OutputSpec};

    fn counter_engine(fail_at: Option<i64>) -> Box<dyn StepEngine> {
        let next: Callable = Arc::new(move |i: &Record| {
            let n = i.get("count").and_then(Value::as_i64).unwrap_or(0);
            match fail_at {
                Some(limit) if n >= limit => Err("too far".to_string()),
                _ => Ok(json!(n + 1)),
            }
        });
        let module = Arc::new(CompiledModule::from_exports("mem://count", [("_next", next)]));
        let spec: OutputSpec = [("next".to_string(), OutputField::default())].into_iter().collect();
        let mut input = Record::new();
        input.insert("count".into(), json!(0));
        Box::new(Engine::new(
            module,
            spec,
            ExecutionConfig::continuous(vec![FeedbackMapping::new("next", "count")]),
            input,
        ))
    }

    fn collect(controller: &Controller) -> Arc<Mutex<Vec<EngineSnapshot>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        controller.subscribe(move |s| sink.lock().unwrap().push(s.clone()));
        seen
    }

    async fn controller(fail_at: Option<i64>) -> Controller {
        let controller = Controller::new(Arc::new(TimerScheduler::new()));
        controller.init(counter_engine(fail_at), None).await;
        controller
    }

    #[test]
    fn test_playback_interval() {
        assert_eq!(playback_interval(&ExecutionConfig::Single), DEFAULT_INTERVAL);
        let fast = ExecutionConfig::Continuous(ContinuousConfig {
            playback_speed: Some(20),
            ..Default::default()
        });
        assert_eq!(playback_interval(&fast), MIN_INTERVAL);
        let slow = ExecutionConfig::Continuous(ContinuousConfig {
            playback_speed: Some(400),
            ..Default::default()
        });
        assert_eq!(playback_interval(&slow), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_tick_then_pause() {
        let controller = controller(None).await;
        let seen = collect(&controller);

        controller.play(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(101)).await;

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].step_count, 1);
        }

        controller.pause();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!controller.is_playing());
        assert_eq!(controller.step_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_is_noop_while_playing() {
        let controller = controller(None).await;
        let seen = collect(&controller);

        controller.play(Duration::from_millis(100));
        controller.play(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(controller.interval(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_pause_on_error() {
        let controller = controller(Some(2)).await;
        let seen = collect(&controller);

        controller.play(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[2].error.as_deref().unwrap().contains("too far"));
        assert_eq!(seen[2].step_count, 2);
        // Last good outputs stay visible next to the error.
        assert_eq!(seen[2].outputs.as_ref().unwrap()["next"], json!(2));
        assert!(!controller.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_iterations_stops_playback() {
        let controller = controller(None).await;
        let seen = collect(&controller);

        controller.play_config(&ExecutionConfig::Continuous(ContinuousConfig {
            max_iterations: Some(4),
            playback_speed: Some(50),
            ..Default::default()
        }));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(seen.lock().unwrap().len(), 4);
        assert_eq!(controller.step_count(), 4);
        assert!(!controller.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_at_limit_stays_idle() {
        let controller = controller(None).await;
        let seen = collect(&controller);

        controller.play_limited(Duration::from_millis(10), Some(2));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.step_count(), 2);

        controller.play_limited(Duration::from_millis(10), Some(2));
        assert!(!controller.is_playing());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(controller.step_count(), 2);
        assert_eq!(seen.lock().unwrap().len(), 2);

        // A higher limit resumes from where playback stopped.
        controller.play_limited(Duration::from_millis(10), Some(3));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.step_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_interval_while_playing() {
        let controller = controller(None).await;
        let seen = collect(&controller);

        controller.play(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.set_interval(Duration::from_millis(200));

        // The original tick at 100ms was cancelled; the new one fires at 250ms.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(seen.lock().unwrap().len(), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(controller.is_playing());
        controller.pause();
    }

    #[tokio::test]
    async fn test_manual_step_does_not_start_playback() {
        let controller = controller(None).await;
        let seen = collect(&controller);

        let snap = controller.step().await;
        controller.step().await;

        assert_eq!(snap.step_count, 1);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(controller.step_count(), 2);
        assert!(!controller.is_playing());
    }

    #[tokio::test]
    async fn test_step_without_engine() {
        let controller = Controller::new(Arc::new(TimerScheduler::new()));
        let seen = collect(&controller);

        let snap = controller.step().await;

        assert_eq!(snap.error.as_deref(), Some("engine not initialized"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_added_during_broadcast_waits() {
        let controller = controller(None).await;
        let late_calls = Arc::new(AtomicUsize::new(0));

        let added = Arc::new(AtomicUsize::new(0));
        let handle = controller.clone();
        let late = Arc::clone(&late_calls);
        let once = Arc::clone(&added);
        controller.subscribe(move |_| {
            if once.fetch_add(1, Ordering::SeqCst) == 0 {
                let late = Arc::clone(&late);
                handle.subscribe(move |_| {
                    late.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        controller.step().await;
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        controller.step().await;
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_panicking_listener() {
        let controller = controller(None).await;
        controller.subscribe(|_| panic!("listener bug"));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sub = controller.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        controller.step().await;
        sub.unsubscribe();
        controller.step().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.step_count(), 2);
    }

    #[tokio::test]
    async fn test_set_input_broadcasts() {
        let controller = controller(None).await;
        let seen = collect(&controller);
        controller.step().await;

        let mut input = Record::new();
        input.insert("count".into(), json!(10));
        controller.set_input(input).await;

        let snap = controller.last_snapshot();
        assert_eq!(snap.step_count, 1);
        assert_eq!(snap.outputs, None);
        assert_eq!(seen.lock().unwrap().len(), 2);

        let snap = controller.step().await;
        assert_eq!(snap.outputs.unwrap()["next"], json!(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_skips_step_and_pauses() {
        use crate::types::InputField;
        use crate::validate::SchemaValidator;

        let schema: InputSchema = [("count".to_string(), InputField::String)].into_iter().collect();
        let controller = Controller::new(Arc::new(TimerScheduler::new()))
            .with_validator(Arc::new(SchemaValidator), schema);
        controller.init(counter_engine(None), None).await;
        let seen = collect(&controller);

        controller.play(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(500)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].step_count, 0);
        assert_eq!(
            seen[0].error.as_deref(),
            Some("Input validation errors:\n  • count: Expected string, got number")
        );
        assert!(!controller.is_playing());
    }

    #[tokio::test]
    async fn test_validation_error_lives_on_controller_only() {
        use crate::types::InputField;
        use crate::validate::SchemaValidator;

        let schema: InputSchema = [("count".to_string(), InputField::Integer)].into_iter().collect();
        let controller = Controller::new(Arc::new(TimerScheduler::new()))
            .with_validator(Arc::new(SchemaValidator), schema);
        controller.init(counter_engine(None), None).await;

        let mut bad = Record::new();
        bad.insert("count".into(), json!("seven"));
        controller.set_input(bad).await;
        let rejected = controller.step().await;

        assert!(rejected.error.as_deref().unwrap().contains("count"));
        assert_eq!(controller.last_snapshot(), rejected);
        assert_eq!(controller.step_count(), 0);

        let mut good = Record::new();
        good.insert("count".into(), json!(4));
        controller.set_input(good).await;
        assert_eq!(controller.last_snapshot().error, None);

        let snap = controller.step().await;
        assert_eq!(snap.step_count, 1);
        assert_eq!(snap.outputs.unwrap()["next"], json!(5));
    }

    /// Engine whose shutdown waits for a task on the controller's runtime.
    struct SlowTeardown {
        release: Option<std::sync::mpsc::Receiver<()>>,
        released: Arc<AtomicUsize>,
    }

    impl StepEngine for SlowTeardown {
        fn snapshot(&self) -> EngineSnapshot {
            EngineSnapshot::default()
        }

        fn set_input(&mut self, _input: Record) {}

        fn set_config(&mut self, _config: ExecutionConfig) {}

        fn step(&mut self) -> futures::future::BoxFuture<'_, EngineSnapshot> {
            futures::future::ready(EngineSnapshot::default()).boxed()
        }

        fn shutdown(&mut self) {
            let released = self
                .release
                .take()
                .is_some_and(|rx| rx.recv_timeout(Duration::from_secs(5)).is_ok());
            if released {
                self.released.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_destroy_keeps_runtime_free_during_teardown() {
        let (tx, rx) = std::sync::mpsc::channel();
        let released = Arc::new(AtomicUsize::new(0));
        let controller = Controller::new(Arc::new(TimerScheduler::new()));
        controller
            .init(
                Box::new(SlowTeardown {
                    release: Some(rx),
                    released: Arc::clone(&released),
                }),
                None,
            )
            .await;

        // Only runs if destroy yields the (single) runtime thread.
        tokio::spawn(async move {
            let _ = tx.send(());
        });
        controller.destroy().await;

        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_destroy_drops_listeners() {
        let controller = controller(None).await;
        let seen = collect(&controller);

        controller.destroy().await;
        let snap = controller.step().await;

        assert_eq!(snap.error.as_deref(), Some("engine not initialized"));
        assert!(seen.lock().unwrap().is_empty());
    }
}
