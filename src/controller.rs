//! Detector lifecycle and sampling loop
//!
//! A `DetectorController` owns at most one session at a time. A session is an
//! acquired analyzer plus a fresh state machine, ticked by a tokio task at a
//! fixed interval.
//!
//! `stop()` is synchronous: it waits for an in-flight tick on another thread
//! to finish via the tick gate, and once it returns no further tick or
//! callback runs. When called from inside a callback the gate is already
//! held by the current thread, so it is skipped.

use crate::audio::{AudioSource, FrequencyAnalyzer};
use crate::config::DetectorConfig;
use crate::detection::{ActivityState, ActivityStateMachine, Transition};
use crate::error::{DetectorError, DetectorResult};
use crate::level::{Level, LevelAggregator};
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

pub type SpeechCallback = Arc<dyn Fn() + Send + Sync>;
pub type LevelCallback = Arc<dyn Fn(f32) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&DetectorError) + Send + Sync>;

/// Observer hooks invoked synchronously from the tick loop
///
/// Per tick, `on_noise_level` fires first, then at most one of
/// `on_speech_start` / `on_speech_end`. Callbacks must not block.
#[derive(Clone, Default)]
pub struct DetectorCallbacks {
    on_speech_start: Option<SpeechCallback>,
    on_speech_end: Option<SpeechCallback>,
    on_noise_level: Option<LevelCallback>,
    on_error: Option<ErrorCallback>,
}

impl DetectorCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_speech_start(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_speech_start = Some(Arc::new(f));
        self
    }

    pub fn on_speech_end(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_speech_end = Some(Arc::new(f));
        self
    }

    pub fn on_noise_level(mut self, f: impl Fn(f32) + Send + Sync + 'static) -> Self {
        self.on_noise_level = Some(Arc::new(f));
        self
    }

    /// Called once when a session dies on a fatal error
    pub fn on_error(mut self, f: impl Fn(&DetectorError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for DetectorCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorCallbacks")
            .field("on_speech_start", &self.on_speech_start.is_some())
            .field("on_speech_end", &self.on_speech_end.is_some())
            .field("on_noise_level", &self.on_noise_level.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

struct Session {
    id: Uuid,
    generation: u64,
    analyzer: Box<dyn FrequencyAnalyzer>,
    machine: ActivityStateMachine,
    task: Option<JoinHandle<()>>,
}

thread_local! {
    // Address of the Shared whose tick is running on this thread, or 0
    static TICKING: Cell<usize> = const { Cell::new(0) };
}

struct TickMarker {
    previous: usize,
}

impl TickMarker {
    fn enter(shared: &Shared) -> Self {
        let previous = TICKING.with(|t| t.replace(shared.address()));
        Self { previous }
    }
}

impl Drop for TickMarker {
    fn drop(&mut self) {
        TICKING.with(|t| t.set(self.previous));
    }
}

struct Shared {
    config: DetectorConfig,
    callbacks: DetectorCallbacks,
    session: Mutex<Option<Session>>,
    gate: Mutex<()>,
    generation: AtomicU64,
    speaking: AtomicBool,
    noise_level: AtomicU32,
}

/// Lock a std mutex, recovering the data if a panicking holder poisoned it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn address(&self) -> usize {
        self as *const Self as usize
    }

    fn is_ticking_here(&self) -> bool {
        TICKING.with(|t| t.get() == self.address())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn is_running(&self) -> bool {
        lock(&self.session).is_some()
    }

    fn publish(&self, noise_level: f32, speaking: bool) {
        self.noise_level
            .store(noise_level.to_bits(), Ordering::Release);
        self.speaking.store(speaking, Ordering::Release);
    }

    fn stop(&self) {
        let _gate = if self.is_ticking_here() {
            None
        } else {
            Some(lock(&self.gate))
        };
        self.teardown();
    }

    /// Invalidate the running loop, release resources and reset state
    fn teardown(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let session = lock(&self.session).take();
        self.publish(0.0, false);

        let Some(mut session) = session else {
            return;
        };

        if let Some(task) = session.task.take() {
            task.abort();
        }
        if let Err(e) = session.analyzer.release() {
            warn!(session = %session.id, "Failed to release audio source: {}", e);
        }
        info!(session = %session.id, "Voice activity detection stopped");
    }

    /// Run one tick. Returns whether the loop should keep going.
    fn tick(&self, generation: u64) -> bool {
        let _gate = lock(&self.gate);
        if !self.is_current(generation) {
            return false;
        }
        let _marker = TickMarker::enter(self);

        // The session lock is released before callbacks so they may call stop()
        let outcome = {
            let mut guard = lock(&self.session);
            let Some(session) = guard.as_mut() else {
                return false;
            };
            session.analyzer.sample().map(|window| {
                let level = LevelAggregator::aggregate(&window);
                let now = tokio::time::Instant::now().into_std();
                let transition = session.machine.update(level.average, now);
                self.publish(level.noise_level, session.machine.is_speaking());
                (level, transition)
            })
        };

        match outcome {
            Ok((level, transition)) => {
                self.dispatch(generation, level, transition);
                self.is_current(generation)
            }
            Err(e) if e.is_fatal() => {
                error!("Detector session failed: {}", e);
                self.teardown();
                if let Some(cb) = &self.callbacks.on_error {
                    guarded("on_error", || cb(&e));
                }
                false
            }
            Err(e) => {
                debug!("Skipping tick: {}", e);
                true
            }
        }
    }

    fn dispatch(&self, generation: u64, level: Level, transition: Option<Transition>) {
        if let Some(cb) = &self.callbacks.on_noise_level {
            guarded("on_noise_level", || cb(level.noise_level));
        }

        let Some(transition) = transition else {
            return;
        };
        // on_noise_level may have stopped the detector
        if !self.is_current(generation) {
            return;
        }

        match transition {
            Transition::SpeechStart => {
                debug!(average = level.average, "Speech started");
                if let Some(cb) = &self.callbacks.on_speech_start {
                    guarded("on_speech_start", || cb());
                }
            }
            Transition::SpeechEnd => {
                debug!(average = level.average, "Speech ended");
                if let Some(cb) = &self.callbacks.on_speech_end {
                    guarded("on_speech_end", || cb());
                }
            }
        }
    }
}

/// Invoke a callback, logging instead of unwinding if it panics
fn guarded(name: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(callback = name, "Detector callback panicked");
    }
}

async fn run_loop(shared: Arc<Shared>, generation: u64) {
    let mut interval = tokio::time::interval(shared.config.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if !shared.tick(generation) {
            break;
        }
    }
}

/// Lightweight handle for stopping or observing a detector from elsewhere,
/// including from inside its own callbacks
#[derive(Clone)]
pub struct DetectorHandle {
    shared: Weak<Shared>,
}

impl DetectorHandle {
    pub fn stop(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.upgrade().is_some_and(|s| s.is_running())
    }

    pub fn is_speaking(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|s| s.speaking.load(Ordering::Acquire))
    }

    pub fn noise_level(&self) -> f32 {
        self.shared
            .upgrade()
            .map(|s| f32::from_bits(s.noise_level.load(Ordering::Acquire)))
            .unwrap_or(0.0)
    }
}

/// Voice activity detector driving an audio source at a fixed cadence
pub struct DetectorController<S: AudioSource> {
    source: S,
    shared: Arc<Shared>,
    starting: tokio::sync::Mutex<()>,
}

impl<S: AudioSource> DetectorController<S> {
    /// Build a stopped detector, rejecting invalid configuration
    pub fn new(
        source: S,
        config: DetectorConfig,
        callbacks: DetectorCallbacks,
    ) -> DetectorResult<Self> {
        config.validate()?;
        Ok(Self {
            source,
            shared: Arc::new(Shared {
                config,
                callbacks,
                session: Mutex::new(None),
                gate: Mutex::new(()),
                generation: AtomicU64::new(0),
                speaking: AtomicBool::new(false),
                noise_level: AtomicU32::new(0.0_f32.to_bits()),
            }),
            starting: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.shared.config
    }

    pub fn handle(&self) -> DetectorHandle {
        DetectorHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Acquire the audio source and begin sampling
    ///
    /// Does nothing if a session is already running. On acquisition failure
    /// the detector stays stopped and holds no resources.
    pub async fn start(&self) -> DetectorResult<()> {
        let _starting = self.starting.lock().await;
        if self.shared.is_running() {
            debug!("Detector already running, ignoring start");
            return Ok(());
        }

        let epoch = self.shared.generation.load(Ordering::Acquire);
        let mut analyzer = self.source.acquire(&self.shared.config).await?;

        let id = Uuid::new_v4();
        let generation = {
            let mut session = lock(&self.shared.session);
            if !self.shared.is_current(epoch) {
                drop(session);
                debug!(session = %id, "Detector stopped during acquisition");
                if let Err(e) = analyzer.release() {
                    warn!(session = %id, "Failed to release audio source: {}", e);
                }
                return Ok(());
            }

            let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
            *session = Some(Session {
                id,
                generation,
                analyzer: Box::new(analyzer),
                machine: ActivityStateMachine::new(
                    self.shared.config.speech_threshold,
                    self.shared.config.silence_timeout(),
                ),
                task: None,
            });
            generation
        };

        let task = tokio::spawn(
            run_loop(Arc::clone(&self.shared), generation)
                .instrument(info_span!("vad_session", session = %id)),
        );

        match lock(&self.shared.session).as_mut() {
            Some(session) if session.generation == generation => session.task = Some(task),
            _ => task.abort(),
        }

        info!(
            session = %id,
            tick_ms = self.shared.config.tick_interval_ms,
            silence_timeout_ms = self.shared.config.silence_timeout_ms,
            "Voice activity detection started"
        );
        Ok(())
    }

    /// Stop sampling and release the audio source
    ///
    /// Always safe, including before `start`, twice in a row, or from a
    /// callback.
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Speaking state as of the last completed tick
    pub fn is_speaking(&self) -> bool {
        self.shared.speaking.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ActivityState {
        if self.is_speaking() {
            ActivityState::Speaking
        } else {
            ActivityState::Idle
        }
    }

    /// Noise level in [0, 100] as of the last completed tick
    pub fn noise_level(&self) -> f32 {
        f32::from_bits(self.shared.noise_level.load(Ordering::Acquire))
    }
}

impl<S: AudioSource> Drop for DetectorController<S> {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AnalysisWindow;
    use std::collections::VecDeque;
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Window(u8),
        Glitch,
        Closed,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Level(f32),
        Start,
        End,
        Error(DetectorError),
    }

    #[derive(Default)]
    struct Counters {
        acquisitions: AtomicUsize,
        releases: AtomicUsize,
    }

    struct ScriptedSource {
        script: Vec<Step>,
        failure: Option<DetectorError>,
        acquire_delay: Option<Duration>,
        failing_release: bool,
        counters: Arc<Counters>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Step>) -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            let source = Self {
                script,
                failure: None,
                acquire_delay: None,
                failing_release: false,
                counters: Arc::clone(&counters),
            };
            (source, counters)
        }

        fn failing(error: DetectorError) -> (Self, Arc<Counters>) {
            let (mut source, counters) = Self::new(Vec::new());
            source.failure = Some(error);
            (source, counters)
        }

        fn slow(script: Vec<Step>, delay: Duration) -> (Self, Arc<Counters>) {
            let (mut source, counters) = Self::new(script);
            source.acquire_delay = Some(delay);
            (source, counters)
        }

        fn with_failing_release(script: Vec<Step>) -> (Self, Arc<Counters>) {
            let (mut source, counters) = Self::new(script);
            source.failing_release = true;
            (source, counters)
        }
    }

    struct ScriptedAnalyzer {
        script: VecDeque<Step>,
        failing_release: bool,
        counters: Arc<Counters>,
    }

    impl FrequencyAnalyzer for ScriptedAnalyzer {
        fn sample(&mut self) -> DetectorResult<AnalysisWindow> {
            match self.script.pop_front().unwrap_or(Step::Window(0)) {
                Step::Window(avg) => Ok(AnalysisWindow::filled(512, avg)),
                Step::Glitch => Err(DetectorError::Glitch("dropped frame".into())),
                Step::Closed => Err(DetectorError::SourceClosed("unplugged".into())),
            }
        }

        fn release(&mut self) -> DetectorResult<()> {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
            if self.failing_release {
                return Err(DetectorError::DeviceUnavailable("device busy".into()));
            }
            Ok(())
        }
    }

    impl AudioSource for ScriptedSource {
        type Analyzer = ScriptedAnalyzer;

        async fn acquire(&self, _config: &DetectorConfig) -> DetectorResult<ScriptedAnalyzer> {
            if let Some(delay) = self.acquire_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(e) = &self.failure {
                return Err(e.clone());
            }
            self.counters.acquisitions.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedAnalyzer {
                script: self.script.iter().copied().collect(),
                failing_release: self.failing_release,
                counters: Arc::clone(&self.counters),
            })
        }
    }

    type Events = Arc<Mutex<Vec<Event>>>;

    fn recorder() -> (DetectorCallbacks, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c, d) = (
            Arc::clone(&events),
            Arc::clone(&events),
            Arc::clone(&events),
            Arc::clone(&events),
        );
        let callbacks = DetectorCallbacks::new()
            .on_noise_level(move |level| a.lock().unwrap().push(Event::Level(level)))
            .on_speech_start(move || b.lock().unwrap().push(Event::Start))
            .on_speech_end(move || c.lock().unwrap().push(Event::End))
            .on_error(move |e| d.lock().unwrap().push(Event::Error(e.clone())));
        (callbacks, events)
    }

    fn snapshot(events: &Events) -> Vec<Event> {
        events.lock().unwrap().clone()
    }

    fn level_count(events: &[Event]) -> usize {
        events.iter().filter(|e| matches!(e, Event::Level(_))).count()
    }

    /// (1-based tick, event) for every transition
    fn transitions(events: &[Event]) -> Vec<(usize, Event)> {
        let mut tick = 0;
        let mut out = Vec::new();
        for event in events {
            match event {
                Event::Level(_) => tick += 1,
                other => out.push((tick, other.clone())),
            }
        }
        out
    }

    fn windows(averages: &[u8]) -> Vec<Step> {
        averages.iter().map(|&a| Step::Window(a)).collect()
    }

    async fn run_for(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_speech_scenario() {
        let (source, _) = ScriptedSource::new(windows(&[0, 0, 35, 40, 5, 5, 5, 5]));
        let (callbacks, events) = recorder();
        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();

        controller.start().await.unwrap();
        // Ticks at 0, 100, ..., 700ms
        run_for(750).await;
        controller.stop();

        let events = snapshot(&events);
        assert_eq!(level_count(&events), 8);
        assert_eq!(
            transitions(&events),
            vec![(3, Event::Start), (8, Event::End)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_until_timeout_elapses() {
        let (source, _) = ScriptedSource::new(windows(&[0, 0, 35, 40, 5, 5, 5, 5]));
        let (callbacks, _events) = recorder();
        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();

        controller.start().await.unwrap();
        // Through tick 7 (600ms): last loud tick was 300ms ago, not more
        run_for(650).await;
        assert!(controller.is_speaking());

        run_for(100).await;
        assert!(!controller.is_speaking());
        controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_observable_state_tracks_last_tick() {
        let (source, _) = ScriptedSource::new(windows(&[40, 40, 40]));
        let (callbacks, _events) = recorder();
        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();

        assert!(!controller.is_speaking());
        assert_eq!(controller.noise_level(), 0.0);

        controller.start().await.unwrap();
        run_for(150).await;

        assert!(controller.is_speaking());
        assert_eq!(controller.state(), ActivityState::Speaking);
        assert_eq!(controller.noise_level(), 60.0);

        controller.stop();
        assert!(!controller.is_speaking());
        assert_eq!(controller.noise_level(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_runs_one_loop() {
        let (source, counters) = ScriptedSource::new(Vec::new());
        let (callbacks, events) = recorder();
        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();

        controller.start().await.unwrap();
        controller.start().await.unwrap();
        run_for(250).await;
        controller.stop();

        assert_eq!(counters.acquisitions.load(Ordering::SeqCst), 1);
        assert_eq!(level_count(&snapshot(&events)), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_twice_is_safe() {
        let (source, counters) = ScriptedSource::new(windows(&[50]));
        let (callbacks, _events) = recorder();
        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();

        controller.start().await.unwrap();
        run_for(50).await;
        assert!(controller.is_speaking());

        controller.stop();
        assert!(!controller.is_speaking());
        assert_eq!(controller.noise_level(), 0.0);

        controller.stop();
        assert!(!controller.is_running());
        assert!(!controller.is_speaking());
        assert_eq!(controller.noise_level(), 0.0);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ticks_after_stop() {
        let (source, _) = ScriptedSource::new(Vec::new());
        let (callbacks, events) = recorder();
        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();

        controller.start().await.unwrap();
        run_for(150).await;
        controller.stop();
        let before = level_count(&snapshot(&events));

        run_for(1000).await;
        assert_eq!(level_count(&snapshot(&events)), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start_is_noop() {
        let (source, counters) = ScriptedSource::new(Vec::new());
        let controller =
            DetectorController::new(source, DetectorConfig::default(), DetectorCallbacks::new())
                .unwrap();

        controller.stop();
        assert!(!controller.is_running());
        assert_eq!(counters.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop_is_fresh() {
        let (source, counters) = ScriptedSource::new(windows(&[50]));
        let (callbacks, events) = recorder();
        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();

        controller.start().await.unwrap();
        run_for(50).await;
        controller.stop();
        controller.start().await.unwrap();
        run_for(50).await;
        controller.stop();

        assert_eq!(counters.acquisitions.load(Ordering::SeqCst), 2);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 2);
        // The state machine was reset, so speech starts again without an end in between
        let starts = snapshot(&events)
            .into_iter()
            .filter(|e| *e == Event::Start)
            .count();
        assert_eq!(starts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_leaves_detector_stopped() {
        let (source, counters) =
            ScriptedSource::failing(DetectorError::PermissionDenied("user declined".into()));
        let (callbacks, events) = recorder();
        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();

        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, DetectorError::PermissionDenied(_)));
        assert!(!controller.is_running());
        assert!(!controller.is_speaking());

        controller.stop();
        run_for(500).await;
        assert!(snapshot(&events).is_empty());
        assert_eq!(counters.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_closed_stops_session() {
        let mut script = windows(&[40]);
        script.push(Step::Closed);
        let (source, counters) = ScriptedSource::new(script);
        let (callbacks, events) = recorder();
        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();

        controller.start().await.unwrap();
        run_for(500).await;

        assert_eq!(
            snapshot(&events),
            vec![
                Event::Level(60.0),
                Event::Start,
                Event::Error(DetectorError::SourceClosed("unplugged".into())),
            ]
        );
        assert!(!controller.is_running());
        assert!(!controller.is_speaking());
        assert_eq!(controller.noise_level(), 0.0);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);

        controller.stop();
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_acquisition_wins() {
        let (source, counters) = ScriptedSource::slow(windows(&[50]), Duration::from_millis(500));
        let (callbacks, events) = recorder();
        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();

        let (result, ()) = tokio::join!(controller.start(), async {
            run_for(100).await;
            controller.stop();
        });

        assert_eq!(result, Ok(()));
        assert!(!controller.is_running());
        assert_eq!(counters.acquisitions.load(Ordering::SeqCst), 1);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);

        run_for(500).await;
        assert!(snapshot(&events).is_empty());

        // A later start is not affected by the abandoned one
        controller.start().await.unwrap();
        run_for(50).await;
        assert!(controller.is_running());
        assert!(controller.is_speaking());
        controller.stop();
        assert_eq!(counters.releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_release_is_not_propagated() {
        let (source, counters) = ScriptedSource::with_failing_release(windows(&[50]));
        let (callbacks, events) = recorder();
        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();

        controller.start().await.unwrap();
        run_for(50).await;
        assert!(controller.is_speaking());

        controller.stop();
        assert!(!controller.is_running());
        assert!(!controller.is_speaking());
        assert_eq!(controller.noise_level(), 0.0);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);

        // Release errors are logged only, never surfaced through on_error
        run_for(500).await;
        assert!(
            !snapshot(&events)
                .iter()
                .any(|e| matches!(e, Event::Error(_)))
        );

        controller.start().await.unwrap();
        assert!(controller.is_running());
        controller.stop();
        assert_eq!(counters.releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_glitch_skips_tick() {
        let (source, _) =
            ScriptedSource::new(vec![Step::Window(10), Step::Glitch, Step::Window(20)]);
        let (callbacks, events) = recorder();
        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();

        controller.start().await.unwrap();
        run_for(250).await;

        assert_eq!(
            snapshot(&events),
            vec![Event::Level(15.0), Event::Level(30.0)]
        );
        assert!(controller.is_running());
        controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_from_callback() {
        let (source, counters) = ScriptedSource::new(windows(&[0, 40, 0, 0, 0, 0]));
        let handle: Arc<OnceLock<DetectorHandle>> = Arc::new(OnceLock::new());
        let events: Events = Arc::new(Mutex::new(Vec::new()));

        let callbacks = {
            let (levels, starts, handle) =
                (Arc::clone(&events), Arc::clone(&events), Arc::clone(&handle));
            DetectorCallbacks::new()
                .on_noise_level(move |level| levels.lock().unwrap().push(Event::Level(level)))
                .on_speech_start(move || {
                    starts.lock().unwrap().push(Event::Start);
                    if let Some(handle) = handle.get() {
                        handle.stop();
                    }
                })
        };

        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();
        handle.set(controller.handle()).ok();

        controller.start().await.unwrap();
        run_for(1000).await;

        assert_eq!(
            snapshot(&events),
            vec![Event::Level(0.0), Event::Level(60.0), Event::Start]
        );
        assert!(!controller.is_running());
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_callback_does_not_kill_loop() {
        let (source, counters) = ScriptedSource::new(Vec::new());
        let ticks = Arc::new(AtomicUsize::new(0));
        let callbacks = {
            let ticks = Arc::clone(&ticks);
            DetectorCallbacks::new().on_noise_level(move |_| {
                ticks.fetch_add(1, Ordering::SeqCst);
                panic!("observer bug");
            })
        };
        let controller =
            DetectorController::new(source, DetectorConfig::default(), callbacks).unwrap();

        controller.start().await.unwrap();
        run_for(250).await;
        controller.stop();

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_source() {
        let (source, counters) = ScriptedSource::new(Vec::new());
        let controller =
            DetectorController::new(source, DetectorConfig::default(), DetectorCallbacks::new())
                .unwrap();
        let handle = controller.handle();

        controller.start().await.unwrap();
        run_for(50).await;
        drop(controller);

        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert!(!handle.is_running());
        handle.stop();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (source, _) = ScriptedSource::new(Vec::new());
        let config = DetectorConfig {
            tick_interval_ms: 0,
            ..DetectorConfig::default()
        };
        let result = DetectorController::new(source, config, DetectorCallbacks::new());
        assert!(matches!(result, Err(DetectorError::InvalidConfig(_))));
    }
}
