//! Per-camera session and restart controller
//!
//! A [`CameraSession`] owns one camera's frame buffer, metrics and recording
//! flag, plus at most one controller task. The controller runs decode
//! attempts back to back on blocking threads, waiting between them with an
//! exponential backoff. Control operations (start, stop, restart, close) are
//! serialized, and each one fully stops the previous controller before
//! starting the next, so no two attempts for a camera overlap.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::{Backoff, RestartPolicy};
use super::supervisor::{AttemptContext, AttemptEnd, AttemptRunner};
use crate::config::{CameraConfig, DiagnosticsConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::metrics::{MetricsSampler, MetricsSnapshot, StreamMetrics};
use crate::video::FrameBuffer;

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No controller running
    Idle,
    /// An attempt is in progress
    Running,
    /// Last attempt failed; waiting to retry
    Failed,
    /// Last attempt reached end of stream; waiting to reconnect
    Stopped,
    /// Controller is being shut down
    Stopping,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Running => write!(f, "Running"),
            SessionState::Failed => write!(f, "Failed"),
            SessionState::Stopped => write!(f, "Stopped"),
            SessionState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub key: String,
    pub name: String,
    pub index: usize,
    pub state: SessionState,
    /// Attempts started by the current and previous controllers
    pub attempts: u64,
    /// Delay the next failure will wait
    pub backoff: Duration,
    pub next_retry: Option<Instant>,
    pub last_error: Option<String>,
    pub last_progress: Option<Instant>,
    pub recording: bool,
}

/// Collaborators every session is built with
#[derive(Clone)]
pub struct SessionDeps {
    pub runner: Arc<dyn AttemptRunner>,
    pub events: Arc<EventBus>,
    pub diagnostics: DiagnosticsConfig,
    pub policy: RestartPolicy,
}

#[derive(Debug, Default)]
struct ControllerProgress {
    attempts: u64,
    backoff: Duration,
    next_retry: Option<Instant>,
    last_error: Option<String>,
}

/// State the session handle shares with its controller and attempts
struct Shared {
    key: String,
    frames: FrameBuffer,
    metrics: StreamMetrics,
    recording: AtomicBool,
    state: watch::Sender<SessionState>,
    progress: Mutex<ControllerProgress>,
    events: Arc<EventBus>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.events.publish(SessionEvent::StateChanged {
                camera: self.key.clone(),
                state,
            });
        }
    }
}

struct RunHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

pub struct CameraSession {
    shared: Arc<Shared>,
    config: RwLock<CameraConfig>,
    index: AtomicUsize,
    diagnostics: RwLock<DiagnosticsConfig>,
    runner: Arc<dyn AttemptRunner>,
    policy: RestartPolicy,
    /// Held for the whole of every control operation
    run: tokio::sync::Mutex<Option<RunHandle>>,
    closing: AtomicBool,
    sampler: Mutex<MetricsSampler>,
    snapshot: ArcSwap<MetricsSnapshot>,
}

impl CameraSession {
    /// Create an idle session
    pub fn new(config: CameraConfig, index: usize, deps: &SessionDeps) -> Self {
        let metrics = StreamMetrics::new();
        let sampler = MetricsSampler::new(&metrics);
        let (state, _) = watch::channel(SessionState::Idle);

        Self {
            shared: Arc::new(Shared {
                key: config.key().to_string(),
                frames: FrameBuffer::new(),
                metrics,
                recording: AtomicBool::new(false),
                state,
                progress: Mutex::new(ControllerProgress {
                    backoff: deps.policy.initial_backoff,
                    ..Default::default()
                }),
                events: deps.events.clone(),
            }),
            config: RwLock::new(config),
            index: AtomicUsize::new(index),
            diagnostics: RwLock::new(deps.diagnostics),
            runner: deps.runner.clone(),
            policy: deps.policy.clone(),
            run: tokio::sync::Mutex::new(None),
            closing: AtomicBool::new(false),
            sampler: Mutex::new(sampler),
            snapshot: ArcSwap::from_pointee(MetricsSnapshot::default()),
        }
    }

    /// Create a session and start its controller
    pub async fn open(config: CameraConfig, index: usize, deps: &SessionDeps) -> Arc<Self> {
        let session = Arc::new(Self::new(config, index, deps));
        session.start_camera().await;
        session
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn config(&self) -> CameraConfig {
        self.config.read().clone()
    }

    /// Position in the wall layout
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    pub fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Relaxed);
    }

    /// Applies from the next controller start
    pub fn set_diagnostics(&self, diagnostics: DiagnosticsConfig) {
        *self.diagnostics.write() = diagnostics;
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SessionStatus {
        let config = self.config.read();
        let progress = self.shared.progress.lock();
        SessionStatus {
            key: self.shared.key.clone(),
            name: config.display_name().to_string(),
            index: self.index(),
            state: self.state(),
            attempts: progress.attempts,
            backoff: progress.backoff,
            next_retry: progress.next_retry,
            last_error: progress.last_error.clone(),
            last_progress: self.shared.metrics.last_progress(),
            recording: self.is_recording(),
        }
    }

    /// Latest-frame buffer for the presentation layer
    pub fn frames(&self) -> &FrameBuffer {
        &self.shared.frames
    }

    /// Whether a controller is currently running
    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }

    /// Start the controller if it is not running
    pub async fn start_camera(&self) {
        let mut run = self.run.lock().await;
        if self.is_closed() || run.is_some() {
            return;
        }
        self.launch(&mut run, Backoff::new(&self.policy));
    }

    /// Stop the controller; the session stays open and can be started again
    pub async fn stop_camera(&self) {
        let mut run = self.run.lock().await;
        if self.halt(&mut run).await {
            info!("[{}] Camera stopped", self.key());
        }
        self.shared.set_state(SessionState::Idle);
    }

    /// Restart with the current configuration
    pub async fn restart(&self, reason: &str) {
        let config = self.config();
        self.restart_with(config, reason).await;
    }

    /// Stop the running controller, swap in `config` and start again with
    /// the short manual-restart backoff.
    pub async fn restart_with(&self, config: CameraConfig, reason: &str) {
        let mut run = self.run.lock().await;
        if self.is_closed() {
            debug!("[{}] Ignoring restart ({}) on closed session", self.key(), reason);
            return;
        }
        info!("[{}] Restarting: {}", self.key(), reason);

        let was_running = self.halt(&mut run).await;
        *self.config.write() = config;
        if was_running {
            tokio::time::sleep(self.policy.restart_grace).await;
        }
        self.launch(&mut run, Backoff::manual(&self.policy));
    }

    /// Reconnect after the host wakes up; stopped sessions stay stopped
    pub async fn on_resume_from_sleep(&self) {
        if self.is_running().await {
            self.restart("resume from sleep").await;
        }
    }

    /// Stop for good. Idempotent.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut run = self.run.lock().await;
        self.halt(&mut run).await;
        self.shared.set_state(SessionState::Idle);
        self.shared.events.publish(SessionEvent::Closed {
            camera: self.shared.key.clone(),
        });
        info!("[{}] Session closed", self.key());
    }

    /// Request recording on or off; returns the previous request
    pub fn set_recording(&self, on: bool) -> bool {
        self.shared.recording.swap(on, Ordering::AcqRel)
    }

    /// Flip the recording request; returns the new request
    pub fn toggle_recording(&self) -> bool {
        !self.shared.recording.fetch_xor(true, Ordering::AcqRel)
    }

    /// Requested recording state
    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::Acquire)
    }

    /// Compute a snapshot for the interval since the previous sample
    pub fn sample_metrics(&self) -> MetricsSnapshot {
        let snapshot = self.sampler.lock().sample(&self.shared.metrics);
        self.snapshot.store(Arc::new(snapshot));
        snapshot
    }

    /// Most recent snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        **self.snapshot.load()
    }

    fn launch(&self, slot: &mut Option<RunHandle>, backoff: Backoff) {
        let stop = CancellationToken::new();
        let controller = Controller {
            shared: self.shared.clone(),
            runner: self.runner.clone(),
            config: self.config(),
            diagnostics: *self.diagnostics.read(),
            policy: self.policy.clone(),
            stop: stop.clone(),
            backoff,
        };
        let task = tokio::spawn(controller.run());
        *slot = Some(RunHandle { stop, task });
    }

    /// Signal the controller and wait for it, bounded by the stop timeout.
    /// Returns whether one was running.
    async fn halt(&self, slot: &mut Option<RunHandle>) -> bool {
        let Some(mut handle) = slot.take() else {
            return false;
        };
        self.shared.set_state(SessionState::Stopping);
        handle.stop.cancel();

        match tokio::time::timeout(self.policy.stop_timeout, &mut handle.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[{}] Controller task failed: {}", self.key(), e),
            Err(_) => warn!(
                "[{}] Controller did not stop within {}ms, detaching it",
                self.key(),
                self.policy.stop_timeout.as_millis()
            ),
        }
        true
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        if let Some(handle) = self.run.get_mut().take() {
            handle.stop.cancel();
        }
    }
}

/// The restart loop for one controller generation
struct Controller {
    shared: Arc<Shared>,
    runner: Arc<dyn AttemptRunner>,
    config: CameraConfig,
    diagnostics: DiagnosticsConfig,
    policy: RestartPolicy,
    stop: CancellationToken,
    backoff: Backoff,
}

impl Controller {
    async fn run(mut self) {
        let key = self.shared.key.clone();
        debug!("[{}] Controller started", key);

        while !self.stop.is_cancelled() {
            self.shared.set_state(SessionState::Running);
            self.shared.progress.lock().attempts += 1;

            let frames_before = self.shared.metrics.counters().frames;
            let result = self.attempt().await;
            if self.shared.metrics.counters().frames > frames_before {
                self.backoff.on_progress();
            }

            let delay = match result {
                Ok(AttemptEnd::Stopped) => break,
                Ok(AttemptEnd::EndOfStream) => {
                    self.shared.set_state(SessionState::Stopped);
                    self.policy.attempt_pause
                }
                Err(_) if self.stop.is_cancelled() => break,
                Err(e) => {
                    let delay = self.backoff.on_failure(Instant::now()) + self.policy.attempt_pause;
                    warn!("[{}] Attempt failed: {} (retry in {}ms)", key, e, delay.as_millis());
                    self.shared.progress.lock().last_error = Some(e.to_string());
                    self.shared.set_state(SessionState::Failed);
                    self.shared.events.publish(SessionEvent::AttemptFailed {
                        camera: key.clone(),
                        error: e.to_string(),
                        retry_in_ms: delay.as_millis() as u64,
                    });
                    delay
                }
            };

            {
                let mut progress = self.shared.progress.lock();
                progress.backoff = self.backoff.current();
                progress.next_retry = Some(Instant::now() + delay);
            }
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.shared.progress.lock().next_retry = None;
        }

        self.shared.progress.lock().next_retry = None;
        debug!("[{}] Controller exited", key);
    }

    /// Run one attempt on a blocking thread
    async fn attempt(&self) -> Result<AttemptEnd> {
        let shared = self.shared.clone();
        let runner = self.runner.clone();
        let config = self.config.clone();
        let diagnostics = self.diagnostics;
        let stop = self.stop.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let ctx = AttemptContext {
                camera: &shared.key,
                config: &config,
                diagnostics,
                stop: &stop,
                recording: &shared.recording,
                frames: &shared.frames,
                metrics: &shared.metrics,
                events: &shared.events,
            };
            runner.run_attempt(&ctx)
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) => Err(AppError::Internal(format!("decode attempt panicked: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Fail,
        /// Publish one frame, then fail
        FrameThenFail,
        /// Run until the stop signal
        UntilStopped,
        /// Ignore the stop signal for a while
        Wedge(Duration),
    }

    struct ScriptedRunner {
        script: Mutex<VecDeque<Step>>,
        fallback: Step,
        active: AtomicUsize,
        max_active: AtomicUsize,
        runs: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(script: Vec<Step>, fallback: Step) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                runs: AtomicUsize::new(0),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    impl AttemptRunner for ScriptedRunner {
        fn run_attempt(&self, ctx: &AttemptContext<'_>) -> Result<AttemptEnd> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);

            let step = self.script.lock().pop_front().unwrap_or(self.fallback);
            let result = match step {
                Step::Fail => Err(AppError::Internal("scripted failure".to_string())),
                Step::FrameThenFail => {
                    ctx.frames.put(1, 1, &[0, 0, 0, 255]).unwrap();
                    ctx.metrics.record_frame(Instant::now());
                    Err(AppError::Stall(Duration::from_secs(10)))
                }
                Step::UntilStopped => {
                    while !ctx.stop.is_cancelled() {
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    Ok(AttemptEnd::Stopped)
                }
                Step::Wedge(d) => {
                    std::thread::sleep(d);
                    Ok(AttemptEnd::Stopped)
                }
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn fast_policy() -> RestartPolicy {
        RestartPolicy {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(80),
            manual_backoff: Duration::from_millis(5),
            attempt_pause: Duration::from_millis(5),
            restart_grace: Duration::from_millis(5),
            stop_timeout: Duration::from_secs(1),
        }
    }

    fn deps(runner: Arc<ScriptedRunner>, policy: RestartPolicy) -> SessionDeps {
        SessionDeps {
            runner,
            events: Arc::new(EventBus::new()),
            diagnostics: DiagnosticsConfig::default(),
            policy,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn retry_delays(
        rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
        count: usize,
    ) -> Vec<u64> {
        let mut delays = Vec::new();
        while delays.len() < count {
            let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let SessionEvent::AttemptFailed { retry_in_ms, .. } = event {
                delays.push(retry_in_ms);
            }
        }
        delays
    }

    fn camera(url: &str) -> CameraConfig {
        CameraConfig {
            id: "cam".to_string(),
            ..CameraConfig::for_url(url)
        }
    }

    #[tokio::test]
    async fn test_failures_back_off_up_to_ceiling() {
        let runner = ScriptedRunner::new(vec![], Step::Fail);
        let deps = deps(runner.clone(), fast_policy());
        let mut rx = deps.events.subscribe();

        let session = CameraSession::open(camera("rtsp://a"), 0, &deps).await;
        let delays = retry_delays(&mut rx, 5).await;
        // backoff plus the fixed pause
        assert_eq!(delays, vec![25, 45, 85, 85, 85]);

        let status = session.status();
        assert_eq!(status.backoff, Duration::from_millis(80));
        assert_eq!(status.last_error.as_deref(), Some("Internal error: scripted failure"));
        session.close().await;
    }

    #[tokio::test]
    async fn test_progress_resets_backoff() {
        let runner = ScriptedRunner::new(
            vec![Step::Fail, Step::Fail, Step::FrameThenFail],
            Step::Fail,
        );
        let deps = deps(runner.clone(), fast_policy());
        let mut rx = deps.events.subscribe();

        let session = CameraSession::open(camera("rtsp://a"), 0, &deps).await;
        let delays = retry_delays(&mut rx, 5).await;
        assert_eq!(delays, vec![25, 45, 25, 45, 85]);
        assert_eq!(session.frames().sequence(), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_restarts_keep_one_attempt_in_flight() {
        let runner = ScriptedRunner::new(vec![], Step::UntilStopped);
        let deps = deps(runner.clone(), fast_policy());
        let session = CameraSession::open(camera("rtsp://a"), 0, &deps).await;
        wait_until(|| runner.runs() == 1).await;

        for url in ["rtsp://b", "rtsp://c", "rtsp://d"] {
            session.restart_with(camera(url), "test").await;
        }
        tokio::join!(
            session.restart("burst 1"),
            session.restart("burst 2"),
            session.on_resume_from_sleep(),
        );
        wait_until(|| session.state() == SessionState::Running).await;

        assert_eq!(session.config().url, "rtsp://d");
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
        assert!(session.is_running().await);

        session.close().await;
        assert_eq!(runner.active.load(Ordering::SeqCst), 0);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_and_start_camera() {
        let runner = ScriptedRunner::new(vec![], Step::UntilStopped);
        let deps = deps(runner.clone(), fast_policy());
        let session = CameraSession::open(camera("rtsp://a"), 3, &deps).await;
        assert_eq!(session.index(), 3);
        wait_until(|| runner.runs() == 1).await;

        session.stop_camera().await;
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_running().await);
        assert_eq!(runner.active.load(Ordering::SeqCst), 0);

        // resume does not revive a stopped camera
        session.on_resume_from_sleep().await;
        assert!(!session.is_running().await);

        session.start_camera().await;
        session.start_camera().await;
        wait_until(|| runner.runs() == 2).await;
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let runner = ScriptedRunner::new(vec![], Step::UntilStopped);
        let deps = deps(runner.clone(), fast_policy());
        let mut rx = deps.events.subscribe();
        let session = CameraSession::open(camera("rtsp://a"), 0, &deps).await;
        wait_until(|| runner.runs() == 1).await;

        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert_eq!(session.state(), SessionState::Idle);

        session.restart("after close").await;
        session.start_camera().await;
        assert!(!session.is_running().await);
        assert_eq!(runner.runs(), 1);

        let mut closed = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::Closed { .. }) {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn test_wedged_attempt_does_not_block_close() {
        let runner = ScriptedRunner::new(vec![], Step::Wedge(Duration::from_millis(500)));
        let policy = RestartPolicy {
            stop_timeout: Duration::from_millis(50),
            ..fast_policy()
        };
        let deps = deps(runner.clone(), policy);
        let session = CameraSession::open(camera("rtsp://a"), 0, &deps).await;
        wait_until(|| runner.runs() == 1).await;

        let started = Instant::now();
        session.close().await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_recording_requests() {
        let runner = ScriptedRunner::new(vec![], Step::Fail);
        let session = CameraSession::new(camera("rtsp://a"), 0, &deps(runner, fast_policy()));
        assert!(!session.is_recording());
        assert!(session.toggle_recording());
        assert!(session.is_recording());
        assert!(session.set_recording(true));
        assert!(!session.toggle_recording());
        assert!(!session.set_recording(false));
        assert!(!session.status().recording);
    }

    #[test]
    fn test_metrics_cache_follows_samples() {
        let runner = ScriptedRunner::new(vec![], Step::Fail);
        let session = CameraSession::new(camera("rtsp://a"), 0, &deps(runner, fast_policy()));
        assert_eq!(session.metrics(), MetricsSnapshot::default());

        std::thread::sleep(Duration::from_millis(5));
        let sampled = session.sample_metrics();
        assert_eq!(session.metrics(), sampled);
        assert_eq!(sampled.fps, 0.0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Running.to_string(), "Running");
        assert_eq!(
            serde_json::to_string(&SessionState::Stopping).unwrap(),
            "\"stopping\""
        );
    }
}
