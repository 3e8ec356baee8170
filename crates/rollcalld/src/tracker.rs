//! Frame detection loop.
//!
//! While tracking is active a single task ticks at a fixed interval and runs
//! one capture → detect/embed → match pass per tick. The next tick is only
//! awaited after the previous pass finished, so passes never overlap; ticks
//! missed during a slow pass are skipped, not queued. Stopping cancels future
//! ticks, lets an in-flight pass finish, then releases the camera.

use rollcall_core::{
    AnalyzerError, DiagnosticEvent, DiagnosticSink, EuclideanMatcher, EventKind, Gallery, GrayImage,
    IdentityId, MatchResult, Matcher, ModelHandle, ModelManager, ModelStatus, ObservationOrigin,
};
use rollcall_hw::{Camera, CameraError, Frame};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::session_actor::SessionHandle;

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("camera unavailable: {0}")]
    CameraAccess(#[from] CameraError),
    #[error("face models are not usable (state: {0:?})")]
    ModelNotReady(ModelStatus),
    #[error("tracking is already active")]
    AlreadyTracking,
    #[error("camera open task failed: {0}")]
    Join(String),
}

/// Per-frame failure; recoverable until it repeats too often.
#[derive(Error, Debug)]
pub enum PassError {
    #[error("capture: {0}")]
    Capture(#[from] CameraError),
    #[error("analysis: {0}")]
    Analysis(#[from] AnalyzerError),
    #[error("session task unavailable")]
    SessionClosed,
}

/// Source of live frames, exclusively owned by the loop.
pub trait FrameSource: Send + 'static {
    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

/// Opens the camera when tracking starts.
pub trait CameraProvider: Send + Sync + 'static {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// V4L2 camera at a fixed device path.
pub struct V4lCameraProvider {
    pub device: String,
    pub warmup_frames: usize,
}

impl CameraProvider for V4lCameraProvider {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        let camera = Camera::open(&self.device)?;
        if self.warmup_frames > 0 {
            tracing::debug!(count = self.warmup_frames, "discarding warmup frames");
            camera.warm_up(self.warmup_frames);
        }
        Ok(Box::new(camera))
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub tick_interval: Duration,
    pub max_consecutive_failures: u32,
}

/// One face as drawn by an overlay; the label and colour come from `result`.
#[derive(Debug, Clone, Serialize)]
pub struct FaceReport {
    pub bbox: rollcall_core::BoundingBox,
    pub result: MatchResult,
    pub display_name: Option<String>,
}

/// Outcome of one pass, published for overlays.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub sequence: u32,
    pub simulated: bool,
    pub faces: Vec<FaceReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrackingPhase {
    Idle,
    Tracking,
    Stopped,
    /// Stopped itself after repeated pass failures; the operator may restart.
    Failed { failures: u32, last_error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingOutcome {
    Stopped,
    TooManyFailures { failures: u32, last_error: String },
}

struct LoopContext {
    model: Arc<ModelManager>,
    gallery: watch::Receiver<Arc<Gallery>>,
    matcher: EuclideanMatcher,
    sessions: SessionHandle,
    sink: Arc<dyn DiagnosticSink>,
    reports: Arc<watch::Sender<Option<PassReport>>>,
    settings: TrackerSettings,
}

/// A camera held for a run that has not been launched yet.
pub struct OpenCamera(Box<dyn FrameSource>);

struct TrackingRun {
    stop: oneshot::Sender<()>,
    task: JoinHandle<TrackingOutcome>,
}

pub struct Tracker {
    camera: Arc<dyn CameraProvider>,
    model: Arc<ModelManager>,
    gallery: watch::Receiver<Arc<Gallery>>,
    matcher: EuclideanMatcher,
    sessions: SessionHandle,
    sink: Arc<dyn DiagnosticSink>,
    settings: TrackerSettings,
    reports: Arc<watch::Sender<Option<PassReport>>>,
    phase: Arc<watch::Sender<TrackingPhase>>,
    run: Option<TrackingRun>,
}

impl Tracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: Arc<dyn CameraProvider>,
        model: Arc<ModelManager>,
        gallery: watch::Receiver<Arc<Gallery>>,
        matcher: EuclideanMatcher,
        sessions: SessionHandle,
        sink: Arc<dyn DiagnosticSink>,
        settings: TrackerSettings,
    ) -> Self {
        let (reports, _) = watch::channel(None);
        let (phase, _) = watch::channel(TrackingPhase::Idle);
        Self {
            camera,
            model,
            gallery,
            matcher,
            sessions,
            sink,
            settings,
            reports: Arc::new(reports),
            phase: Arc::new(phase),
            run: None,
        }
    }

    pub fn phase(&self) -> TrackingPhase {
        self.phase.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.run.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    pub fn latest_report(&self) -> Option<PassReport> {
        self.reports.borrow().clone()
    }

    /// Open the camera and start the loop.
    ///
    /// Camera failures are returned here and the loop is never started.
    #[cfg(test)]
    pub async fn start(&mut self) -> Result<(), TrackError> {
        let camera = self.open().await?;
        self.launch(camera);
        Ok(())
    }

    /// Check the model and acquire the camera without starting the loop.
    ///
    /// Dropping the returned [`OpenCamera`] releases the device.
    pub async fn open(&mut self) -> Result<OpenCamera, TrackError> {
        if self.is_active() {
            return Err(TrackError::AlreadyTracking);
        }
        // Reap a run that ended on its own.
        if let Some(old) = self.run.take() {
            let _ = old.task.await;
        }

        if self.model.handle().is_none() {
            return Err(TrackError::ModelNotReady(self.model.status()));
        }

        let provider = Arc::clone(&self.camera);
        let opened = tokio::task::spawn_blocking(move || provider.open())
            .await
            .map_err(|e| TrackError::Join(e.to_string()))?;
        match opened {
            Ok(source) => Ok(OpenCamera(source)),
            Err(e) => {
                self.sink.emit(
                    DiagnosticEvent::error(EventKind::CameraError, format!("cannot start tracking: {e}"))
                        .with_code(camera_error_code(&e))
                        .with_suggestion("check camera permissions and connection, then retry"),
                );
                Err(TrackError::CameraAccess(e))
            }
        }
    }

    /// Start the loop on a camera acquired by [`open`](Self::open).
    pub fn launch(&mut self, camera: OpenCamera) {
        let source = camera.0;
        let ctx = LoopContext {
            model: Arc::clone(&self.model),
            gallery: self.gallery.clone(),
            matcher: self.matcher,
            sessions: self.sessions.clone(),
            sink: Arc::clone(&self.sink),
            reports: Arc::clone(&self.reports),
            settings: self.settings.clone(),
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        let phase = Arc::clone(&self.phase);

        phase.send_replace(TrackingPhase::Tracking);
        self.sink.emit(DiagnosticEvent::info(EventKind::TrackingStarted, "tracking started"));

        let task = tokio::spawn(async move {
            let outcome = run_loop(source, ctx, stop_rx).await;
            phase.send_replace(match &outcome {
                TrackingOutcome::Stopped => TrackingPhase::Stopped,
                TrackingOutcome::TooManyFailures { failures, last_error } => TrackingPhase::Failed {
                    failures: *failures,
                    last_error: last_error.clone(),
                },
            });
            outcome
        });

        self.run = Some(TrackingRun { stop: stop_tx, task });
    }

    /// Stop tracking and wait for the loop to release the camera.
    pub async fn stop(&mut self) -> Option<TrackingOutcome> {
        let run = self.run.take()?;
        let _ = run.stop.send(());
        match run.task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(error = %e, "tracking task ended abnormally");
                self.phase.send_replace(TrackingPhase::Stopped);
                None
            }
        }
    }
}

fn camera_error_code(e: &CameraError) -> &'static str {
    match e {
        CameraError::PermissionDenied(_) => "camera_permission",
        CameraError::DeviceNotFound(_) => "camera_not_found",
        CameraError::DeviceBusy(_) => "camera_busy",
        _ => "camera_error",
    }
}

async fn run_loop(
    mut source: Box<dyn FrameSource>,
    ctx: LoopContext,
    mut stop: oneshot::Receiver<()>,
) -> TrackingOutcome {
    let mut ticker = tokio::time::interval(ctx.settings.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut consecutive_failures = 0u32;

    let (outcome, source) = loop {
        // Stop is only observed between passes; a pass in flight always completes.
        tokio::select! {
            biased;
            _ = &mut stop => break (TrackingOutcome::Stopped, Some(source)),
            _ = ticker.tick() => {}
        }

        let Some(model) = ctx.model.handle() else {
            tracing::debug!("model not available; skipping tick");
            continue;
        };

        // Snapshot the gallery for the whole pass; rebuilds apply from the next tick.
        let gallery = ctx.gallery.borrow().clone();

        let (returned, captured) = capture_and_analyze(source, model.clone()).await;
        let Some(returned) = returned else {
            // The blocking pass panicked and took the source down with it.
            let outcome = TrackingOutcome::TooManyFailures {
                failures: consecutive_failures + 1,
                last_error: "detection pass panicked".to_string(),
            };
            break (outcome, None);
        };
        source = returned;

        let pass = match captured {
            Ok(Some((sequence, detections))) => {
                record_pass(&ctx, &gallery, &model, sequence, detections).await
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        match pass {
            Ok(()) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures += 1;
                tracing::warn!(
                    error = %e,
                    consecutive = consecutive_failures,
                    limit = ctx.settings.max_consecutive_failures,
                    "detection pass failed"
                );
                ctx.sink.emit(
                    DiagnosticEvent::warning(EventKind::PassFailed, format!("detection pass failed: {e}"))
                        .with_code("pass_failed"),
                );
                if consecutive_failures >= ctx.settings.max_consecutive_failures {
                    let outcome = TrackingOutcome::TooManyFailures {
                        failures: consecutive_failures,
                        last_error: e.to_string(),
                    };
                    break (outcome, Some(source));
                }
            }
        }
    };

    drop(source);

    match &outcome {
        TrackingOutcome::Stopped => {
            ctx.sink.emit(DiagnosticEvent::info(EventKind::TrackingStopped, "tracking stopped; camera released"));
        }
        TrackingOutcome::TooManyFailures { failures, last_error } => {
            ctx.sink.emit(
                DiagnosticEvent::error(
                    EventKind::TrackingStopped,
                    format!("tracking stopped after {failures} failed passes: {last_error}"),
                )
                .with_code("tracking_failed")
                .with_suggestion("restart tracking once the camera or model issue is resolved"),
            );
        }
    }
    outcome
}

type Analyzed = Option<(u32, Vec<rollcall_core::Detection>)>;

/// Run capture and analysis on the blocking pool, handing the source back.
///
/// Returns `None` for the source if the blocking task panicked.
async fn capture_and_analyze(
    mut source: Box<dyn FrameSource>,
    model: ModelHandle,
) -> (Option<Box<dyn FrameSource>>, Result<Analyzed, PassError>) {
    let joined = tokio::task::spawn_blocking(move || {
        let result = (|| -> Result<Analyzed, PassError> {
            let frame = source.next_frame()?;
            if frame.is_dark() {
                tracing::trace!(seq = frame.sequence, "dark frame skipped");
                return Ok(None);
            }
            let image = GrayImage::new(&frame.data, frame.width, frame.height)?;
            let detections = model.with_analyzer(|a| a.analyze(image))?;
            Ok(Some((frame.sequence, detections)))
        })();
        (source, result)
    })
    .await;

    match joined {
        Ok((source, result)) => (Some(source), result),
        Err(e) => (None, Err(PassError::Analysis(AnalyzerError::InferenceFailed(e.to_string())))),
    }
}

/// Match each detection against the pass's gallery snapshot and forward
/// matches to the session task.
async fn record_pass(
    ctx: &LoopContext,
    gallery: &Gallery,
    model: &ModelHandle,
    sequence: u32,
    detections: Vec<rollcall_core::Detection>,
) -> Result<(), PassError> {
    let mut faces = Vec::with_capacity(detections.len());
    let mut matched: Vec<(IdentityId, ObservationOrigin)> = Vec::new();

    for det in &detections {
        let result = ctx.matcher.compare(&det.embedding, gallery);
        if result.is_match {
            if let Some(id) = &result.identity_id {
                let origin = if det.synthetic {
                    ObservationOrigin::Simulated
                } else {
                    ObservationOrigin::Live
                };
                matched.push((id.clone(), origin));
            }
        }
        faces.push(FaceReport {
            bbox: det.bbox,
            display_name: result
                .identity_id
                .as_ref()
                .filter(|_| result.is_match)
                .and_then(|id| gallery.display_name(id))
                .map(str::to_string),
            result,
        });
    }

    ctx.reports.send_replace(Some(PassReport {
        sequence,
        simulated: model.is_simulated(),
        faces,
    }));

    // Repeats are coalesced by the session task.
    for (id, origin) in matched {
        ctx.sessions
            .observe(id, origin)
            .await
            .map_err(|_| PassError::SessionClosed)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_actor::spawn_sessions;
    use crate::session_actor::tests::MemoryStore;
    use rollcall_core::{
        AnalyzerMode, BoundingBox, CommitPolicy, Detection, DiagnosticLog, Embedding,
        EnrolledIdentity, FaceAnalyzer, GalleryBuilder, LoadSettings, ModelLoadError, ModelLoader,
        SessionContext, EMBEDDING_DIM,
    };
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    fn axis(i: usize) -> Embedding {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[i] = 1.0;
        Embedding::new(values)
    }

    /// Plays back one list of embeddings per call, then reports no faces.
    struct ScriptedAnalyzer {
        script: VecDeque<Vec<Embedding>>,
        calls: Arc<AtomicUsize>,
        delay: Duration,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        completed: Arc<AtomicUsize>,
        synthetic: bool,
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn analyze(&mut self, _frame: GrayImage<'_>) -> Result<Vec<Detection>, AnalyzerError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);

            let faces = self.script.pop_front().unwrap_or_default();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(faces
                .into_iter()
                .map(|embedding| Detection {
                    bbox: BoundingBox { x: 1.0, y: 1.0, width: 4.0, height: 4.0, confidence: 0.9 },
                    embedding,
                    captured_at: chrono::Utc::now(),
                    synthetic: self.synthetic,
                })
                .collect())
        }

        fn extract_embedding(&mut self, _still: GrayImage<'_>) -> Result<Option<Embedding>, AnalyzerError> {
            Ok(None)
        }

        fn mode(&self) -> AnalyzerMode {
            AnalyzerMode::Model
        }
    }

    struct OnceLoader(Mutex<Option<Box<dyn FaceAnalyzer>>>);

    impl ModelLoader for OnceLoader {
        fn load(&self, _location: &Path) -> Result<Box<dyn FaceAnalyzer>, ModelLoadError> {
            self.0.lock().unwrap().take().ok_or(ModelLoadError::Manifest("already loaded".into()))
        }
    }

    struct FakeSource {
        fail: bool,
        released: Arc<AtomicBool>,
        completed: Arc<AtomicUsize>,
        completed_at_release: Arc<AtomicUsize>,
        seq: u32,
    }

    impl FrameSource for FakeSource {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            if self.fail {
                return Err(CameraError::CaptureFailed("sensor timeout".into()));
            }
            self.seq += 1;
            Ok(Frame {
                data: vec![128; 16 * 16],
                width: 16,
                height: 16,
                captured_at: Instant::now(),
                sequence: self.seq,
            })
        }
    }

    impl Drop for FakeSource {
        fn drop(&mut self) {
            self.completed_at_release
                .store(self.completed.load(Ordering::SeqCst), Ordering::SeqCst);
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct FakeCamera {
        deny: bool,
        fail_frames: bool,
        released: Arc<AtomicBool>,
        completed: Arc<AtomicUsize>,
        completed_at_release: Arc<AtomicUsize>,
    }

    impl CameraProvider for FakeCamera {
        fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
            if self.deny {
                return Err(CameraError::PermissionDenied("/dev/video0: Permission denied".into()));
            }
            Ok(Box::new(FakeSource {
                fail: self.fail_frames,
                released: self.released.clone(),
                completed: self.completed.clone(),
                completed_at_release: self.completed_at_release.clone(),
                seq: 0,
            }))
        }
    }

    struct Harness {
        tracker: Tracker,
        sessions: SessionHandle,
        store: Arc<MemoryStore>,
        log: Arc<DiagnosticLog>,
        calls: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
        completed: Arc<AtomicUsize>,
        completed_at_release: Arc<AtomicUsize>,
        gallery_tx: watch::Sender<Arc<Gallery>>,
    }

    struct Setup {
        script: Vec<Vec<Embedding>>,
        delay: Duration,
        deny: bool,
        fail_frames: bool,
        synthetic: bool,
        tick: Duration,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                script: Vec::new(),
                delay: Duration::ZERO,
                deny: false,
                fail_frames: false,
                synthetic: false,
                tick: Duration::from_millis(2),
            }
        }
    }

    async fn harness(setup: Setup) -> Harness {
        let calls = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let analyzer = ScriptedAnalyzer {
            script: setup.script.into(),
            calls: calls.clone(),
            delay: setup.delay,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: max_in_flight.clone(),
            completed: completed.clone(),
            synthetic: setup.synthetic,
        };

        let log = Arc::new(DiagnosticLog::default());
        let model = Arc::new(ModelManager::new(
            Arc::new(OnceLoader(Mutex::new(Some(Box::new(analyzer))))),
            LoadSettings { attempts: 1, ..LoadSettings::default() },
            log.clone(),
        ));
        model.initialize(Path::new("/models")).await;

        let gallery = roster(&[("A", "Ann", 0), ("B", "Ben", 1)]);
        let (gallery_tx, gallery_rx) = watch::channel(gallery);

        let store = Arc::new(MemoryStore::default());
        let sessions = spawn_sessions(store.clone(), log.clone());

        let released = Arc::new(AtomicBool::new(false));
        let completed_at_release = Arc::new(AtomicUsize::new(usize::MAX));
        let camera = Arc::new(FakeCamera {
            deny: setup.deny,
            fail_frames: setup.fail_frames,
            released: released.clone(),
            completed: completed.clone(),
            completed_at_release: completed_at_release.clone(),
        });

        let tracker = Tracker::new(
            camera,
            model,
            gallery_rx,
            EuclideanMatcher::default(),
            sessions.clone(),
            log.clone(),
            TrackerSettings {
                tick_interval: setup.tick,
                max_consecutive_failures: 3,
            },
        );

        Harness {
            tracker,
            sessions,
            store,
            log,
            calls,
            max_in_flight,
            released,
            completed,
            completed_at_release,
            gallery_tx,
        }
    }

    /// Gallery of consenting identities, each enrolled on one axis.
    fn roster(people: &[(&str, &str, usize)]) -> Arc<Gallery> {
        let rows: Vec<EnrolledIdentity> = people
            .iter()
            .map(|&(id, name, i)| EnrolledIdentity {
                identity_id: id.into(),
                display_name: name.into(),
                consent: true,
                embedding: Some(axis(i)),
            })
            .collect();
        GalleryBuilder::build(&rows).unwrap()
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_repeat_observations_coalesce_into_two_records() {
        let mut h = harness(Setup {
            script: vec![vec![axis(0)], vec![axis(0)], vec![axis(1)]],
            ..Setup::default()
        })
        .await;
        h.sessions.start(SessionContext::new("CS-101")).await.unwrap();

        h.tracker.start().await.unwrap();
        let calls = h.calls.clone();
        wait_for(|| calls.load(Ordering::SeqCst) >= 4).await;
        assert_eq!(h.tracker.stop().await, Some(TrackingOutcome::Stopped));

        let snapshot = h.sessions.snapshot().await.unwrap();
        let observed: Vec<&str> = snapshot.observed.iter().map(|i| i.as_str()).collect();
        assert_eq!(observed, vec!["A", "B"]);

        let records = h.sessions.commit(CommitPolicy::LiveOnly).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(h.store.records.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unmatched_faces_are_not_observed() {
        let mut far = vec![0.0; EMBEDDING_DIM];
        far[5] = 1.0;
        let mut h = harness(Setup {
            script: vec![vec![Embedding::new(far)]],
            ..Setup::default()
        })
        .await;
        h.sessions.start(SessionContext::new("CS-101")).await.unwrap();
        h.tracker.start().await.unwrap();
        wait_for(|| h.tracker.latest_report().is_some()).await;
        let report = h.tracker.latest_report().unwrap();
        h.tracker.stop().await;

        assert_eq!(report.faces.len(), 1);
        assert_eq!(report.faces[0].result.label(), "unmatched");
        assert_eq!(report.faces[0].result.threshold, 0.6);
        assert!(report.faces[0].display_name.is_none());
        assert_eq!(h.sessions.snapshot().await.unwrap().observed.len(), 0);
    }

    #[tokio::test]
    async fn test_camera_denied_never_runs_loop() {
        let mut h = harness(Setup { deny: true, ..Setup::default() }).await;

        let err = h.tracker.start().await.unwrap_err();
        assert!(matches!(err, TrackError::CameraAccess(CameraError::PermissionDenied(_))));
        assert!(!h.tracker.is_active());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.tracker.phase(), TrackingPhase::Idle);

        let event = h.log.recent().into_iter().find(|e| e.kind == EventKind::CameraError).unwrap();
        assert_eq!(event.code, Some("camera_permission"));
        assert!(event.suggestion.is_some());
    }

    #[tokio::test]
    async fn test_passes_never_overlap() {
        let mut h = harness(Setup {
            delay: Duration::from_millis(15),
            tick: Duration::from_millis(1),
            ..Setup::default()
        })
        .await;

        h.tracker.start().await.unwrap();
        let calls = h.calls.clone();
        wait_for(|| calls.load(Ordering::SeqCst) >= 4).await;
        h.tracker.stop().await;

        assert_eq!(h.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_pass_before_release() {
        let mut h = harness(Setup {
            delay: Duration::from_millis(60),
            ..Setup::default()
        })
        .await;

        h.tracker.start().await.unwrap();
        let calls = h.calls.clone();
        wait_for(|| calls.load(Ordering::SeqCst) >= 1).await;

        // A pass is in flight now.
        assert_eq!(h.tracker.stop().await, Some(TrackingOutcome::Stopped));
        assert!(h.released.load(Ordering::SeqCst));
        assert_eq!(
            h.completed_at_release.load(Ordering::SeqCst),
            h.completed.load(Ordering::SeqCst)
        );
        assert_eq!(h.tracker.phase(), TrackingPhase::Stopped);
    }

    #[tokio::test]
    async fn test_repeated_failures_stop_tracking() {
        let mut h = harness(Setup { fail_frames: true, ..Setup::default() }).await;

        h.tracker.start().await.unwrap();
        wait_for(|| !h.tracker.is_active()).await;

        assert!(h.released.load(Ordering::SeqCst));
        assert!(matches!(h.tracker.phase(), TrackingPhase::Failed { failures: 3, .. }));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        let outcome = h.tracker.stop().await.unwrap();
        assert!(matches!(outcome, TrackingOutcome::TooManyFailures { failures: 3, .. }));

        let failures = h
            .log
            .recent()
            .iter()
            .filter(|e| e.kind == EventKind::PassFailed)
            .count();
        assert_eq!(failures, 3);
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_active() {
        let mut h = harness(Setup::default()).await;
        h.tracker.start().await.unwrap();
        assert!(matches!(h.tracker.start().await, Err(TrackError::AlreadyTracking)));
        h.tracker.stop().await;

        // Restart after a clean stop reopens the camera.
        h.tracker.start().await.unwrap();
        assert!(h.tracker.is_active());
        h.tracker.stop().await;
    }

    #[tokio::test]
    async fn test_rebuilt_gallery_applies_from_next_pass() {
        let mut h = harness(Setup {
            script: vec![vec![axis(2)]; 400],
            ..Setup::default()
        })
        .await;
        h.sessions.start(SessionContext::new("CS-101")).await.unwrap();

        h.tracker.start().await.unwrap();
        wait_for(|| h.tracker.latest_report().is_some()).await;
        let first = h.tracker.latest_report().unwrap();
        assert!(!first.faces[0].result.is_match);

        // Newly enrolled identity C appears in a rebuilt gallery.
        h.gallery_tx
            .send_replace(roster(&[("A", "Ann", 0), ("B", "Ben", 1), ("C", "Cy", 2)]));
        let swapped_at = h.calls.load(Ordering::SeqCst);
        let calls = h.calls.clone();
        wait_for(|| calls.load(Ordering::SeqCst) >= swapped_at + 3).await;
        h.tracker.stop().await;

        let snapshot = h.sessions.snapshot().await.unwrap();
        let observed: Vec<&str> = snapshot.observed.iter().map(|i| i.as_str()).collect();
        assert_eq!(observed, vec!["C"]);
        let last = h.tracker.latest_report().unwrap();
        assert_eq!(last.faces[0].result.label(), "C");
        assert_eq!(last.faces[0].display_name.as_deref(), Some("Cy"));
    }

    #[tokio::test]
    async fn test_synthetic_detections_need_commit_override() {
        let mut h = harness(Setup {
            script: vec![vec![axis(0)]],
            synthetic: true,
            ..Setup::default()
        })
        .await;
        h.sessions.start(SessionContext::new("CS-101")).await.unwrap();

        h.tracker.start().await.unwrap();
        let calls = h.calls.clone();
        wait_for(|| calls.load(Ordering::SeqCst) >= 2).await;
        h.tracker.stop().await;

        let snapshot = h.sessions.snapshot().await.unwrap();
        assert_eq!(snapshot.simulated, 1);

        let err = h.sessions.commit(CommitPolicy::LiveOnly).await.unwrap_err();
        assert!(matches!(
            err,
            crate::session_actor::SessionActorError::Session(
                rollcall_core::SessionError::SimulatedObservations { count: 1 }
            )
        ));
        assert!(h.store.records.lock().unwrap().is_empty());

        let records = h.sessions.commit(CommitPolicy::AllowSimulated).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].capture_method, rollcall_core::CaptureMethod::Simulated);
    }

    #[tokio::test]
    async fn test_open_without_launch_releases_camera() {
        let mut h = harness(Setup::default()).await;
        let camera = h.tracker.open().await.unwrap();
        assert!(!h.tracker.is_active());
        drop(camera);
        assert!(h.released.load(Ordering::SeqCst));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }
}
