//! Model lifecycle: brings the face-analysis capability to a usable state
//! exactly once per process.
//!
//! All `initialize` and `retry` calls pass through a single async gate, so
//! concurrent callers wait on the load already in flight and then observe
//! its outcome instead of starting a second artifact fetch. `status()` reads
//! a `watch` channel and never waits on the gate.

use crate::analyzer::{AnalyzerMode, FaceAnalyzer, SyntheticAnalyzer};
use crate::diagnostics::{DiagnosticEvent, DiagnosticSink, EventKind};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("failed to fetch {artifact}: {reason}")]
    Fetch { artifact: String, reason: String },
    #[error("invalid model manifest: {0}")]
    Manifest(String),
    #[error("digest mismatch for {artifact}: expected {expected}, got {actual}")]
    DigestMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },
    #[error("failed to parse {artifact}: {reason}")]
    Parse { artifact: String, reason: String },
    #[error("model load timed out after {0:?}")]
    Timeout(Duration),
    #[error("model loader panicked: {0}")]
    Panicked(String),
}

/// Source of the detector + embedder artifacts.
///
/// `load` is blocking; the manager runs it on the blocking pool.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self, location: &Path) -> Result<Box<dyn FaceAnalyzer>, ModelLoadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Uninitialized,
    Loading,
    Ready,
    /// Load failed and the simulated backend is active. Never reported as Ready.
    Degraded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    pub state: ModelState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ModelStatus {
    fn new(state: ModelState, detail: Option<String>) -> Self {
        Self { state, detail }
    }
}

#[derive(Debug, Clone)]
pub struct LoadSettings {
    /// Upper bound for a single load attempt.
    pub timeout: Duration,
    /// Attempts per `initialize`/`retry` call, at least one.
    pub attempts: u32,
    pub retry_backoff: Duration,
    /// Fall back to the simulated backend instead of Failed.
    pub allow_degraded: bool,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            attempts: 2,
            retry_backoff: Duration::from_millis(500),
            allow_degraded: false,
        }
    }
}

/// Cheaply clonable handle to the loaded analyzer.
#[derive(Clone)]
pub struct ModelHandle {
    analyzer: Arc<Mutex<Box<dyn FaceAnalyzer>>>,
    mode: AnalyzerMode,
}

impl ModelHandle {
    fn new(analyzer: Box<dyn FaceAnalyzer>) -> Self {
        let mode = analyzer.mode();
        Self {
            analyzer: Arc::new(Mutex::new(analyzer)),
            mode,
        }
    }

    pub fn mode(&self) -> AnalyzerMode {
        self.mode
    }

    pub fn is_simulated(&self) -> bool {
        self.mode == AnalyzerMode::Simulated
    }

    /// Run `f` with exclusive access to the analyzer. Blocking.
    pub fn with_analyzer<R>(&self, f: impl FnOnce(&mut dyn FaceAnalyzer) -> R) -> R {
        let mut guard = self.analyzer.lock().unwrap_or_else(|p| p.into_inner());
        f(guard.as_mut())
    }
}

/// Process-wide owner of the model state. Share it behind an `Arc`.
pub struct ModelManager {
    loader: Arc<dyn ModelLoader>,
    settings: LoadSettings,
    sink: Arc<dyn DiagnosticSink>,
    status: watch::Sender<ModelStatus>,
    gate: tokio::sync::Mutex<()>,
    handle: Mutex<Option<ModelHandle>>,
}

impl ModelManager {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        settings: LoadSettings,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let (status, _) = watch::channel(ModelStatus::new(ModelState::Uninitialized, None));
        Self {
            loader,
            settings,
            sink,
            status,
            gate: tokio::sync::Mutex::new(()),
            handle: Mutex::new(None),
        }
    }

    /// Current state; never blocks.
    pub fn status(&self) -> ModelStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ModelStatus> {
        self.status.subscribe()
    }

    /// The analyzer when Ready or Degraded.
    pub fn handle(&self) -> Option<ModelHandle> {
        self.handle.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Bring the model up. Idempotent.
    ///
    /// Ready, Degraded and Failed are returned as-is; leaving Failed or
    /// Degraded requires [`retry`](Self::retry).
    pub async fn initialize(&self, location: &Path) -> ModelStatus {
        let _gate = self.gate.lock().await;
        let current = self.status();
        match current.state {
            ModelState::Ready | ModelState::Degraded | ModelState::Failed => current,
            // Loading here means a previous caller was cancelled mid-load.
            ModelState::Uninitialized | ModelState::Loading => self.load(location).await,
        }
    }

    /// Explicit retry after Failed or Degraded. A no-op when Ready.
    pub async fn retry(&self, location: &Path) -> ModelStatus {
        let _gate = self.gate.lock().await;
        let current = self.status();
        if current.state == ModelState::Ready {
            return current;
        }
        tracing::info!(from = ?current.state, "retrying model load");
        self.load(location).await
    }

    async fn load(&self, location: &Path) -> ModelStatus {
        self.set_handle(None);
        self.publish(ModelStatus::new(ModelState::Loading, None));
        self.sink.emit(DiagnosticEvent::info(
            EventKind::ModelLoading,
            format!("loading face models from {}", location.display()),
        ));

        let attempts = self.settings.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.load_once(location.to_path_buf()).await {
                Ok(analyzer) => {
                    self.set_handle(Some(ModelHandle::new(analyzer)));
                    let status = ModelStatus::new(ModelState::Ready, None);
                    self.publish(status.clone());
                    self.sink.emit(DiagnosticEvent::info(
                        EventKind::ModelReady,
                        format!("face models ready (attempt {attempt}/{attempts})"),
                    ));
                    return status;
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "model load attempt failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_backoff).await;
                    }
                }
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown load failure".to_string());

        if self.settings.allow_degraded {
            self.set_handle(Some(ModelHandle::new(Box::new(SyntheticAnalyzer))));
            let status = ModelStatus::new(ModelState::Degraded, Some(detail.clone()));
            self.publish(status.clone());
            self.sink.emit(
                DiagnosticEvent::warning(
                    EventKind::ModelDegraded,
                    format!("face models unavailable, running in SIMULATED mode: {detail}"),
                )
                .with_code("model_degraded")
                .with_suggestion("retry model loading; simulated observations cannot be committed without override"),
            );
            status
        } else {
            let status = ModelStatus::new(ModelState::Failed, Some(detail.clone()));
            self.publish(status.clone());
            self.sink.emit(
                DiagnosticEvent::error(EventKind::ModelFailed, format!("face models failed to load: {detail}"))
                    .with_code("model_load")
                    .with_suggestion("check the model directory and retry"),
            );
            status
        }
    }

    async fn load_once(&self, location: PathBuf) -> Result<Box<dyn FaceAnalyzer>, ModelLoadError> {
        let loader = Arc::clone(&self.loader);
        let task = tokio::task::spawn_blocking(move || loader.load(&location));

        // A timed-out blocking load cannot be aborted; its result is dropped.
        match tokio::time::timeout(self.settings.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ModelLoadError::Panicked(join.to_string())),
            Err(_) => Err(ModelLoadError::Timeout(self.settings.timeout)),
        }
    }

    fn publish(&self, status: ModelStatus) {
        tracing::debug!(state = ?status.state, "model state changed");
        self.status.send_replace(status);
    }

    fn set_handle(&self, handle: Option<ModelHandle>) {
        *self.handle.lock().unwrap_or_else(|p| p.into_inner()) = handle;
    }
}
