//! Daemon state shared by every D-Bus method.

use rollcall_core::{
    AnalyzerError, AttendanceRecord, CommitPolicy, DiagnosticEvent, DiagnosticLog, DiagnosticSink,
    EuclideanMatcher, EventKind, Gallery, GalleryBuilder, GalleryError, GrayImage, IdentityId,
    ModelLoader, ModelManager, ModelStatus, SessionContext, SessionSnapshot,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::Config;
use crate::session_actor::{spawn_sessions, SessionActorError, SessionHandle};
use crate::store::{Store, StoreError};
use crate::tracker::{
    CameraProvider, PassReport, TrackError, Tracker, TrackerSettings, TrackingPhase,
};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("face models are not ready (state: {:?})", .0.state)]
    ModelNotReady(ModelStatus),
    #[error("enrollment needs the real face models; the simulated backend is active")]
    SimulatedModel,
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to read image: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error("no face found in {0}")]
    NoFaceFound(PathBuf),
    #[error("identity id must not be empty")]
    InvalidIdentity,
    #[error(transparent)]
    Track(#[from] TrackError),
    #[error(transparent)]
    Session(#[from] SessionActorError),
    #[error("background task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub camera: String,
    pub model: ModelStatus,
    pub gallery_size: usize,
    pub match_threshold: f32,
    pub tracking: TrackingPhase,
    pub session: SessionSnapshot,
    /// Faces from the most recent pass, for overlays.
    pub last_pass: Option<PassReport>,
}

pub struct App {
    config: Config,
    model: Arc<ModelManager>,
    store: Arc<Store>,
    gallery: watch::Sender<Arc<Gallery>>,
    sessions: SessionHandle,
    tracker: tokio::sync::Mutex<Tracker>,
    log: Arc<DiagnosticLog>,
}

impl App {
    /// Wire the components together. Must be called inside a tokio runtime.
    pub fn new(
        config: Config,
        loader: Arc<dyn ModelLoader>,
        camera: Arc<dyn CameraProvider>,
        store: Arc<Store>,
        log: Arc<DiagnosticLog>,
    ) -> Self {
        let model = Arc::new(ModelManager::new(loader, config.load_settings(), log.clone()));
        let (gallery, gallery_rx) = watch::channel(Gallery::empty());
        let sessions = spawn_sessions(store.clone(), log.clone());

        let tracker = Tracker::new(
            camera,
            model.clone(),
            gallery_rx,
            EuclideanMatcher::new(config.match_threshold),
            sessions.clone(),
            log.clone(),
            TrackerSettings {
                tick_interval: config.tick_interval,
                max_consecutive_failures: config.max_consecutive_failures,
            },
        );

        Self {
            config,
            model,
            store,
            gallery,
            sessions,
            tracker: tokio::sync::Mutex::new(tracker),
            log,
        }
    }

    pub async fn status(&self) -> Result<StatusReport, AppError> {
        let (tracking, last_pass) = {
            let tracker = self.tracker.lock().await;
            (tracker.phase(), tracker.latest_report())
        };
        Ok(StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            camera: self.config.camera_device.clone(),
            model: self.model.status(),
            gallery_size: self.gallery.borrow().len(),
            match_threshold: self.config.match_threshold.value(),
            tracking,
            session: self.sessions.snapshot().await?,
            last_pass,
        })
    }

    pub async fn initialize_model(&self) -> ModelStatus {
        self.model.initialize(&self.config.model_dir).await
    }

    pub async fn retry_model(&self) -> ModelStatus {
        self.model.retry(&self.config.model_dir).await
    }

    /// Rebuild the gallery from the store and publish it to the tracker.
    ///
    /// An empty result still replaces the previous gallery, so withdrawn
    /// consent takes effect, and is reported as an error.
    pub async fn rebuild_gallery(&self) -> Result<usize, AppError> {
        let store = self.store.clone();
        let identities = tokio::task::spawn_blocking(move || store.load_identities())
            .await
            .map_err(|e| AppError::Join(e.to_string()))??;

        match GalleryBuilder::build(&identities) {
            Ok(gallery) => {
                let size = gallery.len();
                self.gallery.send_replace(gallery);
                self.log.emit(DiagnosticEvent::info(
                    EventKind::GalleryBuilt,
                    format!("gallery rebuilt with {size} identities"),
                ));
                Ok(size)
            }
            Err(e) => {
                self.gallery.send_replace(Gallery::empty());
                self.log.emit(
                    DiagnosticEvent::warning(EventKind::GalleryEmpty, e.to_string())
                        .with_code("empty_gallery")
                        .with_suggestion("enroll identities with consent before tracking"),
                );
                Err(e.into())
            }
        }
    }

    /// Enroll one photo as a reference embedding, then refresh the gallery.
    pub async fn enroll(
        &self,
        identity_id: &str,
        display_name: &str,
        consent: bool,
        image_path: &Path,
    ) -> Result<(), AppError> {
        let identity_id = identity_id.trim();
        if identity_id.is_empty() {
            return Err(AppError::InvalidIdentity);
        }
        let handle = self
            .model
            .handle()
            .ok_or_else(|| AppError::ModelNotReady(self.model.status()))?;
        if handle.is_simulated() {
            return Err(AppError::SimulatedModel);
        }

        let path = image_path.to_path_buf();
        let embedding = tokio::task::spawn_blocking(move || -> Result<_, AppError> {
            let luma = image::open(&path)?.to_luma8();
            let (width, height) = luma.dimensions();
            let still = GrayImage::new(luma.as_raw(), width, height)?;
            handle
                .with_analyzer(|a| a.extract_embedding(still))?
                .ok_or(AppError::NoFaceFound(path))
        })
        .await
        .map_err(|e| AppError::Join(e.to_string()))??;

        let id = IdentityId::new(identity_id);
        let store = self.store.clone();
        let (stored_id, name) = (id.clone(), display_name.to_string());
        tokio::task::spawn_blocking(move || store.enroll(&stored_id, &name, consent, &embedding))
            .await
            .map_err(|e| AppError::Join(e.to_string()))??;
        tracing::info!(identity = %id, consent, "identity enrolled");

        match self.rebuild_gallery().await {
            Ok(_) | Err(AppError::Gallery(GalleryError::EmptyGallery { .. })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Open a session for `context` and start the detection loop.
    ///
    /// A blank context opens an unbound session; committing it fails.
    /// The model and camera are acquired first, so a failed start leaves
    /// any earlier uncommitted session untouched.
    pub async fn start_tracking(&self, context: &str) -> Result<(), AppError> {
        let mut tracker = self.tracker.lock().await;
        if tracker.is_active() {
            return Err(TrackError::AlreadyTracking.into());
        }

        let context = SessionContext::new(context);
        if context.is_none() {
            tracing::warn!("tracking started without a session context");
        }
        if self.gallery.borrow().is_empty() {
            tracing::warn!("gallery is empty; every face will be unmatched");
        }

        let camera = tracker.open().await?;
        self.sessions.start(context).await?;
        tracker.launch(camera);
        Ok(())
    }

    /// Stop the loop. The session stays open for commit.
    ///
    /// Returns false when no loop was running, including one that already
    /// ended on its own after repeated failures.
    pub async fn stop_tracking(&self) -> bool {
        let mut tracker = self.tracker.lock().await;
        let was_active = tracker.is_active();
        if let Some(outcome) = tracker.stop().await {
            tracing::info!(?outcome, was_active, "tracking stopped");
        }
        was_active
    }

    pub async fn observed(&self) -> Result<SessionSnapshot, AppError> {
        Ok(self.sessions.snapshot().await?)
    }

    pub async fn commit(&self, allow_simulated: bool) -> Result<Vec<AttendanceRecord>, AppError> {
        let policy = if allow_simulated {
            CommitPolicy::AllowSimulated
        } else {
            CommitPolicy::LiveOnly
        };
        let records = self.sessions.commit(policy).await?;
        if let Some(first) = records.first() {
            let context = first.context.as_str().to_string();
            let store = self.store.clone();
            let counted = tokio::task::spawn_blocking({
                let context = context.clone();
                move || store.attendance_count(&context)
            })
            .await;
            match counted {
                Ok(Ok(total)) => {
                    tracing::info!(%context, committed = records.len(), total, "attendance committed")
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to count attendance"),
                Err(e) => tracing::warn!(error = %e, "attendance count task failed"),
            }
        }
        Ok(records)
    }

    /// Close the session without writing anything.
    pub async fn discard_session(&self) -> Result<usize, AppError> {
        Ok(self.sessions.stop().await?)
    }

    pub fn recent_events(&self) -> Vec<DiagnosticEvent> {
        self.log.recent()
    }
}
