use std::path::Path;
use std::sync::Arc;
use zbus::interface;

use crate::app::App;

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.freedesktop.Rollcall1
/// Object path: /org/freedesktop/Rollcall1
///
/// Structured replies are JSON strings.
pub struct RollcallService {
    app: Arc<App>,
}

impl RollcallService {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

#[interface(name = "org.freedesktop.Rollcall1")]
impl RollcallService {
    /// Daemon, model, gallery, tracking and session state.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let report = self.app.status().await.map_err(failed)?;
        to_json(&report)
    }

    /// Load the face models if not loaded yet. Returns the model status.
    async fn initialize_model(&self) -> zbus::fdo::Result<String> {
        tracing::info!("initialize_model requested");
        to_json(&self.app.initialize_model().await)
    }

    /// Retry after a failed or degraded load.
    async fn retry_model(&self) -> zbus::fdo::Result<String> {
        tracing::info!("retry_model requested");
        to_json(&self.app.retry_model().await)
    }

    /// Rebuild the gallery from enrolled identities. Returns its size.
    async fn rebuild_gallery(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("rebuild_gallery requested");
        let size = self.app.rebuild_gallery().await.map_err(failed)?;
        Ok(size as u32)
    }

    /// Enroll one photo of an identity.
    async fn enroll(
        &self,
        identity_id: &str,
        display_name: &str,
        consent: bool,
        image_path: &str,
    ) -> zbus::fdo::Result<()> {
        tracing::info!(identity_id, consent, image_path, "enroll requested");
        self.app
            .enroll(identity_id, display_name, consent, Path::new(image_path))
            .await
            .map_err(failed)
    }

    /// Open a session for `context` and start the detection loop.
    async fn start_tracking(&self, context: &str) -> zbus::fdo::Result<()> {
        tracing::info!(context, "start_tracking requested");
        self.app.start_tracking(context).await.map_err(failed)
    }

    /// Stop the detection loop. Returns false if it was not running.
    async fn stop_tracking(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop_tracking requested");
        Ok(self.app.stop_tracking().await)
    }

    /// Identities observed in the open session.
    async fn observed(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.app.observed().await.map_err(failed)?;
        to_json(&snapshot)
    }

    /// Commit the open session. Returns the written records.
    async fn commit(&self, allow_simulated: bool) -> zbus::fdo::Result<String> {
        tracing::info!(allow_simulated, "commit requested");
        let records = self.app.commit(allow_simulated).await.map_err(failed)?;
        to_json(&records)
    }

    /// Close the session without committing. Returns the discarded count.
    async fn discard_session(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("discard_session requested");
        let discarded = self.app.discard_session().await.map_err(failed)?;
        Ok(discarded as u32)
    }

    async fn recent_events(&self) -> zbus::fdo::Result<String> {
        to_json(&self.app.recent_events())
    }
}
