use anyhow::{Context, Result};
use rollcall_core::{DiagnosticLog, ModelState, OnnxLoader};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod app;
mod config;
mod dbus_interface;
mod session_actor;
mod store;
mod tracker;

use app::App;
use tracker::V4lCameraProvider;

const BUS_NAME: &str = "org.freedesktop.Rollcall1";
const OBJECT_PATH: &str = "/org/freedesktop/Rollcall1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        models = %config.model_dir.display(),
        db = %config.db_path.display(),
        threshold = config.match_threshold.value(),
        "configuration loaded"
    );

    let store = Arc::new(
        store::Store::open(&config.db_path)
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    let camera = Arc::new(V4lCameraProvider {
        device: config.camera_device.clone(),
        warmup_frames: config.warmup_frames,
    });
    let log = Arc::new(DiagnosticLog::default());
    let app = Arc::new(App::new(config, Arc::new(OnnxLoader), camera, store, log));

    // Model load runs in the background so the bus name is claimed immediately;
    // Status reports Loading meanwhile.
    let startup = Arc::clone(&app);
    tokio::spawn(async move {
        let status = startup.initialize_model().await;
        if status.state == ModelState::Failed {
            tracing::warn!(detail = ?status.detail, "models unavailable; use RetryModel once fixed");
        }
        if let Err(e) = startup.rebuild_gallery().await {
            tracing::warn!(error = %e, "initial gallery build failed");
        }
    });

    let service = dbus_interface::RollcallService::new(Arc::clone(&app));
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    if app.stop_tracking().await {
        tracing::info!("tracking stopped for shutdown");
    }

    Ok(())
}
