use rollcall_core::{LoadSettings, Threshold};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory holding `manifest.toml` and the ONNX artifacts.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance below which a face is accepted.
    pub match_threshold: Threshold,
    /// Interval between frame passes.
    pub tick_interval: Duration,
    /// Consecutive failed passes before tracking stops itself.
    pub max_consecutive_failures: u32,
    /// Number of frames discarded after opening the camera.
    pub warmup_frames: usize,
    pub model_load_timeout: Duration,
    pub model_load_attempts: u32,
    pub model_retry_backoff: Duration,
    /// Use simulated detections when the models cannot be loaded.
    pub allow_degraded: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let match_threshold = match parsed::<f32>(&get, "ROLLCALL_MATCH_THRESHOLD") {
            Some(value) => Threshold::new(value).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring ROLLCALL_MATCH_THRESHOLD");
                Threshold::default()
            }),
            None => Threshold::default(),
        };

        Self {
            camera_device: get("ROLLCALL_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            model_dir: get("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("models")),
            db_path: get("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("rollcall.db")),
            match_threshold,
            tick_interval: Duration::from_millis(parsed(&get, "ROLLCALL_TICK_MS").unwrap_or(200)),
            max_consecutive_failures: parsed(&get, "ROLLCALL_MAX_PASS_FAILURES").unwrap_or(5).max(1),
            warmup_frames: parsed(&get, "ROLLCALL_WARMUP_FRAMES").unwrap_or(3),
            model_load_timeout: Duration::from_secs(parsed(&get, "ROLLCALL_MODEL_TIMEOUT_SECS").unwrap_or(30)),
            model_load_attempts: parsed(&get, "ROLLCALL_MODEL_LOAD_ATTEMPTS").unwrap_or(2).max(1),
            model_retry_backoff: Duration::from_millis(parsed(&get, "ROLLCALL_MODEL_RETRY_BACKOFF_MS").unwrap_or(500)),
            allow_degraded: get("ROLLCALL_ALLOW_DEGRADED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn load_settings(&self) -> LoadSettings {
        LoadSettings {
            timeout: self.model_load_timeout,
            attempts: self.model_load_attempts,
            retry_backoff: self.model_retry_backoff,
            allow_degraded: self.allow_degraded,
        }
    }
}

fn parsed<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|v| v.trim().parse().ok())
}
