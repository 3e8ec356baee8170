use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_hw::Camera;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.freedesktop.Rollcall1",
    default_service = "org.freedesktop.Rollcall1",
    default_path = "/org/freedesktop/Rollcall1"
)]
trait Rollcall {
    fn status(&self) -> zbus::Result<String>;
    fn initialize_model(&self) -> zbus::Result<String>;
    fn retry_model(&self) -> zbus::Result<String>;
    fn rebuild_gallery(&self) -> zbus::Result<u32>;
    fn enroll(&self, identity_id: &str, display_name: &str, consent: bool, image_path: &str) -> zbus::Result<()>;
    fn start_tracking(&self, context: &str) -> zbus::Result<()>;
    fn stop_tracking(&self) -> zbus::Result<bool>;
    fn observed(&self) -> zbus::Result<String>;
    fn commit(&self, allow_simulated: bool) -> zbus::Result<String>;
    fn discard_session(&self) -> zbus::Result<u32>;
    fn recent_events(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Load the face models
    Init,
    /// Retry loading the face models after a failure
    Retry,
    /// Rebuild the recognition gallery from enrolled identities
    Rebuild,
    /// Enroll a photo for an identity
    Enroll {
        /// Stable identity id (e.g., student number)
        id: String,
        /// Image file containing exactly one face
        image: PathBuf,
        /// Name shown on overlays
        #[arg(short, long)]
        name: Option<String>,
        /// Record that the person consented to recognition
        #[arg(long)]
        consent: bool,
    },
    /// Start a session and begin tracking faces
    Start {
        /// Class, course or event the session is for
        context: String,
    },
    /// Stop tracking (the session stays open)
    Stop,
    /// List identities observed in the open session
    Observed,
    /// Commit the open session as attendance records
    Commit {
        /// Accept observations made by the simulated backend
        #[arg(long)]
        allow_simulated: bool,
    },
    /// Close the session without recording anything
    Discard,
    /// Show recent diagnostic events
    Events,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// Device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Save the captured frame as an image
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Test { device, output } = &cli.command {
        return camera_test(device, output.as_deref());
    }

    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Init => print_json(&proxy.initialize_model().await?)?,
        Commands::Retry => print_json(&proxy.retry_model().await?)?,
        Commands::Rebuild => {
            let size = proxy.rebuild_gallery().await?;
            println!("Gallery rebuilt: {size} identities");
        }
        Commands::Enroll { id, image, name, consent } => {
            let image = std::fs::canonicalize(&image)
                .with_context(|| format!("cannot read {}", image.display()))?;
            let name = name.unwrap_or_else(|| id.clone());
            proxy
                .enroll(&id, &name, consent, &image.to_string_lossy())
                .await?;
            println!("Enrolled {id} ({name})");
            if !consent {
                println!("Consent not given: {id} will not be recognized");
            }
        }
        Commands::Start { context } => {
            proxy.start_tracking(&context).await?;
            println!("Tracking started for {context}");
        }
        Commands::Stop => {
            if proxy.stop_tracking().await? {
                println!("Tracking stopped");
            } else {
                println!("Tracking was not running");
            }
        }
        Commands::Observed => print_json(&proxy.observed().await?)?,
        Commands::Commit { allow_simulated } => {
            let records: Vec<serde_json::Value> = serde_json::from_str(&proxy.commit(allow_simulated).await?)?;
            println!("Committed {} attendance record(s)", records.len());
            for r in &records {
                println!("  {}  {}", r["identity_id"].as_str().unwrap_or("?"), r["capture_method"].as_str().unwrap_or("?"));
            }
        }
        Commands::Discard => {
            let n = proxy.discard_session().await?;
            println!("Session discarded ({n} observation(s) dropped)");
        }
        Commands::Events => print_json(&proxy.recent_events().await?)?,
        Commands::Test { .. } => {}
    }

    Ok(())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn camera_test(device: &str, output: Option<&std::path::Path>) -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("{}  {} ({})", d.path, d.name, d.driver);
    }

    let camera = Camera::open(device)?;
    camera.warm_up(3);
    let frame = camera.capture_frame()?;
    println!(
        "Captured frame #{} {}x{}{}",
        frame.sequence,
        frame.width,
        frame.height,
        if frame.is_dark() { " (dark)" } else { "" }
    );

    if let Some(path) = output {
        let img = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        img.save(path)?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}
