use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.facewatch.Daemon1",
    default_service = "org.facewatch.Daemon1",
    default_path = "/org/facewatch/Daemon1"
)]
trait Facewatch {
    async fn start(&self, index: u32) -> zbus::Result<()>;
    async fn stop(&self, index: u32) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn metrics(&self, index: u32) -> zbus::Result<(f64, f64)>;
    async fn snapshot(&self, index: u32) -> zbus::Result<Vec<u8>>;
    async fn reload_known_faces(&self) -> zbus::Result<u32>;
}

#[derive(Parser)]
#[command(name = "facewatch", about = "facewatch camera daemon control")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status and cameras
    Status,
    /// Start a camera
    Start {
        /// Camera index from the config
        index: u32,
    },
    /// Stop a camera
    Stop {
        /// Camera index from the config
        index: u32,
    },
    /// Show capture latency and drop rate
    Metrics {
        /// Camera index from the config
        index: u32,
    },
    /// Save the latest annotated frame as JPEG
    Snapshot {
        /// Camera index from the config
        index: u32,
        /// Output file
        #[arg(short, long, default_value = "snapshot.jpg")]
        output: PathBuf,
    },
    /// Reload known faces
    Reload,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = FacewatchProxy::new(&conn).await?;

    match cli.command {
        Commands::Status => {
            let status = proxy.status().await.context("facewatchd not reachable")?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Start { index } => {
            proxy.start(index).await?;
            println!("camera {index} started");
        }
        Commands::Stop { index } => {
            if proxy.stop(index).await? {
                println!("camera {index} stopped");
            } else {
                println!("camera {index} was not running");
            }
        }
        Commands::Metrics { index } => {
            let (latency_ms, drop_pct) = proxy.metrics(index).await?;
            println!("latency: {latency_ms:.1} ms");
            println!("dropped: {drop_pct:.1} %");
        }
        Commands::Snapshot { index, output } => {
            let jpeg = proxy.snapshot(index).await?;
            std::fs::write(&output, &jpeg).with_context(|| format!("failed to write {}", output.display()))?;
            println!("wrote {} ({} bytes)", output.display(), jpeg.len());
        }
        Commands::Reload => {
            let count = proxy.reload_known_faces().await?;
            println!("{count} known faces loaded");
        }
    }

    Ok(())
}
