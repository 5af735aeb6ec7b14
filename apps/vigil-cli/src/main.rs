use std::{env, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use vigil_alerts::channels_from_config;
use vigil_capture::{FfmpegSource, FrameSource, SyntheticSource};
use vigil_network::LiveView;
use vigil_ops::{
    change_status, ensure_dir, init_tracing, EventLog, FileStatusStore, JsonlEventLog,
    StatusStore,
};
use vigil_orchestrator::{Collaborators, Monitor};
use vigil_types::{config::VigilConfig, status::SystemStatus};
use vigil_vision::{build_face_analyzer, DirectoryFaceStore};

const DEFAULT_CONFIG_PATH: &str = "configs/vigil.toml";

#[derive(Parser)]
#[command(name = "vigil", about = "Camera perimeter monitor with intruder alerts")]
struct Cli {
    /// Config file; defaults to $VIGIL_CONFIG, then configs/vigil.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start monitoring and serve the live view.
    Run {
        /// Use the built-in test pattern instead of a camera.
        #[arg(long)]
        synthetic: bool,
    },
    /// Arm the system.
    Arm,
    /// Disarm the system.
    Disarm,
    /// Print the most recent security events.
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    init_tracing(&config.ops)?;

    let status = FileStatusStore::new(&config.storage.status_path);
    let events = JsonlEventLog::new(&config.storage.event_log_path);

    match cli.command {
        Command::Run { synthetic } => run(config, status, events, synthetic).await,
        Command::Arm => {
            change_status(&status, &events, SystemStatus::Armed, "command line").await?;
            println!("System ARMED");
            Ok(())
        }
        Command::Disarm => {
            change_status(&status, &events, SystemStatus::Disarmed, "command line").await?;
            println!("System DISARMED");
            Ok(())
        }
        Command::Events { limit } => {
            println!("Current status: {}", status.get_status().await?);
            for event in events.latest(limit).await? {
                println!(
                    "{}  {:<17} {}{}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.kind.as_str(),
                    event.details.as_deref().unwrap_or(""),
                    event
                        .image_path
                        .map(|path| format!(" [{}]", path.display()))
                        .unwrap_or_default(),
                );
            }
            Ok(())
        }
    }
}

async fn run(
    config: VigilConfig,
    status: FileStatusStore,
    events: JsonlEventLog,
    synthetic: bool,
) -> Result<()> {
    ensure_dir(&config.storage.intruder_dir)?;

    let source: Box<dyn FrameSource> = if synthetic {
        Box::new(SyntheticSource::new(config.camera.width, config.camera.height))
    } else {
        Box::new(FfmpegSource::new(config.camera.clone()))
    };
    let analyzer =
        build_face_analyzer(&config.faces).context("failed to load face recognition models")?;

    let monitor = Monitor::new(
        config.clone(),
        source,
        analyzer,
        Collaborators {
            status: Arc::new(status),
            events: Arc::new(events),
        },
        channels_from_config(&config.alerts),
    );
    let cancel = monitor.cancel_token();
    let view = LiveView::new(
        monitor.shared(),
        config.detection.scale,
        config.stream.clone(),
        cancel.clone(),
    );

    let faces = DirectoryFaceStore::new(&config.detection.known_faces_dir);
    let handle = monitor
        .start(&faces)
        .await
        .context("failed to start monitor")?;

    let server = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let served = vigil_network::serve(view).await;
            if served.is_err() {
                cancel.cancel();
            }
            served
        }
    });
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        cancel.cancel();
    });

    let report = handle.join().await?;
    match server.await {
        Ok(Err(err)) => error!(error = %err, "Live view server failed"),
        Err(err) => error!(error = %err, "Live view task failed"),
        Ok(Ok(())) => {}
    }
    info!(
        exit = ?report.exit,
        frames = report.metrics.frames_captured,
        reconnects = report.metrics.reconnects,
        "Vigil stopped"
    );
    Ok(())
}

fn load_config(explicit: Option<PathBuf>) -> Result<VigilConfig> {
    let from_env = env::var("VIGIL_CONFIG").ok().map(PathBuf::from);
    let path = explicit
        .or(from_env)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = match VigilConfig::from_file(&path) {
        Ok(config) => match config.validate() {
            Ok(()) => config,
            Err(err) => {
                eprintln!(
                    "Invalid config in '{}': {err}. Falling back to internal defaults.",
                    path.display()
                );
                VigilConfig::default()
            }
        },
        Err(err) => {
            eprintln!(
                "Failed to load config from '{}': {err}. Falling back to internal defaults.",
                path.display()
            );
            VigilConfig::default()
        }
    };
    config.apply_env_overrides()?;
    config
        .validate()
        .context("invalid configuration after applying environment overrides")?;
    Ok(config)
}
