//! `lab-acq-server`: serve a fake camera to acquisition clients.
//!
//! The server owns the camera and serves one client at a time over the
//! control pipe published under its coordination name. Press Enter or
//! Ctrl-C to stop it; a client can also terminate it remotely.
//!
//! # Usage
//!
//! ```bash
//! lab-acq-server Lab.Acq.Fake --config config/lab_acq.toml
//! LAB_ACQ_FAKE_CAMERA__INTER_FRAME_INTERVAL_MS=20 lab-acq-server --no-restart
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use acq_core::config::{AcqConfig, DEFAULT_CONFIG_PATH};
use acq_core::logging::init_tracing;
use acq_driver_mock::{fake_server, FakeCameraConfig, DEFAULT_COORDINATION_NAME};
use acq_ipc::{standalone_server_main, ServerOptions};
use acq_pool::CancelToken;

#[derive(Parser, Debug)]
#[command(name = "lab-acq-server")]
#[command(about = "Serve a fake camera to one acquisition client at a time", long_about = None)]
struct Cli {
    /// Coordination name clients connect with
    coordination_name: Option<String>,

    /// Configuration file (TOML); missing files fall back to defaults
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Directory for pipe endpoints, overriding `pipes.directory`
    #[arg(long)]
    pipe_dir: Option<PathBuf>,

    /// Exit once the first client disconnects
    #[arg(long)]
    no_restart: bool,
}

/// Everything resolved from the command line, file and environment.
#[derive(Debug)]
struct Launch {
    config: AcqConfig,
    camera: FakeCameraConfig,
    coordination_name: String,
}

fn resolve(cli: &Cli) -> Result<Launch> {
    let figment = AcqConfig::figment(&cli.config);
    let mut config: AcqConfig = figment
        .extract()
        .with_context(|| format!("reading configuration from {}", cli.config.display()))?;
    if let Some(dir) = &cli.pipe_dir {
        config.pipes.directory = Some(dir.clone());
    }
    if cli.no_restart {
        config.server.restart_on_disconnect = false;
    }
    config.validate()?;
    let camera = FakeCameraConfig::from_figment(&figment).context("reading fake_camera section")?;
    let coordination_name = cli
        .coordination_name
        .clone()
        .or_else(|| config.server.coordination_name.clone())
        .unwrap_or_else(|| DEFAULT_COORDINATION_NAME.to_string());
    Ok(Launch {
        config,
        camera,
        coordination_name,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let launch = resolve(&cli)?;
    init_tracing(&launch.config.logging).context("initialising logging")?;

    info!(
        coordination_name = %launch.coordination_name,
        config = %cli.config.display(),
        "starting fake camera server"
    );
    info!(
        width = launch.camera.width,
        height = launch.camera.height,
        bit_depth = launch.camera.bit_depth,
        interval_ms = launch.camera.inter_frame_interval_ms,
        "fake camera configured"
    );

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || {
        info!("interrupt received, shutting down");
        on_signal.cancel();
    })
    .context("installing Ctrl-C handler")?;

    let server = fake_server(ServerOptions::from_config(&launch.config), launch.camera);
    let exit = standalone_server_main(&server, &launch.coordination_name, &cancel)
        .context("session server failed")?;
    info!(?exit, "server stopped");
    Ok(())
}
