//! radioclone: read and write radio memory images over clone mode
//!
//! Reads a radio's memory into a file, or writes a file back to the radio,
//! using the per-model definitions in `<configdir>/radios`.

mod report;
mod serial_io;
mod settings;

use anyhow::{Context, Result};
use clap::Parser;
use clone_protocol::{split_image, ProfileRegistry, SessionConfig, SessionEngine};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use report::TransferReport;
use serial_io::{PortBuffer, SerialLink};
use settings::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    debug!("radioclone {}", env!("CARGO_PKG_VERSION"));

    let registry = ProfileRegistry::from_config_dir(&cli.configdir).with_context(|| {
        format!(
            "failed to load radio definitions from {}",
            cli.configdir.display()
        )
    })?;
    debug!("Loaded {} radio definitions", registry.len());

    let config = cli.session_config();
    if cli.write {
        write_radio(&cli, &registry, config).await
    } else {
        read_radio(&cli, registry, config).await
    }
}

async fn read_radio(cli: &Cli, registry: ProfileRegistry, mut config: SessionConfig) -> Result<()> {
    let mut link = SerialLink::open(&cli.port, cli.baud)?;
    if config.recv_echo.is_none() {
        config.detected_echo = Some(link.probe_echo().await?);
    }

    println!("Start transmission from the radio");
    let mut engine = SessionEngine::new_read(registry, config, link.into_port());
    serial_io::drive(&mut engine, cli.hash).await?;

    let saved = engine.error().is_none() || cli.ignerr;
    if saved {
        let image = engine.image();
        std::fs::write(&cli.file, &image)
            .with_context(|| format!("failed to write {}", cli.file.display()))?;
        info!("Saved {} bytes to {}", image.len(), cli.file.display());
    }
    conclude(cli, &engine, saved)
}

async fn write_radio(cli: &Cli, registry: &ProfileRegistry, mut config: SessionConfig) -> Result<()> {
    let image = std::fs::read(&cli.file)
        .with_context(|| format!("unable to open infile {}", cli.file.display()))?;
    let split = split_image(registry, &config, &image)
        .with_context(|| format!("{} is not a usable image", cli.file.display()))?;
    info!("Found a {}", split.profile.name);

    let mut link = SerialLink::open(&cli.port, cli.baud)?;
    if config.recv_echo.is_none() && split.profile.recv_echo.is_none() {
        config.detected_echo = Some(link.probe_echo().await?);
    }

    println!("Put the radio in rx mode and press enter");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("reading from stdin")?;

    let mut engine = SessionEngine::new_write(split, config, link.into_port());
    serial_io::drive(&mut engine, cli.hash).await?;
    conclude(cli, &engine, false)
}

/// Print the summary, write the report, and turn a session failure into
/// the process result
fn conclude(cli: &Cli, engine: &SessionEngine<PortBuffer>, saved: bool) -> Result<()> {
    println!("Transferred {} characters", engine.bytes_transferred());

    if let Some(path) = &cli.report {
        TransferReport::from_engine(engine, saved).write_to(path)?;
    }

    match engine.error() {
        Some(err) => {
            if saved {
                warn!("Transfer failed; partial image saved to {}", cli.file.display());
            }
            Err(anyhow::Error::new(err.clone()).context("clone transfer failed"))
        }
        None => Ok(()),
    }
}
