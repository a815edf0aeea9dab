//! Indicam - CCD camera control front end
//!
//! Drives a camera controller against the simulated property server:
//! - Lists known camera models
//! - Reports camera status
//! - Takes exposures and writes the FITS result

mod config;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use indicam_bus::SimulatedBus;
use indicam_camera::{CameraController, ExposureOutcome, ExposureRequest};
use indicam_core::{CapabilityProfile, Support};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "indicam.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Camera model, overriding the configuration file
    #[arg(short, long)]
    model: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List camera models from the profile index and the built-in set
    Models,
    /// Print connection, cooling, readout and filter state
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Take one exposure and save the image
    Expose {
        /// Exposure time in seconds
        #[arg(short, long)]
        duration: f64,
        #[arg(short, long, default_value = "Light")]
        frame_type: String,
        /// Output FITS file, timestamped in the working directory by default
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write a default configuration file
    InitConfig {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Snapshot of camera state; unsupported fields are left out
#[derive(Debug, Default, Serialize)]
struct StatusReport {
    model: String,
    camera: String,
    device: String,
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cooler_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cooler_power: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fan_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    binning: Option<[u32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame: Option<[i64; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filters: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gain: Option<f64>,
    ccd_info: BTreeMap<String, f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Indicam v{}", env!("CARGO_PKG_VERSION"));

    if let Command::InitConfig { force } = args.command {
        if args.config.exists() && !force {
            bail!(
                "{} already exists, pass --force to replace it",
                args.config.display()
            );
        }
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Wrote default configuration");
        return Ok(());
    }

    let mut config = config::load_config(&args.config)?;
    if let Some(model) = args.model {
        config.camera.model = model;
    }

    match args.command {
        Command::Models => {
            let index = config.profile_index()?;
            for model in index.models() {
                let profile = index.resolve(&model)?;
                println!(
                    "{:<10} {:<16} {}",
                    profile.model, profile.driver, profile.camera_name
                );
            }
        }
        Command::Status { json } => {
            let profile = config.profile()?;
            let controller = open_controller(&config, profile).await?;
            let report = status(&controller).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_status(&report);
            }
        }
        Command::Expose {
            duration,
            frame_type,
            output,
        } => {
            let profile = config.profile()?;
            let mut controller = open_controller(&config, profile).await?;
            let request = ExposureRequest::new(duration, &frame_type);

            match controller.expose(&request).await? {
                ExposureOutcome::Image { image, applied } => {
                    let path = output.unwrap_or_else(default_output);
                    image.write_to(&path)?;
                    info!(
                        path = %path.display(),
                        bytes = image.data.len(),
                        defaults = ?applied,
                        "Saved image"
                    );
                }
                ExposureOutcome::TimedOut => bail!("no image received before the deadline"),
                ExposureOutcome::ServerError(text) => bail!("server error: {}", text),
                ExposureOutcome::Aborted => warn!("Exposure aborted"),
            }
        }
        Command::InitConfig { .. } => {}
    }

    Ok(())
}

async fn open_controller(
    config: &config::Config,
    profile: CapabilityProfile,
) -> Result<CameraController<SimulatedBus>> {
    let bus = SimulatedBus::ccd(&profile.driver);
    let mut controller =
        CameraController::new(bus, profile)?.with_config(config.to_controller_config()?);
    controller
        .open(&config.server.host, config.server.port)
        .await?;
    Ok(controller)
}

async fn status(controller: &CameraController<SimulatedBus>) -> Result<StatusReport> {
    let profile = controller.profile();
    let mut report = StatusReport {
        model: profile.model.clone(),
        camera: profile.camera_name.clone(),
        device: profile.driver.clone(),
        connected: controller.is_connected().await?,
        ..StatusReport::default()
    };

    report.temperature = controller.temperature().await?.supported();
    report.cooler_on = controller.cooler().await?.supported();
    report.cooler_power = controller.cooler_power().await?.supported();
    report.fan_on = controller.fan().await?.supported();
    report.binning = controller.binning().await?.map(|b| [b.x, b.y]).supported();
    report.frame = controller
        .frame()
        .await?
        .map(|f| [f.x, f.y, f.width, f.height])
        .supported();
    report.filters = controller.filters().await?.supported();
    report.filter = controller.filter().await?.supported().flatten();
    report.gain = controller.gain().await?.supported();
    if let Support::Supported(info) = controller.ccd_info().await? {
        report.ccd_info = info;
    }
    Ok(report)
}

fn print_status(report: &StatusReport) {
    println!("{} ({}) on {}", report.camera, report.model, report.device);
    println!("  connected:    {}", report.connected);
    if let Some(t) = report.temperature {
        println!("  temperature:  {:.2} C", t);
    }
    if let Some(on) = report.cooler_on {
        println!("  cooler:       {}", if on { "on" } else { "off" });
    }
    if let Some(p) = report.cooler_power {
        println!("  cooler power: {:.1}%", p);
    }
    if let Some(on) = report.fan_on {
        println!("  fan:          {}", if on { "on" } else { "off" });
    }
    if let Some([x, y]) = report.binning {
        println!("  binning:      {}x{}", x, y);
    }
    if let Some([x, y, w, h]) = report.frame {
        println!("  frame:        {}x{} at ({}, {})", w, h, x, y);
    }
    if let Some(filters) = &report.filters {
        println!(
            "  filter:       {} of [{}]",
            report.filter.as_deref().unwrap_or("?"),
            filters.join(", ")
        );
    }
    if let Some(g) = report.gain {
        println!("  gain:         {}", g);
    }
    for (name, value) in &report.ccd_info {
        println!("  {:<13} {}", format!("{}:", name), value);
    }
}

fn default_output() -> PathBuf {
    PathBuf::from(format!(
        "indicam-{}.fits",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ))
}
