//! CLI entry point for tomoscan
//!
//! Provides command-line access to:
//! - the scan server, run against the simulated beamline
//! - a single simulated scan
//! - the motion planner and the camera readout tables
//!
//! # Usage
//!
//! ```bash
//! tomoscan simulate                  # serve control PVs until Ctrl+C
//! tomoscan simulate --scan           # run one scan and exit
//! tomoscan show-config               # effective configuration after overrides
//! tomoscan plan --start 0 --step 0.12 --num-angles 1500 --frame-time 0.01
//! tomoscan frame-time "Oryx ORX-10G-51S5M" Mono12Packed --exposure 0.001
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use tomoscan::camera::frame_time;
use tomoscan::dispatch::ScanServer;
use tomoscan::motion::{plan, MotionRequest};
use tomoscan::pso::PsoWindow;
use tomoscan::pv::sim::{SimBeamline, SimOptions};
use tomoscan::pv::Macros;
use tomoscan::scan::filename::confirm_for;
use tomoscan::{logging, ScanSequencer, TomoScanConfig};

#[derive(Parser)]
#[command(name = "tomoscan")]
#[command(about = "Tomography fly-scan coordinator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the control PVs of a simulated beamline
    Simulate {
        /// Site configuration file
        #[arg(long, default_value = "config/tomoscan.toml")]
        config: PathBuf,

        /// Run a single scan and exit
        #[arg(long)]
        scan: bool,
    },

    /// Print the effective configuration as TOML
    ShowConfig {
        /// Site configuration file
        #[arg(long, default_value = "config/tomoscan.toml")]
        config: PathBuf,
    },

    /// Print the motion plan and PSO window for a scan
    Plan {
        /// First angle, degrees
        #[arg(long, default_value_t = 0.0)]
        start: f64,
        /// Angular step, degrees
        #[arg(long, allow_hyphen_values = true)]
        step: f64,
        /// Number of projections
        #[arg(long)]
        num_angles: u32,
        /// Seconds between triggers
        #[arg(long)]
        frame_time: f64,
        /// Encoder counts per rotation
        #[arg(long, default_value_t = 11_840_158.0, allow_hyphen_values = true)]
        counts_per_rotation: f64,
        /// Motor acceleration time, seconds
        #[arg(long, default_value_t = 0.5)]
        accel_time: f64,
        /// Motor record DIR field (0 = Pos)
        #[arg(long, default_value_t = 0)]
        direction: i64,
    },

    /// Evaluate the camera readout tables
    FrameTime {
        /// Camera model as reported by Model_RBV
        model: String,
        /// Pixel format
        pixel_format: String,
        /// Video mode (Grasshopper3 23S6M only)
        #[arg(long, default_value = "")]
        video_mode: String,
        /// Exposure time, seconds
        #[arg(long)]
        exposure: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate { config, scan } => simulate(config, scan).await,
        Commands::ShowConfig { config } => {
            let config = TomoScanConfig::load_from(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Plan {
            start,
            step,
            num_angles,
            frame_time,
            counts_per_rotation,
            accel_time,
            direction,
        } => print_plan(MotionRequest {
            rotation_start: start,
            rotation_step: step,
            num_angles,
            frame_time,
            counts_per_rotation,
            accel_time,
            motor_direction: direction,
        }),
        Commands::FrameTime {
            model,
            pixel_format,
            video_mode,
            exposure,
        } => {
            let frame = frame_time(&model, &pixel_format, &video_mode, exposure)
                .context("no readout entry for this camera")?;
            println!("exposure {exposure:.6} s -> frame time {frame:.6} s");
            Ok(())
        }
    }
}

async fn simulate(config_path: PathBuf, single_scan: bool) -> Result<()> {
    let config = TomoScanConfig::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?
        .validated()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let macros = config
        .beamline
        .macros
        .iter()
        .fold(Macros::new(), |m, (name, value)| m.with(name, value));
    let sim = SimBeamline::build(SimOptions {
        camera_model: config.beamline.simulated_camera_model.clone(),
        macros,
        ..SimOptions::default()
    });
    let registry = sim
        .registry(config.timing.connect_timeout())
        .await
        .context("connecting to the simulated beamline")?;
    let data_dir = registry.get_string("FilePath").await?;
    std::fs::create_dir_all(&data_dir).with_context(|| format!("creating {data_dir}"))?;

    let sequencer = Arc::new(ScanSequencer::new(
        registry,
        config.timing.clone(),
        config.beamline.scan_kind,
    ));
    let confirm = confirm_for(config.beamline.overwrite_policy);

    if single_scan {
        let outcome = sequencer.run_scan(confirm).await?;
        println!(
            "scan {} ({}): {} after {} s",
            outcome.scan_id,
            outcome.started_at.format("%Y-%m-%d %H:%M:%S"),
            outcome.status,
            outcome.elapsed().num_seconds()
        );
        if let Some(error) = &outcome.error {
            println!("  ended by: {error}");
        }
        for record in &outcome.cleanup {
            println!("  {:?}: {:?}", record.step, record.outcome);
        }
        return Ok(());
    }

    let server = ScanServer::new(sequencer, confirm, config.timing.clone());
    info!(kind = ?config.beamline.scan_kind, "serving simulated beamline; Ctrl+C to stop");
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn print_plan(request: MotionRequest) -> Result<()> {
    let plan = plan(&request)?;
    let window = PsoWindow::for_plan(&plan);
    println!("{}", serde_json::to_string_pretty(&plan)?);
    println!(
        "PSO window: counts/step {} range [{}, {}] ({} counts)",
        window.counts_per_step,
        window.start,
        window.end,
        window.len()
    );
    if plan.was_quantized() {
        println!(
            "note: step {} quantized to {}",
            request.rotation_step, plan.rotation_step
        );
    }
    Ok(())
}
