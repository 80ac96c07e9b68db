//! rust_sla command line.
//!
//! ```text
//! rust_sla status
//! rust_sla home
//! rust_sla print --images ./slices [--settings layers.csv]
//! rust_sla --simulate print --images ./slices
//! rust_sla show-config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing::{info, warn};

use rust_sla::config::{PrinterConfig, DEFAULT_CONFIG_PATH};
use rust_sla::hardware::light_engine::{power_off, power_on_and_wait, LightEngineStatus};
use rust_sla::hardware::mock::{MockSmc100, SimulatedLightEngine};
use rust_sla::hardware::{LightEngine, Smc100Controller, StageStatus};
use rust_sla::logging::{self, LogSink};
use rust_sla::print::{
    park_for_print, return_to_base, ExposureSettings, HeadlessSurface, LayerSettingsTable,
    SyncEngine,
};

/// Stage moves in the simulator take this many status polls.
const SIMULATED_MOVE_LATENCY: u32 = 2;
const SIMULATED_WARMUP_POLLS: u32 = 3;

#[derive(Parser)]
#[command(name = "rust_sla", version, about = "SLA printer stage and exposure control")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the simulated stage controller and light engine
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read position, motion parameters and state from the stage
    Status,
    /// Retract the stage and send it home
    Home,
    /// Park the stage and print a directory of layer images
    Print {
        /// Directory of layer images (defaults to print.image_dir)
        #[arg(long)]
        images: Option<PathBuf>,
        /// Per-layer settings CSV; enables a dynamic run
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Print the effective configuration
    ShowConfig,
}

async fn connect(config: &PrinterConfig, simulate: bool) -> Result<Smc100Controller> {
    if simulate {
        info!("using simulated stage controller");
        return Ok(MockSmc100::with_move_latency(SIMULATED_MOVE_LATENCY).controller());
    }
    Smc100Controller::open(&config.stage)
        .await
        .with_context(|| format!("Failed to open stage controller on '{}'", config.stage.port))
}

async fn status(config: &PrinterConfig, simulate: bool) -> Result<()> {
    let mut controller = connect(config, simulate).await?;

    let stage = StageStatus::query(&mut controller)
        .await
        .context("Failed to read stage status")?;
    let state = controller.get_current_status().await?;
    let last_error = controller.get_last_error().await?;

    println!("State:          {state}");
    println!("Position:       {:.4}", stage.position);
    println!("Velocity:       {:.4}", stage.velocity);
    println!("Acceleration:   {:.4}", stage.acceleration);
    println!(
        "Soft limits:    {:.4} .. {:.4}",
        stage.negative_limit, stage.positive_limit
    );
    println!("Last error:     {last_error}");

    if simulate {
        let mut light = SimulatedLightEngine::ready_after(0);
        light.power(true)?;
        let status = LightEngineStatus::query(&mut light)?;
        println!(
            "Light engine:   status {} ({}), {:.1} C",
            status.system_status,
            if status.is_ready() { "ready" } else { "not ready" },
            f64::from(status.temperature) / 10.0
        );
    }

    controller.close();
    Ok(())
}

async fn home(config: &PrinterConfig, simulate: bool) -> Result<()> {
    let mut controller = connect(config, simulate).await?;
    if !return_to_base(&mut controller, &config.bring_up).await? {
        warn!("stage did not fully converge while returning to base");
    }
    controller.home()?;
    controller.close();
    Ok(())
}

async fn print(
    config: &PrinterConfig,
    simulate: bool,
    images: Option<PathBuf>,
    settings: Option<PathBuf>,
) -> Result<()> {
    let Some(image_dir) = images.or_else(|| config.print.image_dir.clone()) else {
        bail!("No image directory given (use --images or print.image_dir)");
    };
    let table = settings
        .map(|path| {
            LayerSettingsTable::from_path(&path)
                .with_context(|| format!("Failed to load layer settings from {}", path.display()))
        })
        .transpose()?;

    let mut controller = connect(config, simulate).await?;
    if !park_for_print(&mut controller, &config.bring_up).await? {
        warn!("stage did not fully converge while parking");
    }

    let light = simulate.then(|| SimulatedLightEngine::ready_after(SIMULATED_WARMUP_POLLS));
    if let Some(light) = &light {
        let mut handle = light.clone();
        let warmup = power_on_and_wait(
            &mut handle,
            std::time::Duration::from_secs(config.light_engine.warmup_timeout_secs),
            std::time::Duration::from_millis(config.light_engine.status_poll_ms),
        )
        .await;
        if let Err(e) = warmup {
            controller.close();
            return Err(e).context("Light engine did not become ready");
        }
        if table.is_none() {
            handle.set_intensity(config.light_engine.intensity)?;
        }
    } else {
        warn!("no light engine driver attached; intensity changes are logged only");
    }

    let sink: LogSink = Arc::new(|message: &str| println!("{message}"));
    let surface = HeadlessSurface::new(config.print.frame_period());
    let mut engine = SyncEngine::new(
        Arc::new(Mutex::new(controller)),
        Box::new(surface),
        ExposureSettings::from_config(config),
    )
    .with_log_sink(sink);
    if let Some(light) = &light {
        engine = engine.with_light_engine(Box::new(light.clone()));
    }

    let abort = engine.abort_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.request();
        }
    });

    let result = match &table {
        Some(table) => engine.run_dynamic(&image_dir, table).await,
        None => engine.run_static(&image_dir).await,
    };

    if let Some(light) = &light {
        let mut handle = light.clone();
        if let Err(e) = power_off(&mut handle) {
            warn!(error = %e, "failed to power off light engine");
        }
    }

    let report = result.context("Print failed")?;
    println!(
        "{:?}: {} of {} images printed, {} stage moves",
        report.outcome,
        report.layers.len(),
        report.images_total,
        report.stage_moves
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PrinterConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    logging::init(&config.application)?;

    match cli.command {
        Command::Status => status(&config, cli.simulate).await,
        Command::Home => home(&config, cli.simulate).await,
        Command::Print { images, settings } => {
            print(&config, cli.simulate, images, settings).await
        }
        Command::ShowConfig => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
    }
}
