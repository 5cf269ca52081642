use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use depthlink_core::{
    shading, CpuTextureSink, DeviceSession, FramePresenter, OutputMode, SessionState,
    SlotOutcome, TextureSlot, UnavailableDriver, FRAGMENT_SHADER,
};
use depthlink_hw::synthetic::{AlwaysPresent, SyntheticDriver};
use depthlink_hw::{usb, PresenceProbe, SensorDriver, SysfsProbe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "depthlink", about = "Kinect v2 device session tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a Kinect v2 is attached
    Probe,
    /// Run the device session and report frame rates
    Watch {
        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
        /// Use the synthetic frame source instead of hardware
        #[arg(long)]
        synthetic: bool,
    },
    /// Capture one composited frame to a PNG file
    Snapshot {
        /// Output image path
        path: PathBuf,
        /// combined, color or depth (default: DEPTHLINK_OUTPUT or combined)
        #[arg(short, long)]
        output: Option<String>,
        /// Give up if no frames arrive within this many seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
        /// Use the synthetic frame source instead of hardware
        #[arg(long)]
        synthetic: bool,
    },
    /// Print default shader uniforms and the fragment shader
    Uniforms,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Probe => probe(&config),
        Commands::Watch { seconds, synthetic } => watch(&config, seconds, synthetic).await,
        Commands::Snapshot {
            path,
            output,
            timeout_secs,
            synthetic,
        } => {
            let mode = output
                .as_deref()
                .map(OutputMode::from_option)
                .unwrap_or(config.output);
            snapshot(&config, &path, mode, timeout_secs, synthetic).await
        }
        Commands::Uniforms => {
            println!("{}", serde_json::to_string_pretty(&config.uniforms())?);
            println!();
            print!("{FRAGMENT_SHADER}");
            Ok(())
        }
    }
}

fn probe(config: &Config) -> Result<()> {
    let session = config.session_config();
    let probe = SysfsProbe::new(&config.sysfs_root, session.vendor_id, session.product_id);
    let devices = usb::list_usb_devices(&config.sysfs_root);
    tracing::debug!(count = devices.len(), root = %config.sysfs_root.display(), "scanned usb devices");

    let matching = probe.matching_devices();
    if matching.is_empty() {
        println!(
            "No Kinect v2 ({:04x}:{:04x}) attached",
            session.vendor_id, session.product_id
        );
    } else {
        for device in &matching {
            println!(
                "Kinect v2 at {} ({:04x}:{:04x})",
                device.name, device.vendor_id, device.product_id
            );
        }
    }
    println!("present: {}", probe.is_present());
    Ok(())
}

/// Build and start the process-wide session for the selected backend.
fn open_session(config: &Config, synthetic: bool) -> Result<Arc<DeviceSession>> {
    let session_config = config.session_config();
    let (driver, probe): (Arc<dyn SensorDriver>, Arc<dyn PresenceProbe>) = if synthetic {
        let calibration = config.calibration()?;
        (
            Arc::new(SyntheticDriver::default().with_calibration(&calibration)),
            Arc::new(AlwaysPresent),
        )
    } else {
        (
            Arc::new(UnavailableDriver),
            Arc::new(SysfsProbe::new(
                &config.sysfs_root,
                session_config.vendor_id,
                session_config.product_id,
            )),
        )
    };
    Ok(DeviceSession::init_shared(move || {
        DeviceSession::new(session_config, driver, probe)
    }))
}

async fn shutdown(session: Arc<DeviceSession>) -> Result<()> {
    tokio::task::spawn_blocking(move || session.shutdown())
        .await
        .context("session shutdown task failed")
}

async fn watch(config: &Config, seconds: Option<u64>, synthetic: bool) -> Result<()> {
    let session = open_session(config, synthetic)?;
    let deadline = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last_state = session.state();
    let mut last = session.stats();
    println!("state: {last_state:?}");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let state = session.state();
                if state != last_state {
                    println!("state: {state:?}");
                    last_state = state;
                }
                let stats = session.stats();
                if state == SessionState::Connected {
                    // Counters reset on reconnect.
                    let color = stats.color_frames.saturating_sub(last.color_frames);
                    let depth = stats.depth_frames.saturating_sub(last.depth_frames);
                    println!("color {color} fps, depth {depth} fps");
                }
                last = stats;
            }
            _ = &mut deadline => break,
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    tracing::info!(connections = session.stats().connections, "stopping watch");
    shutdown(session).await
}

async fn snapshot(
    config: &Config,
    path: &Path,
    mode: OutputMode,
    timeout_secs: u64,
    synthetic: bool,
) -> Result<()> {
    let session = open_session(config, synthetic)?;
    let mut presenter = FramePresenter::new(config.uniforms());
    let mut textures = CpuTextureSink::default();

    let wait = async {
        loop {
            let outcome = presenter.render(&session, mode, &mut textures)?;
            let ready = match mode {
                OutputMode::Color => outcome.color != SlotOutcome::Empty,
                OutputMode::Depth => outcome.depth != SlotOutcome::Empty,
                OutputMode::Combined => {
                    outcome.color != SlotOutcome::Empty && outcome.depth != SlotOutcome::Empty
                }
            };
            if ready {
                return Ok::<_, anyhow::Error>(outcome);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    let outcome = match tokio::time::timeout(Duration::from_secs(timeout_secs), wait).await {
        Ok(outcome) => outcome,
        Err(_) => {
            let state = session.state();
            shutdown(session).await?;
            bail!("no frames within {timeout_secs}s (session {state:?})");
        }
    };
    shutdown(session).await?;
    let outcome = outcome?;

    let slot = match mode {
        OutputMode::Color => TextureSlot::Color,
        OutputMode::Depth | OutputMode::Combined => TextureSlot::Depth,
    };
    let desc = textures
        .texture(slot)
        .map(|t| t.desc)
        .context("no texture after render")?;

    let image = shading::render_image(&textures, &outcome.uniforms, desc.width, desc.height);
    image
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;

    println!(
        "Wrote {}x{} {} snapshot to {}",
        desc.width,
        desc.height,
        mode.as_str(),
        path.display()
    );
    Ok(())
}
