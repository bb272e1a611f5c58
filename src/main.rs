mod capture;
mod config;
mod controller;
mod controls;
mod error;
mod inference;
mod output;
mod provider;
mod render;
mod scheduler;
mod viewport;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use config::{DetectorConfig, DeviceClass, ModelPaths, OverlaySettings, PoseConfig, SegmenterConfig};
use controller::{AppContext, ControlEvent, ModeController};
use error::CAMERA_DISCLOSURE;
use inference::{Mode, OnnxBackend};
use provider::ModelProvider;
use render::{Canvas, ColorAssignment, Stage};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StartMode {
    Detect,
    Segment,
}

impl From<StartMode> for Mode {
    fn from(mode: StartMode) -> Self {
        match mode {
            StartMode::Detect => Mode::Detection,
            StartMode::Segment => Mode::Segmentation,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    /// If not provided, frames are rendered without being shown anywhere
    #[arg(short, long)]
    output_device: Option<String>,

    /// Output resolution width (defaults to the camera's)
    #[arg(long)]
    output_width: Option<u32>,

    /// Output resolution height (defaults to the camera's)
    #[arg(long)]
    output_height: Option<u32>,

    /// Directory holding the ONNX models
    #[arg(long, default_value = "models")]
    model_dir: PathBuf,

    /// Object detection model, overriding the file in --model-dir
    #[arg(long)]
    detector_model: Option<PathBuf>,

    /// Body part segmentation model, overriding the file in --model-dir
    #[arg(long)]
    segmenter_model: Option<PathBuf>,

    /// Pose estimation model, overriding the file in --model-dir
    #[arg(long)]
    pose_model: Option<PathBuf>,

    /// Hardware profile; selects network size and single or multi person decoding
    #[arg(long, value_enum, default_value_t = DeviceClass::Desktop)]
    device_class: DeviceClass,

    /// Mode to start in
    #[arg(long, value_enum, default_value_t = StartMode::Detect)]
    mode: StartMode,

    /// Draw pose skeletons over the segmentation mask
    #[arg(long)]
    skeleton: bool,

    /// Width of the hosting display area; below 680 the overlay shrinks to fit
    #[arg(long, default_value_t = 1280)]
    container_width: u32,

    /// Frame loop rate
    #[arg(long, default_value_t = 60)]
    refresh_hz: u32,

    /// TTF/OTF font for labels; a system font is used if omitted
    #[arg(long)]
    font: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("Edge overlay starting");
    tracing::info!("Device class: {:?}", args.device_class);
    tracing::info!("Refresh rate: {} Hz", args.refresh_hz);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(run(args));

    // stdin reads block a worker thread; do not wait for them
    runtime.shutdown_timeout(Duration::from_millis(250));
    result
}

async fn run(args: Args) -> Result<()> {
    let stream = match capture::acquire(args.input_device).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!("{}", CAMERA_DISCLOSURE);
            return Err(err).context("Failed to acquire camera");
        }
    };
    let (camera_width, camera_height) = stream.resolution();

    let font = match &args.font {
        Some(path) => Some(Canvas::load_font(path)?),
        None => Canvas::find_system_font(),
    };

    let sink = output::open_sink(
        args.output_device.as_deref(),
        args.output_width.unwrap_or(camera_width),
        args.output_height.unwrap_or(camera_height),
    )?;

    let stage = Stage::new(
        Box::new(Canvas::new(camera_width, camera_height, font)),
        ColorAssignment::new(),
        sink,
    )
    .shared();

    let paths = ModelPaths {
        model_dir: args.model_dir.clone(),
        detector: args.detector_model.clone(),
        segmenter: args.segmenter_model.clone(),
        pose: args.pose_model.clone(),
    };
    let segmenter_config = SegmenterConfig::for_device(args.device_class);
    tracing::info!("Detection model: {}", paths.detector_path().display());
    tracing::info!(
        "Segmentation model: {}",
        paths.segmenter_path(&segmenter_config).display()
    );
    let backend = OnnxBackend::new(
        paths,
        DetectorConfig::default(),
        segmenter_config,
        PoseConfig::default(),
    );
    let provider = ModelProvider::new(Arc::new(backend));
    let preload = provider.spawn_preload();

    let settings = OverlaySettings {
        refresh_hz: args.refresh_hz,
        ..OverlaySettings::default()
    };
    let ctx = AppContext::new(
        settings,
        args.device_class,
        provider,
        stage,
        args.container_width,
        args.skeleton,
    );
    let controller = ModeController::new(ctx, args.mode.into()).spawn();
    controller.send(ControlEvent::StreamAcquired(stream)).await?;

    let controls = controls::spawn_stdin_controls(controller.sender());

    tracing::info!("Press Ctrl+C to stop");
    let mut status = controller.subscribe();
    let stopped = async move { while status.changed().await.is_ok() {} };
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            tracing::info!("Interrupted");
            let _ = controller.send(ControlEvent::Shutdown).await;
        }
        _ = stopped => {}
    }

    controls.abort();
    preload.abort();
    controller.join().await?;
    tracing::info!("Edge overlay stopped");
    Ok(())
}
