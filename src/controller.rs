//! Mode state machine.
//!
//! The controller owns the frame scheduler and is the only place loops are
//! started or cancelled. It runs as a single task that consumes
//! [`ControlEvent`]s and model-readiness notifications in order, so a mode
//! switch is always fully applied (old loop cancelled, surface cleared)
//! before the next event is looked at.

use crate::capture::StreamHandle;
use crate::config::{DeviceClass, OverlaySettings};
use crate::error::ModelLoadError;
use crate::inference::{Mode, SegmentationFrame};
use crate::provider::{ModelHandle, ModelProvider, SharedDetector, SharedSegmenter};
use crate::render::{
    render_detections, render_segmentation, DetectionStyle, SharedStage, SkeletonStyle, Stage,
    VideoLayer,
};
use crate::scheduler::{FrameLoopHandle, FrameScheduler, FrameTask, FrameTick, NextFrame};
use crate::viewport::{scale_factors, ViewportDimensions, ViewportGeometry, DEFAULT_ASPECT_RATIO};
use anyhow::{Context, Result};
use image::{imageops, RgbImage};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Frames between timing reports.
const STATS_EVERY: u64 = 30;

/// Everything the controller and its frame loops share for the session.
pub struct AppContext {
    pub settings: OverlaySettings,
    pub device: DeviceClass,
    pub geometry: ViewportGeometry,
    pub provider: ModelProvider,
    pub stage: SharedStage,
    pub draw_skeleton: Arc<AtomicBool>,
    pub container_width: u32,
    pub stream: Option<StreamHandle>,
    pub viewport: ViewportDimensions,
}

impl AppContext {
    pub fn new(
        settings: OverlaySettings,
        device: DeviceClass,
        provider: ModelProvider,
        stage: SharedStage,
        container_width: u32,
        draw_skeleton: bool,
    ) -> Self {
        let geometry = ViewportGeometry::new(settings.narrow_threshold, settings.narrow_margin);
        let viewport = geometry.compute(container_width, DEFAULT_ASPECT_RATIO, None);
        Self {
            settings,
            device,
            geometry,
            provider,
            stage,
            draw_skeleton: Arc::new(AtomicBool::new(draw_skeleton)),
            container_width,
            stream: None,
            viewport,
        }
    }

    /// Recomputes the viewport from the container width and stream
    /// metadata, then resizes (and clears) the canvas to match.
    fn refresh_viewport(&mut self) -> ViewportDimensions {
        let aspect_ratio = self
            .stream
            .as_ref()
            .map_or(DEFAULT_ASPECT_RATIO, StreamHandle::aspect_ratio);
        let source = self.stream.as_ref().map(StreamHandle::resolution);
        self.viewport = self
            .geometry
            .compute(self.container_width, aspect_ratio, source);

        let (width, height) = self.viewport.canvas_size();
        Stage::lock(&self.stage).resize(width, height);
        tracing::info!(
            "Viewport {}x{} (container {}px, {})",
            width,
            height,
            self.container_width,
            if self.geometry.is_narrow(self.container_width) {
                "narrow"
            } else {
                "wide"
            }
        );
        self.viewport
    }
}

/// Input to the controller. Everything that changes what is drawn goes
/// through here.
#[derive(Debug)]
pub enum ControlEvent {
    StreamAcquired(StreamHandle),
    SelectMode(Mode),
    Resize { container_width: u32 },
    OrientationChanged { container_width: u32 },
    SetSkeleton(bool),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingModel(Mode),
    Running(Mode),
}

/// Published after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub phase: Phase,
    pub selected: Mode,
    /// Readiness polls issued while awaiting a model that has not been
    /// requested yet.
    pub readiness_checks: u64,
    /// `AwaitingModel -> Running` transitions.
    pub running_entries: u64,
    pub active_loop: Option<u64>,
    pub last_error: Option<String>,
}

enum ControllerState {
    Idle,
    AwaitingModel(Mode),
    Running {
        mode: Mode,
        handle: FrameLoopHandle,
        model: ModelHandle,
    },
}

struct ModelReady {
    generation: u64,
    mode: Mode,
    result: Result<ModelHandle, ModelLoadError>,
}

pub struct ModeController {
    ctx: AppContext,
    scheduler: FrameScheduler,
    state: ControllerState,
    selected: Mode,
    /// Bumped on every `AwaitingModel` entry; readiness results carrying an
    /// older value are stale.
    generation: u64,
    readiness: Option<JoinHandle<()>>,
    ready_tx: mpsc::UnboundedSender<ModelReady>,
    ready_rx: mpsc::UnboundedReceiver<ModelReady>,
    status: Arc<watch::Sender<ControllerStatus>>,
}

/// Client side of a spawned controller.
pub struct ControllerHandle {
    events: mpsc::Sender<ControlEvent>,
    status: watch::Receiver<ControllerStatus>,
    running_loops: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn sender(&self) -> mpsc::Sender<ControlEvent> {
        self.events.clone()
    }

    pub async fn send(&self, event: ControlEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .context("Controller has stopped")
    }

    #[cfg(test)]
    pub fn status(&self) -> ControllerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status.clone()
    }

    /// Frame loop tasks still alive, including cancelled ones finishing
    /// their last frame.
    #[cfg(test)]
    pub fn running_loops(&self) -> usize {
        self.running_loops.load(Ordering::SeqCst)
    }

    /// Waits for the controller task to exit; send [`ControlEvent::Shutdown`]
    /// first (or drop every sender).
    pub async fn join(self) -> Result<()> {
        drop(self.events);
        self.task.await.context("Controller task panicked")?;
        tracing::debug!(
            "Controller stopped; {} frame loops still finishing",
            self.running_loops.load(Ordering::SeqCst)
        );
        Ok(())
    }
}

impl ModeController {
    pub fn new(ctx: AppContext, initial_mode: Mode) -> Self {
        let scheduler = FrameScheduler::new(ctx.settings.frame_interval());
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ControllerStatus {
            phase: Phase::Idle,
            selected: initial_mode,
            readiness_checks: 0,
            running_entries: 0,
            active_loop: None,
            last_error: None,
        });
        Self {
            ctx,
            scheduler,
            state: ControllerState::Idle,
            selected: initial_mode,
            generation: 0,
            readiness: None,
            ready_tx,
            ready_rx,
            status: Arc::new(status),
        }
    }

    pub fn spawn(self) -> ControllerHandle {
        let (events, rx) = mpsc::channel(32);
        let status = self.status.subscribe();
        let running_loops = self.scheduler.running_counter();
        let task = tokio::spawn(self.run(rx));
        ControllerHandle {
            events,
            status,
            running_loops,
            task,
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<ControlEvent>) {
        tracing::info!("Controller started in {} mode", self.selected);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ControlEvent::Shutdown) | None => break,
                    Some(event) => self.handle_event(event),
                },
                Some(ready) = self.ready_rx.recv() => self.on_model_ready(ready),
            }
        }
        self.shutdown();
    }

    fn handle_event(&mut self, event: ControlEvent) {
        tracing::debug!("Control event: {:?}", event);
        match event {
            ControlEvent::StreamAcquired(stream) => {
                tracing::info!(
                    "Camera stream ready at {}x{}",
                    stream.resolution().0,
                    stream.resolution().1
                );
                self.ctx.stream = Some(stream);
                self.ctx.refresh_viewport();
                self.leave_current();
                self.await_model(self.selected);
            }
            ControlEvent::SelectMode(mode) => {
                self.selected = mode;
                if self.ctx.stream.is_none() {
                    tracing::info!("No camera stream yet; {} mode starts once it arrives", mode);
                    self.publish();
                    return;
                }
                tracing::info!("Switching to {} mode", mode);
                self.leave_current();
                self.await_model(mode);
            }
            ControlEvent::Resize { container_width } => {
                self.ctx.container_width = container_width;
                self.ctx.refresh_viewport();
                if self.ctx.device.restarts_on_resize() {
                    self.restart_loop();
                } else {
                    tracing::debug!("Keeping the running loop after resize on {:?}", self.ctx.device);
                }
            }
            ControlEvent::OrientationChanged { container_width } => {
                self.ctx.container_width = container_width;
                self.ctx.refresh_viewport();
                self.restart_loop();
            }
            ControlEvent::SetSkeleton(enabled) => {
                tracing::info!("Skeleton overlay {}", if enabled { "on" } else { "off" });
                self.ctx.draw_skeleton.store(enabled, Ordering::SeqCst);
            }
            ControlEvent::Shutdown => {}
        }
    }

    /// Cancels the running loop or pending readiness check and clears the
    /// surface so nothing from the outgoing mode stays visible.
    fn leave_current(&mut self) {
        if let Some(readiness) = self.readiness.take() {
            readiness.abort();
        }
        if let ControllerState::Running { handle, mode, .. } = &self.state {
            tracing::debug!("Cancelling {} loop {}", mode, handle.id());
            self.scheduler.cancel(handle);
        }
        Stage::lock(&self.ctx.stage).clear();
        self.state = ControllerState::Idle;
    }

    fn await_model(&mut self, mode: Mode) {
        self.generation += 1;
        self.state = ControllerState::AwaitingModel(mode);
        self.readiness = Some(self.spawn_readiness(mode, self.generation));
        tracing::info!("Waiting for {} model", mode);
        self.publish();
    }

    /// Resolves the model for `mode` and reports back through `ready_tx`.
    /// Segmentation is requested by the startup preload chain, so until the
    /// chain has registered it the check is repeated every poll interval.
    fn spawn_readiness(&self, mode: Mode, generation: u64) -> JoinHandle<()> {
        let provider = self.ctx.provider.clone();
        let poll = self.ctx.settings.readiness_poll;
        let status = Arc::clone(&self.status);
        let ready_tx = self.ready_tx.clone();

        tokio::spawn(async move {
            let load = match mode {
                Mode::Detection => provider.get_or_load(mode),
                Mode::Segmentation => loop {
                    status.send_modify(|s| s.readiness_checks += 1);
                    if let Some(load) = provider.pending(mode) {
                        break load;
                    }
                    tracing::debug!("{} model not ready; checking again in {:?}", mode, poll);
                    tokio::time::sleep(poll).await;
                },
            };
            tracing::debug!("Awaiting {} model load", load.mode());
            let result = load.ready().await;
            let _ = ready_tx.send(ModelReady {
                generation,
                mode,
                result,
            });
        })
    }

    fn on_model_ready(&mut self, ready: ModelReady) {
        let awaiting = matches!(self.state, ControllerState::AwaitingModel(mode) if mode == ready.mode);
        if ready.generation != self.generation || !awaiting {
            tracing::debug!("Ignoring stale {} model resolution", ready.mode);
            return;
        }
        self.readiness = None;

        match ready.result {
            Ok(model) => {
                self.start_loop(ready.mode, model);
                self.status.send_modify(|s| s.running_entries += 1);
                self.publish();
            }
            Err(err) => {
                tracing::error!("Staying in {} mode without a loop: {}", ready.mode, err);
                self.status
                    .send_modify(|s| s.last_error = Some(err.to_string()));
            }
        }
    }

    fn start_loop(&mut self, mode: Mode, model: ModelHandle) {
        let Some(stream) = self.ctx.stream.clone() else {
            tracing::warn!("Cannot start {} loop without a camera stream", mode);
            return;
        };

        let handle = match &model {
            ModelHandle::Detection(detector) => self.scheduler.start(DetectionLoop::new(
                stream,
                Arc::clone(detector),
                Arc::clone(&self.ctx.stage),
                &self.ctx.settings,
            )),
            ModelHandle::Segmentation(segmenter) => self.scheduler.start(SegmentationLoop::new(
                stream,
                Arc::clone(segmenter),
                Arc::clone(&self.ctx.stage),
                &self.ctx.settings,
                self.ctx.device,
                Arc::clone(&self.ctx.draw_skeleton),
            )),
        };
        tracing::info!("Running {} loop {}", mode, handle.id());
        self.state = ControllerState::Running {
            mode,
            handle,
            model,
        };
    }

    /// Replaces the running loop with a fresh one over the same model.
    fn restart_loop(&mut self) {
        let ControllerState::Running { mode, handle, model } = &self.state else {
            return;
        };
        let (mode, model) = (*mode, model.clone());
        self.scheduler.cancel(handle);
        tracing::debug!("Restarting {} loop for the new viewport", mode);
        self.start_loop(mode, model);
        self.publish();
    }

    fn shutdown(&mut self) {
        self.leave_current();
        tracing::info!(
            "Controller shut down after {} presented frames",
            Stage::lock(&self.ctx.stage).presented_frames()
        );
        self.publish();
    }

    fn publish(&self) {
        let phase = match &self.state {
            ControllerState::Idle => Phase::Idle,
            ControllerState::AwaitingModel(mode) => Phase::AwaitingModel(*mode),
            ControllerState::Running { mode, .. } => Phase::Running(*mode),
        };
        let active_loop = self.scheduler.active().map(FrameLoopHandle::id);
        let selected = self.selected;
        self.status.send_modify(|s| {
            s.phase = phase;
            s.selected = selected;
            s.active_loop = active_loop;
        });
    }
}

/// Running per-stage timing averages, reported every [`STATS_EVERY`] frames.
struct FrameStats {
    mode: Mode,
    frames: u64,
    inference: Duration,
    render: Duration,
}

impl FrameStats {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            frames: 0,
            inference: Duration::ZERO,
            render: Duration::ZERO,
        }
    }

    fn record(&mut self, timings: FrameTimings, loop_id: u64) {
        self.frames += 1;
        self.inference += timings.inference;
        self.render += timings.render;

        if self.frames % STATS_EVERY == 0 {
            let avg_inference_ms = self.inference.as_secs_f64() * 1000.0 / self.frames as f64;
            let avg_render_ms = self.render.as_secs_f64() * 1000.0 / self.frames as f64;
            let total_ms = avg_inference_ms + avg_render_ms;
            tracing::info!(
                "{} loop {} frame {}: inference={:.1}ms, render={:.1}ms, total={:.1}ms, fps={:.1}",
                self.mode,
                loop_id,
                self.frames,
                avg_inference_ms,
                avg_render_ms,
                total_ms,
                1000.0 / total_ms.max(f64::EPSILON)
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameTimings {
    inference: Duration,
    render: Duration,
}

fn lock_model<T: ?Sized>(model: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    model.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of the blocking half of a frame.
fn finish_frame(
    stats: &mut FrameStats,
    tick: &FrameTick,
    timings: Option<FrameTimings>,
) -> NextFrame {
    match timings {
        Some(timings) => {
            stats.record(timings, tick.loop_id);
            ControlFlow::Continue(())
        }
        None => {
            tracing::debug!(
                "Loop {} cancelled during frame {}; nothing drawn",
                tick.loop_id,
                tick.frame_index
            );
            ControlFlow::Break(())
        }
    }
}

/// Detects objects on the latest frame and draws boxes over the video.
struct DetectionLoop {
    stream: StreamHandle,
    detector: SharedDetector,
    stage: SharedStage,
    style: DetectionStyle,
    stats: FrameStats,
}

impl DetectionLoop {
    fn new(
        stream: StreamHandle,
        detector: SharedDetector,
        stage: SharedStage,
        settings: &OverlaySettings,
    ) -> Self {
        Self {
            stream,
            detector,
            stage,
            style: DetectionStyle::from(settings),
            stats: FrameStats::new(Mode::Detection),
        }
    }
}

impl FrameTask for DetectionLoop {
    async fn run_frame(&mut self, tick: &FrameTick) -> Result<NextFrame> {
        let Some(frame) = self.stream.latest() else {
            return Ok(ControlFlow::Continue(()));
        };

        let detector = Arc::clone(&self.detector);
        let stage = Arc::clone(&self.stage);
        let style = self.style;
        let worker_tick = tick.clone();

        let timings = tokio::task::spawn_blocking(move || -> Result<Option<FrameTimings>> {
            let inference_start = Instant::now();
            let detections = lock_model(&detector)
                .detect(&frame)
                .context("Object detection failed")?;
            let inference = inference_start.elapsed();

            let render_start = Instant::now();
            let mut stage = Stage::lock(&stage);
            if worker_tick.is_cancelled() {
                return Ok(None);
            }
            let scale = scale_factors(stage.dimensions(), frame.dimensions());
            let (surface, colors) = stage.parts_mut();
            render_detections(surface, &detections, scale, colors, &style);
            stage.present(&frame, VideoLayer::Visible)?;

            Ok(Some(FrameTimings {
                inference,
                render: render_start.elapsed(),
            }))
        })
        .await
        .context("Detection frame worker panicked")??;

        Ok(finish_frame(&mut self.stats, tick, timings))
    }
}

/// Segments body parts on the latest frame, scaled to the canvas, and
/// draws the coloured mask with optional skeletons.
struct SegmentationLoop {
    stream: StreamHandle,
    segmenter: SharedSegmenter,
    stage: SharedStage,
    multi_person: bool,
    opacity: f32,
    draw_skeleton: Arc<AtomicBool>,
    style: SkeletonStyle,
    stats: FrameStats,
}

impl SegmentationLoop {
    fn new(
        stream: StreamHandle,
        segmenter: SharedSegmenter,
        stage: SharedStage,
        settings: &OverlaySettings,
        device: DeviceClass,
        draw_skeleton: Arc<AtomicBool>,
    ) -> Self {
        Self {
            stream,
            segmenter,
            stage,
            multi_person: !device.is_mobile(),
            opacity: settings.mask_opacity,
            draw_skeleton,
            style: SkeletonStyle::from(settings),
            stats: FrameStats::new(Mode::Segmentation),
        }
    }
}

impl FrameTask for SegmentationLoop {
    async fn run_frame(&mut self, tick: &FrameTick) -> Result<NextFrame> {
        let Some(frame) = self.stream.latest() else {
            return Ok(ControlFlow::Continue(()));
        };

        let segmenter = Arc::clone(&self.segmenter);
        let stage = Arc::clone(&self.stage);
        let multi_person = self.multi_person;
        let opacity = self.opacity;
        let draw_skeleton = self.draw_skeleton.load(Ordering::SeqCst);
        let style = self.style;
        let worker_tick = tick.clone();

        let timings = tokio::task::spawn_blocking(move || -> Result<Option<FrameTimings>> {
            let (width, height) = Stage::lock(&stage).dimensions();
            let source: RgbImage = if frame.dimensions() == (width, height) {
                (*frame).clone()
            } else {
                imageops::resize(&*frame, width, height, imageops::FilterType::Triangle)
            };

            let inference_start = Instant::now();
            let segmented: SegmentationFrame = {
                let mut segmenter = lock_model(&segmenter);
                if multi_person {
                    segmenter.segment_multi(&source)
                } else {
                    segmenter.segment_single(&source)
                }
            }
            .context("Body part segmentation failed")?;
            let inference = inference_start.elapsed();

            let render_start = Instant::now();
            let mut stage = Stage::lock(&stage);
            if worker_tick.is_cancelled() {
                return Ok(None);
            }
            render_segmentation(
                stage.surface_mut(),
                &source,
                &segmented,
                opacity,
                draw_skeleton,
                &style,
            );
            stage.present(&source, VideoLayer::Hidden)?;

            Ok(Some(FrameTimings {
                inference,
                render: render_start.elapsed(),
            }))
        })
        .await
        .context("Segmentation frame worker panicked")??;

        Ok(finish_frame(&mut self.stats, tick, timings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::FakeBackend;
    use crate::render::testing::{Op, RecordingSurface};
    use crate::render::ColorAssignment;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Harness {
        backend: Arc<FakeBackend>,
        provider: ModelProvider,
        ops: Arc<Mutex<Vec<Op>>>,
        controller: ControllerHandle,
    }

    impl Harness {
        fn new(device: DeviceClass, initial_mode: Mode) -> Self {
            let backend = Arc::new(FakeBackend::default());
            Self::with_backend(backend, device, initial_mode)
        }

        fn with_backend(backend: Arc<FakeBackend>, device: DeviceClass, initial_mode: Mode) -> Self {
            let provider = ModelProvider::new(backend.clone());
            let surface = RecordingSurface::new(640, 480);
            let ops = Arc::clone(&surface.ops);
            let stage = Stage::new(
                Box::new(surface),
                ColorAssignment::with_rng(StdRng::seed_from_u64(7)),
                None,
            )
            .shared();

            let settings = OverlaySettings {
                refresh_hz: 50,
                ..OverlaySettings::default()
            };
            let ctx = AppContext::new(settings, device, provider.clone(), stage, 1280, true);
            let controller = ModeController::new(ctx, initial_mode).spawn();
            Self {
                backend,
                provider,
                ops,
                controller,
            }
        }

        async fn acquire_stream(&self) {
            let stream = StreamHandle::still(RgbImage::new(64, 48));
            self.controller
                .send(ControlEvent::StreamAcquired(stream))
                .await
                .unwrap();
        }

        async fn wait_for(&self, check: impl Fn(&ControllerStatus) -> bool) -> ControllerStatus {
            let mut status = self.controller.subscribe();
            let seen = tokio::time::timeout(Duration::from_secs(10), status.wait_for(check))
                .await
                .expect("controller reached the expected state")
                .expect("controller alive")
                .clone();
            seen
        }

        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }
    }

    fn is_detection_draw(op: &Op) -> bool {
        matches!(op, Op::StrokeRect(..) | Op::FillRect(..) | Op::FillText(..))
    }

    #[tokio::test(start_paused = true)]
    async fn mode_selected_while_idle_starts_with_stream() {
        let harness = Harness::new(DeviceClass::Desktop, Mode::Detection);
        harness
            .controller
            .send(ControlEvent::SelectMode(Mode::Segmentation))
            .await
            .unwrap();
        let status = harness.wait_for(|s| s.selected == Mode::Segmentation).await;
        assert_eq!(status.phase, Phase::Idle);

        harness.acquire_stream().await;
        harness
            .wait_for(|s| s.phase == Phase::AwaitingModel(Mode::Segmentation))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn detection_runs_once_model_resolves() {
        let harness = Harness::new(DeviceClass::Desktop, Mode::Detection);
        harness.acquire_stream().await;

        let status = harness
            .wait_for(|s| s.phase == Phase::Running(Mode::Detection))
            .await;
        assert_eq!(status.running_entries, 1);
        assert!(status.active_loop.is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(harness.backend.detect_calls.load(Ordering::SeqCst) > 0);
        assert!(harness.ops().iter().any(|op| matches!(op, Op::StrokeRect(..))));
        assert!(harness
            .ops()
            .iter()
            .any(|op| matches!(op, Op::FillText(text, ..) if text == "person: 90%")));
    }

    #[tokio::test(start_paused = true)]
    async fn switching_mode_clears_and_stops_detection_drawing() {
        let harness = Harness::new(DeviceClass::Desktop, Mode::Detection);
        harness.acquire_stream().await;
        harness
            .wait_for(|s| s.phase == Phase::Running(Mode::Detection))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        harness
            .controller
            .send(ControlEvent::SelectMode(Mode::Segmentation))
            .await
            .unwrap();
        let status = harness
            .wait_for(|s| s.phase == Phase::AwaitingModel(Mode::Segmentation))
            .await;
        assert_eq!(status.active_loop, None);

        let at_switch = harness.ops();
        assert_eq!(at_switch.last(), Some(&Op::Clear));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let after = harness.ops();
        assert!(after[at_switch.len()..].iter().all(|op| !is_detection_draw(op)));
        assert_eq!(harness.controller.running_loops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn segmentation_polls_until_model_is_requested() {
        let harness = Harness::new(DeviceClass::Desktop, Mode::Segmentation);
        harness.acquire_stream().await;
        harness
            .wait_for(|s| s.phase == Phase::AwaitingModel(Mode::Segmentation))
            .await;

        tokio::time::sleep(Duration::from_millis(1600)).await;
        let status = harness.controller.status();
        assert_eq!(status.phase, Phase::AwaitingModel(Mode::Segmentation));
        assert!(status.readiness_checks >= 3, "{} checks", status.readiness_checks);
        assert_eq!(status.running_entries, 0);

        harness.provider.get_or_load(Mode::Segmentation);
        harness
            .wait_for(|s| s.phase == Phase::Running(Mode::Segmentation))
            .await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        let settled = harness.controller.status();
        assert_eq!(settled.running_entries, 1);
        let checks = settled.readiness_checks;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(harness.controller.status().readiness_checks, checks);

        assert!(harness.backend.segment_calls.load(Ordering::SeqCst) > 0);
        let ops = harness.ops();
        assert!(ops.contains(&Op::Mask(0.7)));
        assert!(ops.iter().any(|op| matches!(op, Op::Point(..))));
    }

    #[tokio::test(start_paused = true)]
    async fn skeleton_toggle_applies_to_running_loop() {
        let harness = Harness::new(DeviceClass::Mobile, Mode::Segmentation);
        harness.provider.spawn_preload().await.unwrap();
        harness.acquire_stream().await;
        harness
            .wait_for(|s| s.phase == Phase::Running(Mode::Segmentation))
            .await;

        harness
            .controller
            .send(ControlEvent::SetSkeleton(false))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mark = harness.ops().len();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let ops = harness.ops();
        assert!(ops[mark..].contains(&Op::Mask(0.7)));
        assert!(ops[mark..].iter().all(|op| !matches!(op, Op::Point(..) | Op::Line(..))));
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_switching_keeps_a_single_loop() {
        let harness = Harness::new(DeviceClass::Desktop, Mode::Detection);
        harness.provider.spawn_preload().await.unwrap();
        harness.acquire_stream().await;
        harness
            .wait_for(|s| s.phase == Phase::Running(Mode::Detection))
            .await;

        for mode in [
            Mode::Segmentation,
            Mode::Detection,
            Mode::Segmentation,
            Mode::Segmentation,
            Mode::Detection,
        ] {
            harness
                .controller
                .send(ControlEvent::SelectMode(mode))
                .await
                .unwrap();
            harness.wait_for(|s| s.phase == Phase::Running(mode)).await;
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(harness.controller.running_loops() <= 1);
        }
        assert_eq!(harness.controller.status().running_entries, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn resize_restarts_loop_on_desktop_only() {
        for (device, restarts) in [(DeviceClass::Desktop, true), (DeviceClass::Mobile, false)] {
            let harness = Harness::new(device, Mode::Detection);
            harness.acquire_stream().await;
            let before = harness
                .wait_for(|s| s.phase == Phase::Running(Mode::Detection))
                .await
                .active_loop;

            harness
                .controller
                .send(ControlEvent::Resize {
                    container_width: 400,
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;

            let status = harness.controller.status();
            assert_eq!(status.phase, Phase::Running(Mode::Detection));
            assert_eq!(status.active_loop != before, restarts, "{device:?}");
            assert_eq!(status.running_entries, 1);
            assert!(harness.controller.running_loops() <= 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn orientation_change_restarts_on_mobile() {
        let harness = Harness::new(DeviceClass::Mobile, Mode::Detection);
        harness.acquire_stream().await;
        let before = harness
            .wait_for(|s| s.phase == Phase::Running(Mode::Detection))
            .await
            .active_loop;

        harness
            .controller
            .send(ControlEvent::OrientationChanged {
                container_width: 360,
            })
            .await
            .unwrap();
        let after = harness.wait_for(|s| s.active_loop != before).await;
        assert_eq!(after.phase, Phase::Running(Mode::Detection));
    }

    #[tokio::test(start_paused = true)]
    async fn load_failure_parks_controller() {
        let backend = Arc::new(FakeBackend::default());
        backend.fail_detector.store(true, Ordering::SeqCst);
        let harness = Harness::with_backend(backend, DeviceClass::Desktop, Mode::Detection);
        harness.acquire_stream().await;

        let status = harness.wait_for(|s| s.last_error.is_some()).await;
        assert_eq!(status.phase, Phase::AwaitingModel(Mode::Detection));
        assert_eq!(status.active_loop, None);
        assert!(status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("no detector weights")));
        assert_eq!(harness.controller.running_loops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_frame_halts_until_reselected() {
        let harness = Harness::new(DeviceClass::Desktop, Mode::Detection);
        harness.acquire_stream().await;
        harness
            .wait_for(|s| s.phase == Phase::Running(Mode::Detection))
            .await;

        harness.backend.fail_detect_call.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.controller.running_loops(), 0);
        let halted_at = harness.backend.detect_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.backend.detect_calls.load(Ordering::SeqCst), halted_at);

        harness.backend.fail_detect_call.store(false, Ordering::SeqCst);
        harness
            .controller
            .send(ControlEvent::SelectMode(Mode::Detection))
            .await
            .unwrap();
        harness.wait_for(|s| s.running_entries == 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(harness.backend.detect_calls.load(Ordering::SeqCst) > halted_at);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_segmentation_frame_halts_until_reselected() {
        let harness = Harness::new(DeviceClass::Desktop, Mode::Segmentation);
        harness.provider.spawn_preload().await.unwrap();
        harness.acquire_stream().await;
        harness
            .wait_for(|s| s.phase == Phase::Running(Mode::Segmentation))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(harness.backend.segment_calls.load(Ordering::SeqCst) > 0);

        harness.backend.fail_segment_call.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.controller.running_loops(), 0);
        let halted_at = harness.backend.segment_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(harness.backend.segment_calls.load(Ordering::SeqCst), halted_at);
        assert_eq!(
            harness.controller.status().phase,
            Phase::Running(Mode::Segmentation)
        );

        harness.backend.fail_segment_call.store(false, Ordering::SeqCst);
        harness
            .controller
            .send(ControlEvent::SelectMode(Mode::Segmentation))
            .await
            .unwrap();
        harness.wait_for(|s| s.running_entries == 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(harness.backend.segment_calls.load(Ordering::SeqCst) > halted_at);
        assert_eq!(harness.controller.running_loops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_running_loop() {
        let harness = Harness::new(DeviceClass::Desktop, Mode::Detection);
        harness.acquire_stream().await;
        harness
            .wait_for(|s| s.phase == Phase::Running(Mode::Detection))
            .await;

        harness.controller.send(ControlEvent::Shutdown).await.unwrap();
        let mut status = harness.controller.subscribe();
        let running = Arc::clone(&harness.controller.running_loops);
        harness.controller.join().await.unwrap();
        assert_eq!(status.borrow_and_update().phase, Phase::Idle);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }
}
