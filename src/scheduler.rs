//! Display-synchronous frame loop.
//!
//! A loop runs one [`FrameTask`] per refresh tick. The task decides after
//! every frame whether another tick is requested, so a failing or finished
//! task simply stops the sequence. A scheduler owns at most one live loop:
//! starting a new one cancels the previous handle first.

use anyhow::Result;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// What a frame wants next.
pub type NextFrame = ControlFlow<()>;

pub trait FrameTask: Send + 'static {
    fn run_frame(&mut self, tick: &FrameTick) -> impl Future<Output = Result<NextFrame>> + Send;
}

/// Cancellation token for one running loop.
#[derive(Debug, Clone)]
pub struct FrameLoopHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl FrameLoopHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Passed to every frame; lets work that finishes after a cancellation
/// notice it before touching shared state.
#[derive(Debug, Clone)]
pub struct FrameTick {
    pub loop_id: u64,
    pub frame_index: u64,
    cancelled: Arc<AtomicBool>,
}

impl FrameTick {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Decrements the running-loop count when a loop task ends, however it ends.
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FrameScheduler {
    frame_interval: Duration,
    next_id: u64,
    active: Option<FrameLoopHandle>,
    running: Arc<AtomicUsize>,
}

impl FrameScheduler {
    pub fn new(frame_interval: Duration) -> Self {
        Self {
            frame_interval,
            next_id: 0,
            active: None,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cancels any active loop, then starts `task` on a fresh one.
    pub fn start<T: FrameTask>(&mut self, task: T) -> FrameLoopHandle {
        if let Some(previous) = self.active.take() {
            tracing::debug!("Cancelling frame loop {} before starting a new one", previous.id);
            previous.cancel();
        }

        self.next_id += 1;
        let handle = FrameLoopHandle {
            id: self.next_id,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        self.active = Some(handle.clone());

        self.running.fetch_add(1, Ordering::SeqCst);
        let guard = RunningGuard(Arc::clone(&self.running));
        tokio::spawn(run_loop(task, handle.clone(), self.frame_interval, guard));

        tracing::debug!("Started frame loop {}", handle.id);
        handle
    }

    /// Stops `handle` after its in-flight frame, if any.
    pub fn cancel(&mut self, handle: &FrameLoopHandle) {
        handle.cancel();
        if self.active.as_ref().is_some_and(|active| active.id == handle.id) {
            self.active = None;
        }
    }

    pub fn active(&self) -> Option<&FrameLoopHandle> {
        self.active.as_ref()
    }

    /// Loop tasks that have not exited yet, cancelled or not.
    pub fn running_loops(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Shared view of [`running_loops`](Self::running_loops) for observers
    /// that do not own the scheduler.
    pub fn running_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.running)
    }
}

async fn run_loop<T: FrameTask>(
    mut task: T,
    handle: FrameLoopHandle,
    frame_interval: Duration,
    _guard: RunningGuard,
) {
    let mut refresh = tokio::time::interval(frame_interval);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut frame_index = 0;
    loop {
        refresh.tick().await;
        if handle.is_cancelled() {
            tracing::debug!("Frame loop {} cancelled after {} frames", handle.id, frame_index);
            return;
        }

        let tick = FrameTick {
            loop_id: handle.id,
            frame_index,
            cancelled: Arc::clone(&handle.cancelled),
        };
        match task.run_frame(&tick).await {
            Ok(ControlFlow::Continue(())) => frame_index += 1,
            Ok(ControlFlow::Break(())) => {
                tracing::debug!("Frame loop {} stopped by its task", handle.id);
                return;
            }
            Err(err) => {
                tracing::error!("Frame loop {} halted: {:#}", handle.id, err);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct Counter {
        frames: Arc<AtomicUsize>,
        fail_at: Option<usize>,
        stop_at: Option<usize>,
    }

    impl Counter {
        fn new(frames: &Arc<AtomicUsize>) -> Self {
            Self {
                frames: Arc::clone(frames),
                fail_at: None,
                stop_at: None,
            }
        }
    }

    impl FrameTask for Counter {
        async fn run_frame(&mut self, _tick: &FrameTick) -> Result<NextFrame> {
            let n = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_at == Some(n) {
                bail!("inference rejected");
            }
            if self.stop_at == Some(n) {
                return Ok(ControlFlow::Break(()));
            }
            Ok(ControlFlow::Continue(()))
        }
    }

    const FRAME: Duration = Duration::from_millis(10);

    #[tokio::test(start_paused = true)]
    async fn runs_once_per_tick_until_cancelled() {
        let frames = Arc::new(AtomicUsize::new(0));
        let mut scheduler = FrameScheduler::new(FRAME);
        let handle = scheduler.start(Counter::new(&frames));

        tokio::time::sleep(Duration::from_millis(55)).await;
        let seen = frames.load(Ordering::SeqCst);
        assert!((5..=7).contains(&seen), "saw {seen} frames");

        scheduler.cancel(&handle);
        tokio::time::sleep(Duration::from_millis(15)).await;
        let after_cancel = frames.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(frames.load(Ordering::SeqCst), after_cancel);
        assert_eq!(scheduler.running_loops(), 0);
        assert!(scheduler.active().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn starting_again_cancels_previous_loop() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut scheduler = FrameScheduler::new(FRAME);

        let a = scheduler.start(Counter::new(&first));
        tokio::time::sleep(Duration::from_millis(25)).await;
        let b = scheduler.start(Counter::new(&second));

        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert_eq!(scheduler.active().map(|h| h.id()), Some(b.id()));

        let frozen = first.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(first.load(Ordering::SeqCst), frozen);
        assert!(second.load(Ordering::SeqCst) > 0);
        assert_eq!(scheduler.running_loops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_frame_halts_the_loop() {
        let frames = Arc::new(AtomicUsize::new(0));
        let mut scheduler = FrameScheduler::new(FRAME);
        let mut task = Counter::new(&frames);
        task.fail_at = Some(3);
        scheduler.start(task);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(frames.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.running_loops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn task_may_stop_requesting_frames() {
        let frames = Arc::new(AtomicUsize::new(0));
        let mut scheduler = FrameScheduler::new(FRAME);
        let mut task = Counter::new(&frames);
        task.stop_at = Some(2);
        scheduler.start(task);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(frames.load(Ordering::SeqCst), 2);
    }
}
