//! Desktop capture
//!
//! The [`CaptureManager`] owns one capture thread per session. The thread
//! polls a [`CaptureSource`] at a fixed interval, grabs the desktop into a
//! reused [`Frame`] and publishes it through a fresh [`FrameQueue`].
//!
//! # Lifecycle
//!
//! ```text
//! start(w, h) ──> running ──stop()──> stopped ──start(w, h)──> running
//! ```
//!
//! `stop()` may be called from any thread, is idempotent and returns only
//! after the capture thread has exited, so no frame is pushed afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::backend::{clamp_geometry, DesktopBackend};
use crate::frame::{Frame, FrameError, FrameQueue, QueueWait};

/// Capture errors
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// `start` called while the capture thread is running
    #[error("capture is already running")]
    AlreadyRunning,

    /// Operation requires a running capture
    #[error("capture is not running")]
    NotRunning,

    /// Width or height is zero
    #[error("invalid capture geometry {width}x{height}")]
    InvalidGeometry {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
    },

    /// The capture source could not be acquired
    #[error("capture source unavailable: {0}")]
    Unavailable(String),

    /// A single grab failed; the loop retries
    #[error("frame grab failed: {0}")]
    Grab(String),

    /// Frame buffer error
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The capture thread could not be spawned
    #[error("failed to spawn capture thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// Something that can copy the desktop into a [`Frame`]
pub trait CaptureSource: Send {
    /// Geometry of the frames this source produces
    fn geometry(&self) -> (u32, u32);

    /// Change the capture geometry; returns the geometry actually used
    fn reconfigure(&mut self, width: u32, height: u32) -> Result<(u32, u32), CaptureError>;

    /// Copy the current desktop image into `frame`, configuring it as needed
    fn grab(&mut self, frame: &mut Frame) -> Result<(), CaptureError>;
}

/// Capture counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames grabbed and pushed
    pub frames: u64,
    /// Grabs that failed and were retried
    pub failures: u64,
}

/// State shared between the manager and its capture thread
struct CaptureShared {
    stop: Mutex<bool>,
    wake: Condvar,
    pending_geometry: Mutex<Option<(u32, u32)>>,
    frames: AtomicU64,
    failures: AtomicU64,
}

impl CaptureShared {
    fn new() -> Self {
        Self {
            stop: Mutex::new(false),
            wake: Condvar::new(),
            pending_geometry: Mutex::new(None),
            frames: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn signal_stop(&self) {
        *self.stop.lock() = true;
        self.wake.notify_all();
    }

    fn should_stop(&self) -> bool {
        *self.stop.lock()
    }

    /// Sleep for `duration` or until stopped; returns true when stopped
    fn sleep(&self, duration: Duration) -> bool {
        let mut stopped = self.stop.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, duration);
        }
        *stopped
    }
}

struct RunningCapture {
    queue: Arc<FrameQueue>,
    shared: Arc<CaptureShared>,
    thread: JoinHandle<()>,
    geometry: (u32, u32),
}

/// Owns the capture thread and its frame queue
pub struct CaptureManager {
    backend: Arc<dyn DesktopBackend>,
    interval: Duration,
    running: Mutex<Option<RunningCapture>>,
}

impl CaptureManager {
    /// Create a stopped manager polling at `target_fps`
    pub fn new(backend: Arc<dyn DesktopBackend>, target_fps: u32) -> Self {
        let fps = target_fps.max(1);
        Self {
            backend,
            interval: Duration::from_secs(1) / fps,
            running: Mutex::new(None),
        }
    }

    /// Poll interval between grabs
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start capturing at (at most) `width`×`height`
    ///
    /// Returns the geometry actually captured.
    pub fn start(&self, width: u32, height: u32) -> Result<(u32, u32), CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::InvalidGeometry { width, height });
        }

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }

        let requested = clamp_geometry((width, height), self.backend.desktop_size());
        let source = self.backend.open_capture(requested.0, requested.1)?;
        let geometry = source.geometry();

        let queue = Arc::new(FrameQueue::new());
        let shared = Arc::new(CaptureShared::new());
        let interval = self.interval;

        let thread = {
            let queue = Arc::clone(&queue);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("desktop-capture".into())
                .spawn(move || run_capture_loop(source, queue, shared, interval))
                .map_err(CaptureError::Thread)?
        };

        info!(
            "Capture started via {} at {}x{} ({:?} interval)",
            self.backend.name(),
            geometry.0,
            geometry.1,
            interval
        );

        *running = Some(RunningCapture {
            queue,
            shared,
            thread,
            geometry,
        });
        Ok(geometry)
    }

    /// Stop the capture thread and the queue
    ///
    /// Idempotent. Returns after the thread has been joined.
    pub fn stop(&self) {
        let Some(capture) = self.running.lock().take() else {
            return;
        };

        capture.shared.signal_stop();
        capture.queue.stop();
        if capture.thread.join().is_err() {
            error!("Capture thread panicked");
        }

        info!(
            "Capture stopped ({} frames, {} failed grabs)",
            capture.shared.frames.load(Ordering::Relaxed),
            capture.shared.failures.load(Ordering::Relaxed)
        );
    }

    /// Whether the capture thread is running
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Wait for the next frame; `Stopped` when not running
    pub fn wait_frame(&self, timeout: Duration) -> QueueWait {
        match self.queue() {
            Some(queue) => queue.wait(timeout),
            None => QueueWait::Stopped,
        }
    }

    /// Queue of the current run
    pub fn queue(&self) -> Option<Arc<FrameQueue>> {
        self.running.lock().as_ref().map(|c| Arc::clone(&c.queue))
    }

    /// Geometry of the current run
    pub fn geometry(&self) -> Option<(u32, u32)> {
        self.running.lock().as_ref().map(|c| c.geometry)
    }

    /// Ask the capture loop to switch geometry before its next grab
    ///
    /// Returns the clamped geometry that will be used.
    pub fn set_geometry(&self, width: u32, height: u32) -> Result<(u32, u32), CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::InvalidGeometry { width, height });
        }

        let mut running = self.running.lock();
        let capture = running.as_mut().ok_or(CaptureError::NotRunning)?;

        let geometry = clamp_geometry((width, height), self.backend.desktop_size());
        if geometry != capture.geometry {
            *capture.shared.pending_geometry.lock() = Some(geometry);
            capture.geometry = geometry;
            debug!("Capture geometry change queued: {}x{}", geometry.0, geometry.1);
        }
        Ok(geometry)
    }

    /// Counters for the current run (zero when stopped)
    pub fn stats(&self) -> CaptureStats {
        self.running
            .lock()
            .as_ref()
            .map(|c| CaptureStats {
                frames: c.shared.frames.load(Ordering::Relaxed),
                failures: c.shared.failures.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture_loop(
    mut source: Box<dyn CaptureSource>,
    queue: Arc<FrameQueue>,
    shared: Arc<CaptureShared>,
    interval: Duration,
) {
    debug!("Capture loop started");
    let mut spare: Option<Frame> = None;
    let mut consecutive_failures: u64 = 0;

    loop {
        let tick = Instant::now();
        if shared.should_stop() {
            break;
        }

        if let Some((width, height)) = shared.pending_geometry.lock().take() {
            match source.reconfigure(width, height) {
                Ok((w, h)) => {
                    queue.reset();
                    info!("Capture reconfigured to {}x{}", w, h);
                }
                Err(e) => warn!("Capture reconfigure to {}x{} failed: {}", width, height, e),
            }
        }

        let mut frame = spare
            .take()
            .or_else(|| queue.take_recycled())
            .unwrap_or_default();

        match source.grab(&mut frame) {
            Ok(()) => {
                if consecutive_failures > 0 {
                    info!("Capture recovered after {} failed grabs", consecutive_failures);
                    consecutive_failures = 0;
                }
                shared.frames.fetch_add(1, Ordering::Relaxed);
                trace!("Captured {}x{} frame", frame.width(), frame.height());
                spare = queue.push(frame);
            }
            Err(e) => {
                consecutive_failures += 1;
                shared.failures.fetch_add(1, Ordering::Relaxed);
                if consecutive_failures == 1 || consecutive_failures % 100 == 0 {
                    warn!("Frame grab failed ({} in a row): {}", consecutive_failures, e);
                }
                spare = Some(frame);
            }
        }

        if let Some(remaining) = interval.checked_sub(tick.elapsed()) {
            if shared.sleep(remaining) {
                break;
            }
        }
    }

    debug!("Capture loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{InputError, InputInjector};
    use std::sync::atomic::AtomicBool;

    /// Source that paints a counter into the first byte of each frame
    struct CountingSource {
        geometry: (u32, u32),
        counter: u8,
        fail: Arc<AtomicBool>,
    }

    impl CaptureSource for CountingSource {
        fn geometry(&self) -> (u32, u32) {
            self.geometry
        }

        fn reconfigure(&mut self, width: u32, height: u32) -> Result<(u32, u32), CaptureError> {
            self.geometry = (width, height);
            Ok(self.geometry)
        }

        fn grab(&mut self, frame: &mut Frame) -> Result<(), CaptureError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CaptureError::Grab("simulated".into()));
            }
            let (w, h) = self.geometry;
            frame.configure(w, h, w * 4, Instant::now())?;
            self.counter = self.counter.wrapping_add(1);
            frame.data_mut()[0] = self.counter;
            Ok(())
        }
    }

    struct TestBackend {
        fail: Arc<AtomicBool>,
    }

    impl DesktopBackend for TestBackend {
        fn name(&self) -> &str {
            "test"
        }

        fn desktop_size(&self) -> (u32, u32) {
            (1024, 768)
        }

        fn open_capture(
            &self,
            width: u32,
            height: u32,
        ) -> Result<Box<dyn CaptureSource>, CaptureError> {
            Ok(Box::new(CountingSource {
                geometry: (width, height),
                counter: 0,
                fail: Arc::clone(&self.fail),
            }))
        }

        fn open_injector(&self) -> Result<Arc<dyn InputInjector>, InputError> {
            Err(InputError::Unavailable("no input in capture tests".into()))
        }
    }

    fn manager(fps: u32) -> (CaptureManager, Arc<AtomicBool>) {
        let fail = Arc::new(AtomicBool::new(false));
        let backend = Arc::new(TestBackend {
            fail: Arc::clone(&fail),
        });
        (CaptureManager::new(backend, fps), fail)
    }

    #[test]
    fn test_start_produces_frames() {
        let (capture, _) = manager(100);
        assert_eq!(capture.start(800, 600).unwrap(), (800, 600));

        match capture.wait_frame(Duration::from_secs(2)) {
            QueueWait::Frame(frame) => {
                assert_eq!(frame.width(), 800);
                assert_eq!(frame.height(), 600);
                assert_eq!(frame.len(), 800 * 4 * 600);
            }
            other => panic!("expected frame, got {other:?}"),
        }
        capture.stop();
    }

    #[test]
    fn test_start_clamps_to_desktop() {
        let (capture, _) = manager(30);
        assert_eq!(capture.start(4000, 600).unwrap(), (1024, 600));
        capture.stop();
    }

    #[test]
    fn test_double_start_is_error() {
        let (capture, _) = manager(30);
        capture.start(320, 200).unwrap();
        assert!(matches!(
            capture.start(320, 200),
            Err(CaptureError::AlreadyRunning)
        ));
        capture.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_restartable() {
        let (capture, _) = manager(30);
        capture.stop();
        capture.start(320, 200).unwrap();
        capture.stop();
        capture.stop();
        assert!(!capture.is_running());
        assert!(matches!(
            capture.wait_frame(Duration::ZERO),
            QueueWait::Stopped
        ));
        capture.start(320, 200).unwrap();
        assert!(capture.is_running());
        capture.stop();
    }

    #[test]
    fn test_stop_wakes_long_interval_sleep() {
        let (capture, _) = manager(1);
        capture.start(64, 64).unwrap();
        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        capture.stop();
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_transient_failures_keep_running() {
        let (capture, fail) = manager(200);
        fail.store(true, Ordering::SeqCst);
        capture.start(64, 64).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(capture.is_running());
        assert!(capture.stats().failures > 0);

        fail.store(false, Ordering::SeqCst);
        assert!(matches!(
            capture.wait_frame(Duration::from_secs(2)),
            QueueWait::Frame(_)
        ));
        capture.stop();
    }

    #[test]
    fn test_set_geometry_applies_before_next_grab() {
        let (capture, _) = manager(200);
        capture.start(64, 64).unwrap();
        assert_eq!(capture.set_geometry(128, 96).unwrap(), (128, 96));

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let QueueWait::Frame(frame) = capture.wait_frame(Duration::from_millis(100)) {
                if frame.width() == 128 {
                    assert_eq!(frame.height(), 96);
                    break;
                }
            }
            assert!(Instant::now() < deadline, "geometry change never applied");
        }
        capture.stop();
    }

    #[test]
    fn test_set_geometry_requires_running() {
        let (capture, _) = manager(30);
        assert!(matches!(
            capture.set_geometry(100, 100),
            Err(CaptureError::NotRunning)
        ));
    }
}
