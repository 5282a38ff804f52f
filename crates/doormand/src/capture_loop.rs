//! Continuous capture → recognize → dispatch loop.
//!
//! Runs on a dedicated OS thread. Unlocks and alerts are handed to the
//! runtime as fire-and-forget tasks so a hold or a retrying delivery never
//! stalls frame capture.

use crate::approval::ApprovalWorkflow;
use crate::context::Context;
use doorman_core::{FaceRegion, Outcome};
use doorman_hw::{Camera, CameraError, Frame, RelayState};
use image::imageops;
use image::GrayImage;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const CAMERA_OPEN_ATTEMPTS: u32 = 3;
pub const CAMERA_RETRY_DELAY: Duration = Duration::from_secs(1);

const CAPTURE_RETRY_DELAY: Duration = Duration::from_secs(1);
const COOLDOWN_POLL: Duration = Duration::from_millis(100);
const NO_FACE_DELAY: Duration = Duration::from_millis(500);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Anything that yields grayscale frames.
pub trait FrameSource {
    fn capture(&mut self) -> Result<Frame, CameraError>;
}

impl FrameSource for Camera {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

/// Open a frame source, requiring a successful test read.
///
/// Makes up to `attempts` tries, sleeping `delay` between them. Returns the
/// last error once all attempts fail.
pub fn open_with_retry<S, F>(mut open: F, attempts: u32, delay: Duration) -> Result<S, CameraError>
where
    S: FrameSource,
    F: FnMut() -> Result<S, CameraError>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        let result = open().and_then(|mut source| source.capture().map(|_| source));
        match result {
            Ok(source) => {
                tracing::info!(attempt, "camera initialized");
                return Ok(source);
            }
            Err(e) => {
                tracing::warn!(attempt, attempts, error = %e, "camera initialization failed");
                last_err = Some(e);
            }
        }
        if attempt < attempts {
            std::thread::sleep(delay);
        }
    }
    Err(last_err.unwrap_or_else(|| CameraError::CaptureFailed("no attempts made".into())))
}

/// Discard `frames` frames while exposure settles.
pub fn warm_up(source: &mut impl FrameSource, frames: usize) {
    if frames == 0 {
        return;
    }
    tracing::info!(count = frames, "discarding warmup frames");
    for _ in 0..frames {
        let _ = source.capture();
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    CaptureFailed,
    /// Frame dropped inside the cooldown window.
    Cooldown,
    NoFace,
    Unlocking { name: String },
    /// Recognized while a previous unlock is still holding the door open.
    AlreadyUnlocked { name: String },
    /// `image_path` is `None` when the crop could not be saved.
    Alerting { image_path: Option<PathBuf> },
}

pub struct CaptureLoop<S> {
    source: S,
    ctx: Context,
    approvals: Arc<ApprovalWorkflow>,
    last_cycle: Option<Instant>,
}

impl<S: FrameSource> CaptureLoop<S> {
    pub fn new(source: S, ctx: Context, approvals: Arc<ApprovalWorkflow>) -> Self {
        Self {
            source,
            ctx,
            approvals,
            last_cycle: None,
        }
    }

    /// Run one iteration as of `now`.
    pub fn step(&mut self, now: Instant) -> Step {
        tracing::trace!(state = "Capturing");
        let frame = match self.source.capture() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "camera error: failed to capture valid image");
                return Step::CaptureFailed;
            }
        };

        let image = match frame.into_image() {
            Ok(image) => image,
            Err(e) => {
                tracing::error!(error = %e, "camera error: invalid frame");
                return Step::CaptureFailed;
            }
        };

        if let Some(last) = self.last_cycle {
            if now.saturating_duration_since(last) < self.ctx.config.cooldown() {
                return Step::Cooldown;
            }
        }

        tracing::trace!(state = "Deciding");
        let Some(recognition) = self.ctx.engine.process(&image) else {
            tracing::debug!("no face detected");
            return Step::NoFace;
        };
        self.last_cycle = Some(now);

        match recognition.outcome {
            Outcome::Matched { name, distance } if self.ctx.relay.state() == RelayState::Unlocked => {
                tracing::debug!(name = %name, distance, "recognized; door already unlocked");
                Step::AlreadyUnlocked { name }
            }
            Outcome::Matched { name, distance } => {
                tracing::info!(state = "Unlocking", name = %name, distance, "recognized; unlocking door");
                let relay = Arc::clone(&self.ctx.relay);
                let hold = self.ctx.config.unlock_hold();
                self.ctx
                    .tasks
                    .spawn("unlock", async move { relay.unlock(hold).await });
                Step::Unlocking { name }
            }
            outcome => {
                tracing::info!(state = "Alerting", ?outcome, "unknown face; requesting approval");
                let image_path = self.save_unknown(&image, &recognition.region);
                if let Some(path) = image_path.clone() {
                    let approvals = Arc::clone(&self.approvals);
                    self.ctx.tasks.spawn("alert", async move {
                        approvals.send_alert(&path).await;
                        Ok::<_, Infallible>(())
                    });
                }
                Step::Alerting { image_path }
            }
        }
    }

    /// How long to wait after `step` before the next iteration.
    pub fn pause_after(&self, step: &Step) -> Duration {
        match step {
            Step::CaptureFailed => CAPTURE_RETRY_DELAY,
            Step::Cooldown => COOLDOWN_POLL,
            Step::NoFace => NO_FACE_DELAY,
            Step::Unlocking { .. } | Step::AlreadyUnlocked { .. } | Step::Alerting { .. } => {
                self.ctx.config.cooldown()
            }
        }
    }

    /// Loop until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        tracing::info!("capture loop started");
        while !shutdown.load(Ordering::SeqCst) {
            let step = self.step(Instant::now());
            let pause = self.pause_after(&step);
            tracing::trace!(state = "Idle", ?step, pause_ms = pause.as_millis() as u64);
            sleep_unless(pause, shutdown);
        }
        tracing::info!("capture loop stopped");
    }

    /// Crop `region` and write it to the unknown-faces directory.
    fn save_unknown(&self, image: &GrayImage, region: &FaceRegion) -> Option<PathBuf> {
        let (width, height) = image.dimensions();
        let region = region.clamp_to(width, height);
        let crop = if region.is_empty() {
            image.clone()
        } else {
            imageops::crop_imm(image, region.left, region.top, region.width(), region.height())
                .to_image()
        };

        let path = unknown_face_path(&self.ctx.config.unknown_faces_dir());
        match crop.save(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "unknown face saved");
                Some(path)
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to save unknown face");
                None
            }
        }
    }
}

/// `unknown_<unix_ts>.jpg`, suffixed if that second is already taken.
fn unknown_face_path(dir: &std::path::Path) -> PathBuf {
    let ts = chrono::Utc::now().timestamp();
    let mut path = dir.join(format!("unknown_{ts}.jpg"));
    let mut n = 2;
    while path.exists() {
        path = dir.join(format!("unknown_{ts}_{n}.jpg"));
        n += 1;
    }
    path
}

fn sleep_unless(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        std::thread::sleep(remaining.min(SHUTDOWN_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, Harness, MockAnalyzer, MockFrames, MockNotifier};
    use doorman_core::Encoding;
    use std::sync::atomic::AtomicU32;

    fn capture_loop(
        h: &Harness,
        frames: Vec<Option<(u32, u32)>>,
    ) -> (CaptureLoop<MockFrames>, Arc<MockNotifier>) {
        let notifier = Arc::new(MockNotifier::default());
        let approvals = Arc::new(ApprovalWorkflow::new(h.ctx.clone(), notifier.clone()));
        (
            CaptureLoop::new(MockFrames::new(frames), h.ctx.clone(), approvals),
            notifier,
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_unknown_face_saved_and_alerted() {
        let h = harness(MockAnalyzer::face(vec![0.5, 0.5]));
        let (mut lp, notifier) = capture_loop(&h, vec![Some((32, 32))]);

        let step = lp.step(Instant::now());

        let Step::Alerting { image_path: Some(path) } = step else {
            panic!("expected alert, got {step:?}");
        };
        assert!(path.starts_with(h.ctx.config.unknown_faces_dir()));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("unknown_") && name.ends_with(".jpg"));
        assert_eq!(image::open(&path).unwrap().width(), 8);

        eventually(|| h.ctx.pending.len() == 1).await;
        assert_eq!(notifier.photos().len(), 1);
        assert_eq!(h.actuator.engagements(), 0);
    }

    #[tokio::test]
    async fn test_known_face_unlocks_once() {
        let h = harness(MockAnalyzer::face(vec![0.9, 0.1]));
        h.ctx.store.add("Alice", Encoding::new(vec![1.0, 0.0])).unwrap();
        let (mut lp, notifier) = capture_loop(&h, vec![Some((32, 32))]);

        assert_eq!(
            lp.step(Instant::now()),
            Step::Unlocking { name: "Alice".into() }
        );

        eventually(|| h.actuator.engagements() == 1).await;
        eventually(|| h.ctx.relay.state() == RelayState::Locked).await;
        assert!(notifier.photos().is_empty());
        assert!(h.ctx.pending.is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_drops_second_cycle() {
        let h = harness(MockAnalyzer::face(vec![1.0, 0.0]));
        h.ctx.store.add("Alice", Encoding::new(vec![1.0, 0.0])).unwrap();
        let frames = vec![Some((32, 32)); 3];
        let (mut lp, _) = capture_loop(&h, frames);
        let t0 = Instant::now();

        assert!(matches!(lp.step(t0), Step::Unlocking { .. }));
        assert_eq!(lp.step(t0 + Duration::from_millis(1999)), Step::Cooldown);
        assert!(matches!(
            lp.step(t0 + Duration::from_secs(2)),
            Step::Unlocking { .. }
        ));

        eventually(|| h.actuator.engagements() == 2).await;
    }

    #[tokio::test]
    async fn test_resident_in_view_does_not_stack_unlocks() {
        let h = harness(MockAnalyzer::face(vec![1.0, 0.0]));
        h.ctx.store.add("Alice", Encoding::new(vec![1.0, 0.0])).unwrap();
        let (mut lp, _) = capture_loop(&h, vec![Some((32, 32)); 2]);

        let hold = tokio::spawn({
            let relay = h.ctx.relay.clone();
            async move { relay.unlock(Duration::from_secs(60)).await }
        });
        eventually(|| h.ctx.relay.state() == RelayState::Unlocked).await;

        let t0 = Instant::now();
        assert_eq!(lp.step(t0), Step::AlreadyUnlocked { name: "Alice".into() });
        assert_eq!(lp.step(t0 + Duration::from_secs(2)), Step::AlreadyUnlocked { name: "Alice".into() });
        assert_eq!(h.actuator.engagements(), 1);

        hold.abort();
        let _ = hold.await;
        assert_eq!(h.ctx.relay.state(), RelayState::Locked);
    }

    #[tokio::test]
    async fn test_no_face_does_not_start_cooldown() {
        let h = harness(MockAnalyzer::no_face());
        let (mut lp, _) = capture_loop(&h, vec![Some((32, 32)); 2]);
        let t0 = Instant::now();

        assert_eq!(lp.step(t0), Step::NoFace);
        assert_eq!(lp.step(t0 + Duration::from_millis(100)), Step::NoFace);
    }

    #[tokio::test]
    async fn test_capture_failures_do_not_start_cooldown() {
        let h = harness(MockAnalyzer::face(vec![1.0]));
        h.ctx.store.add("Bob", Encoding::new(vec![1.0])).unwrap();
        let (mut lp, _) = capture_loop(&h, vec![None, Some((0, 0)), Some((16, 16))]);
        let t0 = Instant::now();

        assert_eq!(lp.step(t0), Step::CaptureFailed);
        assert_eq!(lp.step(t0), Step::CaptureFailed);
        assert_eq!(lp.step(t0), Step::Unlocking { name: "Bob".into() });
    }

    #[tokio::test]
    async fn test_unencodable_face_goes_to_approval() {
        let h = harness(MockAnalyzer::unencodable());
        let (mut lp, _) = capture_loop(&h, vec![Some((32, 32))]);

        assert!(matches!(
            lp.step(Instant::now()),
            Step::Alerting { image_path: Some(_) }
        ));
        eventually(|| h.ctx.pending.len() == 1).await;
    }

    #[tokio::test]
    async fn test_pause_after() {
        let h = harness(MockAnalyzer::no_face());
        let (lp, _) = capture_loop(&h, vec![]);
        assert_eq!(lp.pause_after(&Step::CaptureFailed), Duration::from_secs(1));
        assert_eq!(lp.pause_after(&Step::Cooldown), Duration::from_millis(100));
        assert_eq!(lp.pause_after(&Step::NoFace), Duration::from_millis(500));
        assert_eq!(
            lp.pause_after(&Step::Alerting { image_path: None }),
            Duration::from_secs(2)
        );
    }

    #[tokio::test]
    async fn test_run_stops_when_shutdown_set() {
        let h = harness(MockAnalyzer::no_face());
        let (mut lp, _) = capture_loop(&h, vec![]);
        let shutdown = AtomicBool::new(true);
        lp.run(&shutdown);
    }

    #[test]
    fn test_open_with_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let source = open_with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                match n {
                    0 => Err(CameraError::DeviceBusy),
                    // Opens but the test read fails.
                    1 => Ok(MockFrames::new(vec![None])),
                    _ => Ok(MockFrames::new(vec![Some((4, 4))])),
                }
            },
            3,
            Duration::ZERO,
        );
        assert!(source.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_open_with_retry_exhausts() {
        let calls = AtomicU32::new(0);
        let result = open_with_retry(
            || -> Result<MockFrames, CameraError> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CameraError::DeviceNotFound("/dev/video9".into()))
            },
            CAMERA_OPEN_ATTEMPTS,
            Duration::ZERO,
        );
        assert!(matches!(result, Err(CameraError::DeviceNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_warm_up_discards_frames() {
        let mut frames = MockFrames::new(vec![Some((2, 2)); 3]);
        warm_up(&mut frames, 2);
        assert!(frames.capture().is_ok());
        assert!(frames.capture().is_err());
    }
}
