use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::capture::{save_jpeg, ScreenCapture};
use crate::db::Database;
use crate::error::Result;
use crate::models::Screenshot;

const POLL_SLICE: Duration = Duration::from_millis(100);

/// Cancellation handle shared between the capture loop and whoever stops it.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    cancelled: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation. Returns `true` only for the call that actually
    /// flipped the token; later calls are no-ops and never block.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

pub struct CaptureScheduler {
    interval: Duration,
    running: AtomicBool,
    token: StopToken,
}

impl CaptureScheduler {
    pub fn new(interval: Duration, token: StopToken) -> Self {
        Self {
            interval,
            running: AtomicBool::new(false),
            token,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests the running loop to finish. Does nothing when no loop runs.
    pub fn stop(&self) {
        if self.is_running() && self.token.cancel() {
            info!("capture loop stop requested");
        }
    }

    /// Runs `on_tick` immediately and then once per interval until the token
    /// is cancelled. Tick failures are logged and counted, never fatal.
    pub fn run<F>(&self, mut on_tick: F) -> TickStats
    where
        F: FnMut() -> Result<()>,
    {
        let mut stats = TickStats::default();
        if self.token.is_cancelled() {
            return stats;
        }

        self.running.store(true, Ordering::SeqCst);
        info!(interval_secs = self.interval.as_secs(), "capture loop started");

        let mut next_tick = Instant::now();
        while !self.token.is_cancelled() {
            stats.attempted += 1;
            match on_tick() {
                Ok(()) => stats.succeeded += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(error = %e, "capture tick failed");
                }
            }

            next_tick += self.interval;
            if !self.wait_until(next_tick) {
                break;
            }
            // A tick that overran the interval should not trigger a burst.
            let now = Instant::now();
            if next_tick < now {
                next_tick = now;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(
            attempted = stats.attempted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "capture loop finished"
        );
        stats
    }

    /// Sleeps until `deadline` in short slices. Returns `false` if cancelled.
    fn wait_until(&self, deadline: Instant) -> bool {
        loop {
            if self.token.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(POLL_SLICE));
        }
    }
}

pub fn screenshot_file_name() -> String {
    format!("screenshot_{}.jpg", Utc::now().format("%Y%m%d_%H%M%S_%3f"))
}

/// One capture: acquire a frame, write it into `session_dir`, then record it.
/// The record step is skipped when the frame could not be written.
pub fn capture_tick(
    store: &Database,
    capture: &dyn ScreenCapture,
    session_id: i64,
    session_dir: &Path,
    jpeg_quality: u8,
) -> Result<Screenshot> {
    let frame = capture.capture_frame()?;

    let path: PathBuf = session_dir.join(screenshot_file_name());
    save_jpeg(&frame, &path, jpeg_quality)?;

    let screenshot = store.record_screenshot(session_id, &path)?;
    info!(
        session_id,
        file = %path.file_name().unwrap_or_default().to_string_lossy(),
        "screenshot saved"
    );
    Ok(screenshot)
}
