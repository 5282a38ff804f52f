//! Door lock relay: sysfs GPIO actuation and the timed unlock wrapper.
//!
//! The relay is Locked whenever no unlock hold is in progress. Every unlock
//! returns to Locked on all exit paths, including task cancellation during
//! the hold.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// Polls for the exported pin directory (udev may lag behind the export write).
const EXPORT_POLL_ATTEMPTS: u32 = 20;
const EXPORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Locked,
    Unlocked,
}

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("GPIO write to {path} failed: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("GPIO pin {0} did not appear after export")]
    ExportTimeout(u32),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("actuation failed: {0}")]
    Actuation(#[from] ActuatorError),
    #[error("relay has been shut down")]
    ShutDown,
}

/// Physical lock actuator.
pub trait Actuator: Send + Sync {
    /// Drive the lock open.
    fn engage(&self) -> Result<(), ActuatorError>;
    /// Drive the lock closed.
    fn release(&self) -> Result<(), ActuatorError>;
    /// Release hardware resources.
    fn shutdown(&self) -> Result<(), ActuatorError>;
}

/// Relay driven through the sysfs GPIO interface.
pub struct GpioActuator {
    root: PathBuf,
    pin: u32,
    active_low: bool,
}

impl GpioActuator {
    /// Export `pin` and configure it as an output already at the locked level.
    pub fn open(pin: u32, active_low: bool) -> Result<Self, ActuatorError> {
        Self::with_root(SYSFS_GPIO_ROOT, pin, active_low)
    }

    pub fn with_root(
        root: impl Into<PathBuf>,
        pin: u32,
        active_low: bool,
    ) -> Result<Self, ActuatorError> {
        let actuator = Self {
            root: root.into(),
            pin,
            active_low,
        };

        if !actuator.pin_dir().exists() {
            write_sysfs(&actuator.root.join("export"), &pin.to_string())?;
            actuator.wait_for_export()?;
        }

        // "high"/"low" sets direction and initial level in one write, so the
        // line never glitches to the unlocked level.
        let direction = if actuator.locked_level() == "1" { "high" } else { "low" };
        write_sysfs(&actuator.pin_dir().join("direction"), direction)?;

        tracing::info!(pin, active_low, "GPIO relay configured");
        Ok(actuator)
    }

    fn pin_dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.pin))
    }

    fn wait_for_export(&self) -> Result<(), ActuatorError> {
        for _ in 0..EXPORT_POLL_ATTEMPTS {
            if self.pin_dir().exists() {
                return Ok(());
            }
            std::thread::sleep(EXPORT_POLL_INTERVAL);
        }
        Err(ActuatorError::ExportTimeout(self.pin))
    }

    /// Active-low relays unlock on a low line.
    fn locked_level(&self) -> &'static str {
        if self.active_low { "1" } else { "0" }
    }

    fn unlocked_level(&self) -> &'static str {
        if self.active_low { "0" } else { "1" }
    }
}

impl Actuator for GpioActuator {
    fn engage(&self) -> Result<(), ActuatorError> {
        write_sysfs(&self.pin_dir().join("value"), self.unlocked_level())
    }

    fn release(&self) -> Result<(), ActuatorError> {
        write_sysfs(&self.pin_dir().join("value"), self.locked_level())
    }

    fn shutdown(&self) -> Result<(), ActuatorError> {
        if !self.pin_dir().exists() {
            return Ok(());
        }
        write_sysfs(&self.root.join("unexport"), &self.pin.to_string())
    }
}

fn write_sysfs(path: &Path, value: &str) -> Result<(), ActuatorError> {
    std::fs::write(path, value).map_err(|source| ActuatorError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Line state plus the shutdown flag. Every actuator write happens while
/// this is locked, so cleanup can never interleave with an unlock.
struct Line {
    state: RelayState,
    closed: bool,
}

/// Timed unlock with guaranteed relock.
pub struct Relay {
    actuator: Arc<dyn Actuator>,
    line: Mutex<Line>,
    hold: tokio::sync::Mutex<()>,
}

impl Relay {
    /// Wrap `actuator`, driving it to Locked first.
    pub fn new(actuator: Arc<dyn Actuator>) -> Result<Self, RelayError> {
        actuator.release()?;
        Ok(Self {
            actuator,
            line: Mutex::new(Line {
                state: RelayState::Locked,
                closed: false,
            }),
            hold: tokio::sync::Mutex::new(()),
        })
    }

    pub fn state(&self) -> RelayState {
        self.line().state
    }

    /// Unlock for `hold`, then relock.
    ///
    /// Overlapping calls queue behind the one in progress. If the future is
    /// dropped during the hold the relay relocks on drop.
    pub async fn unlock(&self, hold: Duration) -> Result<(), RelayError> {
        let _serial = self.hold.lock().await;

        let guard = RelockGuard {
            relay: self,
            armed: true,
        };
        // On failure the guard relocks as it drops.
        self.engage()?;
        tracing::info!(hold_secs = hold.as_secs_f32(), "door unlocked");

        tokio::time::sleep(hold).await;

        guard.finish()?;
        tracing::info!("door locked");
        Ok(())
    }

    /// Force Locked and release hardware. Safe to call repeatedly.
    ///
    /// Blocks until any in-flight actuator write has finished.
    pub fn cleanup(&self) {
        let mut line = self.line();
        if line.closed {
            return;
        }
        line.closed = true;
        if let Err(e) = self.force_locked(&mut line) {
            tracing::error!(error = %e, "failed to lock relay during cleanup");
        }
        if let Err(e) = self.actuator.shutdown() {
            tracing::warn!(error = %e, "failed to release relay hardware");
        }
        tracing::info!("relay cleaned up");
    }

    fn engage(&self) -> Result<(), RelayError> {
        let mut line = self.line();
        if line.closed {
            return Err(RelayError::ShutDown);
        }
        self.actuator.engage()?;
        line.state = RelayState::Unlocked;
        Ok(())
    }

    /// Relock unless cleanup already locked and released the hardware.
    fn relock(&self) -> Result<(), ActuatorError> {
        let mut line = self.line();
        if line.closed {
            return Ok(());
        }
        self.force_locked(&mut line)
    }

    /// Report Locked even if the write failed; the caller logs the error.
    fn force_locked(&self, line: &mut Line) -> Result<(), ActuatorError> {
        let result = self.actuator.release();
        line.state = RelayState::Locked;
        result
    }

    fn line(&self) -> MutexGuard<'_, Line> {
        self.line.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct RelockGuard<'a> {
    relay: &'a Relay,
    armed: bool,
}

impl RelockGuard<'_> {
    fn finish(mut self) -> Result<(), ActuatorError> {
        self.armed = false;
        self.relay.relock()
    }
}

impl Drop for RelockGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.relay.relock() {
                tracing::error!(error = %e, "failed to relock after interrupted unlock");
            }
        }
    }
}
