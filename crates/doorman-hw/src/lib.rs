//! doorman-hw: hardware abstraction for camera capture and lock relay control.
//!
//! Provides V4L2-based camera access and a sysfs GPIO relay with timed,
//! self-relocking unlocks.

pub mod camera;
pub mod frame;
pub mod relay;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use relay::{Actuator, ActuatorError, GpioActuator, Relay, RelayError, RelayState};
