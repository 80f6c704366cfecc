//! rollcall-hw — Hardware abstraction for camera capture and the motor trigger.
//!
//! Provides V4L2-based colour camera access and a serial-port trigger for
//! the Arduino-driven motor fired at session start.

pub mod camera;
pub mod frame;
pub mod trigger;

pub use camera::{Camera, CameraError, FrameStream, PixelFormat};
pub use frame::Frame;
pub use trigger::{MotorTrigger, TriggerError};
