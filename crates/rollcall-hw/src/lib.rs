//! rollcall-hw: Camera capture for the attendance tracker.
//!
//! Provides V4L2-based camera access yielding grayscale frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo};
pub use frame::{Frame, FrameError, PixelFormat};
