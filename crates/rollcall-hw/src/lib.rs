//! rollcall-hw — Capture hardware abstraction.
//!
//! Provides V4L2 camera access, grayscale conversion and frame
//! conditioning, and the [`FrameSource`] trait the daemon captures through.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use source::FrameSource;
