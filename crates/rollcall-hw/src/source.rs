//! The seam between capture hardware and the recognition engine.

use crate::camera::CameraError;
use crate::frame::Frame;

/// Anything that yields grayscale frames on demand.
///
/// A source is an exclusive resource: whoever holds it owns the device,
/// and dropping it releases the device.
pub trait FrameSource: Send {
    /// The next usable frame, or `None` when the scene was too dark to
    /// yield one. Darkness is not a device failure.
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;

    /// Human-readable identity for logs.
    fn describe(&self) -> String;
}
