//! Hardware- and model-free stand-ins for daemon tests.

use crate::engine::SourceOpener;
use chrono::Utc;
use image::GrayImage;
use rollcall_core::{BoundingBox, EncoderError, Embedding, FaceEncoder, FaceEncoding, FaceTemplate};
use rollcall_hw::{CameraError, Frame, FrameSource};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Returns the same faces for every image.
pub struct StubEncoder {
    faces: Vec<FaceEncoding>,
    delay: Duration,
}

impl StubEncoder {
    /// Faces are laid out side by side so no two regions overlap.
    pub fn faces(mut faces: Vec<FaceEncoding>) -> Self {
        for (i, face) in faces.iter_mut().enumerate() {
            face.region.x = i as f32 * 100.0;
        }
        Self { faces, delay: Duration::ZERO }
    }

    /// Make every encode take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl FaceEncoder for StubEncoder {
    fn encode(&mut self, _image: &GrayImage) -> Result<Vec<FaceEncoding>, EncoderError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(self.faces.clone())
    }
}

pub fn face(values: &[f32], confidence: f32) -> FaceEncoding {
    FaceEncoding {
        region: BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 50.0,
            height: 50.0,
            confidence,
            landmarks: None,
        },
        embedding: Embedding::new(values.to_vec()),
    }
}

pub fn gallery_of(entries: &[(&str, &[f32])]) -> Vec<FaceTemplate> {
    entries
        .iter()
        .map(|(id, values)| FaceTemplate {
            user_id: id.to_string(),
            user_name: format!("user {id}"),
            encoding: Embedding::new(values.to_vec()),
            registered_at: Utc::now(),
        })
        .collect()
}

pub fn png_bytes() -> Vec<u8> {
    let img = GrayImage::from_pixel(8, 8, image::Luma([128]));
    let mut buf = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut buf, image::ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

#[derive(Default)]
struct CameraState {
    unavailable: AtomicBool,
    fail_capture: AtomicBool,
    dark: AtomicBool,
    opened: AtomicUsize,
    open_now: AtomicUsize,
    frames: AtomicUsize,
}

/// A camera whose open/close and capture activity can be observed.
#[derive(Clone, Default)]
pub struct FakeCamera {
    state: Arc<CameraState>,
}

impl FakeCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opener(&self) -> SourceOpener {
        let state = Arc::clone(&self.state);
        Box::new(move || {
            if state.unavailable.load(Ordering::SeqCst) {
                return Err(CameraError::DeviceBusy);
            }
            state.opened.fetch_add(1, Ordering::SeqCst);
            state.open_now.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSource { state: Arc::clone(&state) }) as Box<dyn FrameSource>)
        })
    }

    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_fail_capture(&self, fail: bool) {
        self.state.fail_capture.store(fail, Ordering::SeqCst);
    }

    /// Every capture comes back too dark to use.
    pub fn set_dark(&self, dark: bool) {
        self.state.dark.store(dark, Ordering::SeqCst);
    }

    /// Times the device has been opened.
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Sources currently alive.
    pub fn open_now(&self) -> usize {
        self.state.open_now.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> usize {
        self.state.frames.load(Ordering::SeqCst)
    }
}

struct FakeSource {
    state: Arc<CameraState>,
}

impl FrameSource for FakeSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.state.fail_capture.load(Ordering::SeqCst) {
            return Err(CameraError::CaptureFailed("unplugged".into()));
        }
        let sequence = self.state.frames.fetch_add(1, Ordering::SeqCst) as u32;
        if self.state.dark.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(Frame {
            data: vec![128; 16],
            width: 4,
            height: 4,
            timestamp: std::time::Instant::now(),
            sequence,
        }))
    }

    fn describe(&self) -> String {
        "fake camera".to_string()
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.state.open_now.fetch_sub(1, Ordering::SeqCst);
    }
}
