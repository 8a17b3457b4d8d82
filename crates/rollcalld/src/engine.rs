use image::GrayImage;
use rollcall_core::{FaceEncoding, FaceTemplate, MatchError, MatchResult, MatchingEngine};
use rollcall_core::matcher::EncodingExtractionError;
use rollcall_hw::{CameraError, FrameError, FrameSource};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("cannot decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Problems with the caller's input rather than with the daemon.
    pub fn is_bad_input(&self) -> bool {
        matches!(
            self,
            EngineError::Image(_) | EngineError::Match(MatchError::Extraction(_))
        )
    }
}

/// Where a probe image comes from.
pub enum Probe {
    /// Capture from the camera, held or opened for this call.
    Camera,
    /// Encoded image bytes (PNG, JPEG, ...).
    Image(Vec<u8>),
}

/// Opens the capture device. Called each time the engine needs it.
pub type SourceOpener = Box<dyn FnMut() -> Result<Box<dyn FrameSource>, CameraError> + Send>;

#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    /// Frames discarded after the device is opened.
    pub warmup_frames: usize,
    /// Frames captured per camera enrollment.
    pub frames_per_capture: usize,
}

/// Messages sent from D-Bus handlers and sessions to the engine thread.
enum EngineRequest {
    Acquire {
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Release {
        reply: Option<oneshot::Sender<bool>>,
    },
    Enroll {
        probe: Probe,
        reply: oneshot::Sender<Result<FaceEncoding, EngineError>>,
    },
    Detect {
        probe: Probe,
        gallery: Vec<FaceTemplate>,
        reply: oneshot::Sender<Result<Vec<MatchResult>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Open the camera and keep it open until [`release`](Self::release).
    /// Returns false if it was already held.
    pub async fn acquire(&self) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::Acquire { reply }).await
    }

    /// Close a held camera. Returns false if none was held.
    pub async fn release(&self) -> Result<bool, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Release { reply: Some(reply_tx) })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Queue a release without waiting, for use from `Drop`.
    pub fn release_detached(&self) -> bool {
        self.tx.try_send(EngineRequest::Release { reply: None }).is_ok()
    }

    /// Extract an enrollment encoding from a probe with exactly one face.
    pub async fn enroll(&self, probe: Probe) -> Result<FaceEncoding, EngineError> {
        self.call(|reply| EngineRequest::Enroll { probe, reply }).await
    }

    /// Match every face in a probe against `gallery`.
    pub async fn detect(&self, probe: Probe, gallery: Vec<FaceTemplate>) -> Result<Vec<MatchResult>, EngineError> {
        self.call(|reply| EngineRequest::Detect { probe, gallery, reply }).await
    }
}

/// State owned by the engine thread.
struct Engine {
    matcher: MatchingEngine,
    open_source: SourceOpener,
    held: Option<Box<dyn FrameSource>>,
    settings: CaptureSettings,
}

impl Engine {
    fn open(&mut self) -> Result<Box<dyn FrameSource>, EngineError> {
        let mut source = (self.open_source)().map_err(|e| {
            if e.is_unavailable() {
                tracing::warn!(error = %e, "camera unavailable");
                EngineError::CameraUnavailable(e.to_string())
            } else {
                EngineError::Camera(e)
            }
        })?;

        if self.settings.warmup_frames > 0 {
            tracing::debug!(count = self.settings.warmup_frames, "discarding warmup frames");
            for _ in 0..self.settings.warmup_frames {
                let _ = source.next_frame();
            }
        }
        tracing::info!(source = %source.describe(), "camera opened");
        Ok(source)
    }

    fn acquire(&mut self) -> Result<bool, EngineError> {
        if self.held.is_some() {
            return Ok(false);
        }
        self.held = Some(self.open()?);
        Ok(true)
    }

    fn release(&mut self) -> bool {
        match self.held.take() {
            Some(source) => {
                tracing::info!(source = %source.describe(), "camera released");
                true
            }
            None => false,
        }
    }

    /// Capture `count` frames from the held camera, or from one opened and
    /// closed for this call.
    fn capture(&mut self, count: usize) -> Result<Vec<GrayImage>, EngineError> {
        if let Some(source) = self.held.as_mut() {
            return grab_frames(source.as_mut(), count);
        }
        let mut source = self.open()?;
        let images = grab_frames(source.as_mut(), count);
        tracing::debug!(source = %source.describe(), "single-shot capture done; closing camera");
        images
    }

    fn probe_images(&mut self, probe: Probe, count: usize) -> Result<Vec<GrayImage>, EngineError> {
        match probe {
            Probe::Camera => self.capture(count),
            Probe::Image(bytes) => Ok(vec![image::load_from_memory(&bytes)?.to_luma8()]),
        }
    }

    /// Keep the single-face encoding with the most confident detection.
    fn enroll(&mut self, probe: Probe) -> Result<FaceEncoding, EngineError> {
        let images = self.probe_images(probe, self.settings.frames_per_capture)?;

        let mut best: Option<FaceEncoding> = None;
        let mut last_err = None;
        for (i, image) in images.iter().enumerate() {
            match self.matcher.extract_enrollment(image) {
                Ok(encoding) => {
                    let better = best
                        .as_ref()
                        .map_or(true, |b| encoding.region.confidence > b.region.confidence);
                    if better {
                        tracing::debug!(frame = i, confidence = encoding.region.confidence, "enroll: better face");
                        best = Some(encoding);
                    }
                }
                Err(MatchError::Extraction(e)) => {
                    tracing::debug!(frame = i, error = %e, "enroll: frame rejected");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        best.ok_or_else(|| {
            MatchError::Extraction(last_err.unwrap_or(EncodingExtractionError::NoFace)).into()
        })
    }

    fn detect(&mut self, probe: Probe, gallery: &[FaceTemplate]) -> Result<Vec<MatchResult>, EngineError> {
        let images = self.probe_images(probe, 1)?;
        let results = match images.first() {
            Some(image) => self.matcher.detect(image, gallery)?,
            None => Vec::new(),
        };
        tracing::debug!(matches = results.len(), gallery = gallery.len(), "detect finished");
        Ok(results)
    }

    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        tracing::info!("engine thread started");
        while let Some(req) = rx.blocking_recv() {
            match req {
                EngineRequest::Acquire { reply } => {
                    let _ = reply.send(self.acquire());
                }
                EngineRequest::Release { reply } => {
                    let released = self.release();
                    if let Some(reply) = reply {
                        let _ = reply.send(released);
                    }
                }
                EngineRequest::Enroll { probe, reply } => {
                    let _ = reply.send(self.enroll(probe));
                }
                EngineRequest::Detect { probe, gallery, reply } => {
                    let _ = reply.send(self.detect(probe, &gallery));
                }
            }
        }
        self.release();
        tracing::info!("engine thread exiting");
    }
}

/// Dark captures are left out, so a covered lens yields no images rather
/// than an error.
fn grab_frames(source: &mut dyn FrameSource, count: usize) -> Result<Vec<GrayImage>, EngineError> {
    let mut images = Vec::with_capacity(count.max(1));
    for _ in 0..count.max(1) {
        if let Some(frame) = source.next_frame()? {
            images.push(frame.to_image()?);
        }
    }
    if images.is_empty() {
        tracing::debug!("no usable frames; treating probe as faceless");
    }
    Ok(images)
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the matching engine and, while held, the camera. The
/// camera is not opened until a request needs it.
pub fn spawn_engine(
    matcher: MatchingEngine,
    open_source: SourceOpener,
    settings: CaptureSettings,
) -> Result<EngineHandle, EngineError> {
    let (tx, rx) = mpsc::channel::<EngineRequest>(4);
    let engine = Engine {
        matcher,
        open_source,
        held: None,
        settings,
    };

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || engine.run(rx))
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}
