use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use image::RgbaImage;
use serde::Serialize;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    Camera,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("could not decode image: {0}")]
    DecodeImage(String),
}

/// A still frame in RGBA8, row-major.
#[derive(Debug)]
pub struct CapturedImage {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    source: ImageSource,
}

impl CapturedImage {
    fn from_rgba(img: RgbaImage, source: ImageSource) -> Self {
        let (width, height) = img.dimensions();
        Self {
            pixels: img.into_raw(),
            width,
            height,
            source,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn source(&self) -> ImageSource {
        self.source
    }
}

pub fn acquire_from_file(bytes: &[u8]) -> Result<CapturedImage, AcquireError> {
    if bytes.is_empty() {
        return Err(AcquireError::DecodeImage("empty input".into()));
    }
    let img = image::load_from_memory(bytes).map_err(|e| AcquireError::DecodeImage(e.to_string()))?;
    let img = CapturedImage::from_rgba(img.to_rgba8(), ImageSource::Upload);
    debug!(width = img.width, height = img.height, "upload decoded");
    Ok(img)
}

pub async fn acquire_from_camera(stream: &mut dyn CameraStream) -> Result<CapturedImage, AcquireError> {
    let frame = stream.capture_frame().await?;
    Ok(CapturedImage::from_rgba(frame, ImageSource::Camera))
}

/// A camera device that can hand out a live stream.
#[async_trait]
pub trait Camera: Send + Sync {
    /// Fails with `CameraUnavailable` when there is no device or access is denied.
    async fn open(&self) -> Result<Box<dyn CameraStream>, AcquireError>;
}

#[async_trait]
pub trait CameraStream: Send {
    async fn capture_frame(&mut self) -> Result<RgbaImage, AcquireError>;

    fn stop(&mut self);
}

/// Owns an open stream and the controller's single camera permit. Dropping
/// the guard stops the stream before the permit is returned.
pub struct StreamGuard {
    stream: Box<dyn CameraStream>,
    _permit: OwnedSemaphorePermit,
}

impl StreamGuard {
    pub fn new(stream: Box<dyn CameraStream>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            stream,
            _permit: permit,
        }
    }

    pub async fn capture(&mut self) -> Result<CapturedImage, AcquireError> {
        acquire_from_camera(self.stream.as_mut()).await
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.stream.stop();
        debug!("camera stream released");
    }
}

/// Camera backed by a snapshot file that an external capture tool keeps
/// refreshed with the latest frame.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCamera {
    path: Option<PathBuf>,
}

impl SnapshotCamera {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Camera for SnapshotCamera {
    async fn open(&self) -> Result<Box<dyn CameraStream>, AcquireError> {
        let Some(path) = self.path.clone() else {
            return Err(AcquireError::CameraUnavailable("no camera device configured".into()));
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Box::new(SnapshotStream { path, stopped: false })),
            Ok(_) => Err(AcquireError::CameraUnavailable(format!(
                "{} is not a frame source",
                path.display()
            ))),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                warn!(path = %path.display(), "camera permission denied");
                Err(AcquireError::CameraUnavailable("permission denied".into()))
            }
            Err(e) => Err(AcquireError::CameraUnavailable(format!(
                "no camera device at {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

struct SnapshotStream {
    path: PathBuf,
    stopped: bool,
}

#[async_trait]
impl CameraStream for SnapshotStream {
    async fn capture_frame(&mut self) -> Result<RgbaImage, AcquireError> {
        if self.stopped {
            return Err(AcquireError::CameraUnavailable("stream stopped".into()));
        }
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| AcquireError::CameraUnavailable(e.to_string()))?;
        let img = image::load_from_memory(&bytes).map_err(|e| AcquireError::DecodeImage(e.to_string()))?;
        Ok(img.to_rgba8())
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

#[cfg(test)]
mod acquire_tests {
    use super::*;
    use crate::scan::decode::testing::barcode_png;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    #[test]
    fn file_upload_decodes_to_rgba() {
        let png = barcode_png("5901234123457");
        let img = acquire_from_file(&png).unwrap();
        assert_eq!(img.source(), ImageSource::Upload);
        assert_eq!(img.pixels().len(), (img.width() * img.height() * 4) as usize);
    }

    #[test]
    fn garbage_and_empty_uploads_fail() {
        assert!(matches!(
            acquire_from_file(b"definitely not an image"),
            Err(AcquireError::DecodeImage(_))
        ));
        assert_eq!(
            acquire_from_file(&[]).unwrap_err(),
            AcquireError::DecodeImage("empty input".into())
        );
    }

    #[tokio::test]
    async fn unconfigured_camera_is_unavailable() {
        let err = SnapshotCamera::default().open().await.err().unwrap();
        assert!(matches!(err, AcquireError::CameraUnavailable(_)));

        let cam = SnapshotCamera::new(Some(PathBuf::from("/no/such/device.png")));
        assert!(matches!(cam.open().await, Err(AcquireError::CameraUnavailable(_))));
    }

    #[tokio::test]
    async fn snapshot_camera_captures_and_stops() {
        let path = std::env::temp_dir().join(format!("nutriscan-frame-{}.png", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, barcode_png("8901234567890")).await.unwrap();

        let cam = SnapshotCamera::new(Some(path.clone()));
        let mut stream = cam.open().await.unwrap();
        let img = acquire_from_camera(stream.as_mut()).await.unwrap();
        assert_eq!(img.source(), ImageSource::Camera);
        assert!(img.width() > 0);

        stream.stop();
        assert!(matches!(
            stream.capture_frame().await,
            Err(AcquireError::CameraUnavailable(_))
        ));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn guard_stops_stream_and_returns_permit() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct Flagged(Arc<AtomicBool>);
        #[async_trait]
        impl CameraStream for Flagged {
            async fn capture_frame(&mut self) -> Result<RgbaImage, AcquireError> {
                Err(AcquireError::CameraUnavailable("unplugged".into()))
            }
            fn stop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let stopped = Arc::new(AtomicBool::new(false));
        let permits = Arc::new(Semaphore::new(1));
        {
            let permit = permits.clone().acquire_owned().await.unwrap();
            let mut guard = StreamGuard::new(Box::new(Flagged(stopped.clone())), permit);
            assert_eq!(permits.available_permits(), 0);
            assert!(guard.capture().await.is_err());
        }
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(permits.available_permits(), 1);
    }
}
