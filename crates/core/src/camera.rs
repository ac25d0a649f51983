//! Exclusive capture-device access.
//!
//! A [`CameraGuard`] owns an open [`CameraStream`] and releases it exactly once:
//! on [`CameraGuard::release`], or when the guard is dropped on any other path.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("camera stream already released")]
    Released,
}

/// A single still frame. Lives in memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    mime_type: String,
    bytes: Vec<u8>,
}

impl CapturedImage {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Decodes a `data:<mime>;base64,<payload>` URI.
    pub fn from_data_uri(uri: &str) -> Result<Self, CameraError> {
        let rest = uri
            .strip_prefix("data:")
            .ok_or_else(|| CameraError::Capture("not a data URI".to_string()))?;
        let (meta, payload) = rest
            .split_once(',')
            .ok_or_else(|| CameraError::Capture("data URI has no payload".to_string()))?;
        let mime_type = meta
            .strip_suffix(";base64")
            .ok_or_else(|| CameraError::Capture("data URI is not base64 encoded".to_string()))?;
        let bytes = STANDARD
            .decode(payload)
            .map_err(|e| CameraError::Capture(e.to_string()))?;
        Ok(Self::new(mime_type, bytes))
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Base64 body without the data URI prefix.
    pub fn base64_payload(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64_payload())
    }
}

/// Capture device that can be opened for exclusive use.
#[async_trait]
pub trait Camera: Send + Sync {
    async fn open(&self) -> Result<Box<dyn CameraStream>, CameraError>;
}

/// An open device stream. `release` stops every track and must be idempotent.
#[async_trait]
pub trait CameraStream: Send {
    async fn capture(&mut self) -> Result<CapturedImage, CameraError>;
    fn release(&mut self);
}

pub struct CameraGuard {
    stream: Option<Box<dyn CameraStream>>,
}

impl CameraGuard {
    pub async fn acquire<C>(camera: &C) -> Result<Self, CameraError>
    where
        C: Camera + ?Sized,
    {
        let stream = camera.open().await?;
        tracing::debug!("camera stream acquired");
        Ok(Self {
            stream: Some(stream),
        })
    }

    pub async fn capture(&mut self) -> Result<CapturedImage, CameraError> {
        match self.stream.as_mut() {
            Some(stream) => stream.capture().await,
            None => Err(CameraError::Released),
        }
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    pub fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.release();
            tracing::debug!("camera stream released");
        }
    }
}

impl Drop for CameraGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Treats an image file on disk as the camera; used by the CLI.
#[derive(Debug, Clone)]
pub struct FileCamera {
    path: PathBuf,
}

impl FileCamera {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Camera for FileCamera {
    async fn open(&self) -> Result<Box<dyn CameraStream>, CameraError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => CameraError::PermissionDenied,
            _ => CameraError::Unavailable(format!("{}: {e}", self.path.display())),
        })?;
        let mime_type = mime_from_extension(&self.path);
        Ok(Box::new(FileStream {
            image: Some(CapturedImage::new(mime_type, bytes)),
        }))
    }
}

struct FileStream {
    image: Option<CapturedImage>,
}

#[async_trait]
impl CameraStream for FileStream {
    async fn capture(&mut self) -> Result<CapturedImage, CameraError> {
        self.image.clone().ok_or(CameraError::Released)
    }

    fn release(&mut self) {
        self.image = None;
    }
}

fn mime_from_extension(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Camera double counting opens and releases.
    #[derive(Clone, Default)]
    pub struct ScriptedCamera {
        pub deny: bool,
        pub fail_capture: bool,
        pub opened: Arc<AtomicUsize>,
        pub released: Arc<AtomicUsize>,
    }

    impl ScriptedCamera {
        pub fn denied() -> Self {
            Self {
                deny: true,
                ..Self::default()
            }
        }

        pub fn releases(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }

        pub fn opens(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Camera for ScriptedCamera {
        async fn open(&self) -> Result<Box<dyn CameraStream>, CameraError> {
            if self.deny {
                return Err(CameraError::PermissionDenied);
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedStream {
                fail_capture: self.fail_capture,
                released: self.released.clone(),
                live: true,
            }))
        }
    }

    struct ScriptedStream {
        fail_capture: bool,
        released: Arc<AtomicUsize>,
        live: bool,
    }

    #[async_trait]
    impl CameraStream for ScriptedStream {
        async fn capture(&mut self) -> Result<CapturedImage, CameraError> {
            if self.fail_capture {
                return Err(CameraError::Capture("no frame".to_string()));
            }
            Ok(CapturedImage::new("image/jpeg", vec![0xff, 0xd8, 0xff]))
        }

        fn release(&mut self) {
            if self.live {
                self.live = false;
                self.released.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedCamera;
    use super::*;

    #[test]
    fn data_uri_round_trips_mime_and_payload() {
        let image = CapturedImage::new("image/png", vec![1, 2, 3]);
        let uri = image.to_data_uri();
        assert!(uri.starts_with("data:image/png;base64,"));
        let back = CapturedImage::from_data_uri(&uri).expect("decode");
        assert_eq!(back, image);
    }

    #[test]
    fn rejects_plain_text_uri() {
        assert!(CapturedImage::from_data_uri("hello").is_err());
        assert!(CapturedImage::from_data_uri("data:image/png,abc").is_err());
    }

    #[tokio::test]
    async fn guard_releases_once_on_explicit_release_and_drop() {
        let camera = ScriptedCamera::default();
        {
            let mut guard = CameraGuard::acquire(&camera).await.expect("open");
            guard.capture().await.expect("frame");
            guard.release();
            guard.release();
            assert!(!guard.is_active());
        }
        assert_eq!(camera.releases(), 1);
    }

    #[tokio::test]
    async fn guard_releases_on_drop_after_capture_error() {
        let camera = ScriptedCamera {
            fail_capture: true,
            ..ScriptedCamera::default()
        };
        let result = async {
            let mut guard = CameraGuard::acquire(&camera).await?;
            guard.capture().await
        }
        .await;
        assert!(result.is_err());
        assert_eq!(camera.opens(), 1);
        assert_eq!(camera.releases(), 1);
    }

    #[tokio::test]
    async fn capture_after_release_fails() {
        let camera = ScriptedCamera::default();
        let mut guard = CameraGuard::acquire(&camera).await.expect("open");
        guard.release();
        assert!(matches!(guard.capture().await, Err(CameraError::Released)));
    }

    #[tokio::test]
    async fn file_camera_reports_missing_file() {
        let camera = FileCamera::new("/definitely/not/here.jpg");
        let err = CameraGuard::acquire(&camera)
            .await
            .err()
            .expect("missing file must fail");
        assert!(matches!(err, CameraError::Unavailable(_)));
    }

    #[tokio::test]
    async fn file_camera_infers_png() {
        let path = std::env::temp_dir().join(format!(
            "chefquest-camera-{}-{}.png",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, [137u8, 80, 78, 71]).expect("write image");
        let camera = FileCamera::new(&path);
        let mut guard = CameraGuard::acquire(&camera).await.expect("open");
        let image = guard.capture().await.expect("frame");
        assert_eq!(image.mime_type(), "image/png");
        assert_eq!(image.bytes(), &[137u8, 80, 78, 71]);
        drop(guard);
        std::fs::remove_file(&path).expect("cleanup");
    }
}
