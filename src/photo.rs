use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageBuffer, Rgb, RgbImage};
use std::path::Path;

use crate::config::UploadConfig;
use crate::error::PhotoError;

pub const JPEG_MIME: &str = "image/jpeg";

/// Binary image ready for validation and upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl PhotoFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// A JPEG produced by the camera, named after the capture time.
    pub fn captured(bytes: Vec<u8>) -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        Self::new(format!("camera-capture-{}.jpg", millis), JPEG_MIME, bytes)
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub fn mime_for_extension(extension: &str) -> Option<&'static str> {
    match extension.to_lowercase().as_str() {
        "jpg" | "jpeg" => Some(JPEG_MIME),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

/// Encode an RGB frame as JPEG at `quality` (1-100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut bytes = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
        encoder.encode(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)?;
    }
    Ok(bytes)
}

/// Draw `frame` into a still buffer of exactly `width` x `height`.
pub fn fit_frame(frame: RgbImage, width: u32, height: u32) -> RgbImage {
    if frame.dimensions() == (width, height) {
        return frame;
    }
    log::debug!(
        "Scaling frame from {}x{} to {}x{}",
        frame.width(),
        frame.height(),
        width,
        height
    );
    image::imageops::resize(&frame, width, height, image::imageops::FilterType::Triangle)
}

/// Synthetic frame used when no real camera is present.
pub fn test_pattern(width: u32, height: u32, phase: u32) -> RgbImage {
    let width = width.max(1);
    let height = height.max(1);
    ImageBuffer::from_fn(width, height, |x, y| {
        let r = (x * 255 / width) as u8;
        let g = (y * 255 / height) as u8;
        let b = ((x + y) * 255 / (width + height)) as u8;
        Rgb([r.wrapping_add(phase as u8), g, b])
    })
}

/// Checks uploaded photo files before they enter the try-on flow.
pub struct PhotoLoader {
    supported_formats: Vec<String>,
    max_bytes: u64,
}

impl PhotoLoader {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            supported_formats: config
                .accepted_extensions
                .iter()
                .map(|ext| ext.to_lowercase())
                .collect(),
            max_bytes: config.max_file_bytes,
        }
    }

    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<PhotoFile, PhotoError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(PhotoError::NotFound(path.display().to_string()));
        }

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .ok_or_else(|| PhotoError::UnsupportedFormat("no file extension".to_string()))?;
        if !self.supported_formats.contains(&extension) {
            return Err(PhotoError::UnsupportedFormat(extension));
        }
        let mime_type = mime_for_extension(&extension)
            .ok_or_else(|| PhotoError::UnsupportedFormat(extension.clone()))?;

        let size = std::fs::metadata(path)?.len();
        if size > self.max_bytes {
            return Err(PhotoError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }

        let bytes = std::fs::read(path)?;
        // Reject files that only look like images
        let decoded = image::load_from_memory(&bytes)?;
        log::debug!(
            "Loaded photo {}: {}x{}, {} bytes",
            path.display(),
            decoded.width(),
            decoded.height(),
            size
        );

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("upload.{}", extension));
        Ok(PhotoFile::new(name, mime_type, bytes))
    }

    pub fn supported_formats(&self) -> &[String] {
        &self.supported_formats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_encode_jpeg_decodes_back() {
        let frame = test_pattern(64, 48, 0);
        let bytes = encode_jpeg(&frame, 90).unwrap();

        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn test_fit_frame_resizes_only_when_needed() {
        let frame = test_pattern(320, 240, 0);
        let same = fit_frame(frame.clone(), 320, 240);
        assert_eq!(same, frame);

        let scaled = fit_frame(frame, 640, 480);
        assert_eq!(scaled.dimensions(), (640, 480));
    }

    #[test]
    fn test_captured_file_naming() {
        let file = PhotoFile::captured(vec![1, 2, 3]);
        assert!(file.name.starts_with("camera-capture-"));
        assert!(file.name.ends_with(".jpg"));
        assert_eq!(file.mime_type, JPEG_MIME);
        assert_eq!(file.to_base64(), "AQID");
    }

    #[test]
    fn test_loader_accepts_real_image() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("baby.png");
        test_pattern(32, 32, 0).save(&path).unwrap();

        let loader = PhotoLoader::new(&UploadConfig::default());
        let file = loader.load(&path).unwrap();

        assert_eq!(file.name, "baby.png");
        assert_eq!(file.mime_type, "image/png");
        assert!(!file.is_empty());
    }

    #[test]
    fn test_loader_rejects_bad_files() {
        let temp_dir = TempDir::new().unwrap();
        let loader = PhotoLoader::new(&UploadConfig::default());

        assert!(matches!(
            loader.load(temp_dir.path().join("missing.jpg")),
            Err(PhotoError::NotFound(_))
        ));

        let text = temp_dir.path().join("notes.txt");
        std::fs::write(&text, "hello").unwrap();
        assert!(matches!(loader.load(&text), Err(PhotoError::UnsupportedFormat(_))));

        let fake = temp_dir.path().join("fake.jpg");
        std::fs::write(&fake, "not really a jpeg").unwrap();
        assert!(matches!(loader.load(&fake), Err(PhotoError::Decode(_))));
    }

    #[test]
    fn test_loader_enforces_size_limit() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("big.png");
        test_pattern(64, 64, 0).save(&path).unwrap();

        let loader = PhotoLoader::new(&UploadConfig {
            max_file_bytes: 16,
            ..Default::default()
        });
        assert!(matches!(loader.load(&path), Err(PhotoError::TooLarge { .. })));
    }
}
