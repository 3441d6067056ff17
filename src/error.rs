use std::time::Duration;

use thiserror::Error;

/// Closed set of reasons a camera request can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorKind {
    PermissionDenied,
    NoDevice,
    Unsupported,
    Overconstrained,
    Unknown,
}

impl DeviceErrorKind {
    /// Map the failure name reported by a media backend onto a kind.
    ///
    /// Backends report the same names a browser would (`NotAllowedError`,
    /// `NotFoundError`, ...) so the mapping lives in exactly one place.
    pub fn classify(name: &str) -> Self {
        match name {
            "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => {
                DeviceErrorKind::PermissionDenied
            }
            "NotFoundError" | "DevicesNotFoundError" => DeviceErrorKind::NoDevice,
            "NotSupportedError" | "TypeError" => DeviceErrorKind::Unsupported,
            "OverconstrainedError" | "ConstraintNotSatisfiedError" => {
                DeviceErrorKind::Overconstrained
            }
            _ => DeviceErrorKind::Unknown,
        }
    }

    /// Whether acquisition should give up immediately on this kind.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceErrorKind::PermissionDenied | DeviceErrorKind::Unsupported)
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            DeviceErrorKind::PermissionDenied => {
                "Camera access denied. Please allow camera permissions and try again."
            }
            DeviceErrorKind::NoDevice => "No camera found. Please connect a camera and try again.",
            DeviceErrorKind::Unsupported => "Camera not supported on this system.",
            DeviceErrorKind::Overconstrained => {
                "Camera settings not supported, even with basic camera access."
            }
            DeviceErrorKind::Unknown => "Failed to access camera. Check permissions and try again.",
        }
    }
}

/// Raw failure as reported by a media backend, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFailure {
    pub name: String,
    pub message: String,
}

impl DeviceFailure {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{} ({detail})", .kind.user_message())]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub detail: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<DeviceFailure> for DeviceError {
    fn from(failure: DeviceFailure) -> Self {
        DeviceError::new(DeviceErrorKind::classify(&failure.name), failure.message)
    }
}

/// Errors raised by an attached stream while playing or grabbing frames.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Playback blocked: {0}")]
    PlaybackBlocked(String),

    #[error("No frame available: {0}")]
    NoFrame(String),

    #[error("Stream stopped")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Error)]
#[error("Camera preview did not start after {attempts} attempts: {last}")]
pub struct PlaybackError {
    pub attempts: u32,
    pub last: String,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error("Camera is not ready for capture")]
    NotReady,

    #[error("Failed to read video frame: {0}")]
    Frame(#[from] StreamError),

    #[error("Failed to encode captured image: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Error)]
pub enum PhotoError {
    #[error("Image file not found: {0}")]
    NotFound(String),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Image too large: {size} bytes (max: {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("Vision API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Vision API request failed: {status} {details}")]
    Status { status: u16, details: String },

    #[error("Unexpected Vision API response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Failed to upload image: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to upload image: {status} {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Session request rejected: {status} {message}")]
    Rejected { status: u16, message: String },

    #[error("Unexpected session payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Change feed error: {0}")]
    Feed(String),

    #[error("Session did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Observation cancelled")]
    Cancelled,
}

/// Umbrella error for one try-on attempt.
#[derive(Debug, Error)]
pub enum TryOnError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Photo(#[from] PhotoError),

    #[error("{0}")]
    Rejected(String),

    #[error("No validated photo to submit")]
    NotValidated,

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_names() {
        assert_eq!(DeviceErrorKind::classify("NotAllowedError"), DeviceErrorKind::PermissionDenied);
        assert_eq!(DeviceErrorKind::classify("SecurityError"), DeviceErrorKind::PermissionDenied);
        assert_eq!(DeviceErrorKind::classify("NotFoundError"), DeviceErrorKind::NoDevice);
        assert_eq!(DeviceErrorKind::classify("NotSupportedError"), DeviceErrorKind::Unsupported);
        assert_eq!(
            DeviceErrorKind::classify("OverconstrainedError"),
            DeviceErrorKind::Overconstrained
        );
        assert_eq!(DeviceErrorKind::classify("AbortError"), DeviceErrorKind::Unknown);
        assert_eq!(DeviceErrorKind::classify(""), DeviceErrorKind::Unknown);
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(DeviceErrorKind::PermissionDenied.is_terminal());
        assert!(DeviceErrorKind::Unsupported.is_terminal());
        assert!(!DeviceErrorKind::Overconstrained.is_terminal());
        assert!(!DeviceErrorKind::NoDevice.is_terminal());
        assert!(!DeviceErrorKind::Unknown.is_terminal());
    }

    #[test]
    fn test_failure_conversion() {
        let error: DeviceError = DeviceFailure::new("NotFoundError", "no /dev/video0").into();
        assert_eq!(error.kind, DeviceErrorKind::NoDevice);
        assert!(error.to_string().contains("No camera found"));
        assert!(error.to_string().contains("no /dev/video0"));
    }
}
