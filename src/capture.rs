use std::sync::Arc;

use tokio::sync::watch;

use crate::config::CameraConfig;
use crate::error::CaptureError;
use crate::media::{self, FacingMode, MediaDevices, MediaStream};
use crate::photo::{self, PhotoFile};
use crate::playback::PlaybackGate;
use crate::preview::{PreviewRegistry, PreviewUrl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Starting,
    Active,
    Captured,
    Error,
}

/// A still taken from the camera: a preview handle plus the uploadable file.
#[derive(Debug, Clone)]
pub struct CapturedPhoto {
    pub preview: PreviewUrl,
    pub file: PhotoFile,
}

/// Owns the camera stream from acquisition to snapshot.
pub struct CaptureSession {
    devices: Arc<dyn MediaDevices>,
    previews: PreviewRegistry,
    config: CameraConfig,
    gate: PlaybackGate,
    state: CaptureState,
    facing_mode: FacingMode,
    stream: Option<Box<dyn MediaStream>>,
    preview: Option<PreviewUrl>,
    last_error: Option<String>,
}

impl CaptureSession {
    pub fn new(devices: Arc<dyn MediaDevices>, previews: PreviewRegistry, config: CameraConfig) -> Self {
        Self {
            devices,
            previews,
            gate: PlaybackGate::from_config(&config),
            facing_mode: config.default_facing,
            config,
            state: CaptureState::Idle,
            stream: None,
            preview: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn facing_mode(&self) -> FacingMode {
        self.facing_mode
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn preview(&self) -> Option<&PreviewUrl> {
        self.preview.as_ref()
    }

    pub fn previews(&self) -> &PreviewRegistry {
        &self.previews
    }

    /// Signal that reads `true` while capture is allowed.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.gate.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state == CaptureState::Active && self.gate.is_ready()
    }

    pub fn live_tracks(&self) -> usize {
        self.stream.as_ref().map(|s| s.live_tracks()).unwrap_or(0)
    }

    /// Acquire a stream and wait until it is actually playing.
    pub async fn start(&mut self) -> Result<(), CaptureError> {
        // Never hold two streams
        self.release_stream();
        self.state = CaptureState::Starting;
        self.last_error = None;

        let stream = match media::acquire(self.devices.as_ref(), self.facing_mode, &self.config).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Error accessing camera: {}", e);
                self.fail(e.to_string());
                return Err(e.into());
            }
        };

        let stream = self.stream.insert(stream);
        if let Err(e) = self.gate.wait_ready(stream.as_mut()).await {
            log::error!("{}", e);
            self.release_stream();
            self.fail(e.to_string());
            return Err(e.into());
        }

        self.state = CaptureState::Active;
        log::info!("Camera activated ({}), live preview is ready for capture", self.facing_mode);
        Ok(())
    }

    /// Snapshot the current frame. The stream is released right after.
    pub fn capture(&mut self) -> Result<CapturedPhoto, CaptureError> {
        if !self.is_ready() {
            return Err(CaptureError::NotReady);
        }
        let stream = self.stream.as_mut().ok_or(CaptureError::NotReady)?;

        let frame = stream.current_frame()?;
        let (width, height) = stream
            .video_size()
            .filter(|(w, h)| *w > 0 && *h > 0)
            .unwrap_or((self.config.fallback_width, self.config.fallback_height));
        let still = photo::fit_frame(frame, width, height);
        let bytes = photo::encode_jpeg(&still, self.config.jpeg_quality)?;

        self.release_stream();
        self.revoke_preview();

        let file = PhotoFile::captured(bytes);
        let preview = self.previews.create(file.bytes.clone(), &file.mime_type);
        self.preview = Some(preview.clone());
        self.state = CaptureState::Captured;

        log::info!("Captured {}x{} still ({} bytes)", width, height, file.len());
        Ok(CapturedPhoto { preview, file })
    }

    /// Drop the current still and start the camera again.
    pub async fn retake(&mut self) -> Result<(), CaptureError> {
        self.revoke_preview();
        self.start().await
    }

    /// Flip between front and rear camera. An active stream is fully
    /// released before the other camera is requested.
    pub async fn switch_camera(&mut self) -> Result<(), CaptureError> {
        self.facing_mode = self.facing_mode.toggled();
        log::info!("Switching camera to {}", self.facing_mode);
        if self.state == CaptureState::Active || self.state == CaptureState::Starting {
            self.release_stream();
            self.start().await
        } else {
            Ok(())
        }
    }

    /// Release the camera. Safe from any state.
    pub fn stop(&mut self) {
        self.release_stream();
        if matches!(self.state, CaptureState::Active | CaptureState::Starting) {
            self.state = CaptureState::Idle;
        }
    }

    /// Abandon the capture flow: camera off, preview released, error cleared.
    pub fn cancel(&mut self) {
        self.release_stream();
        self.revoke_preview();
        self.last_error = None;
        self.state = CaptureState::Idle;
    }

    /// Forget a captured still that was not accepted.
    pub fn discard_capture(&mut self) {
        self.revoke_preview();
        if self.state == CaptureState::Captured {
            self.state = CaptureState::Idle;
        }
    }

    fn fail(&mut self, message: String) {
        self.last_error = Some(message);
        self.state = CaptureState::Error;
    }

    fn release_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop_all();
            log::info!("Camera stream stopped ({})", stream.label());
        }
        self.gate.reset();
    }

    fn revoke_preview(&mut self) {
        if let Some(url) = self.preview.take() {
            self.previews.revoke(&url);
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.release_stream();
        self.revoke_preview();
    }
}
