use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::RgbImage;

use crate::error::{DeviceFailure, StreamError};
use crate::media::{FacingMode, MediaDevices, MediaStream, VideoConstraints};
use crate::photo;

const DEFAULT_SIZE: (u32, u32) = (640, 480);

/// Camera stand-in producing a moving test pattern. Used on machines without
/// the Pi camera tools.
#[derive(Debug, Clone, Default)]
pub struct VirtualDevices {
    live: Arc<AtomicUsize>,
}

impl VirtualDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_tracks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for VirtualDevices {
    async fn get_user_media(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<Box<dyn MediaStream>, DeviceFailure> {
        if let Some((min_width, min_height)) = constraints.min_size() {
            let (width, height) = constraints.ideal_size().unwrap_or(DEFAULT_SIZE);
            if width < min_width || height < min_height {
                return Err(DeviceFailure::new(
                    "OverconstrainedError",
                    format!("cannot produce {}x{} frames", min_width, min_height),
                ));
            }
        }

        let size = constraints.ideal_size().unwrap_or(DEFAULT_SIZE);
        let facing = constraints.facing_mode.unwrap_or(FacingMode::User);
        self.live.fetch_add(1, Ordering::SeqCst);
        log::info!("Virtual camera opened ({}, {}x{})", facing, size.0, size.1);

        Ok(Box::new(VirtualStream {
            live: Some(Arc::clone(&self.live)),
            facing,
            size,
            phase: 0,
        }))
    }
}

pub struct VirtualStream {
    live: Option<Arc<AtomicUsize>>,
    facing: FacingMode,
    size: (u32, u32),
    phase: u32,
}

#[async_trait]
impl MediaStream for VirtualStream {
    fn label(&self) -> String {
        format!("virtual camera ({})", self.facing)
    }

    async fn play(&mut self) -> Result<(), StreamError> {
        if self.live.is_none() {
            return Err(StreamError::Stopped);
        }
        Ok(())
    }

    fn video_size(&self) -> Option<(u32, u32)> {
        Some(self.size)
    }

    fn current_frame(&mut self) -> Result<RgbImage, StreamError> {
        if self.live.is_none() {
            return Err(StreamError::Stopped);
        }
        self.phase = self.phase.wrapping_add(7);
        Ok(photo::test_pattern(self.size.0, self.size.1, self.phase))
    }

    fn live_tracks(&self) -> usize {
        usize::from(self.live.is_some())
    }

    fn stop_all(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureSession;
    use crate::config::CameraConfig;
    use crate::preview::PreviewRegistry;

    #[tokio::test]
    async fn test_virtual_capture_uses_ideal_size() {
        let devices = VirtualDevices::new();
        let mut session = CaptureSession::new(
            Arc::new(devices.clone()),
            PreviewRegistry::new(),
            CameraConfig::default(),
        );

        session.start().await.unwrap();
        assert_eq!(devices.live_tracks(), 1);

        let photo = session.capture().unwrap();
        let decoded = image::load_from_memory(&photo.file.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1280, 720));
        assert_eq!(devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_stopped_stream_refuses_frames() {
        let devices = VirtualDevices::new();
        let mut stream = devices
            .get_user_media(&VideoConstraints::any())
            .await
            .ok()
            .unwrap();

        assert_eq!(stream.video_size(), Some(DEFAULT_SIZE));
        stream.stop_all();
        stream.stop_all();
        assert_eq!(devices.live_tracks(), 0);
        assert!(matches!(stream.current_frame(), Err(StreamError::Stopped)));
    }
}
