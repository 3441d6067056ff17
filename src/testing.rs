use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::RgbImage;

use crate::backend::{ObjectStorage, SessionStatus, TryOnSession};
use crate::error::{DeviceFailure, StreamError, UploadError};
use crate::media::{MediaDevices, MediaStream, VideoConstraints};
use crate::notify::{Notice, Notifier};
use crate::photo::{self, PhotoFile};
use crate::vision::{FaceAnnotation, ImageAnalysis, LabelAnnotation, VisionResponse};

struct FakeState {
    supported: bool,
    failures: Mutex<VecDeque<String>>,
    attempts: Mutex<Vec<VideoConstraints>>,
    live: AtomicUsize,
    peak: AtomicUsize,
    blocked_plays: AtomicUsize,
    size: Mutex<Option<(u32, u32)>>,
}

/// Camera backend whose failures are queued up front by the test.
#[derive(Clone)]
pub struct FakeDevices {
    state: Arc<FakeState>,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self::build(true)
    }

    pub fn unsupported() -> Self {
        Self::build(false)
    }

    fn build(supported: bool) -> Self {
        Self {
            state: Arc::new(FakeState {
                supported,
                failures: Mutex::new(VecDeque::new()),
                attempts: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                blocked_plays: AtomicUsize::new(0),
                size: Mutex::new(Some((320, 240))),
            }),
        }
    }

    /// Native frame size reported by streams handed out from now on.
    pub fn with_size(self, size: Option<(u32, u32)>) -> Self {
        *self.state.size.lock().unwrap() = size;
        self
    }

    /// Fail the next request with the given backend error name.
    pub fn fail_next(&self, name: &str) {
        self.state.failures.lock().unwrap().push_back(name.to_string());
    }

    /// Make the next stream refuse `play` this many times.
    pub fn block_playback(&self, failures: usize) {
        self.state.blocked_plays.store(failures, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<VideoConstraints> {
        self.state.attempts.lock().unwrap().clone()
    }

    pub fn live_tracks(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn peak_live_tracks(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    fn is_supported(&self) -> bool {
        self.state.supported
    }

    async fn get_user_media(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<Box<dyn MediaStream>, DeviceFailure> {
        self.state.attempts.lock().unwrap().push(*constraints);

        if let Some(name) = self.state.failures.lock().unwrap().pop_front() {
            return Err(DeviceFailure::new(name, "scripted failure"));
        }

        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(FakeStream {
            state: Arc::clone(&self.state),
            blocked_plays: self.state.blocked_plays.swap(0, Ordering::SeqCst),
            size: *self.state.size.lock().unwrap(),
            live: true,
            frames: 0,
        }))
    }
}

pub struct FakeStream {
    state: Arc<FakeState>,
    blocked_plays: usize,
    size: Option<(u32, u32)>,
    live: bool,
    frames: u32,
}

#[async_trait]
impl MediaStream for FakeStream {
    fn label(&self) -> String {
        "fake camera".to_string()
    }

    async fn play(&mut self) -> Result<(), StreamError> {
        if !self.live {
            return Err(StreamError::Stopped);
        }
        if self.blocked_plays > 0 {
            self.blocked_plays -= 1;
            return Err(StreamError::PlaybackBlocked("no frames yet".to_string()));
        }
        Ok(())
    }

    fn video_size(&self) -> Option<(u32, u32)> {
        self.size
    }

    fn current_frame(&mut self) -> Result<RgbImage, StreamError> {
        if !self.live {
            return Err(StreamError::Stopped);
        }
        self.frames += 1;
        let (width, height) = self.size.unwrap_or((160, 120));
        Ok(photo::test_pattern(width, height, self.frames))
    }

    fn live_tracks(&self) -> usize {
        usize::from(self.live)
    }

    fn stop_all(&mut self) {
        if self.live {
            self.live = false;
            self.state.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Storage that accepts everything and serves it from a fixed CDN host.
#[derive(Clone, Default)]
pub struct StubStorage {
    uploads: Arc<Mutex<Vec<String>>>,
}

impl StubStorage {
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStorage for StubStorage {
    async fn upload(&self, path: &str, _photo: &PhotoFile, _upsert: bool) -> Result<String, UploadError> {
        self.uploads.lock().unwrap().push(path.to_string());
        Ok(format!("https://cdn.test/{}", path))
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    notices: Arc<Mutex<Vec<Notice>>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

pub fn session(id: &str, status: SessionStatus) -> TryOnSession {
    TryOnSession {
        id: id.to_string(),
        user_id: None,
        model_image_url: "https://cdn.test/uploads/model.jpg".to_string(),
        dress_image_url: "https://cdn.test/dress.png".to_string(),
        result_image_url: None,
        result_message: None,
        status,
        created_at: None,
        updated_at: None,
    }
}

/// Face with the given pan, tilt and roll in degrees.
pub fn face(pan: f32, tilt: f32, roll: f32) -> FaceAnnotation {
    FaceAnnotation {
        roll_angle: roll,
        pan_angle: pan,
        tilt_angle: tilt,
        detection_confidence: 0.95,
    }
}

pub fn analysis(labels: &[&str], faces: Vec<FaceAnnotation>) -> ImageAnalysis {
    ImageAnalysis {
        label_annotations: labels
            .iter()
            .map(|description| LabelAnnotation {
                description: description.to_string(),
                score: 0.9,
            })
            .collect(),
        face_annotations: faces,
        safe_search_annotation: None,
        error: None,
    }
}

pub fn response_with(analysis: ImageAnalysis) -> VisionResponse {
    VisionResponse {
        responses: vec![analysis],
    }
}

pub fn baby_in_dress() -> VisionResponse {
    response_with(analysis(&["Baby", "Dress"], vec![face(0.0, 0.0, 0.0)]))
}
