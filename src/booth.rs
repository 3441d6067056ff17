use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureSession, CaptureState, CapturedPhoto};
use crate::error::{SessionError, TryOnError};
use crate::flow::{GarmentChoice, TryOnFlow, TryOnOutcome};
use crate::media::FacingMode;
use crate::notify::{Notice, Notifier};
use crate::photo::PhotoFile;
use crate::validation::PhotoValidator;

/// The whole try-on pipeline behind one handle.
///
/// Capture, validation and submission must happen in that order: only a photo
/// the validator accepted can be submitted, and a rejected capture is released
/// straight away so the user can retake. Every step can be cancelled.
pub struct TryOnBooth {
    capture: CaptureSession,
    validator: PhotoValidator,
    flow: TryOnFlow,
    notifier: Arc<dyn Notifier>,
    accepted: Option<PhotoFile>,
}

impl TryOnBooth {
    pub fn new(
        capture: CaptureSession,
        validator: PhotoValidator,
        flow: TryOnFlow,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            capture,
            validator,
            flow,
            notifier,
            accepted: None,
        }
    }

    pub fn capture_session(&mut self) -> &mut CaptureSession {
        &mut self.capture
    }

    pub fn flow(&self) -> &TryOnFlow {
        &self.flow
    }

    pub fn accepted(&self) -> Option<&PhotoFile> {
        self.accepted.as_ref()
    }

    pub async fn switch_camera(&mut self) -> Result<FacingMode, TryOnError> {
        self.capture.switch_camera().await?;
        Ok(self.capture.facing_mode())
    }

    /// Take a still and run it past the validator.
    ///
    /// The camera is started when it is not running yet. A rejected still is
    /// discarded and its reason returned as [`TryOnError::Rejected`]. Cancelling
    /// releases the camera and the preview.
    pub async fn capture_and_validate(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CapturedPhoto, TryOnError> {
        self.accepted = None;
        if self.capture.state() != CaptureState::Active {
            let started = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.capture.start() => Some(result),
            };
            match started {
                None => {
                    self.capture.cancel();
                    return Err(SessionError::Cancelled.into());
                }
                Some(Err(e)) => {
                    self.notifier.notify(Notice::error("Camera Error", e.to_string()));
                    return Err(e.into());
                }
                Some(Ok(())) => {}
            }
        }

        let photo = self.capture.capture()?;
        match self.check(&photo.file, cancel).await {
            Ok(()) => {
                self.notifier
                    .notify(Notice::success("Photo captured", "Photo validated successfully."));
                Ok(photo)
            }
            Err(TryOnError::Session(SessionError::Cancelled)) => {
                self.capture.cancel();
                Err(SessionError::Cancelled.into())
            }
            Err(e) => {
                self.capture.discard_capture();
                Err(e)
            }
        }
    }

    /// Validate a photo that came from a file instead of the camera.
    pub async fn accept_upload(
        &mut self,
        photo: PhotoFile,
        cancel: &CancellationToken,
    ) -> Result<(), TryOnError> {
        self.accepted = None;
        self.check(&photo, cancel).await
    }

    async fn check(&mut self, photo: &PhotoFile, cancel: &CancellationToken) -> Result<(), TryOnError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("Validation of {} cancelled", photo.name);
                return Err(SessionError::Cancelled.into());
            }
            result = self.validator.validate(photo) => result,
        };
        if result.is_valid {
            self.accepted = Some(photo.clone());
            Ok(())
        } else {
            let reason = result.reason.unwrap_or_default();
            self.notifier.notify(Notice::error("Invalid Photo", reason.clone()));
            Err(TryOnError::Rejected(reason))
        }
    }

    /// Submit the last accepted photo with the chosen garment.
    pub async fn submit_accepted(
        &mut self,
        garment: GarmentChoice,
        cancel: &CancellationToken,
    ) -> Result<TryOnOutcome, TryOnError> {
        let photo = self.accepted.take().ok_or(TryOnError::NotValidated)?;
        self.capture.stop();
        self.flow.submit(&photo, garment, cancel).await
    }

    /// Release the camera and any preview.
    pub fn shutdown(&mut self) {
        self.accepted = None;
        self.capture.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockSessionStore, SessionStatus, SessionStore, TryOnSession};
    use crate::config::CameraConfig;
    use crate::flow::SubmissionState;
    use crate::observe::PollingObserver;
    use crate::preview::PreviewRegistry;
    use crate::testing::{analysis, baby_in_dress, face, response_with, session, FakeDevices, RecordingNotifier, StubStorage};
    use crate::error::VisionError;
    use crate::validation::{ValidationRules, REJECTION_REASON};
    use crate::vision::{MockVisionService, VisionResponse, VisionService};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Vision service that never answers.
    struct StalledVision;

    #[async_trait]
    impl VisionService for StalledVision {
        async fn annotate(&self, _photo: &PhotoFile) -> Result<VisionResponse, VisionError> {
            std::future::pending().await
        }
    }

    struct Rig {
        booth: TryOnBooth,
        devices: FakeDevices,
        previews: PreviewRegistry,
        storage: StubStorage,
    }

    fn rig(vision: VisionResponse, store: MockSessionStore) -> Rig {
        let mut service = MockVisionService::new();
        service
            .expect_annotate()
            .returning(move |_| Ok(vision.clone()));
        rig_with(Arc::new(service), store)
    }

    fn rig_with(service: Arc<dyn VisionService>, store: MockSessionStore) -> Rig {
        let devices = FakeDevices::new();
        let previews = PreviewRegistry::new();
        let storage = StubStorage::default();
        let notifier = Arc::new(RecordingNotifier::default());
        let validator = PhotoValidator::new(service, ValidationRules::default());

        let store: Arc<dyn SessionStore> = Arc::new(store);
        let observer = PollingObserver::new(Arc::clone(&store), Duration::from_secs(3), None);
        let flow = TryOnFlow::new(
            Arc::new(storage.clone()),
            store,
            Arc::new(observer),
            notifier.clone(),
        );
        let capture = CaptureSession::new(
            Arc::new(devices.clone()),
            previews.clone(),
            CameraConfig::default(),
        );

        Rig {
            booth: TryOnBooth::new(capture, validator, flow, notifier),
            devices,
            previews,
            storage,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_completed() {
        let mut store = MockSessionStore::new();
        store
            .expect_create()
            .times(1)
            .returning(|model, dress| {
                assert!(model.starts_with("https://cdn.test/uploads/"));
                assert_eq!(dress, "https://x/dress.png");
                Ok(session("s1", SessionStatus::Pending))
            });
        let mut polls = 0;
        store.expect_fetch().times(2).returning(move |id| {
            assert_eq!(id, "s1");
            polls += 1;
            if polls == 1 {
                Ok(session("s1", SessionStatus::Processing))
            } else {
                Ok(TryOnSession {
                    result_image_url: Some("https://x/result.jpg".to_string()),
                    ..session("s1", SessionStatus::Completed)
                })
            }
        });

        let mut rig = rig(baby_in_dress(), store);
        let states = rig.booth.flow().subscribe();

        let photo = rig.booth.capture_and_validate(&CancellationToken::new()).await.unwrap();
        assert_eq!(rig.devices.live_tracks(), 0);
        assert!(rig.previews.is_live(&photo.preview));

        let outcome = rig
            .booth
            .submit_accepted(
                GarmentChoice::Url("https://x/dress.png".to_string()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.result_url(), Some("https://x/result.jpg"));
        assert_eq!(*states.borrow(), SubmissionState::Completed);
        assert_eq!(rig.storage.uploads().len(), 1);
        assert!(rig.booth.accepted().is_none());
    }

    #[tokio::test]
    async fn test_submit_requires_validation() {
        let mut store = MockSessionStore::new();
        store.expect_create().never();
        let mut rig = rig(baby_in_dress(), store);

        let error = rig
            .booth
            .submit_accepted(GarmentChoice::Url("https://x/d.png".into()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, TryOnError::NotValidated));
        assert!(rig.storage.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_capture_is_discarded() {
        let two_faces = response_with(analysis(
            &["Baby", "Dress"],
            vec![face(0.0, 0.0, 0.0), face(0.0, 0.0, 0.0)],
        ));
        let mut store = MockSessionStore::new();
        store.expect_create().never();
        let mut rig = rig(two_faces, store);

        let error = rig.booth.capture_and_validate(&CancellationToken::new()).await.unwrap_err();

        match error {
            TryOnError::Rejected(reason) => assert_eq!(reason, REJECTION_REASON),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(rig.previews.outstanding(), 0);
        assert_eq!(rig.devices.live_tracks(), 0);
        assert!(rig.booth.accepted().is_none());

        let again = rig
            .booth
            .submit_accepted(GarmentChoice::Url("https://x/d.png".into()), &CancellationToken::new())
            .await;
        assert!(matches!(again, Err(TryOnError::NotValidated)));
    }

    #[tokio::test]
    async fn test_camera_failure_is_reported() {
        let mut rig = rig(baby_in_dress(), MockSessionStore::new());
        rig.devices.fail_next("NotAllowedError");

        let error = rig.booth.capture_and_validate(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(error, TryOnError::Capture(_)));
        assert_eq!(rig.devices.attempts().len(), 1);

        rig.booth.shutdown();
        assert_eq!(rig.devices.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uploaded_photo_can_be_submitted_after_acceptance() {
        let mut store = MockSessionStore::new();
        store
            .expect_create()
            .times(1)
            .returning(|model, _| {
                assert!(model.starts_with("https://cdn.test/uploads/"));
                assert!(model.ends_with("-baby.png"));
                Ok(session("s1", SessionStatus::Pending))
            });
        store.expect_fetch().times(1).returning(|_| {
            Ok(TryOnSession {
                result_image_url: Some("https://x/result.jpg".to_string()),
                ..session("s1", SessionStatus::Completed)
            })
        });
        let mut rig = rig(baby_in_dress(), store);
        let upload = PhotoFile::new("baby.png", "image/png", vec![1, 2, 3]);
        let cancel = CancellationToken::new();

        rig.booth.accept_upload(upload.clone(), &cancel).await.unwrap();
        assert_eq!(rig.booth.accepted(), Some(&upload));

        let outcome = rig
            .booth
            .submit_accepted(GarmentChoice::Url("https://x/dress.png".into()), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.result_url(), Some("https://x/result.jpg"));
        assert_eq!(rig.storage.uploads().len(), 1);
        assert_eq!(rig.devices.attempts().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_validation_releases_camera() {
        let mut store = MockSessionStore::new();
        store.expect_create().never();
        let mut rig = rig_with(Arc::new(StalledVision), store);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let error = rig.booth.capture_and_validate(&cancel).await.unwrap_err();

        assert!(matches!(error, TryOnError::Session(SessionError::Cancelled)));
        assert_eq!(rig.devices.live_tracks(), 0);
        assert_eq!(rig.previews.outstanding(), 0);
        assert!(rig.booth.accepted().is_none());
        assert_eq!(rig.booth.capture_session().state(), CaptureState::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_upload_is_not_accepted() {
        let mut rig = rig_with(Arc::new(StalledVision), MockSessionStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let upload = PhotoFile::new("baby.png", "image/png", vec![1, 2, 3]);
        let error = rig.booth.accept_upload(upload, &cancel).await.unwrap_err();

        assert!(matches!(error, TryOnError::Session(SessionError::Cancelled)));
        assert!(rig.booth.accepted().is_none());
    }
}
