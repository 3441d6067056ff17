use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{DressOption, ObjectStorage, SessionStatus, SessionStore, TryOnSession};
use crate::error::{SessionError, TryOnError};
use crate::notify::{Notice, Notifier};
use crate::observe::SessionObserver;
use crate::photo::PhotoFile;

pub const DEFAULT_FAILURE_MESSAGE: &str = "Try-on failed. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Idle,
    Uploading,
    Pending,
    Processing,
    Completed,
    Failed,
}

impl From<SessionStatus> for SubmissionState {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Pending => SubmissionState::Pending,
            SessionStatus::Processing => SubmissionState::Processing,
            SessionStatus::Completed => SubmissionState::Completed,
            SessionStatus::Failed => SubmissionState::Failed,
        }
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SubmissionState::Idle => "idle",
            SubmissionState::Uploading => "uploading",
            SubmissionState::Pending => "pending",
            SubmissionState::Processing => "processing",
            SubmissionState::Completed => "completed",
            SubmissionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Where the garment image comes from.
#[derive(Debug, Clone)]
pub enum GarmentChoice {
    Catalog(DressOption),
    Url(String),
    Upload(PhotoFile),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TryOnOutcome {
    Completed { session: TryOnSession, result_url: String },
    Failed { session: TryOnSession, message: String },
}

impl TryOnOutcome {
    pub fn session(&self) -> &TryOnSession {
        match self {
            TryOnOutcome::Completed { session, .. } | TryOnOutcome::Failed { session, .. } => session,
        }
    }

    pub fn result_url(&self) -> Option<&str> {
        match self {
            TryOnOutcome::Completed { result_url, .. } => Some(result_url),
            TryOnOutcome::Failed { .. } => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TryOnOutcome::Completed { .. })
    }
}

/// Submits an accepted photo and follows the try-on job to its end.
pub struct TryOnFlow {
    storage: Arc<dyn ObjectStorage>,
    sessions: Arc<dyn SessionStore>,
    observer: Arc<dyn SessionObserver>,
    notifier: Arc<dyn Notifier>,
    state: watch::Sender<SubmissionState>,
}

impl TryOnFlow {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        sessions: Arc<dyn SessionStore>,
        observer: Arc<dyn SessionObserver>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (state, _) = watch::channel(SubmissionState::Idle);
        Self {
            storage,
            sessions,
            observer,
            notifier,
            state,
        }
    }

    pub fn state(&self) -> SubmissionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SubmissionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SubmissionState) {
        log::debug!("Submission state: {}", state);
        self.state.send_replace(state);
    }

    /// Upload `photo` and the garment, open a session and wait for its result.
    pub async fn submit(
        &self,
        photo: &PhotoFile,
        garment: GarmentChoice,
        cancel: &CancellationToken,
    ) -> Result<TryOnOutcome, TryOnError> {
        self.set_state(SubmissionState::Uploading);

        let model_path = format!("uploads/{}-{}", Uuid::new_v4(), photo.name);
        let model_url = match self.storage.upload(&model_path, photo, false).await {
            Ok(url) => url,
            Err(e) => return Err(self.abort("Upload failed", e.into())),
        };

        let dress_url = match garment {
            GarmentChoice::Catalog(dress) => {
                log::info!("Using catalog dress {}", dress.name);
                dress.image_url
            }
            GarmentChoice::Url(url) => url,
            GarmentChoice::Upload(file) => {
                let path = format!("dress-uploads/{}-{}", Uuid::new_v4(), file.name);
                match self.storage.upload(&path, &file, false).await {
                    Ok(url) => url,
                    Err(e) => return Err(self.abort("Upload failed", e.into())),
                }
            }
        };

        let session = match self.sessions.create(&model_url, &dress_url).await {
            Ok(session) => session,
            Err(e) => return Err(self.abort("Error", e.into())),
        };
        self.set_state(session.status.into());
        self.notifier.notify(Notice::info(
            "Processing",
            "Your virtual try-on is being processed. This may take a moment.",
        ));

        let finished = self
            .observer
            .observe(&session.id, cancel, &mut |update: &TryOnSession| {
                self.set_state(update.status.into());
            })
            .await;

        let finished = match finished {
            Ok(finished) => finished,
            Err(SessionError::Cancelled) => {
                self.set_state(SubmissionState::Idle);
                return Err(SessionError::Cancelled.into());
            }
            Err(e) => return Err(self.abort("Error", e.into())),
        };

        Ok(self.conclude(finished))
    }

    fn conclude(&self, session: TryOnSession) -> TryOnOutcome {
        let result_url = session
            .result_image_url
            .clone()
            .filter(|url| !url.trim().is_empty());

        match (session.status, result_url) {
            (SessionStatus::Completed, Some(result_url)) => {
                self.set_state(SubmissionState::Completed);
                self.notifier
                    .notify(Notice::success("Success!", "Your virtual try-on is ready!"));
                TryOnOutcome::Completed { session, result_url }
            }
            _ => {
                if session.status == SessionStatus::Completed {
                    log::warn!("Session {} completed without a result image", session.id);
                }
                let message = session
                    .result_message
                    .clone()
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string());
                self.set_state(SubmissionState::Failed);
                self.notifier.notify(Notice::error("Try-on failed", message.clone()));
                TryOnOutcome::Failed { session, message }
            }
        }
    }

    fn abort(&self, title: &str, error: TryOnError) -> TryOnError {
        log::error!("Try-on submission failed: {}", error);
        self.notifier.notify(Notice::error(title, error.to_string()));
        self.set_state(SubmissionState::Idle);
        error
    }
}
