use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;

use crate::config::CameraConfig;
use crate::error::PlaybackError;
use crate::media::MediaStream;

/// Confirms frames are flowing before capture is allowed.
///
/// Playback can fail silently right after a stream is attached, so `play` is
/// retried on a linear schedule (`base_delay * attempt`). The outcome is
/// published on a `watch` channel that gates the capture control.
pub struct PlaybackGate {
    retries: u32,
    base_delay: Duration,
    ready: watch::Sender<bool>,
}

impl PlaybackGate {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            retries,
            base_delay,
            ready,
        }
    }

    pub fn from_config(config: &CameraConfig) -> Self {
        Self::new(
            config.playback_retries,
            Duration::from_millis(config.playback_backoff_ms),
        )
    }

    /// Delays slept before each retry, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.retries).map(|attempt| self.base_delay * attempt).collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn reset(&self) {
        self.ready.send_replace(false);
    }

    pub async fn wait_ready(&self, stream: &mut dyn MediaStream) -> Result<(), PlaybackError> {
        self.reset();

        let mut last = match stream.play().await {
            Ok(()) => {
                log::info!("Camera preview started successfully");
                self.ready.send_replace(true);
                return Ok(());
            }
            Err(e) => {
                log::warn!("Error playing video: {}", e);
                e
            }
        };

        for (attempt, delay) in self.schedule().into_iter().enumerate() {
            sleep(delay).await;
            match stream.play().await {
                Ok(()) => {
                    log::info!("Video playing on retry attempt {}", attempt + 1);
                    self.ready.send_replace(true);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Retry {} failed: {}", attempt + 1, e);
                    last = e;
                }
            }
        }

        Err(PlaybackError {
            attempts: self.retries + 1,
            last: last.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaDevices, VideoConstraints};
    use crate::testing::FakeDevices;
    use tokio::time::Instant;

    async fn stream_blocked_for(failures: usize) -> Box<dyn MediaStream> {
        let devices = FakeDevices::new();
        devices.block_playback(failures);
        devices
            .get_user_media(&VideoConstraints::any())
            .await
            .ok()
            .unwrap()
    }

    #[test]
    fn test_linear_schedule() {
        let gate = PlaybackGate::new(3, Duration::from_millis(200));
        assert_eq!(
            gate.schedule(),
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(600)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_first_play() {
        let gate = PlaybackGate::new(3, Duration::from_millis(200));
        let mut stream = stream_blocked_for(0).await;
        let start = Instant::now();

        gate.wait_ready(stream.as_mut()).await.unwrap();

        assert!(gate.is_ready());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_backoff() {
        let gate = PlaybackGate::new(3, Duration::from_millis(200));
        let ready = gate.subscribe();
        let mut stream = stream_blocked_for(2).await;
        let start = Instant::now();

        gate.wait_ready(stream.as_mut()).await.unwrap();

        // 200ms + 400ms before the third play call
        assert_eq!(start.elapsed(), Duration::from_millis(600));
        assert!(*ready.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retries() {
        let gate = PlaybackGate::new(3, Duration::from_millis(200));
        let mut stream = stream_blocked_for(10).await;
        let start = Instant::now();

        let error = gate.wait_ready(stream.as_mut()).await.unwrap_err();

        assert_eq!(error.attempts, 4);
        assert_eq!(start.elapsed(), Duration::from_millis(1200));
        assert!(!gate.is_ready());
    }

    #[tokio::test]
    async fn test_reset_clears_signal() {
        let gate = PlaybackGate::new(0, Duration::from_millis(1));
        let mut stream = stream_blocked_for(0).await;
        gate.wait_ready(stream.as_mut()).await.unwrap();
        assert!(gate.is_ready());

        gate.reset();
        assert!(!gate.is_ready());
    }
}
