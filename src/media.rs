use std::fmt;

use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::config::CameraConfig;
use crate::error::{DeviceError, DeviceErrorKind, DeviceFailure, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera.
    User,
    /// Rear camera.
    Environment,
}

impl FacingMode {
    pub fn toggled(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

impl fmt::Display for FacingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacingMode::User => write!(f, "user"),
            FacingMode::Environment => write!(f, "environment"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionRange {
    pub ideal: u32,
    pub min: Option<u32>,
}

impl DimensionRange {
    pub fn ideal(ideal: u32) -> Self {
        Self { ideal, min: None }
    }

    pub fn at_least(ideal: u32, min: u32) -> Self {
        Self {
            ideal,
            min: Some(min),
        }
    }
}

/// One entry of the acquisition ladder. `None` fields are unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoConstraints {
    pub facing_mode: Option<FacingMode>,
    pub width: Option<DimensionRange>,
    pub height: Option<DimensionRange>,
}

impl VideoConstraints {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn facing(facing: FacingMode) -> Self {
        Self {
            facing_mode: Some(facing),
            ..Self::default()
        }
    }

    /// Number of constrained fields; hard minimums count on top of the ideal.
    pub fn specificity(&self) -> u8 {
        let mut score = 0;
        if self.facing_mode.is_some() {
            score += 1;
        }
        for range in [self.width, self.height].into_iter().flatten() {
            score += 1;
            if range.min.is_some() {
                score += 1;
            }
        }
        score
    }

    /// Requested resolution, if both axes are constrained.
    pub fn ideal_size(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some((w.ideal, h.ideal)),
            _ => None,
        }
    }

    pub fn min_size(&self) -> Option<(u32, u32)> {
        let width = self.width.and_then(|w| w.min);
        let height = self.height.and_then(|h| h.min);
        match (width, height) {
            (None, None) => None,
            (w, h) => Some((w.unwrap_or(0), h.unwrap_or(0))),
        }
    }
}

impl fmt::Display for VideoConstraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let facing = self
            .facing_mode
            .map(|m| m.to_string())
            .unwrap_or_else(|| "any".to_string());
        match (self.ideal_size(), self.min_size()) {
            (Some((w, h)), Some((mw, mh))) => write!(f, "{facing} {w}x{h} (min {mw}x{mh})"),
            (Some((w, h)), None) => write!(f, "{facing} {w}x{h}"),
            _ => write!(f, "{facing}"),
        }
    }
}

/// Source of camera streams.
///
/// Streams own the hardware until `stop_all` is called or they are dropped.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Whether this environment can provide camera streams at all.
    fn is_supported(&self) -> bool {
        true
    }

    async fn get_user_media(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<Box<dyn MediaStream>, DeviceFailure>;
}

/// A live camera stream attached to a preview surface.
///
/// Implementations release their hardware in `stop_all` and again on drop.
#[async_trait]
pub trait MediaStream: Send {
    fn label(&self) -> String;

    /// Start (or confirm) playback. Fails while no frames are flowing yet.
    async fn play(&mut self) -> Result<(), StreamError>;

    /// Native frame size, when the stream knows it.
    fn video_size(&self) -> Option<(u32, u32)>;

    fn current_frame(&mut self) -> Result<RgbImage, StreamError>;

    fn live_tracks(&self) -> usize;

    fn stop_all(&mut self);
}

/// Constraint sets for `facing`, most specific first.
pub fn constraint_ladder(facing: FacingMode, config: &CameraConfig) -> Vec<VideoConstraints> {
    let mut ladder = vec![
        VideoConstraints {
            facing_mode: Some(facing),
            width: Some(DimensionRange::at_least(config.ideal_width, config.min_width)),
            height: Some(DimensionRange::at_least(config.ideal_height, config.min_height)),
        },
        VideoConstraints {
            facing_mode: Some(facing),
            width: Some(DimensionRange::ideal(config.low_width)),
            height: Some(DimensionRange::ideal(config.low_height)),
        },
        VideoConstraints::facing(facing),
    ];
    if config.allow_opposite_facing {
        ladder.push(VideoConstraints::facing(facing.toggled()));
    }
    ladder.push(VideoConstraints::any());
    ladder
}

/// Request a stream, falling back through the constraint ladder.
///
/// Permission and support failures end the attempt at once. An overconstrained
/// failure jumps straight to the unconstrained set, once. Anything else moves
/// on to the next rung.
pub async fn acquire(
    devices: &dyn MediaDevices,
    facing: FacingMode,
    config: &CameraConfig,
) -> Result<Box<dyn MediaStream>, DeviceError> {
    if !devices.is_supported() {
        log::error!("Camera API not supported in this environment");
        return Err(DeviceError::new(
            DeviceErrorKind::Unsupported,
            "no camera backend available",
        ));
    }

    let ladder = constraint_ladder(facing, config);
    let most_permissive = ladder.len() - 1;
    let mut last_error = None;
    let mut index = 0;

    while index < ladder.len() {
        let constraints = &ladder[index];
        log::debug!("Requesting camera with constraints: {}", constraints);

        match devices.get_user_media(constraints).await {
            Ok(stream) => {
                log::info!("Camera stream obtained ({}) using {}", stream.label(), constraints);
                return Ok(stream);
            }
            Err(failure) => {
                log::warn!(
                    "Failed with constraints {}: {} {}",
                    constraints,
                    failure.name,
                    failure.message
                );
                let error = DeviceError::from(failure);

                if error.kind.is_terminal() {
                    return Err(error);
                }

                if error.kind == DeviceErrorKind::Overconstrained {
                    if index >= most_permissive {
                        return Err(error);
                    }
                    log::info!("Constraints not satisfiable, retrying with any camera");
                    index = most_permissive;
                } else {
                    index += 1;
                }
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        DeviceError::new(
            DeviceErrorKind::Unknown,
            "could not access camera with any configuration",
        )
    }))
}
