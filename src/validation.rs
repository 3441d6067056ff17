use std::sync::Arc;

use crate::config::ValidationConfig;
use crate::photo::PhotoFile;
use crate::vision::{ImageAnalysis, VisionResponse, VisionService};

/// Reason shown for every content rejection. Kept generic on purpose.
pub const REJECTION_REASON: &str = "Please capture a baby photo with dress for try-on.";
pub const UNABLE_TO_ANALYZE: &str = "Unable to analyze image. Please try again.";
pub const RETRY_REASON: &str = "Failed to validate photo. Please try again.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub reason: Option<String>,
}

impl ValidationResult {
    pub fn accepted() -> Self {
        Self {
            is_valid: true,
            reason: None,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self {
            is_valid: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Which rule turned a photo down. Only logged, never shown.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Unanalyzable,
    UnsafeContent,
    FaceCount(usize),
    NotFrontFacing { pan: f32, tilt: f32, roll: f32 },
    MissingSubject,
    MissingGarment,
    DisallowedLabel(String),
}

#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub require_front_facing: bool,
    pub max_pan_degrees: f32,
    pub max_tilt_degrees: f32,
    pub max_roll_degrees: f32,
    pub subject_labels: Vec<String>,
    pub garment_labels: Vec<String>,
    pub disallowed_labels: Vec<String>,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self::from(&ValidationConfig::default())
    }
}

impl From<&ValidationConfig> for ValidationRules {
    fn from(config: &ValidationConfig) -> Self {
        let lower = |labels: &[String]| -> Vec<String> { labels.iter().map(|l| l.to_lowercase()).collect() };
        Self {
            require_front_facing: config.require_front_facing,
            max_pan_degrees: config.max_pan_degrees,
            max_tilt_degrees: config.max_tilt_degrees,
            max_roll_degrees: config.max_roll_degrees,
            subject_labels: lower(&config.subject_labels),
            garment_labels: lower(&config.garment_labels),
            disallowed_labels: lower(&config.disallowed_labels),
        }
    }
}

impl ValidationRules {
    pub fn evaluate(&self, response: &VisionResponse) -> ValidationResult {
        match self.check(response) {
            Ok(()) => ValidationResult::accepted(),
            Err(Rejection::Unanalyzable) => ValidationResult::rejected(UNABLE_TO_ANALYZE),
            Err(rejection) => {
                log::debug!("Photo rejected: {:?}", rejection);
                ValidationResult::rejected(REJECTION_REASON)
            }
        }
    }

    pub fn check(&self, response: &VisionResponse) -> Result<(), Rejection> {
        let analysis = match response.responses.first() {
            Some(analysis) if analysis.error.is_none() => analysis,
            Some(analysis) => {
                log::warn!("Vision analysis error: {:?}", analysis.error);
                return Err(Rejection::Unanalyzable);
            }
            None => return Err(Rejection::Unanalyzable),
        };

        if let Some(safe) = &analysis.safe_search_annotation {
            if safe.adult.is_likely() || safe.violence.is_likely() || safe.racy.is_likely() {
                return Err(Rejection::UnsafeContent);
            }
        }

        if analysis.face_annotations.len() != 1 {
            return Err(Rejection::FaceCount(analysis.face_annotations.len()));
        }

        if self.require_front_facing {
            let face = &analysis.face_annotations[0];
            let front_facing = face.pan_angle.abs() <= self.max_pan_degrees
                && face.tilt_angle.abs() <= self.max_tilt_degrees
                && face.roll_angle.abs() <= self.max_roll_degrees;
            if !front_facing {
                return Err(Rejection::NotFrontFacing {
                    pan: face.pan_angle,
                    tilt: face.tilt_angle,
                    roll: face.roll_angle,
                });
            }
        }

        let labels = Self::labels(analysis);

        if !Self::contains_any(&labels, &self.subject_labels) {
            return Err(Rejection::MissingSubject);
        }

        if !Self::contains_any(&labels, &self.garment_labels) {
            return Err(Rejection::MissingGarment);
        }

        if let Some(hit) = self
            .disallowed_labels
            .iter()
            .find(|unwanted| labels.iter().any(|label| label.contains(unwanted.as_str())))
        {
            return Err(Rejection::DisallowedLabel(hit.clone()));
        }

        Ok(())
    }

    fn labels(analysis: &ImageAnalysis) -> Vec<String> {
        analysis
            .label_annotations
            .iter()
            .map(|label| label.description.to_lowercase())
            .collect()
    }

    fn contains_any(labels: &[String], indicators: &[String]) -> bool {
        indicators
            .iter()
            .any(|indicator| labels.iter().any(|label| label.contains(indicator.as_str())))
    }
}

/// One-shot photo check against the vision service.
pub struct PhotoValidator {
    service: Arc<dyn VisionService>,
    rules: ValidationRules,
    enabled: bool,
}

impl PhotoValidator {
    pub fn new(service: Arc<dyn VisionService>, rules: ValidationRules) -> Self {
        Self {
            service,
            rules,
            enabled: true,
        }
    }

    pub fn from_config(service: Arc<dyn VisionService>, config: &ValidationConfig) -> Self {
        Self {
            service,
            rules: ValidationRules::from(config),
            enabled: config.enabled,
        }
    }

    pub fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    pub async fn validate(&self, photo: &PhotoFile) -> ValidationResult {
        if !self.enabled {
            log::debug!("Validation disabled, accepting {}", photo.name);
            return ValidationResult::accepted();
        }

        match self.service.annotate(photo).await {
            Ok(response) => {
                let result = self.rules.evaluate(&response);
                log::info!("Validated {}: valid={}", photo.name, result.is_valid);
                result
            }
            Err(crate::error::VisionError::Decode(e)) => {
                log::error!("Photo validation failed: {}", e);
                ValidationResult::rejected(UNABLE_TO_ANALYZE)
            }
            Err(e) => {
                log::error!("Photo validation failed: {}", e);
                ValidationResult::rejected(RETRY_REASON)
            }
        }
    }
}
