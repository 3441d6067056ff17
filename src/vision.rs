use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::ValidationConfig;
use crate::error::VisionError;
use crate::photo::PhotoFile;

/// Categorical rating used by safe-search annotations.
/// Missing or unrecognised ratings read as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Likelihood {
    VeryUnlikely,
    Unlikely,
    Possible,
    Likely,
    VeryLikely,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Likelihood {
    pub fn is_likely(&self) -> bool {
        matches!(self, Likelihood::Likely | Likelihood::VeryLikely)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelAnnotation {
    pub description: String,
    #[serde(default)]
    pub score: f32,
}

/// Face angles are in degrees: pan is yaw, tilt is pitch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FaceAnnotation {
    pub roll_angle: f32,
    pub pan_angle: f32,
    pub tilt_angle: f32,
    pub detection_confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeSearchAnnotation {
    pub adult: Likelihood,
    pub spoof: Likelihood,
    pub medical: Likelihood,
    pub violence: Likelihood,
    pub racy: Likelihood,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiStatus {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageAnalysis {
    pub label_annotations: Vec<LabelAnnotation>,
    pub face_annotations: Vec<FaceAnnotation>,
    pub safe_search_annotation: Option<SafeSearchAnnotation>,
    pub error: Option<ApiStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionResponse {
    pub responses: Vec<ImageAnalysis>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VisionService: Send + Sync {
    async fn annotate(&self, photo: &PhotoFile) -> Result<VisionResponse, VisionError>;
}

/// Client for an `images:annotate` style endpoint.
///
/// The key, when present, goes in a header; it is never part of the URL or the
/// configuration file. Pointing `endpoint` at a server-side proxy removes the
/// need for a key on the client entirely.
pub struct VisionClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl VisionClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Failed to build vision HTTP client ({}), using defaults", e);
                Client::new()
            });
        Self {
            http,
            endpoint: endpoint.into(),
            api_key,
        }
    }

    pub fn from_config(config: &ValidationConfig, api_key: Option<String>) -> Self {
        if api_key.is_none() {
            log::info!("No vision key configured, expecting {} to be a proxy", config.endpoint);
        }
        Self::new(config.endpoint.clone(), api_key, config.request_timeout())
    }

    pub fn request_body(photo: &PhotoFile) -> Value {
        json!({
            "requests": [
                {
                    "image": { "content": photo.to_base64() },
                    "features": [
                        { "type": "LABEL_DETECTION", "maxResults": 20 },
                        { "type": "FACE_DETECTION", "maxResults": 10 },
                        { "type": "SAFE_SEARCH_DETECTION", "maxResults": 1 }
                    ]
                }
            ]
        })
    }

    fn error_details(body: &str) -> String {
        serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or_else(|| body.trim().to_string())
    }
}

#[async_trait]
impl VisionService for VisionClient {
    async fn annotate(&self, photo: &PhotoFile) -> Result<VisionResponse, VisionError> {
        let mut request = self.http.post(&self.endpoint).json(&Self::request_body(photo));
        if let Some(key) = &self.api_key {
            request = request.header("x-goog-api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(VisionError::Status {
                status: status.as_u16(),
                details: Self::error_details(&body),
            });
        }

        let parsed: VisionResponse = serde_json::from_str(&body)?;
        log::debug!("Vision API returned {} analyses", parsed.responses.len());
        Ok(parsed)
    }
}
