use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::config::BackendConfig;
use crate::error::{SessionError, UploadError};
use crate::photo::PhotoFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

/// One try-on job. Created here as `pending`; every later transition is
/// written by the backend worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryOnSession {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub model_image_url: String,
    pub dress_image_url: String,
    #[serde(default)]
    pub result_image_url: Option<String>,
    #[serde(default)]
    pub result_message: Option<String>,
    pub status: SessionStatus,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DressOption {
    pub id: String,
    pub name: String,
    pub image_url: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

// Change-feed payloads sometimes carry timestamps without an offset.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|text| {
        DateTime::parse_from_rfc3339(&text)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f"))
                    .map(|t| t.and_utc())
                    .ok()
            })
    }))
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `photo` at `path` and return its public URL.
    async fn upload(&self, path: &str, photo: &PhotoFile, upsert: bool) -> Result<String, UploadError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, model_image_url: &str, dress_image_url: &str) -> Result<TryOnSession, SessionError>;

    async fn fetch(&self, id: &str) -> Result<TryOnSession, SessionError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DressCatalog: Send + Sync {
    /// All garments, oldest first.
    async fn list(&self) -> Result<Vec<DressOption>, SessionError>;

    /// Point the catalog entry called `name` at `image_url`. Returns the
    /// number of rows changed.
    async fn set_image_url(&self, name: &str, image_url: &str) -> Result<usize, SessionError>;
}

pub struct SupabaseBackend {
    http: Client,
    base_url: String,
    api_key: String,
    bucket: String,
    sessions_table: String,
    dresses_table: String,
}

impl SupabaseBackend {
    pub fn new(config: &BackendConfig, api_key: String) -> Self {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Failed to build backend HTTP client ({}), using defaults", e);
                Client::new()
            });
        Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key,
            bucket: config.bucket.clone(),
            sessions_table: config.sessions_table.clone(),
            dresses_table: config.dresses_table.clone(),
        }
    }

    pub fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path)
    }

    pub fn public_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, self.bucket, path)
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    fn single_object(request: RequestBuilder) -> RequestBuilder {
        request.header("Accept", "application/vnd.pgrst.object+json")
    }

    async fn read_rejection(response: Response) -> (u16, String) {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        (status, error_message(&body))
    }

    async fn session_body(response: Response, id: Option<&str>) -> Result<TryOnSession, SessionError> {
        let status = response.status();
        if let Some(id) = id {
            // A single-object fetch answers 406 when no row matched
            if status == StatusCode::NOT_ACCEPTABLE || status == StatusCode::NOT_FOUND {
                return Err(SessionError::NotFound(id.to_string()));
            }
        }
        if !response.status().is_success() {
            let (status, message) = Self::read_rejection(response).await;
            return Err(SessionError::Rejected { status, message });
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// Catalog name for a seeded image file: `pink-tutu_dress` becomes `Pink Tutu Dress`.
pub fn catalog_name(stem: &str) -> String {
    stem.split(|c: char| c == '-' || c == '_' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Pull a readable message out of a PostgREST or storage error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            ["message", "error", "msg"]
                .iter()
                .find_map(|key| value.get(*key).and_then(|m| m.as_str()).map(String::from))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl ObjectStorage for SupabaseBackend {
    async fn upload(&self, path: &str, photo: &PhotoFile, upsert: bool) -> Result<String, UploadError> {
        log::debug!("Uploading {} ({} bytes) to {}", photo.name, photo.len(), path);
        let request = self
            .http
            .post(self.object_url(path))
            .header("content-type", &photo.mime_type)
            .header("cache-control", "max-age=3600")
            .header("x-upsert", upsert.to_string())
            .body(photo.bytes.clone());

        let response = self.authorized(request).send().await?;
        if !response.status().is_success() {
            let (status, message) = Self::read_rejection(response).await;
            log::error!("Upload of {} rejected: {} {}", path, status, message);
            return Err(UploadError::Rejected { status, message });
        }

        let url = self.public_url(path);
        log::info!("Uploaded {}", url);
        Ok(url)
    }
}

#[async_trait]
impl SessionStore for SupabaseBackend {
    async fn create(&self, model_image_url: &str, dress_image_url: &str) -> Result<TryOnSession, SessionError> {
        let request = self
            .http
            .post(self.table_url(&self.sessions_table))
            .header("Prefer", "return=representation")
            .json(&json!({
                "model_image_url": model_image_url,
                "dress_image_url": dress_image_url,
                "status": SessionStatus::Pending,
            }));

        let response = self.authorized(Self::single_object(request)).send().await?;
        let session = Self::session_body(response, None).await?;
        log::info!("Created try-on session {}", session.id);
        Ok(session)
    }

    async fn fetch(&self, id: &str) -> Result<TryOnSession, SessionError> {
        let request = self
            .http
            .get(self.table_url(&self.sessions_table))
            .query(&[("id", format!("eq.{}", id)), ("select", "*".to_string())]);

        let response = self.authorized(Self::single_object(request)).send().await?;
        Self::session_body(response, Some(id)).await
    }
}

#[async_trait]
impl DressCatalog for SupabaseBackend {
    async fn list(&self) -> Result<Vec<DressOption>, SessionError> {
        let request = self
            .http
            .get(self.table_url(&self.dresses_table))
            .query(&[("select", "*"), ("order", "created_at.asc")]);

        let response = self.authorized(request).send().await?;
        if !response.status().is_success() {
            let (status, message) = Self::read_rejection(response).await;
            return Err(SessionError::Rejected { status, message });
        }
        let body = response.text().await?;
        let dresses: Vec<DressOption> = serde_json::from_str(&body)?;
        log::debug!("Loaded {} dress options", dresses.len());
        Ok(dresses)
    }

    async fn set_image_url(&self, name: &str, image_url: &str) -> Result<usize, SessionError> {
        let request = self
            .http
            .patch(self.table_url(&self.dresses_table))
            .query(&[("name", format!("eq.{}", name))])
            .header("Prefer", "return=representation")
            .json(&json!({ "image_url": image_url }));

        let response = self.authorized(request).send().await?;
        if !response.status().is_success() {
            let (status, message) = Self::read_rejection(response).await;
            return Err(SessionError::Rejected { status, message });
        }
        let body = response.text().await?;
        let updated: Vec<Value> = serde_json::from_str(&body)?;
        Ok(updated.len())
    }
}
