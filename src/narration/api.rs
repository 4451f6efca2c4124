//! Remote narration operations.
//!
//! [`NarrationApi`] is the seam between the session state machine and the
//! backend. [`HttpNarrationApi`] talks to the studio REST API:
//!
//! | Operation | Request |
//! |---|---|
//! | start | `POST {base}/chapters/{id}/narration/start` |
//! | cancel | `POST {base}/chapters/{id}/narration/cancel` |
//! | status | `GET {base}/chapters/{id}/narration/status` |
//! | single speech | `POST {base}/speeches/{id}/audio` |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{message} (HTTP {status})")]
    Rejected { status: u16, message: String },
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Human-readable text suitable for the session `error` field.
    pub fn user_message(&self) -> String {
        match self {
            Self::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Accepted start request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAccepted {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
}

/// Backend job queue state for a chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteJobState {
    Idle,
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNarrationStatus {
    #[serde(rename = "status")]
    pub state: RemoteJobState,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub failed_reason: Option<String>,
}

/// Result of a single-speech audio regeneration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechAudio {
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

#[async_trait]
pub trait NarrationApi: Send + Sync {
    async fn start_narration(&self, chapter_id: &str) -> Result<StartAccepted, ApiError>;

    async fn cancel_narration(&self, chapter_id: &str) -> Result<(), ApiError>;

    async fn narration_status(&self, chapter_id: &str) -> Result<RemoteNarrationStatus, ApiError>;

    async fn generate_speech_audio(&self, speech_id: &str) -> Result<SpeechAudio, ApiError>;
}

// ── HTTP client ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct HttpNarrationApi {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpNarrationApi {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let resp = self.authorize(request).send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.error.or(b.message))
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                if body.trim().is_empty() {
                    status.canonical_reason().unwrap_or("request rejected").to_string()
                } else {
                    body.trim().to_string()
                }
            });
        Err(ApiError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    /// Decode a JSON body; an empty body yields the type's default.
    async fn json_or_default<T>(resp: reqwest::Response) -> Result<T, ApiError>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl NarrationApi for HttpNarrationApi {
    async fn start_narration(&self, chapter_id: &str) -> Result<StartAccepted, ApiError> {
        let url = self.url(&format!("/chapters/{chapter_id}/narration/start"));
        let resp = self.send(self.http.post(url)).await?;
        let accepted: StartAccepted = Self::json_or_default(resp).await?;
        tracing::info!(
            chapter_id,
            job_id = accepted.job_id.as_deref().unwrap_or("-"),
            "Narration start accepted"
        );
        Ok(accepted)
    }

    async fn cancel_narration(&self, chapter_id: &str) -> Result<(), ApiError> {
        let url = self.url(&format!("/chapters/{chapter_id}/narration/cancel"));
        self.send(self.http.post(url)).await?;
        tracing::info!(chapter_id, "Narration cancel accepted");
        Ok(())
    }

    async fn narration_status(&self, chapter_id: &str) -> Result<RemoteNarrationStatus, ApiError> {
        let url = self.url(&format!("/chapters/{chapter_id}/narration/status"));
        let resp = self.send(self.http.get(url)).await?;
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    async fn generate_speech_audio(&self, speech_id: &str) -> Result<SpeechAudio, ApiError> {
        let url = self.url(&format!("/speeches/{speech_id}/audio"));
        let resp = self.send(self.http.post(url)).await?;
        Self::json_or_default(resp).await
    }
}
