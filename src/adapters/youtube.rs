//! YouTube publishing via the resumable upload protocol.
//!
//! Two requests: an initiation POST carrying the metadata, which returns an
//! upload session URL, then a PUT of the video bytes to that URL.
//!
//! Access tokens are short-lived. They are minted from the stored refresh
//! token and cached until shortly before they expire.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{CollaboratorError, Publisher};

/// Titles longer than this are rejected by the API
pub const MAX_TITLE_CHARS: usize = 100;

/// Title used when none was generated
pub const DEFAULT_TITLE: &str = "short";

/// Tokens this close to expiry are refreshed before use
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// OAuth client and refresh token, as written by the authorization flow
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl OAuthCredentials {
    pub fn load(path: &Path) -> Result<Self, CollaboratorError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CollaboratorError::permanent(format!(
                "cannot read publish credentials {}: {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            CollaboratorError::permanent(format!(
                "invalid publish credentials {}: {e}",
                path.display()
            ))
        })
    }

    fn refresh_form(&self) -> [(&'static str, &str); 4] {
        [
            ("grant_type", "refresh_token"),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("refresh_token", &self.refresh_token),
        ]
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn from_response(response: TokenResponse, now: Instant) -> Self {
        Self {
            value: response.access_token,
            expires_at: now + Duration::from_secs(response.expires_in),
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now + EXPIRY_MARGIN < self.expires_at
    }
}

pub struct YouTubePublisher {
    endpoint: String,
    token_url: String,
    credentials: PathBuf,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct UploadedVideo {
    id: String,
}

/// Apply the title policy: blank becomes the default, long titles are cut
pub fn publish_title(title: Option<&str>) -> String {
    let trimmed = title.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    trimmed.chars().take(MAX_TITLE_CHARS).collect()
}

/// Gateway errors and an expired token are worth retrying; nothing else is
fn classify_status(status: StatusCode, body: &str) -> CollaboratorError {
    let message = format!("upload rejected with {status}: {}", body.trim());
    match status.as_u16() {
        401 | 500 | 502 | 503 | 504 => CollaboratorError::Transient(message),
        _ => CollaboratorError::Permanent(message),
    }
}

impl YouTubePublisher {
    pub fn new(
        endpoint: impl Into<String>,
        token_url: impl Into<String>,
        credentials: impl Into<PathBuf>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            token_url: token_url.into(),
            credentials: credentials.into(),
            client: reqwest::Client::new(),
            token: Mutex::new(None),
        }
    }

    /// A valid access token, refreshed when missing or about to expire.
    ///
    /// Refresh failures are transient: the unit stays eligible and succeeds
    /// once the token endpoint answers again.
    async fn access_token(&self) -> Result<String, CollaboratorError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Instant::now())) {
            return Ok(token.value.clone());
        }

        let credentials = OAuthCredentials::load(&self.credentials)?;
        let response = self
            .client
            .post(&self.token_url)
            .form(&credentials.refresh_form()[..])
            .send()
            .await
            .map_err(|e| CollaboratorError::transient(format!("token refresh failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::transient(format!(
                "token refresh rejected with {status}: {}",
                body.trim()
            )));
        }

        let parsed: TokenResponse = response.json().await.map_err(|e| {
            CollaboratorError::transient(format!("unreadable token response: {e}"))
        })?;
        let token = CachedToken::from_response(parsed, Instant::now());
        tracing::info!(expires_in = ?token.expires_at.duration_since(Instant::now()), "Refreshed publish access token");

        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Drop the cached token so the next call refreshes
    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn check(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, CollaboratorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.invalidate_token().await;
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

#[async_trait]
impl Publisher for YouTubePublisher {
    fn name(&self) -> &str {
        "youtube"
    }

    async fn publish(
        &self,
        video: &Path,
        title: &str,
        description: &str,
    ) -> Result<String, CollaboratorError> {
        let token = self.access_token().await?;
        let file = tokio::fs::File::open(video).await.map_err(|e| {
            CollaboratorError::permanent(format!("cannot open {}: {e}", video.display()))
        })?;
        let size = file
            .metadata()
            .await
            .map_err(|e| CollaboratorError::transient(e.to_string()))?
            .len();

        let metadata = serde_json::json!({
            "snippet": {
                "title": title,
                "description": description,
                "categoryId": "22",
            },
            "status": {
                "privacyStatus": "public",
                "selfDeclaredMadeForKids": false,
            },
        });

        let init_url = format!(
            "{}/upload/youtube/v3/videos?uploadType=resumable&part=snippet,status",
            self.endpoint.trim_end_matches('/')
        );
        let init = self
            .client
            .post(init_url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header("X-Upload-Content-Type", "video/mp4")
            .header("X-Upload-Content-Length", size)
            .json(&metadata)
            .send()
            .await?;
        let init = self.check(init).await?;

        let session_url = init
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                CollaboratorError::Validation("upload session has no Location header".into())
            })?;

        let upload = self
            .client
            .put(session_url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(CONTENT_TYPE, "video/mp4")
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::from(file))
            .send()
            .await?;
        let upload = self.check(upload).await?;

        let uploaded: UploadedVideo = upload
            .json()
            .await
            .map_err(|e| CollaboratorError::Validation(e.to_string()))?;

        tracing::info!(video_id = %uploaded.id, bytes = size, "Upload complete");
        Ok(uploaded.id)
    }
}
