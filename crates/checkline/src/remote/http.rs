//! JSON-over-HTTP client for the hosted data service.

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{
    ChecklistRecord, CommitOutcome, NonConformance, RemoteError, RemoteResult, RemoteService,
    TimelineBatch,
};
use crate::config::RemoteConfig;
use crate::submission::SubmissionId;

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: Option<String>,
}

/// Remote service reached over HTTP.
///
/// Endpoints, relative to the configured base URL:
/// - `PUT /objects/{submission_id}/{file_name}` stores an attachment
/// - `PUT /checklists/{submission_id}` commits a record (`409` means already committed)
/// - `PUT /checklists/{submission_id}/non-conformances` files secondary records
/// - `POST /timeline` appends timeline events
/// - `GET {health_path}` reports reachability
#[derive(Clone)]
pub struct HttpRemoteService {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    health_path: String,
}

impl std::fmt::Debug for HttpRemoteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteService")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("health_path", &self.health_path)
            .finish_non_exhaustive()
    }
}

impl HttpRemoteService {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &RemoteConfig) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            health_path: config.health_path.clone(),
        })
    }

    /// The base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Turn a non-success response into a [`RemoteError`].
async fn check(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unknown status")
            .to_string()
    } else {
        body
    };

    match status {
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE => {
            Err(RemoteError::QuotaExceeded(message))
        }
        _ => Err(RemoteError::rejected(status.as_u16(), message)),
    }
}

#[async_trait::async_trait]
impl RemoteService for HttpRemoteService {
    async fn upload_object(
        &self,
        path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> RemoteResult<String> {
        let url = self.url(&format!("objects/{path}"));
        debug!("PUT {} ({} bytes)", url, bytes.len());

        let response = self
            .authorize(self.client.put(&url))
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;
        let response = check(response).await?;

        // The service may answer with a public URL; otherwise the object URL resolves.
        let reference = response
            .json::<UploadResponse>()
            .await
            .ok()
            .and_then(|r| r.url)
            .unwrap_or(url);
        Ok(reference)
    }

    async fn commit_checklist(&self, record: &ChecklistRecord) -> RemoteResult<CommitOutcome> {
        let url = self.url(&format!("checklists/{}", record.submission_id));
        debug!("PUT {}", url);

        let response = self
            .authorize(self.client.put(&url))
            .json(record)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(CommitOutcome::AlreadyCommitted);
        }
        check(response).await?;
        Ok(CommitOutcome::Created)
    }

    async fn record_non_conformances(
        &self,
        submission_id: &SubmissionId,
        entries: &[NonConformance],
    ) -> RemoteResult<()> {
        let url = self.url(&format!("checklists/{submission_id}/non-conformances"));
        debug!("PUT {} ({} entries)", url, entries.len());

        let response = self
            .authorize(self.client.put(&url))
            .json(entries)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn append_timeline(&self, batch: &TimelineBatch) -> RemoteResult<()> {
        let url = self.url("timeline");
        debug!("POST {} ({} events)", url, batch.events.len());

        let response = self
            .authorize(self.client.post(&url))
            .json(batch)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn health(&self) -> RemoteResult<()> {
        let url = self.url(&self.health_path);
        let response = self.authorize(self.client.get(&url)).send().await?;
        check(response).await?;
        Ok(())
    }
}
