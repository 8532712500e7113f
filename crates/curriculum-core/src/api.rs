//! Backend HTTP client for the curriculum endpoints.
//!
//! [`CurriculumApi`] is the seam between the workflow and the network; the
//! monitor, history poller and submission controller only ever talk to it.
//! [`HttpApi`] is the reqwest implementation.

use std::future::Future;

use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::Config;
use crate::submit::{UploadFile, UploadRequest, UploadSource};
use crate::types::{ContentType, DiagnosticReport, HistoryEntry, JobId, JobUpdate, StatusPayload};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    /// The backend answered but refused the request.
    #[error("{}", rejected_summary(.status, .message))]
    Rejected {
        status: Option<u16>,
        message: Option<String>,
    },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to read upload file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid API base URL: {0}")]
    InvalidBaseUrl(String),
}

fn rejected_summary(status: &Option<u16>, message: &Option<String>) -> String {
    let detail = message.as_deref().unwrap_or("no details given");
    match status {
        Some(code) => format!("request rejected with HTTP {}: {}", code, detail),
        None => format!("request rejected: {}", detail),
    }
}

impl ApiError {
    /// The backend's own error text, when it sent one.
    pub fn backend_message(&self) -> Option<&str> {
        match self {
            ApiError::Rejected {
                message: Some(m), ..
            } => Some(m.as_str()),
            _ => None,
        }
    }
}

/// Operations the upload workflow needs from the backend.
pub trait CurriculumApi: Send + Sync + 'static {
    /// `POST /diagnose` with the file as multipart.
    fn diagnose(
        &self,
        file: &UploadFile,
    ) -> impl Future<Output = Result<DiagnosticReport, ApiError>> + Send;

    /// `POST /upload`; returns the new job's id.
    fn start_upload(
        &self,
        request: &UploadRequest,
    ) -> impl Future<Output = Result<JobId, ApiError>> + Send;

    /// `GET /upload/{id}/status`, already converted into a [`JobUpdate`].
    fn job_status(
        &self,
        job_id: &JobId,
    ) -> impl Future<Output = Result<JobUpdate, ApiError>> + Send;

    /// `GET /uploads?limit=&organization_id=`, most recent first.
    fn list_uploads(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>, ApiError>> + Send;
}

#[derive(Debug, Deserialize)]
struct StartPayload {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    upload_id: Option<JobId>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadsPayload {
    #[serde(default)]
    uploads: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
struct TextUploadBody<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    transformation_level: &'a str,
    preserve_structure: bool,
    organization_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    learning_objectives: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_types: Option<&'a [ContentType]>,
}

/// reqwest-backed client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpApi {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Self::with_client(client, &config.api_base, config.api_token.clone())
    }

    pub fn with_client(
        client: reqwest::Client,
        api_base: &str,
        token: Option<String>,
    ) -> Result<Self, ApiError> {
        let base = Url::parse(api_base.trim())
            .map_err(|e| ApiError::InvalidBaseUrl(format!("{}: {}", api_base, e)))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidBaseUrl(api_base.to_string()));
        }
        Ok(Self {
            client,
            base,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// `<base>/api/admin/curriculum/<segments...>`, each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ApiError::InvalidBaseUrl(self.base.to_string()))?;
            path.pop_if_empty()
                .extend(["api", "admin", "curriculum"])
                .extend(segments);
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn file_part(file: &UploadFile) -> Result<Part, ApiError> {
        let bytes = tokio::fs::read(&file.path).await?;
        Ok(Part::bytes(bytes).file_name(file.file_name.clone()))
    }

    async fn multipart_upload(
        request: &UploadRequest,
        file: &UploadFile,
    ) -> Result<Form, ApiError> {
        let mut form = Form::new()
            .part("file", Self::file_part(file).await?)
            .text("transformation_level", request.transformation_level.clone())
            .text("preserve_structure", request.preserve_structure.to_string())
            .text("organization_id", request.organization_id.clone());
        if let Some(title) = &request.title {
            form = form.text("title", title.clone());
        }
        if let Some(objectives) = request.learning_objectives_text() {
            form = form.text("learning_objectives", objectives);
        }
        if let Some(types) = &request.content_types {
            form = form.text("content_types", serde_json::to_string(types)?);
        }
        Ok(form)
    }
}

/// Decode a JSON body, turning non-2xx answers into [`ApiError::Rejected`].
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ApiError::Rejected {
            status: Some(status.as_u16()),
            message: backend_message(&body),
        });
    }
    Ok(serde_json::from_str(&body)?)
}

/// Pull a human-readable message out of an error body, if it is JSON.
fn backend_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["error", "message", "detail"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

impl CurriculumApi for HttpApi {
    async fn diagnose(&self, file: &UploadFile) -> Result<DiagnosticReport, ApiError> {
        let form = Form::new().part("file", Self::file_part(file).await?);
        let request = self
            .authorize(self.client.post(self.endpoint(&["diagnose"])?))
            .multipart(form);
        let report: DiagnosticReport = read_json(request.send().await?).await?;
        if !report.success {
            return Err(ApiError::Rejected {
                status: None,
                message: report.error.clone(),
            });
        }
        Ok(report)
    }

    async fn start_upload(&self, request: &UploadRequest) -> Result<JobId, ApiError> {
        let builder = self.authorize(self.client.post(self.endpoint(&["upload"])?));
        let builder = match &request.source {
            UploadSource::File(file) => builder.multipart(Self::multipart_upload(request, file).await?),
            UploadSource::Text(text) => builder.json(&TextUploadBody {
                text,
                title: request.title.as_deref(),
                transformation_level: &request.transformation_level,
                preserve_structure: request.preserve_structure,
                organization_id: &request.organization_id,
                learning_objectives: request.learning_objectives_text(),
                content_types: request.content_types.as_deref(),
            }),
        };

        let payload: StartPayload = read_json(builder.send().await?).await?;
        match payload {
            StartPayload {
                success: Some(false),
                error,
                message,
                ..
            }
            | StartPayload {
                upload_id: None,
                error,
                message,
                ..
            } => Err(ApiError::Rejected {
                status: None,
                message: error.or(message),
            }),
            StartPayload {
                upload_id: Some(id),
                ..
            } => Ok(id),
        }
    }

    async fn job_status(&self, job_id: &JobId) -> Result<JobUpdate, ApiError> {
        let url = self.endpoint(&["upload", job_id.as_str(), "status"])?;
        let payload: StatusPayload = read_json(self.authorize(self.client.get(url)).send().await?).await?;
        Ok(payload.into())
    }

    async fn list_uploads(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, ApiError> {
        let request = self
            .authorize(self.client.get(self.endpoint(&["uploads"])?))
            .query(&[
                ("limit", limit.to_string()),
                ("organization_id", organization_id.to_string()),
            ]);
        let payload: UploadsPayload = read_json(request.send().await?).await?;
        Ok(payload.uploads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_and_encodes_segments() {
        let api = HttpApi::with_client(reqwest::Client::new(), "https://learn.example.org/", None).unwrap();
        let url = api.endpoint(&["upload", "a b/c", "status"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://learn.example.org/api/admin/curriculum/upload/a%20b%2Fc/status"
        );
    }

    #[test]
    fn endpoint_keeps_base_path_prefix() {
        let api = HttpApi::with_client(reqwest::Client::new(), "https://host/tenant", None).unwrap();
        let url = api.endpoint(&["uploads"]).unwrap();
        assert_eq!(url.as_str(), "https://host/tenant/api/admin/curriculum/uploads");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(
            HttpApi::with_client(reqwest::Client::new(), "not a url", None),
            Err(ApiError::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn backend_message_prefers_error_field() {
        assert_eq!(
            backend_message(r#"{"error":"  Bad file  ","message":"ignored"}"#).as_deref(),
            Some("Bad file")
        );
        assert_eq!(
            backend_message(r#"{"detail":"Not authenticated"}"#).as_deref(),
            Some("Not authenticated")
        );
        assert_eq!(backend_message("<html>502</html>"), None);
        assert_eq!(backend_message(r#"{"error":""}"#), None);
    }
}
