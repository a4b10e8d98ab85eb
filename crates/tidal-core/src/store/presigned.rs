//! Client-direct uploads through a signing service.
//!
//! The service owns the bucket credentials and hands out pre-signed URLs; part
//! bodies go straight from this process to the object store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, ETAG};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{MultipartUpload, ObjectStore};
use crate::chunk::CompletedPart;
use crate::errors::{categorize_http_status, ErrorCategory, TransferError, TransferResult};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    file_name: &'a str,
    content_type: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    upload_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PresignPartRequest<'a> {
    file_name: &'a str,
    upload_id: &'a str,
    part_number: u32,
    content_type: &'a str,
}

#[derive(Deserialize)]
struct PresignResponse {
    url: String,
}

#[derive(Serialize)]
struct WirePart<'a> {
    #[serde(rename = "ETag")]
    etag: &'a str,
    #[serde(rename = "PartNumber")]
    part_number: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRequest<'a> {
    file_name: &'a str,
    upload_id: &'a str,
    parts: Vec<WirePart<'a>>,
}

#[derive(Deserialize)]
struct CompleteResponse {
    #[serde(default)]
    location: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AbortRequest<'a> {
    file_name: &'a str,
    upload_id: &'a str,
}

pub struct PresignedStore {
    client: Client,
    endpoint: String,
    content_type: String,
}

impl PresignedStore {
    /// `endpoint` is the signing service base URL, e.g. `https://uploads.example.com`.
    pub fn new(endpoint: &str, content_type: &str) -> TransferResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| TransferError::fatal(format!("building HTTP client: {}", err)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            content_type: content_type.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> TransferResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let response = self
            .client
            .post(self.url(path))
            .timeout(CONTROL_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|err| request_error(path, err))?;
        let response = check_status(path, response).await?;
        response
            .json::<R>()
            .await
            .map_err(|err| TransferError::fatal(format!("{}: malformed response: {}", path, err)))
    }

    /// Round-trip time to the signing service.
    pub async fn ping(&self) -> TransferResult<Duration> {
        let started = tokio::time::Instant::now();
        let response = self
            .client
            .get(self.url("/api/ping"))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|err| request_error("/api/ping", err))?;
        check_status("/api/ping", response).await?;
        Ok(started.elapsed())
    }
}

fn request_error(what: &str, err: reqwest::Error) -> TransferError {
    let message = format!("{}: {}", what, err);
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        TransferError::retryable(message)
    } else {
        TransferError::fatal(message)
    }
}

async fn check_status(what: &str, response: reqwest::Response) -> TransferResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(what, status, &body))
}

fn status_error(what: &str, status: StatusCode, body: &str) -> TransferError {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("{}: HTTP {} {}", what, status.as_u16(), snippet.trim());
    match categorize_http_status(status.as_u16()) {
        ErrorCategory::Retryable => TransferError::retryable(message),
        _ => TransferError::fatal(message),
    }
}

#[async_trait]
impl ObjectStore for PresignedStore {
    async fn initiate_multipart(&self, key: &str, content_type: &str) -> TransferResult<MultipartUpload> {
        let response: StartResponse = self
            .post_json(
                "/api/multipart/start",
                &StartRequest {
                    file_name: key,
                    content_type,
                },
            )
            .await?;
        log::debug!("multipart upload {} opened for {}", response.upload_id, key);
        Ok(MultipartUpload {
            key: key.to_string(),
            upload_id: response.upload_id,
        })
    }

    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        body: Vec<u8>,
    ) -> TransferResult<String> {
        let presigned: PresignResponse = self
            .post_json(
                "/api/multipart/presign-part",
                &PresignPartRequest {
                    file_name: &upload.key,
                    upload_id: &upload.upload_id,
                    part_number,
                    content_type: &self.content_type,
                },
            )
            .await?;

        let what = format!("PUT part {}", part_number);
        let response = self
            .client
            .put(&presigned.url)
            .header(CONTENT_TYPE, &self.content_type)
            .body(body)
            .send()
            .await
            .map_err(|err| request_error(&what, err))?;
        let response = check_status(&what, response).await?;

        response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                TransferError::fatal(format!(
                    "{}: response carried no ETag header (check the bucket CORS ExposeHeaders)",
                    what
                ))
            })
    }

    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> TransferResult<Option<String>> {
        let request = CompleteRequest {
            file_name: &upload.key,
            upload_id: &upload.upload_id,
            parts: parts
                .iter()
                .map(|part| WirePart {
                    etag: &part.etag,
                    part_number: part.part_number,
                })
                .collect(),
        };
        let response: CompleteResponse = self.post_json("/api/multipart/complete", &request).await?;
        Ok(response.location)
    }

    async fn abort_multipart(&self, upload: &MultipartUpload) -> TransferResult<()> {
        let _: serde_json::Value = self
            .post_json(
                "/api/multipart/abort",
                &AbortRequest {
                    file_name: &upload.key,
                    upload_id: &upload.upload_id,
                },
            )
            .await?;
        Ok(())
    }
}
