//! An S3-compatible multipart upload session, driven entirely over HTTP.
//!
//! The wire protocol mirrors AWS S3 and its GCS/MinIO-compatible peers: `POST ?uploads` to
//! initiate, `PUT ?partNumber=&uploadId=` per part with a `Content-MD5` integrity digest, and a
//! final `POST ?uploadId=` carrying an XML manifest of `(part_number, etag)` pairs sorted
//! ascending.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use md5::{Digest, Md5};
use reqwest::Client;
use tracing::{instrument, warn};

use super::MultipartUpload as MultipartUploadTrait;
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Everything needed to address and authorize requests against an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Endpoint {
    /// Base URL up to and including the bucket, e.g. `https://s3.example.com/my-bucket`.
    pub base_url: String,
    pub authorization: String,
}

impl S3Endpoint {
    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }
}

/// A [`crate::backend::MultipartFactoryBackend`] talking to an S3-compatible HTTP API.
pub struct S3MultipartFactory {
    client: Client,
    endpoint: S3Endpoint,
    retry: RetryConfig,
    target_concurrency: usize,
}

impl S3MultipartFactory {
    pub fn new(client: Client, endpoint: S3Endpoint, retry: RetryConfig, target_concurrency: usize) -> Self {
        Self {
            client,
            endpoint,
            retry,
            target_concurrency,
        }
    }
}

#[async_trait]
impl super::MultipartFactoryBackend for S3MultipartFactory {
    async fn make_multipart_upload(
        &self,
        path: &str,
        metadata: &[(String, String)],
    ) -> Result<Box<dyn MultipartUploadTrait>> {
        Ok(Box::new(S3MultipartUpload {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            key: path.to_string(),
            metadata: metadata.to_vec(),
            retry: RetryPolicy::new(self.retry.clone()),
            upload_id: tokio::sync::OnceCell::new(),
            etags: DashMap::new(),
            target_concurrency: self.target_concurrency,
        }))
    }
}

struct S3MultipartUpload {
    client: Client,
    endpoint: S3Endpoint,
    key: String,
    metadata: Vec<(String, String)>,
    retry: RetryPolicy,
    upload_id: tokio::sync::OnceCell<String>,
    etags: DashMap<u32, String>,
    target_concurrency: usize,
}

fn classify_status(status: reqwest::StatusCode, body: String) -> Error {
    if status.is_server_error() {
        Error::ServerError {
            status: status.as_u16(),
            body,
        }
    } else {
        Error::ClientError {
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl MultipartUploadTrait for S3MultipartUpload {
    #[instrument(skip(self), fields(key = %self.key))]
    async fn start(&self) -> Result<String> {
        let url = format!("{}?uploads", self.endpoint.object_url(&self.key));
        let auth = self.endpoint.authorization.clone();

        let upload_id = self
            .retry
            .run(|attempt| {
                let client = self.client.clone();
                let url = url.clone();
                let auth = auth.clone();
                async move {
                    let mut req = client
                        .post(&url)
                        .header("Authorization", auth)
                        .header("Content-Type", "application/octet-stream")
                        .header("Content-Length", "0");
                    for (k, v) in &self.metadata {
                        req = req.header(format!("x-goog-meta-{k}"), v);
                    }
                    let resp = req.send().await?;

                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if !status.is_success() {
                        let err = classify_status(status, body);
                        if attempt == 0 {
                            warn!(%status, "multipart initiate failed, will retry if transient");
                        }
                        return Err(if err.is_retryable() {
                            err
                        } else {
                            Error::InitiateFailed {
                                status: status.as_u16(),
                                body: err.to_string(),
                            }
                        });
                    }

                    extract_tag(&body, "UploadId").ok_or_else(|| {
                        Error::InitiateFailed {
                            status: status.as_u16(),
                            body,
                        }
                    })
                }
            })
            .await?;

        self.upload_id
            .set(upload_id.clone())
            .map_err(|_| Error::Fatal("multipart upload started twice".into()))?;
        Ok(upload_id)
    }

    #[instrument(skip(self, data), fields(key = %self.key, part_number))]
    async fn upload_part(&self, part_number: u32, data: &[Bytes]) -> Result<()> {
        let upload_id = self
            .upload_id
            .get()
            .ok_or_else(|| Error::Fatal("upload_part called before start".into()))?
            .clone();

        let url = format!(
            "{}?partNumber={}&uploadId={}",
            self.endpoint.object_url(&self.key),
            part_number,
            upload_id
        );
        let auth = self.endpoint.authorization.clone();

        let etag = self
            .retry
            .run(|_attempt| {
                let client = self.client.clone();
                let url = url.clone();
                let auth = auth.clone();
                let slices = data.to_vec();
                async move {
                    let mut hasher = Md5::new();
                    let mut body = Vec::new();
                    for slice in &slices {
                        hasher.update(slice);
                        body.extend_from_slice(slice);
                    }
                    let digest = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());

                    let resp = client
                        .put(&url)
                        .header("Authorization", auth)
                        .header("Content-Length", body.len().to_string())
                        .header("Content-MD5", digest)
                        .body(body)
                        .send()
                        .await?;

                    let status = resp.status();
                    if !status.is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(classify_status(status, body));
                    }

                    resp.headers()
                        .get("etag")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                        .ok_or_else(|| Error::Fatal("upload part response missing ETag".into()))
                }
            })
            .await?;

        self.etags.insert(part_number, etag);
        Ok(())
    }

    #[instrument(skip(self), fields(key = %self.key))]
    async fn complete(&self) -> Result<()> {
        let upload_id = self
            .upload_id
            .get()
            .ok_or_else(|| Error::Fatal("complete called before start".into()))?
            .clone();

        let mut parts: Vec<(u32, String)> = self
            .etags
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        parts.sort_by_key(|(n, _)| *n);

        let mut xml = String::from("<CompleteMultipartUpload>");
        for (number, etag) in &parts {
            xml.push_str(&format!(
                "<Part><PartNumber>{number}</PartNumber><ETag>{etag}</ETag></Part>"
            ));
        }
        xml.push_str("</CompleteMultipartUpload>");

        let url = format!(
            "{}?uploadId={}",
            self.endpoint.object_url(&self.key),
            upload_id
        );
        let auth = self.endpoint.authorization.clone();

        self.retry
            .run(|_attempt| {
                let client = self.client.clone();
                let url = url.clone();
                let auth = auth.clone();
                let xml = xml.clone();
                async move {
                    let resp = client
                        .post(&url)
                        .header("Authorization", auth)
                        .header("Content-Type", "application/xml")
                        .body(xml)
                        .send()
                        .await?;

                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if !status.is_success() {
                        let err = classify_status(status, body);
                        return Err(if err.is_retryable() {
                            err
                        } else {
                            Error::CompleteFailed {
                                status: status.as_u16(),
                                body: err.to_string(),
                            }
                        });
                    }
                    Ok(())
                }
            })
            .await
    }

    fn target_concurrency(&self) -> usize {
        self.target_concurrency
    }
}

/// Extracts the text content of the first `<tag>...</tag>` occurrence.
///
/// S3-family responses are small, fixed-shape XML documents; a full XML parser is unwarranted
/// for pulling a single element out of them.
fn extract_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}

/// Convenience constructor bundling an [`Arc`]'d [`Client`] for reuse across many uploads.
pub fn shared_client() -> Arc<Client> {
    Arc::new(Client::new())
}
