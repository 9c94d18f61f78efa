//! S3-compatible object storage client for SquirrelDB.
//!
//! Covers bucket and object operations plus multipart uploads. Requests are
//! signed with AWS Signature Version 4 when credentials are configured;
//! payloads default to `UNSIGNED-PAYLOAD` except where the body is hashed.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use hmac::{Hmac, Mac};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Default multipart part size (5MB).
pub const DEFAULT_PART_SIZE: usize = 5 * 1024 * 1024;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Storage error types
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status: {0}")]
    Status(StatusCode),

    #[error("Parse error: {0}")]
    Parse(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage bucket
#[derive(Debug, Clone)]
pub struct Bucket {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Storage object metadata
#[derive(Debug, Clone)]
pub struct StorageObject {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub content_type: Option<String>,
}

/// In-progress multipart upload
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
}

/// One uploaded part of a multipart upload
#[derive(Debug, Clone)]
pub struct UploadPart {
    pub part_number: u32,
    pub etag: String,
}

/// Percent-encode a path, leaving `/` separators intact.
fn canonical_uri(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn hmac_sha256(key: &[u8], msg: &str) -> StorageResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StorageError::Parse(format!("hmac key: {}", e)))?;
    mac.update(msg.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Sign a request using AWS Signature Version 4, inserting `x-amz-date`,
/// `x-amz-content-sha256` and `Authorization` into `headers`.
fn sign_request(
    access_key: &str,
    secret_key: &str,
    region: &str,
    method: &str,
    path: &str,
    headers: &mut BTreeMap<String, String>,
    payload_hash: &str,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    headers.insert("x-amz-date".to_string(), amz_date.clone());
    headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());

    let mut sorted: Vec<(String, &String)> = headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();
    sorted.sort();

    let signed_headers = sorted
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers = sorted
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect::<String>();

    let canonical_request = [
        method,
        &canonical_uri(path),
        "",
        &canonical_headers,
        &signed_headers,
        payload_hash,
    ]
    .join("\n");

    let algorithm = "AWS4-HMAC-SHA256";
    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = [
        algorithm,
        &amz_date,
        &credential_scope,
        &sha256_hex(canonical_request.as_bytes()),
    ]
    .join("\n");

    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), &date_stamp)?;
    let k_region = hmac_sha256(&k_date, region)?;
    let k_service = hmac_sha256(&k_region, "s3")?;
    let k_signing = hmac_sha256(&k_service, "aws4_request")?;
    let signature = hex::encode(hmac_sha256(&k_signing, &string_to_sign)?);

    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        algorithm, access_key, credential_scope, signed_headers, signature
    );
    headers.insert("Authorization".to_string(), authorization);
    Ok(())
}

/// S3-compatible object storage client.
pub struct Storage {
    endpoint: String,
    access_key: Option<String>,
    secret_key: Option<String>,
    region: String,
    http: reqwest::Client,
}

impl Storage {
    /// Create a client for an endpoint such as `http://localhost:9000`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            access_key: None,
            secret_key: None,
            region: "us-east-1".to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.access_key = Some(access_key.into());
        self.secret_key = Some(secret_key.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    fn host(&self) -> String {
        self.endpoint
            .split("://")
            .last()
            .unwrap_or(&self.endpoint)
            .to_string()
    }

    fn signed_headers(
        &self,
        method: &str,
        path: &str,
        extra: &[(&str, String)],
        payload_hash: &str,
    ) -> StorageResult<HeaderMap> {
        let mut headers = BTreeMap::new();
        headers.insert("Host".to_string(), self.host());
        for (k, v) in extra {
            headers.insert(k.to_string(), v.clone());
        }

        if let (Some(access), Some(secret)) = (&self.access_key, &self.secret_key) {
            sign_request(
                access,
                secret,
                &self.region,
                method,
                path,
                &mut headers,
                payload_hash,
                Utc::now(),
            )?;
        }

        let mut map = HeaderMap::new();
        for (k, v) in &headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| StorageError::Parse(format!("invalid header name {}: {}", k, e)))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| StorageError::Parse(format!("invalid header value: {}", e)))?;
            map.insert(name, value);
        }
        Ok(map)
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> StorageResult<reqwest::Response> {
        debug!(%method, %url, "storage request");
        let mut req = self.http.request(method, &url).headers(headers);
        if let Some(body) = body {
            req = req.body(body);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(StorageError::Status(resp.status()));
        }
        Ok(resp)
    }

    // Bucket operations

    /// List all buckets
    pub async fn list_buckets(&self) -> StorageResult<Vec<Bucket>> {
        let headers = self.signed_headers("GET", "/", &[], UNSIGNED_PAYLOAD)?;
        let resp = self
            .send(Method::GET, format!("{}/", self.endpoint), headers, None)
            .await?;
        let text = resp.text().await?;

        let re = Regex::new(r"<Name>([^<]+)</Name>")
            .map_err(|e| StorageError::Parse(e.to_string()))?;
        Ok(re
            .captures_iter(&text)
            .map(|cap| Bucket {
                name: cap[1].to_string(),
                created_at: Utc::now(),
            })
            .collect())
    }

    /// Create a new bucket
    pub async fn create_bucket(&self, name: &str) -> StorageResult<()> {
        let path = format!("/{}", name);
        let headers = self.signed_headers("PUT", &path, &[], UNSIGNED_PAYLOAD)?;
        self.send(
            Method::PUT,
            format!("{}{}", self.endpoint, path),
            headers,
            None,
        )
        .await?;
        Ok(())
    }

    /// Delete a bucket (must be empty)
    pub async fn delete_bucket(&self, name: &str) -> StorageResult<()> {
        let path = format!("/{}", name);
        let headers = self.signed_headers("DELETE", &path, &[], UNSIGNED_PAYLOAD)?;
        self.send(
            Method::DELETE,
            format!("{}{}", self.endpoint, path),
            headers,
            None,
        )
        .await?;
        Ok(())
    }

    /// Check if a bucket exists
    pub async fn bucket_exists(&self, name: &str) -> StorageResult<bool> {
        let path = format!("/{}", name);
        let headers = self.signed_headers("HEAD", &path, &[], UNSIGNED_PAYLOAD)?;
        let resp = self
            .http
            .head(format!("{}{}", self.endpoint, path))
            .headers(headers)
            .send()
            .await?;
        Ok(resp.status() == StatusCode::OK)
    }

    // Object operations

    /// List objects in a bucket
    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: u32,
    ) -> StorageResult<Vec<StorageObject>> {
        let path = format!("/{}", bucket);
        let headers = self.signed_headers("GET", &path, &[], UNSIGNED_PAYLOAD)?;

        let mut url = format!("{}{}?max-keys={}", self.endpoint, path, max_keys);
        if !prefix.is_empty() {
            url.push_str(&format!("&prefix={}", urlencoding::encode(prefix)));
        }

        let resp = self.send(Method::GET, url, headers, None).await?;
        let text = resp.text().await?;

        let re = Regex::new(r"(?s)<Key>([^<]+)</Key>.*?<Size>(\d+)</Size>.*?<ETag>([^<]+)</ETag>")
            .map_err(|e| StorageError::Parse(e.to_string()))?;
        Ok(re
            .captures_iter(&text)
            .map(|cap| StorageObject {
                key: cap[1].to_string(),
                size: cap[2].parse().unwrap_or(0),
                etag: cap[3].trim_matches('"').to_string(),
                last_modified: Utc::now(),
                content_type: None,
            })
            .collect())
    }

    /// Get object content
    pub async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<Vec<u8>> {
        let path = format!("/{}/{}", bucket, key);
        let headers = self.signed_headers("GET", &path, &[], UNSIGNED_PAYLOAD)?;
        let resp = self
            .send(
                Method::GET,
                format!("{}{}", self.endpoint, path),
                headers,
                None,
            )
            .await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Stream object content in chunks without buffering the whole body.
    pub async fn get_object_stream(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<impl Stream<Item = reqwest::Result<Bytes>>> {
        let path = format!("/{}/{}", bucket, key);
        let headers = self.signed_headers("GET", &path, &[], UNSIGNED_PAYLOAD)?;
        let resp = self
            .send(
                Method::GET,
                format!("{}{}", self.endpoint, path),
                headers,
                None,
            )
            .await?;
        Ok(resp.bytes_stream())
    }

    /// Upload an object. Returns the ETag.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> StorageResult<String> {
        let payload_hash = sha256_hex(&data);
        let path = format!("/{}/{}", bucket, key);
        let extra = [
            ("Content-Type", content_type.to_string()),
            ("Content-Length", data.len().to_string()),
        ];
        let headers = self.signed_headers("PUT", &path, &extra, &payload_hash)?;

        let resp = self
            .send(
                Method::PUT,
                format!("{}{}", self.endpoint, path),
                headers,
                Some(data),
            )
            .await?;
        Ok(etag_from_response(&resp))
    }

    /// Delete an object
    pub async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let path = format!("/{}/{}", bucket, key);
        let headers = self.signed_headers("DELETE", &path, &[], UNSIGNED_PAYLOAD)?;
        self.send(
            Method::DELETE,
            format!("{}{}", self.endpoint, path),
            headers,
            None,
        )
        .await?;
        Ok(())
    }

    /// Copy an object. Returns the new ETag.
    pub async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> StorageResult<String> {
        let path = format!("/{}/{}", dest_bucket, dest_key);
        let extra = [(
            "x-amz-copy-source",
            format!("/{}/{}", source_bucket, source_key),
        )];
        let headers = self.signed_headers("PUT", &path, &extra, UNSIGNED_PAYLOAD)?;

        let resp = self
            .send(
                Method::PUT,
                format!("{}{}", self.endpoint, path),
                headers,
                None,
            )
            .await?;
        Ok(etag_from_response(&resp))
    }

    /// Check if an object exists
    pub async fn object_exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        let path = format!("/{}/{}", bucket, key);
        let headers = self.signed_headers("HEAD", &path, &[], UNSIGNED_PAYLOAD)?;
        let resp = self
            .http
            .head(format!("{}{}", self.endpoint, path))
            .headers(headers)
            .send()
            .await?;
        Ok(resp.status() == StatusCode::OK)
    }

    // Multipart upload

    /// Initiate a multipart upload
    pub async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> StorageResult<MultipartUpload> {
        let path = format!("/{}/{}", bucket, key);
        let extra = [("Content-Type", content_type.to_string())];
        let headers = self.signed_headers("POST", &path, &extra, UNSIGNED_PAYLOAD)?;

        let resp = self
            .send(
                Method::POST,
                format!("{}{}?uploads", self.endpoint, path),
                headers,
                None,
            )
            .await?;
        let text = resp.text().await?;

        let re = Regex::new(r"<UploadId>([^<]+)</UploadId>")
            .map_err(|e| StorageError::Parse(e.to_string()))?;
        let upload_id = re
            .captures(&text)
            .map(|cap| cap[1].to_string())
            .ok_or_else(|| StorageError::Parse("failed to parse upload id".to_string()))?;

        Ok(MultipartUpload {
            upload_id,
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// Upload one part of a multipart upload
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> StorageResult<UploadPart> {
        let payload_hash = sha256_hex(&data);
        let path = format!("/{}/{}", bucket, key);
        let extra = [("Content-Length", data.len().to_string())];
        let headers = self.signed_headers("PUT", &path, &extra, &payload_hash)?;

        let url = format!(
            "{}{}?partNumber={}&uploadId={}",
            self.endpoint,
            path,
            part_number,
            urlencoding::encode(upload_id)
        );
        let resp = self.send(Method::PUT, url, headers, Some(data)).await?;

        Ok(UploadPart {
            part_number,
            etag: etag_from_response(&resp),
        })
    }

    /// Complete a multipart upload. Returns the ETag.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        mut parts: Vec<UploadPart>,
    ) -> StorageResult<String> {
        parts.sort_by_key(|p| p.part_number);
        let parts_xml = parts
            .iter()
            .map(|p| {
                format!(
                    "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                    p.part_number, p.etag
                )
            })
            .collect::<String>();
        let body = format!("<CompleteMultipartUpload>{}</CompleteMultipartUpload>", parts_xml).into_bytes();

        let payload_hash = sha256_hex(&body);
        let path = format!("/{}/{}", bucket, key);
        let extra = [
            ("Content-Type", "application/xml".to_string()),
            ("Content-Length", body.len().to_string()),
        ];
        let headers = self.signed_headers("POST", &path, &extra, &payload_hash)?;

        let url = format!(
            "{}{}?uploadId={}",
            self.endpoint,
            path,
            urlencoding::encode(upload_id)
        );
        let resp = self.send(Method::POST, url, headers, Some(body)).await?;
        Ok(etag_from_response(&resp))
    }

    /// Abort a multipart upload
    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StorageResult<()> {
        let path = format!("/{}/{}", bucket, key);
        let headers = self.signed_headers("DELETE", &path, &[], UNSIGNED_PAYLOAD)?;
        let url = format!(
            "{}{}?uploadId={}",
            self.endpoint,
            path,
            urlencoding::encode(upload_id)
        );
        self.send(Method::DELETE, url, headers, None).await?;
        Ok(())
    }

    /// Upload a large object, splitting it into parts when it exceeds
    /// `part_size`. Aborts the multipart upload if any part fails.
    pub async fn upload_large_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        part_size: usize,
        content_type: &str,
    ) -> StorageResult<String> {
        if data.len() <= part_size {
            return self.put_object(bucket, key, data, content_type).await;
        }

        let upload = self.create_multipart_upload(bucket, key, content_type).await?;

        match self
            .upload_parts(bucket, key, &upload.upload_id, &data, part_size)
            .await
        {
            Ok(parts) => {
                self.complete_multipart_upload(bucket, key, &upload.upload_id, parts)
                    .await
            }
            Err(e) => {
                let _ = self
                    .abort_multipart_upload(bucket, key, &upload.upload_id)
                    .await;
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        data: &[u8],
        part_size: usize,
    ) -> StorageResult<Vec<UploadPart>> {
        let mut parts = Vec::new();
        for (i, chunk) in data.chunks(part_size).enumerate() {
            let part = self
                .upload_part(bucket, key, upload_id, (i + 1) as u32, chunk.to_vec())
                .await?;
            parts.push(part);
        }
        Ok(parts)
    }
}

fn etag_from_response(resp: &reqwest::Response) -> String {
    resp.headers()
        .get("ETag")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim_matches('"')
        .to_string()
}
