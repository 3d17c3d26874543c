//! Azure Blob Storage backend for [`BlobStore`].
//!
//! Talks to the Blob REST API directly with `reqwest`. Write operations are
//! authorised with Shared Key; the OCR service gets a blob-scoped service SAS
//! with read permission only (`sp=r`, `sr=b`, `spr=https`) whose expiry is
//! part of the signature, so the storage service enforces it.

use super::storage::BlobStore;
use crate::error::ScanError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ring::hmac;
use std::collections::BTreeMap;
use tracing::debug;

const API_VERSION: &str = "2023-11-03";

/// Parsed `AZURE_STORAGE_CONNECTION_STRING`.
#[derive(Clone)]
pub struct StorageCredentials {
    pub account_name: String,
    account_key: Vec<u8>,
    /// Blob service endpoint without trailing slash.
    pub blob_endpoint: String,
}

impl std::fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("account_name", &self.account_name)
            .field("account_key", &"<redacted>")
            .field("blob_endpoint", &self.blob_endpoint)
            .finish()
    }
}

impl StorageCredentials {
    /// Parse a standard `Key=Value;Key=Value` connection string.
    ///
    /// Recognised keys: `AccountName`, `AccountKey`, `EndpointSuffix`,
    /// `DefaultEndpointsProtocol`, `BlobEndpoint`.
    pub fn from_connection_string(s: &str) -> Result<Self, ScanError> {
        let mut parts: BTreeMap<&str, &str> = BTreeMap::new();
        for segment in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // AccountKey values end in '=' padding, so split on the first '=' only.
            if let Some((k, v)) = segment.split_once('=') {
                parts.insert(k.trim(), v.trim());
            }
        }

        let account_name = parts
            .get("AccountName")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| missing("AccountName"))?
            .to_string();
        let key_b64 = parts
            .get("AccountKey")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| missing("AccountKey"))?;
        let account_key = STANDARD.decode(key_b64).map_err(|e| {
            ScanError::InvalidConfig(format!(
                "AccountKey in AZURE_STORAGE_CONNECTION_STRING is not valid base64 ({e}); \
                 copy it again from the storage account's access keys"
            ))
        })?;

        let blob_endpoint = match parts.get("BlobEndpoint") {
            Some(ep) if !ep.is_empty() => ep.trim_end_matches('/').to_string(),
            _ => {
                let protocol = parts.get("DefaultEndpointsProtocol").copied().unwrap_or("https");
                let suffix = parts.get("EndpointSuffix").copied().unwrap_or("core.windows.net");
                format!("{protocol}://{account_name}.blob.{suffix}")
            }
        };

        Ok(Self {
            account_name,
            account_key,
            blob_endpoint,
        })
    }

    fn sign(&self, string_to_sign: &str) -> String {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &self.account_key);
        STANDARD.encode(hmac::sign(&key, string_to_sign.as_bytes()).as_ref())
    }
}

fn missing(field: &str) -> ScanError {
    ScanError::MissingSetting {
        name: format!("AZURE_STORAGE_CONNECTION_STRING:{field}"),
        hint: format!("The storage connection string must contain {field}=…"),
    }
}

/// [`BlobStore`] backed by an Azure storage account.
pub struct AzureBlobStore {
    creds: StorageCredentials,
    client: reqwest::Client,
}

impl AzureBlobStore {
    pub fn new(creds: StorageCredentials, client: reqwest::Client) -> Self {
        Self { creds, client }
    }

    pub fn from_connection_string(s: &str, client: reqwest::Client) -> Result<Self, ScanError> {
        Ok(Self::new(StorageCredentials::from_connection_string(s)?, client))
    }

    fn blob_url(&self, container: &str, name: &str) -> String {
        format!("{}/{}/{}", self.creds.blob_endpoint, container, name)
    }

    /// Send a Shared Key signed request.
    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        extra_headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let mut ms_headers: BTreeMap<String, String> = BTreeMap::new();
        ms_headers.insert("x-ms-date".into(), date);
        ms_headers.insert("x-ms-version".into(), API_VERSION.into());
        for (k, v) in extra_headers {
            ms_headers.insert(k.to_ascii_lowercase(), v.to_string());
        }

        let content_length = if body.is_empty() {
            String::new()
        } else {
            body.len().to_string()
        };
        let content_type = if body.is_empty() {
            ""
        } else {
            "application/octet-stream"
        };
        let string_to_sign = shared_key_string_to_sign(
            method.as_str(),
            &content_length,
            content_type,
            &ms_headers,
            &self.creds.account_name,
            path,
            query,
        );
        let auth = format!(
            "SharedKey {}:{}",
            self.creds.account_name,
            self.creds.sign(&string_to_sign)
        );

        let url = format!("{}{}", self.creds.blob_endpoint, path);
        let mut req = self
            .client
            .request(method, url)
            .query(query)
            .header("Authorization", auth);
        if !content_type.is_empty() {
            req = req.header("Content-Type", content_type);
        }
        for (k, v) in &ms_headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req.body(body).send().await
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    fn name(&self) -> &str {
        "azure-blob"
    }

    async fn ensure_container(&self, container: &str) -> Result<(), ScanError> {
        let path = format!("/{container}");
        let resp = self
            .send(
                reqwest::Method::PUT,
                &path,
                &[("restype", "container")],
                &[],
                Vec::new(),
            )
            .await
            .map_err(|e| transport("create container", e))?;
        let status = resp.status().as_u16();
        match status {
            201 => {
                debug!("Created container {}", container);
                Ok(())
            }
            409 => Ok(()), // ContainerAlreadyExists
            _ => {
                let body = resp.text().await.unwrap_or_default();
                Err(ScanError::storage_status("create container", status, &body))
            }
        }
    }

    async fn upload(
        &self,
        container: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<String, ScanError> {
        let path = format!("/{container}/{name}");
        let resp = self
            .send(
                reqwest::Method::PUT,
                &path,
                &[],
                &[("x-ms-blob-type", "BlockBlob")],
                bytes,
            )
            .await
            .map_err(|e| transport("upload", e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ScanError::storage_status("upload", status.as_u16(), &body));
        }
        Ok(self.blob_url(container, name))
    }

    fn access_descriptor(
        &self,
        container: &str,
        name: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, ScanError> {
        let query = read_sas_query(&self.creds, container, name, Utc::now(), expires_at);
        let mut url = reqwest::Url::parse(&self.blob_url(container, name)).map_err(|e| {
            ScanError::AccessDescriptor {
                name: name.to_string(),
                detail: format!("bad blob URL: {e}"),
            }
        })?;
        url.query_pairs_mut().extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        Ok(url.to_string())
    }

    async fn delete(&self, container: &str, name: &str) -> Result<(), ScanError> {
        let path = format!("/{container}/{name}");
        let resp = self
            .send(reqwest::Method::DELETE, &path, &[], &[], Vec::new())
            .await
            .map_err(|e| transport("delete", e))?;
        let status = resp.status().as_u16();
        match status {
            202 | 404 => Ok(()),
            _ => {
                let body = resp.text().await.unwrap_or_default();
                Err(ScanError::storage_status("delete", status, &body))
            }
        }
    }
}

fn transport(operation: &str, e: reqwest::Error) -> ScanError {
    ScanError::Storage {
        operation: operation.to_string(),
        detail: e.to_string(),
        retryable: e.is_timeout() || e.is_connect() || e.is_request(),
    }
}

/// Build the Shared Key string-to-sign for the Blob service.
fn shared_key_string_to_sign(
    verb: &str,
    content_length: &str,
    content_type: &str,
    ms_headers: &BTreeMap<String, String>,
    account: &str,
    path: &str,
    query: &[(&str, &str)],
) -> String {
    let mut s = String::new();
    s.push_str(verb);
    s.push('\n');
    // Content-Encoding, Content-Language
    s.push_str("\n\n");
    s.push_str(content_length);
    s.push('\n');
    // Content-MD5
    s.push('\n');
    s.push_str(content_type);
    s.push('\n');
    // Date, If-Modified-Since, If-Match, If-None-Match, If-Unmodified-Since, Range
    s.push_str("\n\n\n\n\n\n");
    for (k, v) in ms_headers {
        s.push_str(k);
        s.push(':');
        s.push_str(v.trim());
        s.push('\n');
    }
    s.push('/');
    s.push_str(account);
    s.push_str(path);
    let mut sorted: Vec<(String, &str)> =
        query.iter().map(|(k, v)| (k.to_ascii_lowercase(), *v)).collect();
    sorted.sort();
    for (k, v) in sorted {
        s.push('\n');
        s.push_str(&k);
        s.push(':');
        s.push_str(v);
    }
    s
}

/// Query parameters of a read-only blob service SAS.
fn read_sas_query(
    creds: &StorageCredentials,
    container: &str,
    name: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Vec<(&'static str, String)> {
    // Allow for clock skew between this host and the storage service.
    let start = (now - ChronoDuration::minutes(5))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string();
    let expiry = expires_at.format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let resource = format!("/blob/{}/{}/{}", creds.account_name, container, name);

    let fields = [
        "r",               // signedPermissions
        start.as_str(),    // signedStart
        expiry.as_str(),   // signedExpiry
        resource.as_str(), // canonicalizedResource
        "",                // signedIdentifier
        "",                // signedIP
        "https",           // signedProtocol
        API_VERSION,       // signedVersion
        "b",               // signedResource
        "",                // signedSnapshotTime
        "",                // signedEncryptionScope
        "",                // rscc
        "",                // rscd
        "",                // rsce
        "",                // rscl
        "",                // rsct
    ];
    let signature = creds.sign(&fields.join("\n"));

    vec![
        ("sv", API_VERSION.to_string()),
        ("st", start),
        ("se", expiry),
        ("sr", "b".to_string()),
        ("sp", "r".to_string()),
        ("spr", "https".to_string()),
        ("sig", signature),
    ]
}
