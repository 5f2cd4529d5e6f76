use std::path::Path;

use bytes::Bytes;
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::file_info::{decode_listing, FileRecord};

/// Characters `encodeURIComponent` leaves alone besides alphanumerics.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub fn encode_name(name: &str) -> String {
    utf8_percent_encode(name, COMPONENT).to_string()
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServerStatus {
    pub status: String,
    pub time: String,
}

/// Thin client over the file server REST API. No retries at this layer.
#[derive(Debug, Clone)]
pub struct FileClient {
    client: Client,
    server: String,
}

impl FileClient {
    pub fn new(server: impl Into<String>) -> Result<FileClient> {
        let client = Client::builder().build()?;
        Ok(FileClient::with_client(client, server))
    }

    pub fn with_client(client: Client, server: impl Into<String>) -> FileClient {
        let server = server.into().trim_end_matches('/').to_string();
        FileClient { client, server }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    fn file_url(&self, name: &str) -> String {
        self.url(&format!("/api/files/{}", encode_name(name)))
    }

    /// Upload `content` as multipart field `file` and return the record to cache.
    pub async fn upload(&self, name: &str, content: Vec<u8>) -> Result<FileRecord> {
        let size = content.len() as u64;
        let part = Part::bytes(content).file_name(name.to_string());
        let form = Form::new().part("file", part);

        tracing::info!("upload {} ({} bytes) to {}", name, size, self.server);
        let res = self
            .client
            .post(self.url("/api/upload"))
            .multipart(form)
            .send()
            .await?;
        check("upload", res).await?;
        Ok(FileRecord::new(name, size, Utc::now()))
    }

    pub async fn upload_path(&self, path: &Path) -> Result<FileRecord> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Validation(format!("no file name in {}", path.display())))?
            .to_string();
        let content = tokio::fs::read(path).await?;
        self.upload(&name, content).await
    }

    pub async fn list(&self) -> Result<Vec<FileRecord>> {
        let res = self.client.get(self.url("/api/files")).send().await?;
        let body = check("list", res).await?.bytes().await?;
        let files = decode_listing(&body)?;
        for file in &files {
            tracing::debug!("load file info: {} (size: {})", file.name, file.size);
        }
        Ok(files)
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        tracing::info!("delete {} on {}", name, self.server);
        let res = self.client.delete(self.file_url(name)).send().await?;
        check("delete", res).await?;
        Ok(())
    }

    pub async fn fetch_content(&self, name: &str) -> Result<Bytes> {
        tracing::info!("download {} from {}", name, self.server);
        let res = self.client.get(self.file_url(name)).send().await?;
        Ok(check("download", res).await?.bytes().await?)
    }

    pub async fn status(&self) -> Result<ServerStatus> {
        let res = self.client.get(self.url("/api/status")).send().await?;
        let body = check("status", res).await?.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| Error::Decode(format!("server status: {}", e)))
    }
}

async fn check(operation: &'static str, res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let text = res.text().await.unwrap_or_default().trim().to_string();
    tracing::warn!("{} failed with {}: {}", operation, status, text);
    Err(Error::Transport {
        operation,
        status,
        text,
    })
}
