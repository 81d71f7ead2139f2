use anyhow::{anyhow, Context, Result};
use log::debug;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Response};
use std::time::Duration;

use super::models::Listing;

/// Timeout for short control calls (ping/list/mkdir/delete).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
/// Connect timeout for all calls; streamed transfers carry no overall
/// deadline, a stalled connection surfaces as an I/O error instead.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for the file-serving API of a peer device.
pub struct PeerClient {
    client: Client,
}

impl PeerClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    fn url(host: &str, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", host, port, path)
    }

    /// Liveness probe against a peer.
    pub async fn ping(&self, host: &str, port: u16) -> Result<()> {
        let url = Self::url(host, port, "/api/v1/ping");
        let response = self
            .client
            .get(&url)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("ping failed for {}", url))?;
        if !response.status().is_success() {
            return Err(anyhow!("ping returned {} for {}", response.status(), url));
        }
        Ok(())
    }

    /// Fetch the listing of a remote path.
    pub async fn list(&self, host: &str, port: u16, path: &str) -> Result<Listing> {
        let url = Self::url(host, port, "/api/v1/list");
        debug!("GET {} path={}", url, path);
        let response = self
            .client
            .get(&url)
            .query(&[("path", path)])
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("list failed for {}:{}{}", host, port, path))?;
        if !response.status().is_success() {
            return Err(anyhow!("list returned {} for {}", response.status(), path));
        }
        response
            .json::<Listing>()
            .await
            .context("failed to parse listing")
    }

    /// Start a streaming download of a remote file. The caller drives
    /// the byte stream from the returned response.
    pub async fn download(&self, host: &str, port: u16, path: &str) -> Result<Response> {
        let url = Self::url(host, port, "/api/v1/file");
        debug!("GET {} path={}", url, path);
        let response = self
            .client
            .get(&url)
            .query(&[("path", path)])
            .send()
            .await
            .with_context(|| format!("download failed for {}:{}{}", host, port, path))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "download returned {} for {}",
                response.status(),
                path
            ));
        }
        Ok(response)
    }

    /// Upload a file into a remote directory as multipart field `file`.
    pub async fn upload(
        &self,
        host: &str,
        port: u16,
        parent_path: &str,
        file_name: &str,
        body: Body,
    ) -> Result<()> {
        let url = Self::url(host, port, "/api/v1/upload");
        debug!("POST {} path={} name={}", url, parent_path, file_name);
        let part = Part::stream(body)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")
            .context("invalid upload content type")?;
        let form = Form::new().part("file", part);
        let response = self
            .client
            .post(&url)
            .query(&[("path", parent_path)])
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("upload failed for {}/{}", parent_path, file_name))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "upload returned {} for {}/{}",
                response.status(),
                parent_path,
                file_name
            ));
        }
        Ok(())
    }

    /// Create a directory named `name` under a remote parent path.
    pub async fn mkdir(&self, host: &str, port: u16, parent_path: &str, name: &str) -> Result<()> {
        let url = Self::url(host, port, "/api/v1/mkdir");
        debug!("POST {} path={} name={}", url, parent_path, name);
        let response = self
            .client
            .post(&url)
            .query(&[("path", parent_path), ("name", name)])
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("mkdir failed for {}/{}", parent_path, name))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "mkdir returned {} for {}/{}",
                response.status(),
                parent_path,
                name
            ));
        }
        Ok(())
    }

    /// Recursively delete a remote path.
    pub async fn delete(&self, host: &str, port: u16, path: &str) -> Result<()> {
        let url = Self::url(host, port, "/api/v1/delete");
        debug!("POST {} path={}", url, path);
        let response = self
            .client
            .post(&url)
            .query(&[("path", path)])
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("delete failed for {}", path))?;
        if !response.status().is_success() {
            return Err(anyhow!("delete returned {} for {}", response.status(), path));
        }
        Ok(())
    }
}
