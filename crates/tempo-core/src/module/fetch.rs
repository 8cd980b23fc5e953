//! Transfer of raw module payloads.

use std::path::PathBuf;

use futures::FutureExt;
use futures::future::BoxFuture;
use url::Url;

use crate::error::LoadError;

/// Transfers the raw payload stored at a location.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, location: &str) -> BoxFuture<'static, Result<Vec<u8>, LoadError>>;
}

/// Fetches over HTTP(S). Non-2xx responses fail with the status and body.
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, location: &str) -> BoxFuture<'static, Result<Vec<u8>, LoadError>> {
        let client = self.client.clone();
        let location = location.to_string();

        async move {
            let io_error = |e: reqwest::Error| LoadError::Io {
                location: location.clone(),
                message: e.to_string(),
            };

            let response = client.get(&location).send().await.map_err(io_error)?;
            let status = response.status();

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = if body.trim().is_empty() {
                    status.canonical_reason().unwrap_or("request failed").to_string()
                } else {
                    body
                };
                tracing::warn!("Fetching {} failed with HTTP {}", location, status.as_u16());
                return Err(LoadError::Transfer {
                    status: status.as_u16(),
                    message,
                });
            }

            let bytes = response.bytes().await.map_err(io_error)?;
            Ok(bytes.to_vec())
        }
        .boxed()
    }
}

/// Reads payloads from the local filesystem (`file://` URLs or plain paths).
#[derive(Clone, Copy, Default)]
pub struct FileFetcher;

impl FileFetcher {
    fn path_of(location: &str) -> PathBuf {
        Url::parse(location)
            .ok()
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.to_file_path().ok())
            .unwrap_or_else(|| PathBuf::from(location))
    }
}

impl Fetcher for FileFetcher {
    fn fetch(&self, location: &str) -> BoxFuture<'static, Result<Vec<u8>, LoadError>> {
        let path = Self::path_of(location);
        let location = location.to_string();

        async move {
            tokio::fs::read(&path).await.map_err(|e| LoadError::Io {
                location,
                message: e.to_string(),
            })
        }
        .boxed()
    }
}

/// Dispatches on the location's scheme: `http`/`https` over HTTP, anything
/// else from the filesystem.
#[derive(Clone, Default)]
pub struct DefaultFetcher {
    http: HttpFetcher,
    file: FileFetcher,
}

impl DefaultFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Fetcher for DefaultFetcher {
    fn fetch(&self, location: &str) -> BoxFuture<'static, Result<Vec<u8>, LoadError>> {
        match Url::parse(location) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => self.http.fetch(location),
            _ => self.file.fetch(location),
        }
    }
}
