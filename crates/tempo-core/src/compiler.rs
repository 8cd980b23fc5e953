//! Client for the remote schema compiler service.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::types::CompileResult;

/// Base URL used when none is configured.
pub const DEFAULT_COMPILER_URL: &str = "http://localhost:3000";

const COMPILE_PATH: &str = "api/kumi/compile";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct CompileRequest<'a> {
    schema_src: &'a str,
}

#[derive(Deserialize)]
struct CompileFailure {
    #[serde(default)]
    errors: Vec<String>,
}

/// Posts schema sources to `{base}/api/kumi/compile`.
#[derive(Debug, Clone)]
pub struct CompilerClient {
    client: Client,
    endpoint: Url,
}

impl CompilerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self> {
        let endpoint = format!("{}/{}", base_url.trim_end_matches('/'), COMPILE_PATH);
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| Error::Config(format!("invalid compiler URL '{}': {}", base_url, e)))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Compile `schema_src`. Rejections surface the service's first error.
    pub async fn compile(&self, schema_src: &str) -> Result<CompileResult> {
        tracing::debug!("Compiling {} bytes via {}", schema_src.len(), self.endpoint);

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&CompileRequest { schema_src })
            .send()
            .await
            .map_err(|e| Error::Compile(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Compile(e.to_string()))?;

        if !status.is_success() {
            let message = failure_message(&body);
            tracing::debug!("Compiler rejected schema ({}): {}", status, message);
            return Err(Error::Compile(message));
        }

        Ok(serde_json::from_str(&body)?)
    }
}

/// First entry of a JSON `errors` array, else a plain-text body, else a
/// generic message.
fn failure_message(body: &str) -> String {
    match serde_json::from_str::<CompileFailure>(body) {
        Ok(failure) => failure.errors.into_iter().next(),
        Err(_) => Some(body.trim().to_string()).filter(|text| !text.is_empty()),
    }
    .unwrap_or_else(|| "Compilation failed".to_string())
}
