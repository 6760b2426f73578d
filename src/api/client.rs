//! HTTP client with bearer-token injection for the Harbor API.

use reqwest::{Client, Response};
use serde::Serialize;

use crate::error::FsError;

/// HTTP client wrapper for Harbor API communication.
///
/// Manages the base URL and bearer token; all JSON endpoints go through the
/// typed helpers in the sibling modules.
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    /// Create a new API client for the given base URL and token.
    pub fn new(base_url: &str, token: &str) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// Send a GET request to a relative API path.
    pub async fn get(&self, path: &str) -> Result<Response, reqwest::Error> {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await
    }

    /// Send a POST request with a JSON body.
    pub async fn post_json<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Response, reqwest::Error> {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
    }

    /// Send a PUT request with a JSON body.
    pub async fn put_json<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Response, reqwest::Error> {
        self.client
            .put(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
    }

    /// Send a PUT request with a raw byte body (block uploads).
    pub async fn put_bytes(&self, path: &str, body: Vec<u8>) -> Result<Response, reqwest::Error> {
        self.client
            .put(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await
    }

    /// Send a DELETE request to a relative API path.
    pub async fn delete(&self, path: &str) -> Result<Response, reqwest::Error> {
        self.client
            .delete(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await
    }
}

/// Error envelope the service returns with non-success statuses.
#[derive(serde::Deserialize)]
struct ErrorBody {
    errors: Vec<String>,
}

/// Map an HTTP status onto the error taxonomy, reading the body for context.
pub async fn check_status(resp: Response) -> Result<Response, FsError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.errors.join("; "))
        .unwrap_or(body);
    Err(match status.as_u16() {
        404 => FsError::NotFound,
        401 | 403 => FsError::PermissionDenied,
        409 | 412 => FsError::Conflict,
        _ => FsError::Transient(format!("HTTP {status}: {detail}")),
    })
}
