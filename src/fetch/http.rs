//! HTTP origin speaking the hub `resolve` URL scheme.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, StatusCode};

use super::error::FetchError;
use super::origin::{RemoteBody, RemoteOrigin};

pub const DEFAULT_ORIGIN: &str = "https://huggingface.co";

const USER_AGENT: &str = concat!("gg-depot/", env!("CARGO_PKG_VERSION"));

/// `GET {base}/{repository}/resolve/{revision}/{file}`, with an optional bearer token.
pub struct HttpOrigin {
    client: Client,
    base: String,
    token: Option<String>,
}

impl HttpOrigin {
    pub fn new(base: &str, token: Option<String>, connect_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn url(&self, repository: &str, revision: &str, file: &str) -> String {
        format!("{}/{}/resolve/{}/{}", self.base, repository, revision, file)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

fn transport_error(file: &str, err: reqwest::Error) -> FetchError {
    FetchError::Transient {
        file: file.to_string(),
        reason: if err.is_timeout() {
            "request timed out".to_string()
        } else if err.is_connect() {
            format!("connection failed: {err}")
        } else {
            err.to_string()
        },
        status: err.status().map(|s| s.as_u16()),
    }
}

#[async_trait]
impl RemoteOrigin for HttpOrigin {
    async fn open(&self, repository: &str, revision: &str, file: &str) -> Result<RemoteBody, FetchError> {
        let url = self.url(repository, revision, file);
        tracing::debug!(url = %url, "GET");
        let resp = self
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(|e| transport_error(file, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(file, status.as_u16()));
        }

        let content_length = resp.content_length();
        let name = file.to_string();
        let stream = resp
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| transport_error(&name, e)))
            .boxed();
        Ok(RemoteBody { content_length, stream })
    }

    async fn probe(&self, repository: &str, revision: &str, file: &str) -> Result<bool, FetchError> {
        let url = self.url(repository, revision, file);
        let resp = self
            .request(Method::HEAD, &url)
            .send()
            .await
            .map_err(|e| transport_error(file, e))?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(false),
            s => Err(FetchError::from_status(file, s.as_u16())),
        }
    }

    fn name(&self) -> &str {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_url_layout() {
        let origin = HttpOrigin::new("https://huggingface.co/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(
            origin.url("openai-community/gpt2", "main", "model.safetensors"),
            "https://huggingface.co/openai-community/gpt2/resolve/main/model.safetensors"
        );
    }

    #[test]
    fn test_blank_token_is_dropped() {
        let origin = HttpOrigin::new(DEFAULT_ORIGIN, Some("  ".into()), Duration::from_secs(5)).unwrap();
        assert!(origin.token.is_none());
    }
}
