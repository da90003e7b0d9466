use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

/// Outbound HTTP capability used to fetch certificates and confirm subscriptions.
#[async_trait]
pub trait HttpApi: Send + Sync {
    /// Issues a GET request and returns the body of a 2xx response.
    async fn get(&self, url: &Url) -> Result<String, HttpApiError>;
}

/// Errors produced by outbound HTTP calls.
#[derive(Debug, Error)]
pub enum HttpApiError {
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// [`HttpApi`] implementation backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestHttpApi {
    http: Client,
}

impl ReqwestHttpApi {
    /// Builds a client whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, HttpApiError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    pub fn from_client(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HttpApi for ReqwestHttpApi {
    async fn get(&self, url: &Url) -> Result<String, HttpApiError> {
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<unavailable>"));
            return Err(HttpApiError::Status { status, body });
        }
        Ok(response.text().await?)
    }
}
