use reqwest::header::{HeaderMap, SET_COOKIE};
use reqwest::{redirect, Client, Error as ReqwestError, Response, StatusCode};
use std::time::Instant;
use log::debug;
use url::Url;

use crate::config::{HarvestConfig, MAX_REDIRECTS, REQUEST_TIMEOUT};

#[derive(Debug)]
pub enum NetworkError {
    Reqwest(ReqwestError),
    ApiError { status: StatusCode, message: String },
    UrlParseError(url::ParseError),
}

impl From<ReqwestError> for NetworkError {
    fn from(err: ReqwestError) -> NetworkError {
        NetworkError::Reqwest(err)
    }
}

impl From<url::ParseError> for NetworkError {
    fn from(err: url::ParseError) -> NetworkError {
        NetworkError::UrlParseError(err)
    }
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::Reqwest(e) => write!(f, "HTTP request error: {}", e),
            NetworkError::ApiError { status, message } => write!(f, "API error ({}): {}", status, message),
            NetworkError::UrlParseError(e) => write!(f, "URL parsing error: {}", e),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Reqwest(e) => Some(e),
            NetworkError::ApiError { .. } => None,
            NetworkError::UrlParseError(e) => Some(e),
        }
    }
}

impl NetworkError {
    /// HTTP status and body for errors the panel answered with.
    pub fn api_response(&self) -> Option<(StatusCode, &str)> {
        match self {
            NetworkError::ApiError { status, message } => Some((*status, message.as_str())),
            _ => None,
        }
    }
}

/// Thin wrapper over a `reqwest::Client` bound to the panel's endpoints.
///
/// Certificate validation is off, redirects are followed up to five hops and
/// every request is bounded by a ten second timeout.
#[derive(Debug, Clone)]
pub struct PanelClient {
    client: Client,
    login_url: Url,
    credits_url: Url,
    claim_url: Url,
}

impl PanelClient {
    pub fn new(config: &HarvestConfig) -> Result<Self, NetworkError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            login_url: config.login_url()?,
            credits_url: config.credits_url()?,
            claim_url: config.claim_url()?,
        })
    }

    /// GETs the login page and returns every `Set-Cookie` value it answered with.
    pub async fn fetch_login(&self, headers: &HeaderMap) -> Result<Vec<String>, NetworkError> {
        let response = self.get(&self.login_url, headers, "fetch_login").await?;
        let response = ensure_success(response, "Failed to fetch login page").await?;
        Ok(response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect())
    }

    /// GETs the credits page HTML, which embeds the account object.
    pub async fn fetch_credits_page(&self, headers: &HeaderMap) -> Result<String, NetworkError> {
        let response = self.get(&self.credits_url, headers, "fetch_credits_page").await?;
        let response = ensure_success(response, "Failed to fetch credits page").await?;
        Ok(response.text().await?)
    }

    /// POSTs an empty body to the claim endpoint and returns the response body.
    pub async fn submit_claim(&self, headers: &HeaderMap) -> Result<String, NetworkError> {
        debug!("[API] Sending POST to claim URL: {}", self.claim_url);
        let start_time = Instant::now();
        let response_result = self
            .client
            .post(self.claim_url.clone())
            .headers(headers.clone())
            .body(Vec::new())
            .send()
            .await;
        debug!("[TIMING] submit_claim to {} took {:.2?}", self.claim_url, start_time.elapsed());

        let response = ensure_success(response_result?, "Claim request rejected").await?;
        Ok(response.text().await?)
    }

    async fn get(&self, url: &Url, headers: &HeaderMap, label: &str) -> Result<Response, NetworkError> {
        let start_time = Instant::now();
        let response_result = self.client.get(url.clone()).headers(headers.clone()).send().await;
        debug!("[TIMING] {} for {} took {:.2?}", label, url, start_time.elapsed());
        Ok(response_result?)
    }
}

async fn ensure_success(response: Response, context: &str) -> Result<Response, NetworkError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status_code = response.status();
    let error_text = match response.text().await {
        Ok(text) => text,
        Err(e) => format!("Failed to read error body (detail: {}). Original status: {}", e, status_code),
    };
    debug!("[API] {}: {} {}", context, status_code, error_text);
    Err(NetworkError::ApiError {
        status: status_code,
        message: error_text,
    })
}
