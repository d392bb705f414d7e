use std::sync::Arc;

use log::{error, info};
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue, ACCEPT, COOKIE, USER_AGENT};
use serde::{Deserialize, Deserializer};
use tokio::sync::RwLock;

use crate::config::HarvestConfig;
use crate::html_parser;
use crate::network_client::PanelClient;
use crate::utils;

static LOGIN_HEADERS: Lazy<HeaderMap> = Lazy::new(|| {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.0 Safari/605.1.15"));
    headers.insert(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9"));
    headers
});

/// Point-in-time capture of the account as the panel renders it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AccountSnapshot {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    /// Kept verbatim; the panel sends it as a decimal string.
    #[serde(default, deserialize_with = "string_or_number")]
    pub store_balance: String,
    #[serde(default, deserialize_with = "lenient_number")]
    pub store_cpu: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    pub store_memory: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    pub store_disk: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    pub store_slots: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    pub store_ports: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    pub store_backups: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    pub store_databases: f64,
}

impl AccountSnapshot {
    pub fn balance(&self) -> Option<f64> {
        self.store_balance.trim().parse::<f64>().ok().filter(|b| b.is_finite())
    }

    pub fn log_details(&self) {
        info!("Username: {}", self.username);
        info!("Email: {}", self.email);
        info!("Store Balance: {}", self.store_balance);
        info!("Store CPU: {}", self.store_cpu);
        info!("Store Memory: {}", self.store_memory);
        info!("Store Disk: {}", self.store_disk);
        info!("Store Slots: {}", self.store_slots);
        info!("Store Ports: {}", self.store_ports);
        info!("Store Backups: {}", self.store_backups);
        info!("Store Databases: {}", self.store_databases);
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {}", other))),
    }
}

fn lenient_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => Ok(n.as_f64().unwrap_or_default()),
        serde_json::Value::String(s) => Ok(s.trim().parse().unwrap_or_default()),
        _ => Ok(0.0),
    }
}

/// Authenticated header set plus the snapshot captured when it was created.
#[derive(Debug, Clone)]
pub struct Session {
    pub headers: HeaderMap,
    pub snapshot: AccountSnapshot,
}

impl Session {
    pub fn cookies(&self) -> &str {
        self.headers
            .get(COOKIE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
    }
}

/// Single-writer, multi-reader cell holding the current session.
///
/// Readers take a cheap `Arc` clone and never hold the lock across a request;
/// the refresh loop replaces the whole session in one write.
#[derive(Debug, Clone)]
pub struct SharedSession {
    inner: Arc<RwLock<Arc<Session>>>,
}

impl SharedSession {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(session))),
        }
    }

    pub async fn current(&self) -> Arc<Session> {
        Arc::clone(&*self.inner.read().await)
    }

    pub async fn replace(&self, session: Session) {
        *self.inner.write().await = Arc::new(session);
    }
}

fn set_cookie_header(headers: &mut HeaderMap, cookies: &str) -> Result<(), InvalidHeaderValue> {
    headers.insert(COOKIE, HeaderValue::from_str(cookies)?);
    Ok(())
}

/// Logs in with the pre-shared cookies and captures the account snapshot.
#[derive(Debug, Clone)]
pub struct SessionManager {
    client: PanelClient,
    config: HarvestConfig,
}

impl SessionManager {
    pub fn new(client: PanelClient, config: HarvestConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &PanelClient {
        &self.client
    }

    /// Runs the login flow. Every failure is logged and reported as `None`.
    pub async fn login(&self) -> Option<Session> {
        let mut headers = LOGIN_HEADERS.clone();
        let cookies = utils::normalize_cookies(&self.config.cookies);
        if let Err(e) = set_cookie_header(&mut headers, &cookies) {
            error!("Error occurred during login: configured cookies are not a valid header: {}", e);
            return None;
        }

        info!("Logging in...");
        let set_cookies = match self.client.fetch_login(&headers).await {
            Ok(set_cookies) => set_cookies,
            Err(e) => {
                error!("Error occurred during login: {}", e);
                return None;
            }
        };
        info!("Login successful");

        let cookie_header = utils::capture_set_cookies(&cookies, set_cookies.iter().map(String::as_str));
        if let Err(e) = set_cookie_header(&mut headers, &cookie_header) {
            error!("Error occurred during login: received cookies are not a valid header: {}", e);
            return None;
        }

        info!("Fetching user information...");
        let html = match self.client.fetch_credits_page(&headers).await {
            Ok(html) => html,
            Err(e) => {
                error!("Error occurred during login: {}", e);
                return None;
            }
        };
        info!("User information fetched");

        match html_parser::extract_account_snapshot(&html) {
            Ok(snapshot) => {
                info!("User information extracted successfully");
                snapshot.log_details();
                Some(Session { headers, snapshot })
            }
            Err(e) => {
                error!("Failed to extract user information: {}", e);
                None
            }
        }
    }
}
