//! In-process stand-in for the panel, served by axum on an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header::{CONTENT_LENGTH, COOKIE, ORIGIN, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::Mutex;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRecord {
    pub xsrf_token: Option<String>,
    pub requested_with: Option<String>,
    pub origin: Option<String>,
    pub cookie: Option<String>,
    pub content_length: Option<String>,
}

#[derive(Default)]
struct PanelInner {
    balance: String,
    credits_html: Option<String>,
    reject_claims: bool,
    login_cookie: Option<String>,
    credits_hits: usize,
    claims: Vec<ClaimRecord>,
}

type PanelState = Arc<Mutex<PanelInner>>;

pub struct FakePanel {
    addr: SocketAddr,
    state: PanelState,
}

impl FakePanel {
    pub async fn start(balance: &str) -> Self {
        let state: PanelState = Arc::new(Mutex::new(PanelInner {
            balance: balance.to_string(),
            ..PanelInner::default()
        }));
        let app = Router::new()
            .route("/auth/login", get(login))
            .route("/store/credits", get(credits))
            .route("/api/client/store/:id", post(claim))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind fake panel");
        let addr = listener.local_addr().expect("fake panel addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state }
    }

    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).expect("fake panel url")
    }

    pub async fn set_balance(&self, balance: &str) {
        self.state.lock().await.balance = balance.to_string();
    }

    pub async fn set_credits_html(&self, html: &str) {
        self.state.lock().await.credits_html = Some(html.to_string());
    }

    pub async fn reject_claims(&self) {
        self.state.lock().await.reject_claims = true;
    }

    pub async fn login_cookie(&self) -> Option<String> {
        self.state.lock().await.login_cookie.clone()
    }

    pub async fn credits_hits(&self) -> usize {
        self.state.lock().await.credits_hits
    }

    pub async fn claims(&self) -> Vec<ClaimRecord> {
        self.state.lock().await.claims.clone()
    }
}

/// A loopback URL nothing is listening on.
pub fn unreachable_url() -> Url {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
    let addr = listener.local_addr().expect("reserved addr");
    drop(listener);
    Url::parse(&format!("http://{}", addr)).expect("unreachable url")
}

pub fn credits_page(balance: &str) -> String {
    format!(
        r#"<html><head><script>window.JexactylUser = {{"username":"x","email":"x@example.test","store_balance":"{}","store_cpu":100,"store_memory":1024,"store_disk":2048,"store_slots":1,"store_ports":1,"store_backups":0,"store_databases":0}};</script></head><body></body></html>"#,
        balance
    )
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn login(State(state): State<PanelState>, headers: HeaderMap) -> Response {
    state.lock().await.login_cookie = header_string(&headers, COOKIE.as_str());

    let mut response = "ok".into_response();
    response
        .headers_mut()
        .append(SET_COOKIE, HeaderValue::from_static("XSRF-TOKEN=abc%3D; Path=/; SameSite=Lax"));
    response
        .headers_mut()
        .append(SET_COOKIE, HeaderValue::from_static("panel_session=fresh; Path=/; HttpOnly"));
    response
}

async fn credits(State(state): State<PanelState>) -> Html<String> {
    let mut inner = state.lock().await;
    inner.credits_hits += 1;
    match &inner.credits_html {
        Some(html) => Html(html.clone()),
        None => Html(credits_page(&inner.balance)),
    }
}

async fn claim(State(state): State<PanelState>, headers: HeaderMap) -> Response {
    let mut inner = state.lock().await;
    inner.claims.push(ClaimRecord {
        xsrf_token: header_string(&headers, "x-xsrf-token"),
        requested_with: header_string(&headers, "x-requested-with"),
        origin: header_string(&headers, ORIGIN.as_str()),
        cookie: header_string(&headers, COOKIE.as_str()),
        content_length: header_string(&headers, CONTENT_LENGTH.as_str()),
    });
    if inner.reject_claims {
        return (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response();
    }
    Json(serde_json::json!({ "success": true })).into_response()
}
