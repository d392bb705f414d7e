use std::time::Duration;

use log::{debug, error, info, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_LENGTH, ORIGIN, REFERER};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::config::{HarvestConfig, Intervals, CREDITS_PATH};
use crate::html_parser;
use crate::ipc::{AgentMessage, StatusSender};
use crate::network_client::PanelClient;
use crate::session::{AccountSnapshot, Session, SessionManager, SharedSession};
use crate::utils;

/// Running total of coins earned, fed by consecutive balance observations.
///
/// The baseline is whatever balance was seen last; it is not reset when the
/// session is refreshed.
#[derive(Debug, Clone)]
pub struct EarningsTracker {
    last_snapshot: AccountSnapshot,
    last_balance: Option<f64>,
    initial_balance: Option<f64>,
    total_earned: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Changed { delta: f64, balance: f64 },
    Unchanged,
    /// Balance could not be read; nothing was updated.
    Unreadable,
}

impl EarningsTracker {
    pub fn new(snapshot: AccountSnapshot) -> Self {
        let balance = snapshot.balance();
        Self {
            last_snapshot: snapshot,
            last_balance: balance,
            initial_balance: balance,
            total_earned: 0.0,
        }
    }

    pub fn observe(&mut self, snapshot: AccountSnapshot) -> Observation {
        let Some(balance) = snapshot.balance() else {
            return Observation::Unreadable;
        };
        let previous = self.last_balance.replace(balance);
        self.initial_balance.get_or_insert(balance);
        self.last_snapshot = snapshot;

        match previous {
            Some(previous) if previous != balance => {
                let delta = balance - previous;
                self.total_earned += delta;
                Observation::Changed { delta, balance }
            }
            _ => Observation::Unchanged,
        }
    }

    pub fn total_earned(&self) -> f64 {
        self.total_earned
    }

    #[cfg(test)]
    pub fn last_snapshot(&self) -> &AccountSnapshot {
        &self.last_snapshot
    }

    pub fn status_line(&self) -> String {
        format!(
            "Username: {}, Current Balance: {}, Initial Balance: {}, Total Earned: {}",
            self.last_snapshot.username,
            self.last_snapshot.store_balance,
            self.initial_balance.unwrap_or_default(),
            self.total_earned
        )
    }
}

pub fn format_delta(delta: f64) -> String {
    if delta > 0.0 {
        format!("+{:.2}", delta)
    } else {
        format!("{:.2}", delta)
    }
}

#[derive(Debug, Serialize)]
struct HeartbeatRecord {
    timestamp: String,
    uid: String,
    message: &'static str,
}

impl HeartbeatRecord {
    fn new() -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            uid: utils::generate_heartbeat_uid(),
            message: "sent",
        }
    }
}

/// Re-reads the credits page on every tick and tracks balance movement.
pub struct PollLoop {
    client: PanelClient,
    session: SharedSession,
    tracker: EarningsTracker,
    status_tx: StatusSender,
    display_interval: Duration,
    last_display: Instant,
}

impl PollLoop {
    pub fn new(
        client: PanelClient,
        session: SharedSession,
        initial: AccountSnapshot,
        status_tx: StatusSender,
        display_interval: Duration,
    ) -> Self {
        Self {
            client,
            session,
            tracker: EarningsTracker::new(initial),
            status_tx,
            display_interval,
            last_display: Instant::now(),
        }
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &EarningsTracker {
        &self.tracker
    }

    pub async fn tick(&mut self) {
        let now = Instant::now();
        let session = self.session.current().await;

        match self.client.fetch_credits_page(&session.headers).await {
            Ok(html) => match html_parser::extract_account_snapshot(&html) {
                Ok(snapshot) => self.record(snapshot),
                Err(e) => warn!("Failed to extract user information during heartbeat: {}", e),
            },
            Err(e) => error!("Error occurred during heartbeat: {}", e),
        }

        if now.duration_since(self.last_display) >= self.display_interval {
            self.report_status();
            self.last_display = now;
        }
    }

    fn record(&mut self, snapshot: AccountSnapshot) {
        match self.tracker.observe(snapshot) {
            Observation::Changed { delta, balance } => {
                info!("Balance changed: {} coins", format_delta(delta));
                info!("Current Balance: {}, Total Earned: {}", balance, self.tracker.total_earned());
            }
            Observation::Unchanged => match serde_json::to_string(&HeartbeatRecord::new()) {
                Ok(record) => debug!("[HEARTBEAT] {}", record),
                Err(e) => debug!("[HEARTBEAT] unserialisable record: {}", e),
            },
            Observation::Unreadable => warn!("Balance on credits page is not a number; keeping previous snapshot"),
        }
    }

    fn report_status(&self) {
        let message = self.tracker.status_line();
        info!("{}", message);
        if self.status_tx.send(AgentMessage::Status { message }).is_err() {
            debug!("Status receiver closed; status not forwarded");
        }
    }

    /// Self-rescheduling: the next tick is queued only after this one finishes.
    pub async fn run(mut self, interval: Duration) {
        loop {
            self.tick().await;
            sleep(interval).await;
        }
    }
}

/// Headers for the claim POST: the session's own plus the XHR/CORS markers
/// and, when the session holds one, the decoded anti-forgery token.
pub fn claim_headers(session: &Session, origin: &str) -> HeaderMap {
    let mut headers = session.headers.clone();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    if let Ok(origin_val) = HeaderValue::from_str(origin) {
        headers.insert(ORIGIN, origin_val);
    }
    if let Ok(referer_val) = HeaderValue::from_str(&format!("{}{}", origin, CREDITS_PATH)) {
        headers.insert(REFERER, referer_val);
    }
    headers.insert(HeaderName::from_static("sec-fetch-dest"), HeaderValue::from_static("empty"));
    headers.insert(HeaderName::from_static("sec-fetch-mode"), HeaderValue::from_static("cors"));
    headers.insert(HeaderName::from_static("sec-fetch-site"), HeaderValue::from_static("same-origin"));
    headers.insert(HeaderName::from_static("x-requested-with"), HeaderValue::from_static("XMLHttpRequest"));

    if let Some(token) = utils::xsrf_token_from_cookies(session.cookies()) {
        match HeaderValue::from_str(&token) {
            Ok(value) => {
                headers.insert(HeaderName::from_static("x-xsrf-token"), value);
            }
            Err(e) => warn!("XSRF token is not a valid header value: {}", e),
        }
    }
    headers
}

/// Fires claim requests against the store endpoint.
pub struct ClaimLoop {
    client: PanelClient,
    session: SharedSession,
    origin: String,
}

impl ClaimLoop {
    pub fn new(client: PanelClient, session: SharedSession, origin: String) -> Self {
        Self { client, session, origin }
    }

    /// Sends one claim. Failures are logged here and go no further.
    pub async fn tick(&self) {
        let session = self.session.current().await;
        let headers = claim_headers(&session, &self.origin);

        info!("Sending earn request...");
        match self.client.submit_claim(&headers).await {
            Ok(body) => {
                info!("Earn request sent successfully");
                debug!("Earn response: {}", body);
            }
            Err(e) => {
                error!("Error occurred during earn request: {}", e);
                if let Some((status, body)) = e.api_response() {
                    error!("Response status: {}", status.as_u16());
                    error!("Response data: {}", body);
                }
            }
        }
    }

    pub async fn run(self, interval: Duration) {
        loop {
            self.tick().await;
            sleep(interval).await;
        }
    }
}

/// Periodically logs in again and swaps the shared session on success.
pub struct RefreshLoop {
    manager: SessionManager,
    session: SharedSession,
}

impl RefreshLoop {
    pub fn new(manager: SessionManager, session: SharedSession) -> Self {
        Self { manager, session }
    }

    pub async fn tick(&self) -> bool {
        info!("Refreshing session...");
        match self.manager.login().await {
            Some(session) => {
                self.session.replace(session).await;
                info!("Session refreshed successfully");
                true
            }
            None => {
                error!("Failed to refresh session");
                false
            }
        }
    }

    /// The first refresh happens one full interval after start.
    pub async fn run(self, interval: Duration) {
        loop {
            sleep(interval).await;
            self.tick().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    NotStarted,
    LoggingIn,
    RetryWait,
    Running,
}

/// Top-level driver: log in (retrying forever on a fixed delay), then start
/// the poll, claim and refresh loops.
pub struct Harvester {
    manager: SessionManager,
    config: HarvestConfig,
    status_tx: StatusSender,
    state: DriverState,
}

impl Harvester {
    pub fn new(manager: SessionManager, config: HarvestConfig, status_tx: StatusSender) -> Self {
        Self {
            manager,
            config,
            status_tx,
            state: DriverState::NotStarted,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> DriverState {
        self.state
    }

    fn transition(&mut self, next: DriverState) {
        debug!("Harvester state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub async fn establish_session(&mut self) -> Session {
        loop {
            self.transition(DriverState::LoggingIn);
            info!("Starting login process...");
            if let Some(session) = self.manager.login().await {
                return session;
            }

            self.transition(DriverState::RetryWait);
            error!("Failed to start heartbeat process due to login failure.");
            warn!("Retrying in {} seconds...", self.config.intervals.login_retry.as_secs());
            sleep(self.config.intervals.login_retry).await;
        }
    }

    /// Logs in and spawns the three loops; returns their handles.
    pub async fn start(&mut self) -> Vec<JoinHandle<()>> {
        let session = self.establish_session().await;
        self.transition(DriverState::Running);
        info!("Starting heartbeat process...");

        let intervals: Intervals = self.config.intervals;
        let initial = session.snapshot.clone();
        let shared = SharedSession::new(session);
        let client = self.manager.client().clone();

        let poll = PollLoop::new(
            client.clone(),
            shared.clone(),
            initial,
            self.status_tx.clone(),
            intervals.display,
        );
        let claim = ClaimLoop::new(client, shared.clone(), self.config.origin());
        let refresh = RefreshLoop::new(self.manager.clone(), shared);

        vec![
            tokio::spawn(poll.run(intervals.heartbeat)),
            tokio::spawn(claim.run(intervals.earn_request)),
            tokio::spawn(refresh.run(intervals.session_refresh)),
        ]
    }

    pub async fn run(mut self) {
        for handle in self.start().await {
            if let Err(e) = handle.await {
                error!("Harvest loop terminated: {}", e);
            }
        }
    }
}
