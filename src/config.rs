use std::time::Duration;

use url::Url;

pub const DEFAULT_PANEL_URL: &str = "https://panel.sillydev.co.uk";
pub const DEFAULT_STORE_ID: &str = "livelaughsillydev";
pub const DEFAULT_PORT: u16 = 3000;

pub const LOGIN_PATH: &str = "/auth/login";
pub const CREDITS_PATH: &str = "/store/credits";
pub const CLAIM_PATH_PREFIX: &str = "/api/client/store/";

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_REDIRECTS: usize = 5;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5_000);
pub const DISPLAY_INTERVAL: Duration = Duration::from_millis(60_000);
pub const SESSION_REFRESH_INTERVAL: Duration = Duration::from_millis(900_000);
pub const EARN_REQUEST_INTERVAL: Duration = Duration::from_millis(60_000);
pub const LOGIN_RETRY_DELAY: Duration = Duration::from_millis(30_000);

/// Grace period the supervisor gives the agent to honour a stop message.
pub const CHILD_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    pub heartbeat: Duration,
    pub display: Duration,
    pub session_refresh: Duration,
    pub earn_request: Duration,
    pub login_retry: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            heartbeat: HEARTBEAT_INTERVAL,
            display: DISPLAY_INTERVAL,
            session_refresh: SESSION_REFRESH_INTERVAL,
            earn_request: EARN_REQUEST_INTERVAL,
            login_retry: LOGIN_RETRY_DELAY,
        }
    }
}

/// Everything the agent needs to talk to the panel.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub base_url: Url,
    pub store_id: String,
    /// Pre-shared cookie string, as copied from a logged-in browser.
    pub cookies: String,
    pub intervals: Intervals,
}

impl HarvestConfig {
    pub fn new(base_url: Url, store_id: impl Into<String>, cookies: impl Into<String>) -> Self {
        Self {
            base_url,
            store_id: store_id.into(),
            cookies: cookies.into(),
            intervals: Intervals::default(),
        }
    }

    pub fn with_intervals(mut self, intervals: Intervals) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn login_url(&self) -> Result<Url, url::ParseError> {
        self.base_url.join(LOGIN_PATH)
    }

    pub fn credits_url(&self) -> Result<Url, url::ParseError> {
        self.base_url.join(CREDITS_PATH)
    }

    pub fn claim_url(&self) -> Result<Url, url::ParseError> {
        self.base_url
            .join(&format!("{}{}", CLAIM_PATH_PREFIX, self.store_id))
    }

    /// `scheme://host[:port]` of the panel, used for the `Origin` header.
    pub fn origin(&self) -> String {
        self.base_url.origin().unicode_serialization()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_joined_onto_base_url() {
        let config = HarvestConfig::new(
            Url::parse("https://panel.example.test").unwrap(),
            "shop",
            "a=b",
        );

        assert_eq!(
            config.login_url().unwrap().as_str(),
            "https://panel.example.test/auth/login"
        );
        assert_eq!(
            config.credits_url().unwrap().as_str(),
            "https://panel.example.test/store/credits"
        );
        assert_eq!(
            config.claim_url().unwrap().as_str(),
            "https://panel.example.test/api/client/store/shop"
        );
        assert_eq!(config.origin(), "https://panel.example.test");
    }

    #[test]
    fn default_intervals_match_constants() {
        let intervals = Intervals::default();
        assert_eq!(intervals.heartbeat, Duration::from_secs(5));
        assert_eq!(intervals.display, Duration::from_secs(60));
        assert_eq!(intervals.session_refresh, Duration::from_secs(15 * 60));
        assert_eq!(intervals.earn_request, Duration::from_secs(60));
        assert_eq!(intervals.login_retry, Duration::from_secs(30));
    }
}
