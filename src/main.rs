mod config;
mod harvester;
mod html_parser;
mod ipc;
mod network_client;
mod session;
mod status_server;
mod supervisor;
mod utils;

#[cfg(test)]
mod test_support;

use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use log::{error, info, warn};
use tokio::io::BufReader;
use tokio::process::Command;
use url::Url;

use config::{HarvestConfig, Intervals};
use harvester::Harvester;
use network_client::PanelClient;
use session::SessionManager;

// Custom Application Error Type
#[derive(Debug)]
pub enum AppError {
    Network(network_client::NetworkError),
    Bind(status_server::BindError),
    Io(std::io::Error),
    UrlParse(url::ParseError),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Network(err) => write!(f, "Network error: {}", err),
            AppError::Bind(err) => write!(f, "Listener error: {}", err),
            AppError::Io(err) => write!(f, "IO error: {}", err),
            AppError::UrlParse(err) => write!(f, "URL parsing error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Network(err) => Some(err),
            AppError::Bind(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::UrlParse(err) => Some(err),
        }
    }
}

impl From<network_client::NetworkError> for AppError {
    fn from(err: network_client::NetworkError) -> Self {
        AppError::Network(err)
    }
}

impl From<status_server::BindError> for AppError {
    fn from(err: status_server::BindError) -> Self {
        AppError::Bind(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err)
    }
}

impl From<url::ParseError> for AppError {
    fn from(err: url::ParseError) -> Self {
        AppError::UrlParse(err)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Port for the local status endpoint.
    #[clap(long, env = "PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    #[clap(flatten)]
    harvest: HarvestArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the harvesting agent in the foreground (normally spawned by the supervisor).
    Harvest(HarvestArgs),
}

#[derive(ClapArgs, Debug, Clone)]
struct HarvestArgs {
    /// Cookie string copied from a logged-in browser session.
    #[clap(long, env = "COOKIES", default_value = "", hide_env_values = true)]
    cookies: String,

    #[clap(long, env = "PANEL_URL", default_value = config::DEFAULT_PANEL_URL)]
    panel_url: String,

    #[clap(long, env = "STORE_ID", default_value = config::DEFAULT_STORE_ID)]
    store_id: String,

    #[clap(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = config::HEARTBEAT_INTERVAL.as_millis() as u64)]
    heartbeat_interval_ms: u64,

    #[clap(long, env = "DISPLAY_INTERVAL_MS", default_value_t = config::DISPLAY_INTERVAL.as_millis() as u64)]
    display_interval_ms: u64,

    #[clap(long, env = "SESSION_REFRESH_INTERVAL_MS", default_value_t = config::SESSION_REFRESH_INTERVAL.as_millis() as u64)]
    session_refresh_interval_ms: u64,

    #[clap(long, env = "EARN_REQUEST_INTERVAL_MS", default_value_t = config::EARN_REQUEST_INTERVAL.as_millis() as u64)]
    earn_request_interval_ms: u64,

    #[clap(long, env = "LOGIN_RETRY_DELAY_MS", default_value_t = config::LOGIN_RETRY_DELAY.as_millis() as u64)]
    login_retry_delay_ms: u64,
}

impl HarvestArgs {
    fn to_config(&self) -> Result<HarvestConfig, url::ParseError> {
        let base_url = Url::parse(&self.panel_url)?;
        Ok(HarvestConfig::new(base_url, self.store_id.clone(), self.cookies.clone()).with_intervals(Intervals {
            heartbeat: Duration::from_millis(self.heartbeat_interval_ms),
            display: Duration::from_millis(self.display_interval_ms),
            session_refresh: Duration::from_millis(self.session_refresh_interval_ms),
            earn_request: Duration::from_millis(self.earn_request_interval_ms),
            login_retry: Duration::from_millis(self.login_retry_delay_ms),
        }))
    }

    /// Environment handed to the agent child so it sees the same settings.
    fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("COOKIES", self.cookies.clone()),
            ("PANEL_URL", self.panel_url.clone()),
            ("STORE_ID", self.store_id.clone()),
            ("HEARTBEAT_INTERVAL_MS", self.heartbeat_interval_ms.to_string()),
            ("DISPLAY_INTERVAL_MS", self.display_interval_ms.to_string()),
            ("SESSION_REFRESH_INTERVAL_MS", self.session_refresh_interval_ms.to_string()),
            ("EARN_REQUEST_INTERVAL_MS", self.earn_request_interval_ms.to_string()),
            ("LOGIN_RETRY_DELAY_MS", self.login_retry_delay_ms.to_string()),
        ]
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match args.command {
        Some(Commands::Harvest(harvest_args)) => harvest(harvest_args.to_config()?).await,
        None => serve(args.port, &args.harvest).await,
    }
}

async fn serve(port: u16, harvest_args: &HarvestArgs) -> Result<(), AppError> {
    let mut agent = Command::new(std::env::current_exe()?);
    agent.arg("harvest").envs(harvest_args.to_env());

    match supervisor::run(port, agent).await {
        Err(AppError::Bind(err)) if err.is_fatal_exit() => {
            error!("{}", err);
            std::process::exit(1);
        }
        other => other,
    }
}

async fn harvest(config: HarvestConfig) -> Result<(), AppError> {
    if config.cookies.trim().is_empty() {
        warn!("COOKIES is empty; login will almost certainly fail");
    }

    let client = PanelClient::new(&config)?;
    let manager = SessionManager::new(client, config.clone());
    let (status_tx, status_rx) = ipc::status_channel();

    tokio::spawn(async move {
        if let Err(e) = ipc::forward_messages(status_rx, tokio::io::stdout()).await {
            warn!("Could not forward status to supervisor: {}", e);
        }
    });
    tokio::spawn(async {
        match ipc::wait_for_stop(BufReader::new(tokio::io::stdin())).await {
            Ok(ipc::StopReason::Requested) => {
                info!("Received stop signal from parent process");
                std::process::exit(0);
            }
            Ok(ipc::StopReason::Eof) => {}
            Err(e) => warn!("Could not read supervisor messages: {}", e),
        }
    });

    Harvester::new(manager, config, status_tx).run().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_come_from_constants() {
        let args = Args::parse_from(["sillycoins-harvester", "--cookies", "a=b"]);
        assert!(args.command.is_none());
        let config = args.harvest.to_config().unwrap();
        assert_eq!(config.intervals, Intervals::default());
        assert_eq!(config.base_url.as_str(), "https://panel.sillydev.co.uk/");
        assert_eq!(config.store_id, config::DEFAULT_STORE_ID);
    }

    #[test]
    fn harvest_subcommand_parses_overrides() {
        let args = Args::parse_from([
            "sillycoins-harvester",
            "harvest",
            "--cookies",
            "a=b",
            "--panel-url",
            "http://127.0.0.1:8080",
            "--heartbeat-interval-ms",
            "250",
        ]);
        let Some(Commands::Harvest(harvest_args)) = args.command else {
            panic!("expected harvest subcommand");
        };
        let config = harvest_args.to_config().unwrap();
        assert_eq!(config.cookies, "a=b");
        assert_eq!(config.intervals.heartbeat, Duration::from_millis(250));
        assert_eq!(config.origin(), "http://127.0.0.1:8080");
    }

    #[test]
    fn child_environment_mirrors_arguments() {
        let args = Args::parse_from(["sillycoins-harvester", "--cookies", "x=1", "--store-id", "shop"]);
        let env = args.harvest.to_env();
        assert!(env.contains(&("COOKIES", "x=1".to_string())));
        assert!(env.contains(&("STORE_ID", "shop".to_string())));
    }

    #[test]
    fn invalid_panel_url_is_rejected() {
        let args = Args::parse_from(["sillycoins-harvester", "--panel-url", "not a url"]);
        assert!(args.harvest.to_config().is_err());
    }
}
