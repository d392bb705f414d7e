use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::CHILD_STOP_GRACE;
use crate::ipc::{self, AgentMessage, SupervisorMessage};
use crate::status_server;
use crate::AppError;

/// A running agent child plus the tasks relaying its output and watching it exit.
pub struct AgentProcess {
    shutdown_tx: oneshot::Sender<Duration>,
    watcher: JoinHandle<Option<ExitStatus>>,
    relay: Option<JoinHandle<()>>,
}

impl AgentProcess {
    /// Spawns `command` with piped stdin/stdout. Every message the child
    /// writes to stdout is handed to `on_message`.
    pub fn spawn<F>(mut command: Command, on_message: F) -> std::io::Result<Self>
    where
        F: Fn(AgentMessage) + Send + 'static,
    {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let stdin = child.stdin.take();
        let relay = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(relay_messages(stdout, on_message)));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch(child, stdin, shutdown_rx));
        Ok(Self {
            shutdown_tx,
            watcher,
            relay,
        })
    }

    /// Asks the child to stop, killing it if it is still alive after `grace`.
    pub async fn stop(self, grace: Duration) -> Option<ExitStatus> {
        let _ = self.shutdown_tx.send(grace);
        let status = match self.watcher.await {
            Ok(status) => status,
            Err(e) => {
                error!("Agent watcher task failed: {}", e);
                None
            }
        };
        if let Some(relay) = self.relay {
            let _ = relay.await;
        }
        status
    }
}

async fn relay_messages<F>(stdout: ChildStdout, on_message: F)
where
    F: Fn(AgentMessage),
{
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<AgentMessage>(&line) {
                Ok(message) => on_message(message),
                Err(_) => info!("SillyCoins Harvester output: {}", line),
            },
            Ok(None) => break,
            Err(e) => {
                error!("Error in SillyCoins Harvester process: {}", e);
                break;
            }
        }
    }
}

async fn watch(
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    shutdown_rx: oneshot::Receiver<Duration>,
) -> Option<ExitStatus> {
    let grace = tokio::select! {
        status = child.wait() => return log_exit(status),
        grace = shutdown_rx => grace.unwrap_or(CHILD_STOP_GRACE),
    };

    if let Some(stdin) = stdin.as_mut() {
        if let Err(e) = send_stop(stdin).await {
            warn!("Could not send stop message to SillyCoins Harvester: {}", e);
        }
    }

    match timeout(grace, child.wait()).await {
        Ok(status) => log_exit(status),
        Err(_) => {
            warn!("SillyCoins Harvester did not stop within {:?}; killing it", grace);
            if let Err(e) = child.kill().await {
                error!("Error in SillyCoins Harvester process: {}", e);
            }
            log_exit(child.wait().await)
        }
    }
}

async fn send_stop(stdin: &mut ChildStdin) -> std::io::Result<()> {
    let line = ipc::encode_line(&SupervisorMessage::Stop).map_err(std::io::Error::other)?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

fn log_exit(status: std::io::Result<ExitStatus>) -> Option<ExitStatus> {
    match status {
        Ok(status) => {
            let code = status
                .code()
                .map_or_else(|| "none (terminated by signal)".to_string(), |c| c.to_string());
            info!("SillyCoins Harvester process exited with code {}", code);
            Some(status)
        }
        Err(e) => {
            error!("Error in SillyCoins Harvester process: {}", e);
            None
        }
    }
}

fn log_agent_message(message: AgentMessage) {
    match serde_json::to_string(&message) {
        Ok(json) => info!("Message from SillyCoins Harvester: {}", json),
        Err(e) => warn!("Unprintable message from SillyCoins Harvester: {}", e),
    }
}

/// Waits for SIGTERM or SIGINT and returns its name.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}", e);
            std::future::pending().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

/// Binds the status listener, spawns the agent and serves until a
/// termination signal arrives. The agent is never restarted.
pub async fn run(port: u16, agent: Command) -> Result<(), AppError> {
    let listener = status_server::bind(port).await?;
    info!("SillyCoins Harvester server listening on port {}", port);

    let process = match AgentProcess::spawn(agent, log_agent_message) {
        Ok(process) => Some(process),
        Err(e) => {
            error!("Error in SillyCoins Harvester process: {}", e);
            None
        }
    };

    axum::serve(listener, status_server::router())
        .with_graceful_shutdown(async {
            let signal = wait_for_shutdown_signal().await;
            info!("{} signal received: closing HTTP server", signal);
        })
        .await?;
    info!("HTTP server closed");

    if let Some(process) = process {
        process.stop(CHILD_STOP_GRACE).await;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[tokio::test]
    async fn relays_status_and_honours_stop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let process = AgentProcess::spawn(
            shell(r#"echo '{"type":"status","message":"hello"}'; echo not-json; read line; [ "$line" = '{"type":"stop"}' ] && exit 0; exit 3"#),
            move |message| sink.lock().unwrap().push(message),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = process.stop(Duration::from_secs(5)).await.expect("exit status");

        assert_eq!(status.code(), Some(0));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[AgentMessage::Status { message: "hello".to_string() }]
        );
    }

    #[tokio::test]
    async fn unresponsive_child_is_killed_after_grace() {
        let process = AgentProcess::spawn(shell("trap '' TERM; exec sleep 30"), |_| {}).unwrap();

        let started = std::time::Instant::now();
        let status = process.stop(Duration::from_millis(100)).await.expect("exit status");

        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn child_exit_is_observed_without_stop() {
        let process = AgentProcess::spawn(shell("exit 7"), |_| {}).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = process.stop(Duration::from_millis(10)).await.expect("exit status");

        assert_eq!(status.code(), Some(7));
    }
}
