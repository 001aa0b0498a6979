//! Debugging-server lifecycle - spawning, URL discovery and interrupt shutdown

use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{E2eError, E2eResult};
use crate::process::Cmd;

/// How long to let the output forwarder drain after the server exits.
const FORWARDER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Ready,
    Stopped,
}

/// Handle to a running server process
pub struct ServerHandle {
    child: Child,
    base_url: String,
    state: ServerState,
    forwarder: Option<JoinHandle<()>>,
}

/// The URL announced on a server output line, if any.
///
/// The server has no readiness channel other than its stdout: the line whose
/// last whitespace-delimited token starts with an HTTP scheme carries the URL.
pub fn announced_url(line: &str) -> Option<&str> {
    let last = line.split_whitespace().last()?;
    (last.starts_with("http:") || last.starts_with("https:")).then_some(last)
}

async fn scan_for_url(lines: &mut Lines<BufReader<ChildStdout>>) -> std::io::Result<Option<String>> {
    while let Some(line) = lines.next_line().await? {
        info!("[server] {}", line);
        if let Some(url) = announced_url(&line) {
            return Ok(Some(url.to_string()));
        }
    }
    Ok(None)
}

impl ServerHandle {
    /// Spawn the server and block until it announces its URL.
    ///
    /// Closing stdout without an announcement is a startup failure, as is
    /// exceeding `startup_timeout` when one is given.
    pub async fn start(cmd: &Cmd, startup_timeout: Option<Duration>) -> E2eResult<Self> {
        info!("Starting server: {}", cmd);
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| E2eError::ServerStartup("stdout was not captured".to_string()))?;

        let mut handle = ServerHandle {
            child,
            base_url: String::new(),
            state: ServerState::Starting,
            forwarder: None,
        };
        let mut lines = BufReader::new(stdout).lines();

        let scanned = match startup_timeout {
            Some(limit) => match timeout(limit, scan_for_url(&mut lines)).await {
                Ok(result) => result,
                Err(_) => {
                    drop(lines);
                    handle.shutdown().await.ok();
                    return Err(E2eError::ServerStartup(format!(
                        "no URL announced within {}s",
                        limit.as_secs()
                    )));
                }
            },
            None => scan_for_url(&mut lines).await,
        };

        // Nothing reads stdout during a failed-start shutdown, so release the
        // pipe first or a server that logs on SIGINT can block on it.
        let url = match scanned {
            Ok(Some(url)) => url,
            Ok(None) => {
                drop(lines);
                let status = handle.shutdown().await.ok();
                return Err(E2eError::ServerStartup(match status {
                    Some(status) => format!("stdout closed before a URL was announced ({})", status),
                    None => "stdout closed before a URL was announced".to_string(),
                }));
            }
            Err(e) => {
                drop(lines);
                handle.shutdown().await.ok();
                return Err(e.into());
            }
        };

        // Keep draining stdout so the server never blocks on a full pipe.
        handle.forwarder = Some(tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                info!("[server] {}", line);
            }
        }));
        handle.base_url = url;
        handle.state = ServerState::Ready;

        info!("Server is ready at {}", handle.base_url);
        Ok(handle)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Interrupt the server and wait for it to exit.
    ///
    /// Never a forced kill: the server flushes persisted state on SIGINT.
    pub async fn stop(mut self) -> E2eResult<ExitStatus> {
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> E2eResult<ExitStatus> {
        info!("Stopping server (pid: {:?})", self.child.id());
        self.interrupt();
        let status = self.child.wait().await?;
        self.state = ServerState::Stopped;

        if let Some(forwarder) = self.forwarder.take() {
            if timeout(FORWARDER_DRAIN, forwarder).await.is_err() {
                warn!("Server output still open after exit, detaching forwarder");
            }
        }

        info!("Server exited with {}", status);
        Ok(status)
    }

    fn interrupt(&self) {
        if let Some(pid) = self.child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                warn!("Failed to interrupt server pid {}: {}", pid, e);
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.state != ServerState::Stopped {
            warn!("Server handle dropped while running, sending SIGINT");
            self.interrupt();
        }
    }
}
