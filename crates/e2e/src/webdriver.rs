//! geckodriver-backed browser driver
//!
//! The WebDriver protocol itself is handled by `fantoccini`; this module
//! starts a private geckodriver, opens a Firefox session on it, and adapts
//! the session to [`BrowserDriver`]. Element and window handles cross the
//! trait boundary as opaque ids that index the live fantoccini objects.

use std::collections::HashMap;
use std::future::Future;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fantoccini::actions::{InputSource, KeyAction as WireKey, KeyActions};
use fantoccini::elements::Element;
use fantoccini::error::{CmdError, ErrorStatus};
use fantoccini::wd::{Capabilities, WindowHandle};
use fantoccini::{Client, ClientBuilder, Locator};
use hyper_util::client::legacy::connect::HttpConnector;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::browser::{BrowserDriver, BrowserLauncher, ElementRef, KeyAction};
use crate::error::{E2eError, E2eResult};
use crate::process::Cmd;
use crate::retry::Attempts;

/// Per-request limit while waiting for geckodriver to come up.
const STATUS_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// W3C code for a WebDriver error status.
fn status_code(status: &ErrorStatus) -> String {
    match status {
        ErrorStatus::JavascriptError => "javascript error".to_string(),
        ErrorStatus::NoSuchElement => "no such element".to_string(),
        ErrorStatus::NoSuchFrame => "no such frame".to_string(),
        ErrorStatus::NoSuchWindow => "no such window".to_string(),
        ErrorStatus::StaleElementReference => "stale element reference".to_string(),
        ErrorStatus::InvalidSessionId => "invalid session id".to_string(),
        ErrorStatus::SessionNotCreated => "session not created".to_string(),
        ErrorStatus::UnknownError => "unknown error".to_string(),
        other => format!("{:?}", other),
    }
}

/// Map a fantoccini command failure onto our error type.
fn command_error(e: CmdError) -> E2eError {
    match e {
        CmdError::Standard(wd) => match wd.error {
            ErrorStatus::JavascriptError => E2eError::Javascript(wd.message.to_string()),
            ErrorStatus::NoSuchElement => E2eError::NoSuchElement(wd.message.to_string()),
            ref status => E2eError::WebDriver {
                code: status_code(status),
                message: wd.message.to_string(),
            },
        },
        other => E2eError::WebDriver {
            code: "driver failure".to_string(),
            message: other.to_string(),
        },
    }
}

/// Run one WebDriver command, giving up after `limit`.
async fn bounded<T, F>(what: &str, limit: Duration, command: F) -> E2eResult<T>
where
    F: Future<Output = Result<T, CmdError>>,
{
    match timeout(limit, command).await {
        Ok(result) => result.map_err(command_error),
        Err(_) => Err(E2eError::Timeout {
            what: format!("WebDriver {}", what),
            after: limit,
        }),
    }
}

/// Keys travel as single code points; WebDriver special keys included.
fn key_char(key: &str) -> E2eResult<char> {
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(E2eError::WebDriver {
            code: "invalid argument".to_string(),
            message: format!("key action needs exactly one character, got {:?}", key),
        }),
    }
}

fn key_actions(actions: &[KeyAction]) -> E2eResult<KeyActions> {
    actions
        .iter()
        .try_fold(KeyActions::new("keyboard".to_string()), |sequence, action| {
            let step = match action {
                KeyAction::Down(key) => WireKey::Down { value: key_char(key)? },
                KeyAction::Up(key) => WireKey::Up { value: key_char(key)? },
            };
            Ok(sequence.then(step))
        })
}

/// New-session capabilities for Firefox.
pub fn firefox_capabilities(headless: bool) -> Capabilities {
    let args: Vec<&str> = if headless { vec!["-headless"] } else { Vec::new() };
    let mut caps = Capabilities::new();
    caps.insert("browserName".to_string(), json!("firefox"));
    caps.insert(
        "moz:firefoxOptions".to_string(),
        json!({
            "args": args,
            "prefs": {
                "network.websocket.delay-failed-reconnects": false,
                "devtools.console.stdout.content": true
            },
            "log": { "level": "trace" }
        }),
    );
    caps
}

/// Live driver objects keyed by the ids handed out through [`BrowserDriver`].
struct Handles<T> {
    prefix: &'static str,
    next: u64,
    live: HashMap<String, T>,
}

impl<T: Clone> Handles<T> {
    fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            next: 0,
            live: HashMap::new(),
        }
    }

    fn insert(&mut self, value: T) -> String {
        let id = format!("{}-{}", self.prefix, self.next);
        self.next += 1;
        self.live.insert(id.clone(), value);
        id
    }

    fn get(&self, id: &str) -> Option<T> {
        self.live.get(id).cloned()
    }

    fn clear(&mut self) {
        self.live.clear();
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Firefox session on a private geckodriver
pub struct GeckoDriver {
    client: Client,
    command_timeout: Duration,
    elements: Mutex<Handles<Element>>,
    windows: Mutex<Handles<WindowHandle>>,
    service: Mutex<Option<Child>>,
}

impl GeckoDriver {
    fn new(client: Client, command_timeout: Duration, service: Child) -> Self {
        Self {
            client,
            command_timeout,
            elements: Mutex::new(Handles::new("element")),
            windows: Mutex::new(Handles::new("window")),
            service: Mutex::new(Some(service)),
        }
    }

    fn element(&self, element: &ElementRef) -> E2eResult<Element> {
        locked(&self.elements)
            .get(&element.0)
            .ok_or_else(|| E2eError::WebDriver {
                code: "stale element reference".to_string(),
                message: format!("{} does not belong to the current page", element.0),
            })
    }

    async fn run<T, F>(&self, what: &str, command: F) -> E2eResult<T>
    where
        F: Future<Output = Result<T, CmdError>>,
    {
        bounded(what, self.command_timeout, command).await
    }

    fn stop_service(&self) -> Option<Child> {
        let mut child = locked(&self.service).take()?;
        if let Err(e) = child.start_kill() {
            warn!("Failed to stop geckodriver: {}", e);
        }
        Some(child)
    }
}

#[async_trait]
impl BrowserDriver for GeckoDriver {
    async fn navigate(&self, url: &str) -> E2eResult<()> {
        locked(&self.elements).clear();
        self.run("navigate", self.client.goto(url)).await
    }

    async fn find_element(&self, selector: &str) -> E2eResult<ElementRef> {
        let element = self
            .run("find element", self.client.find(Locator::Css(selector)))
            .await?;
        Ok(ElementRef(locked(&self.elements).insert(element)))
    }

    async fn element_text(&self, element: &ElementRef) -> E2eResult<String> {
        let element = self.element(element)?;
        self.run("element text", element.text()).await
    }

    async fn click(&self, element: &ElementRef) -> E2eResult<()> {
        let element = self.element(element)?;
        self.run("click", element.click()).await
    }

    async fn send_keys(&self, element: &ElementRef, text: &str) -> E2eResult<()> {
        let element = self.element(element)?;
        self.run("send keys", element.send_keys(text)).await
    }

    async fn perform_keys(&self, actions: &[KeyAction]) -> E2eResult<()> {
        let actions = key_actions(actions)?;
        self.run("key actions", self.client.perform_actions(actions)).await
    }

    async fn execute_script(&self, script: &str) -> E2eResult<Value> {
        self.run("execute script", self.client.execute(script, Vec::new()))
            .await
    }

    async fn switch_to_frame(&self, element: &ElementRef) -> E2eResult<()> {
        let element = self.element(element)?;
        self.run("enter frame", element.enter_frame()).await
    }

    async fn switch_to_window(&self, handle: &str) -> E2eResult<()> {
        let window = locked(&self.windows)
            .get(handle)
            .ok_or_else(|| E2eError::WebDriver {
                code: "no such window".to_string(),
                message: format!("unknown window {}", handle),
            })?;
        self.run("switch window", self.client.switch_to_window(window))
            .await
    }

    async fn window_handles(&self) -> E2eResult<Vec<String>> {
        let windows = self.run("window handles", self.client.windows()).await?;
        let mut handles = locked(&self.windows);
        Ok(windows.into_iter().map(|w| handles.insert(w)).collect())
    }

    async fn quit(&self) -> E2eResult<()> {
        let result = self.run("close session", self.client.clone().close()).await;
        if let Some(mut child) = self.stop_service() {
            child.wait().await?;
        }
        result
    }
}

impl Drop for GeckoDriver {
    fn drop(&mut self) {
        self.stop_service();
    }
}

/// Find a free local port to use
pub fn find_free_port() -> std::io::Result<u16> {
    Ok(TcpListener::bind("127.0.0.1:0")?.local_addr()?.port())
}

/// Launches Firefox through a private geckodriver instance.
#[derive(Debug, Clone)]
pub struct GeckoLauncher {
    pub geckodriver: PathBuf,
    pub port: Option<u16>,
    pub headless: bool,
    /// Budget for geckodriver to start accepting connections.
    pub connect: Attempts,
    /// Upper bound on any single WebDriver command.
    pub command_timeout: Duration,
}

impl GeckoLauncher {
    pub fn new(geckodriver: impl Into<PathBuf>, headless: bool) -> Self {
        Self {
            geckodriver: geckodriver.into(),
            port: None,
            headless,
            connect: Attempts::new(100, Duration::from_millis(50)),
            command_timeout: Duration::from_secs(120),
        }
    }

    async fn wait_for_status(&self, base_url: &str) -> E2eResult<()> {
        let http = &reqwest::Client::builder()
            .timeout(STATUS_REQUEST_TIMEOUT)
            .build()?;
        let status_url = &format!("{}/status", base_url);
        self.connect
            .retry(
                "geckodriver to accept connections",
                |e| matches!(e, E2eError::Http(_)),
                || async move {
                    http.get(status_url).send().await?.error_for_status()?;
                    Ok::<(), E2eError>(())
                },
            )
            .await
    }

    async fn open_session(&self, base_url: &str) -> E2eResult<Client> {
        let mut builder = ClientBuilder::new(HttpConnector::new());
        builder.capabilities(firefox_capabilities(self.headless));
        match timeout(self.command_timeout, builder.connect(base_url)).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => Err(E2eError::WebDriver {
                code: "session not created".to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(E2eError::Timeout {
                what: "WebDriver new session".to_string(),
                after: self.command_timeout,
            }),
        }
    }
}

#[async_trait]
impl BrowserLauncher for GeckoLauncher {
    type Driver = GeckoDriver;

    async fn launch(&self) -> E2eResult<GeckoDriver> {
        let port = match self.port {
            Some(port) => port,
            None => find_free_port()?,
        };
        let base_url = format!("http://127.0.0.1:{}", port);

        let mut child = Cmd::new(&self.geckodriver)
            .arg("--port")
            .arg(port.to_string())
            .spawn()?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[geckodriver] {}", line);
                }
            });
        }

        let session = match self.wait_for_status(&base_url).await {
            Ok(()) => self.open_session(&base_url).await,
            Err(e) => Err(e),
        };
        match session {
            Ok(client) => {
                info!("Browser session started on {}", base_url);
                Ok(GeckoDriver::new(client, self.command_timeout, child))
            }
            Err(e) => {
                child.start_kill().ok();
                Err(e)
            }
        }
    }
}
