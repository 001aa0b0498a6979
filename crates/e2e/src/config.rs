//! Smoke-test configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{E2eError, E2eResult};

/// Complete run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmokeConfig {
    pub workspace: WorkspaceConfig,
    pub tools: ToolsConfig,
    pub server: ServerConfig,
    pub browser: BrowserConfig,
    pub checks: ChecksConfig,
}

/// Work directory layout and the sample project under test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Fixed work root (a fresh temp dir when unset)
    pub root: Option<PathBuf>,

    /// Sample project repository
    pub sample_repo: String,

    /// Pinned sample project revision
    pub sample_revision: String,

    /// Directory the sample project is cloned into
    pub sample_dir: String,

    /// Directory holding the bind-mounted alias
    pub alias_dir: String,

    /// Server storage directory
    pub storage_dir: String,

    /// Build entry point, relative to the sample project
    pub build_script: PathBuf,

    /// Executable to record, relative to the sample project
    pub executable: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: None,
            sample_repo: "https://github.com/Pernosco/pernosco-submit-test".to_string(),
            sample_revision: "84861f84a7462c2b4e04b7b41f7f83616c83c8dc".to_string(),
            sample_dir: "pernosco-submit-test".to_string(),
            alias_dir: "alias".to_string(),
            storage_dir: "storage".to_string(),
            build_script: PathBuf::from("./build.sh"),
            executable: PathBuf::from("out/main"),
        }
    }
}

/// External programs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub git: PathBuf,
    pub sudo: PathBuf,
    pub docker: PathBuf,
    pub tracer: PathBuf,
    pub server: PathBuf,
    pub geckodriver: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            git: PathBuf::from("git"),
            sudo: PathBuf::from("sudo"),
            docker: PathBuf::from("docker"),
            tracer: PathBuf::from("rr"),
            server: PathBuf::from("./pernosco"),
            geckodriver: PathBuf::from("geckodriver"),
        }
    }
}

/// Debugging-server invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// User id the server runs its containers as
    pub user: u32,

    /// Log spec passed via `--log`
    pub log: String,

    /// Run `pull` before building the database
    pub pull: bool,

    /// Source root served under its own name
    pub system_sources: PathBuf,

    /// Seconds to wait for the URL announcement (0 = no limit)
    pub startup_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            user: 1200,
            log: "info:/proc/self/fd/2".to_string(),
            pull: true,
            system_sources: PathBuf::from("/usr"),
            startup_timeout_secs: 600,
        }
    }
}

impl ServerConfig {
    pub fn startup_timeout(&self) -> Option<Duration> {
        (self.startup_timeout_secs > 0).then(|| Duration::from_secs(self.startup_timeout_secs))
    }
}

/// Browser automation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,

    /// geckodriver port (None = find a free port)
    pub webdriver_port: Option<u16>,

    /// Timeout for every UI wait
    pub ui_timeout_secs: u64,

    /// Upper bound on a single WebDriver command, page loads included
    pub command_timeout_secs: u64,

    /// Navigation attempts while the server is not accepting connections
    pub navigate_attempts: u32,

    pub navigate_delay_ms: u64,

    /// Pause before leaving the page so the server can persist edits
    pub flush_delay_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            webdriver_port: None,
            ui_timeout_secs: 60,
            command_timeout_secs: 120,
            navigate_attempts: 100,
            navigate_delay_ms: 50,
            flush_delay_ms: 2000,
        }
    }
}

impl BrowserConfig {
    pub fn ui_timeout(&self) -> Duration {
        Duration::from_secs(self.ui_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn navigate_delay(&self) -> Duration {
        Duration::from_millis(self.navigate_delay_ms)
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

/// Expected values asserted by the scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    /// Text typed into the notebook and read back after restart
    pub notebook_text: String,

    /// Source file expected in the export archive, relative to the root
    pub export_source: PathBuf,

    /// Whether archive entries are rooted at the alias directory
    pub export_alias_paths: bool,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            notebook_text: "HelloKitty".to_string(),
            export_source: PathBuf::from("pernosco-submit-test/out/message.h"),
            export_alias_paths: true,
        }
    }
}

impl SmokeConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> E2eResult<String> {
        toml::to_string_pretty(self).map_err(|e| E2eError::Config(e.to_string()))
    }

    pub fn validate(&self) -> E2eResult<()> {
        if self.browser.navigate_attempts == 0 {
            return Err(E2eError::Config("browser.navigate_attempts must be at least 1".to_string()));
        }
        if self.browser.command_timeout_secs == 0 {
            return Err(E2eError::Config("browser.command_timeout_secs must be at least 1".to_string()));
        }
        if self.checks.notebook_text.is_empty() {
            return Err(E2eError::Config("checks.notebook_text must not be empty".to_string()));
        }
        if self.checks.export_source.is_absolute() {
            return Err(E2eError::Config(format!(
                "checks.export_source must be relative to the work root: {}",
                self.checks.export_source.display()
            )));
        }
        Ok(())
    }
}
