//! Error types for the smoke-test pipeline

use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Command failed: `{command}` exited with {status}")]
    CommandFailed { command: String, status: ExitStatus },

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Timeout after {:.1}s waiting for: {what}", .after.as_secs_f64())]
    Timeout { what: String, after: Duration },

    #[error("Too many retries ({attempts}) for: {what}")]
    TooManyRetries { what: String, attempts: u32 },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("WebDriver error ({code}): {message}")]
    WebDriver { code: String, message: String },

    #[error("JavaScript error: {0}")]
    Javascript(String),

    #[error("No element matches selector: {0}")]
    NoSuchElement(String),

    #[error("Top-level lookup of `{selector}` while frame `{frame}` is active")]
    FrameContext { selector: String, frame: String },

    #[error("Stage ran before its input was available: {0}")]
    MissingFact(&'static str),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl E2eError {
    /// Errors that mean "the condition is not true yet" while polling.
    pub fn is_transient(&self) -> bool {
        match self {
            E2eError::Javascript(_) | E2eError::NoSuchElement(_) => true,
            E2eError::WebDriver { code, .. } => {
                code == "stale element reference" || code == "no such frame"
            }
            E2eError::Http(e) => e.is_connect(),
            _ => false,
        }
    }
}

pub type E2eResult<T> = Result<T, E2eError>;
