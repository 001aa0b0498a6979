//! External command execution
//!
//! Every subprocess the pipeline starts goes through [`Cmd`]. Synchronous
//! calls treat a non-zero exit as fatal; there is no local recovery.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{E2eError, E2eResult};

/// A command line plus its working directory and environment overrides.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> E2eError {
        E2eError::Spawn {
            command: self.to_string(),
            source,
        }
    }

    fn check(&self, status: ExitStatus) -> E2eResult<ExitStatus> {
        if status.success() {
            Ok(status)
        } else {
            Err(E2eError::CommandFailed {
                command: self.to_string(),
                status,
            })
        }
    }

    /// Run to completion with output streamed to our own stdout/stderr.
    pub async fn run(&self) -> E2eResult<ExitStatus> {
        debug!("Running: {}", self);
        let status = self
            .command()
            .status()
            .await
            .map_err(|e| self.spawn_error(e))?;
        self.check(status)
    }

    /// Run to completion and return stdout as text.
    pub async fn capture(&self) -> E2eResult<String> {
        debug!("Capturing: {}", self);
        let output = self
            .command()
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        self.check(output.status)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Start in the background with a readable stdout pipe.
    pub fn spawn(&self) -> E2eResult<Child> {
        debug!("Spawning: {}", self);
        self.command()
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| self.spawn_error(e))
    }

    /// Blocking variant for `Drop` paths, where no runtime can be awaited.
    pub fn run_blocking(&self) -> E2eResult<ExitStatus> {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        let status = cmd.status().map_err(|e| self.spawn_error(e))?;
        self.check(status)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}
