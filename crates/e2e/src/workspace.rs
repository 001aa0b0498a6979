//! Ephemeral filesystem state of one run
//!
//! ```text
//! <root>/<sample>/            cloned sample project
//! <root>/alias/<sample>/      bind mount of the above
//! <root>/<exe>-<n>/           trace directories
//! <root>/storage/             server persisted state
//! ```
//!
//! The root is never deleted: the server leaves files in it owned by its
//! execution user, which an unprivileged run cannot remove.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::WorkspaceConfig;
use crate::error::E2eResult;
use crate::process::Cmd;

/// Directory layout for a run
#[derive(Debug, Clone)]
pub struct WorkEnvironment {
    root: PathBuf,
    sample_dir: String,
    alias_dir: String,
    storage_dir: String,
}

impl WorkEnvironment {
    /// Use `root` if given, otherwise a fresh temporary directory that
    /// outlives the run.
    pub fn create(root: Option<&Path>, layout: &WorkspaceConfig) -> E2eResult<Self> {
        let root = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                root.to_path_buf()
            }
            None => tempfile::Builder::new()
                .prefix("onprem-smoke-")
                .tempdir()?
                .keep(),
        };

        info!("Working directory: {}", root.display());
        Ok(Self {
            root,
            sample_dir: layout.sample_dir.clone(),
            alias_dir: layout.alias_dir.clone(),
            storage_dir: layout.storage_dir.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the sample project is cloned and built.
    pub fn sample_dir(&self) -> PathBuf {
        self.root.join(&self.sample_dir)
    }

    pub fn alias_root(&self) -> PathBuf {
        self.root.join(&self.alias_dir)
    }

    /// The sample project reached through the alias prefix.
    pub fn sample_alias_dir(&self) -> PathBuf {
        self.alias_root().join(&self.sample_dir)
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.root.join(&self.storage_dir)
    }
}

/// One recorded execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHandle {
    pub id: u32,
    pub dir: PathBuf,
}

/// Predicts trace directory names the way the tracer assigns them:
/// `<executable name>-<n>`, counting from zero in recording order.
#[derive(Debug)]
pub struct TraceAllocator {
    root: PathBuf,
    prefix: String,
    next_id: u32,
}

impl TraceAllocator {
    pub fn new(root: impl Into<PathBuf>, executable: &Path) -> Self {
        let prefix = executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "trace".to_string());
        Self {
            root: root.into(),
            prefix,
            next_id: 0,
        }
    }

    pub fn allocate(&mut self) -> TraceHandle {
        let id = self.next_id;
        self.next_id += 1;
        TraceHandle {
            id,
            dir: self.root.join(format!("{}-{}", self.prefix, id)),
        }
    }
}

/// A bind mount that is unmounted on release, or best-effort on drop.
#[derive(Debug)]
pub struct BindMount {
    sudo: PathBuf,
    target: PathBuf,
    mounted: bool,
}

impl BindMount {
    pub async fn mount(sudo: &Path, source: &Path, target: &Path) -> E2eResult<Self> {
        info!("Mounting {} onto {}", source.display(), target.display());
        Cmd::new(sudo)
            .args(["mount", "--bind"])
            .arg(source)
            .arg(target)
            .run()
            .await?;
        Ok(Self {
            sudo: sudo.to_path_buf(),
            target: target.to_path_buf(),
            mounted: true,
        })
    }

    fn umount(&self) -> Cmd {
        Cmd::new(&self.sudo).arg("umount").arg(&self.target)
    }

    pub async fn release(mut self) -> E2eResult<()> {
        info!("Unmounting {}", self.target.display());
        self.umount().run().await?;
        self.mounted = false;
        Ok(())
    }
}

impl Drop for BindMount {
    fn drop(&mut self) {
        if self.mounted {
            warn!("Unmounting {} on drop", self.target.display());
            if let Err(e) = self.umount().run_blocking() {
                warn!("Failed to unmount {}: {}", self.target.display(), e);
            }
        }
    }
}
