//! Export archive inspection

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::E2eResult;

/// Location of the packaged sources inside a trace directory.
pub fn sources_archive(trace_dir: &Path) -> PathBuf {
    trace_dir.join("files.user").join("sources.zip")
}

/// Entry names of a zip archive, in archive order.
pub fn list_entries(path: &Path) -> E2eResult<Vec<String>> {
    debug!("Listing archive: {}", path.display());
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        names.push(entry.name().to_string());
    }
    Ok(names)
}
