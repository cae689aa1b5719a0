//! Diagnostic package collection.
//!
//! Bundles the sink artifacts under a log directory, filtered by a time
//! window on their modification timestamps, into a single gzip-compressed
//! JSON archive. A thin utility on top of the sinks, not a core algorithm.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One artifact captured into the package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagedFile {
    pub name: String,
    pub modified: DateTime<Utc>,
    pub contents: String,
}

/// The decompressed payload of a diagnostic package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManifest {
    pub created_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub files: Vec<PackagedFile>,
}

/// Summary returned to the caller after writing a package.
#[derive(Debug, Clone)]
pub struct PackageSummary {
    pub path: PathBuf,
    pub file_count: usize,
    pub bytes_written: u64,
}

/// Collect all files in `log_dir` modified within the window into a
/// gzipped JSON archive at `out_path`.
pub fn collect_diagnostics(
    log_dir: &Path,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    out_path: &Path,
) -> Result<PackageSummary, PackageError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified: DateTime<Utc> = meta.modified()?.into();
        if modified < window_start || modified > window_end {
            continue;
        }
        let bytes = fs::read(entry.path())?;
        files.push(PackagedFile {
            name: entry.file_name().to_string_lossy().into_owned(),
            modified,
            contents: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));

    let manifest = PackageManifest {
        created_at: Utc::now(),
        window_start,
        window_end,
        files,
    };

    let file = File::create(out_path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    serde_json::to_writer(&mut encoder, &manifest)?;
    let file = encoder.finish()?;
    let bytes_written = file.metadata()?.len();

    tracing::info!(
        path = %out_path.display(),
        files = manifest.files.len(),
        bytes = bytes_written,
        "diagnostic package written"
    );

    Ok(PackageSummary {
        path: out_path.to_path_buf(),
        file_count: manifest.files.len(),
        bytes_written,
    })
}

/// Read a previously written diagnostic package.
pub fn read_package(path: &Path) -> Result<PackageManifest, PackageError> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(file);
    Ok(serde_json::from_reader(decoder)?)
}
