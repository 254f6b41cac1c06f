//! Screenshot files: `<handle>_<YYYYMMDD_HHMMSS>.png` in one flat directory.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tokio::fs::{self, OpenOptions};
use tracing::debug;

pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates an empty file for the capture. Concurrent reservations for the
    /// same handle and second get a numeric suffix.
    pub async fn reserve(&self, handle: &str, at: DateTime<Utc>) -> io::Result<ReservedArtifact> {
        fs::create_dir_all(&self.dir).await?;
        let stem = format!("{}_{}", sanitize(handle), at.format("%Y%m%d_%H%M%S"));
        for attempt in 0u32..1000 {
            let name = if attempt == 0 {
                format!("{stem}.png")
            } else {
                format!("{stem}_{attempt}.png")
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(_) => return Ok(ReservedArtifact { path, armed: true }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
        Err(io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free artifact name for {stem}"),
        ))
    }
}

/// A reserved capture file. Removed when dropped unless [`keep`] was called,
/// so a cancelled render never leaves an empty PNG behind.
///
/// [`keep`]: ReservedArtifact::keep
#[derive(Debug)]
pub struct ReservedArtifact {
    path: PathBuf,
    armed: bool,
}

impl ReservedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }

    pub async fn discard(mut self) {
        self.armed = false;
        remove_quietly_async(&self.path).await;
    }
}

impl Drop for ReservedArtifact {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { remove_quietly_async(&path).await });
            }
            Err(_) => {
                if let Err(err) = std::fs::remove_file(&path) {
                    log_remove_failure(&path, &err);
                }
            }
        }
    }
}

async fn remove_quietly_async(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        log_remove_failure(path, &err);
    }
}

fn log_remove_failure(path: &Path, err: &io::Error) {
    if err.kind() != ErrorKind::NotFound {
        debug!(path = %path.display(), error = %err, "failed to discard artifact");
    }
}

/// Non-empty file starting with the PNG signature.
pub async fn is_valid_png(path: &Path) -> bool {
    match fs::read(path).await {
        Ok(bytes) => bytes.len() > PNG_SIGNATURE.len() && bytes.starts_with(&PNG_SIGNATURE),
        Err(_) => false,
    }
}

fn sanitize(handle: &str) -> String {
    handle
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
