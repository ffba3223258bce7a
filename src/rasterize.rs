//! PDF → page images via an external rasterizer (`pdftoppm` compatible).
//!
//! The tool is invoked as `<bin> -jpeg -f 1 -l <max_pages> <pdf> <prefix>`
//! and is expected to write `<prefix>-<n>.jpg` per page (`pdftoppm`
//! zero-pads `n` for longer documents). Output lands in a fresh
//! [`TempDir`] owned by the returned [`RasterizedPages`], so the images are
//! removed when it drops, on every exit path.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("rasterizer binary not found: {0}")]
    ToolMissing(String),
    #[error("rasterizer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("rasterizer produced no pages")]
    NoPages,
    #[error("rasterizer I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("canceled")]
    Canceled,
}

/// Page images in ascending page order. Dropping this removes the images.
#[derive(Debug)]
pub struct RasterizedPages {
    dir: TempDir,
    pub pages: Vec<PathBuf>,
}

impl RasterizedPages {
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Rasterizer {
    binary: String,
}

impl Rasterizer {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub async fn rasterize(
        &self,
        cancel: &CancellationToken,
        pdf: &Path,
        max_pages: u32,
    ) -> Result<RasterizedPages, RasterError> {
        let dir = tempfile::Builder::new().prefix("clens-raster-").tempdir()?;
        let prefix = dir.path().join("page");

        let child = tokio::process::Command::new(&self.binary)
            .arg("-jpeg")
            .arg("-f")
            .arg("1")
            .arg("-l")
            .arg(max_pages.max(1).to_string())
            .arg(pdf)
            .arg(&prefix)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => RasterError::ToolMissing(self.binary.clone()),
                _ => RasterError::Io(e),
            })?;

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(RasterError::Canceled),
            out = child.wait_with_output() => out?,
        };

        if !output.status.success() {
            return Err(RasterError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let pages = collect_pages(dir.path(), "page", max_pages as usize)?;
        if pages.is_empty() {
            return Err(RasterError::NoPages);
        }
        tracing::debug!(pdf = %pdf.display(), pages = pages.len(), "rasterized PDF");
        Ok(RasterizedPages { dir, pages })
    }
}

/// `<prefix>-<n>.jpg` files in `dir`, sorted by `n`, at most `limit`.
fn collect_pages(dir: &Path, prefix: &str, limit: usize) -> std::io::Result<Vec<PathBuf>> {
    let mut numbered = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(n) = page_number(name, prefix) {
            numbered.push((n, path));
        }
    }
    numbered.sort_by_key(|(n, _)| *n);
    Ok(numbered.into_iter().take(limit).map(|(_, p)| p).collect())
}

fn page_number(file_name: &str, prefix: &str) -> Option<u32> {
    let stem = file_name
        .strip_suffix(".jpg")
        .or_else(|| file_name.strip_suffix(".jpeg"))?;
    let number = stem.strip_prefix(prefix)?.strip_prefix('-')?;
    number.parse().ok()
}
