//! Snapshot downloads from the Hugging Face hub.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use glob::Pattern;
use hf_hub::api::tokio::{Api, ApiBuilder};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info};

use crate::error::{LoaderError, Result};

/// A filtered snapshot of one repository into a local directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub repo_id: String,
    pub local_dir: PathBuf,
    pub allow_patterns: Vec<String>,
    pub ignore_patterns: Vec<String>,
}

impl SnapshotRequest {
    pub fn new(repo_id: impl Into<String>, local_dir: impl AsRef<Path>) -> Self {
        Self {
            repo_id: repo_id.into(),
            local_dir: local_dir.as_ref().to_path_buf(),
            allow_patterns: Vec::new(),
            ignore_patterns: Vec::new(),
        }
    }

    pub fn allow(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.allow_patterns.extend(patterns);
        self
    }

    pub fn ignore(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.ignore_patterns.extend(patterns);
        self
    }

    pub fn compile(&self) -> Result<FileFilter> {
        Ok(FileFilter {
            allow: compile_patterns(&self.allow_patterns)?,
            ignore: compile_patterns(&self.ignore_patterns)?,
        })
    }

    /// Whether a repo-relative file name is part of the snapshot.
    /// Invalid patterns match nothing.
    pub fn matches(&self, file_name: &str) -> bool {
        self.compile()
            .map(|filter| filter.matches(file_name))
            .unwrap_or(false)
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            // a trailing slash selects a whole folder
            let expanded = if p.ends_with('/') {
                format!("{}*", p)
            } else {
                p.clone()
            };
            Pattern::new(&expanded).map_err(|e| LoaderError::Pattern {
                pattern: p.clone(),
                reason: e.msg.to_string(),
            })
        })
        .collect()
}

/// Compiled allow / ignore globs. `*` also matches across `/`.
#[derive(Debug, Clone)]
pub struct FileFilter {
    allow: Vec<Pattern>,
    ignore: Vec<Pattern>,
}

impl FileFilter {
    pub fn matches(&self, file_name: &str) -> bool {
        let allowed = self.allow.is_empty() || self.allow.iter().any(|p| p.matches(file_name));
        allowed && !self.ignore.iter().any(|p| p.matches(file_name))
    }
}

/// Remote side of a snapshot download.
pub trait SnapshotFetcher: Send + Sync {
    /// Write every file of `request.repo_id` that passes the filters into
    /// `request.local_dir`, keeping repo-relative paths.
    fn snapshot(&self, request: &SnapshotRequest) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetched {
    AlreadyPresent,
    Downloaded,
}

/// Fetch `request` unless `marker` already exists.
///
/// There is no lock around the check: two concurrent loads of the same model
/// may both download into the same directory.
pub fn ensure_snapshot(
    fetcher: &dyn SnapshotFetcher,
    request: &SnapshotRequest,
    marker: &Path,
) -> Result<Fetched> {
    if marker.exists() {
        debug!("{} present, skipping download", marker.display());
        return Ok(Fetched::AlreadyPresent);
    }
    info!(
        "Downloading {} to: {}",
        request.repo_id,
        request.local_dir.display()
    );
    fetcher.snapshot(request)?;
    Ok(Fetched::Downloaded)
}

/// Fetcher backed by the `hf-hub` client.
///
/// Downloads run on a current-thread runtime owned by the fetcher, built on
/// first use and shared between clones. `snapshot` blocks the caller, so it
/// must be called from synchronous code: inside an async runtime it returns
/// [`LoaderError::Runtime`] instead of downloading.
#[derive(Debug, Clone, Default)]
pub struct HfHubFetcher {
    cache_dir: Option<PathBuf>,
    token: Option<String>,
    progress: bool,
    runtime: Arc<OnceLock<Runtime>>,
}

impl HfHubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_dir(mut self, cache_dir: Option<PathBuf>) -> Self {
        self.cache_dir = cache_dir;
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    fn runtime(&self) -> Result<&Runtime> {
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime);
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| LoaderError::Runtime(e.to_string()))?;
        // a racing clone may have won, either runtime works
        let _ = self.runtime.set(runtime);
        self.runtime
            .get()
            .ok_or_else(|| LoaderError::Runtime("download runtime unavailable".to_string()))
    }

    fn api(&self, repo_id: &str) -> Result<Api> {
        let mut builder = ApiBuilder::new()
            .with_progress(self.progress)
            .with_token(self.token.clone());
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        builder.build().map_err(|source| LoaderError::Hub {
            repo_id: repo_id.to_string(),
            source,
        })
    }

    async fn download(&self, request: &SnapshotRequest, filter: &FileFilter) -> Result<usize> {
        let hub_err = |source| LoaderError::Hub {
            repo_id: request.repo_id.clone(),
            source,
        };
        let api = self.api(&request.repo_id)?;
        let repo = api.model(request.repo_id.clone());
        let listing = repo.info().await.map_err(hub_err)?;

        let files: Vec<&str> = listing
            .siblings
            .iter()
            .map(|s| s.rfilename.as_str())
            .filter(|name| filter.matches(name))
            .collect();
        debug!("{} of {} files selected", files.len(), listing.siblings.len());

        for name in &files {
            let cached = repo.get(name).await.map_err(hub_err)?;
            let target = request.local_dir.join(name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // real copies, the local directory must survive cache eviction
            std::fs::copy(&cached, &target)?;
            debug!("{} -> {}", name, target.display());
        }
        Ok(files.len())
    }
}

impl SnapshotFetcher for HfHubFetcher {
    fn snapshot(&self, request: &SnapshotRequest) -> Result<()> {
        if Handle::try_current().is_ok() {
            return Err(LoaderError::Runtime(format!(
                "cannot fetch {} from inside an async runtime, call the loader from a blocking thread",
                request.repo_id
            )));
        }
        let filter = request.compile()?;
        std::fs::create_dir_all(&request.local_dir)?;

        let count = self.runtime()?.block_on(self.download(request, &filter))?;

        info!(
            "Fetched {} files from {} into {}",
            count,
            request.repo_id,
            request.local_dir.display()
        );
        Ok(())
    }
}
