//! HttpFetcher - kernel tree と添付ファイルを HTTP で取得する SourceFetcher
//!
//! ```text
//! kernel_archive  -> linux-<rev>.partial/ -> linux-<rev>/   (top directory stripped)
//! kernel_config   -> config.partial       -> config
//! reproducer      -> bug.c.partial        -> bug.c -> <cc> -o bug bug.c
//! ```
//!
//! Downloads land next to their destination and are renamed into place, so a
//! destination that exists is always complete.

use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use reqwest::Client;
use tar::Archive;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::SourceSettings;
use crate::domain::{ReproError, TaskSources};
use crate::ports::SourceFetcher;
use crate::process::Cmd;
use crate::workspace::{WorkspacePaths, blocking};

pub const REPRODUCER_SOURCE_FILE_NAME: &str = "bug.c";

fn fetch_failed(what: &str, reason: impl ToString) -> ReproError {
    ReproError::FetchFailed {
        what: what.to_string(),
        reason: reason.to_string(),
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    dest.with_file_name(name)
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    reproducer_cc: Vec<String>,
}

impl HttpFetcher {
    pub fn new(settings: &SourceSettings) -> Result<Self, ReproError> {
        let mut builder =
            Client::builder().user_agent(concat!("dumpmind/", env!("CARGO_PKG_VERSION")));
        if let Some(proxy) = &settings.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| fetch_failed("proxy", e))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| fetch_failed("http client", e))?;
        Ok(Self {
            client,
            reproducer_cc: settings.reproducer_cc.clone(),
        })
    }

    /// Stream `url` into `dest`.
    async fn download(&self, what: &str, url: &str, dest: &Path) -> Result<(), ReproError> {
        info!(what, url, "downloading");
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fetch_failed(what, e))?;

        let partial = partial_path(dest);
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| ReproError::io(format!("create {}", partial.display()), e))?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(|e| fetch_failed(what, e))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| ReproError::io(format!("write {}", partial.display()), e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| ReproError::io(format!("write {}", partial.display()), e))?;
        drop(file);

        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| ReproError::io(format!("rename {}", partial.display()), e))?;
        debug!(what, bytes = written, dest = %dest.display(), "downloaded");
        Ok(())
    }

    async fn fetch_kernel(&self, url: &str, paths: &WorkspacePaths) -> Result<(), ReproError> {
        if paths.src_dir.exists() {
            debug!(src = %paths.src_dir.display(), "kernel source present");
            return Ok(());
        }
        let archive = paths.work_dir.join("linux.tar.gz");
        if !archive.is_file() {
            self.download("kernel source", url, &archive).await?;
        }

        let src = paths.src_dir.clone();
        let tarball = archive.clone();
        blocking(move || unpack_strip_top(&tarball, &src)).await?;
        info!(src = %paths.src_dir.display(), "kernel source unpacked");

        if let Err(e) = tokio::fs::remove_file(&archive).await {
            warn!(archive = %archive.display(), error = %e, "could not remove kernel archive");
        }
        Ok(())
    }

    async fn fetch_reproducer(&self, url: &str, paths: &WorkspacePaths) -> Result<(), ReproError> {
        if paths.trigger_path.is_file() {
            return Ok(());
        }
        let source = paths.work_dir.join(REPRODUCER_SOURCE_FILE_NAME);
        if !source.is_file() {
            self.download("reproducer", url, &source).await?;
        }

        let (program, lead) = self
            .reproducer_cc
            .split_first()
            .ok_or_else(|| fetch_failed("reproducer", "no compiler configured"))?;
        Cmd::new(program)
            .args(lead)
            .arg("-o")
            .arg(&paths.trigger_path)
            .arg(&source)
            .current_dir(&paths.work_dir)
            .error_msg("reproducer compile failed")
            .run()
            .await
            .map_err(|e| fetch_failed("reproducer", e))?;
        info!(trigger = %paths.trigger_path.display(), "reproducer compiled");
        Ok(())
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(
        &self,
        sources: &TaskSources,
        paths: &WorkspacePaths,
    ) -> Result<(), ReproError> {
        if let Some(url) = &sources.kernel_archive {
            self.fetch_kernel(url, paths).await?;
        }
        if let Some(url) = &sources.kernel_config {
            if !paths.kernel_config_path.is_file() {
                self.download("kernel config", url, &paths.kernel_config_path)
                    .await?;
            }
        }
        if let Some(url) = &sources.reproducer {
            self.fetch_reproducer(url, paths).await?;
        }
        Ok(())
    }
}

/// Unpack a `.tar.gz` into `dest`, dropping the archive's top-level directory.
///
/// Entries that would land outside `dest` are skipped.
fn unpack_strip_top(archive: &Path, dest: &Path) -> Result<(), ReproError> {
    let fail = |e: std::io::Error| fetch_failed("kernel source", e);

    let staging = partial_path(dest);
    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(fail)?;
    }
    std::fs::create_dir_all(&staging).map_err(fail)?;

    let file = File::open(archive).map_err(fail)?;
    let mut tar = Archive::new(GzDecoder::new(BufReader::new(file)));
    for entry in tar.entries().map_err(fail)? {
        let mut entry = entry.map_err(fail)?;
        let path = entry.path().map_err(fail)?.into_owned();
        let rel: PathBuf = path.components().skip(1).collect();
        if rel.as_os_str().is_empty()
            || !rel.components().all(|c| matches!(c, Component::Normal(_)))
        {
            continue;
        }
        let target = staging.join(&rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(fail)?;
        }
        entry.unpack(&target).map_err(fail)?;
    }

    std::fs::rename(&staging, dest).map_err(fail)
}
