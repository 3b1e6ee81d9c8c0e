use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;

use worker_cache::caching::{Constructor, Resource};
use worker_cache::context::ContextRef;
use worker_cache::gc::{DisposeError, SizeError, SystemMonitor};

/// Describes a downloaded artifact.
#[derive(Clone, Debug, Serialize)]
pub struct ArtifactOptions {
    pub name: String,
    pub size: u64,
}

impl ArtifactOptions {
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_owned(),
            size,
        }
    }
}

/// An artifact file in the storage folder.
#[derive(Debug)]
pub struct Artifact {
    path: PathBuf,
}

impl Artifact {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Resource for Artifact {
    fn memory_size(&self) -> Result<u64, SizeError> {
        Ok(0)
    }

    fn disk_size(&self) -> Result<u64, SizeError> {
        fs::metadata(&self.path)
            .map(|metadata| metadata.len())
            .map_err(|e| SizeError::Other(e.into()))
    }

    fn dispose(&self) -> Result<(), DisposeError> {
        fs::remove_file(&self.path)
            .with_context(|| format!("failed to remove {}", self.path.display()))?;
        Ok(())
    }
}

/// "Downloads" artifacts by writing files of the requested size into a folder.
///
/// Every download gets its own file, so exclusive copies of the same artifact can be told apart.
#[derive(Clone)]
pub struct Downloader {
    dir: PathBuf,
    delay: Duration,
    downloads: Arc<AtomicUsize>,
}

impl Downloader {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_owned(),
            delay: Duration::ZERO,
            downloads: Default::default(),
        }
    }

    /// Makes every download take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

impl Constructor for Downloader {
    type Options = ArtifactOptions;
    type Resource = Artifact;

    const NAME: &'static str = "artifacts";

    fn construct(
        &self,
        ctx: ContextRef,
        options: ArtifactOptions,
    ) -> BoxFuture<'_, anyhow::Result<Artifact>> {
        async move {
            let download = self.downloads.fetch_add(1, Ordering::SeqCst);

            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.done() => anyhow::bail!("download of {} canceled", options.name),
            }

            let path = self.dir.join(format!("{}-{download}", options.name));
            fs::write(&path, vec![0u8; options.size as usize])
                .with_context(|| format!("failed to write {}", path.display()))?;
            ctx.progress("download", 1.0);

            Ok(Artifact { path })
        }
        .boxed()
    }
}

/// Reports free disk space as a fixed capacity minus the size of all files in a folder.
pub struct FolderMonitor {
    capacity: u64,
}

impl FolderMonitor {
    pub fn new(capacity: u64) -> Self {
        Self { capacity }
    }
}

impl SystemMonitor for FolderMonitor {
    fn free_disk_space(&self, path: &Path) -> io::Result<u64> {
        let mut used = 0;
        for entry in fs::read_dir(path)? {
            used += entry?.metadata()?.len();
        }
        Ok(self.capacity.saturating_sub(used))
    }

    fn available_memory(&self) -> u64 {
        u64::MAX
    }
}

/// Lists the file names in `dir`, sorted.
pub fn list_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
