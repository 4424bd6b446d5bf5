//! Raw archive of a feed.
//!
//! Everything the feed delivers is appended to `<dir>/<filename>.<suffix>`.
//! On every start the previous files are rotated to
//! `<filename>.1.<suffix>`, `<filename>.2.<suffix>`, ... and only
//! `keep_files` of them survive.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use knive_core::config::ArchiveConfig;
use knive_core::{Error, Result};
use knive_pipeline::{Stage, StageContext, StageKind};

const SYNC_INTERVAL: Duration = Duration::from_secs(5);

pub struct Archiver {
    name: String,
    dir: PathBuf,
    config: ArchiveConfig,
    file: Option<File>,
    last_sync: Instant,
    written: u64,
}

impl Archiver {
    pub fn new(name: impl Into<String>, dir: PathBuf, config: ArchiveConfig) -> Self {
        Self {
            name: name.into(),
            dir,
            config,
            file: None,
            last_sync: Instant::now(),
            written: 0,
        }
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{}", self.config.filename, self.config.suffix))
    }

    fn rotated_path(&self, n: usize) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}", self.config.filename, n, self.config.suffix))
    }

    async fn rotate(&self) -> Result<()> {
        let current = self.current_path();
        if !exists(&current).await {
            return Ok(());
        }
        let keep = self.config.keep_files;
        if keep == 0 {
            tokio::fs::remove_file(&current).await?;
            return Ok(());
        }

        let oldest = self.rotated_path(keep);
        if exists(&oldest).await {
            tokio::fs::remove_file(&oldest).await?;
        }
        for n in (1..keep).rev() {
            let from = self.rotated_path(n);
            if exists(&from).await {
                tokio::fs::rename(&from, self.rotated_path(n + 1)).await?;
            }
        }
        tokio::fs::rename(&current, self.rotated_path(1)).await?;
        tracing::debug!("Archive '{}' rotated {}", self.name, current.display());
        Ok(())
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[async_trait]
impl Stage for Archiver {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    fn role(&self) -> &'static str {
        "archive"
    }

    async fn will_start(&mut self, _ctx: &StageContext) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        self.rotate().await?;
        let path = self.current_path();
        self.file = Some(File::create(&path).await?);
        self.last_sync = Instant::now();
        self.written = 0;
        tracing::info!("Archive '{}' writing to {}", self.name, path.display());
        Ok(())
    }

    async fn receive(&mut self, data: Bytes, _ctx: &StageContext) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Internal(format!("archive '{}' is not open", self.name)));
        };
        file.write_all(&data).await?;
        self.written += data.len() as u64;
        if self.last_sync.elapsed() >= SYNC_INTERVAL {
            file.sync_data().await?;
            self.last_sync = Instant::now();
        }
        Ok(())
    }

    async fn will_stop(&mut self, _ctx: &StageContext) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        tracing::info!("Archive '{}' closed after {} bytes", self.name, self.written);
        Ok(())
    }
}
