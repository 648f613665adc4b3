//! File output
//!
//! Appends newline-delimited JSON and rotates by size, keeping a fixed number
//! of files: `name`, `name.1`, ... `name.{n-1}`.

use super::Sink;
use crate::error::SendError;
use crate::models::Batch;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

struct OpenFile {
    file: File,
    size: u64,
}

pub struct FileSink {
    dir: PathBuf,
    filename: String,
    rotate_every_bytes: u64,
    number_of_files: u32,
    current: Mutex<Option<OpenFile>>,
}

impl FileSink {
    pub fn new(
        dir: impl Into<PathBuf>,
        filename: impl Into<String>,
        rotate_every_bytes: u64,
        number_of_files: u32,
    ) -> Result<Self, SendError> {
        let filename = filename.into();
        if filename.is_empty() || filename.contains(std::path::MAIN_SEPARATOR) {
            return Err(SendError::Fatal(format!(
                "invalid output file name `{}`",
                filename
            )));
        }
        if number_of_files == 0 {
            return Err(SendError::Fatal(
                "number_of_files must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            dir: dir.into(),
            filename,
            rotate_every_bytes,
            number_of_files,
            current: Mutex::new(None),
        })
    }

    /// Path of the active file
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    fn rotated_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{}.{}", self.filename, index))
    }

    async fn open(&self) -> std::io::Result<OpenFile> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let size = file.metadata().await?.len();
        debug!(path = %path.display(), size = size, "Opened output file");
        Ok(OpenFile { file, size })
    }

    /// Shift `name.{i}` to `name.{i+1}` and the active file to `name.1`
    async fn rotate(&self) -> std::io::Result<()> {
        let keep = self.number_of_files;
        if keep <= 1 {
            return remove_if_exists(&self.path()).await;
        }

        remove_if_exists(&self.rotated_path(keep - 1)).await?;
        for index in (1..keep - 1).rev() {
            let from = self.rotated_path(index);
            if fs::try_exists(&from).await? {
                fs::rename(&from, self.rotated_path(index + 1)).await?;
            }
        }
        fs::rename(self.path(), self.rotated_path(1)).await?;

        info!(path = %self.path().display(), "Rotated output file");
        Ok(())
    }

    async fn write(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut current = self.current.lock().await;

        if let Some(open) = current.as_ref() {
            if open.size > 0 && open.size + payload.len() as u64 > self.rotate_every_bytes {
                *current = None;
                self.rotate().await?;
            }
        }

        if current.is_none() {
            *current = Some(self.open().await?);
        }

        let Some(open) = current.as_mut() else {
            return Ok(());
        };
        let result = match open.file.write_all(payload).await {
            Ok(()) => open.file.flush().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                open.size += payload.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Reopen on the next attempt
                *current = None;
                Err(e)
            }
        }
    }
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn send(&self, batch: &Batch) -> Result<(), SendError> {
        let payload = batch
            .to_ndjson()
            .map_err(|e| SendError::Fatal(format!("failed to encode batch: {}", e)))?;

        self.write(&payload).await.map_err(|e| {
            SendError::Transient(format!("write to {} failed: {}", self.path().display(), e))
        })
    }

    async fn close(&self) -> Result<(), SendError> {
        let mut current = self.current.lock().await;
        if let Some(open) = current.take() {
            open.file
                .sync_all()
                .await
                .map_err(|e| SendError::Transient(format!("sync failed: {}", e)))?;
        }
        Ok(())
    }
}
