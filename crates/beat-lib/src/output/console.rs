use super::Sink;
use crate::error::SendError;
use crate::models::Batch;
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

/// Writes each event to stdout as one JSON line
pub struct ConsoleSink {
    stdout: Mutex<Stdout>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, batch: &Batch) -> Result<(), SendError> {
        let payload = batch
            .to_ndjson()
            .map_err(|e| SendError::Fatal(format!("failed to encode batch: {}", e)))?;

        let mut stdout = self.stdout.lock().await;
        stdout
            .write_all(&payload)
            .await
            .map_err(|e| SendError::Transient(format!("stdout write failed: {}", e)))?;
        stdout
            .flush()
            .await
            .map_err(|e| SendError::Transient(format!("stdout flush failed: {}", e)))
    }
}
