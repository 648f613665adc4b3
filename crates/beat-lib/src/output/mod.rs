//! Output pipeline and sinks
//!
//! This module provides:
//! - The [`Sink`] contract and the file, console and HTTP sinks
//! - A bounded send queue with exponential backoff
//! - The pipeline worker that batches events and drives delivery

mod console;
mod file;
mod http;
mod pipeline;
mod retry;


pub use console::ConsoleSink;
pub use file::FileSink;
pub use http::{classify_status, HttpSink};
pub use pipeline::{OutputPipeline, PipelineOutcome, PipelineSettings, PipelineStats};
pub use retry::{BackoffPolicy, RetryQueue};

use crate::config::OutputConfig;
use crate::error::SendError;
use crate::models::Batch;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Destination accepting batches
///
/// A sink only ever sees a shared borrow of the batch.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one batch
    async fn send(&self, batch: &Batch) -> Result<(), SendError>;

    /// Flush and release resources once the pipeline is done
    async fn close(&self) -> Result<(), SendError> {
        Ok(())
    }
}

/// Build the sink selected by the output configuration
///
/// Settings that can never work (such as an unparsable URL) are fatal here.
pub fn create_sink(config: &OutputConfig) -> Result<Arc<dyn Sink>, SendError> {
    match config {
        OutputConfig::File {
            path,
            filename,
            rotate_every_bytes,
            number_of_files,
        } => Ok(Arc::new(FileSink::new(
            path.clone(),
            filename.clone(),
            *rotate_every_bytes,
            *number_of_files,
        )?)),
        OutputConfig::Console => Ok(Arc::new(ConsoleSink::new())),
        OutputConfig::Http { url, timeout_ms } => Ok(Arc::new(HttpSink::new(
            url,
            Duration::from_millis(*timeout_ms),
        )?)),
    }
}
