//! Dry-run delivery: write the digest HTML to a file.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::error::PipelineError;
use crate::pipeline::types::DeliverySink;

pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DeliverySink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn deliver(&self, subject: &str, html_body: &str) -> Result<(), PipelineError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::Delivery(format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::write(&self.path, html_body)
            .await
            .map_err(|e| PipelineError::Delivery(format!("{}: {e}", self.path.display())))?;
        info!(path = %self.path.display(), subject, "Digest written");
        Ok(())
    }
}
