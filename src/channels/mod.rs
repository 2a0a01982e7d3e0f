//! Mailbox sources and digest sinks.
//!
//! Pure I/O adapters behind `MailboxSource` / `DeliverySink`; no business
//! logic lives here.

pub mod file;
pub mod imap;
pub mod mime;
pub mod smtp;

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::pipeline::types::{DeliverySink, MailboxSource, MailboxWindow, RawEmail};

pub use file::FileSink;
pub use imap::{ImapConfig, ImapMailbox};
pub use smtp::{SmtpConfig, SmtpSink};

/// In-memory mailbox. Applies the window like a real server would.
pub struct StaticMailbox {
    emails: Vec<RawEmail>,
}

impl StaticMailbox {
    pub fn new(emails: Vec<RawEmail>) -> Self {
        Self { emails }
    }
}

#[async_trait]
impl MailboxSource for StaticMailbox {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self, window: MailboxWindow) -> Result<Vec<RawEmail>, PipelineError> {
        let mut emails: Vec<RawEmail> = self
            .emails
            .iter()
            .filter(|e| e.received_at >= window.since)
            .cloned()
            .collect();
        emails.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        emails.truncate(window.max_results);
        Ok(emails)
    }
}

/// In-memory sink that keeps every delivery.
#[derive(Default)]
pub struct MemorySink {
    deliveries: Mutex<Vec<(String, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivered (subject, html) pairs.
    pub fn deliveries(&self) -> Vec<(String, String)> {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeliverySink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, subject: &str, html_body: &str) -> Result<(), PipelineError> {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((subject.to_string(), html_body.to_string()));
        Ok(())
    }
}
