//! Inbox digest: newsletter filtering, summarization and attribution QA.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod report;
