//! Shared types for the digest pipeline.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

// ── Raw email ───────────────────────────────────────────────────────

/// A fetched email. Immutable for the rest of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEmail {
    /// Stable per-mailbox identifier.
    pub id: String,
    /// `From` header, possibly with a display name (`Name <addr>`).
    pub sender: String,
    pub subject: String,
    /// Decoded plain-text body.
    pub body: String,
    pub received_at: DateTime<Utc>,
    /// Permalink back to the message; the ground truth for attribution.
    pub source_url: String,
}

impl RawEmail {
    /// The bare address of the sender, lowercased.
    ///
    /// `"Lenny <lenny@substack.com>"` → `"lenny@substack.com"`.
    pub fn sender_address(&self) -> String {
        bare_address(&self.sender)
    }
}

/// Strip a display name and angle brackets from an address header value.
pub fn bare_address(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if end > start => &trimmed[start + 1..end],
        _ => trimmed,
    };
    inner.trim().to_lowercase()
}

// ── Stages and failures ─────────────────────────────────────────────

/// Pipeline stage that incurs model cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classify,
    Summarize,
    Synthesize,
    LinkQa,
}

impl Stage {
    /// Every billed stage, in pipeline order.
    pub const ALL: [Stage; 4] = [Self::Classify, Self::Summarize, Self::Synthesize, Self::LinkQa];

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Summarize => "summarize",
            Self::Synthesize => "synthesize",
            Self::LinkQa => "link_qa",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Non-fatal failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Model response didn't match the expected structure.
    ParseFailure,
    /// Network, timeout, or quota error from the provider.
    ProviderFailure,
    /// Link-QA couldn't confidently match a bullet to a source.
    AttributionFailure,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ParseFailure => "parse failure",
            Self::ProviderFailure => "provider failure",
            Self::AttributionFailure => "attribution failure",
        }
    }
}

/// An email that dropped out of the run after the filter.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEmail {
    pub email_id: String,
    pub subject: String,
    pub stage: Stage,
    pub kind: FailureKind,
    pub reason: String,
}

// ── Classification ──────────────────────────────────────────────────

/// Classifier decision for one email. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationVerdict {
    pub email_id: String,
    pub is_newsletter: bool,
    pub rationale: String,
    /// Cost of the call that produced this verdict.
    pub cost_usd: Decimal,
    /// Set when the verdict is a fail-closed default rather than a model answer.
    pub degraded: Option<FailureKind>,
}

// ── Summaries ───────────────────────────────────────────────────────

/// One summarized insight and the link to the email it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightBullet {
    pub text: String,
    pub link: String,
}

impl InsightBullet {
    pub fn new(text: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            link: link.into(),
        }
    }
}

/// Per-email summary; every bullet carries the email's `source_url`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailSummary {
    pub email_id: String,
    pub bullets: Vec<InsightBullet>,
}

// ── Digest ──────────────────────────────────────────────────────────

/// Inclusive date range covered by a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// The `days`-long window ending at `now`.
    pub fn last_days(now: DateTime<Utc>, days: u32) -> Self {
        let end = now.date_naive();
        let start = end - chrono::Duration::days(i64::from(days));
        Self::new(start, end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start.format("%b %-d, %Y"))
        } else {
            write!(
                f,
                "{} to {}",
                self.start.format("%b %-d, %Y"),
                self.end.format("%b %-d, %Y")
            )
        }
    }
}

/// A thematic section of the digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestSection {
    pub title: String,
    pub bullets: Vec<InsightBullet>,
}

/// The synthesized digest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub date_range: DateRange,
    pub sections: Vec<DigestSection>,
}

impl Digest {
    pub fn bullet_count(&self) -> usize {
        self.sections.iter().map(|s| s.bullets.len()).sum()
    }

    /// Subject line for delivery.
    pub fn subject(&self) -> String {
        format!("Newsletter digest: {}", self.date_range)
    }
}

// ── External collaborators ──────────────────────────────────────────

/// Time window and cap for a mailbox query.
#[derive(Debug, Clone, Copy)]
pub struct MailboxWindow {
    pub since: DateTime<Utc>,
    pub max_results: usize,
}

/// Read-only source of raw emails. Pure I/O, no business logic.
#[async_trait]
pub trait MailboxSource: Send + Sync {
    /// Source name (e.g. "imap").
    fn name(&self) -> &str;

    /// Fetch emails received since `window.since`, newest first, capped.
    async fn fetch(&self, window: MailboxWindow) -> Result<Vec<RawEmail>, PipelineError>;
}

/// Accepts a rendered digest for delivery.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, subject: &str, html_body: &str) -> Result<(), PipelineError>;
}
