//! Per-email summarizer.
//!
//! The model only writes bullet text. Links are attached here from the
//! email's `source_url`, so every bullet's link is ground truth for Link-QA.
//! Failed or unparseable calls skip the email instead of aborting the run.

use std::sync::Arc;

use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::llm::parse::{Parsed, parse_json_array, parse_json_object};
use crate::llm::provider::{ChatMessage, CompletionRequest};
use crate::pipeline::caller::ModelCaller;
use crate::pipeline::types::{EmailSummary, FailureKind, InsightBullet, RawEmail, SkippedEmail, Stage};

const SUMMARIZE_MAX_TOKENS: u32 = 1024;

const SUMMARIZE_TEMPERATURE: f32 = 0.3;

/// Body characters sent for summarization.
const BODY_CHARS: usize = 6000;

/// Bullets longer than this are cut at a word boundary.
const MAX_BULLET_CHARS: usize = 400;

/// Model-backed email summarizer.
pub struct Summarizer {
    caller: ModelCaller,
    min_bullets: usize,
    max_bullets: usize,
}

impl Summarizer {
    pub fn new(caller: ModelCaller, min_bullets: usize, max_bullets: usize) -> Self {
        Self {
            caller,
            min_bullets,
            max_bullets: max_bullets.max(min_bullets),
        }
    }

    /// Summarize one email into `min..=max` bullets carrying its source link.
    pub async fn summarize(&self, email: &RawEmail) -> Result<EmailSummary, SkippedEmail> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_summarize_system_prompt(
                self.min_bullets,
                self.max_bullets,
            )),
            ChatMessage::user(build_summarize_user_prompt(email)),
        ])
        .with_temperature(SUMMARIZE_TEMPERATURE)
        .with_max_tokens(SUMMARIZE_MAX_TOKENS);

        let outcome = self.caller.call(Stage::Summarize, request).await;
        let skip = |kind: FailureKind, reason: String| SkippedEmail {
            email_id: email.id.clone(),
            subject: email.subject.clone(),
            stage: Stage::Summarize,
            kind,
            reason,
        };

        let raw = outcome.result.map_err(|e| {
            warn!(id = %email.id, error = %e, "Summarizer call failed, skipping email");
            skip(FailureKind::ProviderFailure, e.to_string())
        })?;

        match parse_bullets(&raw, self.min_bullets, self.max_bullets) {
            Parsed::Parsed(texts) => {
                debug!(id = %email.id, bullets = texts.len(), "Summarized email");
                Ok(EmailSummary {
                    email_id: email.id.clone(),
                    bullets: texts
                        .into_iter()
                        .map(|text| InsightBullet::new(text, email.source_url.clone()))
                        .collect(),
                })
            }
            Parsed::Unparseable(reason) => {
                warn!(
                    id = %email.id,
                    raw_response = %raw,
                    error = %reason,
                    "Unparseable summary, skipping email"
                );
                Err(skip(FailureKind::ParseFailure, reason))
            }
        }
    }

    /// Summarize every email with bounded concurrency.
    ///
    /// Returns (summaries, skipped), both in input order.
    pub async fn summarize_all(
        &self,
        emails: &[RawEmail],
        concurrency: usize,
    ) -> (Vec<EmailSummary>, Vec<SkippedEmail>) {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let tasks = emails.iter().map(|email| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                self.summarize(email).await
            }
        });

        let mut summaries = Vec::new();
        let mut skipped = Vec::new();
        for result in join_all(tasks).await {
            match result {
                Ok(summary) => summaries.push(summary),
                Err(skip) => skipped.push(skip),
            }
        }

        info!(
            summarized = summaries.len(),
            skipped = skipped.len(),
            "Summarization complete"
        );
        (summaries, skipped)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_summarize_system_prompt(min: usize, max: usize) -> String {
    format!(
        "You summarize newsletters for a busy reader.\n\n\
         Extract between {min} and {max} key insights from the email. Each insight is one or \
         two sentences, specific (names, numbers, claims), and self-contained.\n\
         Do not include links or URLs; they are attached separately.\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"bullets\": [\"first insight\", \"second insight\"]}}"
    )
}

fn build_summarize_user_prompt(email: &RawEmail) -> String {
    let body: String = email.body.chars().take(BODY_CHARS).collect();
    format!(
        "From: {}\nSubject: {}\nReceived: {}\n\n{}",
        email.sender,
        email.subject,
        email.received_at.format("%Y-%m-%d"),
        body
    )
}

// ── Response parsing ────────────────────────────────────────────────

/// A bullet the model may return as a plain string or an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBullet {
    Text(String),
    Object { text: String },
}

impl RawBullet {
    fn into_text(self) -> String {
        match self {
            Self::Text(text) | Self::Object { text } => text,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulletsResponse {
    bullets: Vec<RawBullet>,
}

/// Parse bullet texts, truncating to `max`; fewer than `min` is unparseable.
pub fn parse_bullets(raw: &str, min: usize, max: usize) -> Parsed<Vec<String>> {
    let texts: Vec<String> =
        if let Parsed::Parsed(response) = parse_json_object::<BulletsResponse>(raw) {
            response.bullets.into_iter().map(RawBullet::into_text).collect()
        } else if let Parsed::Parsed(list) = parse_json_array::<Vec<RawBullet>>(raw) {
            list.into_iter().map(RawBullet::into_text).collect()
        } else {
            markdown_list_items(raw)
        };

    let mut cleaned: Vec<String> = texts
        .iter()
        .map(|t| clean_bullet(t))
        .filter(|t| !t.is_empty())
        .collect();

    if cleaned.len() < min {
        return Parsed::Unparseable(format!(
            "expected at least {min} bullets, got {}",
            cleaned.len()
        ));
    }
    cleaned.truncate(max);
    Parsed::Parsed(cleaned)
}

/// Lines that look like list items: `- x`, `* x`, `• x`, `1. x`, `2) x`.
fn markdown_list_items(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if let Some(rest) = line
                .strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .or_else(|| line.strip_prefix("• "))
            {
                return Some(rest.to_string());
            }
            let digits = line.chars().take_while(char::is_ascii_digit).count();
            if digits > 0 {
                let rest = &line[digits..];
                if let Some(item) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
                    return Some(item.to_string());
                }
            }
            None
        })
        .collect()
}

/// Collapse whitespace, drop surrounding quotes, cap length.
fn clean_bullet(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c| c == '"' || c == '\'').trim();
    if trimmed.chars().count() <= MAX_BULLET_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(MAX_BULLET_CHARS).collect();
    match cut.rfind(' ') {
        Some(pos) => format!("{}…", &cut[..pos]),
        None => format!("{cut}…"),
    }
}
