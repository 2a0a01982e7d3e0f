//! Newsletter classifier: one model call per filtered email.
//!
//! Fail-closed: an answer that can't be parsed into include/exclude counts
//! as "not a newsletter" and is marked degraded. Provider failures and
//! timeouts do the same. Cost is billed once per call by `ModelCaller`.

use std::sync::Arc;

use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::llm::parse::{Parsed, parse_json_object};
use crate::llm::provider::{ChatMessage, CompletionRequest};
use crate::pipeline::caller::ModelCaller;
use crate::pipeline::types::{ClassificationVerdict, FailureKind, RawEmail, Stage};

/// Max tokens for the classification call (runs on every email).
const CLASSIFY_MAX_TOKENS: u32 = 256;

const CLASSIFY_TEMPERATURE: f32 = 0.0;

/// Body characters shown to the model.
const BODY_EXCERPT_CHARS: usize = 1000;

/// Model-backed newsletter classifier.
pub struct Classifier {
    caller: ModelCaller,
    allowlist: Vec<String>,
}

impl Classifier {
    pub fn new(caller: ModelCaller, allowlist: Vec<String>) -> Self {
        Self { caller, allowlist }
    }

    /// Classify a single email. Never fails; degraded verdicts are excluded.
    pub async fn classify(&self, email: &RawEmail) -> ClassificationVerdict {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_classify_system_prompt(&self.allowlist)),
            ChatMessage::user(build_classify_user_prompt(email)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let outcome = self.caller.call(Stage::Classify, request).await;

        let raw = match outcome.result {
            Ok(raw) => raw,
            Err(e) => {
                warn!(id = %email.id, error = %e, "Classifier call failed, excluding email");
                return ClassificationVerdict {
                    email_id: email.id.clone(),
                    is_newsletter: false,
                    rationale: format!("classifier call failed: {e}"),
                    cost_usd: outcome.cost_usd,
                    degraded: Some(FailureKind::ProviderFailure),
                };
            }
        };

        match parse_classification(&raw) {
            Parsed::Parsed(answer) => {
                debug!(
                    id = %email.id,
                    include = answer.include,
                    reason = %answer.reason,
                    "Classified email"
                );
                ClassificationVerdict {
                    email_id: email.id.clone(),
                    is_newsletter: answer.include,
                    rationale: answer.reason,
                    cost_usd: outcome.cost_usd,
                    degraded: None,
                }
            }
            Parsed::Unparseable(reason) => {
                warn!(
                    id = %email.id,
                    raw_response = %raw,
                    error = %reason,
                    "Unparseable classification, treating as not a newsletter"
                );
                ClassificationVerdict {
                    email_id: email.id.clone(),
                    is_newsletter: false,
                    rationale: format!("unparseable response: {reason}"),
                    cost_usd: outcome.cost_usd,
                    degraded: Some(FailureKind::ParseFailure),
                }
            }
        }
    }

    /// Classify every email with at most `concurrency` calls in flight.
    ///
    /// Verdicts come back in input order.
    pub async fn classify_all(
        &self,
        emails: &[RawEmail],
        concurrency: usize,
    ) -> Vec<ClassificationVerdict> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let tasks = emails.iter().map(|email| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                // The semaphore is never closed, so acquire can't fail.
                let _permit = semaphore.acquire_owned().await.ok();
                self.classify(email).await
            }
        });
        let verdicts = join_all(tasks).await;

        let included = verdicts.iter().filter(|v| v.is_newsletter).count();
        let degraded = verdicts.iter().filter(|v| v.degraded.is_some()).count();
        info!(
            total = verdicts.len(),
            included, degraded, "Classification complete"
        );
        verdicts
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_classify_system_prompt(allowlist: &[String]) -> String {
    let mut prompt = String::from(
        "You curate a weekly newsletter digest for a reader who follows technology, AI, \
         product management, growth, markets, politics, and venture capital.\n\n\
         Decide whether the email belongs in that digest.\n\
         Include: thought leadership, analysis, or curated-content newsletters.\n\
         Exclude: transactional alerts (payments, price alerts, brokerage notices), job alerts, \
         product update announcements, social network messages or event invites, generic daily \
         news roundups without deep analysis, interview-prep communities, and any other \
         notification.\n",
    );
    if !allowlist.is_empty() {
        prompt.push_str(&format!(
            "\nKnown good sources (include when in doubt): {}.\n",
            allowlist.join(", ")
        ));
    }
    prompt.push_str(
        "\nAnswer in exactly this format:\n\
         Reason: <one or two sentences>\n\
         Include: <yes|no>",
    );
    prompt
}

fn build_classify_user_prompt(email: &RawEmail) -> String {
    let excerpt: String = email.body.chars().take(BODY_EXCERPT_CHARS).collect();
    format!(
        "From: {}\nSubject: {}\nBody:\n{}",
        email.sender, email.subject, excerpt
    )
}

// ── Response parsing ────────────────────────────────────────────────

/// Parsed classifier answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierAnswer {
    pub include: bool,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
struct JsonAnswer {
    include: serde_json::Value,
    #[serde(default)]
    reason: String,
}

/// Parse either the `Reason:/Include:` line format or a JSON object.
pub fn parse_classification(raw: &str) -> Parsed<ClassifierAnswer> {
    if let Parsed::Parsed(json) = parse_json_object::<JsonAnswer>(raw) {
        let include = match &json.include {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::String(s) => parse_yes_no(s),
            _ => None,
        };
        return match include {
            Some(include) => Parsed::Parsed(ClassifierAnswer {
                include,
                reason: json.reason,
            }),
            None => Parsed::Unparseable(format!("unrecognized include value: {}", json.include)),
        };
    }

    let mut include = None;
    let mut reason = String::new();
    for line in raw.lines() {
        let line = line.trim().trim_start_matches(['*', '-', '#', ' ']);
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim().trim_matches('*').to_ascii_lowercase().as_str() {
            "include" => include = parse_yes_no(value),
            "reason" => reason = value.trim().to_string(),
            _ => {}
        }
    }

    match include {
        Some(include) => Parsed::Parsed(ClassifierAnswer { include, reason }),
        None => Parsed::Unparseable("no recognizable 'Include: yes|no' line".to_string()),
    }
}

/// Reads the first word only, so "yes, thought leadership" counts as yes.
fn parse_yes_no(value: &str) -> Option<bool> {
    let word = value
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find(|w| !w.is_empty())?
        .to_ascii_lowercase();
    match word.as_str() {
        "yes" | "y" | "true" | "include" => Some(true),
        "no" | "n" | "false" | "exclude" => Some(false),
        _ => None,
    }
}
