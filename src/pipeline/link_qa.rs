//! Link-QA agent: verifies digest attribution before delivery.
//!
//! Every digest bullet is matched against the summarizer's bullets, whose
//! links are ground truth. Confident matches with the wrong link are
//! rewritten; weak matches go to a single model adjudication call, or
//! straight to `Unverifiable` when adjudication is off.
//!
//! A pass is idempotent: re-running it on its own output corrects nothing.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use strsim::normalized_levenshtein;
use tracing::{debug, info, warn};

use crate::llm::parse::{Parsed, parse_json_object};
use crate::llm::provider::{ChatMessage, CompletionRequest};
use crate::pipeline::caller::ModelCaller;
use crate::pipeline::types::{Digest, EmailSummary, FailureKind, RawEmail, Stage};

const ADJUDICATE_MAX_TOKENS: u32 = 128;

const ADJUDICATE_TEMPERATURE: f32 = 0.0;

/// Source bullets shown per candidate email in the adjudication prompt.
const ADJUDICATE_BULLETS_PER_SOURCE: usize = 8;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "that", "this", "with", "from", "are", "was", "were", "has", "have",
    "its", "their", "they", "but", "not", "you", "your", "will", "into", "than", "more", "about",
];

// ── Matching ────────────────────────────────────────────────────────

/// Scores how well a digest bullet's text matches a source bullet's text.
pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Similarity in `[0, 1]`. Must be deterministic.
    fn match_score(&self, text: &str, candidate: &str) -> f64;
}

/// Normalized Levenshtein blended with token containment.
///
/// Containment is measured against the smaller token set, so a bullet the
/// synthesizer shortened still scores high against its source.
#[derive(Debug, Clone)]
pub struct BlendedMatcher {
    /// Weight of the edit-distance term; the rest goes to token overlap.
    pub levenshtein_weight: f64,
}

impl Default for BlendedMatcher {
    fn default() -> Self {
        Self {
            levenshtein_weight: 0.4,
        }
    }
}

impl MatchStrategy for BlendedMatcher {
    fn name(&self) -> &str {
        "blended"
    }

    fn match_score(&self, text: &str, candidate: &str) -> f64 {
        let a = text.trim().to_lowercase();
        let b = candidate.trim().to_lowercase();
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a == b {
            return 1.0;
        }
        let weight = self.levenshtein_weight.clamp(0.0, 1.0);
        let edit = normalized_levenshtein(&a, &b);
        let overlap = token_containment(&a, &b);
        (weight * edit + (1.0 - weight) * overlap).clamp(0.0, 1.0)
    }
}

fn content_tokens(text: &str) -> HashSet<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3 && !STOPWORDS.contains(t))
        .collect()
}

fn token_containment(a: &str, b: &str) -> f64 {
    let ta = content_tokens(a);
    let tb = content_tokens(b);
    let smaller = ta.len().min(tb.len());
    if smaller == 0 {
        return 0.0;
    }
    ta.intersection(&tb).count() as f64 / smaller as f64
}

// ── Per-bullet state ────────────────────────────────────────────────

/// Per-bullet QA state. `Confirmed`, `Corrected` and `Unverifiable` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum BulletState {
    Unchecked,
    /// Best ground-truth candidate found (`None` when there is no ground truth).
    Matched {
        confidence: f64,
        candidate: Option<usize>,
    },
    Confirmed,
    Corrected {
        from: String,
    },
    Unverifiable {
        reason: String,
    },
}

impl BulletState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Confirmed | Self::Corrected { .. } | Self::Unverifiable { .. }
        )
    }
}

/// Final verdict for one bullet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QaVerdict {
    Confirmed,
    Corrected,
    Unverifiable,
}

impl QaVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Corrected => "corrected",
            Self::Unverifiable => "unverifiable",
        }
    }
}

/// How a verdict was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QaMethod {
    Similarity,
    Adjudicated,
    Skipped,
}

/// QA outcome for one digest bullet.
#[derive(Debug, Clone, PartialEq)]
pub struct QaEntry {
    pub section: usize,
    pub position: usize,
    pub bullet_text: String,
    pub original_link: String,
    /// Set only when the link was rewritten.
    pub corrected_link: Option<String>,
    pub verdict: QaVerdict,
    pub method: QaMethod,
    pub confidence: f64,
    pub reason: Option<String>,
    /// `AttributionFailure` for bullets whose source could not be established.
    pub failure: Option<FailureKind>,
}

/// Report over every bullet in the digest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QaReport {
    pub entries: Vec<QaEntry>,
}

impl QaReport {
    pub fn checked(&self) -> usize {
        self.entries.len()
    }

    pub fn corrected(&self) -> usize {
        self.count(QaVerdict::Corrected)
    }

    pub fn confirmed(&self) -> usize {
        self.count(QaVerdict::Confirmed)
    }

    pub fn unverifiable(&self) -> usize {
        self.count(QaVerdict::Unverifiable)
    }

    fn count(&self, verdict: QaVerdict) -> usize {
        self.entries.iter().filter(|e| e.verdict == verdict).count()
    }
}

// ── Agent ───────────────────────────────────────────────────────────

/// A summarizer bullet and the email it came from.
struct GroundTruth<'a> {
    text: &'a str,
    link: &'a str,
}

/// A candidate source email for adjudication.
struct SourceEmail<'a> {
    subject: &'a str,
    link: &'a str,
    bullets: Vec<&'a str>,
}

/// Link-QA agent.
pub struct LinkQaAgent {
    caller: ModelCaller,
    matcher: Box<dyn MatchStrategy>,
    threshold: f64,
    adjudicate: bool,
}

impl LinkQaAgent {
    pub fn new(caller: ModelCaller, threshold: f64, adjudicate: bool) -> Self {
        Self {
            caller,
            matcher: Box::new(BlendedMatcher::default()),
            threshold,
            adjudicate,
        }
    }

    /// Replace the match strategy.
    pub fn with_matcher(mut self, matcher: Box<dyn MatchStrategy>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Check every bullet in `digest`, rewriting wrong links in place.
    ///
    /// A rewrite only ever points at the `source_url` of one of `emails`.
    pub async fn check(
        &self,
        digest: &mut Digest,
        summaries: &[EmailSummary],
        emails: &[RawEmail],
    ) -> QaReport {
        let run_links: HashSet<&str> = emails.iter().map(|e| e.source_url.as_str()).collect();
        let subjects: HashMap<&str, &str> = emails
            .iter()
            .map(|e| (e.id.as_str(), e.subject.as_str()))
            .collect();

        let truth: Vec<GroundTruth<'_>> = summaries
            .iter()
            .flat_map(|s| s.bullets.iter())
            .map(|b| GroundTruth {
                text: &b.text,
                link: &b.link,
            })
            .collect();

        let sources: Vec<SourceEmail<'_>> = summaries
            .iter()
            .filter_map(|s| {
                let link = s.bullets.first().map(|b| b.link.as_str())?;
                Some(SourceEmail {
                    subject: subjects.get(s.email_id.as_str()).copied().unwrap_or(""),
                    link,
                    bullets: s.bullets.iter().map(|b| b.text.as_str()).collect(),
                })
            })
            .collect();

        let mut states: Vec<Vec<BulletState>> = digest
            .sections
            .iter()
            .map(|s| vec![BulletState::Unchecked; s.bullets.len()])
            .collect();
        let mut report = QaReport::default();

        for (si, section) in digest.sections.iter_mut().enumerate() {
            for (bi, bullet) in section.bullets.iter_mut().enumerate() {
                if states[si][bi] != BulletState::Unchecked {
                    continue;
                }

                let (candidate, confidence) = self.best_match(&bullet.text, &truth);
                states[si][bi] = BulletState::Matched {
                    confidence,
                    candidate,
                };

                let original_link = bullet.link.clone();
                let (target, method, reason) = match candidate {
                    Some(idx) if confidence >= self.threshold => {
                        (Some(truth[idx].link), QaMethod::Similarity, None)
                    }
                    _ if self.adjudicate && !sources.is_empty() => {
                        match self.adjudicate_source(&bullet.text, &sources).await {
                            Ok(link) => (Some(link), QaMethod::Adjudicated, None),
                            Err(reason) => (None, QaMethod::Adjudicated, Some(reason)),
                        }
                    }
                    _ => (
                        None,
                        QaMethod::Skipped,
                        Some(format!(
                            "best match {confidence:.2} below threshold {:.2}",
                            self.threshold
                        )),
                    ),
                };

                let state = match target {
                    Some(link) if link == bullet.link => BulletState::Confirmed,
                    Some(link) if run_links.contains(link) => {
                        bullet.link = link.to_string();
                        BulletState::Corrected {
                            from: original_link.clone(),
                        }
                    }
                    Some(link) => BulletState::Unverifiable {
                        reason: format!("matched link {link} is not an email in this run"),
                    },
                    None => BulletState::Unverifiable {
                        reason: reason.unwrap_or_else(|| "no match".into()),
                    },
                };

                let entry = match &state {
                    BulletState::Confirmed => QaEntry {
                        section: si,
                        position: bi,
                        bullet_text: bullet.text.clone(),
                        original_link,
                        corrected_link: None,
                        verdict: QaVerdict::Confirmed,
                        method,
                        confidence,
                        reason: None,
                        failure: None,
                    },
                    BulletState::Corrected { .. } => {
                        info!(
                            section = %section.title,
                            from = %original_link,
                            to = %bullet.link,
                            confidence,
                            "Corrected digest link"
                        );
                        QaEntry {
                            section: si,
                            position: bi,
                            bullet_text: bullet.text.clone(),
                            original_link,
                            corrected_link: Some(bullet.link.clone()),
                            verdict: QaVerdict::Corrected,
                            method,
                            confidence,
                            reason: None,
                            failure: None,
                        }
                    }
                    BulletState::Unverifiable { reason } => {
                        warn!(
                            section = %section.title,
                            link = %original_link,
                            reason = %reason,
                            "Unverifiable digest link"
                        );
                        QaEntry {
                            section: si,
                            position: bi,
                            bullet_text: bullet.text.clone(),
                            original_link,
                            corrected_link: None,
                            verdict: QaVerdict::Unverifiable,
                            method,
                            confidence,
                            reason: Some(reason.clone()),
                            failure: Some(FailureKind::AttributionFailure),
                        }
                    }
                    BulletState::Unchecked | BulletState::Matched { .. } => continue,
                };
                debug_assert!(state.is_terminal());
                states[si][bi] = state;
                report.entries.push(entry);
            }
        }

        info!(
            checked = report.checked(),
            corrected = report.corrected(),
            unverifiable = report.unverifiable(),
            matcher = self.matcher.name(),
            "Link QA complete"
        );
        report
    }

    /// Best-scoring ground-truth index; ties keep the earliest.
    fn best_match(&self, text: &str, truth: &[GroundTruth<'_>]) -> (Option<usize>, f64) {
        let mut best: (Option<usize>, f64) = (None, 0.0);
        for (i, candidate) in truth.iter().enumerate() {
            let score = self.matcher.match_score(text, candidate.text);
            if best.0.is_none() || score > best.1 {
                best = (Some(i), score);
            }
        }
        best
    }

    /// Ask the model which source email a bullet is about.
    async fn adjudicate_source<'a>(
        &self,
        bullet: &str,
        sources: &[SourceEmail<'a>],
    ) -> Result<&'a str, String> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(ADJUDICATE_SYSTEM_PROMPT),
            ChatMessage::user(build_adjudicate_prompt(bullet, sources)),
        ])
        .with_temperature(ADJUDICATE_TEMPERATURE)
        .with_max_tokens(ADJUDICATE_MAX_TOKENS);

        let outcome = self.caller.call(Stage::LinkQa, request).await;
        let raw = outcome
            .result
            .map_err(|e| format!("adjudication failed: {e}"))?;

        match parse_source_choice(&raw, sources.len()) {
            Parsed::Parsed(Some(n)) => {
                debug!(source = n, "Adjudicated bullet source");
                Ok(sources[n - 1].link)
            }
            Parsed::Parsed(None) => Err("adjudicator found no matching source".into()),
            Parsed::Unparseable(reason) => Err(format!("unparseable adjudication: {reason}")),
        }
    }
}

const ADJUDICATE_SYSTEM_PROMPT: &str = "\
You check attribution in a newsletter digest. Given one digest bullet and a numbered list of
source emails with their key points, decide which email the bullet is about.

Respond with ONLY a JSON object: {\"source\": <number>} or {\"source\": \"none\"} if no email fits.";

fn build_adjudicate_prompt(bullet: &str, sources: &[SourceEmail<'_>]) -> String {
    let mut prompt = format!("Bullet: {bullet}\n\nSources:\n");
    for (i, source) in sources.iter().enumerate() {
        prompt.push_str(&format!("{}. Subject: {}\n", i + 1, source.subject));
        for text in source.bullets.iter().take(ADJUDICATE_BULLETS_PER_SOURCE) {
            prompt.push_str(&format!("   - {text}\n"));
        }
    }
    prompt
}

/// Parse `{"source": n}`, `{"source": "none"}`, or a bare number / "none".
///
/// `Parsed(Some(n))` is 1-based and within `1..=count`.
pub fn parse_source_choice(raw: &str, count: usize) -> Parsed<Option<usize>> {
    let value = match parse_json_object::<Value>(raw) {
        Parsed::Parsed(Value::Object(obj)) => obj.get("source").cloned().unwrap_or(Value::Null),
        Parsed::Parsed(other) => other,
        Parsed::Unparseable(_) => Value::String(raw.trim().to_string()),
    };

    let choice = match &value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => {
            let s = s.trim().trim_matches(|c: char| !c.is_alphanumeric());
            if s.eq_ignore_ascii_case("none") {
                return Parsed::Parsed(None);
            }
            s.parse::<usize>().ok()
        }
        Value::Null => return Parsed::Parsed(None),
        _ => None,
    };

    match choice {
        Some(n) if (1..=count).contains(&n) => Parsed::Parsed(Some(n)),
        Some(n) => Parsed::Unparseable(format!("source {n} out of range 1..={count}")),
        None => Parsed::Unparseable(format!("unrecognized source choice: {value}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{NaiveDate, Utc};

    use super::*;
    use crate::error::LlmError;
    use crate::pipeline::caller::testing::MockLlm;
    use crate::pipeline::ledger::CostLedger;
    use crate::pipeline::types::{DateRange, DigestSection, InsightBullet};

    fn link(id: &str) -> String {
        format!("https://mail.example.com/{id}")
    }

    fn email(id: &str, subject: &str) -> RawEmail {
        RawEmail {
            id: id.into(),
            sender: format!("{id}@news.com"),
            subject: subject.into(),
            body: String::new(),
            received_at: Utc::now(),
            source_url: link(id),
        }
    }

    fn summary(id: &str, texts: &[&str]) -> EmailSummary {
        EmailSummary {
            email_id: id.into(),
            bullets: texts.iter().map(|t| InsightBullet::new(*t, link(id))).collect(),
        }
    }

    fn fixture() -> (Vec<RawEmail>, Vec<EmailSummary>) {
        let emails = vec![email("a", "AI Weekly"), email("b", "Macro Notes")];
        let summaries = vec![
            summary(
                "a",
                &[
                    "OpenAI shipped a new reasoning model that tops coding benchmarks",
                    "Agent frameworks are consolidating around tool calling",
                ],
            ),
            summary(
                "b",
                &[
                    "The Fed held interest rates steady for the third meeting",
                    "Treasury yields fell after weaker jobs data",
                ],
            ),
        ];
        (emails, summaries)
    }

    fn digest(bullets: Vec<(&str, String)>) -> Digest {
        let d = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        Digest {
            date_range: DateRange::new(d, d),
            sections: vec![DigestSection {
                title: "Mixed".into(),
                bullets: bullets
                    .into_iter()
                    .map(|(t, l)| InsightBullet::new(t, l))
                    .collect(),
            }],
        }
    }

    fn agent(llm: MockLlm, adjudicate: bool) -> (LinkQaAgent, Arc<CostLedger>) {
        let ledger = Arc::new(CostLedger::new());
        let caller = ModelCaller::new(Arc::new(llm), Arc::clone(&ledger), Duration::from_secs(5));
        (LinkQaAgent::new(caller, 0.35, adjudicate), ledger)
    }

    #[test]
    fn blended_matcher_scores() {
        let m = BlendedMatcher::default();
        assert_eq!(m.match_score("Same text", "same text"), 1.0);
        assert_eq!(m.match_score("", "x"), 0.0);
        let close = m.match_score(
            "OpenAI's new reasoning model tops coding benchmarks",
            "OpenAI shipped a new reasoning model that tops coding benchmarks",
        );
        let far = m.match_score(
            "OpenAI's new reasoning model tops coding benchmarks",
            "The Fed held interest rates steady for the third meeting",
        );
        assert!(close > 0.6, "close = {close}");
        assert!(far < 0.35, "far = {far}");
        assert!((0.0..=1.0).contains(&close));
    }

    #[tokio::test]
    async fn swapped_link_is_corrected() {
        let (emails, summaries) = fixture();
        let (agent, ledger) = agent(MockLlm::fixed("{}"), true);
        let mut d = digest(vec![
            ("OpenAI's new reasoning model tops coding benchmarks", link("b")),
            ("The Fed held rates steady again", link("b")),
        ]);

        let report = agent.check(&mut d, &summaries, &emails).await;
        assert_eq!(report.checked(), 2);
        assert_eq!(report.corrected(), 1);
        assert_eq!(report.confirmed(), 1);
        assert_eq!(d.sections[0].bullets[0].link, link("a"));
        assert_eq!(report.entries[0].original_link, link("b"));
        assert_eq!(report.entries[0].corrected_link, Some(link("a")));
        assert_eq!(ledger.call_count(), 0);
    }

    #[tokio::test]
    async fn second_pass_corrects_nothing() {
        let (emails, summaries) = fixture();
        let (agent, _) = agent(MockLlm::fixed("{}"), false);
        let mut d = digest(vec![
            ("Agent frameworks consolidate around tool calling", link("b")),
            ("Treasury yields fell after weak jobs data", link("a")),
        ]);

        let first = agent.check(&mut d, &summaries, &emails).await;
        assert_eq!(first.corrected(), 2);
        let second = agent.check(&mut d, &summaries, &emails).await;
        assert_eq!(second.corrected(), 0);
        assert_eq!(second.confirmed(), 2);
    }

    #[tokio::test]
    async fn corrections_only_point_at_run_emails() {
        let (emails, mut summaries) = fixture();
        summaries[0].bullets[0].link = "https://elsewhere.example/x".into();
        let (agent, _) = agent(MockLlm::fixed("{}"), false);
        let mut d = digest(vec![(
            "OpenAI shipped a new reasoning model that tops coding benchmarks",
            link("b"),
        )]);

        let report = agent.check(&mut d, &summaries, &emails).await;
        assert_eq!(report.corrected(), 0);
        assert_eq!(report.unverifiable(), 1);
        assert_eq!(d.sections[0].bullets[0].link, link("b"));
    }

    #[tokio::test]
    async fn low_score_is_adjudicated() {
        let (emails, summaries) = fixture();
        let llm = Arc::new(MockLlm::fixed(r#"{"source": 2}"#));
        let ledger = Arc::new(CostLedger::new());
        let caller = ModelCaller::new(llm.clone(), Arc::clone(&ledger), Duration::from_secs(5));
        let agent = LinkQaAgent::new(caller, 0.35, true);
        let mut d = digest(vec![("Central bank pauses", link("a"))]);

        let report = agent.check(&mut d, &summaries, &emails).await;
        assert_eq!(report.corrected(), 1);
        assert_eq!(report.entries[0].method, QaMethod::Adjudicated);
        assert!(report.entries[0].failure.is_none());
        assert_eq!(d.sections[0].bullets[0].link, link("b"));
        assert_eq!(ledger.call_count(), 1);

        let requests = llm.requests.lock().unwrap();
        let prompt = &requests[0].messages[1].content;
        assert!(prompt.contains("2. Subject: Macro Notes"));
        assert!(prompt.contains("Central bank pauses"));
    }

    #[tokio::test]
    async fn adjudication_failure_is_unverifiable() {
        let (emails, summaries) = fixture();
        let llm = MockLlm::new(|_| {
            Err(LlmError::RequestFailed {
                provider: "mock".into(),
                reason: "500".into(),
            })
        });
        let (agent, ledger) = agent(llm, true);
        let mut d = digest(vec![("Central bank pauses", link("a"))]);

        let report = agent.check(&mut d, &summaries, &emails).await;
        assert_eq!(report.unverifiable(), 1);
        assert!(report.entries[0].reason.as_deref().unwrap().contains("adjudication failed"));
        assert_eq!(report.entries[0].failure, Some(FailureKind::AttributionFailure));
        assert_eq!(d.sections[0].bullets[0].link, link("a"));
        assert_eq!(ledger.call_count(), 1);
    }

    #[tokio::test]
    async fn adjudication_disabled_skips_model() {
        let (emails, summaries) = fixture();
        let (agent, ledger) = agent(MockLlm::fixed(r#"{"source": 2}"#), false);
        let mut d = digest(vec![("Central bank pauses", link("a"))]);

        let report = agent.check(&mut d, &summaries, &emails).await;
        assert_eq!(report.unverifiable(), 1);
        assert_eq!(report.entries[0].method, QaMethod::Skipped);
        assert_eq!(ledger.call_count(), 0);
    }

    #[test]
    fn parses_source_choices() {
        assert_eq!(parse_source_choice(r#"{"source": 1}"#, 2), Parsed::Parsed(Some(1)));
        assert_eq!(parse_source_choice(r#"{"source": "2"}"#, 2), Parsed::Parsed(Some(2)));
        assert_eq!(parse_source_choice(r#"{"source": "none"}"#, 2), Parsed::Parsed(None));
        assert_eq!(parse_source_choice("none", 2), Parsed::Parsed(None));
        assert_eq!(parse_source_choice("2", 2), Parsed::Parsed(Some(2)));
        assert!(!parse_source_choice(r#"{"source": 3}"#, 2).is_parsed());
        assert!(!parse_source_choice("maybe the first one", 2).is_parsed());
    }

    struct ExactOnly;

    impl MatchStrategy for ExactOnly {
        fn name(&self) -> &str {
            "exact"
        }

        fn match_score(&self, text: &str, candidate: &str) -> f64 {
            if text == candidate { 1.0 } else { 0.0 }
        }
    }

    #[tokio::test]
    async fn custom_matcher_is_used() {
        let (emails, summaries) = fixture();
        let (agent, _) = agent(MockLlm::fixed("{}"), false);
        let agent = agent.with_matcher(Box::new(ExactOnly));
        let mut d = digest(vec![(
            "Treasury yields fell after weaker jobs data",
            link("a"),
        )]);
        let report = agent.check(&mut d, &summaries, &emails).await;
        assert_eq!(report.corrected(), 1);
        assert_eq!(d.sections[0].bullets[0].link, link("b"));
    }
}
