//! Digest pipeline runner.
//!
//! Flow:
//! 1. Email filter (pure, no LLM) drops self-sent, transactional, malformed
//! 2. Classifier keeps newsletters (one call per email, fail-closed)
//! 3. Summarizer turns each newsletter into linked bullets
//! 4. Synthesizer groups bullets into themed sections
//! 5. Link-QA verifies and repairs every bullet's link
//! 6. Assembler renders HTML
//!
//! Every model call lands in one `CostLedger` created per run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::config::DigestConfig;
use crate::error::PipelineError;
use crate::llm::provider::LlmProvider;
use crate::pipeline::assembler;
use crate::pipeline::caller::ModelCaller;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::filter::{DropReason, EmailFilter, RuleField};
use crate::pipeline::ledger::{CostLedger, CostRecord};
use crate::pipeline::link_qa::{LinkQaAgent, MatchStrategy, QaReport};
use crate::pipeline::summarizer::Summarizer;
use crate::pipeline::synthesizer::{Synthesizer, order_sections};
use crate::pipeline::types::{
    ClassificationVerdict, DateRange, Digest, FailureKind, InsightBullet, MailboxSource,
    MailboxWindow, RawEmail, SkippedEmail, Stage,
};

/// An email removed by the pre-LLM filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredEmail {
    pub email_id: String,
    pub sender: String,
    pub subject: String,
    pub reason: DropReason,
}

/// Everything the operator needs to see about one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub model: String,
    pub date_range: DateRange,
    pub fetched: usize,
    pub filtered: Vec<FilteredEmail>,
    pub verdicts: Vec<ClassificationVerdict>,
    pub skipped: Vec<SkippedEmail>,
    /// Set when the synthesizer fell back to one section per email.
    pub synthesis_fallback: Option<(FailureKind, String)>,
    /// Summary bullets the synthesizer left out of every section.
    pub synthesis_omitted: Vec<InsightBullet>,
    /// Synthesized bullets dropped for lacking a known id.
    pub synthesis_unattributed: usize,
    pub qa: QaReport,
    pub costs: Vec<CostRecord>,
    /// (stage, calls, cost) for every stage that made at least one call.
    pub stage_totals: Vec<(Stage, usize, Decimal)>,
    pub total_cost: Decimal,
}

impl RunReport {
    pub fn included(&self) -> usize {
        self.verdicts.iter().filter(|v| v.is_newsletter).count()
    }

    pub fn excluded(&self) -> usize {
        self.verdicts.len() - self.included()
    }

    pub fn degraded(&self) -> usize {
        self.verdicts.iter().filter(|v| v.degraded.is_some()).count()
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// A digest was produced and is ready for delivery.
    Digest {
        digest: Digest,
        html: String,
        report: RunReport,
    },
    /// Nothing survived classification. Nothing to deliver.
    NoNewsletters { report: RunReport },
    /// Newsletters were found but every summary failed.
    NoSummaries { report: RunReport },
}

impl RunOutcome {
    pub fn report(&self) -> &RunReport {
        match self {
            Self::Digest { report, .. }
            | Self::NoNewsletters { report }
            | Self::NoSummaries { report } => report,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Digest { .. } => "digest",
            Self::NoNewsletters { .. } => "no_newsletters",
            Self::NoSummaries { .. } => "no_summaries",
        }
    }
}

/// The digest pipeline. Holds no state between runs.
pub struct DigestPipeline {
    config: DigestConfig,
    llm: Arc<dyn LlmProvider>,
    filter: EmailFilter,
    matcher: Option<Box<dyn Fn() -> Box<dyn MatchStrategy> + Send + Sync>>,
}

impl DigestPipeline {
    /// Build a pipeline, compiling any configured transactional patterns.
    pub fn new(config: DigestConfig, llm: Arc<dyn LlmProvider>) -> Result<Self, PipelineError> {
        let mut filter = EmailFilter::default_rules(&config.own_address);
        for pattern in &config.transactional_patterns {
            filter
                .add_rule(pattern, RuleField::SubjectOrBody, "configured pattern")
                .map_err(|e| PipelineError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(Self {
            config,
            llm,
            filter,
            matcher: None,
        })
    }

    /// Use a different Link-QA match strategy for every run.
    pub fn with_matcher(
        mut self,
        factory: impl Fn() -> Box<dyn MatchStrategy> + Send + Sync + 'static,
    ) -> Self {
        self.matcher = Some(Box::new(factory));
        self
    }

    pub fn config(&self) -> &DigestConfig {
        &self.config
    }

    /// Fetch the lookback window from `source` and run it.
    pub async fn run_from(
        &self,
        source: &dyn MailboxSource,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, PipelineError> {
        let date_range = DateRange::last_days(now, self.config.lookback_days);
        let window = MailboxWindow {
            since: now - chrono::Duration::days(i64::from(self.config.lookback_days)),
            max_results: self.config.max_results,
        };
        let emails = source.fetch(window).await?;
        info!(source = source.name(), fetched = emails.len(), "Mailbox fetched");
        Ok(self.run(emails, date_range).await)
    }

    /// Run every stage over an already-fetched batch.
    pub async fn run(&self, emails: Vec<RawEmail>, date_range: DateRange) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("digest_run", run_id = %run_id);
        self.run_inner(run_id, emails, date_range)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        emails: Vec<RawEmail>,
        date_range: DateRange,
    ) -> RunOutcome {
        let ledger = Arc::new(CostLedger::new());
        let caller = ModelCaller::new(
            Arc::clone(&self.llm),
            Arc::clone(&ledger),
            self.config.call_timeout,
        );
        let fetched = emails.len();
        info!(fetched, %date_range, model = caller.model_name(), "Starting digest run");

        // Step 1: filter
        let (kept, dropped) = self.filter.partition(emails);
        let filtered: Vec<FilteredEmail> = dropped
            .into_iter()
            .map(|(email, reason)| FilteredEmail {
                email_id: email.id,
                sender: email.sender,
                subject: email.subject,
                reason,
            })
            .collect();
        info!(kept = kept.len(), dropped = filtered.len(), "Filter complete");

        let mut report = RunReport {
            run_id,
            model: caller.model_name().to_string(),
            date_range,
            fetched,
            filtered,
            verdicts: Vec::new(),
            skipped: Vec::new(),
            synthesis_fallback: None,
            synthesis_omitted: Vec::new(),
            synthesis_unattributed: 0,
            qa: QaReport::default(),
            costs: Vec::new(),
            stage_totals: Vec::new(),
            total_cost: Decimal::ZERO,
        };

        // Step 2: classify
        let classifier = Classifier::new(caller.clone(), self.config.newsletter_allowlist.clone());
        report.verdicts = classifier.classify_all(&kept, self.config.concurrency).await;
        for (email, verdict) in kept.iter().zip(&report.verdicts) {
            if let Some(kind) = verdict.degraded {
                report.skipped.push(SkippedEmail {
                    email_id: email.id.clone(),
                    subject: email.subject.clone(),
                    stage: Stage::Classify,
                    kind,
                    reason: verdict.rationale.clone(),
                });
            }
        }
        let newsletters: Vec<RawEmail> = kept
            .into_iter()
            .zip(&report.verdicts)
            .filter(|(_, v)| v.is_newsletter)
            .map(|(email, _)| email)
            .collect();

        if newsletters.is_empty() {
            warn!("No newsletters found in window");
            finish_costs(&mut report, &ledger);
            return RunOutcome::NoNewsletters { report };
        }

        // Step 3: summarize
        let summarizer = Summarizer::new(
            caller.clone(),
            self.config.min_bullets,
            self.config.max_bullets,
        );
        let (summaries, skipped) = summarizer
            .summarize_all(&newsletters, self.config.concurrency)
            .await;
        report.skipped.extend(skipped);

        if summaries.is_empty() {
            warn!(newsletters = newsletters.len(), "Every summary failed");
            finish_costs(&mut report, &ledger);
            return RunOutcome::NoSummaries { report };
        }

        // Step 4: synthesize
        let synthesizer = Synthesizer::new(caller.clone());
        let synthesis = synthesizer
            .synthesize(&summaries, &newsletters, date_range)
            .await;
        report.synthesis_fallback = synthesis.fallback;
        report.synthesis_omitted = synthesis.omitted;
        report.synthesis_unattributed = synthesis.unattributed;
        let mut digest = synthesis.digest;

        // Step 5: link QA
        let mut qa_agent = LinkQaAgent::new(
            caller,
            self.config.qa_match_threshold,
            self.config.qa_adjudicate,
        );
        if let Some(factory) = &self.matcher {
            qa_agent = qa_agent.with_matcher(factory());
        }
        report.qa = qa_agent.check(&mut digest, &summaries, &newsletters).await;
        order_sections(&mut digest, &newsletters);

        // Step 6: render
        let html = assembler::render(&digest);
        finish_costs(&mut report, &ledger);

        info!(
            sections = digest.sections.len(),
            bullets = digest.bullet_count(),
            corrected = report.qa.corrected(),
            total_cost = %report.total_cost,
            "Digest ready"
        );
        RunOutcome::Digest {
            digest,
            html,
            report,
        }
    }
}

fn finish_costs(report: &mut RunReport, ledger: &CostLedger) {
    report.costs = ledger.records();
    report.stage_totals = Stage::ALL
        .into_iter()
        .map(|stage| {
            let (calls, cost) = ledger.stage_totals(stage);
            (stage, calls, cost)
        })
        .filter(|(_, calls, _)| *calls > 0)
        .collect();
    report.total_cost = ledger.total();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{NaiveDate, TimeZone};

    use super::*;
    use crate::pipeline::caller::testing::{MockLlm, request_text};

    fn config() -> DigestConfig {
        DigestConfig {
            own_address: "me@example.com".into(),
            call_timeout: Duration::from_secs(5),
            ..DigestConfig::default()
        }
    }

    fn email(id: &str, sender: &str, subject: &str, day: u32) -> RawEmail {
        RawEmail {
            id: id.into(),
            sender: sender.into(),
            subject: subject.into(),
            body: format!("Body of {subject}"),
            received_at: Utc.with_ymd_and_hms(2026, 3, day, 8, 0, 0).unwrap(),
            source_url: format!("https://mail.example.com/{id}"),
        }
    }

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 7).unwrap(),
        )
    }

    #[test]
    fn invalid_configured_pattern_is_rejected() {
        let cfg = DigestConfig {
            transactional_patterns: vec!["(oops".into()],
            ..config()
        };
        let result = DigestPipeline::new(cfg, Arc::new(MockLlm::fixed("")));
        assert!(matches!(result, Err(PipelineError::InvalidPattern { .. })));
    }

    #[tokio::test]
    async fn no_newsletters_is_distinct_outcome() {
        let pipeline =
            DigestPipeline::new(config(), Arc::new(MockLlm::fixed("Reason: promo\nInclude: no")))
                .unwrap();
        let emails = vec![
            email("1", "deals@shop.com", "Flash sale", 2),
            email("2", "me@example.com", "Note to self", 3),
        ];
        let outcome = pipeline.run(emails, range()).await;
        assert_eq!(outcome.label(), "no_newsletters");
        let report = outcome.report();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.filtered.len(), 1);
        assert_eq!(report.costs.len(), 1);
        assert_eq!(report.excluded(), 1);
    }

    #[tokio::test]
    async fn all_summaries_failing_is_reported() {
        let llm = MockLlm::new(|req| {
            if request_text(req).contains("Include:") {
                Ok("Reason: essay\nInclude: yes".into())
            } else {
                Ok("no bullets here".into())
            }
        });
        let pipeline = DigestPipeline::new(config(), Arc::new(llm)).unwrap();
        let outcome = pipeline
            .run(vec![email("1", "a@news.com", "Weekly", 2)], range())
            .await;
        assert_eq!(outcome.label(), "no_summaries");
        assert_eq!(outcome.report().skipped.len(), 1);
        assert_eq!(outcome.report().costs.len(), 2);
    }

    #[tokio::test]
    async fn full_run_renders_digest_and_totals_costs() {
        let llm = MockLlm::new(|req| {
            let text = request_text(req);
            if text.contains("Include:") {
                Ok("Reason: analysis\nInclude: yes".into())
            } else if text.contains("\"sections\"") {
                Ok(r#"{"sections": [{"title": "Strategy", "bullets": [
                    {"id": "B1", "text": "Aggregators win distribution", "link": "https://mail.example.com/1"},
                    {"id": "B2", "text": "Bundles return", "link": "https://mail.example.com/1"},
                    {"id": "B3", "text": "Margins compress", "link": "https://mail.example.com/1"}
                ]}]}"#
                    .into())
            } else {
                Ok(r#"{"bullets": ["Aggregators win distribution", "Bundles return", "Margins compress"]}"#.into())
            }
        });
        let pipeline = DigestPipeline::new(config(), Arc::new(llm)).unwrap();
        let outcome = pipeline
            .run(vec![email("1", "ben@stratechery.com", "Stratechery", 2)], range())
            .await;

        let RunOutcome::Digest { digest, html, report } = outcome else {
            panic!("expected a digest");
        };
        assert_eq!(digest.sections.len(), 1);
        assert_eq!(digest.bullet_count(), 3);
        assert!(html.contains("Strategy"));
        assert_eq!(report.qa.checked(), 3);
        assert_eq!(report.qa.confirmed(), 3);
        assert_eq!(report.costs.len(), 3);
        let summed: Decimal = report.costs.iter().map(|c| c.cost_usd).sum();
        assert_eq!(report.total_cost, summed);
        let stages: Vec<(Stage, usize)> =
            report.stage_totals.iter().map(|(s, n, _)| (*s, *n)).collect();
        assert_eq!(
            stages,
            vec![(Stage::Classify, 1), (Stage::Summarize, 1), (Stage::Synthesize, 1)]
        );
    }

    #[tokio::test]
    async fn model_written_links_never_reach_the_html() {
        let llm = MockLlm::new(|req| {
            let text = request_text(req);
            if text.contains("Include:") {
                Ok("Reason: analysis\nInclude: yes".into())
            } else if text.contains("\"sections\"") {
                Ok(r#"{"sections": [{"title": "Macro", "bullets": [
                    {"id": "B1", "text": "Central bankers sat on their hands", "link": "https://evil.example/phish"},
                    {"text": "Invented claim", "link": "https://evil.example/other"}
                ]}]}"#
                    .into())
            } else if text.contains("\"source\"") {
                Ok(r#"{"source": "none"}"#.into())
            } else {
                Ok(r#"{"bullets": ["The Fed held rates steady", "Yields fell", "Housing slumped"]}"#.into())
            }
        });
        let pipeline = DigestPipeline::new(config(), Arc::new(llm)).unwrap();
        let outcome = pipeline
            .run(vec![email("1", "notes@macro.com", "Macro Notes", 2)], range())
            .await;

        let RunOutcome::Digest { digest, html, report } = outcome else {
            panic!("expected a digest");
        };
        assert!(!html.contains("evil.example"));
        for bullet in digest.sections.iter().flat_map(|s| &s.bullets) {
            assert_eq!(bullet.link, "https://mail.example.com/1");
        }
        assert_eq!(report.synthesis_unattributed, 1);
        assert_eq!(report.synthesis_omitted.len(), 2);
    }
}
