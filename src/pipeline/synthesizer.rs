//! Cross-email synthesizer.
//!
//! One model call groups every summary bullet into themed sections. Bullets
//! go in as `{id, link, text}` records and come back by id only. Links are
//! always re-attached from the submitted record; returned bullets without a
//! known id are dropped. Link-QA checks attribution afterwards.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::llm::parse::{Parsed, parse_json_object};
use crate::llm::provider::{ChatMessage, CompletionRequest};
use crate::pipeline::caller::ModelCaller;
use crate::pipeline::types::{
    DateRange, Digest, DigestSection, EmailSummary, FailureKind, InsightBullet, RawEmail, Stage,
};

const SYNTHESIZE_MAX_TOKENS: u32 = 4096;

const SYNTHESIZE_TEMPERATURE: f32 = 0.4;

/// Section title used when the model leaves one blank.
const UNTITLED_SECTION: &str = "Highlights";

/// Result of synthesis, with the reason if the fallback layout was used.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub digest: Digest,
    pub fallback: Option<(FailureKind, String)>,
    /// Submitted bullets whose id appeared in no returned section.
    pub omitted: Vec<InsightBullet>,
    /// Returned bullets dropped because their id was missing or unknown.
    pub unattributed: usize,
}

impl Synthesis {
    fn fell_back(digest: Digest, kind: FailureKind, reason: String) -> Self {
        Self {
            digest,
            fallback: Some((kind, reason)),
            omitted: Vec::new(),
            unattributed: 0,
        }
    }
}

/// Bullet record sent to the model.
#[derive(Debug, Clone, Serialize)]
struct BulletRecord<'a> {
    id: String,
    link: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SynthesisResponse {
    sections: Vec<SectionResponse>,
}

#[derive(Debug, Deserialize)]
struct SectionResponse {
    #[serde(default)]
    title: String,
    #[serde(default)]
    bullets: Vec<BulletResponse>,
}

#[derive(Debug, Deserialize)]
struct BulletResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    text: String,
}

/// Sections resolved against the submitted bullets.
struct ResolvedSections {
    sections: Vec<DigestSection>,
    used: HashSet<String>,
    unattributed: usize,
}

/// Model-backed digest synthesizer.
pub struct Synthesizer {
    caller: ModelCaller,
}

impl Synthesizer {
    pub fn new(caller: ModelCaller) -> Self {
        Self { caller }
    }

    /// Group every summary bullet into themed sections.
    ///
    /// `emails` supplies subjects and receive times for ordering and for the
    /// fallback layout. No model call is made when there are no bullets.
    pub async fn synthesize(
        &self,
        summaries: &[EmailSummary],
        emails: &[RawEmail],
        date_range: DateRange,
    ) -> Synthesis {
        let ordered = order_summaries(summaries, emails);
        let records = bullet_records(&ordered);

        if records.is_empty() {
            return Synthesis {
                digest: Digest {
                    date_range,
                    sections: Vec::new(),
                },
                fallback: None,
                omitted: Vec::new(),
                unattributed: 0,
            };
        }

        let records_json = match serde_json::to_string_pretty(&records) {
            Ok(json) => json,
            Err(e) => {
                return Synthesis::fell_back(
                    fallback_digest(&ordered, emails, date_range),
                    FailureKind::ParseFailure,
                    e.to_string(),
                );
            }
        };

        let request = CompletionRequest::new(vec![
            ChatMessage::system(SYNTHESIZE_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Digest period: {date_range}\n\nBullets:\n{records_json}"
            )),
        ])
        .with_temperature(SYNTHESIZE_TEMPERATURE)
        .with_max_tokens(SYNTHESIZE_MAX_TOKENS);

        let outcome = self.caller.call(Stage::Synthesize, request).await;
        let raw = match outcome.result {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Synthesizer call failed, using per-email layout");
                return Synthesis::fell_back(
                    fallback_digest(&ordered, emails, date_range),
                    FailureKind::ProviderFailure,
                    e.to_string(),
                );
            }
        };

        let lookup: HashMap<String, &InsightBullet> = records
            .iter()
            .map(|r| r.id.clone())
            .zip(ordered.iter().flat_map(|s| s.bullets.iter()))
            .collect();

        match parse_sections(&raw, &lookup) {
            Parsed::Parsed(resolved) => {
                let omitted: Vec<InsightBullet> = records
                    .iter()
                    .filter(|r| !resolved.used.contains(&r.id))
                    .filter_map(|r| lookup.get(&r.id).map(|b| (*b).clone()))
                    .collect();
                if !omitted.is_empty() || resolved.unattributed > 0 {
                    warn!(
                        omitted = omitted.len(),
                        unattributed = resolved.unattributed,
                        "Synthesis did not account for every bullet"
                    );
                }
                info!(
                    sections = resolved.sections.len(),
                    bullets_in = records.len(),
                    bullets_out = resolved.sections.iter().map(|s| s.bullets.len()).sum::<usize>(),
                    "Synthesis complete"
                );
                Synthesis {
                    digest: Digest {
                        date_range,
                        sections: resolved.sections,
                    },
                    fallback: None,
                    omitted,
                    unattributed: resolved.unattributed,
                }
            }
            Parsed::Unparseable(reason) => {
                warn!(
                    raw_response = %raw,
                    error = %reason,
                    "Unparseable synthesis, using per-email layout"
                );
                Synthesis::fell_back(
                    fallback_digest(&ordered, emails, date_range),
                    FailureKind::ParseFailure,
                    reason,
                )
            }
        }
    }
}

const SYNTHESIZE_SYSTEM_PROMPT: &str = "\
You are editing a weekly newsletter digest.

You receive insight bullets from several newsletters, each as {\"id\", \"link\", \"text\"}.
Group them into 2 to 6 themed sections with short, specific titles. You may tighten a
bullet's wording, but keep its meaning and echo its \"id\" exactly as given. Do not return
links; they are re-attached from the id. Do not invent bullets. Place every bullet once.

Respond with ONLY a JSON object:
{\"sections\": [{\"title\": \"...\", \"bullets\": [{\"id\": \"B1\", \"text\": \"...\"}]}]}";

/// Summaries sorted by (received_at, email id) of their source email.
fn order_summaries(summaries: &[EmailSummary], emails: &[RawEmail]) -> Vec<EmailSummary> {
    let received: HashMap<&str, DateTime<Utc>> = emails
        .iter()
        .map(|e| (e.id.as_str(), e.received_at))
        .collect();
    let mut ordered = summaries.to_vec();
    ordered.sort_by(|a, b| {
        let ka = (received.get(a.email_id.as_str()), &a.email_id);
        let kb = (received.get(b.email_id.as_str()), &b.email_id);
        ka.cmp(&kb)
    });
    ordered
}

fn bullet_records(summaries: &[EmailSummary]) -> Vec<BulletRecord<'_>> {
    summaries
        .iter()
        .flat_map(|s| s.bullets.iter())
        .enumerate()
        .map(|(i, b)| BulletRecord {
            id: format!("B{}", i + 1),
            link: &b.link,
            text: &b.text,
        })
        .collect()
}

/// Resolve the model's sections against the submitted bullets.
///
/// Every bullet keeps the link of the record its id names; blank text falls
/// back to the submitted text. Bullets without a known id are dropped and
/// counted, as are empty sections.
fn parse_sections(
    raw: &str,
    lookup: &HashMap<String, &InsightBullet>,
) -> Parsed<ResolvedSections> {
    let response = match parse_json_object::<SynthesisResponse>(raw) {
        Parsed::Parsed(response) => response,
        Parsed::Unparseable(reason) => return Parsed::Unparseable(reason),
    };

    let mut used = HashSet::new();
    let mut unattributed = 0;
    let mut sections = Vec::new();
    for section in response.sections {
        let mut bullets = Vec::new();
        for b in section.bullets {
            let known = b
                .id
                .as_deref()
                .and_then(|id| lookup.get_key_value(id.trim()));
            let Some((id, orig)) = known else {
                debug!(id = ?b.id, "Dropping synthesized bullet with no known id");
                unattributed += 1;
                continue;
            };
            let text = match b.text.trim() {
                "" => orig.text.clone(),
                text => text.to_string(),
            };
            used.insert(id.clone());
            bullets.push(InsightBullet::new(text, orig.link.clone()));
        }
        if bullets.is_empty() {
            continue;
        }
        let title = match section.title.trim() {
            "" => UNTITLED_SECTION.to_string(),
            t => t.to_string(),
        };
        sections.push(DigestSection { title, bullets });
    }

    if sections.is_empty() {
        return Parsed::Unparseable("response contained no non-empty sections".into());
    }
    Parsed::Parsed(ResolvedSections {
        sections,
        used,
        unattributed,
    })
}

/// One section per source email, titled by its subject.
pub fn fallback_digest(
    summaries: &[EmailSummary],
    emails: &[RawEmail],
    date_range: DateRange,
) -> Digest {
    let subjects: HashMap<&str, &str> = emails
        .iter()
        .map(|e| (e.id.as_str(), e.subject.as_str()))
        .collect();
    let sections = order_summaries(summaries, emails)
        .into_iter()
        .filter(|s| !s.bullets.is_empty())
        .map(|s| {
            let title = subjects
                .get(s.email_id.as_str())
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .unwrap_or(UNTITLED_SECTION)
                .to_string();
            DigestSection {
                title,
                bullets: s.bullets,
            }
        })
        .collect();
    Digest {
        date_range,
        sections,
    }
}

/// Sort sections by the earliest receive time among their bullets' source
/// emails, then by title. Bullets with unknown links sort last.
pub fn order_sections(digest: &mut Digest, emails: &[RawEmail]) {
    let received: HashMap<&str, DateTime<Utc>> = emails
        .iter()
        .map(|e| (e.source_url.as_str(), e.received_at))
        .collect();
    let earliest = |section: &DigestSection| {
        section
            .bullets
            .iter()
            .filter_map(|b| received.get(b.link.as_str()).copied())
            .min()
    };
    digest.sections.sort_by(|a, b| {
        let (ea, eb) = (earliest(a), earliest(b));
        match (ea, eb) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then_with(|| a.title.cmp(&b.title))
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{NaiveDate, TimeZone};

    use super::*;
    use crate::error::LlmError;
    use crate::pipeline::caller::testing::{MockLlm, request_text};
    use crate::pipeline::ledger::CostLedger;

    fn range() -> DateRange {
        let d = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        DateRange::new(d, d + chrono::Duration::days(6))
    }

    fn make_email(id: &str, subject: &str, day: u32) -> RawEmail {
        RawEmail {
            id: id.into(),
            sender: format!("{id}@news.com"),
            subject: subject.into(),
            body: String::new(),
            received_at: Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).unwrap(),
            source_url: format!("https://mail.example.com/{id}"),
        }
    }

    fn summary(id: &str, texts: &[&str]) -> EmailSummary {
        EmailSummary {
            email_id: id.into(),
            bullets: texts
                .iter()
                .map(|t| InsightBullet::new(*t, format!("https://mail.example.com/{id}")))
                .collect(),
        }
    }

    fn synthesizer(llm: MockLlm) -> (Synthesizer, Arc<CostLedger>) {
        let ledger = Arc::new(CostLedger::new());
        let caller = ModelCaller::new(Arc::new(llm), Arc::clone(&ledger), Duration::from_secs(5));
        (Synthesizer::new(caller), ledger)
    }

    #[tokio::test]
    async fn groups_bullets_and_drops_empty_sections() {
        let response = r#"{"sections": [
            {"title": "AI", "bullets": [
                {"id": "B1", "text": "Agents are eating SaaS", "link": "https://mail.example.com/a"},
                {"id": "B3", "text": "", "link": "https://mail.example.com/b"}
            ]},
            {"title": "Empty", "bullets": []},
            {"title": "", "bullets": [{"id": "B2", "text": "Rates stay high"}]}
        ]}"#;
        let (synth, ledger) = synthesizer(MockLlm::fixed(response));
        let emails = vec![make_email("a", "AI weekly", 2), make_email("b", "Macro", 3)];
        let summaries = vec![summary("a", &["agents", "rates"]), summary("b", &["chips"])];

        let out = synth.synthesize(&summaries, &emails, range()).await;
        assert!(out.fallback.is_none());
        let sections = &out.digest.sections;
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].bullets[1].text, "chips");
        assert_eq!(sections[1].title, UNTITLED_SECTION);
        assert_eq!(sections[1].bullets[0].link, "https://mail.example.com/a");
        assert!(out.omitted.is_empty());
        assert_eq!(out.unattributed, 0);
        assert_eq!(ledger.call_count(), 1);
    }

    #[tokio::test]
    async fn links_come_from_submitted_ids_only() {
        let response = r#"{"sections": [{"title": "Macro", "bullets": [
            {"id": "B1", "text": "Central bankers sat on their hands", "link": "https://evil.example/phish"},
            {"text": "Invented claim", "link": "https://evil.example/other"},
            {"id": "B9", "text": "Unknown id"}
        ]}]}"#;
        let (synth, _) = synthesizer(MockLlm::fixed(response));
        let emails = vec![make_email("a", "Macro Notes", 2)];
        let summaries = vec![summary("a", &["The Fed held rates", "Yields fell"])];

        let out = synth.synthesize(&summaries, &emails, range()).await;
        assert!(out.fallback.is_none());
        assert_eq!(out.digest.bullet_count(), 1);
        let bullet = &out.digest.sections[0].bullets[0];
        assert_eq!(bullet.text, "Central bankers sat on their hands");
        assert_eq!(bullet.link, "https://mail.example.com/a");
        assert_eq!(out.unattributed, 2);
        assert_eq!(out.omitted.len(), 1);
        assert_eq!(out.omitted[0].text, "Yields fell");
    }

    #[tokio::test]
    async fn only_invented_bullets_falls_back() {
        let response = r#"{"sections": [{"title": "Macro", "bullets": [
            {"text": "Invented claim", "link": "https://evil.example/other"}
        ]}]}"#;
        let (synth, _) = synthesizer(MockLlm::fixed(response));
        let emails = vec![make_email("a", "Macro Notes", 2)];
        let out = synth
            .synthesize(&[summary("a", &["The Fed held rates"])], &emails, range())
            .await;
        assert_eq!(out.fallback.map(|f| f.0), Some(FailureKind::ParseFailure));
        assert_eq!(out.digest.sections[0].bullets[0].link, "https://mail.example.com/a");
    }

    #[tokio::test]
    async fn prompt_lists_bullets_in_received_order() {
        let llm = Arc::new(MockLlm::fixed(
            r#"{"sections": [{"title": "x", "bullets": [{"id": "B1", "text": "t"}]}]}"#,
        ));
        let caller = ModelCaller::new(llm.clone(), Arc::new(CostLedger::new()), Duration::from_secs(5));
        let synth = Synthesizer::new(caller);
        let emails = vec![make_email("late", "Late", 5), make_email("early", "Early", 1)];
        let summaries = vec![summary("late", &["late insight"]), summary("early", &["early insight"])];
        synth.synthesize(&summaries, &emails, range()).await;

        let requests = llm.requests.lock().unwrap();
        let text = request_text(&requests[0]);
        let early = text.find("early insight").unwrap();
        let late = text.find("late insight").unwrap();
        assert!(early < late);
        assert!(text.contains("\"id\": \"B1\""));
    }

    #[tokio::test]
    async fn failure_falls_back_to_one_section_per_email() {
        let llm = MockLlm::new(|_| {
            Err(LlmError::RequestFailed {
                provider: "mock".into(),
                reason: "overloaded".into(),
            })
        });
        let (synth, ledger) = synthesizer(llm);
        let emails = vec![make_email("b", "Second", 4), make_email("a", "First", 2)];
        let summaries = vec![summary("b", &["x"]), summary("a", &["y", "z"])];

        let out = synth.synthesize(&summaries, &emails, range()).await;
        assert_eq!(out.fallback.as_ref().map(|f| f.0), Some(FailureKind::ProviderFailure));
        let titles: Vec<&str> = out.digest.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["First", "Second"]);
        assert_eq!(out.digest.bullet_count(), 3);
        assert_eq!(ledger.call_count(), 1);
    }

    #[tokio::test]
    async fn unparseable_response_falls_back() {
        let (synth, _) = synthesizer(MockLlm::fixed("Here are some themes: AI, macro."));
        let emails = vec![make_email("a", "First", 2)];
        let out = synth.synthesize(&[summary("a", &["y"])], &emails, range()).await;
        assert_eq!(out.fallback.map(|f| f.0), Some(FailureKind::ParseFailure));
        assert_eq!(out.digest.sections[0].title, "First");
    }

    #[tokio::test]
    async fn no_bullets_means_no_call() {
        let (synth, ledger) = synthesizer(MockLlm::fixed("{}"));
        let out = synth.synthesize(&[], &[], range()).await;
        assert!(out.digest.sections.is_empty());
        assert_eq!(ledger.call_count(), 0);
    }

    #[test]
    fn order_sections_by_earliest_source_then_title() {
        let emails = vec![
            make_email("a", "A", 1),
            make_email("b", "B", 3),
            make_email("c", "C", 3),
        ];
        let section = |title: &str, ids: &[&str]| DigestSection {
            title: title.into(),
            bullets: ids
                .iter()
                .map(|id| InsightBullet::new("t", format!("https://mail.example.com/{id}")))
                .collect(),
        };
        let mut digest = Digest {
            date_range: range(),
            sections: vec![
                section("Zeta", &["c"]),
                section("Unknown", &["zz"]),
                section("Beta", &["b"]),
                section("Mixed", &["c", "a"]),
            ],
        };
        order_sections(&mut digest, &emails);
        let titles: Vec<&str> = digest.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Mixed", "Beta", "Zeta", "Unknown"]);
    }
}
