//! Pre-LLM email filter.
//!
//! Runs before any model call and drops:
//! - mail sent by the mailbox owner (case-insensitive bare-address match)
//! - transactional mail: receipts, security alerts, shipping notifications
//! - malformed entries (no id or no sender)
//!
//! Pure and order-preserving; never fails.

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::RawEmail;

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Subject,
    Body,
    SubjectOrBody,
}

/// A transactional-mail rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct TransactionalRule {
    pub regex: Regex,
    pub field: RuleField,
    /// Why this rule triggers.
    pub reason: String,
}

/// Why an email was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    SelfSent,
    Transactional(String),
    Malformed(&'static str),
}

impl DropReason {
    pub fn label(&self) -> String {
        match self {
            Self::SelfSent => "self-sent".to_string(),
            Self::Transactional(reason) => format!("transactional ({reason})"),
            Self::Malformed(what) => format!("malformed ({what})"),
        }
    }
}

/// Built-in transactional patterns: (regex, field, reason).
const DEFAULT_TRANSACTIONAL: &[(&str, RuleField, &str)] = &[
    (
        r"(?i)\b(your (receipt|invoice)|receipt (for|from)|payment (received|confirmed|failed)|order confirmation|invoice #)",
        RuleField::SubjectOrBody,
        "receipt/payment",
    ),
    (
        r"(?i)\b(security alert|new sign[- ]?in|suspicious (sign[- ]?in|activity)|password (reset|changed)|verification code|one[- ]time (code|passcode)|2-step verification)",
        RuleField::Subject,
        "security alert",
    ),
    (
        r"(?i)\b(your (order|package|shipment) (has|is|was)|tracking (number|update)|has (shipped|been delivered)|out for delivery|delivery (update|scheduled))",
        RuleField::SubjectOrBody,
        "shipping notification",
    ),
    (
        r"(?i)\b(price alert|is (up|down) \d+(\.\d+)?%)",
        RuleField::Subject,
        "price alert",
    ),
    (
        r"(?i)^(mailer[\-_]?daemon|postmaster)@",
        RuleField::Sender,
        "automated mail system",
    ),
];

/// Rule-based pre-filter.
pub struct EmailFilter {
    own_address: String,
    rules: Vec<TransactionalRule>,
}

impl EmailFilter {
    /// Create a filter with the built-in transactional patterns.
    pub fn default_rules(own_address: &str) -> Self {
        let rules = DEFAULT_TRANSACTIONAL
            .iter()
            .map(|(pattern, field, reason)| TransactionalRule {
                regex: Regex::new(pattern).expect("built-in transactional pattern compiles"),
                field: *field,
                reason: (*reason).to_string(),
            })
            .collect();
        Self {
            own_address: own_address.trim().to_lowercase(),
            rules,
        }
    }

    /// Create a filter that only drops self-sent and malformed mail.
    pub fn empty(own_address: &str) -> Self {
        Self {
            own_address: own_address.trim().to_lowercase(),
            rules: Vec::new(),
        }
    }

    /// Add a configured transactional rule.
    pub fn add_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        reason: &str,
    ) -> Result<(), regex::Error> {
        self.rules.push(TransactionalRule {
            regex: Regex::new(pattern)?,
            field,
            reason: reason.into(),
        });
        Ok(())
    }

    /// Decide whether one email is dropped, and why.
    pub fn evaluate(&self, email: &RawEmail) -> Option<DropReason> {
        if email.id.trim().is_empty() {
            return Some(DropReason::Malformed("missing id"));
        }
        let sender = email.sender_address();
        if sender.is_empty() {
            return Some(DropReason::Malformed("missing sender"));
        }
        if !self.own_address.is_empty() && sender == self.own_address {
            return Some(DropReason::SelfSent);
        }

        for rule in &self.rules {
            let matched = match rule.field {
                RuleField::Sender => rule.regex.is_match(&sender),
                RuleField::Subject => rule.regex.is_match(&email.subject),
                RuleField::Body => rule.regex.is_match(&email.body),
                RuleField::SubjectOrBody => {
                    rule.regex.is_match(&email.subject) || rule.regex.is_match(&email.body)
                }
            };
            if matched {
                return Some(DropReason::Transactional(rule.reason.clone()));
            }
        }
        None
    }

    /// Keep the emails that pass, in their original order.
    pub fn filter(&self, emails: Vec<RawEmail>) -> Vec<RawEmail> {
        self.partition(emails).0
    }

    /// Split into (kept, dropped-with-reason), both order-preserving.
    pub fn partition(&self, emails: Vec<RawEmail>) -> (Vec<RawEmail>, Vec<(RawEmail, DropReason)>) {
        let mut kept = Vec::with_capacity(emails.len());
        let mut dropped = Vec::new();
        for email in emails {
            match self.evaluate(&email) {
                Some(reason) => {
                    debug!(
                        id = %email.id,
                        sender = %email.sender,
                        reason = %reason.label(),
                        "Email filtered out"
                    );
                    dropped.push((email, reason));
                }
                None => kept.push(email),
            }
        }
        (kept, dropped)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn make_email(id: &str, sender: &str, subject: &str, body: &str) -> RawEmail {
        RawEmail {
            id: id.into(),
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            received_at: Utc::now(),
            source_url: format!("https://mail.example.com/{id}"),
        }
    }

    #[test]
    fn drops_own_address_case_insensitive() {
        let filter = EmailFilter::default_rules("Me@Example.com");
        let email = make_email("1", "Me <ME@example.COM>", "Notes to self", "todo");
        assert_eq!(filter.evaluate(&email), Some(DropReason::SelfSent));
    }

    #[test]
    fn keeps_similar_but_different_address() {
        let filter = EmailFilter::default_rules("me@example.com");
        let email = make_email("1", "notme@example.com", "Weekly essay", "Thoughts on AI");
        assert!(filter.evaluate(&email).is_none());
    }

    #[test]
    fn drops_receipts() {
        let filter = EmailFilter::default_rules("me@example.com");
        let email = make_email(
            "1",
            "Uber <receipts@uber.com>",
            "Your receipt from Uber",
            "Thank you for your ride. Here's your receipt.",
        );
        assert!(matches!(
            filter.evaluate(&email),
            Some(DropReason::Transactional(r)) if r == "receipt/payment"
        ));
    }

    #[test]
    fn drops_security_alerts() {
        let filter = EmailFilter::default_rules("me@example.com");
        let email = make_email(
            "1",
            "Google <no-reply@accounts.google.com>",
            "Security alert: new sign-in on Mac",
            "We noticed a new sign-in.",
        );
        assert!(matches!(
            filter.evaluate(&email),
            Some(DropReason::Transactional(_))
        ));
    }

    #[test]
    fn drops_shipping_notifications() {
        let filter = EmailFilter::default_rules("me@example.com");
        let email = make_email(
            "1",
            "orders@shop.com",
            "Good news",
            "Your package has shipped and is out for delivery.",
        );
        assert!(filter.evaluate(&email).is_some());
    }

    #[test]
    fn keeps_newsletter() {
        let filter = EmailFilter::default_rules("me@example.com");
        let email = make_email(
            "1",
            "Lenny Rachitsky <lenny@substack.com>",
            "Lenny's Newsletter: Product Management Insights",
            "This week's product management insights and case studies...",
        );
        assert!(filter.evaluate(&email).is_none());
    }

    #[test]
    fn malformed_entries_excluded_not_raised() {
        let filter = EmailFilter::empty("me@example.com");
        assert_eq!(
            filter.evaluate(&make_email("", "a@b.com", "s", "b")),
            Some(DropReason::Malformed("missing id"))
        );
        assert_eq!(
            filter.evaluate(&make_email("1", "   ", "s", "b")),
            Some(DropReason::Malformed("missing sender"))
        );
    }

    #[test]
    fn filter_preserves_order() {
        let filter = EmailFilter::default_rules("me@example.com");
        let emails = vec![
            make_email("a", "x@news.com", "Issue 1", "essay"),
            make_email("b", "me@example.com", "self", "note"),
            make_email("c", "y@news.com", "Issue 2", "essay"),
            make_email("d", "z@news.com", "Issue 3", "essay"),
        ];
        let kept: Vec<String> = filter.filter(emails).into_iter().map(|e| e.id).collect();
        assert_eq!(kept, vec!["a", "c", "d"]);
    }

    #[test]
    fn output_never_contains_own_address() {
        let filter = EmailFilter::default_rules("owner@mail.io");
        let senders = [
            "owner@mail.io",
            "OWNER@MAIL.IO",
            "Owner <Owner@Mail.io>",
            "other@mail.io",
            "owner@mail.io.evil.com",
        ];
        let emails: Vec<RawEmail> = senders
            .iter()
            .enumerate()
            .map(|(i, s)| make_email(&i.to_string(), s, "Weekly", "essay"))
            .collect();
        let kept = filter.filter(emails);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|e| e.sender_address() != "owner@mail.io"));
    }

    #[test]
    fn custom_rule_applies() {
        let mut filter = EmailFilter::empty("me@example.com");
        filter
            .add_rule(r"(?i)webinar", RuleField::Subject, "event invite")
            .unwrap();
        let email = make_email("1", "events@x.com", "Join our Webinar", "");
        assert_eq!(
            filter.evaluate(&email),
            Some(DropReason::Transactional("event invite".into()))
        );
    }

    #[test]
    fn invalid_custom_rule_is_an_error() {
        let mut filter = EmailFilter::empty("me@example.com");
        assert!(filter.add_rule("(unclosed", RuleField::Body, "x").is_err());
    }
}
