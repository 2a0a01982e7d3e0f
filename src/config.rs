//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Newsletter sources the classifier is told to favour.
pub const DEFAULT_NEWSLETTER_ALLOWLIST: &[&str] = &[
    "Stratechery",
    "Lenny's Newsletter",
    "a16z",
    "Adam Grant",
    "Chartr",
    "AI Secret",
    "The Defiant",
    "CoinTracker",
    "The Information",
    "The Block",
    "Keychain",
    "Guy Raz",
    "Robinhood Snacks",
    "Newcomer",
    "Sequoia",
    "Y Combinator",
];

/// Digest pipeline configuration.
#[derive(Debug, Clone)]
pub struct DigestConfig {
    /// The mailbox owner's address; mail from it is never summarized.
    pub own_address: String,
    /// How far back the mailbox window reaches.
    pub lookback_days: u32,
    /// Cap on messages fetched from the mailbox.
    pub max_results: usize,
    /// Maximum concurrent per-email model calls.
    pub concurrency: usize,
    /// Per-call timeout; a hung call becomes a local failure.
    pub call_timeout: Duration,
    /// Minimum match score for Link-QA to trust a deterministic attribution.
    pub qa_match_threshold: f64,
    /// Ask the model to adjudicate bullets below the match threshold.
    pub qa_adjudicate: bool,
    /// Bullet bounds per email summary.
    pub min_bullets: usize,
    pub max_bullets: usize,
    /// Known newsletter sources, passed to the classifier prompt.
    pub newsletter_allowlist: Vec<String>,
    /// Extra transactional regexes for the email filter.
    pub transactional_patterns: Vec<String>,
    /// Digest recipient (defaults to `own_address`).
    pub recipient: Option<String>,
    /// Write the rendered HTML here instead of sending it.
    pub html_out: Option<std::path::PathBuf>,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            own_address: String::new(),
            lookback_days: 7,
            max_results: 50,
            concurrency: 4,
            call_timeout: Duration::from_secs(60),
            qa_match_threshold: 0.35,
            qa_adjudicate: true,
            min_bullets: 3,
            max_bullets: 8,
            newsletter_allowlist: DEFAULT_NEWSLETTER_ALLOWLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            transactional_patterns: Vec::new(),
            recipient: None,
            html_out: None,
        }
    }
}

impl DigestConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let own_address = std::env::var("DIGEST_OWN_ADDRESS")
            .or_else(|_| std::env::var("EMAIL_USERNAME"))
            .map_err(|_| ConfigError::MissingRequired {
                key: "DIGEST_OWN_ADDRESS".to_string(),
                hint: "Set it to the mailbox owner's address.".to_string(),
            })?;

        let newsletter_allowlist = match std::env::var("DIGEST_ALLOWLIST") {
            Ok(raw) => split_list(&raw, ','),
            Err(_) => defaults.newsletter_allowlist,
        };

        let config = Self {
            own_address,
            lookback_days: env_parse("DIGEST_LOOKBACK_DAYS")?.unwrap_or(defaults.lookback_days),
            max_results: env_parse("DIGEST_MAX_RESULTS")?.unwrap_or(defaults.max_results),
            concurrency: env_parse("DIGEST_CONCURRENCY")?.unwrap_or(defaults.concurrency),
            call_timeout: env_parse("DIGEST_CALL_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.call_timeout),
            qa_match_threshold: env_parse("DIGEST_QA_THRESHOLD")?
                .unwrap_or(defaults.qa_match_threshold),
            qa_adjudicate: env_parse("DIGEST_QA_ADJUDICATE")?.unwrap_or(defaults.qa_adjudicate),
            min_bullets: env_parse("DIGEST_MIN_BULLETS")?.unwrap_or(defaults.min_bullets),
            max_bullets: env_parse("DIGEST_MAX_BULLETS")?.unwrap_or(defaults.max_bullets),
            newsletter_allowlist,
            transactional_patterns: std::env::var("DIGEST_TRANSACTIONAL_PATTERNS")
                .map(|raw| split_list(&raw, ';'))
                .unwrap_or_default(),
            recipient: std::env::var("DIGEST_RECIPIENT").ok(),
            html_out: std::env::var("DIGEST_HTML_OUT").ok().map(Into::into),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline can't run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(invalid("DIGEST_CONCURRENCY", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.qa_match_threshold) {
            return Err(invalid("DIGEST_QA_THRESHOLD", "must be within 0.0..=1.0"));
        }
        if self.min_bullets == 0 || self.min_bullets > self.max_bullets {
            return Err(invalid(
                "DIGEST_MIN_BULLETS",
                "must be at least 1 and not exceed DIGEST_MAX_BULLETS",
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(invalid("DIGEST_CALL_TIMEOUT_SECS", "must be positive"));
        }
        Ok(())
    }

    /// Where the digest gets delivered.
    pub fn recipient(&self) -> &str {
        self.recipient.as_deref().unwrap_or(&self.own_address)
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Parse an optional env var, rejecting values that are present but malformed.
fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, &format!("could not parse '{raw}'"))),
        Err(_) => Ok(None),
    }
}

fn split_list(raw: &str, sep: char) -> Vec<String> {
    raw.split(sep)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
