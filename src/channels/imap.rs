//! Read-only IMAP mailbox over rustls.
//!
//! Opens INBOX with EXAMINE so nothing is marked seen, searches by
//! `SINCE <date>`, and fetches the newest `max_results` messages with
//! `BODY.PEEK[]`. Blocking I/O runs under `spawn_blocking`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::channels::mime::{DEFAULT_PERMALINK_TEMPLATE, parse_message};
use crate::error::{ChannelError, ConfigError, PipelineError};
use crate::pipeline::types::{MailboxSource, MailboxWindow, RawEmail};

const IMAP_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// IMAP connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    /// Permalink template with a `{message_id}` placeholder.
    pub permalink_template: String,
}

impl ImapConfig {
    /// Build from `EMAIL_IMAP_HOST`, `EMAIL_IMAP_PORT`, `EMAIL_USERNAME`,
    /// `EMAIL_PASSWORD`, `DIGEST_PERMALINK_TEMPLATE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("EMAIL_IMAP_HOST").map_err(|_| ConfigError::MissingRequired {
            key: "EMAIL_IMAP_HOST".into(),
            hint: "Set the IMAP host, e.g. imap.gmail.com".into(),
        })?;
        let port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);
        let username = std::env::var("EMAIL_USERNAME")
            .map_err(|_| ConfigError::MissingEnvVar("EMAIL_USERNAME".into()))?;
        let password = std::env::var("EMAIL_PASSWORD")
            .map_err(|_| ConfigError::MissingEnvVar("EMAIL_PASSWORD".into()))?;
        let mailbox = std::env::var("EMAIL_IMAP_MAILBOX").unwrap_or_else(|_| "INBOX".into());
        let permalink_template = std::env::var("DIGEST_PERMALINK_TEMPLATE")
            .unwrap_or_else(|_| DEFAULT_PERMALINK_TEMPLATE.into());
        if !permalink_template.contains("{message_id}") {
            return Err(ConfigError::InvalidValue {
                key: "DIGEST_PERMALINK_TEMPLATE".into(),
                message: "must contain {message_id}".into(),
            });
        }

        Ok(Self {
            host,
            port,
            username,
            password: SecretString::from(password),
            mailbox,
            permalink_template,
        })
    }
}

/// Read-only IMAP mailbox source.
pub struct ImapMailbox {
    config: ImapConfig,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ImapConfig {
        &self.config
    }
}

#[async_trait]
impl MailboxSource for ImapMailbox {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch(&self, window: MailboxWindow) -> Result<Vec<RawEmail>, PipelineError> {
        let config = self.config.clone();
        info!(
            host = %config.host,
            mailbox = %config.mailbox,
            since = %window.since.format("%Y-%m-%d"),
            max = window.max_results,
            "Fetching mailbox window"
        );
        let result = tokio::task::spawn_blocking(move || fetch_window(&config, window))
            .await
            .map_err(|e| PipelineError::MailboxFetch(format!("IMAP task failed: {e}")))?;
        result.map_err(|e| PipelineError::MailboxFetch(e.to_string()))
    }
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Tagged IMAP session over a buffered TLS stream.
struct ImapSession {
    stream: BufReader<TlsStream>,
    tag: u32,
}

/// One command's untagged output: text lines and any literals, in order.
#[derive(Default)]
struct Response {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
    status: String,
}

impl ImapSession {
    fn connect(host: &str, port: u16) -> Result<Self, ChannelError> {
        let tcp = TcpStream::connect((host, port))?;
        tcp.set_read_timeout(Some(IMAP_READ_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| fetch_error(format!("invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| fetch_error(format!("TLS setup failed: {e}")))?;

        let mut session = Self {
            stream: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            tag: 0,
        };
        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") {
            return Err(fetch_error(format!("unexpected greeting: {}", greeting.trim())));
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ChannelError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(fetch_error("IMAP connection closed".into()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send a command and collect everything up to its tagged completion.
    fn command(&mut self, cmd: &str) -> Result<Response, ChannelError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        let stream = self.stream.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                response.status = status.trim().to_string();
                return Ok(response);
            }
            if let Some(size) = literal_size(&line) {
                let mut literal = vec![0u8; size];
                self.stream.read_exact(&mut literal)?;
                response.literals.push(literal);
            }
            response.lines.push(line);
        }
    }

    fn expect_ok(&mut self, cmd: &str, what: &str) -> Result<Response, ChannelError> {
        let response = self.command(cmd)?;
        if !response.status.starts_with("OK") {
            return Err(fetch_error(format!("{what} failed: {}", response.status)));
        }
        Ok(response)
    }
}

fn fetch_error(reason: String) -> ChannelError {
    ChannelError::FetchFailed {
        name: "imap".into(),
        reason,
    }
}

/// `{1234}` at the end of a line announces a literal of that many bytes.
fn literal_size(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    let inner = trimmed.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// Quote a string for an IMAP command.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// IMAP date for SEARCH, e.g. `3-Mar-2026`.
fn imap_date(at: DateTime<Utc>) -> String {
    at.format("%-d-%b-%Y").to_string()
}

/// Sequence numbers from `* SEARCH ...` lines.
fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

fn fetch_window(config: &ImapConfig, window: MailboxWindow) -> Result<Vec<RawEmail>, ChannelError> {
    let mut session = ImapSession::connect(&config.host, config.port)?;

    let login = session.command(&format!(
        "LOGIN {} {}",
        quote(&config.username),
        quote(config.password.expose_secret())
    ))?;
    if !login.status.starts_with("OK") {
        return Err(ChannelError::AuthFailed {
            name: "imap".into(),
            reason: login.status,
        });
    }

    session.expect_ok(&format!("EXAMINE {}", quote(&config.mailbox)), "EXAMINE")?;
    let search = session.expect_ok(
        &format!("SEARCH SINCE {}", imap_date(window.since)),
        "SEARCH",
    )?;

    let mut seqs = parse_search(&search.lines);
    seqs.sort_unstable();
    let newest: Vec<u32> = seqs.into_iter().rev().take(window.max_results).collect();
    debug!(matched = newest.len(), "IMAP search complete");

    let mut emails = Vec::with_capacity(newest.len());
    for seq in newest {
        let response = session.expect_ok(&format!("FETCH {seq} BODY.PEEK[]"), "FETCH")?;
        let Some(raw) = response.literals.first() else {
            warn!(seq, "FETCH returned no message body");
            continue;
        };
        match parse_message(raw, &format!("imap-{seq}"), &config.permalink_template) {
            // SEARCH SINCE is day-granular; trim to the exact window.
            Some(email) if email.received_at >= window.since => emails.push(email),
            Some(_) => {}
            None => warn!(seq, "Unparseable message skipped"),
        }
    }

    let _ = session.command("LOGOUT");
    info!(fetched = emails.len(), "IMAP fetch complete");
    Ok(emails)
}
