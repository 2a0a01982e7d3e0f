//! MIME decoding: raw RFC 822 bytes into `RawEmail`.

use chrono::{DateTime, Utc};
use mail_parser::{Message, MessageParser, MimeHeaders};

use crate::pipeline::types::RawEmail;

/// Default permalink: Gmail search by RFC 822 Message-ID.
pub const DEFAULT_PERMALINK_TEMPLATE: &str =
    "https://mail.google.com/mail/u/0/#search/rfc822msgid:{message_id}";

/// Decode one message. Returns `None` when the bytes don't parse as mail.
///
/// `fallback_id` is used when the message carries no Message-ID header.
pub fn parse_message(
    raw: &[u8],
    fallback_id: &str,
    permalink_template: &str,
) -> Option<RawEmail> {
    let parsed = MessageParser::default().parse(raw)?;

    let message_id = parsed
        .message_id()
        .map(|s| s.trim_matches(|c| c == '<' || c == '>').to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback_id.to_string());

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(RawEmail {
        source_url: permalink(permalink_template, &message_id),
        id: message_id,
        sender: extract_sender(&parsed),
        subject: parsed.subject().unwrap_or("(no subject)").trim().to_string(),
        body: extract_text(&parsed),
        received_at,
    })
}

/// Fill `{message_id}` in the template, percent-encoding the id.
pub fn permalink(template: &str, message_id: &str) -> String {
    template.replace("{message_id}", &percent_encode(message_id))
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'@' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// `From` as `Name <address>`, or the bare address when there's no name.
fn extract_sender(parsed: &Message) -> String {
    let Some(addr) = parsed.from().and_then(|a| a.first()) else {
        return String::new();
    };
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) if !name.trim().is_empty() => {
            format!("{} <{}>", name.trim(), address)
        }
        (_, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

/// Readable text from the first text body; HTML bodies are stripped.
fn extract_text(parsed: &Message) -> String {
    if let Some(part) = parsed.text_bodies().next()
        && let Some(text) = part.text_contents()
    {
        let is_html = MimeHeaders::content_type(part)
            .and_then(|ct| ct.subtype())
            .is_some_and(|sub| sub.eq_ignore_ascii_case("html"));
        return if is_html {
            strip_html(text)
        } else {
            text.trim().to_string()
        };
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.trim().to_string();
        }
    }
    String::new()
}

/// Strip tags, drop `<style>`/`<script>` bodies, decode entities, collapse
/// whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len() / 2);
    let mut rest = html;

    while let Some(start) = rest.find('<') {
        result.push_str(&rest[..start]);
        let after = &rest[start..];
        let lower: String = after.chars().take(8).collect::<String>().to_ascii_lowercase();

        let skip_until = if lower.starts_with("<style") {
            Some("</style>")
        } else if lower.starts_with("<script") {
            Some("</script>")
        } else {
            None
        };

        if let Some(closing) = skip_until {
            match after.to_ascii_lowercase().find(closing) {
                Some(end) => rest = &after[end + closing.len()..],
                None => rest = "",
            }
            continue;
        }

        match after.find('>') {
            Some(end) => {
                result.push(' ');
                rest = &after[end + 1..];
            }
            None => rest = "",
        }
    }
    result.push_str(rest);

    let decoded = html_escape::decode_html_entities(&result);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}
