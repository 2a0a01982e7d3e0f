//! Strict parsing of free-form model output.
//!
//! Whatever text comes back is converted into a tagged `Parsed<T>`; each
//! stage decides its own fallback for `Unparseable`.

use serde::de::DeserializeOwned;

/// Outcome of parsing a model response.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<T> {
    Parsed(T),
    Unparseable(String),
}

impl<T> Parsed<T> {
    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Self::Parsed(value) => Some(value),
            Self::Unparseable(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Parsed<U> {
        match self {
            Self::Parsed(value) => Parsed::Parsed(f(value)),
            Self::Unparseable(reason) => Parsed::Unparseable(reason),
        }
    }
}

impl<T, E: std::fmt::Display> From<Result<T, E>> for Parsed<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Parsed(value),
            Err(e) => Self::Unparseable(e.to_string()),
        }
    }
}

/// Deserialize the first JSON object found in `raw`.
pub fn parse_json_object<T: DeserializeOwned>(raw: &str) -> Parsed<T> {
    serde_json::from_str::<T>(&extract_json(raw, '{', '}')).into()
}

/// Deserialize the first JSON array found in `raw`.
pub fn parse_json_array<T: DeserializeOwned>(raw: &str) -> Parsed<T> {
    serde_json::from_str::<T>(&extract_json(raw, '[', ']')).into()
}

/// Extract a JSON value from LLM output (handles markdown wrapping).
fn extract_json(text: &str, open: char, close: char) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with(open) {
        return trimmed.to_string();
    }

    // Wrapped in markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with(open) {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
