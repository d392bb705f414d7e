use scraper::{Html, Selector};
use regex::Regex;
use once_cell::sync::Lazy;

use crate::session::AccountSnapshot;

static SCRIPT_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("script").expect("Failed to parse script selector"));
static ACCOUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"window\.JexactylUser\s*=\s*(\{[^}]+\})")
        .expect("Failed to compile account regex")
});

#[derive(Debug)]
pub enum ParseError {
    AccountObjectNotFound,
    InvalidAccountJson(serde_json::Error),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::AccountObjectNotFound => write!(f, "Embedded account object not found in HTML"),
            ParseError::InvalidAccountJson(e) => write!(f, "Embedded account object is not valid JSON: {}", e),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::AccountObjectNotFound => None,
            ParseError::InvalidAccountJson(e) => Some(e),
        }
    }
}

/// Extracts the account snapshot the panel embeds as `window.JexactylUser = {...}`.
///
/// Inline `<script>` bodies are searched first; if none of them carries the
/// marker the raw markup is scanned, so fragments without a script wrapper
/// still resolve. Only a single-level object is matched.
pub fn extract_account_snapshot(html_content: &str) -> Result<AccountSnapshot, ParseError> {
    let json = find_account_object(html_content).ok_or(ParseError::AccountObjectNotFound)?;
    serde_json::from_str(&json).map_err(ParseError::InvalidAccountJson)
}

fn find_account_object(html_content: &str) -> Option<String> {
    let document = Html::parse_document(html_content);
    for script_element in document.select(&SCRIPT_SELECTOR) {
        let script_text: String = script_element.text().collect();
        if let Some(captures) = ACCOUNT_RE.captures(&script_text) {
            return captures.get(1).map(|m| m.as_str().to_string());
        }
    }

    ACCOUNT_RE
        .captures(html_content)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}
