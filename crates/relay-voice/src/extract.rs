//! Best-effort caller detail extraction from finalized utterances.
//!
//! Runs only while a conversation's registration is incomplete. Misses are
//! expected; a wrong match is worse than none, so the patterns are narrow.

use regex::Regex;
use relay_types::Registration;
use std::sync::LazyLock;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:my name is|my name's|name is|this is|call me|i am|i'm)\s+([a-z][a-z'\-]+(?:\s+[a-z][a-z'\-]+)?)",
    )
    .expect("name pattern is valid")
});

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+?\d[\d\s().\-]{7,}\d").expect("phone pattern is valid"));

/// Words that follow "I'm"/"this is" without being a name.
const NOT_A_NAME: &[&str] = &[
    "a", "an", "the", "calling", "looking", "interested", "just", "not", "here", "fine", "good",
    "okay", "ok", "great", "well", "sorry", "trying", "wondering", "from", "with", "at", "in",
    "on", "about", "still", "going", "having", "very", "so", "really", "actually", "sure", "yes",
    "no", "it", "that", "me", "your", "my", "available", "busy", "ready", "done", "back", "and",
    "or", "but",
];

const MIN_PHONE_DIGITS: usize = 10;
const MAX_PHONE_DIGITS: usize = 15;

/// Finds a self-introduced caller name, title-cased.
pub fn extract_name(text: &str) -> Option<String> {
    for caps in NAME_RE.captures_iter(text) {
        let Some(candidate) = caps.get(1) else {
            continue;
        };

        let mut words = Vec::new();
        for word in candidate.as_str().split_whitespace() {
            if NOT_A_NAME.contains(&word.to_ascii_lowercase().as_str()) {
                break;
            }
            words.push(title_case(word));
        }

        if !words.is_empty() {
            return Some(words.join(" "));
        }
    }
    None
}

/// Finds a phone number and normalizes it to digits, keeping a leading `+`.
pub fn extract_phone(text: &str) -> Option<String> {
    PHONE_RE.find_iter(text).find_map(|m| {
        let raw = m.as_str();
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
            return None;
        }
        if raw.starts_with('+') {
            Some(format!("+{digits}"))
        } else {
            Some(digits)
        }
    })
}

/// Runs every extractor over one utterance.
pub fn extract_registration(text: &str) -> Registration {
    Registration {
        caller_name: extract_name(text),
        caller_phone: extract_phone(text),
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
