//! Keyword-based priority for tickets opened from mail.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use std::sync::OnceLock;

use super::types::Priority;

/// Keywords with the priority they raise a ticket to. Urgent keywords win
/// over high ones regardless of where they appear.
const KEYWORDS: &[(&str, Priority)] = &[
    ("urgente", Priority::Urgent),
    ("crítico", Priority::Urgent),
    ("critico", Priority::Urgent),
    ("importante", Priority::High),
    ("problema", Priority::High),
];

static MATCHER: OnceLock<Option<AhoCorasick>> = OnceLock::new();

fn matcher() -> Option<&'static AhoCorasick> {
    MATCHER
        .get_or_init(|| {
            AhoCorasickBuilder::new()
                .ascii_case_insensitive(true)
                .build(KEYWORDS.iter().map(|(word, _)| word))
                .ok()
        })
        .as_ref()
}

/// Classify a mail by scanning its subject and body.
pub fn classify_priority(subject: &str, body: &str) -> Priority {
    let Some(ac) = matcher() else {
        return Priority::Medium;
    };

    // Lowercase first so accented capitals ("CRÍTICO") match too
    let haystack = format!("{} {}", subject, body).to_lowercase();

    ac.find_overlapping_iter(&haystack)
        .map(|m| KEYWORDS[m.pattern().as_usize()].1)
        .max()
        .unwrap_or(Priority::Medium)
}
