//! Slugs for renaming a thread from free text.
//!
//! The naive strategy works offline from the words of the text; model
//! responses go through `parse_slug_response` before they are trusted.

const MIN_SLUG_LEN: usize = 2;
const MAX_SLUG_LEN: usize = 50;
const MAX_SEGMENTS: usize = 5;
const NAIVE_WORDS: usize = 3;

/// Result of parsing a `SLUG: …` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSlug {
    Slug(String),
    /// The text is a question rather than a task; do not rename.
    Empty,
    Invalid,
}

/// Naive candidates: the first 1–3 words joined by hyphens, longest first,
/// then numbered variants of the longest.
pub fn naive_slug_candidates(text: &str) -> Vec<String> {
    if is_bootstrap_prompt(text) {
        return Vec::new();
    }
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut out: Vec<String> = Vec::new();
    for n in (1..=NAIVE_WORDS.min(words.len())).rev() {
        let slug = words[..n].join("-");
        if is_valid_slug(&slug) && !out.contains(&slug) {
            out.push(slug);
        }
    }
    if let Some(longest) = out.first().cloned() {
        for n in 2..=4 {
            let numbered = format!("{longest}-{n}");
            if is_valid_slug(&numbered) {
                out.push(numbered);
            }
        }
    }
    out
}

/// Normalize arbitrary text into `[a-z0-9-]`, collapsing hyphen runs.
pub fn sanitize_slug(raw: &str) -> Option<String> {
    let mut slug = String::with_capacity(raw.len());
    for c in raw
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '`'))
        .flat_map(char::to_lowercase)
    {
        let c = if c.is_ascii_alphanumeric() || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(c);
    }
    let slug = slug.trim_matches('-').to_string();
    is_valid_slug(&slug).then_some(slug)
}

pub fn is_valid_slug(slug: &str) -> bool {
    (MIN_SLUG_LEN..=MAX_SLUG_LEN).contains(&slug.len())
        && slug.chars().any(|c| c.is_ascii_alphabetic())
        && slug.split('-').count() <= MAX_SEGMENTS
}

/// Parse a model response. The `SLUG:` marker is required; the slug is the
/// rest of the marker's line (or the next non-blank line).
pub fn parse_slug_response(response: &str) -> ParsedSlug {
    let Some(at) = response.find("SLUG:") else {
        return ParsedSlug::Invalid;
    };
    let after = &response[at + "SLUG:".len()..];
    let Some(line) = after.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return ParsedSlug::Invalid;
    };
    let unquoted = line.trim_matches(|c| matches!(c, '"' | '\'' | '`'));
    if unquoted.eq_ignore_ascii_case("EMPTY") {
        return ParsedSlug::Empty;
    }
    match sanitize_slug(line) {
        Some(slug) => ParsedSlug::Slug(slug),
        None => ParsedSlug::Invalid,
    }
}

/// Prompts injected by tooling rather than typed by the user.
pub fn is_bootstrap_prompt(message: &str) -> bool {
    message.contains("<environment_context>")
        || message.contains("<permissions instructions>")
        || message.contains("AGENTS.md instructions for")
        || message.contains("<system-reminder>")
}
