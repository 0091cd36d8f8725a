//! Answer matching and hints for quiz questions.
//!
//! Matching is deliberately lenient: answers are normalized (case,
//! punctuation, quotes, parenthesised notes) and then compared by equality,
//! containment, or keyword overlap. Numbered multi-part answers
//! (`1. ... 2. ...`) are compared part by part.

use std::sync::OnceLock;

use regex::Regex;

/// Share of the expected keywords a single-part answer must contain.
const KEYWORD_THRESHOLD: f64 = 0.7;

/// Expected answers shorter than this may be satisfied by an alternative
/// spelled out in the question's comment.
const COMMENT_ALTERNATIVE_MAX_CHARS: usize = 15;

/// Phrases in a question comment that mark other answers as acceptable.
const ACCEPTANCE_MARKERS: &[&str] = &[
    "также принимается",
    "засчитывать",
    "принимать",
    "зачет",
    "зачёт",
    "зачитывать",
    "эквивалент",
    "also accepted",
    "accept",
    "equivalent",
];

fn parenthesised() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(.+?\)|\[.+?\]").expect("valid regex"))
}

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid regex"))
}

fn part_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d\.").expect("valid regex"))
}

fn is_quote(c: char) -> bool {
    matches!(c, '"' | '«' | '»' | '„' | '“' | '”')
}

/// Lowercases, drops `(...)`/`[...]` notes, quotes and punctuation, and
/// collapses whitespace.
pub fn normalize(text: &str) -> String {
    let lower = text.to_lowercase();
    let stripped = parenthesised().replace_all(&lower, "");
    let cleaned: String = stripped
        .chars()
        .filter(|&c| !is_quote(c) && !matches!(c, '.' | ',' | ';' | ':' | '!' | '?'))
        .collect();
    whitespace().replace_all(&cleaned, " ").trim().to_string()
}

fn is_multipart(text: &str) -> bool {
    text.contains("1.") && text.contains("2.")
}

fn split_parts(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut parts: Vec<String> = part_marker().split(&lower).map(str::to_string).collect();
    if parts.first().is_some_and(|p| p.trim().is_empty()) {
        parts.remove(0);
    }
    parts
}

fn loosely_equal(given: &str, expected: &str) -> bool {
    !given.is_empty()
        && (given == expected || expected.contains(given) || given.contains(expected))
}

/// Whether `given` should be accepted for a question whose answer is
/// `expected`. `comment` is the question's free-form commentary.
pub fn is_correct(given: &str, expected: &str, comment: Option<&str>) -> bool {
    let given = given.trim();
    if given.is_empty() {
        return false;
    }

    if is_multipart(expected) {
        if given.to_lowercase() == expected.to_lowercase() {
            return true;
        }
        if !is_multipart(given) {
            return false;
        }
        let expected_parts = split_parts(expected);
        let given_parts = split_parts(given);
        return !expected_parts.is_empty()
            && expected_parts.len() == given_parts.len()
            && expected_parts
                .iter()
                .zip(&given_parts)
                .all(|(e, g)| loosely_equal(&normalize(g), &normalize(e)));
    }

    let clean_expected = normalize(expected);
    let clean_given = normalize(given);

    if loosely_equal(&clean_given, &clean_expected)
        || given.to_lowercase() == expected.trim().to_lowercase()
        || keyword_overlap(&clean_given, &clean_expected) >= KEYWORD_THRESHOLD
    {
        return true;
    }

    clean_expected.chars().count() < COMMENT_ALTERNATIVE_MAX_CHARS
        && comment.is_some_and(|c| accepted_by_comment(&clean_given, c))
}

/// Fraction of the expected keywords present in `given`. Only meaningful
/// for multi-word answers; single-word answers score 0.
fn keyword_overlap(given: &str, expected: &str) -> f64 {
    use std::collections::HashSet;

    let expected: HashSet<&str> = expected.split_whitespace().collect();
    let given: HashSet<&str> = given.split_whitespace().collect();
    if expected.len() <= 1 || given.is_empty() {
        return 0.0;
    }
    expected.intersection(&given).count() as f64 / expected.len() as f64
}

fn accepted_by_comment(clean_given: &str, comment: &str) -> bool {
    let comment = comment.to_lowercase();
    !clean_given.is_empty()
        && comment.contains(clean_given)
        && ACCEPTANCE_MARKERS.iter().any(|m| comment.contains(m))
}

/// A hint that reveals the shape of the answer without giving it away.
pub fn hint(answer: &str) -> String {
    let stripped = parenthesised().replace_all(answer, "");
    let unquoted: String = stripped.chars().filter(|&c| !is_quote(c)).collect();
    let mut clean = whitespace().replace_all(&unquoted, " ").trim().to_string();
    if clean.is_empty() {
        clean = answer.trim().to_string();
    }

    let words: Vec<&str> = clean.split_whitespace().collect();
    match words.as_slice() {
        [] => "No hint available.".to_string(),
        [word] => {
            let len = word.chars().count();
            if len <= 3 {
                return format!("The answer is a short word of {len} letters");
            }
            let first: String = word.chars().take(1).flat_map(char::to_uppercase).collect();
            format!("The answer is a {len}-letter word starting with '{first}'")
        }
        many => {
            let letters: usize = many.iter().map(|w| w.chars().count()).sum();
            format!("The answer has {} words ({letters} letters)", many.len())
        }
    }
}
