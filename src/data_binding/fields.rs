//! Field processing: suppression, sanitization, truncation, link detection
//! and icon inference over raw JSON fields.
//!
//! Everything here is a pure function of its input and never fails.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use unicode_segmentation::UnicodeSegmentation;

use super::display::{Field, FieldKind, Icon};

/// Longest text value shown before truncation, in characters.
pub const MAX_TEXT_CHARS: usize = 200;

/// Appended to truncated values.
pub const TRUNCATION_MARKER: &str = "...";

const NOISE_KEYS: &[&str] = &["id", "node_id", "sha", "etag", "gravatar_id", "timestamp"];

const WEB_SCHEMES: &[&str] = &["http://", "https://"];

/// Schemes accepted when the key names the field a link.
const LINK_SCHEMES: &[&str] = &["http://", "https://", "ftp://", "mailto:"];

const LINK_KEY_SUFFIXES: &[&str] = &["url", "link", "href", "uri"];

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".bmp", ".ico"];

/// Members used to summarize a nested object, in order.
const SUMMARY_KEYS: &[&str] = &["login", "name", "title"];

/// Counters typical of repository objects.
const REPOSITORY_COUNTERS: &[&str] = &[
    "stargazers_count",
    "forks_count",
    "full_name",
    "watchers_count",
    "open_issues_count",
];

fn tag_pattern() -> &'static Regex {
    static PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?s)<!--.*?-->|</?[a-zA-Z][^<>]*>").expect("Valid markup tag regex")
    });
    &PATTERN
}

fn entity_pattern() -> &'static Regex {
    static PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});")
            .expect("Valid character entity regex")
    });
    &PATTERN
}

fn whitespace_pattern() -> &'static Regex {
    static PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("Valid whitespace regex"));
    &PATTERN
}

// ─── Suppression ─────────────────────────────────────────────────────────────

/// Whether a field is noise: identifiers, timestamps and boolean flags.
pub fn is_suppressed(key: &str, value: &Value) -> bool {
    if value.is_boolean() {
        return true;
    }

    let key = key.to_ascii_lowercase();
    NOISE_KEYS.contains(&key.as_str())
        || key.ends_with("_id")
        || key.ends_with("_at")
        || key.starts_with("is_")
        || key.starts_with("has_")
}

// ─── Text ────────────────────────────────────────────────────────────────────

/// Strip markup and decode character references.
///
/// Whitespace is collapsed only when markup was present.
pub fn sanitize_text(raw: &str) -> String {
    let had_markup = tag_pattern().is_match(raw);
    let stripped = if had_markup {
        tag_pattern().replace_all(raw, "")
    } else {
        raw.into()
    };

    let decoded = entity_pattern().replace_all(&stripped, |caps: &Captures<'_>| {
        decode_entity(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    });

    if had_markup {
        whitespace_pattern()
            .replace_all(&decoded, " ")
            .trim()
            .to_string()
    } else {
        decoded.into_owned()
    }
}

fn decode_entity(body: &str) -> Option<String> {
    if let Some(numeric) = body.strip_prefix('#') {
        let code = match numeric.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => numeric.parse::<u32>().ok()?,
        };
        return char::from_u32(code).map(String::from);
    }

    let decoded = match body {
        "amp" => "&",
        "lt" => "<",
        "gt" => ">",
        "quot" => "\"",
        "apos" => "'",
        "nbsp" => " ",
        "hellip" => "\u{2026}",
        "mdash" => "\u{2014}",
        "ndash" => "\u{2013}",
        "copy" => "\u{00A9}",
        _ => return None,
    };
    Some(decoded.to_string())
}

/// Cut `text` to `max_chars` user-visible characters, appending the marker
/// when cut.
///
/// Counts grapheme clusters, so flags, emoji sequences and combining marks
/// are never split.
pub fn truncate(text: &str, max_chars: usize) -> (String, bool) {
    match text.grapheme_indices(true).nth(max_chars) {
        Some((cut, _)) => (format!("{}{TRUNCATION_MARKER}", &text[..cut]), true),
        None => (text.to_string(), false),
    }
}

/// Title-case a snake, kebab or camel case key (`stargazers_count` → `Stargazers Count`).
pub fn format_label(key: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for ch in key.chars() {
        if ch == '_' || ch == '-' || ch.is_whitespace() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.push(ch);
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
        .iter()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// `1234567` → `1,234,567`.
fn group_thousands(digits: &str) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn format_number(number: &serde_json::Number) -> String {
    let integer = number
        .as_u64()
        .map(|n| (false, n))
        .or_else(|| number.as_i64().map(|n| (n < 0, n.unsigned_abs())));

    match integer {
        Some((negative, magnitude)) if magnitude >= 1000 => {
            let grouped = group_thousands(&magnitude.to_string());
            if negative {
                format!("-{grouped}")
            } else {
                grouped
            }
        }
        _ => number.to_string(),
    }
}

/// Render a raw value as display text. `None` for null and blank strings.
pub fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(format_number(number)),
        Value::String(text) if text.trim().is_empty() => None,
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => Some(format!("[{} items]", items.len())),
        Value::Object(map) => {
            let summary = SUMMARY_KEYS
                .iter()
                .filter_map(|key| map.get(*key))
                .find_map(|member| match member {
                    Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
                    Value::Number(number) => Some(number.to_string()),
                    _ => None,
                });
            Some(summary.unwrap_or_else(|| value.to_string()))
        }
    }
}

// ─── Links ───────────────────────────────────────────────────────────────────

/// Whether a string field is a hyperlink.
///
/// Absolute web URLs always qualify. A key hint (`*url`, `*link`, `*href`,
/// `*uri`) additionally admits other safe schemes and site-relative paths.
pub fn is_link(key: &str, value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() || value.contains(char::is_whitespace) {
        return false;
    }
    if starts_with_scheme(value, WEB_SCHEMES) {
        return true;
    }

    let key = key.to_ascii_lowercase();
    let hinted = LINK_KEY_SUFFIXES.iter().any(|suffix| key.ends_with(suffix));
    hinted
        && (starts_with_scheme(value, LINK_SCHEMES)
            || (value.starts_with('/') && !value.starts_with("//")))
}

fn starts_with_scheme(value: &str, schemes: &[&str]) -> bool {
    schemes.iter().any(|scheme| {
        value
            .get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
    })
}

fn link_kind(url: &str) -> FieldKind {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .to_ascii_lowercase();
    if IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        FieldKind::Image
    } else {
        FieldKind::Link
    }
}

// ─── Fields ──────────────────────────────────────────────────────────────────

/// Clean one field for display. `None` when it is suppressed or empty.
///
/// Links keep their full value so they stay actionable.
pub fn process_field(key: &str, value: &Value) -> Option<Field> {
    if is_suppressed(key, value) {
        return None;
    }

    let rendered = render_value(value)?;
    let label = format_label(key);

    if value.is_string() && is_link(key, &rendered) {
        let url = rendered.trim().to_string();
        return Some(Field {
            key: key.to_string(),
            label,
            kind: link_kind(&url),
            value: url,
            truncated: false,
        });
    }

    let cleaned = sanitize_text(&rendered);
    if cleaned.trim().is_empty() {
        return None;
    }
    let (text, truncated) = truncate(&cleaned, MAX_TEXT_CHARS);

    Some(Field {
        key: key.to_string(),
        label,
        value: text,
        kind: FieldKind::Text,
        truncated,
    })
}

/// Every surviving field of an object, in object order.
pub fn surviving_fields(object: &Map<String, Value>) -> Vec<Field> {
    object
        .iter()
        .filter_map(|(key, value)| process_field(key, value))
        .collect()
}

// ─── Icons ───────────────────────────────────────────────────────────────────

/// Pick an icon from an object's keys and values. Falls back to `Generic`.
pub fn infer_icon(object: &Map<String, Value>) -> Icon {
    let keys: Vec<String> = object.keys().map(|k| k.to_ascii_lowercase()).collect();
    let has_any = |candidates: &[&str]| keys.iter().any(|k| candidates.contains(&k.as_str()));

    let repository_counters = keys
        .iter()
        .filter(|k| REPOSITORY_COUNTERS.contains(&k.as_str()))
        .count();
    let github_value = object
        .values()
        .filter_map(Value::as_str)
        .any(|v| v.starts_with("https://github.com/"));

    if has_any(&["repo", "repository", "github"]) || repository_counters >= 2 || github_value {
        Icon::Package
    } else if has_any(&["search", "query", "results", "hits"]) {
        Icon::Search
    } else if has_any(&["file", "document", "path", "filename"]) {
        Icon::File
    } else if has_any(&["user", "author", "owner", "login"]) {
        Icon::User
    } else if has_any(&["error", "exception"]) {
        Icon::Warning
    } else {
        Icon::Generic
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
