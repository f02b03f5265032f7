//! Layered structured-output parsing.
//!
//! Models rarely return clean JSON under adversarial latency. The parser
//! tries, in order: strict JSON, fenced-code-block JSON, largest balanced
//! JSON object, named-field key scan with escape handling, and finally a
//! `{chat_message: <full text>}` fallback that preserves the raw text so no
//! data is lost. The `structured_ok` flag records which path succeeded and
//! propagates into feedback and metrics.

use regex::Regex;
use serde_json::{Map, Value};

/// Result of parsing one model output.
#[derive(Debug, Clone)]
pub struct ParsedOutput {
    /// The recovered object. Never empty: the fallback layer always yields
    /// at least a `chat_message` field.
    pub value: Map<String, Value>,
    /// True when a structured layer (a–d) succeeded; false for the raw-text
    /// fallback.
    pub structured_ok: bool,
}

/// Parse a model output through the layered strategy.
pub fn parse_structured_output(raw: &str) -> ParsedOutput {
    let trimmed = raw.trim();

    // (a) strict JSON
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) {
        if !object.is_empty() {
            return ParsedOutput {
                value: object,
                structured_ok: true,
            };
        }
    }

    // (b) fenced code block JSON
    for block in fenced_blocks(trimmed) {
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(block.trim()) {
            if !object.is_empty() {
                return ParsedOutput {
                    value: object,
                    structured_ok: true,
                };
            }
        }
        if let Some(object) = extract_largest_json_object(&block) {
            return ParsedOutput {
                value: object,
                structured_ok: true,
            };
        }
    }

    // (c) largest balanced-brace object anywhere in the text
    if let Some(object) = extract_largest_json_object(trimmed) {
        return ParsedOutput {
            value: object,
            structured_ok: true,
        };
    }

    // (d) named string fields by key scan
    if let Some(object) = extract_fields_by_key_scan(trimmed) {
        return ParsedOutput {
            value: object,
            structured_ok: true,
        };
    }

    // (e) documented fallback: raw text preserved, structured_ok=false
    let mut value = Map::new();
    value.insert("chat_message".to_string(), Value::String(raw.to_string()));
    ParsedOutput {
        value,
        structured_ok: false,
    }
}

/// Contents of ```...``` fenced blocks (with or without a `json` tag).
fn fenced_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        // Skip a language tag up to the first newline.
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        match body.find("```") {
            Some(end) => {
                blocks.push(body[..end].to_string());
                rest = &body[end + 3..];
            }
            None => break,
        }
    }
    blocks
}

/// Extract the balanced `{...}` object starting at `start` (which must index
/// a `{`), honoring string literals and escapes.
fn extract_balanced_object(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    if start >= bytes.len() || bytes[start] != b'{' {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    for (offset, byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if *byte == b'\\' {
                escape = true;
            } else if *byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// The largest parseable JSON object anywhere in the text.
fn extract_largest_json_object(text: &str) -> Option<Map<String, Value>> {
    let mut best: Option<Map<String, Value>> = None;
    let mut best_len = 0usize;
    for (index, byte) in text.bytes().enumerate() {
        if byte != b'{' {
            continue;
        }
        let Some(candidate) = extract_balanced_object(text, index) else {
            continue;
        };
        if candidate.len() <= best_len {
            continue;
        }
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(candidate) {
            if !object.is_empty() {
                best_len = candidate.len();
                best = Some(object);
            }
        }
    }
    best
}

/// Known string fields recovered by the key-scan layer.
const SCANNED_KEYS: [&str; 5] = [
    "chat_message",
    "analysis",
    "conclusion",
    "root_cause",
    "summary",
];

/// Recover `"key": "value"` string fields from malformed JSON, with escape
/// handling. Succeeds if at least one known key is found; a bare
/// `confidence` number is recovered alongside.
fn extract_fields_by_key_scan(text: &str) -> Option<Map<String, Value>> {
    let mut out = Map::new();
    for key in SCANNED_KEYS {
        if let Some(value) = scan_string_field(text, key) {
            out.insert(key.to_string(), Value::String(value));
        }
    }
    if out.is_empty() {
        return None;
    }
    let confidence = extract_confidence_hint(text, -1.0);
    if confidence >= 0.0 {
        if let Some(number) = serde_json::Number::from_f64(confidence) {
            out.insert("confidence".to_string(), Value::Number(number));
        }
    }
    Some(out)
}

/// Scan for `"key" : "..."` and decode the string literal with escapes.
fn scan_string_field(text: &str, key: &str) -> Option<String> {
    let marker = format!("\"{key}\"");
    let mut search_from = 0usize;
    while let Some(relative) = text[search_from..].find(&marker) {
        let key_end = search_from + relative + marker.len();
        let rest = &text[key_end..];
        let after_colon = rest.trim_start();
        let Some(stripped) = after_colon.strip_prefix(':') else {
            search_from = key_end;
            continue;
        };
        let value_text = stripped.trim_start();
        if let Some(open) = value_text.strip_prefix('"') {
            let mut decoded = String::new();
            let mut escape = false;
            for ch in open.chars() {
                if escape {
                    match ch {
                        'n' => decoded.push('\n'),
                        't' => decoded.push('\t'),
                        'r' => decoded.push('\r'),
                        other => decoded.push(other),
                    }
                    escape = false;
                    continue;
                }
                match ch {
                    '\\' => escape = true,
                    '"' => return Some(decoded),
                    other => decoded.push(other),
                }
            }
        }
        search_from = key_end;
    }
    None
}

/// Recover the last `"confidence": <number>` occurrence, clamped to [0, 1].
/// Returns `fallback` when the text carries no hint.
pub fn extract_confidence_hint(text: &str, fallback: f64) -> f64 {
    let Ok(pattern) = Regex::new(r#""confidence"\s*:\s*(-?\d+(?:\.\d+)?)"#) else {
        return fallback;
    };
    let mut last: Option<f64> = None;
    for capture in pattern.captures_iter(text) {
        if let Ok(value) = capture[1].parse::<f64>() {
            last = Some(value);
        }
    }
    match last {
        Some(value) => value.clamp(0.0, 1.0),
        None => fallback,
    }
}

/// Recover a judge payload: prefer a top-level object carrying
/// `final_judgment`, then a nested `final_judgment` object by key, then a
/// generic parse promoted to a judgment if it carries judgment-shaped keys.
pub fn parse_judge_payload(raw: &str) -> Map<String, Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Map::new();
    }

    // Top-level object containing the key.
    if let Some(object) = extract_top_level_with_key(trimmed, "final_judgment") {
        return object;
    }

    // Nested object found by key scan.
    if let Some(inner) = extract_object_by_named_key(trimmed, "final_judgment") {
        let confidence = inner
            .get("root_cause")
            .and_then(|rc| rc.get("confidence"))
            .and_then(Value::as_f64)
            .unwrap_or(0.5);
        let mut out = Map::new();
        out.insert("final_judgment".to_string(), Value::Object(inner));
        if let Some(number) =
            serde_json::Number::from_f64(extract_confidence_hint(trimmed, confidence))
        {
            out.insert("confidence".to_string(), Value::Number(number));
        }
        return out;
    }

    let parsed = parse_structured_output(trimmed);
    if !parsed.structured_ok {
        return parsed.value;
    }
    if parsed.value.contains_key("final_judgment") {
        return parsed.value;
    }
    // Judgment-shaped generic object: promote it.
    if ["root_cause", "evidence_chain", "fix_recommendation"]
        .iter()
        .any(|key| parsed.value.contains_key(*key))
    {
        let mut out = Map::new();
        out.insert(
            "final_judgment".to_string(),
            Value::Object(parsed.value.clone()),
        );
        if let Some(number) =
            serde_json::Number::from_f64(extract_confidence_hint(trimmed, 0.5))
        {
            out.insert("confidence".to_string(), Value::Number(number));
        }
        return out;
    }
    parsed.value
}

/// Largest top-level balanced object whose parse contains `required_key`.
fn extract_top_level_with_key(text: &str, required_key: &str) -> Option<Map<String, Value>> {
    let marker = format!("\"{required_key}\"");
    let mut best: Option<Map<String, Value>> = None;
    let mut best_len = 0usize;
    for (index, byte) in text.bytes().enumerate() {
        if byte != b'{' {
            continue;
        }
        let Some(candidate) = extract_balanced_object(text, index) else {
            continue;
        };
        if !candidate.contains(&marker) || candidate.len() <= best_len {
            continue;
        }
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(candidate) {
            if object.contains_key(required_key) {
                best_len = candidate.len();
                best = Some(object);
            }
        }
    }
    best
}

/// Find `"key_name": { ... }` and parse the object value.
fn extract_object_by_named_key(text: &str, key_name: &str) -> Option<Map<String, Value>> {
    let marker = format!("\"{key_name}\"");
    let mut search_from = 0usize;
    while let Some(relative) = text[search_from..].find(&marker) {
        let key_index = search_from + relative;
        let after_key = key_index + marker.len();
        let Some(colon_offset) = text[after_key..].find(':') else {
            return None;
        };
        let Some(brace_offset) = text[after_key + colon_offset..].find('{') else {
            return None;
        };
        let brace_index = after_key + colon_offset + brace_offset;
        search_from = after_key;
        let Some(candidate) = extract_balanced_object(text, brace_index) else {
            continue;
        };
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(candidate) {
            return Some(object);
        }
    }
    None
}
