//! Parsing for the upstream response bytes.
//!
//! The generateAssistantResponse body is an AWS EventStream: binary frame
//! headers wrapping small JSON payloads. Rather than decode the framing, the
//! parser scans for known JSON payload signatures and extracts each object
//! by brace-counted span, which survives arbitrary chunk boundaries.
//!
//! Also here: recovery of `[Called <name> with args: {…}]` tool calls that
//! some upstream responses embed as plain text.

use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::warn;

/// Typed event from the upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub enum KiroEvent {
    TextDelta(String),
    ToolUseStart { name: String, tool_use_id: String },
    ToolInputDelta(String),
    ToolUseStop,
}

/// JSON payload signatures that appear in the event stream. Anything else in
/// the byte soup is framing garbage.
const PATTERNS: &[&str] = &[
    "{\"content\":",
    "{\"name\":",
    "{\"input\":",
    "{\"stop\":",
    "{\"followupPrompt\":",
];

/// Find the closing `}` for the `{` at `start`, tracking strings and escapes.
/// Returns `None` when the span is incomplete.
fn find_matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    if start >= bytes.len() || bytes[start] != b'{' {
        return None;
    }

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (offset, &ch) in bytes[start..].iter().enumerate() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            b'\\' if in_string => escape_next = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Same rules over square brackets.
fn find_matching_bracket(bytes: &[u8], start: usize) -> Option<usize> {
    if start >= bytes.len() || bytes[start] != b'[' {
        return None;
    }

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (offset, &ch) in bytes[start..].iter().enumerate() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            b'\\' if in_string => escape_next = true,
            b'"' => in_string = !in_string,
            b'[' if !in_string => depth += 1,
            b']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn classify(val: &Value) -> Option<KiroEvent> {
    // followupPrompt payloads are never surfaced, including ones that also
    // carry a content field.
    if val.get("followupPrompt").is_some() {
        return None;
    }

    if val.get("stop").is_some() {
        return Some(KiroEvent::ToolUseStop);
    }

    // A payload with name + toolUseId opens a tool use, even when it also
    // carries an (empty) input field.
    if let (Some(name), Some(tool_use_id)) = (
        val.get("name").and_then(|v| v.as_str()),
        val.get("toolUseId").and_then(|v| v.as_str()),
    ) {
        return Some(KiroEvent::ToolUseStart {
            name: name.to_string(),
            tool_use_id: tool_use_id.to_string(),
        });
    }

    if let Some(input) = val.get("input").and_then(|v| v.as_str()) {
        return Some(KiroEvent::ToolInputDelta(input.to_string()));
    }

    if let Some(content) = val.get("content").and_then(|v| v.as_str()) {
        return Some(KiroEvent::TextDelta(content.to_string()));
    }

    None
}

/// Build a valid-UTF-8 view of `buffer` with a map from each clean byte back
/// to its original position. Equivalent to a lossy decode that drops invalid
/// bytes, which is what the EventStream frame headers look like to us.
fn clean_utf8_view(buffer: &[u8]) -> (String, Vec<usize>) {
    let mut clean = String::with_capacity(buffer.len());
    let mut byte_map: Vec<usize> = Vec::with_capacity(buffer.len());

    let mut i = 0;
    while i < buffer.len() {
        let remaining = &buffer[i..];
        match std::str::from_utf8(remaining) {
            Ok(valid) => {
                for _ in 0..valid.len() {
                    byte_map.push(i);
                    i += 1;
                }
                clean.push_str(valid);
                break;
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                if valid_up_to > 0 {
                    let valid_str = std::str::from_utf8(&remaining[..valid_up_to]).unwrap();
                    for _ in 0..valid_up_to {
                        byte_map.push(i);
                        i += 1;
                    }
                    clean.push_str(valid_str);
                }
                match e.error_len() {
                    Some(len) => i += len,
                    None => break, // truncated sequence at buffer end
                }
            }
        }
    }

    (clean, byte_map)
}

fn earliest_pattern(clean: &str, from: usize) -> Option<usize> {
    let mut earliest: Option<usize> = None;
    for pattern in PATTERNS {
        if let Some(pos) = clean[from..].find(pattern) {
            let abs = from + pos;
            if earliest.map_or(true, |e| abs < e) {
                earliest = Some(abs);
            }
        }
    }
    earliest
}

/// Longest suffix of `clean[from..]` that is a prefix of some signature —
/// bytes that might become a signature once the next chunk arrives.
fn partial_pattern_suffix_len(clean: &str, from: usize) -> usize {
    let tail = &clean.as_bytes()[from..];
    let mut longest = 0;
    for pattern in PATTERNS {
        let pat = pattern.as_bytes();
        let max = pat.len().min(tail.len());
        for len in (longest + 1)..=max {
            if tail[tail.len() - len..] == pat[..len] {
                longest = len;
            }
        }
    }
    longest
}

/// Scan `buffer` for complete JSON payloads and return the events whose
/// closing brace lies within it, plus the number of bytes the caller should
/// drain. An incomplete span is retained from its `{` onward; tails that
/// cannot be the start of a signature are discarded.
pub fn parse_events_from_buffer(buffer: &[u8]) -> (Vec<KiroEvent>, usize) {
    let (clean, byte_map) = clean_utf8_view(buffer);

    // Original position of clean byte index `idx` (inclusive bound).
    let original_start = |idx: usize| -> usize {
        if idx < byte_map.len() {
            byte_map[idx]
        } else {
            buffer.len()
        }
    };

    let mut events = Vec::new();
    let mut search_pos = 0usize;
    let consumed;

    loop {
        match earliest_pattern(&clean, search_pos) {
            Some(json_start) => {
                match find_matching_brace(clean.as_bytes(), json_start) {
                    Some(json_end) => {
                        let json_str = &clean[json_start..=json_end];
                        match serde_json::from_str::<Value>(json_str) {
                            Ok(val) => {
                                if let Some(event) = classify(&val) {
                                    events.push(event);
                                }
                            }
                            Err(e) => {
                                warn!("Unparseable event payload ({}): {}", e, json_str);
                            }
                        }
                        search_pos = json_end + 1;
                    }
                    None => {
                        // Incomplete span: keep everything from the `{`.
                        consumed = original_start(json_start);
                        break;
                    }
                }
            }
            None => {
                // No signature ahead; drop the tail except a possible
                // signature prefix split across chunks. Signatures start
                // with ASCII `{`, so bytes past the kept prefix can never
                // begin one.
                let keep = partial_pattern_suffix_len(&clean, search_pos);
                consumed = if keep == 0 {
                    buffer.len()
                } else {
                    original_start(clean.len() - keep)
                };
                break;
            }
        }
    }

    (events, consumed.min(buffer.len()))
}

// ===== Bracket tool-call recovery =====

/// A tool call recovered from `[Called <name> with args: {…}]` text.
#[derive(Debug, Clone)]
pub struct RecoveredToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

fn bracket_head_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\[Called\s+(\w+)\s+with\s+args:\s*").unwrap())
}

/// Repair passes for loose JSON in bracket tool calls: strip trailing commas,
/// quote unquoted keys, quote bareword values. Numbers, `true`, `false`, and
/// `null` are left alone.
pub fn repair_loose_json(input: &str) -> String {
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
    static UNQUOTED_KEY: OnceLock<Regex> = OnceLock::new();
    static BAREWORD_VALUE: OnceLock<Regex> = OnceLock::new();

    let trailing_comma =
        TRAILING_COMMA.get_or_init(|| Regex::new(r",\s*([}\]])").unwrap());
    let unquoted_key = UNQUOTED_KEY
        .get_or_init(|| Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:").unwrap());
    let bareword_value = BAREWORD_VALUE
        .get_or_init(|| Regex::new(r":\s*([A-Za-z_][A-Za-z0-9_\-]*)(\s*[,}\]])").unwrap());

    let step1 = trailing_comma.replace_all(input, "$1");
    let step2 = unquoted_key.replace_all(&step1, "$1\"$2\":");
    let step3 = bareword_value.replace_all(&step2, |caps: &regex::Captures| {
        let word = &caps[1];
        if matches!(word, "true" | "false" | "null") {
            format!(": {}{}", word, &caps[2])
        } else {
            format!(": \"{}\"{}", word, &caps[2])
        }
    });
    step3.into_owned()
}

fn parse_args(raw: &str) -> Option<Value> {
    if let Ok(val) = serde_json::from_str::<Value>(raw) {
        return Some(val);
    }
    let repaired = repair_loose_json(raw);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("Dropping unrepairable bracket tool call args ({}): {}", e, raw);
            None
        }
    }
}

/// Deduplicate by `(name, serialized arguments)`, first occurrence wins.
pub fn deduplicate_tool_calls(calls: Vec<RecoveredToolCall>) -> Vec<RecoveredToolCall> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for call in calls {
        let key = format!(
            "{}-{}",
            call.name,
            serde_json::to_string(&call.arguments).unwrap_or_default()
        );
        if seen.insert(key) {
            unique.push(call);
        }
    }
    unique
}

/// Scan `text` for bracket tool calls. Returns the text with matched spans
/// removed (whitespace runs collapsed) and the recovered, deduplicated calls.
pub fn recover_bracket_tool_calls(text: &str) -> (String, Vec<RecoveredToolCall>) {
    if !text.contains("[Called") {
        return (text.to_string(), Vec::new());
    }

    let bytes = text.as_bytes();
    let mut calls = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new(); // inclusive..exclusive byte ranges

    let occurrences: Vec<usize> = text.match_indices("[Called").map(|(i, _)| i).collect();

    for (idx, &start) in occurrences.iter().enumerate() {
        let segment_end = occurrences.get(idx + 1).copied().unwrap_or(text.len());

        let close = match find_matching_bracket(&bytes[..segment_end], start) {
            Some(pos) => pos,
            None => continue,
        };
        let span = &text[start..=close];

        let caps = match bracket_head_regex().captures(span) {
            Some(c) => c,
            None => continue,
        };
        let name = caps.get(1).unwrap().as_str().to_string();
        let args_start = caps.get(0).unwrap().end();
        // Between "with args:" and the final `]`.
        let args_raw = span[args_start..span.len() - 1].trim();

        if let Some(arguments) = parse_args(args_raw) {
            let id = format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
            calls.push(RecoveredToolCall {
                id,
                name,
                arguments,
            });
            spans.push((start, close + 1));
        }
    }

    if spans.is_empty() {
        return (text.to_string(), Vec::new());
    }

    let mut cleaned = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end) in &spans {
        cleaned.push_str(&text[cursor..*start]);
        cursor = *end;
    }
    cleaned.push_str(&text[cursor..]);

    static WS_RUN: OnceLock<Regex> = OnceLock::new();
    let ws_run = WS_RUN.get_or_init(|| Regex::new(r"\s{2,}").unwrap());
    let cleaned = ws_run.replace_all(&cleaned, " ").trim().to_string();

    (cleaned, deduplicate_tool_calls(calls))
}
