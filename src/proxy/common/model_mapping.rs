// Claude model id → CodeWhisperer internal model id.

/// Known mappings from public Claude model IDs (with or without date suffix)
/// to the internal IDs the generateAssistantResponse endpoint expects.
const MODEL_MAP: &[(&str, &str)] = &[
    ("claude-haiku-4-5-20251001", "CLAUDE_HAIKU_4_5_20251001_V1_0"),
    ("claude-haiku-4-5", "CLAUDE_HAIKU_4_5_20251001_V1_0"),
    ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-sonnet-4", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-opus-4-5-20251101", "CLAUDE_OPUS_4_5_20251101_V1_0"),
    ("claude-opus-4-5", "CLAUDE_OPUS_4_5_20251101_V1_0"),
    ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
    ("claude-3-7-sonnet", "CLAUDE_3_7_SONNET_20250219_V1_0"),
];

/// Fallback for model IDs the table does not know.
pub const DEFAULT_KIRO_MODEL: &str = "CLAUDE_SONNET_4_5_20250929_V1_0";

/// Strip a trailing `-YYYYMMDD` or `-latest` suffix.
fn strip_date_suffix(model: &str) -> &str {
    if let Some(idx) = model.rfind('-') {
        let tail = &model[idx + 1..];
        if tail == "latest" || (tail.len() == 8 && tail.chars().all(|c| c.is_ascii_digit())) {
            return &model[..idx];
        }
    }
    model
}

/// Translate a caller-supplied Claude model ID into the upstream internal ID.
/// Unknown IDs fall back to [`DEFAULT_KIRO_MODEL`].
pub fn map_model_id(model: &str) -> &'static str {
    let lower = model.to_lowercase();

    for (public, internal) in MODEL_MAP {
        if lower == *public {
            return internal;
        }
    }

    let stripped = strip_date_suffix(&lower);
    for (public, internal) in MODEL_MAP {
        if stripped == *public {
            return internal;
        }
    }

    DEFAULT_KIRO_MODEL
}
