//! Builds the `conversationState` envelope the generateAssistantResponse
//! endpoint expects from a normalized Anthropic Messages request.
//!
//! The upstream is strict about turn shape: history must alternate
//! user/assistant starting on user and ending on assistant, and the current
//! message must always be a user turn. Everything here exists to satisfy
//! those rules without losing tool calls, tool results, or images.

use serde_json::{json, Value};
use std::collections::HashSet;

use crate::proxy::mappers::claude::{ClaudeRequest, ContentBlock, Message, MessageContent};

/// Upstream rejects empty content strings in history entries.
const EMPTY_PLACEHOLDER: &str = "(empty)";

/// One merged conversation turn.
#[derive(Debug, Clone)]
struct Turn {
    role: String,
    text: String,
    tool_uses: Vec<Value>,
    tool_results: Vec<Value>,
    images: Vec<Value>,
}

impl Turn {
    fn synthetic(role: &str, text: &str) -> Self {
        Self {
            role: role.to_string(),
            text: text.to_string(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
        }
    }

    fn absorb(&mut self, other: Turn) {
        if !other.text.is_empty() {
            if !self.text.is_empty() {
                self.text.push('\n');
            }
            self.text.push_str(&other.text);
        }
        self.tool_uses.extend(other.tool_uses);
        self.tool_results.extend(other.tool_results);
        self.images.extend(other.images);
    }
}

fn extract_text(content: &MessageContent) -> String {
    match content {
        MessageContent::String(s) => s.clone(),
        MessageContent::Array(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                if let ContentBlock::Text { text } = block {
                    parts.push(text.clone());
                }
            }
            parts.join("\n")
        }
    }
}

/// Images in upstream form: `{"format": "png", "source": {"bytes": "<b64>"}}`.
fn extract_images(content: &MessageContent) -> Vec<Value> {
    let mut images = Vec::new();
    if let MessageContent::Array(blocks) = content {
        for block in blocks {
            if let ContentBlock::Image { source, .. } = block {
                let mut data = source.data.clone();
                let mut media_type = source.media_type.clone();

                // Strip a data-URL prefix if the client sent one.
                if data.starts_with("data:") {
                    if let Some(comma_pos) = data.find(',') {
                        let header = &data[..comma_pos];
                        let media_part = header.split(';').next().unwrap_or("");
                        let extracted = media_part.strip_prefix("data:").unwrap_or("");
                        if !extracted.is_empty() {
                            media_type = extracted.to_string();
                        }
                        data = data[comma_pos + 1..].to_string();
                    }
                }

                let format = media_type
                    .split('/')
                    .next_back()
                    .unwrap_or(&media_type)
                    .to_string();
                images.push(json!({
                    "format": format,
                    "source": { "bytes": data }
                }));
            }
        }
    }
    images
}

fn extract_tool_uses(content: &MessageContent) -> Vec<Value> {
    let mut tool_uses = Vec::new();
    if let MessageContent::Array(blocks) = content {
        for block in blocks {
            if let ContentBlock::ToolUse { id, name, input, .. } = block {
                tool_uses.push(json!({
                    "input": input,
                    "name": name,
                    "toolUseId": id
                }));
            }
        }
    }
    tool_uses
}

fn extract_tool_results(content: &MessageContent) -> Vec<Value> {
    let mut results = Vec::new();
    if let MessageContent::Array(blocks) = content {
        for block in blocks {
            if let ContentBlock::ToolResult {
                tool_use_id,
                content: result_content,
                is_error,
            } = block
            {
                let text = match result_content {
                    Value::String(s) => s.clone(),
                    Value::Array(arr) => arr
                        .iter()
                        .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                let status = if is_error.unwrap_or(false) {
                    "error"
                } else {
                    "success"
                };
                results.push(json!({
                    "content": [{"text": text}],
                    "status": status,
                    "toolUseId": tool_use_id
                }));
            }
        }
    }
    results
}

fn turn_from_message(msg: &Message) -> Turn {
    Turn {
        role: msg.role.clone(),
        text: extract_text(&msg.content),
        tool_uses: extract_tool_uses(&msg.content),
        tool_results: extract_tool_results(&msg.content),
        images: extract_images(&msg.content),
    }
}

/// Client-side prefill leaves a trailing assistant turn whose first content
/// block is the single character `{`; the upstream rejects it outright.
fn is_prefill_artifact(msg: &Message) -> bool {
    if msg.role != "assistant" {
        return false;
    }
    match &msg.content {
        MessageContent::String(s) => s == "{",
        MessageContent::Array(blocks) => {
            matches!(blocks.first(), Some(ContentBlock::Text { text }) if text == "{")
        }
    }
}

/// Concatenate consecutive same-role turns, joining text with `\n`.
fn merge_adjacent_roles(turns: Vec<Turn>) -> Vec<Turn> {
    let mut merged: Vec<Turn> = Vec::new();
    for turn in turns {
        if let Some(last) = merged.last_mut() {
            if last.role == turn.role {
                last.absorb(turn);
                continue;
            }
        }
        merged.push(turn);
    }
    merged
}

/// First occurrence wins.
fn dedupe_tool_results(results: Vec<Value>) -> Vec<Value> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut unique = Vec::new();
    for result in results {
        let id = result
            .get("toolUseId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if seen.insert(id) {
            unique.push(result);
        }
    }
    unique
}

fn history_entry(turn: &Turn, model_id: &str) -> Value {
    if turn.role == "user" {
        let content = if turn.text.is_empty() {
            EMPTY_PLACEHOLDER
        } else {
            turn.text.as_str()
        };
        let mut user_input = json!({
            "content": content,
            "modelId": model_id,
            "origin": "AI_EDITOR"
        });
        if !turn.images.is_empty() {
            user_input["images"] = json!(turn.images);
        }
        let tool_results = dedupe_tool_results(turn.tool_results.clone());
        if !tool_results.is_empty() {
            user_input["userInputMessageContext"] = json!({ "toolResults": tool_results });
        }
        json!({ "userInputMessage": user_input })
    } else {
        let content = if turn.text.is_empty() {
            EMPTY_PLACEHOLDER
        } else {
            turn.text.as_str()
        };
        let mut assistant = json!({ "content": content });
        if !turn.tool_uses.is_empty() {
            assistant["toolUses"] = json!(turn.tool_uses);
        }
        json!({ "assistantResponseMessage": assistant })
    }
}

fn tool_specifications(tools: &[crate::proxy::mappers::claude::Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "toolSpecification": {
                    "name": tool.name,
                    "description": tool.description.as_deref().unwrap_or(""),
                    "inputSchema": {
                        "json": tool.input_schema.clone().unwrap_or(json!({}))
                    }
                }
            })
        })
        .collect()
}

/// Build the full upstream payload.
///
/// `model_id` is the already-mapped internal model id; `profile_arn` is
/// attached top-level for social-auth accounts.
pub fn build_kiro_payload(
    request: &ClaudeRequest,
    model_id: &str,
    profile_arn: Option<&str>,
) -> Value {
    let mut messages: Vec<&Message> = request.messages.iter().collect();

    // Trailing-assistant prefill sentinel.
    if messages.last().map_or(false, |m| is_prefill_artifact(m)) {
        messages.pop();
    }

    let system_text = request
        .system
        .as_ref()
        .map(|s| s.to_text())
        .filter(|s| !s.is_empty());

    // Split off the final turn; the rest is history.
    let mut current = match messages.pop() {
        Some(msg) => turn_from_message(msg),
        None => Turn::synthetic("user", "Continue"),
    };
    let mut history =
        merge_adjacent_roles(messages.into_iter().map(turn_from_message).collect());

    // The current message must be a user turn; a trailing assistant moves
    // into history and yields a synthetic "Continue" user turn.
    if current.role == "assistant" {
        if history.last().map_or(false, |t| t.role == "assistant") {
            if let Some(last) = history.last_mut() {
                last.absorb(current);
            }
        } else {
            history.push(current);
        }
        current = Turn::synthetic("user", "Continue");
    }

    // System prompt rides the first user turn; with no history at all it
    // rides the current message instead.
    if let Some(sys) = system_text {
        if history.is_empty() {
            if current.text.is_empty() {
                current.text = sys;
            } else {
                current.text = format!("{}\n\n{}", sys, current.text);
            }
        } else if history[0].role == "user" {
            if history[0].text.is_empty() {
                history[0].text = sys;
            } else {
                history[0].text = format!("{}\n\n{}", sys, history[0].text);
            }
        } else {
            history.insert(0, Turn::synthetic("user", &sys));
        }
    }

    // History must open on a user turn.
    if history.first().map_or(false, |t| t.role == "assistant") {
        history.insert(0, Turn::synthetic("user", EMPTY_PLACEHOLDER));
    }

    // Alternation requires an assistant turn between a trailing history
    // user and the current user.
    if history.last().map_or(false, |t| t.role == "user") {
        history.push(Turn::synthetic("assistant", "Continue"));
    }

    // Content-required rule for the current turn.
    if current.text.is_empty() {
        current.text = if current.tool_results.is_empty() {
            "Continue".to_string()
        } else {
            "Tool results provided.".to_string()
        };
    }

    let history_entries: Vec<Value> =
        history.iter().map(|t| history_entry(t, model_id)).collect();

    let mut user_input_message = json!({
        "content": current.text,
        "modelId": model_id,
        "origin": "AI_EDITOR"
    });
    if !current.images.is_empty() {
        user_input_message["images"] = json!(current.images);
    }

    let mut context = serde_json::Map::new();
    if let Some(tools) = &request.tools {
        let specs = tool_specifications(tools);
        if !specs.is_empty() {
            context.insert("tools".to_string(), json!(specs));
        }
    }
    let current_tool_results = dedupe_tool_results(current.tool_results);
    if !current_tool_results.is_empty() {
        context.insert("toolResults".to_string(), json!(current_tool_results));
    }
    if !context.is_empty() {
        user_input_message["userInputMessageContext"] = Value::Object(context);
    }

    let mut conversation_state = json!({
        "chatTriggerType": "MANUAL",
        "conversationId": uuid::Uuid::new_v4().to_string(),
        "currentMessage": { "userInputMessage": user_input_message }
    });
    if !history_entries.is_empty() {
        conversation_state["history"] = json!(history_entries);
    }

    let mut payload = json!({ "conversationState": conversation_state });
    if let Some(arn) = profile_arn {
        payload["profileArn"] = json!(arn);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::mappers::claude::{ImageSource, SystemPrompt, Tool};

    const MODEL: &str = "CLAUDE_SONNET_4_5_20250929_V1_0";

    fn user_msg(text: &str) -> Message {
        Message {
            role: "user".into(),
            content: MessageContent::String(text.into()),
        }
    }

    fn assistant_msg(text: &str) -> Message {
        Message {
            role: "assistant".into(),
            content: MessageContent::String(text.into()),
        }
    }

    fn request(messages: Vec<Message>) -> ClaudeRequest {
        ClaudeRequest {
            model: "claude-sonnet-4-5".into(),
            messages,
            system: None,
            tools: None,
            stream: false,
            max_tokens: Some(1024),
            temperature: None,
            top_p: None,
        }
    }

    fn roles_of(payload: &Value) -> Vec<String> {
        let state = &payload["conversationState"];
        let mut roles = Vec::new();
        if let Some(history) = state.get("history").and_then(|h| h.as_array()) {
            for entry in history {
                if entry.get("userInputMessage").is_some() {
                    roles.push("user".to_string());
                } else {
                    roles.push("assistant".to_string());
                }
            }
        }
        roles.push("user".to_string()); // currentMessage is always user-roled
        roles
    }

    #[test]
    fn test_single_user_message() {
        let payload = build_kiro_payload(&request(vec![user_msg("Hi")]), MODEL, None);
        let state = &payload["conversationState"];
        assert_eq!(state["chatTriggerType"], "MANUAL");
        assert!(state.get("history").is_none());
        assert_eq!(state["currentMessage"]["userInputMessage"]["content"], "Hi");
        assert_eq!(state["currentMessage"]["userInputMessage"]["modelId"], MODEL);
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["origin"],
            "AI_EDITOR"
        );
        // Fresh conversation id per request
        assert!(uuid::Uuid::parse_str(state["conversationId"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_system_with_single_user_rides_current() {
        let mut req = request(vec![user_msg("Hi")]);
        req.system = Some(SystemPrompt::String("Be brief.".into()));
        let payload = build_kiro_payload(&req, MODEL, None);
        let state = &payload["conversationState"];
        assert!(state.get("history").is_none());
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["content"],
            "Be brief.\n\nHi"
        );
    }

    #[test]
    fn test_system_prepended_to_first_history_user() {
        let mut req = request(vec![user_msg("one"), assistant_msg("two"), user_msg("three")]);
        req.system = Some(SystemPrompt::String("sys".into()));
        let payload = build_kiro_payload(&req, MODEL, None);
        let history = payload["conversationState"]["history"].as_array().unwrap();
        assert_eq!(
            history[0]["userInputMessage"]["content"],
            "sys\n\none"
        );
        assert_eq!(
            payload["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "three"
        );
    }

    #[test]
    fn test_prefill_artifact_dropped() {
        let req = request(vec![
            user_msg("give me json"),
            Message {
                role: "assistant".into(),
                content: MessageContent::Array(vec![ContentBlock::Text { text: "{".into() }]),
            },
        ]);
        let payload = build_kiro_payload(&req, MODEL, None);
        let state = &payload["conversationState"];
        assert!(state.get("history").is_none());
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["content"],
            "give me json"
        );
    }

    #[test]
    fn test_trailing_assistant_moved_to_history() {
        let req = request(vec![user_msg("question"), assistant_msg("half an answer")]);
        let payload = build_kiro_payload(&req, MODEL, None);
        let state = &payload["conversationState"];
        let history = state["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["userInputMessage"]["content"], "question");
        assert_eq!(
            history[1]["assistantResponseMessage"]["content"],
            "half an answer"
        );
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["content"],
            "Continue"
        );
    }

    #[test]
    fn test_adjacent_user_turns_merged_in_history() {
        let req = request(vec![
            user_msg("a"),
            user_msg("b"),
            assistant_msg("c"),
            user_msg("d"),
        ]);
        let payload = build_kiro_payload(&req, MODEL, None);
        let history = payload["conversationState"]["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["userInputMessage"]["content"], "a\nb");
        assert_eq!(history[1]["assistantResponseMessage"]["content"], "c");
    }

    #[test]
    fn test_synthetic_assistant_between_user_turns() {
        // history ends user, current is user → synthetic assistant inserted
        let req = request(vec![user_msg("first"), assistant_msg("mid"), user_msg("x"), user_msg("y")]);
        // "x" lands in history (after merge x/y would be adjacent across the
        // split, which the builder bridges with a synthetic assistant)
        let payload = build_kiro_payload(&req, MODEL, None);
        let roles = roles_of(&payload);
        // strictly alternating, ending in user
        for pair in roles.windows(2) {
            assert_ne!(pair[0], pair[1], "roles not alternating: {:?}", roles);
        }
        assert_eq!(roles.first().map(String::as_str), Some("user"));
        assert_eq!(roles.last().map(String::as_str), Some("user"));
    }

    #[test]
    fn test_tool_results_deduped_first_wins() {
        let blocks = vec![
            ContentBlock::ToolResult {
                tool_use_id: "tu_1".into(),
                content: serde_json::json!("first"),
                is_error: None,
            },
            ContentBlock::ToolResult {
                tool_use_id: "tu_1".into(),
                content: serde_json::json!("second"),
                is_error: None,
            },
            ContentBlock::ToolResult {
                tool_use_id: "tu_2".into(),
                content: serde_json::json!("other"),
                is_error: Some(true),
            },
        ];
        let req = request(vec![Message {
            role: "user".into(),
            content: MessageContent::Array(blocks),
        }]);
        let payload = build_kiro_payload(&req, MODEL, None);
        let results = payload["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["toolResults"]
            .as_array()
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["toolUseId"], "tu_1");
        assert_eq!(results[0]["content"][0]["text"], "first");
        assert_eq!(results[0]["status"], "success");
        assert_eq!(results[1]["status"], "error");
        // Empty text falls back to the tool-results placeholder
        assert_eq!(
            payload["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "Tool results provided."
        );
    }

    #[test]
    fn test_assistant_tool_uses_in_history() {
        let req = request(vec![
            user_msg("weather?"),
            Message {
                role: "assistant".into(),
                content: MessageContent::Array(vec![
                    ContentBlock::Text { text: "checking".into() },
                    ContentBlock::ToolUse {
                        id: "tu_9".into(),
                        name: "get_weather".into(),
                        input: serde_json::json!({"city": "NYC"}),
                        cache_control: None,
                    },
                ]),
            },
            user_msg("thanks"),
        ]);
        let payload = build_kiro_payload(&req, MODEL, None);
        let history = payload["conversationState"]["history"].as_array().unwrap();
        let tool_uses = history[1]["assistantResponseMessage"]["toolUses"]
            .as_array()
            .unwrap();
        assert_eq!(tool_uses.len(), 1);
        assert_eq!(tool_uses[0]["toolUseId"], "tu_9");
        assert_eq!(tool_uses[0]["name"], "get_weather");
        assert_eq!(tool_uses[0]["input"]["city"], "NYC");
    }

    #[test]
    fn test_tools_attached_to_current_message() {
        let mut req = request(vec![user_msg("weather in NYC?")]);
        req.tools = Some(vec![Tool {
            name: "get_weather".into(),
            description: Some("Get current weather".into()),
            input_schema: Some(serde_json::json!({"type": "object"})),
        }]);
        let payload = build_kiro_payload(&req, MODEL, None);
        let tools = payload["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["tools"]
            .as_array()
            .unwrap();
        assert_eq!(tools[0]["toolSpecification"]["name"], "get_weather");
        assert_eq!(
            tools[0]["toolSpecification"]["inputSchema"]["json"]["type"],
            "object"
        );
    }

    #[test]
    fn test_profile_arn_for_social_auth() {
        let req = request(vec![user_msg("Hi")]);
        let arn = "arn:aws:codewhisperer:us-east-1:x:profile/y";
        let payload = build_kiro_payload(&req, MODEL, Some(arn));
        assert_eq!(payload["profileArn"], arn);

        let without = build_kiro_payload(&req, MODEL, None);
        assert!(without.get("profileArn").is_none());
    }

    #[test]
    fn test_image_blocks_packaged() {
        let req = request(vec![Message {
            role: "user".into(),
            content: MessageContent::Array(vec![
                ContentBlock::Text { text: "see this".into() },
                ContentBlock::Image {
                    source: ImageSource {
                        source_type: "base64".into(),
                        media_type: "image/jpeg".into(),
                        data: "data:image/jpeg;base64,AAAA".into(),
                    },
                    cache_control: None,
                },
            ]),
        }]);
        let payload = build_kiro_payload(&req, MODEL, None);
        let images = payload["conversationState"]["currentMessage"]["userInputMessage"]["images"]
            .as_array()
            .unwrap();
        assert_eq!(images[0]["format"], "jpeg");
        // Data-URL header stripped, raw base64 retained
        assert_eq!(images[0]["source"]["bytes"], "AAAA");
    }

    #[test]
    fn test_empty_messages_still_builds() {
        let payload = build_kiro_payload(&request(vec![]), MODEL, None);
        assert_eq!(
            payload["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "Continue"
        );
    }

    use proptest::prelude::*;

    fn arb_message() -> impl Strategy<Value = Message> {
        (
            prop::bool::ANY,
            "[a-zA-Z0-9 ]{0,12}",
        )
            .prop_map(|(is_user, text)| Message {
                role: if is_user { "user" } else { "assistant" }.into(),
                content: MessageContent::String(text),
            })
    }

    proptest! {
        /// History plus the current user turn is strictly alternating,
        /// starting and ending on user, for any input role sequence.
        #[test]
        fn prop_roles_alternate_ending_in_user(
            messages in prop::collection::vec(arb_message(), 0..12)
        ) {
            let payload = build_kiro_payload(&request(messages), MODEL, None);
            let roles = roles_of(&payload);
            prop_assert_eq!(roles.first().map(String::as_str), Some("user"));
            prop_assert_eq!(roles.last().map(String::as_str), Some("user"));
            for pair in roles.windows(2) {
                prop_assert_ne!(&pair[0], &pair[1]);
            }
        }

        /// The current message content is never empty.
        #[test]
        fn prop_current_content_nonempty(
            messages in prop::collection::vec(arb_message(), 0..8)
        ) {
            let payload = build_kiro_payload(&request(messages), MODEL, None);
            let content = payload["conversationState"]["currentMessage"]["userInputMessage"]
                ["content"].as_str().unwrap();
            prop_assert!(!content.is_empty());
        }
    }
}
