//! Claude SSE emission and unary response assembly.
//!
//! The state machine turns parser events into the Anthropic event sequence:
//! `message_start`, `content_block_start`/`content_block_delta`/
//! `content_block_stop` per block, then `message_delta` + `message_stop`.
//! Tool-use blocks stream live as the upstream produces them; the first text
//! token opens the text block at index 0.

use serde_json::{json, Value};
use std::collections::HashSet;

use super::parsers::{recover_bracket_tool_calls, KiroEvent};
use crate::proxy::tokenizer::estimate_chars;

fn new_message_id() -> String {
    format!(
        "msg_{}",
        &uuid::Uuid::new_v4().simple().to_string()[..24]
    )
}

pub fn format_sse(event: &str, data: &Value) -> String {
    format!(
        "event: {}\ndata: {}\n\n",
        event,
        serde_json::to_string(data).unwrap_or_default()
    )
}

/// Converts upstream events into Claude SSE frames for one request.
pub struct SseBuilder {
    message_id: String,
    model: String,
    content_index: usize,
    in_text_block: bool,
    tool_block_open: bool,
    current_tool_name: Option<String>,
    current_tool_input: String,
    seen_tool_keys: HashSet<String>,
    has_tool_calls: bool,
    has_sent_message_start: bool,
    accumulated_text: String,
    output_char_count: usize,
    estimated_input_tokens: u32,
}

impl SseBuilder {
    pub fn new(model: &str, estimated_input_tokens: u32) -> Self {
        Self {
            message_id: new_message_id(),
            model: model.to_string(),
            content_index: 0,
            in_text_block: false,
            tool_block_open: false,
            current_tool_name: None,
            current_tool_input: String::new(),
            seen_tool_keys: HashSet::new(),
            has_tool_calls: false,
            has_sent_message_start: false,
            accumulated_text: String::new(),
            output_char_count: 0,
            estimated_input_tokens,
        }
    }

    fn message_start(&mut self) -> String {
        if self.has_sent_message_start {
            return String::new();
        }
        self.has_sent_message_start = true;
        format_sse(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {
                        "input_tokens": self.estimated_input_tokens,
                        "output_tokens": 0
                    }
                }
            }),
        )
    }

    fn close_text_block(&mut self) -> String {
        if !self.in_text_block {
            return String::new();
        }
        self.in_text_block = false;
        let out = format_sse(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.content_index}),
        );
        self.content_index += 1;
        out
    }

    fn close_tool_block(&mut self) -> String {
        if !self.tool_block_open {
            return String::new();
        }
        self.tool_block_open = false;
        self.has_tool_calls = true;

        // Remember what streamed so finalize-time bracket recovery does not
        // duplicate it.
        if let Some(name) = self.current_tool_name.take() {
            let args: Value = serde_json::from_str(&self.current_tool_input)
                .unwrap_or_else(|_| json!(self.current_tool_input));
            self.seen_tool_keys.insert(format!(
                "{}-{}",
                name,
                serde_json::to_string(&args).unwrap_or_default()
            ));
        }
        self.current_tool_input.clear();

        let out = format_sse(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.content_index}),
        );
        self.content_index += 1;
        out
    }

    /// Emit a complete tool_use block in one go (bracket-recovered calls).
    fn emit_whole_tool_block(&mut self, id: &str, name: &str, arguments: &Value) -> String {
        let mut out = String::new();
        out.push_str(&format_sse(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": self.content_index,
                "content_block": {
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": {}
                }
            }),
        ));
        let args_str = serde_json::to_string(arguments).unwrap_or_else(|_| "{}".to_string());
        out.push_str(&format_sse(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": self.content_index,
                "delta": {"type": "input_json_delta", "partial_json": args_str}
            }),
        ));
        out.push_str(&format_sse(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.content_index}),
        ));
        self.content_index += 1;
        self.has_tool_calls = true;
        out
    }

    pub fn process_event(&mut self, event: KiroEvent) -> String {
        let mut out = self.message_start();

        match event {
            KiroEvent::TextDelta(text) => {
                out.push_str(&self.close_tool_block());
                if !self.in_text_block {
                    out.push_str(&format_sse(
                        "content_block_start",
                        &json!({
                            "type": "content_block_start",
                            "index": self.content_index,
                            "content_block": {"type": "text", "text": ""}
                        }),
                    ));
                    self.in_text_block = true;
                }
                self.accumulated_text.push_str(&text);
                self.output_char_count += text.len();
                out.push_str(&format_sse(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.content_index,
                        "delta": {"type": "text_delta", "text": text}
                    }),
                ));
            }

            KiroEvent::ToolUseStart { name, tool_use_id } => {
                out.push_str(&self.close_text_block());
                out.push_str(&self.close_tool_block());
                out.push_str(&format_sse(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": self.content_index,
                        "content_block": {
                            "type": "tool_use",
                            "id": tool_use_id,
                            "name": name,
                            "input": {}
                        }
                    }),
                ));
                self.tool_block_open = true;
                self.current_tool_name = Some(name);
                self.current_tool_input.clear();
            }

            KiroEvent::ToolInputDelta(partial_json) => {
                if self.tool_block_open {
                    self.current_tool_input.push_str(&partial_json);
                    out.push_str(&format_sse(
                        "content_block_delta",
                        &json!({
                            "type": "content_block_delta",
                            "index": self.content_index,
                            "delta": {"type": "input_json_delta", "partial_json": partial_json}
                        }),
                    ));
                }
            }

            KiroEvent::ToolUseStop => {
                out.push_str(&self.close_tool_block());
            }
        }

        out
    }

    /// Close any open block, surface bracket-recovered tool calls that did
    /// not stream, then terminate the message. Every clean exit path must
    /// pass through here exactly once.
    pub fn finalize(&mut self) -> String {
        let mut out = self.message_start();

        out.push_str(&self.close_text_block());
        out.push_str(&self.close_tool_block());

        if !self.accumulated_text.is_empty() {
            let (_, recovered) = recover_bracket_tool_calls(&self.accumulated_text);
            for call in recovered {
                let key = format!(
                    "{}-{}",
                    call.name,
                    serde_json::to_string(&call.arguments).unwrap_or_default()
                );
                if self.seen_tool_keys.insert(key) {
                    out.push_str(&self.emit_whole_tool_block(
                        &call.id,
                        &call.name,
                        &call.arguments,
                    ));
                }
            }
        }

        let stop_reason = if self.has_tool_calls {
            "tool_use"
        } else {
            "end_turn"
        };

        out.push_str(&format_sse(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": stop_reason,
                    "stop_sequence": null
                },
                "usage": {
                    "output_tokens": estimate_chars(self.output_char_count)
                }
            }),
        ));

        out.push_str(&format_sse(
            "message_stop",
            &json!({"type": "message_stop"}),
        ));

        // OpenAI-style terminator for clients that wait on it.
        out.push_str("data: [DONE]\n\n");

        out
    }
}

/// Assemble a single Messages response object from a fully-buffered event
/// list (the non-streaming path).
pub fn assemble_unary_response(
    model: &str,
    events: Vec<KiroEvent>,
    estimated_input_tokens: u32,
) -> Value {
    let mut full_text = String::new();
    let mut tools: Vec<(String, String, String)> = Vec::new(); // (id, name, input buffer)
    let mut open_tool: Option<(String, String, String)> = None;

    for event in events {
        match event {
            KiroEvent::TextDelta(text) => full_text.push_str(&text),
            KiroEvent::ToolUseStart { name, tool_use_id } => {
                if let Some(tool) = open_tool.take() {
                    tools.push(tool);
                }
                open_tool = Some((tool_use_id, name, String::new()));
            }
            KiroEvent::ToolInputDelta(partial) => {
                if let Some((_, _, ref mut buffer)) = open_tool {
                    buffer.push_str(&partial);
                }
            }
            KiroEvent::ToolUseStop => {
                if let Some(tool) = open_tool.take() {
                    tools.push(tool);
                }
            }
        }
    }
    if let Some(tool) = open_tool.take() {
        tools.push(tool);
    }

    let (cleaned_text, recovered) = recover_bracket_tool_calls(&full_text);

    let mut seen: HashSet<String> = HashSet::new();
    let mut content_blocks: Vec<Value> = Vec::new();

    if !cleaned_text.is_empty() {
        content_blocks.push(json!({"type": "text", "text": cleaned_text}));
    }

    for (id, name, buffer) in &tools {
        let input: Value = if buffer.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(buffer).unwrap_or(json!({}))
        };
        seen.insert(format!(
            "{}-{}",
            name,
            serde_json::to_string(&input).unwrap_or_default()
        ));
        content_blocks.push(json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input
        }));
    }

    for call in recovered {
        let key = format!(
            "{}-{}",
            call.name,
            serde_json::to_string(&call.arguments).unwrap_or_default()
        );
        if seen.insert(key) {
            content_blocks.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call.arguments
            }));
        }
    }

    let has_tools = content_blocks.iter().any(|b| b["type"] == "tool_use");
    let stop_reason = if has_tools { "tool_use" } else { "end_turn" };

    json!({
        "id": new_message_id(),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content_blocks,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": estimated_input_tokens,
            "output_tokens": estimate_chars(full_text.len()),
            "cache_read_input_tokens": 0
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse_events(raw: &str) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        let mut event_name = String::new();
        for line in raw.lines() {
            if let Some(name) = line.strip_prefix("event: ") {
                event_name = name.to_string();
            } else if let Some(data) = line.strip_prefix("data: ") {
                if data == "[DONE]" {
                    continue;
                }
                out.push((
                    event_name.clone(),
                    serde_json::from_str::<Value>(data).unwrap(),
                ));
            }
        }
        out
    }

    #[test]
    fn test_text_stream_lifecycle() {
        let mut builder = SseBuilder::new("claude-haiku-4-5", 12);
        let mut raw = String::new();
        raw.push_str(&builder.process_event(KiroEvent::TextDelta("Hel".into())));
        raw.push_str(&builder.process_event(KiroEvent::TextDelta("lo".into())));
        raw.push_str(&builder.finalize());

        let events = sse_events(&raw);
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        // Text block opens at index 0
        assert_eq!(events[1].1["index"], 0);
        assert_eq!(events[1].1["content_block"]["type"], "text");
        assert_eq!(events[2].1["delta"]["text"], "Hel");
        assert_eq!(events[5].1["delta"]["stop_reason"], "end_turn");
        assert!(raw.ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn test_tool_use_streams_live() {
        let mut builder = SseBuilder::new("claude-sonnet-4-5", 40);
        let mut raw = String::new();
        raw.push_str(&builder.process_event(KiroEvent::ToolUseStart {
            name: "get_weather".into(),
            tool_use_id: "tu_1".into(),
        }));
        raw.push_str(
            &builder.process_event(KiroEvent::ToolInputDelta("{\"city\":\"NYC\"".into())),
        );
        raw.push_str(&builder.process_event(KiroEvent::ToolInputDelta("}".into())));
        raw.push_str(&builder.process_event(KiroEvent::ToolUseStop));
        raw.push_str(&builder.finalize());

        let events = sse_events(&raw);
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        let start = &events[1].1;
        assert_eq!(start["index"], 0);
        assert_eq!(start["content_block"]["type"], "tool_use");
        assert_eq!(start["content_block"]["id"], "tu_1");
        assert_eq!(start["content_block"]["name"], "get_weather");
        assert_eq!(events[2].1["delta"]["type"], "input_json_delta");
        assert_eq!(events[2].1["delta"]["partial_json"], "{\"city\":\"NYC\"");
        assert_eq!(events[4].1["index"], 0);
        // tool_use stop reason
        assert_eq!(events[5].1["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn test_text_then_tool_indexes() {
        let mut builder = SseBuilder::new("m", 1);
        let mut raw = String::new();
        raw.push_str(&builder.process_event(KiroEvent::TextDelta("checking".into())));
        raw.push_str(&builder.process_event(KiroEvent::ToolUseStart {
            name: "f".into(),
            tool_use_id: "tu_2".into(),
        }));
        raw.push_str(&builder.process_event(KiroEvent::ToolUseStop));
        raw.push_str(&builder.finalize());

        let events = sse_events(&raw);
        // text at index 0, tool at index 1
        let tool_start = events
            .iter()
            .find(|(n, d)| n == "content_block_start" && d["content_block"]["type"] == "tool_use")
            .unwrap();
        assert_eq!(tool_start.1["index"], 1);
    }

    #[test]
    fn test_dangling_tool_closed_at_finalize() {
        let mut builder = SseBuilder::new("m", 1);
        let mut raw = String::new();
        raw.push_str(&builder.process_event(KiroEvent::ToolUseStart {
            name: "f".into(),
            tool_use_id: "tu_3".into(),
        }));
        raw.push_str(&builder.process_event(KiroEvent::ToolInputDelta("{\"k\":1}".into())));
        // stream dies before the stop event
        raw.push_str(&builder.finalize());

        let events = sse_events(&raw);
        assert!(events.iter().any(|(n, _)| n == "content_block_stop"));
        let delta = events.iter().find(|(n, _)| n == "message_delta").unwrap();
        assert_eq!(delta.1["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn test_bracket_recovery_emits_extra_block() {
        let mut builder = SseBuilder::new("m", 1);
        let mut raw = String::new();
        raw.push_str(&builder.process_event(KiroEvent::TextDelta(
            "Done. [Called get_time with args: {tz: UTC,}]".into(),
        )));
        raw.push_str(&builder.finalize());

        let events = sse_events(&raw);
        let tool_start = events
            .iter()
            .find(|(n, d)| n == "content_block_start" && d["content_block"]["type"] == "tool_use")
            .expect("recovered tool block");
        assert_eq!(tool_start.1["content_block"]["name"], "get_time");
        let delta = events
            .iter()
            .find(|(n, d)| n == "content_block_delta" && d["delta"]["type"] == "input_json_delta")
            .unwrap();
        assert_eq!(delta.1["delta"]["partial_json"], "{\"tz\":\"UTC\"}");
    }

    #[test]
    fn test_message_start_emitted_once() {
        let mut builder = SseBuilder::new("m", 1);
        let mut raw = String::new();
        raw.push_str(&builder.process_event(KiroEvent::TextDelta("a".into())));
        raw.push_str(&builder.process_event(KiroEvent::TextDelta("b".into())));
        raw.push_str(&builder.finalize());
        assert_eq!(raw.matches("event: message_start").count(), 1);
        assert_eq!(raw.matches("event: message_stop").count(), 1);
    }

    // --- unary assembly ---

    #[test]
    fn test_unary_text_only() {
        let response = assemble_unary_response(
            "claude-haiku-4-5",
            vec![
                KiroEvent::TextDelta("Hello ".into()),
                KiroEvent::TextDelta("world".into()),
            ],
            7,
        );
        assert_eq!(response["type"], "message");
        assert_eq!(response["role"], "assistant");
        assert_eq!(response["stop_reason"], "end_turn");
        assert_eq!(response["content"][0]["type"], "text");
        assert_eq!(response["content"][0]["text"], "Hello world");
        assert_eq!(response["usage"]["input_tokens"], 7);
        assert!(response["usage"]["output_tokens"].as_u64().unwrap() > 0);
        assert_eq!(response["usage"]["cache_read_input_tokens"], 0);
        assert!(response["id"].as_str().unwrap().starts_with("msg_"));
    }

    #[test]
    fn test_unary_with_streamed_tool() {
        let response = assemble_unary_response(
            "m",
            vec![
                KiroEvent::ToolUseStart {
                    name: "get_weather".into(),
                    tool_use_id: "tu_1".into(),
                },
                KiroEvent::ToolInputDelta("{\"city\":\"NYC\"}".into()),
                KiroEvent::ToolUseStop,
            ],
            1,
        );
        assert_eq!(response["stop_reason"], "tool_use");
        assert_eq!(response["content"][0]["type"], "tool_use");
        assert_eq!(response["content"][0]["id"], "tu_1");
        assert_eq!(response["content"][0]["input"]["city"], "NYC");
    }

    #[test]
    fn test_unary_bracket_recovery_strips_text() {
        let response = assemble_unary_response(
            "m",
            vec![KiroEvent::TextDelta(
                "Done. [Called get_time with args: {tz: UTC,}]".into(),
            )],
            1,
        );
        assert_eq!(response["content"][0]["type"], "text");
        assert_eq!(response["content"][0]["text"], "Done.");
        assert_eq!(response["content"][1]["type"], "tool_use");
        assert_eq!(response["content"][1]["name"], "get_time");
        assert_eq!(response["content"][1]["input"]["tz"], "UTC");
        assert_eq!(response["stop_reason"], "tool_use");
    }

    #[test]
    fn test_unary_dedupes_recovered_against_streamed() {
        let response = assemble_unary_response(
            "m",
            vec![
                KiroEvent::ToolUseStart {
                    name: "f".into(),
                    tool_use_id: "tu_1".into(),
                },
                KiroEvent::ToolInputDelta("{\"a\":1}".into()),
                KiroEvent::ToolUseStop,
                KiroEvent::TextDelta("[Called f with args: {\"a\": 1}]".into()),
            ],
            1,
        );
        let tool_blocks: Vec<&Value> = response["content"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|b| b["type"] == "tool_use")
            .collect();
        assert_eq!(tool_blocks.len(), 1);
    }
}
