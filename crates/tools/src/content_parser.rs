//! Streamed Content Parsing
//!
//! The chat backend embeds machine directives inside otherwise free-form
//! answer text: tool invocations arrive as fenced code blocks whose body is a
//! JSON object with a `tool_call.name` field, and reasoning is separated from
//! the answer by a `--` line or an `Answer:` label.
//!
//! Everything here is a pure function over complete text. Nothing fails: a
//! block that does not parse is simply not a tool call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const FENCE: &str = "```";

/// A tool call parsed from a fenced block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Name of the invoked tool
    pub name: String,
    /// Arguments object (empty object when the block carries none)
    pub arguments: Value,
}

/// Reasoning and answer portions of a response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThinkingAnswer {
    pub thinking: String,
    pub answer: String,
}

/// Outcome of [`is_tool_call_only`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallOnly {
    pub is_only: bool,
    pub name: Option<String>,
}

/// A fenced code block located in a text, as byte offsets.
#[derive(Debug, Clone, Copy)]
struct FencedBlock<'a> {
    start: usize,
    end: usize,
    body: &'a str,
}

/// Locate every closed fenced block.
///
/// An unterminated trailing fence (the normal state while a block is still
/// streaming) is ignored.
fn fenced_blocks(text: &str) -> Vec<FencedBlock<'_>> {
    let mut blocks = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = text[cursor..].find(FENCE) {
        let start = cursor + rel;
        let after_open = start + FENCE.len();
        let rest = &text[after_open..];

        // Skip the info string (```json, ```tool_call) but not an inline body (```{...}```)
        let info_len = rest
            .find(|c: char| c.is_whitespace() || c == '{' || c == '[' || c == '`')
            .unwrap_or(rest.len());
        let body_start = after_open + info_len;

        let Some(close_rel) = text[body_start..].find(FENCE) else {
            break;
        };
        let body_end = body_start + close_rel;
        let end = body_end + FENCE.len();

        blocks.push(FencedBlock {
            start,
            end,
            body: text[body_start..body_end].trim(),
        });
        cursor = end;
    }

    blocks
}

/// Parse a block body as a tool call.
fn parse_tool_call_body(body: &str) -> Option<ToolCall> {
    let json: Value = serde_json::from_str(body).ok()?;
    let call = json.get("tool_call")?;
    let name = call.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    let arguments = call
        .get("arguments")
        .filter(|v| !v.is_null())
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));
    Some(ToolCall {
        name: name.to_string(),
        arguments,
    })
}

/// Tool-call blocks of a text together with their spans.
fn tool_call_blocks(text: &str) -> Vec<(FencedBlock<'_>, ToolCall)> {
    fenced_blocks(text)
        .into_iter()
        .filter_map(|block| parse_tool_call_body(block.body).map(|call| (block, call)))
        .collect()
}

/// Rebuild `text` with every tool-call block replaced by `replace(call)`.
fn rewrite_tool_calls(text: &str, replace: impl Fn(&ToolCall) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (block, call) in tool_call_blocks(text) {
        out.push_str(&text[cursor..block.start]);
        out.push_str(&replace(&call));
        cursor = block.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Find the split point between reasoning and answer.
///
/// Returns `(thinking_end, answer_start)` byte offsets. Separators are tried in
/// priority order: a `--` line, an `Answer:` line, then an inline `Answer:` label.
/// Label matching is ASCII case-insensitive; lowering ASCII keeps byte offsets stable.
fn find_split(text: &str) -> Option<(usize, usize)> {
    const DASH_LINE: &str = "\n--\n";
    const ANSWER_LINE: &str = "\nanswer:\n";
    const ANSWER_LABEL: &str = "answer:";
    const FINAL_PREFIX: &str = "final ";

    if let Some(i) = text.find(DASH_LINE) {
        return Some((i, i + DASH_LINE.len()));
    }

    let lower = text.to_ascii_lowercase();
    if let Some(i) = lower.find(ANSWER_LINE) {
        return Some((i, i + ANSWER_LINE.len()));
    }

    // `Final Answer:` is caught here too; its `Final ` prefix is part of the label.
    if let Some(i) = lower.find(ANSWER_LABEL) {
        let thinking_end = if lower[..i].ends_with(FINAL_PREFIX) {
            i - FINAL_PREFIX.len()
        } else {
            i
        };
        return Some((thinking_end, i + ANSWER_LABEL.len()));
    }

    None
}

/// Split a response into reasoning and answer.
///
/// With no separator present the whole text is the answer.
pub fn separate_thinking_and_answer(text: &str) -> ThinkingAnswer {
    match find_split(text) {
        Some((thinking_end, answer_start)) => ThinkingAnswer {
            thinking: text[..thinking_end].trim().to_string(),
            answer: text[answer_start..].trim().to_string(),
        },
        None => ThinkingAnswer {
            thinking: String::new(),
            answer: text.trim().to_string(),
        },
    }
}

/// The user-facing answer of a finished response: tool-call blocks removed,
/// then only the portion after the reasoning separator.
pub fn parse_final_answer(text: &str) -> String {
    let stripped = rewrite_tool_calls(text, |_| String::new());
    separate_thinking_and_answer(&stripped).answer
}

/// All tool calls embedded in a text, in order of appearance.
pub fn extract_tool_calls(text: &str) -> Vec<ToolCall> {
    tool_call_blocks(text).into_iter().map(|(_, call)| call).collect()
}

/// Whether the entire (trimmed) text is exactly one tool-call block.
pub fn is_tool_call_only(text: &str) -> ToolCallOnly {
    let trimmed = text.trim();
    let blocks = tool_call_blocks(trimmed);
    match blocks.as_slice() {
        [(block, call)] if block.start == 0 && block.end == trimmed.len() => ToolCallOnly {
            is_only: true,
            name: Some(call.name.clone()),
        },
        _ => ToolCallOnly::default(),
    }
}

/// Replace every tool-call block with a short `Tool call: <name>` line.
pub fn strip_tool_call_markers(text: &str) -> String {
    rewrite_tool_calls(text, |call| format!("Tool call: {}", call.name))
}
