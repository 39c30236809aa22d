//! Agent Chat Tools
//!
//! Content parsing for streamed chat answers. The backend embeds tool-call
//! directives as fenced JSON blocks inside free-form text; this crate finds,
//! strips and summarizes them, and separates reasoning from the final answer.
//!
//! All functions are pure and infallible so they can run on every finalized
//! response without error plumbing.

pub mod content_parser;

pub use content_parser::{
    extract_tool_calls, is_tool_call_only, parse_final_answer, separate_thinking_and_answer,
    strip_tool_call_markers, ThinkingAnswer, ToolCall, ToolCallOnly,
};
