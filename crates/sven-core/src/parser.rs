// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Two-pass tool-call parser for free-text model output.
//!
//! Some fine-tuned models occasionally fall back to writing a tool call as
//! plain text instead of using the provider's structured tool-call protocol
//! (see `text_contains_malformed_tool_call` in `agent.rs`, which only
//! detects the problem). This module recovers the call so the agent loop can
//! dispatch it instead of just nudging the model to try again.
//!
//! Pass 1 (strict) matches well-formed, closed blocks:
//! - `<tool_call>{"name": ..., "arguments": {...}}</tool_call>` (Qwen)
//! - `<function=name>{...}</function>` (Hermes/Nous, args-only JSON body)
//!
//! Pass 2 (heuristic) runs only on what pass 1 left behind, and tolerates a
//! missing closing tag (the model was cut off mid-stream) or the
//! `[TOOL_CALL]` marker some other fine-tunes use.
//!
//! `extract_tool_calls` removes every block it recognises — whichever pass
//! matched it — from the returned text, so calling it again on that text
//! yields no further calls and an unchanged string.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use sven_tools::ToolCall;

fn strict_tool_call_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<tool_call>\s*(\{.*?\})\s*</tool_call>").expect("valid regex"))
}
fn strict_function_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<function=([a-zA-Z_][a-zA-Z0-9_]*)>\s*(\{.*?\})\s*</function>")
            .expect("valid regex")
    })
}
fn heuristic_unclosed_tool_call() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<tool_call>\s*(\{.*\})\s*$").expect("valid regex"))
}
fn heuristic_bracket_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\[TOOL_CALL\]\s*(\{.*?\})(?:\s*\[TOOL_CALL\]|\s*$)").expect("valid regex")
    })
}

/// Parse any recognisable tool calls out of free-text model output.
///
/// Returns the calls found, in the order they appear in `text`, and the
/// remaining text with every recognised block removed and surrounding
/// whitespace collapsed. Idempotent: feeding the remaining text back in
/// yields `(vec![], remaining)` unchanged.
pub fn extract_tool_calls(text: &str) -> (Vec<ToolCall>, String) {
    let mut calls = Vec::new();
    let mut remaining = text.to_string();

    remaining = extract_with(strict_tool_call_tag(), &remaining, &mut calls, |caps| {
        parse_name_and_arguments(caps.get(1)?.as_str())
    });
    remaining = extract_with(strict_function_tag(), &remaining, &mut calls, |caps| {
        let name = caps.get(1)?.as_str().to_string();
        let args: Value = serde_json::from_str(caps.get(2)?.as_str()).ok()?;
        Some((name, args))
    });

    // Heuristic pass only sees what survived the strict pass.
    remaining = extract_with(heuristic_unclosed_tool_call(), &remaining, &mut calls, |caps| {
        parse_name_and_arguments(caps.get(1)?.as_str())
    });
    remaining = extract_with(heuristic_bracket_marker(), &remaining, &mut calls, |caps| {
        parse_name_and_arguments(caps.get(1)?.as_str())
    });

    (calls, collapse_blank_lines(&remaining))
}

/// Run one regex pass, pushing a `ToolCall` for every match `extract` can
/// turn into `(name, arguments)`, and return the text with all matches
/// (whether or not `extract` succeeded on them) removed.
fn extract_with(
    re: &Regex,
    text: &str,
    calls: &mut Vec<ToolCall>,
    extract: impl Fn(&regex::Captures) -> Option<(String, Value)>,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_end = 0;
    for caps in re.captures_iter(text) {
        let m = caps.get(0).expect("whole match always present");
        out.push_str(&text[last_end..m.start()]);
        if let Some((name, args)) = extract(&caps) {
            calls.push(ToolCall {
                id: format!("tc_recovered_{}", uuid::Uuid::new_v4()),
                name,
                args,
            });
        }
        last_end = m.end();
    }
    out.push_str(&text[last_end..]);
    out
}

/// Parse a `{"name": "...", "arguments": {...}}` (or `"parameters"`) object,
/// as emitted inside `<tool_call>` tags.
fn parse_name_and_arguments(json_str: &str) -> Option<(String, Value)> {
    let v: Value = serde_json::from_str(json_str).ok()?;
    let name = v.get("name")?.as_str()?.to_string();
    let args = v
        .get("arguments")
        .or_else(|| v.get("parameters"))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    Some((name, args))
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_qwen_style_tool_call() {
        let text = r#"Let me check that.
<tool_call>
{"name": "read_file", "arguments": {"path": "src/lib.rs"}}
</tool_call>
"#;
        let (calls, remaining) = extract_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].args["path"], "src/lib.rs");
        assert_eq!(remaining, "Let me check that.");
    }

    #[test]
    fn extracts_hermes_style_function_tag() {
        let text = r#"<function=write_file>{"path": "a.txt", "content": "hi"}</function>"#;
        let (calls, remaining) = extract_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "write_file");
        assert_eq!(calls[0].args["content"], "hi");
        assert!(remaining.is_empty());
    }

    #[test]
    fn extracts_unclosed_tool_call_via_heuristic_pass() {
        // Model got cut off before the closing tag.
        let text = r#"<tool_call>
{"name": "list_dir", "arguments": {"path": "."}}"#;
        let (calls, _) = extract_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "list_dir");
    }

    #[test]
    fn extracts_bracket_marker_style() {
        let text = r#"[TOOL_CALL]{"name": "grep", "arguments": {"pattern": "foo"}}[TOOL_CALL]"#;
        let (calls, _) = extract_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "grep");
    }

    #[test]
    fn plain_text_yields_no_calls_and_is_unchanged() {
        let text = "Just a normal response with no tool calls at all.";
        let (calls, remaining) = extract_tool_calls(text);
        assert!(calls.is_empty());
        assert_eq!(remaining, text);
    }

    #[test]
    fn malformed_json_inside_tags_is_dropped_not_panicking() {
        let text = "<tool_call>{not valid json</tool_call>trailing text";
        let (calls, remaining) = extract_tool_calls(text);
        assert!(calls.is_empty());
        assert_eq!(remaining, "trailing text");
    }

    /// Property: re-running the parser on its own leftover text never finds
    /// more calls and never changes the text further.
    #[test]
    fn idempotent_cleaning_property() {
        let samples = [
            r#"<tool_call>{"name": "a", "arguments": {}}</tool_call>trailing"#,
            r#"<function=b>{"x": 1}</function>\n\nmore text"#,
            "no tool call markup here",
            r#"[TOOL_CALL]{"name": "c", "arguments": {"y": 2}}[TOOL_CALL]tail"#,
        ];
        for sample in samples {
            let (_, once) = extract_tool_calls(sample);
            let (calls_twice, twice) = extract_tool_calls(&once);
            assert!(calls_twice.is_empty(), "sample: {sample}");
            assert_eq!(once, twice, "sample: {sample}");
        }
    }

    #[test]
    fn multiple_calls_extracted_in_order() {
        let text = r#"<tool_call>{"name": "a", "arguments": {}}</tool_call>
<tool_call>{"name": "b", "arguments": {}}</tool_call>"#;
        let (calls, _) = extract_tool_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[1].name, "b");
    }
}
