// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Conversation ↔ Markdown: serialise `ChatSegment`s to the display-markdown
//! format used by the Neovim buffer, and parse that format back to `Message`s
//! for edit-and-resubmit.

use std::collections::HashMap;

use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use sven_model::{FunctionCall, Message, MessageContent, Role};
use sven_tools::TodoItem;

use crate::chat::segment::ChatSegment;
use crate::markdown::StyledLines;

// ── Format helpers ────────────────────────────────────────────────────────────

/// Format todo items as markdown for conversation display.
pub fn format_todos_markdown(todos: &[TodoItem]) -> String {
    let mut result = String::from("\n**Todo List Updated:**\n\n");
    for todo in todos {
        result.push_str(&format!(
            "- **{}**: {} (id: {})\n",
            todo.status.to_uppercase(),
            todo.content,
            todo.id
        ));
    }
    result.push('\n');
    result
}

/// Format a single `ChatSegment` as markdown for display.
pub fn segment_to_markdown(seg: &ChatSegment, tool_args_cache: &HashMap<String, String>) -> String {
    match seg {
        ChatSegment::Message(m) => message_to_markdown(m, tool_args_cache),
        ChatSegment::ContextCompacted { tokens_before, tokens_after, strategy, turn } => {
            use sven_core::CompactionStrategyUsed;
            let label = match strategy {
                CompactionStrategyUsed::Structured => "Context compacted (structured)",
                CompactionStrategyUsed::Narrative => "Context compacted (narrative)",
                CompactionStrategyUsed::Emergency => "⚠ Context emergency-compacted",
            };
            let turn_note = if *turn > 0 {
                format!(" · tool round {turn}")
            } else {
                String::new()
            };
            format!(
                "\n---\n*{label}: {tokens_before} → {tokens_after} tokens{turn_note}*\n\n"
            )
        }
        ChatSegment::Error(msg) => format!("\n**Error**: {msg}\n\n"),
        ChatSegment::Thinking { content } => {
            format!("\n**Agent:thinking**\n💭 **Thought**\n```\n{}\n```\n", content)
        }
    }
}

/// Render a single-line collapsed preview for a segment (ratatui-only mode).
pub fn collapsed_preview(seg: &ChatSegment, tool_args_cache: &HashMap<String, String>) -> String {
    match seg {
        ChatSegment::Message(m) => match (&m.role, &m.content) {
            // User / assistant text: first line, up to 80 chars
            (Role::User, MessageContent::Text(t)) => {
                let first = t.lines().next().unwrap_or("").trim();
                let preview: String = first.chars().take(80).collect();
                let has_more = first.chars().count() > 80 || t.contains('\n');
                let ellipsis = if has_more { "…" } else { "" };
                format!("\n**User:** `{preview}{ellipsis}` ▶ click to expand\n")
            }
            (Role::Assistant, MessageContent::Text(t)) => {
                let first = t.lines().next().unwrap_or("").trim();
                let preview: String = first.chars().take(80).collect();
                let has_more = first.chars().count() > 80 || t.contains('\n');
                let ellipsis = if has_more { "…" } else { "" };
                format!("\n**Agent:** `{preview}{ellipsis}` ▶ click to expand\n")
            }
            (Role::Assistant, MessageContent::ToolCall { tool_call_id, function }) => {
                let args_preview = serde_json::from_str::<serde_json::Value>(&function.arguments)
                    .map(|v| {
                        if let serde_json::Value::Object(map) = &v {
                            let parts: Vec<String> = map.iter().take(2).map(|(k, val)| {
                                let s = match val {
                                    serde_json::Value::String(s) =>
                                        s.chars().take(40).collect::<String>(),
                                    other =>
                                        other.to_string().chars().take(40).collect::<String>(),
                                };
                                format!("{}={}", k, s)
                            }).collect();
                            parts.join(" ")
                        } else {
                            function.arguments.chars().take(60).collect::<String>()
                        }
                    })
                    .unwrap_or_else(|_| function.arguments.chars().take(60).collect::<String>());
                format!(
                    "\n**Agent:tool_call:{}**\n🔧 **Tool Call: {}** `{}` ▶ click to expand\n",
                    tool_call_id, function.name, args_preview
                )
            }
            (Role::Tool, MessageContent::ToolResult { tool_call_id, content }) => {
                let tool_name = tool_args_cache
                    .get(tool_call_id)
                    .map(|s| s.as_str())
                    .unwrap_or("tool");
                let content_text = content.to_string();
                let preview: String =
                    content_text.lines().next().unwrap_or("").chars().take(80).collect();
                let truncated = if content_text.len() > preview.len() + 1 { "…" } else { "" };
                format!(
                    "\n**Tool:{}**\n✅ **Tool Response: {}** `{}{}` ▶ click to expand\n",
                    tool_call_id, tool_name, preview, truncated
                )
            }
            _ => segment_to_markdown(seg, tool_args_cache),
        },
        ChatSegment::Thinking { content } => {
            let preview: String =
                content.lines().next().unwrap_or("").chars().take(80).collect();
            let truncated = if content.len() > preview.len() + 1 { "…" } else { "" };
            format!(
                "\n**Agent:thinking**\n💭 **Thought** `{}{}` ▶ click to expand\n",
                preview, truncated
            )
        }
        _ => segment_to_markdown(seg, tool_args_cache),
    }
}

/// Format the full conversation as a single markdown string (used for the
/// Neovim buffer content).
pub fn format_conversation(
    segments: &[ChatSegment],
    streaming_buffer: &str,
    tool_args_cache: &HashMap<String, String>,
) -> String {
    let mut result = String::new();
    for (i, seg) in segments.iter().enumerate() {
        let md = segment_to_markdown(seg, tool_args_cache);
        if i == 0 && md.starts_with('\n') {
            result.push_str(md.trim_start_matches('\n'));
        } else {
            result.push_str(&md);
        }
    }
    if !streaming_buffer.is_empty() {
        result.push_str("**Agent:** ");
        result.push_str(streaming_buffer);
    }
    result
}

/// Return `(bar_style, dim)` for a segment used to draw the per-segment colour
/// bar in the ratatui-only chat pane.
pub fn segment_bar_style(seg: &ChatSegment) -> (Option<Style>, bool) {
    match seg {
        ChatSegment::Message(m) => match (&m.role, &m.content) {
            (Role::User, MessageContent::Text(_)) =>
                (Some(Style::default().fg(Color::Green)), false),
            (Role::Assistant, MessageContent::Text(_)) =>
                (Some(Style::default().fg(Color::Blue)), false),
            (Role::Assistant, MessageContent::ToolCall { .. }) =>
                (Some(Style::default().fg(Color::Yellow)), false),
            (Role::Tool, MessageContent::ToolResult { .. }) =>
                (Some(Style::default().fg(Color::Yellow)), false),
            _ => (None, false),
        },
        ChatSegment::Thinking { .. } =>
            (Some(Style::default().fg(Color::Magenta)), false),
        ChatSegment::Error(_) =>
            (Some(Style::default().fg(Color::Red)), false),
        _ => (None, false),
    }
}

/// Prepend a coloured bar to every line and optionally apply `DIM` to content.
pub fn apply_bar_and_dim(
    lines: StyledLines,
    bar_style: Option<Style>,
    dim: bool,
    bar_char: &str,
) -> StyledLines {
    let modifier = if dim { Modifier::DIM } else { Modifier::empty() };
    lines
        .into_iter()
        .map(|line| {
            let mut spans = Vec::new();
            if let Some(style) = bar_style {
                spans.push(Span::styled(bar_char.to_string(), style));
            }
            for s in line.spans {
                spans.push(Span::styled(
                    s.content.to_string(),
                    s.style.patch(Style::default().add_modifier(modifier)),
                ));
            }
            Line::from(spans)
        })
        .collect()
}

/// Format a single `Message` as markdown.  This is the per-message building
/// block for `format_conversation` and the round-trip parse tests.
pub(crate) fn message_to_markdown(m: &Message, tool_args_cache: &HashMap<String, String>) -> String {
    match (&m.role, &m.content) {
        (Role::User, MessageContent::Text(t)) =>
            format!("---\n\n**You:** {}\n", t),
        (Role::Assistant, MessageContent::Text(t)) =>
            format!("\n**Agent:** {}\n", t),
        (Role::Assistant, MessageContent::ToolCall { tool_call_id, function }) => {
            let pretty_args = serde_json::from_str::<serde_json::Value>(&function.arguments)
                .and_then(|v| serde_json::to_string_pretty(&v))
                .unwrap_or_else(|_| function.arguments.clone());
            format!(
                "\n**Agent:tool_call:{}**\n🔧 **Tool Call: {}**\n```json\n{}\n```\n",
                tool_call_id, function.name, pretty_args
            )
        }
        (Role::Tool, MessageContent::ToolResult { tool_call_id, content }) => {
            let tool_name = tool_args_cache
                .get(tool_call_id)
                .map(|s| s.as_str())
                .unwrap_or("tool");
            format!(
                "\n**Tool:{}**\n✅ **Tool Response: {}**\n```\n{}\n```\n",
                tool_call_id, tool_name, content
            )
        }
        (Role::System, MessageContent::Text(t)) =>
            format!("**System:** {}\n\n", t),
        _ => String::new(),
    }
}

// ── Parse helpers ─────────────────────────────────────────────────────────────

/// Parse a markdown buffer back into structured `Message`s for resubmit.
///
/// This is the inverse of `format_conversation` / `message_to_markdown`,
/// enabling lossless round-trip editing in the Neovim buffer.
pub fn parse_markdown_to_messages(markdown: &str) -> Result<Vec<Message>, String> {
    let mut messages = Vec::new();
    let lines: Vec<&str> = markdown.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim();
        if line.is_empty() || line == "---" {
            i += 1;
            continue;
        }
        if let Some(msg) = parse_message_at_line(&lines, &mut i)? {
            messages.push(msg);
        } else {
            i += 1;
        }
    }
    Ok(messages)
}

fn parse_message_at_line(lines: &[&str], i: &mut usize) -> Result<Option<Message>, String> {
    if *i >= lines.len() {
        return Ok(None);
    }
    let line = lines[*i].trim();

    if line.starts_with("**You:**") {
        let text = extract_text_content(lines, i, "**You:**")?;
        return Ok(Some(Message::user(text)));
    }

    if line.starts_with("**Agent:tool_call:") {
        let tool_call_id = line
            .strip_prefix("**Agent:tool_call:")
            .and_then(|s| s.strip_suffix("**"))
            .ok_or_else(|| format!("Malformed tool_call header: {}", line))?
            .trim()
            .to_string();
        *i += 1;
        skip_until_code_fence(lines, i);
        let arguments = extract_code_block(lines, i)?;
        let name = extract_tool_name_from_previous_lines(lines, *i)?;
        return Ok(Some(Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id,
                function: FunctionCall { name, arguments },
            },
        }));
    }

    if line.starts_with("**Tool:") {
        let tool_call_id = line
            .strip_prefix("**Tool:")
            .and_then(|s| s.strip_suffix("**"))
            .ok_or_else(|| format!("Malformed tool result header: {}", line))?
            .trim()
            .to_string();
        *i += 1;
        skip_until_code_fence(lines, i);
        let content = extract_code_block(lines, i)?;
        return Ok(Some(Message {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id,
                content: sven_model::ToolResultContent::Text(content),
            },
        }));
    }

    if line.starts_with("**Agent:**") {
        let text = extract_text_content(lines, i, "**Agent:**")?;
        return Ok(Some(Message::assistant(text)));
    }

    if line.starts_with("**System:**") {
        let text = extract_text_content(lines, i, "**System:**")?;
        return Ok(Some(Message::system(text)));
    }

    Ok(None)
}

fn extract_text_content(lines: &[&str], i: &mut usize, prefix: &str) -> Result<String, String> {
    let first_line = lines[*i].trim();
    let inline_text = first_line.strip_prefix(prefix).map(|s| s.trim()).unwrap_or("");
    let mut text = String::from(inline_text);
    *i += 1;
    // Track consecutive blank lines so they can be reproduced faithfully.
    // Trailing blank lines are discarded (never flushed after the last non-blank
    // line before a section header or end of input).
    let mut pending_blanks: usize = 0;
    while *i < lines.len() {
        let line = lines[*i];
        let trimmed = line.trim();
        if is_message_header(trimmed) {
            break;
        }
        if trimmed.is_empty() {
            pending_blanks += 1;
        } else {
            if !text.is_empty() {
                // One '\n' for the normal line separator, then one per blank line.
                text.push('\n');
                for _ in 0..pending_blanks {
                    text.push('\n');
                }
            }
            pending_blanks = 0;
            text.push_str(trimmed);
        }
        *i += 1;
    }
    Ok(text)
}

/// Returns true when `line` is a message-section delimiter that should stop
/// continuation-text accumulation.  Only the known role-header patterns and
/// the `---` turn separator qualify; generic `**bold**` markdown does NOT.
fn is_message_header(line: &str) -> bool {
    line == "---"
        || line.starts_with("**You:")
        || line.starts_with("**Agent:")
        || line.starts_with("**Tool:")
        || line.starts_with("**System:")
}

fn skip_until_code_fence(lines: &[&str], i: &mut usize) {
    while *i < lines.len() {
        if lines[*i].trim().starts_with("```") {
            return;
        }
        *i += 1;
    }
}

fn extract_code_block(lines: &[&str], i: &mut usize) -> Result<String, String> {
    if *i >= lines.len() || !lines[*i].trim().starts_with("```") {
        return Err(format!("Expected code fence at line {}", i));
    }
    *i += 1;
    let mut content = String::new();
    while *i < lines.len() {
        let line = lines[*i];
        if line.trim().starts_with("```") {
            *i += 1;
            return Ok(content.trim_end().to_string());
        }
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(line);
        *i += 1;
    }
    Err("Unclosed code block".to_string())
}

/// Scans backward from `current` to find the `🔧 **Tool Call: name**` display
/// line.  Bounded by section separators so it never bleeds into a prior segment.
fn extract_tool_name_from_previous_lines(lines: &[&str], current: usize) -> Result<String, String> {
    for j in (0..current).rev() {
        let line = lines[j].trim();
        if let Some(rest) = line.strip_prefix("🔧 **Tool Call:") {
            if let Some(name) = rest.strip_suffix("**") {
                return Ok(name.trim().to_string());
            }
        }
        if line == "---"
            || line.starts_with("**Agent:")
            || line.starts_with("**You:")
            || line.starts_with("**Tool:")
        {
            break;
        }
    }
    Err("Could not find tool name in previous lines".to_string())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
