// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use sven_config::AgentMode;
use sven_tools::{events::TodoItem, ToolCall};

/// Which compaction strategy actually ran for a given turn.
///
/// Distinct from [`sven_config::CompactionStrategy`], which is the user's
/// configured *preference*: a configured `Structured`/`Narrative` strategy
/// still falls back to `Emergency` when the session is too large for a
/// compaction prompt to fit the model's own context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    Structured,
    Narrative,
    Emergency,
}

/// How close the session is to its context window, per the configured
/// `context_warn_percent` / `context_critical_percent` thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPressureLevel {
    Warn,
    Critical,
}

/// Events emitted by the engine during a single turn.
/// Consumers (CLI, editor bridge) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A thinking/reasoning chunk from the model (extended thinking API).
    /// Consumers should accumulate deltas and finalise them into a Thinking
    /// segment when the model signals the end of the reasoning block.
    ThinkingDelta(String),
    /// A complete thinking/reasoning block (accumulated from ThinkingDelta events).
    ThinkingComplete(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compacted; statistics for the UI
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
        strategy: CompactionStrategyUsed,
        turn: u32,
    },
    /// Current token usage update
    TokenUsage {
        input: u32,
        output: u32,
        /// Tokens served from the provider's prompt cache this turn.
        cache_read: u32,
        /// Tokens written into the provider's prompt cache this turn.
        cache_write: u32,
        /// Cumulative cache-read tokens for the session so far.
        cache_read_total: u32,
        /// Cumulative cache-write tokens for the session so far.
        cache_write_total: u32,
        /// The session's context window, for computing remaining headroom.
        max_tokens: usize,
    },
    /// The agent has finished processing the current user turn
    TurnComplete,
    /// The turn was cancelled before it completed naturally; `partial_text`
    /// carries whatever was streamed before cancellation (possibly empty),
    /// and has already been committed to session history as an assistant
    /// message so a resubmitted turn sees it.
    Aborted { partial_text: String },
    /// A recoverable error occurred
    Error(String),
    /// The todo list was updated
    TodoUpdate(Vec<TodoItem>),
    /// The agent mode was changed
    ModeChanged(AgentMode),
    /// The agent is asking the user a question (id links to QuestionAnswer)
    Question { id: String, questions: Vec<String> },
    /// Answer to a previous Question event
    QuestionAnswer { id: String, answer: String },
    /// A tool call needs a user decision before it can run. The id links to
    /// whichever `ApprovalRequest.decision_tx` the front-end was handed via
    /// the approval channel; this event exists only so passive observers
    /// (a log pane, the editor bridge) can reflect the pending call without
    /// themselves owning the decision channel.
    ApprovalRequired { call_id: String, tool_name: String },
    /// The session has crossed a context-window pressure threshold this turn.
    ContextPressure {
        level: ContextPressureLevel,
        fraction: f32,
    },
}
