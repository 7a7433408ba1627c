// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod approval;
mod bridge;
mod checkpoint;
mod compact;
mod events;
mod parser;
mod prompts;
mod runtime_context;
mod session;

pub use agent::Agent;
pub use approval::{ApprovalDecision, ApprovalGate, ApprovalRequest, GateOutcome, SHELL_TOOL_NAME};
pub use bridge::{BridgeError, BridgeHandle, BridgeMessage, ChangeDecision, EditorBridge};
pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointMetadata, ToolExecutionRecord, CHECKPOINT_SCHEMA_VERSION,
};
pub use compact::{
    compact_session, compact_session_with_strategy, emergency_compact, smart_truncate,
};
pub use events::{AgentEvent, CompactionStrategyUsed, ContextPressureLevel};
pub use parser::extract_tool_calls;
pub use prompts::system_prompt;
pub use runtime_context::AgentRuntimeContext;
pub use session::{Session, TurnRecord};
