// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Approval gate: decides which tool calls the model may run immediately and
//! which need a user decision first.
//!
//! Distinct from [`sven_tools::policy::ToolPolicy`], which only classifies a
//! shell command string against glob patterns. The gate combines that
//! per-command classification with a tool's own [`ApprovalPolicy`], the
//! active [`DevelopmentMode`], and per-session "approved for session" state
//! that the policy and registry never see.

use std::collections::HashSet;

use tokio::sync::oneshot;

use sven_config::DevelopmentMode;
use sven_tools::{policy::ApprovalPolicy, Tool, ToolCall};

/// Name of the tool that always requires approval regardless of mode.
pub const SHELL_TOOL_NAME: &str = "shell";

/// Sent to whichever front-end owns interactive approval (TUI, CLI prompt)
/// when a tool call needs a user decision before it can run. Mirrors
/// `sven_tools::builtin::ask_question::QuestionRequest`'s request/oneshot-
/// reply shape: the front-end answers by sending one `ApprovalDecision` back
/// through `decision_tx`.
pub struct ApprovalRequest {
    pub call: ToolCall,
    pub tool_description: String,
    pub decision_tx: oneshot::Sender<ApprovalDecision>,
}

/// Per-call user decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Pending,
    Approved,
    ApprovedForSession,
    Rejected,
}

/// Outcome of gating a single tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Run the call immediately without asking.
    AutoExecute,
    /// The call needs a user decision before it can run.
    NeedsApproval,
}

/// Tracks which tool names have been approved for the rest of the session.
///
/// This is gate-local, in-memory state: it is never written to the tool
/// registry (which stays read-only after construction) and never persisted
/// to a checkpoint.
#[derive(Debug, Default)]
pub struct ApprovalGate {
    approved_for_session: HashSet<String>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `call` should run immediately or wait for the user.
    ///
    /// `args_valid` reflects the tool's own argument validation (e.g. schema
    /// check); invalid arguments are always routed to direct execution so the
    /// model sees the validation error on its next turn instead of stalling
    /// on an approval prompt for a call that can never succeed.
    pub fn decide(
        &self,
        tool: &dyn Tool,
        call: &ToolCall,
        mode: DevelopmentMode,
        args_valid: bool,
    ) -> GateOutcome {
        if !args_valid {
            return GateOutcome::AutoExecute;
        }
        if tool.default_policy() == ApprovalPolicy::Deny {
            // A denied tool still executes directly: the tool itself is
            // responsible for returning an error result, the gate does not
            // silently drop the call.
            return GateOutcome::AutoExecute;
        }
        if self.approved_for_session.contains(&call.name) {
            return GateOutcome::AutoExecute;
        }
        if tool.name() == SHELL_TOOL_NAME {
            return GateOutcome::NeedsApproval;
        }
        match mode {
            DevelopmentMode::Plan => GateOutcome::NeedsApproval,
            DevelopmentMode::AutoAccept => GateOutcome::AutoExecute,
            DevelopmentMode::Normal => match tool.default_policy() {
                ApprovalPolicy::Auto => GateOutcome::AutoExecute,
                ApprovalPolicy::Ask | ApprovalPolicy::Deny => GateOutcome::NeedsApproval,
            },
        }
    }

    /// Partition a batch of calls into (auto-execute, needs-approval), in
    /// original order within each group.
    pub fn partition(
        &self,
        tools: &sven_tools::ToolRegistry,
        calls: &[ToolCall],
        mode: DevelopmentMode,
    ) -> (Vec<ToolCall>, Vec<ToolCall>) {
        let mut auto = Vec::new();
        let mut needs_approval = Vec::new();
        for call in calls {
            let Some(tool) = tools.get(&call.name) else {
                // Unknown tool: let execution handle it and report the error.
                auto.push(call.clone());
                continue;
            };
            match self.decide(tool.as_ref(), call, mode, true) {
                GateOutcome::AutoExecute => auto.push(call.clone()),
                GateOutcome::NeedsApproval => needs_approval.push(call.clone()),
            }
        }
        (auto, needs_approval)
    }

    /// Record the user's decision for one call. `Approved`/`Pending`/
    /// `Rejected` affect only this call; `ApprovedForSession` additionally
    /// marks the tool name so future calls to it auto-execute.
    pub fn record_decision(&mut self, tool_name: &str, decision: ApprovalDecision) {
        if decision == ApprovalDecision::ApprovedForSession {
            self.approved_for_session.insert(tool_name.to_string());
        }
    }

    pub fn is_approved_for_session(&self, tool_name: &str) -> bool {
        self.approved_for_session.contains(tool_name)
    }

    /// Synthesize the tool result content for a call the user rejected.
    pub fn rejection_message(tool_name: &str) -> String {
        format!("tool call \"{tool_name}\" was rejected by the user")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
