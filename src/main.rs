// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use sven_config::{Config, LogFormat};
use sven_core::{
    Agent, AgentEvent, AgentRuntimeContext, ApprovalDecision, ApprovalRequest, Checkpoint,
    EditorBridge,
};
use sven_tools::{
    events::ToolEvent, DeleteFileTool, EditFileTool, GlobTool, GrepTool, ListDirTool,
    ReadFileTool, RunTerminalCommandTool, SwitchModeTool, TodoItem, TodoWriteTool, ToolRegistry,
    WriteTool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = sven_config::load(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);

    if let Some(Commands::ShowConfig) = cli.command {
        println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
        return Ok(());
    }

    let model_cfg = match &cli.model {
        Some(ov) => sven_model::resolve_model_cfg(&config.model, ov),
        None => config.model.clone(),
    };
    let model: Arc<dyn sven_model::ModelProvider> = Arc::from(sven_model::from_config(&model_cfg)?);

    let mut agent_config = config.agent.clone();
    agent_config.non_interactive = agent_config.non_interactive || cli.non_interactive;
    let agent_config = Arc::new(agent_config);

    let runtime = build_runtime_context(&config);

    let mode_lock = Arc::new(Mutex::new(cli.mode));
    let (tool_event_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);
    let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));

    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool).context("registering read_file")?;
    registry.register(WriteTool).context("registering write_file")?;
    registry.register(EditFileTool).context("registering edit_file")?;
    registry
        .register(DeleteFileTool)
        .context("registering delete_file")?;
    registry.register(ListDirTool).context("registering list_dir")?;
    registry.register(GlobTool).context("registering glob")?;
    registry.register(GrepTool).context("registering grep")?;
    registry
        .register(RunTerminalCommandTool {
            timeout_secs: config.tools.timeout_secs,
        })
        .context("registering run_terminal_command")?;
    registry
        .register(TodoWriteTool::new(todos, tool_event_tx.clone()))
        .context("registering todo_write")?;
    registry
        .register(SwitchModeTool::new(mode_lock.clone(), tool_event_tx))
        .context("registering switch_mode")?;

    let context_window = model.catalog_context_window().unwrap_or(128_000) as usize;

    let mut agent = Agent::new(
        model,
        Arc::new(registry),
        agent_config.clone(),
        runtime,
        mode_lock,
        tool_event_rx,
        context_window,
    );

    if let Some(path) = &cli.resume {
        let checkpoint = Checkpoint::load(path)
            .with_context(|| format!("loading checkpoint {}", path.display()))?;
        agent.restore_checkpoint(checkpoint);
    }

    if !agent_config.non_interactive {
        agent.set_approval_channel(spawn_approval_prompt());
    }

    if config.editor.enabled {
        match EditorBridge::bind(&config.editor).await {
            Ok(bridge) => agent.set_bridge(bridge.handle()),
            Err(e) => tracing::warn!("editor bridge disabled: {e}"),
        }
    }

    let result = run_turns(&mut agent, cli.prompt).await;

    if let Some(path) = &cli.checkpoint {
        let turns = *result.as_ref().unwrap_or(&0);
        agent
            .checkpoint(turns)
            .save(path)
            .with_context(|| format!("writing checkpoint {}", path.display()))?;
    }

    result.map(|_| ())
}

/// Drive one or more turns through the agent, streaming events to stdout.
/// Returns the number of turns run, so the caller can stamp a checkpoint.
///
/// With an initial prompt, runs exactly that one turn. Otherwise reads
/// additional turns from stdin, one per line, until EOF.
async fn run_turns(agent: &mut Agent, initial_prompt: Option<String>) -> anyhow::Result<u32> {
    if let Some(prompt) = initial_prompt {
        run_one_turn(agent, &prompt).await?;
        return Ok(1);
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut turns = 0u32;
    loop {
        print!("> ");
        io::stdout().flush().ok();
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("reading stdin")?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        run_one_turn(agent, trimmed).await?;
        turns += 1;
    }
    Ok(turns)
}

/// Run a single turn, cancelling it on Ctrl-C, and print events as they arrive.
async fn run_one_turn(agent: &mut Agent, prompt: &str) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let mut cancel_tx = Some(cancel_tx);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(event);
        }
    });

    let turn = agent.submit_with_cancel(prompt, tx, cancel_rx);
    tokio::pin!(turn);

    let result = loop {
        tokio::select! {
            result = &mut turn => break result,
            _ = tokio::signal::ctrl_c() => {
                if let Some(tx) = cancel_tx.take() {
                    let _ = tx.send(());
                }
            }
        }
    };

    printer.await.ok();
    println!();
    result
}

fn print_event(event: AgentEvent) {
    match event {
        AgentEvent::TextDelta(chunk) => {
            print!("{chunk}");
            io::stdout().flush().ok();
        }
        AgentEvent::ToolCallStarted(call) => {
            println!("\n[tool] {} {}", call.name, call.args);
        }
        AgentEvent::ToolCallFinished {
            tool_name,
            is_error,
            output,
            ..
        } => {
            let marker = if is_error { "error" } else { "ok" };
            println!("[tool:{marker}] {tool_name} -> {output}");
        }
        AgentEvent::ContextCompacted {
            tokens_before,
            tokens_after,
            ..
        } => {
            println!("\n[compacted] {tokens_before} -> {tokens_after} tokens");
        }
        AgentEvent::ContextPressure { level, fraction } => {
            println!("\n[context:{level:?}] {:.0}% full", fraction * 100.0);
        }
        AgentEvent::Aborted { .. } => {
            println!("\n[cancelled]");
        }
        AgentEvent::Error(msg) => {
            eprintln!("\n[error] {msg}");
        }
        _ => {}
    }
}

/// Spawn the task that answers `ApprovalRequest`s from stdin.
///
/// Prints the tool name, description, and arguments, then reads a single
/// line: "y" approves once, "a" approves for the rest of the session,
/// anything else (including EOF) rejects.
fn spawn_approval_prompt() -> mpsc::Sender<ApprovalRequest> {
    let (tx, mut rx) = mpsc::channel::<ApprovalRequest>(8);
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            println!(
                "\n[approval] {} wants to run {} with {}",
                request.tool_description, request.call.name, request.call.args
            );
            print!("Allow? [y]es / [a]lways this session / [N]o: ");
            io::stdout().flush().ok();

            let decision = tokio::task::spawn_blocking(|| {
                let mut line = String::new();
                io::stdin().read_line(&mut line).ok();
                match line.trim().to_lowercase().as_str() {
                    "y" | "yes" => ApprovalDecision::Approved,
                    "a" | "always" => ApprovalDecision::ApprovedForSession,
                    _ => ApprovalDecision::Rejected,
                }
            })
            .await
            .unwrap_or(ApprovalDecision::Rejected);

            let _ = request.decision_tx.send(decision);
        }
    });
    tx
}

/// Detect project root, git/CI state, and a project context file, and format
/// them into the pre-rendered notes `Agent` expects.
fn build_runtime_context(config: &Config) -> AgentRuntimeContext {
    let project_root = sven_runtime::find_project_root().ok();
    let git_context_note = project_root
        .as_ref()
        .map(|root| sven_runtime::collect_git_context(root))
        .and_then(|g| g.to_prompt_section());
    let ci_context_note = sven_runtime::detect_ci_context().to_prompt_section();
    let project_context_file = project_root
        .as_ref()
        .and_then(|root| sven_runtime::load_project_context_file(root));

    AgentRuntimeContext {
        project_root,
        git_context_note,
        ci_context_note,
        project_context_file,
        append_system_prompt: None,
        system_prompt_override: config.agent.system_prompt.clone(),
    }
}

fn init_logging(config: &Config, verbosity: u8) {
    let level = match verbosity {
        0 => config.log.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log.format {
        LogFormat::Json => {
            let _ = registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init();
        }
        LogFormat::Pretty => {
            let _ = registry
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .try_init();
        }
    }
}
