// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use sven_config::AgentMode;

#[derive(Parser, Debug)]
#[command(
    name = "sven",
    about = "An interactive terminal coding assistant",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Initial prompt. Omit to read turns from stdin, one per line.
    #[arg(value_name = "PROMPT")]
    pub prompt: Option<String>,

    /// Agent mode
    #[arg(long, short = 'm', value_enum, default_value = "agent")]
    pub mode: AgentMode,

    /// Model override, e.g. "mock" or "mock/scripted"
    #[arg(long, short = 'M', env = "SVEN_MODEL")]
    pub model: Option<String>,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Never wait for interactive approval; reject any call that needs one
    #[arg(long)]
    pub non_interactive: bool,

    /// Load a session checkpoint before the first turn
    #[arg(long, value_name = "PATH")]
    pub resume: Option<PathBuf>,

    /// Write a session checkpoint to this path after the run ends
    #[arg(long, value_name = "PATH")]
    pub checkpoint: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective configuration and exit
    ShowConfig,
}
