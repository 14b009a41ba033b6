//! CLI definitions for xreply.
//!
//! Uses clap for argument parsing with derive macros.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// xreply - answers token questions on X from warehouse data
#[derive(Parser, Debug)]
#[command(name = "xreply")]
#[command(version)]
#[command(about = "Idempotent X interaction pipeline backed by a token-metrics warehouse")]
#[command(long_about = r#"
xreply watches X for mentions and posts from accounts you follow, rebuilds
each conversation thread, decides whether it deserves an answer, turns the
question into a bounded SQL query, and replies with what the data says.

Every handled post is recorded, so repeated or concurrent passes never answer
the same post twice.

Quick start:
  1. Write a config: xreply config --init
  2. Preview the SQL for a question: xreply plan "top trader grade tokens"
  3. Look up one token: xreply token BTC
  4. Run one pass without posting: xreply poll --dry-run
  5. Run continuously: xreply run
"#)]
pub struct Cli {
    /// Path to a config file (defaults to ~/.config/xreply/config.toml)
    #[arg(long, short = 'c', env = "XREPLY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Path to the memory database
    #[arg(long, env = "XREPLY_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Be verbose (show debug info)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Be quiet (suppress non-error output)
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the interaction, posting, and action loops until ctrl-c
    Run(RunArgs),

    /// Run a single interaction pass and exit
    Poll(PollArgs),

    /// Show the SQL a question turns into
    Plan(PlanArgs),

    /// Reconstruct and print the thread ending at a post
    Thread(ThreadArgs),

    /// Show metrics for a token by name or symbol
    Token(TokenArgs),

    /// Search the web through the configured search provider
    Search(SearchArgs),

    /// Show or manage configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Generate replies and posts but publish nothing
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct PollArgs {
    /// Generate replies but publish and record nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Print the pass summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// The question to plan
    pub question: String,

    /// Conversation text used to resolve the question
    #[arg(long, default_value = "")]
    pub context: String,

    /// Run the query against the warehouse and print the rows
    #[arg(long, short = 'x')]
    pub execute: bool,
}

#[derive(Args, Debug)]
pub struct ThreadArgs {
    /// Id of the last post in the thread
    pub id: String,

    /// Maximum number of posts to walk
    #[arg(long, short = 'd')]
    pub depth: Option<usize>,
}

#[derive(Args, Debug)]
pub struct TokenArgs {
    /// Token name or symbol (a leading $ is ignored)
    pub name: String,

    /// Match names and symbols containing the text instead of exact matches
    #[arg(long, short = 's')]
    pub search: bool,

    /// Print metrics as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// What to search for
    pub query: String,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Show the effective configuration
    #[arg(long)]
    pub show: bool,

    /// Write a default config file (to --config, or the user config path)
    #[arg(long)]
    pub init: bool,

    /// Overwrite an existing file with --init
    #[arg(long)]
    pub force: bool,

    /// Print the user config file path
    #[arg(long)]
    pub path: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
