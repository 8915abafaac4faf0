//! Command-line interface
//!
//! Every agent command is a thin producer of a mailbox message: it POSTs
//! to the daemon's message hub and prints the identifiers the caller can
//! poll. Daemon lifecycle commands talk to the supervisor directly.

use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::{Context, Result};
use serde_json::{Value, json};
use std::path::PathBuf;

use crate::mailbox::generate_callback_id;

#[derive(Debug, Parser)]
#[command(name = "fd", about = "Finger - local multi-agent orchestration daemon", version)]
pub struct Cli {
    /// Path to a config file (default: .finger.yml, then user config)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level override (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Daemon lifecycle
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Run the server in the foreground (spawned by `daemon start`)
    #[command(hide = true, name = "run-server")]
    RunServer,

    /// Ask the understanding agent to analyze a task
    Understand { task: Vec<String> },

    /// Route a task to the right agent
    Route { task: Vec<String> },

    /// Produce a plan for a task
    Plan { task: Vec<String> },

    /// Execute a task directly with an executor agent
    Execute { task: Vec<String> },

    /// Review a task or artifact
    Review { task: Vec<String> },

    /// Orchestrate a task end to end
    Orchestrate { task: Vec<String> },

    /// Look up a mailbox entry
    Message {
        /// Callback identifier (cli-<millis>-<rand6>)
        #[arg(long)]
        callback_id: Option<String>,

        /// Message identifier (msg-...)
        #[arg(long)]
        message_id: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon (detached) or run in the foreground
    Start {
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Restart the daemon
    Restart,
    /// Show daemon status
    Status {
        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: String,
    },
}

/// CLI command -> (target agent, message type), per the hub's routing
pub fn agent_target(command: &Command) -> Option<(&'static str, &'static str, &Vec<String>)> {
    match command {
        Command::Understand { task } => Some(("understanding-agent", "UNDERSTAND", task)),
        Command::Route { task } => Some(("router-agent", "ROUTE", task)),
        Command::Plan { task } => Some(("planner-agent", "PLAN", task)),
        Command::Execute { task } => Some(("executor-agent", "EXECUTE", task)),
        Command::Review { task } => Some(("reviewer-agent", "REVIEW", task)),
        Command::Orchestrate { task } => Some(("orchestrator", "ORCHESTRATE", task)),
        _ => None,
    }
}

/// Submit a message to the daemon's hub and print the identifiers
pub async fn submit(port: u16, target: &str, message_type: &str, task_words: &[String]) -> Result<()> {
    let task = task_words.join(" ");
    if task.trim().is_empty() {
        eyre::bail!("a task description is required");
    }

    let callback_id = generate_callback_id();
    let body = json!({
        "target": target,
        "message": {"type": message_type, "task": task},
        "sender": "cli",
        "callbackId": callback_id,
    });

    let url = format!("http://127.0.0.1:{}/api/v1/message", port);
    let response = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .context("is the daemon running? (fd daemon start)")?;

    let status = response.status();
    let payload: Value = response.json().await.context("unparseable hub response")?;
    if !status.is_success() {
        eyre::bail!("hub rejected message: {}", payload);
    }

    println!("{} {}", "message:".bold(), payload["messageId"].as_str().unwrap_or("?"));
    println!("{} {}", "callback:".bold(), payload["callbackId"].as_str().unwrap_or("?"));
    println!("poll with: fd message --callback-id {}", payload["callbackId"].as_str().unwrap_or("?"));
    Ok(())
}

/// Fetch a mailbox entry by message or callback identity and print it
pub async fn query_message(port: u16, message_id: Option<&str>, callback_id: Option<&str>) -> Result<()> {
    let url = match (message_id, callback_id) {
        (Some(id), _) => format!("http://127.0.0.1:{}/api/v1/message/{}", port, id),
        (None, Some(cb)) => format!("http://127.0.0.1:{}/api/v1/message/callback/{}", port, cb),
        (None, None) => eyre::bail!("pass --message-id or --callback-id"),
    };

    let response = reqwest::get(&url).await.context("is the daemon running?")?;
    if response.status().as_u16() == 404 {
        eyre::bail!("no such message");
    }
    let entry: Value = response.json().await?;

    let status = entry["status"].as_str().unwrap_or("?");
    let colored_status = match status {
        "completed" => status.green(),
        "failed" => status.red(),
        "processing" => status.yellow(),
        _ => status.normal(),
    };
    println!("{} {}", "status:".bold(), colored_status);
    if let Some(result) = entry.get("result") {
        println!("{} {}", "result:".bold(), result);
    }
    if let Some(error) = entry.get("error").and_then(|e| e.as_str()) {
        println!("{} {}", "error:".bold(), error.red());
    }
    Ok(())
}
