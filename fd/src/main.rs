//! Finger daemon CLI entry point

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;

use fingerd::cli::{Cli, Command, DaemonCommand, agent_target, query_message, submit};
use fingerd::config::{Config, finger_home, log_path};
use fingerd::daemon::DaemonSupervisor;

/// Server process: log to the daemon log file. CLI: log to stderr.
fn setup_logging(to_file: bool, cli_level: Option<&str>) -> Result<()> {
    let level = match cli_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
        None => {
            if to_file {
                tracing::Level::INFO
            } else {
                tracing::Level::WARN
            }
        }
    };

    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());
    if to_file {
        let home = finger_home();
        std::fs::create_dir_all(&home).context("Failed to create state directory")?;
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path(&home))
            .context("Failed to open daemon log")?;
        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_server = matches!(cli.command, Some(Command::RunServer));
    setup_logging(is_server, cli.log_level.as_deref())?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let home = finger_home();
    let supervisor = DaemonSupervisor::new(&home, config.daemon.http_port, config.daemon.startup_delay_ms);

    match cli.command {
        Some(Command::RunServer) => {
            info!("run-server starting");
            fingerd::runtime::run_server(config).await
        }
        Some(Command::Daemon { command }) => match command {
            DaemonCommand::Start { foreground } => {
                if foreground {
                    fingerd::runtime::run_server(config).await
                } else {
                    let pid = supervisor.start().await?;
                    println!("daemon started (pid {})", pid);
                    Ok(())
                }
            }
            DaemonCommand::Stop => match supervisor.stop() {
                Ok(()) => {
                    println!("daemon stopped");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("stop failed: {}", e);
                    std::process::exit(2);
                }
            },
            DaemonCommand::Restart => {
                let pid = supervisor.restart().await?;
                println!("daemon restarted (pid {})", pid);
                Ok(())
            }
            DaemonCommand::Status { format } => {
                let status = supervisor.status();
                if format == "json" {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                } else {
                    println!(
                        "daemon: {} (port {})",
                        if status.running { "running" } else { "stopped" },
                        status.http_port
                    );
                    if let Some(pid) = status.pid {
                        println!("pid: {}", pid);
                    }
                }
                Ok(())
            }
        },
        Some(Command::Message {
            callback_id,
            message_id,
        }) => query_message(config.daemon.http_port, message_id.as_deref(), callback_id.as_deref()).await,
        Some(ref command) => {
            if let Some((target, message_type, task)) = agent_target(command) {
                submit(config.daemon.http_port, target, message_type, task).await
            } else {
                eyre::bail!("unhandled command");
            }
        }
        None => {
            println!("fd - finger daemon. Try: fd daemon start, fd orchestrate <task>");
            Ok(())
        }
    }
}
