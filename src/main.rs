//! retcon-node: link supervisor daemon
//!
//! Loads the node profile, starts the radio stack and keeps the mesh, WiFi
//! client and Bluetooth PAN links healthy until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use retcon_node::process::{restart_hook, ProcessManager, ProcessSpec, RADIO_STACK};
use retcon_node::{Config, Host, Supervisor};

#[derive(Parser)]
#[command(name = "retcon-node")]
#[command(about = "Mesh link supervisor for RETCON nodes")]
struct Cli {
    /// Path to the node profile
    #[arg(short, long, env = "RETCON_CONFIG", default_value = "/etc/retcon/retcon.toml")]
    config: PathBuf,

    /// Log commands instead of running them
    #[arg(long, env = "RETCON_DRY_RUN")]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor until interrupted (default)
    Run,
    /// Print the radio-stack interface definitions for the configured links
    Interfaces,
    /// Probe every configured link once and print the reports as JSON
    Probe,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("retcon_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading profile {}", cli.config.display()))?;
    if cli.dry_run {
        config.supervisor.dry_run = true;
    }

    info!(
        profile = %cli.config.display(),
        mode = ?config.node.mode,
        dry_run = config.supervisor.dry_run,
        "Starting retcon-node"
    );

    let host = if config.supervisor.dry_run {
        Host::dry_run()
    } else {
        Host::system()
    };

    let processes = Arc::new(ProcessManager::new());
    let supervisor = Supervisor::from_config(
        &config,
        host,
        restart_hook(processes.clone(), RADIO_STACK),
    )
    .await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Interfaces => {
            print!("{}", supervisor.plugin_interfaces());
        }
        Command::Probe => {
            let reports = supervisor.probe_all().await;
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Command::Run => {
            if let Some(spec) = ProcessSpec::from_command(&config.radio_stack.command) {
                if config.supervisor.dry_run {
                    info!(program = %spec.program, "Would start radio stack (dry run)");
                } else {
                    processes.register(RADIO_STACK, spec).await;
                    processes.start(RADIO_STACK).await?;
                }
            }

            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Could not listen for Ctrl-C, running until killed");
                    std::future::pending::<()>().await;
                }
                let _ = shutdown_tx.send(()).await;
            });

            supervisor.run(shutdown_rx).await;
            if let Some(stack) = processes.info(RADIO_STACK).await {
                info!(
                    status = ?stack.status,
                    restarts = stack.restarts,
                    "Stopping radio stack"
                );
            }
            processes.stop_all().await;
            info!("retcon-node stopped");
        }
    }

    Ok(())
}
