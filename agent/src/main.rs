//! Hub worker agent - Command Line Interface
//!
//! ## Commands
//! - `init` - Write a default configuration file
//! - `start` - Connect to the hub and serve jobs until Ctrl+C
//! - `hardware` - Show detected capacity and the resulting cache sizing

use agent::hardware::HardwareProbe;
use agent::model::CachePolicy;
use agent::session::{ConnectionSupervisor, SupervisorOutcome, WsTransport};
use agent::{init_from_config, AgentConfig, AgentContextBuilder, SystemProbe};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Hub worker agent
#[derive(Parser, Debug)]
#[command(name = "hub-agent")]
#[command(about = "Worker agent serving model jobs for a central hub", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.hubnet/agent.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Connect to the hub and serve jobs
    Start {
        /// Log level (trace, debug, info, warn, error); overrides the config file
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// Show detected hardware capacity
    Hardware,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => AgentConfig::default_path()?,
    };

    match cli.command {
        Commands::Init { force } => {
            cmd_init(config_path, force)?;
        }

        Commands::Start { log_level } => {
            let outcome = cmd_start(config_path, log_level).await?;
            if let SupervisorOutcome::IdentityConflict(reason) = &outcome {
                use colored::Colorize;
                eprintln!("\n{}", format!("✗ The hub rejected this worker: {}", reason).red());
                eprintln!(
                    "{}",
                    "   Another worker is registered with the same identity.".yellow()
                );
                std::process::exit(outcome.exit_code());
            }
        }

        Commands::Hardware => {
            // No logging for hardware (pure display)
            cmd_hardware(config_path)?;
        }
    }

    Ok(())
}

/// Write a default configuration file
fn cmd_init(config_path: PathBuf, force: bool) -> Result<()> {
    println!("🔧 Initializing hub worker configuration...\n");

    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let config = AgentConfig::default();
    config.save(&config_path)?;

    println!("✓ Configuration saved to: {}", config_path.display());
    println!("   Hub: {}", config.hub_url());
    println!("   Concurrent slots: {}", config.worker.concurrent_slots);
    println!("   Auth ticket: {}", config.auth.ticket_path);

    println!("\nNext steps:");
    println!("  1. Point [hub] at your hub and place the auth ticket");
    println!("  2. Start the worker:  hub-agent start");

    Ok(())
}

/// Run the worker until Ctrl+C or an identity conflict
async fn cmd_start(config_path: PathBuf, log_level: Option<String>) -> Result<SupervisorOutcome> {
    let config = AgentConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}. Run 'hub-agent init' first.", config_path.display()))?;
    init_from_config(&config.logging, log_level.as_deref())?;

    println!("🚀 Starting hub worker...\n");
    let context = AgentContextBuilder::new(config)
        .build()
        .context("Failed to set up the worker")?;

    println!("📋 Worker: {}", context.worker_id);
    println!("   Hub: {}", context.config.hub_url());
    println!("   Slots per class: {}", context.admission.permits_per_class());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal (Ctrl+C)"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
        signal_token.cancel();
    });

    let supervisor =
        ConnectionSupervisor::new(Arc::clone(&context), Arc::new(WsTransport::new()), shutdown);
    let outcome = supervisor.run_default().await;

    if outcome == SupervisorOutcome::Shutdown {
        println!("\n✓ Worker stopped");
    }
    Ok(outcome)
}

/// Print the capacity report and what the cache would do with it
fn cmd_hardware(config_path: PathBuf) -> Result<()> {
    use colored::Colorize;

    let config = if config_path.exists() {
        AgentConfig::load(&config_path)?
    } else {
        AgentConfig::default()
    };

    let probe = SystemProbe::new();
    let report = probe.capacity_snapshot();
    let machine = probe.machine_info();
    let policy = CachePolicy::from(&config.cache);

    println!("\n{}", "Hardware".bold().cyan());
    println!("{}", "========".cyan());
    println!("  Host:               {} ({}/{})", machine.hostname, machine.os, machine.arch);
    println!("  CPU:                {} ({} cores)", machine.cpu_type, report.cpu_cores);
    println!("  GPU:                {}", machine.gpu_type);
    match report.accelerator_memory_gib {
        Some(gib) => println!("  Accelerator memory: {:.1} GiB", gib),
        None => println!("  Accelerator memory: {}", "unknown".yellow()),
    }
    println!("  System memory:      {} GiB", report.system_memory_gib);

    println!("\n{}", "Model Cache:".bold());
    println!(
        "  Resident instances: {}",
        policy.allowed_concurrent(&report).to_string().green()
    );
    println!("  Offload advised:    {}", report.offload_advised());
    println!(
        "  Sequential offload: {}",
        report.sequential_offload_advised()
    );

    let job_types = report.supported_job_types(&config.worker.enabled_modules);
    let names: Vec<&str> = job_types.keys().map(String::as_str).collect();
    println!("\n{}", "Job Types:".bold());
    if names.is_empty() {
        println!("  {}", "none".yellow());
    } else {
        println!("  {}", names.join(", "));
    }

    Ok(())
}
