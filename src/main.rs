//! rewall - iptables policy reconciliation engine
//!
//! Keeps a declarative, database-backed firewall policy converged with
//! live netfilter state, and exposes a REST API for rule management.
//!
//! # Usage
//!
//! ```bash
//! rewall serve                    # Bootstrap chains and serve the API
//! rewall bootstrap                # Ensure owned chains and jumps only
//! rewall apply                    # One-shot reconciliation
//! rewall list                     # Print stored rules
//! rewall export --output f.json   # Export rules as JSON
//! rewall import f.json --replace  # Import rules (replace mode)
//! ```
//!
//! Non-privileged environments set `REWALL_MOCK=1` to log would-be
//! iptables commands instead of executing them.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, warn};

use rewall::audit::AuditLog;
use rewall::config;
use rewall::core::iptables::Iptables;
use rewall::core::orchestrator::{ImportMode, Orchestrator};
use rewall::store::Store;
use rewall::utils;

#[derive(Parser)]
#[command(name = "rewall", version, about = "iptables policy reconciliation engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap owned chains and serve the REST API (default)
    Serve,
    /// Ensure owned chains exist and are jumped to, then exit
    Bootstrap,
    /// Run one full reconciliation pass, then exit
    Apply,
    /// Print all stored rules
    List,
    /// Export stored rules as a JSON list
    Export {
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<std::path::PathBuf>,
    },
    /// Import rules from a JSON list
    Import {
        /// File containing a JSON array of rule objects
        file: std::path::PathBuf,
        /// Delete all existing rules first
        #[arg(long)]
        replace: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rewall=info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = utils::ensure_dirs() {
        error!("failed to create application directories: {e}");
        return ExitCode::FAILURE;
    }

    let config = config::load_config().await;

    if !config.mock_mode && !nix::unistd::getuid().is_root() {
        warn!("not running as root; iptables mutations will likely fail (set REWALL_MOCK=1 for a dry run)");
    }

    let store = match Store::open(&config.database_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to open rule database: {e}");
            return ExitCode::FAILURE;
        }
    };

    let iptables = if config.mock_mode {
        Arc::new(Iptables::mock())
    } else {
        Arc::new(Iptables::system(config.save_command.clone()))
    };

    let mut orchestrator = Orchestrator::new(store, iptables);
    match AuditLog::new() {
        Ok(audit) => orchestrator = orchestrator.with_audit(audit),
        Err(e) => warn!("audit log unavailable: {e}"),
    }
    let orchestrator = Arc::new(orchestrator);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cmd_serve(orchestrator, &config.listen_addr).await,
        Commands::Bootstrap => cmd_bootstrap(&orchestrator).await,
        Commands::Apply => cmd_apply(&orchestrator).await,
        Commands::List => cmd_list(&orchestrator),
        Commands::Export { output } => cmd_export(&orchestrator, output.as_deref()),
        Commands::Import { file, replace } => cmd_import(&orchestrator, &file, replace).await,
    }
}

async fn cmd_serve(orchestrator: Arc<Orchestrator>, listen_addr: &str) -> ExitCode {
    if let Err(e) = orchestrator.bootstrap().await {
        // The API can still serve reads and retries; don't die on a
        // partially initialized chain set
        error!("bootstrap incomplete: {e}");
    }

    match rewall::api::serve(orchestrator, listen_addr).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("HTTP server failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_bootstrap(orchestrator: &Orchestrator) -> ExitCode {
    match orchestrator.bootstrap().await {
        Ok(()) => {
            println!("Owned chains initialized.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Bootstrap failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_apply(orchestrator: &Orchestrator) -> ExitCode {
    match orchestrator.apply().await {
        Ok(report) if report.is_success() => {
            println!("Applied {} rules.", report.applied);
            ExitCode::SUCCESS
        }
        Ok(report) => {
            eprintln!(
                "Apply incomplete: {} applied, {} failed, {} flush failures.",
                report.applied,
                report.failed.len(),
                report.flush_failures.len()
            );
            for failure in &report.failed {
                eprintln!("  {}: {}", failure.id, failure.error);
            }
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Apply failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_list(orchestrator: &Orchestrator) -> ExitCode {
    match orchestrator.list_rules(None, None) {
        Ok(rules) => {
            if rules.is_empty() {
                println!("No rules stored.");
                return ExitCode::SUCCESS;
            }
            println!(
                "{:<38} {:<8} {:<12} {:<12} {:>5}  {}",
                "ID", "TABLE", "CHAIN", "ACTION", "ORDER", "ENABLED"
            );
            for rule in rules {
                println!(
                    "{:<38} {:<8} {:<12} {:<12} {:>5}  {}",
                    rule.id.to_string(),
                    rule.table.as_str(),
                    rule.chain.as_str(),
                    rule.action.as_str(),
                    rule.order,
                    rule.enabled
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to list rules: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_export(orchestrator: &Orchestrator, output: Option<&std::path::Path>) -> ExitCode {
    let rules = match orchestrator.export_rules() {
        Ok(rules) => rules,
        Err(e) => {
            eprintln!("Export failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let json = match serde_json::to_string_pretty(&rules) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Export serialization failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, json) {
                eprintln!("Failed to write {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
            println!("Exported {} rules to {}.", rules.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout();
            let _ = writeln!(stdout, "{json}");
        }
    }
    ExitCode::SUCCESS
}

async fn cmd_import(
    orchestrator: &Orchestrator,
    file: &std::path::Path,
    replace: bool,
) -> ExitCode {
    let content = match std::fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Failed to read {}: {e}", file.display());
            return ExitCode::FAILURE;
        }
    };

    let records: Vec<serde_json::Value> = match serde_json::from_str(&content) {
        Ok(records) => records,
        Err(e) => {
            eprintln!("Invalid import file (expected a JSON array): {e}");
            return ExitCode::FAILURE;
        }
    };

    let mode = if replace {
        ImportMode::Replace
    } else {
        ImportMode::Append
    };

    match orchestrator.import_rules(records, mode).await {
        Ok(report) => {
            println!("Imported {} rules.", report.imported);
            for failure in &report.failures {
                eprintln!("  record {}: {}", failure.index, failure.error);
            }
            if report.failures.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("Import failed: {e}");
            ExitCode::FAILURE
        }
    }
}
