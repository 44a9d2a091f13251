//! # Warden operator CLI
//!
//! Inspects agent health and drives the dead-letter queue of a warden
//! SQLite store.
//!
//! Usage:
//!   warden status                          # DLQ counts and recent alerts
//!   warden status --agent scorer           # Latest health/metrics for one agent
//!   warden dlq list --status failed        # Browse dead letters
//!   warden dlq requeue <id>                # Put a failed entry back in line
//!   warden dlq purge --status resolved --older-than-days 30
//!   warden init-config                     # Write ~/.warden/config.toml

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use warden_core::config::WardenConfig;
use warden_core::events::EventBus;
use warden_core::traits::Store;
use warden_core::types::{DeadLetterFilter, DeadLetterStatus};
use warden_resilience::{DeadLetterPolicy, DeadLetterQueue};
use warden_store::SqliteStore;

#[derive(Parser)]
#[command(name = "warden", version, about = "🛡️ Warden: agent supervision and dead-letter operations")]
struct Cli {
    /// Config file (default: ~/.warden/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Database path (overrides config and WARDEN_DB_PATH)
    #[arg(long)]
    db_path: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show dead-letter counts and recent alerts, or one agent's latest health
    Status {
        #[arg(long)]
        agent: Option<String>,
    },
    /// Dead-letter queue operations
    Dlq {
        #[command(subcommand)]
        action: DlqCommand,
    },
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum DlqCommand {
    /// List entries, newest first
    List {
        /// pending | retrying | failed | resolved
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        /// 0 = no limit
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Entry count per status
    Stats,
    /// Move a failed entry back to pending for immediate replay
    Requeue { id: String },
    /// Delete resolved or failed entries older than N days
    Purge {
        #[arg(long)]
        status: String,
        #[arg(long, default_value = "30")]
        older_than_days: i64,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(path: Option<&str>) -> Result<WardenConfig> {
    let Some(path) = path else {
        return Ok(WardenConfig::load()?);
    };
    let mut config = WardenConfig::load_from(&expand_path(path))?;
    config.apply_env();
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "warden=debug,warden_resilience=debug,warden_store=debug"
    } else {
        "warden=info,warden_resilience=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    if let Command::InitConfig { force } = &cli.command {
        let path = cli
            .config
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(WardenConfig::default_path);
        return init_config(&path, *force);
    }

    let config = load_config(cli.config.as_deref())?;
    let db_path = expand_path(cli.db_path.as_deref().unwrap_or(&config.store.path));
    tracing::debug!("📂 Using store at {}", db_path.display());
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("opening store at {}", db_path.display()))?,
    );
    let dlq = DeadLetterQueue::new(
        store.clone(),
        DeadLetterPolicy::from_config(&config.dead_letter),
        EventBus::default(),
    );

    match cli.command {
        Command::Status { agent: Some(agent) } => agent_status(store.as_ref(), &agent).await,
        Command::Status { agent: None } => overview(store.as_ref(), &dlq).await,
        Command::Dlq { action } => dlq_command(&dlq, action).await,
        Command::InitConfig { .. } => Ok(()),
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("⚠️  {} already exists (use --force to overwrite)", path.display());
        return Ok(());
    }
    WardenConfig::default().save_to(path)?;
    println!("✅ Wrote default config to {}", path.display());
    Ok(())
}

async fn overview(store: &dyn Store, dlq: &DeadLetterQueue) -> Result<()> {
    let stats = dlq.stats().await?;
    println!("🛡️  Warden status\n");
    println!("📮 Dead letters: {} total", stats.total());
    println!("   pending:  {}", stats.pending);
    println!("   retrying: {}", stats.retrying);
    println!("   failed:   {}", stats.failed);
    println!("   resolved: {}", stats.resolved);

    let alerts = store.list_alerts(None, 10).await?;
    println!("\n🚨 Recent alerts ({})", alerts.len());
    for a in alerts {
        println!(
            "   {} [{}] {} {}: {}",
            a.timestamp.format("%Y-%m-%d %H:%M:%S"),
            a.severity,
            a.agent,
            a.alert_type,
            a.message
        );
    }
    Ok(())
}

async fn agent_status(store: &dyn Store, agent: &str) -> Result<()> {
    println!("🤖 Agent '{agent}'\n");
    match store.latest_health(agent).await? {
        Some(h) => println!(
            "💓 Health: {} at {}\n   {}",
            h.status,
            h.timestamp.format("%Y-%m-%d %H:%M:%S"),
            h.details
        ),
        None => println!("💓 Health: no checks recorded"),
    }
    match store.latest_metrics(agent).await? {
        Some(m) => {
            println!(
                "📊 Metrics at {}",
                m.timestamp.format("%Y-%m-%d %H:%M:%S")
            );
            println!("   success: {}  errors: {}  warnings: {}", m.success_count, m.error_count, m.warning_count);
            println!("   processing: {} ms  memory: {:.1} MB", m.processing_time_ms, m.memory_usage_mb);
            for (k, v) in &m.custom {
                println!("   {k}: {v}");
            }
        }
        None => println!("📊 Metrics: none recorded"),
    }

    let errors = store.list_errors(Some(agent), 5).await?;
    if !errors.is_empty() {
        println!("\n❌ Recent errors");
        for e in errors {
            println!(
                "   {} [{}/{}] {}",
                e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                e.error_type,
                e.severity,
                e.message
            );
        }
    }
    Ok(())
}

async fn dlq_command(dlq: &DeadLetterQueue, action: DlqCommand) -> Result<()> {
    match action {
        DlqCommand::List { status, agent, limit } => {
            let status = status
                .as_deref()
                .map(str::parse::<DeadLetterStatus>)
                .transpose()?;
            let entries = dlq.list(&DeadLetterFilter { status, agent, limit }).await?;
            if entries.is_empty() {
                println!("📭 No dead letters");
            }
            for e in entries {
                let next = e
                    .next_retry
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{}  {:<8} {:<12} {:<20} {}/{}  next: {}  {}",
                    e.id, e.status, e.agent, e.operation, e.retry_count, e.max_retries, next, e.error.message
                );
            }
        }
        DlqCommand::Stats => {
            let stats = dlq.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        DlqCommand::Requeue { id } => {
            let entry = dlq.requeue(&id).await?;
            println!("♻️  Requeued {} ({} / {})", entry.id, entry.agent, entry.operation);
        }
        DlqCommand::Purge {
            status,
            older_than_days,
        } => {
            let status: DeadLetterStatus = status.parse()?;
            let cutoff = purge_cutoff(Utc::now(), older_than_days)?;
            let n = dlq.purge(status, cutoff).await?;
            println!("🗑️  Purged {n} {status} entr{}", if n == 1 { "y" } else { "ies" });
        }
    }
    Ok(())
}

/// `now - days`, rejecting spans chrono cannot represent.
fn purge_cutoff(now: DateTime<Utc>, older_than_days: i64) -> Result<DateTime<Utc>> {
    let age = TimeDelta::try_days(older_than_days.max(0))
        .with_context(|| format!("--older-than-days {older_than_days} is out of range"))?;
    now.checked_sub_signed(age)
        .with_context(|| format!("--older-than-days {older_than_days} reaches past the earliest date"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purge_cutoff() {
        let now = Utc::now();
        assert_eq!(purge_cutoff(now, 30).unwrap(), now - TimeDelta::days(30));
        assert_eq!(purge_cutoff(now, -5).unwrap(), now);
    }

    #[test]
    fn test_purge_cutoff_rejects_huge_spans() {
        assert!(purge_cutoff(Utc::now(), i64::MAX).is_err());
        assert!(purge_cutoff(Utc::now(), 100_000_000).is_err());
    }
}
