use anyhow::{Context, Result};
use chrono::{Local, NaiveTime};
use clap::{Parser, Subcommand};
use popcast_agent::activity::ActivityMonitor;
use popcast_agent::cache::Cache;
use popcast_agent::catalog::CatalogClient;
use popcast_agent::config;
use popcast_agent::headless::{LoggingSurface, StillPointer};
use popcast_agent::identity;
use popcast_agent::outcome::NatsOutcomeLogger;
use popcast_agent::reconcile::Reconciler;
use popcast_agent::scheduler::Scheduler;
use popcast_agent::trigger::DisplayTrigger;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the reconciliation and display loops until interrupted (default)
    Run,
    /// Print today's agenda up to now
    Agenda,
    /// Display one agenda entry right away
    Show {
        #[arg(long)]
        message_id: i64,
        /// Scheduled minute of the entry, HH:MM local time today
        #[arg(long)]
        at: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let cache = Cache::open(&cfg.database_url()).await?;
    let identity = identity::resolve(cfg.agent.identity.as_deref());
    if identity.is_none() {
        warn!("could not determine local identity; running from cached groups only");
    }

    let base_url = Url::parse(&cfg.catalog.base_url).context("invalid catalog.base_url")?;
    let catalog = Arc::new(CatalogClient::new(base_url, cfg.catalog.token.clone())?);
    let reconciler = Arc::new(Reconciler::new(cache.clone(), catalog, identity.clone()));

    let outcomes = Arc::new(NatsOutcomeLogger::new(
        cfg.queue.clone(),
        identity.unwrap_or_else(|| "unknown".to_string()),
    ));
    let monitor = ActivityMonitor::new(Arc::new(StillPointer));
    let trigger = Arc::new(DisplayTrigger::new(
        cache.clone(),
        Arc::new(LoggingSurface),
        monitor,
        outcomes.clone(),
    ));

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            let handle = Scheduler::new(
                reconciler,
                trigger,
                cfg.reconcile_interval(),
                cfg.display_interval(),
            )
            .start();
            info!("agent running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            handle.stop().await;
            outcomes.drain().await;
        }
        Command::Agenda => {
            let now = Local::now().naive_local();
            for entry in cache.list_today_until(now).await? {
                let seen = if entry.shown { " (seen)" } else { "" };
                println!(
                    "{}  message {}{}",
                    entry.scheduled_at.format("%H:%M"),
                    entry.message_id,
                    seen
                );
            }
        }
        Command::Show { message_id, at } => {
            let time = NaiveTime::parse_from_str(&at, "%H:%M")
                .with_context(|| format!("expected HH:MM, got {}", at))?;
            let scheduled_at = Local::now().date_naive().and_time(time);
            match trigger.fire_on_demand(message_id, scheduled_at).await? {
                Some(outcome) => println!("{} {}", outcome.message_id, outcome.state.as_str()),
                None => println!("message {} is not displayable", message_id),
            }
            outcomes.drain().await;
        }
    }

    Ok(())
}
