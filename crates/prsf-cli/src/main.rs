use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use prsf_core::{AutoRuleParams, Destination, ListingId, SavedSearchParams};
use prsf_storage::ListingStore;
use prsf_sync::{AlertFanout, SyncConfig, SyncService, Trigger};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "prsf")]
#[command(about = "Paid research study finder: scrape, moderate and route study listings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every enabled source once and upsert the results.
    Ingest,
    /// Long-running mode: scheduler, alert worker and web surface.
    Run,
    /// Web surface only.
    Serve,
    Status,
    Stats,
    /// Drop listings, posts and moderation cards ahead of a fresh rescrape.
    Clear {
        /// Also forget rejected listings.
        #[arg(long)]
        reset: bool,
    },
    /// Announce pending listings and, with --rules, auto-post rule matches.
    Sweep {
        #[arg(long)]
        rules: bool,
    },
    Approve {
        id: ListingId,
        #[arg(long)]
        destination: Option<String>,
    },
    Reject {
        id: ListingId,
    },
    #[command(subcommand)]
    Rules(RuleCommands),
    #[command(subcommand)]
    Searches(SearchCommands),
}

#[derive(Debug, Subcommand)]
enum RuleCommands {
    Add(RuleArgs),
    List {
        #[arg(long)]
        enabled_only: bool,
    },
    Toggle {
        id: i64,
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    Delete {
        id: i64,
    },
}

#[derive(Debug, Args)]
struct RuleArgs {
    name: String,
    #[arg(long)]
    min_amount: Option<i64>,
    #[arg(long)]
    remote: bool,
    #[arg(long)]
    site: Option<String>,
    #[arg(long)]
    method: Option<String>,
    #[arg(long)]
    location: Option<String>,
    /// Falls back to PRSF_DEFAULT_DESTINATION when omitted.
    #[arg(long)]
    destination: Option<String>,
}

#[derive(Debug, Subcommand)]
enum SearchCommands {
    Add(SearchArgs),
    List {
        user: String,
    },
    Delete {
        user: String,
        id: i64,
    },
}

#[derive(Debug, Args)]
struct SearchArgs {
    user: String,
    name: String,
    /// Keywords, split on whitespace and commas.
    #[arg(long)]
    query: Option<String>,
    #[arg(long)]
    min_amount: Option<i64>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    method: Option<String>,
    #[arg(long)]
    site: Option<String>,
    #[arg(long)]
    remote_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn,prsf=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let service = SyncService::new(config).await?;
            match service.runner.trigger(Trigger::Manual).await? {
                Some(summary) => println!(
                    "ingest complete: run_id={} found={} new={} updated={} pending={} failed_sources={}",
                    summary.run_id,
                    summary.total_found,
                    summary.new_count,
                    summary.updated_count,
                    summary.pending_count,
                    summary.failed_sources.len()
                ),
                None => println!("ingest skipped: a run is already in progress"),
            }
        }
        Commands::Run => run(config).await?,
        Commands::Serve => {
            let service = SyncService::new(config).await?;
            prsf_web::serve(&service).await?;
        }
        Commands::Status => {
            let service = SyncService::new(config).await?;
            print_json(&service.status().await)?;
        }
        Commands::Stats => print_json(&open_store(&config).await?.stats().await?)?,
        Commands::Clear { reset } => {
            let store = open_store(&config).await?;
            if reset {
                store.reset().await?;
                println!("store reset: listings, posts, moderation cards and rejects removed");
            } else {
                store.clear().await?;
                println!("store cleared: rejects kept");
            }
        }
        Commands::Sweep { rules } => sweep(config, rules).await?,
        Commands::Approve { id, destination } => {
            let service = SyncService::new(config).await?;
            let mut rx = service.events.subscribe();
            let posted = service.sweeper.approve(id, destination.map(Destination::new)).await?;
            drain_alerts(&service, &mut rx).await;
            println!("listing {id}: {}", if posted { "posted" } else { "not pending; nothing done" });
        }
        Commands::Reject { id } => {
            let service = SyncService::new(config).await?;
            let rejected = service.sweeper.reject(id).await?;
            println!("listing {id}: {}", if rejected { "rejected" } else { "not pending; nothing done" });
        }
        Commands::Rules(cmd) => rules(&open_store(&config).await?, cmd).await?,
        Commands::Searches(cmd) => searches(&open_store(&config).await?, cmd).await?,
    }

    Ok(())
}

async fn run(config: SyncConfig) -> Result<()> {
    let service = SyncService::new(config).await?;
    let alerts = service.spawn_alert_worker();
    let scheduler = service.maybe_start_scheduler().await?;
    if scheduler.is_none() {
        info!("scheduler disabled; set PRSF_SCHEDULER_ENABLED=1 to scrape on an interval");
    }

    tokio::select! {
        served = prsf_web::serve(&service) => served?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    if let Some(mut scheduler) = scheduler {
        if let Err(err) = scheduler.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    alerts.abort();
    Ok(())
}

async fn sweep(config: SyncConfig, rules: bool) -> Result<()> {
    let service = SyncService::new(config).await?;
    let mut rx = service.events.subscribe();
    if rules {
        let report = service.sweeper.apply_rules().await;
        println!(
            "rules: matched={} posted={} failed={} unroutable={}",
            report.matched, report.posted, report.failed, report.unroutable
        );
    }
    let report = service.sweeper.announce_pending().await;
    println!("announce: announced={} failed={}", report.announced, report.failed);
    drain_alerts(&service, &mut rx).await;
    Ok(())
}

/// One-shot commands exit right after posting, so alerts are sent inline
/// instead of by the background worker.
async fn drain_alerts(
    service: &SyncService,
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<prsf_sync::ListingPosted>,
) {
    let fanout = AlertFanout::new(service.store.clone(), service.publisher.clone());
    while let Ok(event) = rx.try_recv() {
        fanout.alert(&event.listing).await;
    }
}

async fn rules(store: &ListingStore, cmd: RuleCommands) -> Result<()> {
    match cmd {
        RuleCommands::Add(args) => {
            let params = AutoRuleParams {
                min_amount: args.min_amount,
                require_remote: args.remote,
                site_contains: args.site,
                method_contains: args.method,
                location_contains: args.location,
                destination: args.destination.map(Destination::new),
            };
            let id = store.add_rule(&args.name, &params).await?;
            println!("rule {id} added");
        }
        RuleCommands::List { enabled_only } => print_json(&store.list_rules(enabled_only).await?)?,
        RuleCommands::Toggle { id, enabled } => {
            let found = store.toggle_rule(id, enabled).await?;
            println!("rule {id}: {}", if found { if enabled { "enabled" } else { "disabled" } } else { "not found" });
        }
        RuleCommands::Delete { id } => {
            let found = store.delete_rule(id).await?;
            println!("rule {id}: {}", if found { "deleted" } else { "not found" });
        }
    }
    Ok(())
}

async fn searches(store: &ListingStore, cmd: SearchCommands) -> Result<()> {
    match cmd {
        SearchCommands::Add(args) => {
            let params = SavedSearchParams {
                query: args.query,
                min_amount: args.min_amount,
                location: args.location,
                method: args.method,
                site: args.site,
                remote_only: args.remote_only,
            };
            let id = store.add_saved_search(&args.user, &args.name, &params).await?;
            println!("saved search {id} stored for {}", args.user);
        }
        SearchCommands::List { user } => print_json(&store.list_saved_searches(&user).await?)?,
        SearchCommands::Delete { user, id } => {
            let found = store.delete_saved_search(&user, id).await?;
            println!("saved search {id}: {}", if found { "deleted" } else { "not found" });
        }
    }
    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<ListingStore> {
    ListingStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening listing store at {}", config.database_url))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn rule_toggle_takes_explicit_flag_value() {
        let cli = Cli::try_parse_from(["prsf", "rules", "toggle", "3", "--enabled", "false"]).unwrap();
        match cli.command {
            Some(Commands::Rules(RuleCommands::Toggle { id, enabled })) => {
                assert_eq!(id, 3);
                assert!(!enabled);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn bare_invocation_defaults_to_ingest() {
        let cli = Cli::try_parse_from(["prsf"]).unwrap();
        assert!(cli.command.is_none());
    }
}
