//! `checkline` - CLI for the inspection checklist queue
//!
//! This binary finalizes filled-in checklists into the local queue and
//! delivers the queue to the records service.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use checkline::cli::{ChecklistInput, Cli, Command, ConfigCommand};
use checkline::remote::RemoteService;
use checkline::session::SnapshotStore;
use checkline::storage;
use checkline::{
    init_logging, ChecklistSession, Config, Connectivity, ConnectivityProbe, DrainOutcome,
    HttpRemoteService, Principal, SessionContext, SessionLimits, StaticCatalog, Storage,
    SubmissionId, SyncOptions, SyncOrchestrator, TemplateCatalog,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone())?;
    let actor = cli
        .actor
        .clone()
        .or_else(|| config.operator.principal.clone())
        .map(Principal::new);

    // Execute the command
    match cli.command {
        Command::Submit(cmd) => handle_submit(&config, actor, &cmd.file).await,
        Command::Status(cmd) => handle_status(&config, cmd.json).await,
        Command::List(cmd) => handle_list(&config, cmd.json).await,
        Command::Sync => handle_sync(&config).await,
        Command::Watch => handle_watch(&config).await,
        Command::Retry(cmd) => handle_retry(&config, actor, &cmd.id).await,
        Command::Delete(cmd) => handle_delete(&config, actor, &cmd.id).await,
        Command::Timeline(cmd) => handle_timeline(&config, &cmd.id, cmd.json).await,
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

fn open_storage(config: &Config) -> anyhow::Result<Arc<Storage>> {
    let path = config.database_path();
    let storage = Storage::open(&path)
        .with_context(|| format!("opening queue at {}", path.display()))?;
    Ok(Arc::new(storage))
}

fn parse_id(id: &str) -> anyhow::Result<SubmissionId> {
    id.parse::<SubmissionId>()
        .with_context(|| format!("invalid submission id '{id}'"))
}

struct Engine {
    orchestrator: SyncOrchestrator,
    probe: ConnectivityProbe,
}

fn build_engine(config: &Config, storage: Arc<Storage>) -> anyhow::Result<Engine> {
    let remote: Arc<dyn RemoteService> = Arc::new(HttpRemoteService::new(&config.remote)?);
    let connectivity = Connectivity::new(false);
    let probe = ConnectivityProbe::new(
        Arc::clone(&remote),
        connectivity.clone(),
        config.probe_interval(),
    );
    let orchestrator = SyncOrchestrator::new(
        storage,
        remote,
        connectivity,
        SyncOptions::from(config),
        Principal::system(),
    );
    Ok(Engine {
        orchestrator,
        probe,
    })
}

async fn handle_submit(
    config: &Config,
    actor: Option<Principal>,
    file: &Path,
) -> anyhow::Result<()> {
    let Some(operator) = actor else {
        bail!("no operator identity: pass --actor or set operator.principal in the configuration");
    };

    let input = ChecklistInput::load(file)
        .with_context(|| format!("reading checklist {}", file.display()))?;
    let catalog_path = config.catalog_path();
    let catalog = StaticCatalog::load(&catalog_path)
        .with_context(|| format!("loading templates from {}", catalog_path.display()))?;
    let template = catalog.template(&input.asset_type)?;

    let storage = open_storage(config)?;
    let mut session = ChecklistSession::start(
        SessionContext::new(input.asset_id.clone(), operator),
        &template,
        Arc::clone(&storage) as Arc<dyn SnapshotStore>,
        SessionLimits::from(&config.session),
    )?;
    if session.is_restored() {
        warn!(
            "Replacing an interrupted session for asset {}",
            input.asset_id
        );
    }

    let base_dir = file.parent().unwrap_or_else(|| Path::new("."));
    if let Err(e) = input.apply(&mut session, base_dir) {
        session.abandon()?;
        return Err(e.into());
    }

    let progress = session.progress();
    let new = match session.finalize() {
        Ok(new) => new,
        Err(failed) => {
            // A file is submitted whole; keeping a half-applied snapshot
            // would leak its verdicts into the next attempt.
            failed.session.abandon()?;
            return Err(failed.error.into());
        }
    };

    let id = storage::blocking(&storage, move |s| s.enqueue(&new)).await?;
    println!(
        "Queued submission {} ({} of {} item(s))",
        id, progress.completed, progress.total
    );
    Ok(())
}

async fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let stats = storage::blocking(&storage, Storage::stats).await?;
    let unacknowledged = stats.pending + stats.syncing + stats.failed;
    let now = chrono::Utc::now();
    let delivering = storage::blocking(&storage, Storage::drain_lease)
        .await?
        .filter(|lease| !lease.is_expired(now));

    if json {
        let status = serde_json::json!({
            "database_path": storage.path(),
            "unacknowledged": unacknowledged,
            "pending": stats.pending,
            "syncing": stats.syncing,
            "failed": stats.failed,
            "attachments": stats.attachments,
            "attachment_bytes": stats.attachment_bytes,
            "timeline_events": stats.timeline_events,
            "oldest_finalized": stats.oldest_finalized,
            "db_size_bytes": stats.db_size_bytes,
            "delivering": delivering.as_ref().map(|lease| serde_json::json!({
                "owner": lease.owner,
                "expires_at": lease.expires_at,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("checkline status");
        println!("----------------");
        println!("Database:        {}", storage.path().display());
        println!("Unacknowledged:  {unacknowledged}");
        println!("  Pending:       {}", stats.pending);
        println!("  Syncing:       {}", stats.syncing);
        println!("  Failed:        {}", stats.failed);
        println!(
            "Photos:          {} ({} bytes)",
            stats.attachments, stats.attachment_bytes
        );
        println!("Timeline events: {}", stats.timeline_events);
        if let Some(oldest) = stats.oldest_finalized {
            println!("Oldest:          {}", oldest.to_rfc3339());
        }
        if let Some(lease) = &delivering {
            println!(
                "Delivering:      {} (lease until {})",
                lease.owner,
                lease.expires_at.to_rfc3339()
            );
        }
    }
    Ok(())
}

async fn handle_list(config: &Config, json: bool) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let submissions = storage::blocking(&storage, Storage::list_all).await?;
    let max_attempts = config.sync.max_attempts;

    if json {
        let rows: Vec<_> = submissions
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id,
                    "target_asset_id": s.target_asset_id,
                    "template_id": s.template_id,
                    "operator": s.operator,
                    "finalized_at": s.finalized_at,
                    "status": s.status,
                    "state": s.state(max_attempts),
                    "sync_attempts": s.sync_attempts,
                    "attachments": s.attachments.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if submissions.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for s in &submissions {
        println!(
            "{}  {:<16} {}  {}",
            s.id,
            s.target_asset_id,
            s.finalized_at.format("%Y-%m-%d %H:%M"),
            s.state(max_attempts)
        );
        if let Some(last_error) = &s.last_error {
            println!("    last error: {last_error}");
        }
    }
    Ok(())
}

fn print_outcome(outcome: &DrainOutcome) {
    match outcome {
        DrainOutcome::Skipped { reason } => println!("Sync skipped: {reason}"),
        DrainOutcome::Completed(report) => {
            println!(
                "Synced {} of {} attempted ({} already on the service)",
                report.synced, report.attempted, report.already_committed
            );
            for failure in &report.failures {
                println!(
                    "  {} failed (attempt {}): {}",
                    failure.submission_id, failure.attempts, failure.message
                );
            }
            if report.needs_attention > 0 {
                println!(
                    "{} submission(s) need attention; use `checkline retry <ID>` or `checkline delete <ID>`",
                    report.needs_attention
                );
            }
            if report.cancelled {
                println!("Sync was cancelled.");
            }
            println!("{} submission(s) still queued", report.pending_after);
        }
    }
}

async fn handle_sync(config: &Config) -> anyhow::Result<()> {
    let engine = build_engine(config, open_storage(config)?)?;
    let recovered = engine.orchestrator.recover().await?;
    if !recovered.is_empty() {
        println!("Recovered {} interrupted submission(s)", recovered.len());
    }

    engine.probe.probe_once().await;
    let outcome = engine.orchestrator.drain().await?;
    print_outcome(&outcome);
    Ok(())
}

async fn handle_watch(config: &Config) -> anyhow::Result<()> {
    let engine = build_engine(config, open_storage(config)?)?;
    engine.orchestrator.recover().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = engine.orchestrator.handle();
    let orchestrator = Arc::new(engine.orchestrator);

    let probe_task = tokio::spawn(engine.probe.run(shutdown_rx.clone()));
    let sync_task = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run(shutdown_rx).await })
    };

    info!("Watching queue; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    handle.cancel();
    // Receivers may already be gone if a task ended early.
    let _ = shutdown_tx.send(true);
    probe_task.await?;
    sync_task.await?;

    println!("{} submission(s) still queued", orchestrator.pending_count());
    Ok(())
}

async fn handle_retry(config: &Config, actor: Option<Principal>, id: &str) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    let actor = actor.unwrap_or_else(Principal::system);
    let engine = build_engine(config, open_storage(config)?)?;

    engine.probe.probe_once().await;
    let outcome = engine.orchestrator.retry(id, &actor).await?;
    println!("Submission {id} requeued");
    print_outcome(&outcome);
    Ok(())
}

async fn handle_delete(config: &Config, actor: Option<Principal>, id: &str) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    let actor = actor.unwrap_or_else(Principal::system);
    let engine = build_engine(config, open_storage(config)?)?;

    if engine.orchestrator.delete(id, &actor).await? {
        println!("Submission {id} deleted");
    } else {
        println!("Submission {id} was not queued");
    }
    Ok(())
}

async fn handle_timeline(config: &Config, id: &str, json: bool) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    let storage = open_storage(config)?;
    let events = storage::blocking(&storage, move |s| s.timeline(&id)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        println!("No timeline recorded for {id}");
        return Ok(());
    }
    for event in &events {
        println!(
            "{}  {:<12} {:<20} {}",
            event.occurred_at.format("%Y-%m-%d %H:%M:%S"),
            event.operation,
            event.actor,
            event.description
        );
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                let mut value = serde_json::to_value(config)?;
                if let Some(token) = value.pointer_mut("/remote/api_token") {
                    if !token.is_null() {
                        *token = serde_json::Value::String("<redacted>".to_string());
                    }
                }
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!();
                println!("[Sync]");
                println!("  Max attempts:       {}", config.sync.max_attempts);
                println!("  Poll interval (s):  {}", config.sync.poll_interval_secs);
                println!("  Probe interval (s): {}", config.sync.probe_interval_secs);
                println!();
                println!("[Session]");
                println!(
                    "  Photos per item:    {}",
                    config.session.max_attachments_per_item
                );
                println!();
                println!("[Remote]");
                println!("  Base URL:           {}", config.remote.base_url);
                println!(
                    "  API token:          {}",
                    if config.remote.api_token.is_some() {
                        "set"
                    } else {
                        "not set"
                    }
                );
                println!("  Timeout (s):        {}", config.remote.timeout_secs);
                println!();
                println!("[Catalog]");
                println!("  Templates:          {}", config.catalog_path().display());
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
