use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use helpdesk_sync::config::Config;
use helpdesk_sync::helpdesk::ClientAssociation;
use helpdesk_sync::mail::{ImapConnector, SmtpSenderPool};
use helpdesk_sync::retry::RetryManager;
use helpdesk_sync::store::Store;
use helpdesk_sync::sync::{SyncEngine, SyncError, WorkerEvent, spawn_worker};

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,helpdesk_sync=debug"));

    // Log to a file in the data directory when possible
    let log_file = Config::data_dir()
        .ok()
        .filter(|dir| std::fs::create_dir_all(dir).is_ok())
        .map(|dir| dir.join("helpdesk-sync.log"))
        .and_then(|path| OpenOptions::new().create(true).append(true).open(&path).ok());

    if let Some(file) = log_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"helpdesk-sync - Email-to-ticket synchronization worker

Usage: helpdesk-sync [command]

Commands:
    run         Start the background sync worker (default)
    sync-once   Sync every department once and print the report as JSON
    check       Test IMAP and SMTP access for every department
    customers   Link, enrich and value customers, then print coverage as JSON
    help        Show this help message

Configuration file: ~/.config/helpdesk-sync/config.toml
                    (override with HELPDESK_SYNC_CONFIG)
"#
    );
}

/// Load config, open the database and seed configured departments.
async fn build_engine(config: &Config) -> Result<Arc<SyncEngine>> {
    config.ensure_dirs()?;

    let db_path = config.database_path()?;
    let store = Store::open(&db_path).await?;
    tracing::info!("Using database {}", db_path.display());

    for spec in config.department_specs() {
        let id = store
            .upsert_department(&spec)
            .await
            .with_context(|| format!("Failed to save department {}", spec.name))?;
        tracing::debug!("Department {} loaded (id {})", spec.name, id);
    }

    let retry = Arc::new(RetryManager::new(config.retry_config()));
    let engine = SyncEngine::new(
        store,
        retry,
        Arc::new(ImapConnector::new(config.imap_timeout())),
        Arc::new(SmtpSenderPool::new()),
        config.sync_settings(),
    );
    Ok(Arc::new(engine))
}

async fn run_worker(config: Config) -> Result<()> {
    let engine = build_engine(&config).await?;
    let mut handle = spawn_worker(engine, config.worker_settings());

    println!("helpdesk-sync running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
            event = handle.event_rx.recv() => match event {
                Some(WorkerEvent::CycleComplete { processed, tickets_created }) => {
                    if processed > 0 || !tickets_created.is_empty() {
                        tracing::info!(
                            "Sync cycle: {} messages, {} new tickets",
                            processed,
                            tickets_created.len()
                        );
                    }
                }
                Some(WorkerEvent::DepartmentFailed { name, error, .. }) => {
                    tracing::warn!("Department {} failed: {}", name, error);
                }
                None => break,
            }
        }
    }

    handle.shutdown().await;
    handle.cmd_tx.closed().await;
    tracing::info!("Stopped");
    Ok(())
}

async fn sync_once(config: Config) -> Result<()> {
    let engine = build_engine(&config).await?;
    let report = engine.run_once().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.errors().is_empty() {
        std::process::exit(2);
    }
    Ok(())
}

async fn sync_customers(config: Config) -> Result<()> {
    let engine = build_engine(&config).await?;
    let clients = ClientAssociation::new(engine.store().clone());
    let report = clients.sync_clients(config.sync_settings().create_customers).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_check(config: Config) -> Result<()> {
    let engine = build_engine(&config).await?;
    let departments = engine.store().list_departments().await?;
    if departments.is_empty() {
        println!("No departments configured.");
        return Ok(());
    }

    let mut failures = 0;
    for dept in departments {
        let name = dept.display_name();

        match engine.check_department(dept.id).await {
            Ok(count) => println!("{}: IMAP ok ({} messages)", name, count),
            Err(e) => {
                failures += 1;
                println!("{}: IMAP failed: {}", name, e);
            }
        }

        match engine.verify_smtp(dept.id).await {
            Ok(true) => println!("{}: SMTP ok", name),
            Ok(false) => {
                failures += 1;
                println!("{}: SMTP rejected the connection", name);
            }
            Err(SyncError::MissingCredentials(..)) => {
                println!("{}: SMTP not configured (no acknowledgements)", name)
            }
            Err(e) => {
                failures += 1;
                println!("{}: SMTP failed: {}", name, e);
            }
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        None | Some("run") => {
            setup_logging();
            run_worker(Config::load()?).await
        }
        Some("sync-once") => {
            setup_logging();
            sync_once(Config::load()?).await
        }
        Some("customers") => {
            setup_logging();
            sync_customers(Config::load()?).await
        }
        Some("check") => {
            setup_logging();
            run_check(Config::load()?).await
        }
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }
}
