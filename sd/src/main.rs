use std::sync::{Arc, Mutex};

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use statedb::cli::{Cli, Command};
use statedb::config::Config;
use statedb::lifecycle::{ExitHooks, WorkerSettings, install};
use statedb::{LamportClock, LogicalClock, Migrator, WorkerIdentity, WorkerStateStore, codec};

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let level = match cli_log_level.map(|s| s.to_uppercase()) {
        None => tracing::Level::INFO,
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    debug!(?level, "Logging initialized");
    Ok(())
}

async fn open_store(settings: &WorkerSettings) -> Result<WorkerStateStore> {
    let store_settings = settings
        .store_settings()
        .ok_or_else(|| eyre!("No store configured; pass --url redis://... or set store.url in the config"))?;
    let identity = WorkerIdentity::new(settings.hostname.clone())?;
    let store = WorkerStateStore::connect(&store_settings, identity)
        .await
        .context(format!("Failed to connect to {}", store_settings.redis.url))?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(url) = &cli.url {
        config.store.url = Some(url.clone());
    }
    if let Some(prefix) = &cli.key_prefix {
        config.store.key_prefix = Some(prefix.clone());
    }
    if let Command::Run { interval, migrate, .. } = &cli.command {
        if let Some(secs) = interval {
            config.sync.interval_secs = Some(*secs);
        }
        if let Some(path) = migrate {
            config.store.migrate_statedb = Some(path.clone());
        }
    }
    config.validate().context("Invalid configuration")?;

    let worker = cli
        .worker_identity()
        .ok_or_else(|| eyre!("No worker identity; pass --worker or set HOSTNAME"))?;
    let settings = config.worker_settings(worker);

    match cli.command {
        Command::Ping => {
            let store = open_store(&settings).await?;
            let reachable = store.ping().await;
            store.close().await;
            if !reachable {
                return Err(eyre!("Store did not answer PING"));
            }
            println!("{} Store reachable", "✓".green());
        }
        Command::Show { ids } => {
            let store = open_store(&settings).await?;
            let clock = store.get_clock().await?;
            let revoked = match store.get_revoked_blob().await? {
                Some(blob) => Some(codec::decode(&blob).context("Persisted revoked set is unreadable")?),
                None => None,
            };
            store.close().await;

            println!("Worker: {}", store.identity().to_string().cyan());
            println!("  Prefix: {}", store.namespace().prefix());
            match &revoked {
                Some(set) => println!("  Revoked: {}", set.len()),
                None => println!("  Revoked: {}", "none".dimmed()),
            }
            match clock {
                Some(value) => println!("  Clock: {}", value),
                None => println!("  Clock: {}", "unset".dimmed()),
            }
            if ids {
                for (task_id, _) in revoked.iter().flat_map(|set| set.iter()) {
                    println!("    {}", task_id.yellow());
                }
            }
        }
        Command::Clear => {
            let store = open_store(&settings).await?;
            store.clear().await?;
            store.close().await;
            println!("{} Cleared state for {}", "✓".green(), settings.hostname);
        }
        Command::Migrate { path } => {
            let store = open_store(&settings).await?;
            let result = Migrator::new(&path, &store).run().await;
            store.close().await;
            let report = result.context(format!("Failed to migrate {}", path.display()))?;

            match report.format {
                Some(format) => println!("{} Imported {} revokes ({})", "✓".green(), report.entries, format),
                None => println!("{} No revokes in {}", "-".dimmed(), path.display()),
            }
            if let Some(clock) = report.clock {
                println!("  Clock: {}", clock);
            }
            println!("  Backup: {}", report.backup.display());
            println!("  Renamed: {}", report.renamed.display());
        }
        Command::Run { revoke, once, .. } => {
            let revoked = Arc::new(Mutex::new(config.revokes.new_set()));
            let clock: Arc<dyn LogicalClock> = Arc::new(LamportClock::default());
            let mut hooks = ExitHooks::new();

            let reconciler = install(&settings, revoked.clone(), Some(clock.clone()), &mut hooks)
                .await?
                .ok_or_else(|| eyre!("Store-backed state is disabled; pass --url redis://..."))?;

            let restored = revoked.lock().map(|set| set.len()).unwrap_or_default();
            println!(
                "{} Worker {} ready ({} revoked, clock {})",
                "✓".green(),
                settings.hostname.cyan(),
                restored,
                clock.value()
            );

            if let Ok(mut set) = revoked.lock() {
                for task_id in revoke {
                    set.insert(task_id);
                }
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let periodic = config
                .sync
                .interval()
                .and_then(|every| reconciler.spawn_periodic_sync(every, shutdown_rx));

            if !once {
                info!("Waiting for Ctrl-C");
                tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            }

            let _ = shutdown_tx.send(true);
            if let Some(handle) = periodic {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Periodic sync task ended abnormally");
                }
            }
            hooks.run_all().await;
            println!("{} Saved state (clock {})", "✓".green(), clock.value());
        }
    }

    Ok(())
}
