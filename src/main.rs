use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keypool::api::handlers::{resolve_quota_limit, resolve_refreshes_at};
use keypool::config::{self, Config, LedgerBackend};
use keypool::models::credential::NewCredential;
use keypool::store::memory::MemoryLedger;
use keypool::store::postgres::PgStore;
use keypool::store::Ledger;
use keypool::{build_router, jobs, AppState};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "keypool=debug,tower_http=debug".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if cfg.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        Some(cli::Commands::Credential { command }) => {
            let ledger = open_ledger(&cfg).await?;
            handle_credential_command(ledger, cfg, command).await
        }
        None => run_server(cfg, None).await,
    };

    if let Err(e) = result {
        tracing::error!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn open_ledger(cfg: &Config) -> anyhow::Result<Arc<dyn Ledger>> {
    match cfg.ledger {
        LedgerBackend::Postgres => {
            tracing::info!("Connecting to database...");
            let db = PgStore::connect(&cfg.database_url)
                .await
                .context("failed to connect to database")?;
            tracing::info!("Running migrations...");
            db.migrate().await?;
            Ok(Arc::new(db))
        }
        LedgerBackend::Memory => {
            tracing::warn!("using in-memory ledger; credential state is lost on exit");
            Ok(Arc::new(MemoryLedger::new()))
        }
    }
}

async fn run_server(mut cfg: Config, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(p) = port {
        cfg.port = p;
    }

    let ledger = open_ledger(&cfg).await?;
    let refresh_every = Duration::from_secs(cfg.refresh_interval_secs);
    let port = cfg.port;

    let state = Arc::new(AppState::new(ledger, cfg)?);

    if jobs::refresh::spawn(state.health.clone(), refresh_every).is_some() {
        tracing::info!(every_secs = refresh_every.as_secs(), "Background credential refresh started");
    }

    let app = build_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        upstream = %state.upstream.base_url().await,
        cost_per_request = state.config.quota.cost_per_request,
        "keypool listening on {}",
        addr
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("shutting down");
}

async fn handle_credential_command(
    ledger: Arc<dyn Ledger>,
    cfg: Config,
    cmd: cli::CredentialCommands,
) -> anyhow::Result<()> {
    match cmd {
        cli::CredentialCommands::Add {
            secret,
            quota_limit,
            refreshes_at,
        } => {
            let new = NewCredential {
                secret: secret.trim().to_string(),
                quota_limit: resolve_quota_limit(quota_limit, cfg.quota.default_quota_limit),
                refreshes_at: Some(resolve_refreshes_at(refreshes_at, Utc::now())),
            };
            if new.secret.is_empty() {
                anyhow::bail!("secret must not be empty");
            }
            let cred = ledger.insert(&new).await?;
            println!("Credential stored:");
            println!("  ID:           {}", cred.id);
            println!("  Key:          {}", cred.view().key);
            println!("  Quota limit:  {}", cred.quota_limit);
            if let Some(at) = cred.refreshes_at {
                println!("  Refreshes at: {}", at.to_rfc3339());
            }
        }

        cli::CredentialCommands::List => {
            let creds = ledger.list_credentials().await?;
            if creds.is_empty() {
                println!("No credentials found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<10} {:>12} {:>8} {:>7}",
                "ID", "KEY", "USED/LIMIT", "ACTIVE", "ERRORS"
            );
            for c in creds {
                let v = c.view();
                println!(
                    "{:<38} {:<10} {:>12} {:>8} {:>7}",
                    v.id,
                    v.key,
                    format!("{}/{}", v.quota_used, v.quota_limit),
                    v.is_active,
                    v.error_count
                );
            }
        }

        cli::CredentialCommands::Delete { id } => {
            if ledger.delete(id).await? {
                println!("Credential {} deleted.", id);
            } else {
                anyhow::bail!("credential {} not found", id);
            }
        }

        cli::CredentialCommands::Refresh { id } => {
            let state = AppState::new(ledger, cfg)?;
            match id {
                Some(id) => {
                    let outcome = state.health.refresh(id).await?;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
                None => {
                    let summary = state.health.refresh_all().await?;
                    println!(
                        "Refreshed {} credentials: {} updated, {} failed.",
                        summary.total, summary.updated, summary.failed
                    );
                }
            }
        }
    }
    Ok(())
}
