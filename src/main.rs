//! scopedb - Main entry point.
//!
//! Command line runner for the migration engine: applies, creates, rolls
//! back, lists, and merges migration steps against a configured database.

use clap::Parser;
use scopedb::config::{Command, Config};
use scopedb::conn::ConnectionManager;
use scopedb::error::DbError;
use scopedb::migrate::MigrationRouter;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn run(config: &Config) -> Result<(), DbError> {
    let manager = ConnectionManager::from_url(&config.database)?;
    let router = MigrationRouter::new(&manager, &config.migrations_path);
    let scope = manager.scope();

    let result = dispatch(config, &router, scope.id()).await;
    manager.shutdown().await;
    result
}

async fn dispatch(
    config: &Config,
    router: &MigrationRouter<'_>,
    scope: scopedb::conn::ScopeId,
) -> Result<(), DbError> {
    match &config.command {
        Command::Migrate { name, fake } => {
            let applied = router.run(scope, name.as_deref(), *fake).await?;
            if applied.is_empty() {
                println!("Nothing to apply");
            } else {
                for step in &applied {
                    println!("Applied {}", step);
                }
            }
        }
        Command::Create { name } => {
            let step = router.create(name)?;
            println!("Created {}", step);
        }
        Command::Rollback => {
            let step = router.rollback(scope).await?;
            println!("Rolled back {}", step);
        }
        Command::List => {
            for step in router.done(scope).await? {
                println!("[x] {}", step);
            }
            for step in router.pending(scope).await? {
                println!("[ ] {}", step);
            }
        }
        Command::Merge { name } => {
            let step = router.merge(scope, name).await?;
            println!("Merged into {}", step);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let config = Config::parse();
    init_tracing(&config);

    info!(
        migrations = %config.migrations_path.display(),
        "Starting scopedb v{}",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = run(&config).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        if let Some(suggestion) = e.suggestion() {
            eprintln!("Hint: {}", suggestion);
        }
        std::process::exit(1);
    }
}
