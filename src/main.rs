use std::{process, sync::Arc};

use scriptorium::{
    application::{
        error::AppError,
        site::{SiteRepositories, SiteService},
    },
    cache::{CacheConfig, CacheStore, CacheTrigger},
    config,
    infra::{
        db::DbHandle,
        error::InfraError,
        setup::{self, InitOutcome},
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %error, chain = %report.chain(), "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = %report.chain(), "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(InfraError::from)?;
    let command = cli_args.command.unwrap_or(config::Command::Setup);

    telemetry::init(&settings.logging)?;

    let handle = DbHandle::connect(&settings.database).await?;
    let result = match command {
        config::Command::Setup => run_setup(&handle).await,
        config::Command::Status => run_status(&handle).await,
        config::Command::Warm => run_warm(&handle, &settings).await,
    };
    handle.close().await;
    result
}

async fn run_setup(handle: &DbHandle) -> Result<(), AppError> {
    let runner = handle.setup_runner();
    let outcome = setup::ensure_ready(runner.as_ref()).await?;
    info!(
        target = "scriptorium::setup",
        backend = %handle.backend(),
        outcome = %outcome,
        "Setup finished"
    );
    Ok(())
}

async fn run_status(handle: &DbHandle) -> Result<(), AppError> {
    let runner = handle.setup_runner();
    match runner.marker().await? {
        Some(marker) => info!(
            target = "scriptorium::status",
            backend = %handle.backend(),
            schema_version = marker.schema_version,
            initialized_at = %marker.initialized_at,
            "Database is initialized"
        ),
        None => info!(
            target = "scriptorium::status",
            backend = %handle.backend(),
            "Database needs first-run setup"
        ),
    }
    Ok(())
}

async fn run_warm(handle: &DbHandle, settings: &config::Settings) -> Result<(), AppError> {
    let runner = handle.setup_runner();
    if setup::ensure_ready(runner.as_ref()).await? == InitOutcome::Initialized {
        info!(target = "scriptorium::warm", "Initialized database before warm-up");
    }

    let store = Arc::new(CacheStore::new(CacheConfig::from(&settings.cache)));
    let trigger = Arc::new(CacheTrigger::with_defaults(store.clone()));
    let repos = SiteRepositories {
        posts: handle.cached_repository(&trigger),
        categories: handle.cached_repository(&trigger),
        pages: handle.cached_repository(&trigger),
        menus: handle.cached_repository(&trigger),
        configurations: handle.cached_repository(&trigger),
    };

    let site = SiteService::new(repos, store);
    let entries = site.warm().await?;
    info!(target = "scriptorium::warm", entries, "Warm-up complete");
    Ok(())
}
