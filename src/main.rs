use std::{process, sync::Arc};

use chrono::Utc;
use querycache::{
    application::{
        error::AppError,
        jobs::{build_refresh_monitor, warm_endpoints},
        query::QueryExecutor,
        refresh::Refresher,
    },
    cache::{BlobStore, CacheStore, Payload},
    config,
    domain::{endpoint::Endpoint, schedule::next_fire},
    infra::{
        db::{PoolOptions, PostgresExecutor},
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let detail = error_chain(error);

    if dispatcher::has_been_set() {
        error!(error = %detail, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %detail, "application error");
    });
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut detail = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        detail.push_str(": ");
        detail.push_str(&inner.to_string());
        source = inner.source();
    }
    detail
}

async fn run() -> Result<(), AppError> {
    let cli_args = <config::CliArgs as clap::Parser>::parse();

    if matches!(cli_args.command, Some(config::Command::Example)) {
        print!("{}", config::EXAMPLE_CONFIG);
        return Ok(());
    }

    let settings = config::load(&cli_args)?;
    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Some(config::Command::Check(_)) => run_check(&settings),
        _ => run_serve(settings).await,
    }
}

fn run_check(settings: &config::Settings) -> Result<(), AppError> {
    let now = Utc::now();
    for endpoint in &settings.endpoints {
        let next = next_fire(endpoint.schedule(), now)
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}\t{}\tnext={}\tformat={}\tfile_backed={}",
            endpoint.path(),
            endpoint.schedule_expr(),
            next,
            endpoint.row_format(),
            endpoint.file_backed()
        );
    }

    if settings.database.url.is_none() {
        warn!(
            target = "querycache::check",
            "database url is not configured; `serve` will refuse to start"
        );
    }

    info!(
        target = "querycache::check",
        endpoints = settings.endpoints.len(),
        "configuration is valid"
    );
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let executor = init_executor(&settings)?;
    let blob_dir = &settings.storage.blob_dir;
    let blobs = Arc::new(
        BlobStore::new(blob_dir.clone())
            .map_err(|err| InfraError::blob_dir(blob_dir.clone(), err))?,
    );
    let store = Arc::new(CacheStore::new());
    let refresher = Refresher::new(
        Arc::clone(&store),
        Arc::clone(&blobs),
        Arc::new(executor.clone()) as Arc<dyn QueryExecutor>,
    );

    info!(
        target = "querycache::serve",
        endpoints = settings.endpoints.len(),
        blob_dir = %blobs.dir().display(),
        "starting querycache"
    );

    if settings.server.warm_on_startup {
        warm_endpoints(&settings.endpoints, &refresher).await;
    }

    let monitor_handle = spawn_refresh_monitor(&settings.endpoints, &refresher);

    let state = HttpState {
        store: Arc::clone(&store),
        blobs,
    };
    let result = serve_http(&settings, state).await;

    monitor_handle.abort();
    let _ = monitor_handle.await;

    // The runtime is winding down, so blobs are removed here rather than on
    // the blocking pool.
    let drained = store.drain();
    let removed = drained
        .iter()
        .filter(|entry| matches!(entry.payload(), Payload::Blob(blob) if blob.delete()))
        .count();
    info!(
        target = "querycache::serve",
        entries = drained.len(),
        blobs_removed = removed,
        "cache drained"
    );
    drop(drained);

    executor.close().await;
    result
}

fn init_executor(settings: &config::Settings) -> Result<PostgresExecutor, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or(InfraError::MissingDatabaseUrl)?;

    let options = PoolOptions {
        max_connections: settings.database.max_connections.get(),
        acquire_timeout: settings.database.acquire_timeout,
        idle_timeout: settings.database.idle_timeout,
    };
    let pool = PostgresExecutor::connect_lazy(database_url, &options)
        .map_err(InfraError::Pool)?;

    Ok(PostgresExecutor::new(pool))
}

fn spawn_refresh_monitor(
    endpoints: &[Arc<Endpoint>],
    refresher: &Refresher,
) -> tokio::task::JoinHandle<()> {
    let monitor = build_refresh_monitor(endpoints, refresher);

    tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "refresh monitor stopped");
        }
    })
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state, &settings.endpoints);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| InfraError::bind(settings.server.addr, err))?;
    info!(
        target = "querycache::serve",
        addr = %settings.server.addr,
        "listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(InfraError::Serve)?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(target = "querycache::serve", "shutdown signal received");
}
