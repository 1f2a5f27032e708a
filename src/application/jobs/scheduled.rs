//! Cron-driven endpoint refresh workers.
//!
//! Each endpoint gets its own cron worker with a concurrency of one, so two
//! refreshes of the same key never overlap while different endpoints refresh
//! independently.

use std::sync::Arc;

use apalis::{
    layers::WorkerBuilderExt,
    prelude::{Data, Error as ApalisError, Monitor, WorkerBuilder, WorkerFactoryFn},
};
use apalis_cron::{CronContext, CronStream};
use chrono::Utc;
use futures::future::join_all;
use tracing::info;

use crate::{
    application::refresh::{RefreshOutcome, Refresher, Trigger},
    domain::endpoint::Endpoint,
};

/// Job payload for a cron firing. apalis-cron creates it with `Default` and
/// carries the fire time separately in [`CronContext`].
#[derive(Default, Debug, Clone, Copy)]
pub struct RefreshTick;

/// Context for one endpoint's refresh worker.
#[derive(Clone)]
pub struct RefreshJobContext {
    pub endpoint: Arc<Endpoint>,
    pub refresher: Refresher,
}

/// Refresh the worker's endpoint. Failures are contained: they evict the
/// entry and are logged, but never fail the cron stream.
pub async fn process_refresh_job(
    _tick: RefreshTick,
    cron: CronContext<Utc>,
    ctx: Data<RefreshJobContext>,
) -> Result<(), ApalisError> {
    let trigger = Trigger::scheduled(&ctx.endpoint, *cron.get_timestamp());
    ctx.refresher.run(&ctx.endpoint, trigger).await;
    Ok(())
}

/// Register one cron worker per endpoint.
pub fn build_refresh_monitor(endpoints: &[Arc<Endpoint>], refresher: &Refresher) -> Monitor {
    let mut monitor = Monitor::new();

    for endpoint in endpoints {
        let name = format!("refresh:{}", endpoint.path());
        let context = RefreshJobContext {
            endpoint: Arc::clone(endpoint),
            refresher: refresher.clone(),
        };
        let worker = WorkerBuilder::new(&name)
            .concurrency(1)
            .data(context)
            .backend(CronStream::new(endpoint.schedule().clone()))
            .build_fn(process_refresh_job);
        monitor = monitor.register(worker);

        info!(
            target = "application::jobs::refresh",
            path = endpoint.path(),
            schedule = endpoint.schedule_expr(),
            row_format = endpoint.row_format().as_str(),
            file_backed = endpoint.file_backed(),
            next_fire = ?crate::domain::schedule::next_fire(endpoint.schedule(), Utc::now()),
            "registered refresh worker"
        );
    }

    monitor
}

/// Refresh every endpoint once, concurrently, before the cron workers start.
pub async fn warm_endpoints(
    endpoints: &[Arc<Endpoint>],
    refresher: &Refresher,
) -> Vec<RefreshOutcome> {
    let now = Utc::now();
    let outcomes = join_all(endpoints.iter().map(|endpoint| {
        let trigger = Trigger::scheduled(endpoint, now);
        refresher.run(endpoint, trigger)
    }))
    .await;

    let failed = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, RefreshOutcome::Failed { .. }))
        .count();
    info!(
        target = "application::jobs::refresh",
        endpoints = endpoints.len(),
        failed,
        "startup warm-up finished"
    );

    outcomes
}
