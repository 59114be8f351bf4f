//! Entitle Background Worker
//!
//! Handles scheduled jobs including:
//! - Renewal sweep for recurring subscriptions expiring tomorrow (daily at 00:05 UTC)
//! - Subscription invariant checks (daily at 03:00 UTC)
//! - Heartbeat (every 5 minutes)
//!
//! `entitle-worker --once` runs a single renewal sweep and exits. The exit status
//! reflects whether the sweep ran, not whether every renewal succeeded.

mod config;

use std::sync::Arc;
use std::time::Duration;

use entitle_subscriptions::{
    InvariantCheckSummary, PgStore, RenewalResult, RenewalSweep, SubscriptionService,
    SweepReport, SystemClock, TracingDispatcher,
};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::WorkerConfig;

/// Create a database connection pool
async fn create_db_pool(config: &WorkerConfig) -> anyhow::Result<sqlx::PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log results of a renewal sweep
fn log_sweep_report(report: &SweepReport) {
    info!(
        candidates = report.candidates,
        owners = report.owners,
        renewed = report.renewed(),
        skipped = report.skipped(),
        failed = report.failed(),
        "Renewal sweep cycle complete"
    );

    // Log individual failures
    for result in &report.results {
        if let RenewalResult::Failed {
            subscription_id,
            owner,
            error,
        } = result
        {
            error!(subscription_id = %subscription_id, owner = %owner, error = %error, "Failed to renew subscription");
        }
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy() {
        info!(
            checks_run = summary.checks_run,
            subscriptions = summary.subscriptions_checked,
            "Subscription invariants healthy"
        );
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        owners = summary.affected_owners.len(),
        owners_with_wrong_access = summary.owners_with_wrong_access.len(),
        "Subscription invariant violations found"
    );
    for violation in &summary.violations {
        let owner = violation.owner.as_ref().map(ToString::to_string);
        warn!(
            invariant = %violation.invariant,
            owner = owner.as_deref().unwrap_or("-"),
            severity = %violation.severity,
            subscriptions = ?violation.subscription_ids,
            context = %violation.context,
            "{}",
            violation.description
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    let run_once = std::env::args().skip(1).any(|arg| arg == "--once");

    info!(run_once, "Starting Entitle Worker");

    let pool = create_db_pool(&config).await?;
    let store = Arc::new(PgStore::new(pool));
    if config.run_migrations {
        store.migrate().await?;
        info!("Database migrations applied");
    }

    let service = Arc::new(SubscriptionService::new(
        store,
        Arc::new(TracingDispatcher),
        Arc::new(SystemClock),
        config.subscriptions,
    ));
    let sweep: Arc<RenewalSweep<PgStore>> = Arc::new(
        service
            .renewal_sweep()
            .marking_as_paid(config.renewal_mark_as_paid),
    );

    if run_once {
        let report = sweep.run().await?;
        log_sweep_report(&report);
        return Ok(());
    }

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Renew recurring subscriptions expiring at the end of tomorrow
    let renewal_sweep = sweep.clone();
    scheduler
        .add(Job::new_async(config.renewal_cron.as_str(), move |_uuid, _l| {
            let sweep = renewal_sweep.clone();
            Box::pin(async move {
                info!("Running scheduled renewal sweep");
                match sweep.run().await {
                    Ok(report) => log_sweep_report(&report),
                    Err(e) => error!(error = %e, "Renewal sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %config.renewal_cron, "Scheduled: Renewal sweep");

    // Job 2: Invariant checks
    let invariant_service = service.clone();
    scheduler
        .add(Job::new_async(config.invariant_cron.as_str(), move |_uuid, _l| {
            let service = invariant_service.clone();
            Box::pin(async move {
                info!("Running subscription invariant checks");
                match service.invariants.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %config.invariant_cron, "Scheduled: Invariant checks");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Entitle Worker started successfully with {} scheduled jobs", 3);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping worker");

    let mut scheduler = scheduler;
    scheduler.shutdown().await?;
    Ok(())
}
