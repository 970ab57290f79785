//! Glimpse background worker
//!
//! Scheduled jobs:
//! - Signup follow-up dispatch (every minute)
//! - Daily metered usage computation (00:10 UTC)
//! - Metered usage reporting to Stripe (00:30 UTC and every 6 hours)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use glimpse_billing::BillingService;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

const FOLLOWUP_BATCH_SIZE: i64 = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Glimpse worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = glimpse_shared::create_pool(&database_url).await?;
    info!("Database pool created");

    let billing = Arc::new(BillingService::from_env(pool, None)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: dispatch due signup follow-ups every minute.
    let messaging = billing.messaging.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let messaging = messaging.clone();
            Box::pin(async move {
                match messaging.dispatch_due_jobs(FOLLOWUP_BATCH_SIZE).await {
                    Ok(0) => {}
                    Ok(count) => info!(count = count, "Dispatched signup follow-ups"),
                    Err(e) => error!(error = %e, "Follow-up dispatch failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: signup follow-up dispatch (every minute)");

    // Job 2: compute yesterday's usage shortly after midnight UTC.
    let compute_service = billing.metered.clone();
    scheduler
        .add(Job::new_async("0 10 0 * * *", move |_uuid, _l| {
            let service = compute_service.clone();
            Box::pin(async move {
                info!("Running daily usage computation");
                if let Err(e) = service.compute_daily_usage(OffsetDateTime::now_utc()).await {
                    error!(error = %e, "Daily usage computation failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: daily usage computation (00:10 UTC)");

    // Job 3: report unreported usage to Stripe. Runs every 6 hours starting
    // at 00:30 so a failed overnight report retries during the day.
    let report_service = billing.metered.clone();
    scheduler
        .add(Job::new_async("0 30 0/6 * * *", move |_uuid, _l| {
            let service = report_service.clone();
            Box::pin(async move {
                info!("Running metered usage report to Stripe");
                match service.report_unreported_usage().await {
                    Ok(summary) => {
                        if summary.failed > 0 {
                            error!(
                                succeeded = summary.succeeded,
                                failed = summary.failed,
                                "Usage report cycle finished with failures"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Usage report cycle failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: metered usage reporting (every 6 hours at :30)");

    // Job 4: heartbeat.
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;
    info!("Scheduled: heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
