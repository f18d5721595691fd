//! PayRecover Background Worker
//!
//! Handles scheduled jobs including:
//! - Due dunning attempt processing (every minute)
//! - Failed payment detection and campaign creation (every minute)
//! - Final action reconciliation (hourly)
//! - Pre-dunning renewal reminders (daily at 9:00 UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use payrecover_dunning::{
    AttemptOutcome, CampaignParams, CampaignTarget, DunningError, DunningService, Notifier,
    ResendNotifier,
};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Run one pass over the due campaigns. Each campaign is processed in
/// isolation; one failure never blocks the rest of the batch.
async fn process_due_campaigns(service: &DunningService) {
    let due = match service
        .campaigns
        .list_due_campaigns(OffsetDateTime::now_utc())
        .await
    {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Failed to list due campaigns");
            return;
        }
    };

    let total = due.len();
    let mut recovered = 0;
    let mut rescheduled = 0;
    let mut exhausted = 0;
    let mut errors = 0;

    for campaign in due {
        match service.attempts.process_due_campaign(&campaign).await {
            Ok(AttemptOutcome::Recovered { .. }) => recovered += 1,
            Ok(AttemptOutcome::Rescheduled { .. }) => rescheduled += 1,
            Ok(AttemptOutcome::Exhausted { .. }) => exhausted += 1,
            Err(e) => {
                error!(campaign_id = %campaign.id, error = %e, "Failed to process due campaign");
                errors += 1;
            }
        }
    }

    if total > 0 {
        info!(
            total = total,
            recovered = recovered,
            rescheduled = rescheduled,
            exhausted = exhausted,
            errors = errors,
            "Dunning attempt cycle complete"
        );
    }
}

/// Scan for subscriptions whose renewal payment failed and open a campaign
/// for each one that does not already have a campaign for that failure.
async fn detect_failed_payments(pool: &sqlx::PgPool, service: &DunningService) {
    let failures: Vec<(Uuid, Uuid, Uuid, i64, String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT s.id, s.workspace_id, s.customer_id, s.plan_amount_cents,
               s.currency, s.last_payment_error
        FROM subscriptions s
        WHERE s.status = 'past_due'
          AND s.last_failed_at IS NOT NULL
          AND NOT EXISTS (
              SELECT 1 FROM dunning_campaigns dc
              WHERE dc.subscription_id = s.id
                AND dc.created_at >= s.last_failed_at
          )
        LIMIT 200
        "#,
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();

    let total = failures.len();
    let mut opened = 0;
    let mut skipped = 0;
    let mut errors = 0;

    for (subscription_id, workspace_id, customer_id, amount_cents, currency, failure) in failures {
        let config = match service.policies.get_default_configuration(workspace_id).await {
            Ok(config) => config,
            Err(DunningError::NotFound(_)) => {
                // Workspace has not opted into dunning
                skipped += 1;
                continue;
            }
            Err(e) => {
                error!(workspace_id = %workspace_id, error = %e, "Failed to load default configuration");
                errors += 1;
                continue;
            }
        };

        let result = service
            .campaigns
            .create_campaign(CampaignParams {
                configuration_id: config.id,
                target: CampaignTarget::Subscription(subscription_id),
                customer_id: Some(customer_id),
                original_failure_reason: failure.unwrap_or_else(|| "payment_failed".to_string()),
                original_amount_cents: amount_cents,
                currency,
            })
            .await;

        match result {
            Ok(_) => opened += 1,
            // Another worker instance opened it first
            Err(DunningError::CampaignAlreadyActive(_)) => skipped += 1,
            Err(e) => {
                error!(subscription_id = %subscription_id, error = %e, "Failed to open campaign");
                errors += 1;
            }
        }
    }

    if total > 0 {
        info!(
            total = total,
            opened = opened,
            skipped = skipped,
            errors = errors,
            "Failed payment detection complete"
        );
    }
}

/// Send renewal reminders for workspaces whose default configuration has
/// pre-dunning reminders enabled.
async fn send_pre_dunning_reminders(pool: &sqlx::PgPool, notifier: &dyn Notifier) {
    let upcoming: Vec<(Uuid, Uuid, i64, String, OffsetDateTime)> = sqlx::query_as(
        r#"
        SELECT s.id, s.customer_id, s.plan_amount_cents, s.currency, s.current_period_end
        FROM subscriptions s
        JOIN dunning_configurations c
          ON c.workspace_id = s.workspace_id AND c.is_default = true
        WHERE s.status = 'active'
          AND c.pre_dunning_reminder_enabled = true
          AND s.current_period_end <= NOW() + (c.pre_dunning_reminder_days || ' days')::interval
          AND s.current_period_end > NOW()
          AND (s.pre_dunning_reminded_at IS NULL
               OR s.pre_dunning_reminded_at < s.current_period_start)
        LIMIT 500
        "#,
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();

    let total = upcoming.len();
    let mut sent = 0;
    let mut errors = 0;

    for (subscription_id, customer_id, amount_cents, currency, period_end) in upcoming {
        let variables = serde_json::json!({
            "amount_cents": amount_cents,
            "currency": currency,
            "renewal_date": period_end.to_string(),
        });

        match notifier
            .send("pre_dunning_reminder", customer_id, variables)
            .await
        {
            Ok(()) => {
                let marked = sqlx::query(
                    "UPDATE subscriptions SET pre_dunning_reminded_at = NOW() WHERE id = $1",
                )
                .bind(subscription_id)
                .execute(pool)
                .await;
                if let Err(e) = marked {
                    error!(subscription_id = %subscription_id, error = %e, "Failed to mark reminder sent");
                }
                sent += 1;
            }
            Err(e) => {
                error!(subscription_id = %subscription_id, error = %e, "Failed to send renewal reminder");
                errors += 1;
            }
        }
    }

    if total > 0 {
        info!(
            total = total,
            sent = sent,
            errors = errors,
            "Pre-dunning reminder cycle complete"
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

    info!("Starting PayRecover Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create dunning service
    let service = match DunningService::from_env(pool.clone()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            // If Stripe/Resend aren't configured, run in minimal mode
            warn!(error = %e, "Failed to create dunning service - running in minimal mode");
            info!("Worker running without payment provider integration");

            // Keep running with minimal functionality
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Process due dunning attempts (every minute)
    let attempt_service = service.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let service = attempt_service.clone();
            Box::pin(async move {
                process_due_campaigns(&service).await;
            })
        })?)
        .await?;
    info!("Scheduled: Due dunning attempt processing (every minute)");

    // Job 2: Detect failed payments and open campaigns (every minute)
    let detect_pool = pool.clone();
    let detect_service = service.clone();
    scheduler
        .add(Job::new_async("30 * * * * *", move |_uuid, _l| {
            let pool = detect_pool.clone();
            let service = detect_service.clone();
            Box::pin(async move {
                detect_failed_payments(&pool, &service).await;
            })
        })?)
        .await?;
    info!("Scheduled: Failed payment detection (every minute)");

    // Job 3: Reconcile incomplete final actions (hourly)
    // Closes the window where a campaign failed but its subscription action
    // never landed (provider outage, crash between writes)
    let reconcile_service = service.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let service = reconcile_service.clone();
            Box::pin(async move {
                info!("Running final action reconciliation");
                if let Err(e) = service.reconciler.run().await {
                    error!(error = %e, "Reconciliation pass failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Final action reconciliation (hourly)");

    // Job 4: Pre-dunning renewal reminders (daily at 9:00 UTC)
    let reminder_pool = pool.clone();
    let reminder_notifier: Arc<dyn Notifier> = Arc::new(ResendNotifier::from_env(pool.clone())?);
    scheduler
        .add(Job::new_async("0 0 9 * * *", move |_uuid, _l| {
            let pool = reminder_pool.clone();
            let notifier = reminder_notifier.clone();
            Box::pin(async move {
                info!("Running pre-dunning reminder job");
                send_pre_dunning_reminders(&pool, notifier.as_ref()).await;
            })
        })?)
        .await?;
    info!("Scheduled: Pre-dunning reminders (daily at 9:00 UTC)");

    // Job 5: Health check heartbeat (every 5 minutes)
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

    info!(
        "PayRecover Worker started successfully with {} scheduled jobs",
        5
    );

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
