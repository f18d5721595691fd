//! Ledger store contract and Postgres implementation
//!
//! The engine reaches persistence only through the narrow `LedgerStore`
//! trait. The store is the source of truth for the two concurrency
//! guarantees the engine relies on: at most one active campaign per target
//! and unique `(campaign_id, attempt_number)` pairs. In Postgres both are
//! real constraints (see `migrations/0001_dunning.sql`); the engine's own
//! lookups are optimizations on top.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::attempt::{AttemptStatus, AttemptType, DunningAttempt};
use crate::campaign::{CampaignStatus, CampaignTarget, DunningCampaign};
use crate::error::{DunningError, DunningResult};
use crate::policy::{DunningConfiguration, FinalAction};

/// Persistence contract for configurations, campaigns and attempts
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persist a configuration. When `is_default` is set, any existing
    /// default for the workspace is cleared in the same atomic write; a
    /// failure aborts the whole creation.
    async fn create_configuration(&self, config: &DunningConfiguration) -> DunningResult<()>;
    async fn get_configuration(&self, id: Uuid) -> DunningResult<Option<DunningConfiguration>>;
    async fn get_default_configuration(
        &self,
        workspace_id: Uuid,
    ) -> DunningResult<Option<DunningConfiguration>>;
    /// Update the non-structural fields (name/description) only
    async fn update_configuration_labels(
        &self,
        id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> DunningResult<()>;
    async fn configuration_in_use(&self, id: Uuid) -> DunningResult<bool>;
    async fn delete_configuration(&self, id: Uuid) -> DunningResult<()>;

    /// Persist a campaign with its schedule in one write. Must fail with
    /// `CampaignAlreadyActive` when an active campaign exists for the target,
    /// including under concurrent creation.
    async fn create_campaign(&self, campaign: &DunningCampaign) -> DunningResult<()>;
    async fn get_campaign(&self, id: Uuid) -> DunningResult<Option<DunningCampaign>>;
    async fn get_active_campaign_for_target(
        &self,
        target: &CampaignTarget,
    ) -> DunningResult<Option<DunningCampaign>>;
    async fn list_active_campaigns_due(
        &self,
        now: OffsetDateTime,
    ) -> DunningResult<Vec<DunningCampaign>>;
    async fn update_campaign_schedule(
        &self,
        id: Uuid,
        next_retry_at: OffsetDateTime,
    ) -> DunningResult<()>;
    /// Transition active -> recovered, clearing the schedule
    async fn mark_campaign_recovered(
        &self,
        id: Uuid,
        recovered_amount_cents: i64,
    ) -> DunningResult<()>;
    /// Transition active -> failed, clearing the schedule
    async fn mark_campaign_failed(&self, id: Uuid, final_action: FinalAction) -> DunningResult<()>;
    async fn mark_final_action_completed(
        &self,
        id: Uuid,
        at: OffsetDateTime,
    ) -> DunningResult<()>;
    /// Failed campaigns whose terminal side effect never completed —
    /// the reconciliation job's work queue
    async fn list_failed_campaigns_pending_final_action(
        &self,
        limit: i64,
    ) -> DunningResult<Vec<DunningCampaign>>;

    /// Persist an attempt. Must fail with `OutOfOrderAttempt` when the
    /// `(campaign_id, attempt_number)` pair already exists.
    async fn create_attempt(&self, attempt: &DunningAttempt) -> DunningResult<()>;
    async fn get_attempt(&self, id: Uuid) -> DunningResult<Option<DunningAttempt>>;
    async fn count_attempts(&self, campaign_id: Uuid) -> DunningResult<i64>;
    async fn list_attempts(&self, campaign_id: Uuid) -> DunningResult<Vec<DunningAttempt>>;
    /// Record a terminal attempt status. Completed attempts are immutable;
    /// a second completion is a validation error.
    async fn complete_attempt(
        &self,
        id: Uuid,
        status: AttemptStatus,
        payment_error: Option<&str>,
        payment_id: Option<&str>,
        completed_at: OffsetDateTime,
    ) -> DunningResult<()>;
}

// Constraint names from migrations/0001_dunning.sql
const ONE_ACTIVE_CAMPAIGN_IDX: &str = "dunning_campaigns_one_active_per_target";
const ATTEMPT_NUMBER_IDX: &str = "dunning_attempts_campaign_number_key";

fn violates(e: &sqlx::Error, constraint: &str) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.constraint() == Some(constraint))
}

/// Postgres-backed ledger store
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ConfigurationRow {
    id: Uuid,
    workspace_id: Uuid,
    name: String,
    description: Option<String>,
    is_default: bool,
    max_retry_attempts: i32,
    retry_interval_days: serde_json::Value,
    attempt_actions: serde_json::Value,
    final_action: String,
    final_action_config: serde_json::Value,
    grace_period_hours: i32,
    allow_customer_retry: bool,
    pre_dunning_reminder_enabled: bool,
    pre_dunning_reminder_days: i32,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<ConfigurationRow> for DunningConfiguration {
    type Error = DunningError;

    fn try_from(row: ConfigurationRow) -> DunningResult<Self> {
        let retry_interval_days = serde_json::from_value(row.retry_interval_days)
            .map_err(|e| DunningError::Storage(format!("bad retry_interval_days: {}", e)))?;
        let attempt_actions = serde_json::from_value(row.attempt_actions)
            .map_err(|e| DunningError::Storage(format!("bad attempt_actions: {}", e)))?;
        Ok(DunningConfiguration {
            id: row.id,
            workspace_id: row.workspace_id,
            name: row.name,
            description: row.description,
            is_default: row.is_default,
            max_retry_attempts: row.max_retry_attempts,
            retry_interval_days,
            attempt_actions,
            final_action: FinalAction::parse(&row.final_action)?,
            final_action_config: row.final_action_config,
            grace_period_hours: row.grace_period_hours,
            allow_customer_retry: row.allow_customer_retry,
            pre_dunning_reminder_enabled: row.pre_dunning_reminder_enabled,
            pre_dunning_reminder_days: row.pre_dunning_reminder_days,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CampaignRow {
    id: Uuid,
    workspace_id: Uuid,
    configuration_id: Uuid,
    subscription_id: Option<Uuid>,
    payment_id: Option<Uuid>,
    customer_id: Uuid,
    status: String,
    original_failure_reason: String,
    original_amount_cents: i64,
    currency: String,
    next_retry_at: Option<OffsetDateTime>,
    recovered_amount_cents: Option<i64>,
    final_action_taken: Option<String>,
    final_action_completed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<CampaignRow> for DunningCampaign {
    type Error = DunningError;

    fn try_from(row: CampaignRow) -> DunningResult<Self> {
        let target = match (row.subscription_id, row.payment_id) {
            (Some(sub), None) => CampaignTarget::Subscription(sub),
            (None, Some(pay)) => CampaignTarget::Payment(pay),
            _ => {
                return Err(DunningError::Storage(format!(
                    "campaign {} must reference exactly one of subscription/payment",
                    row.id
                )))
            }
        };
        let final_action_taken = row
            .final_action_taken
            .as_deref()
            .map(FinalAction::parse)
            .transpose()?;
        Ok(DunningCampaign {
            id: row.id,
            workspace_id: row.workspace_id,
            configuration_id: row.configuration_id,
            target,
            customer_id: row.customer_id,
            status: CampaignStatus::parse(&row.status)?,
            original_failure_reason: row.original_failure_reason,
            original_amount_cents: row.original_amount_cents,
            currency: row.currency,
            next_retry_at: row.next_retry_at,
            recovered_amount_cents: row.recovered_amount_cents,
            final_action_taken,
            final_action_completed_at: row.final_action_completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    campaign_id: Uuid,
    attempt_number: i32,
    attempt_type: String,
    payment_id: Option<String>,
    communication_template: Option<String>,
    status: String,
    payment_error: Option<String>,
    created_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

impl TryFrom<AttemptRow> for DunningAttempt {
    type Error = DunningError;

    fn try_from(row: AttemptRow) -> DunningResult<Self> {
        Ok(DunningAttempt {
            id: row.id,
            campaign_id: row.campaign_id,
            attempt_number: row.attempt_number,
            attempt_type: AttemptType::parse(&row.attempt_type)?,
            payment_id: row.payment_id,
            communication_template: row.communication_template,
            status: AttemptStatus::parse(&row.status)?,
            payment_error: row.payment_error,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_configuration(&self, config: &DunningConfiguration) -> DunningResult<()> {
        let mut tx = self.pool.begin().await?;

        // Clearing the previous default and inserting the new one commit
        // together; a failure on either side aborts creation so the
        // workspace never ends up with zero or two defaults.
        if config.is_default {
            sqlx::query(
                r#"
                UPDATE dunning_configurations
                SET is_default = false, updated_at = NOW()
                WHERE workspace_id = $1 AND is_default = true
                "#,
            )
            .bind(config.workspace_id)
            .execute(&mut *tx)
            .await?;
        }

        let retry_interval_days = serde_json::to_value(&config.retry_interval_days)
            .map_err(|e| DunningError::Storage(e.to_string()))?;
        let attempt_actions = serde_json::to_value(&config.attempt_actions)
            .map_err(|e| DunningError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO dunning_configurations
                (id, workspace_id, name, description, is_default,
                 max_retry_attempts, retry_interval_days, attempt_actions,
                 final_action, final_action_config, grace_period_hours,
                 allow_customer_retry, pre_dunning_reminder_enabled,
                 pre_dunning_reminder_days, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(config.id)
        .bind(config.workspace_id)
        .bind(&config.name)
        .bind(&config.description)
        .bind(config.is_default)
        .bind(config.max_retry_attempts)
        .bind(retry_interval_days)
        .bind(attempt_actions)
        .bind(config.final_action.as_str())
        .bind(&config.final_action_config)
        .bind(config.grace_period_hours)
        .bind(config.allow_customer_retry)
        .bind(config.pre_dunning_reminder_enabled)
        .bind(config.pre_dunning_reminder_days)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_configuration(&self, id: Uuid) -> DunningResult<Option<DunningConfiguration>> {
        let row: Option<ConfigurationRow> =
            sqlx::query_as("SELECT * FROM dunning_configurations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_default_configuration(
        &self,
        workspace_id: Uuid,
    ) -> DunningResult<Option<DunningConfiguration>> {
        let row: Option<ConfigurationRow> = sqlx::query_as(
            "SELECT * FROM dunning_configurations WHERE workspace_id = $1 AND is_default = true",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update_configuration_labels(
        &self,
        id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> DunningResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE dunning_configurations
            SET name = $2, description = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(description)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DunningError::NotFound(format!("configuration {}", id)));
        }
        Ok(())
    }

    async fn configuration_in_use(&self, id: Uuid) -> DunningResult<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dunning_campaigns WHERE configuration_id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    async fn delete_configuration(&self, id: Uuid) -> DunningResult<()> {
        sqlx::query("DELETE FROM dunning_configurations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_campaign(&self, campaign: &DunningCampaign) -> DunningResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dunning_campaigns
                (id, workspace_id, configuration_id, subscription_id, payment_id,
                 customer_id, status, original_failure_reason, original_amount_cents,
                 currency, next_retry_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(campaign.id)
        .bind(campaign.workspace_id)
        .bind(campaign.configuration_id)
        .bind(campaign.target.subscription_id())
        .bind(campaign.target.payment_id())
        .bind(campaign.customer_id)
        .bind(campaign.status.as_str())
        .bind(&campaign.original_failure_reason)
        .bind(campaign.original_amount_cents)
        .bind(&campaign.currency)
        .bind(campaign.next_retry_at)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if violates(&e, ONE_ACTIVE_CAMPAIGN_IDX) {
                DunningError::CampaignAlreadyActive(campaign.target.to_string())
            } else {
                DunningError::Storage(e.to_string())
            }
        })?;
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> DunningResult<Option<DunningCampaign>> {
        let row: Option<CampaignRow> =
            sqlx::query_as("SELECT * FROM dunning_campaigns WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_active_campaign_for_target(
        &self,
        target: &CampaignTarget,
    ) -> DunningResult<Option<DunningCampaign>> {
        let row: Option<CampaignRow> = match target {
            CampaignTarget::Subscription(id) => {
                sqlx::query_as(
                    "SELECT * FROM dunning_campaigns WHERE subscription_id = $1 AND status = 'active'",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            CampaignTarget::Payment(id) => {
                sqlx::query_as(
                    "SELECT * FROM dunning_campaigns WHERE payment_id = $1 AND status = 'active'",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.map(TryInto::try_into).transpose()
    }

    async fn list_active_campaigns_due(
        &self,
        now: OffsetDateTime,
    ) -> DunningResult<Vec<DunningCampaign>> {
        let rows: Vec<CampaignRow> = sqlx::query_as(
            r#"
            SELECT * FROM dunning_campaigns
            WHERE status = 'active' AND next_retry_at IS NOT NULL AND next_retry_at <= $1
            ORDER BY next_retry_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_campaign_schedule(
        &self,
        id: Uuid,
        next_retry_at: OffsetDateTime,
    ) -> DunningResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE dunning_campaigns
            SET next_retry_at = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DunningError::Validation(format!(
                "campaign {} is not active and cannot be rescheduled",
                id
            )));
        }
        Ok(())
    }

    async fn mark_campaign_recovered(
        &self,
        id: Uuid,
        recovered_amount_cents: i64,
    ) -> DunningResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE dunning_campaigns
            SET status = 'recovered',
                recovered_amount_cents = $2,
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .bind(recovered_amount_cents)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DunningError::Validation(format!(
                "campaign {} is not active and cannot be recovered",
                id
            )));
        }
        Ok(())
    }

    async fn mark_campaign_failed(&self, id: Uuid, final_action: FinalAction) -> DunningResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE dunning_campaigns
            SET status = 'failed',
                final_action_taken = $2,
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .bind(final_action.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DunningError::Validation(format!(
                "campaign {} is not active and cannot be failed",
                id
            )));
        }
        Ok(())
    }

    async fn mark_final_action_completed(
        &self,
        id: Uuid,
        at: OffsetDateTime,
    ) -> DunningResult<()> {
        sqlx::query(
            r#"
            UPDATE dunning_campaigns
            SET final_action_completed_at = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'failed' AND final_action_completed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_failed_campaigns_pending_final_action(
        &self,
        limit: i64,
    ) -> DunningResult<Vec<DunningCampaign>> {
        let rows: Vec<CampaignRow> = sqlx::query_as(
            r#"
            SELECT * FROM dunning_campaigns
            WHERE status = 'failed' AND final_action_completed_at IS NULL
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn create_attempt(&self, attempt: &DunningAttempt) -> DunningResult<()> {
        let existing = self.count_attempts(attempt.campaign_id).await? as i32;
        sqlx::query(
            r#"
            INSERT INTO dunning_attempts
                (id, campaign_id, attempt_number, attempt_type, payment_id,
                 communication_template, status, payment_error, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.campaign_id)
        .bind(attempt.attempt_number)
        .bind(attempt.attempt_type.as_str())
        .bind(&attempt.payment_id)
        .bind(&attempt.communication_template)
        .bind(attempt.status.as_str())
        .bind(&attempt.payment_error)
        .bind(attempt.created_at)
        .bind(attempt.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if violates(&e, ATTEMPT_NUMBER_IDX) {
                // A concurrent scheduler won the number; the caller's view
                // of the expected count is stale.
                DunningError::OutOfOrderAttempt {
                    expected: existing + 1,
                    got: attempt.attempt_number,
                }
            } else {
                DunningError::Storage(e.to_string())
            }
        })?;
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> DunningResult<Option<DunningAttempt>> {
        let row: Option<AttemptRow> =
            sqlx::query_as("SELECT * FROM dunning_attempts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn count_attempts(&self, campaign_id: Uuid) -> DunningResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dunning_attempts WHERE campaign_id = $1")
                .bind(campaign_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn list_attempts(&self, campaign_id: Uuid) -> DunningResult<Vec<DunningAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            "SELECT * FROM dunning_attempts WHERE campaign_id = $1 ORDER BY attempt_number ASC",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn complete_attempt(
        &self,
        id: Uuid,
        status: AttemptStatus,
        payment_error: Option<&str>,
        payment_id: Option<&str>,
        completed_at: OffsetDateTime,
    ) -> DunningResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE dunning_attempts
            SET status = $2, payment_error = $3, payment_id = COALESCE($4, payment_id),
                completed_at = $5
            WHERE id = $1 AND completed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(payment_error)
        .bind(payment_id)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let exists: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM dunning_attempts WHERE id = $1")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await?;
            return if exists == 0 {
                Err(DunningError::NotFound(format!("attempt {}", id)))
            } else {
                Err(DunningError::Validation(format!(
                    "attempt {} is already completed and immutable",
                    id
                )))
            };
        }
        Ok(())
    }
}
