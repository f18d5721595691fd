//! Subscription lifecycle collaborator
//!
//! The dunning engine never mutates subscriptions itself; terminal actions
//! go through this narrow contract. `record_state_change` is an audit trail
//! and is always best-effort for callers: its failure is logged, never
//! propagated.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{DunningError, DunningResult};

#[async_trait]
pub trait SubscriptionLifecycle: Send + Sync {
    /// Schedule a cancellation at period end. The customer keeps the period
    /// they already paid for; nothing is terminated immediately.
    async fn schedule_cancellation(&self, subscription_id: Uuid, reason: &str)
        -> DunningResult<()>;

    /// Pause the subscription; the customer can resume by paying
    async fn pause_subscription(&self, subscription_id: Uuid, reason: &str) -> DunningResult<()>;

    /// Schedule a downgrade to `downgrade_to` at period end
    async fn schedule_downgrade(
        &self,
        subscription_id: Uuid,
        downgrade_to: &str,
        reason: &str,
    ) -> DunningResult<()>;

    /// Append an audit record for a subscription state transition
    async fn record_state_change(
        &self,
        subscription_id: Uuid,
        from_status: &str,
        to_status: &str,
        reason: &str,
        initiated_by: &str,
    ) -> DunningResult<()>;
}

/// Postgres-backed lifecycle operations against the billing schema
pub struct PgSubscriptionLifecycle {
    pool: PgPool,
}

impl PgSubscriptionLifecycle {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionLifecycle for PgSubscriptionLifecycle {
    async fn schedule_cancellation(
        &self,
        subscription_id: Uuid,
        reason: &str,
    ) -> DunningResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET cancel_at_period_end = true,
                cancellation_reason = $2,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('active', 'past_due', 'paused')
            "#,
        )
        .bind(subscription_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DunningError::NotFound(format!(
                "subscription {} not found or not cancellable",
                subscription_id
            )));
        }

        tracing::info!(
            subscription_id = %subscription_id,
            reason = %reason,
            "Scheduled subscription cancellation at period end"
        );
        Ok(())
    }

    async fn pause_subscription(&self, subscription_id: Uuid, reason: &str) -> DunningResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'paused',
                paused_at = NOW(),
                pause_reason = $2,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('active', 'past_due')
            "#,
        )
        .bind(subscription_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DunningError::NotFound(format!(
                "subscription {} not found or not pausable",
                subscription_id
            )));
        }

        tracing::info!(
            subscription_id = %subscription_id,
            reason = %reason,
            "Paused subscription"
        );
        Ok(())
    }

    async fn schedule_downgrade(
        &self,
        subscription_id: Uuid,
        downgrade_to: &str,
        reason: &str,
    ) -> DunningResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET scheduled_downgrade_plan = $2,
                scheduled_downgrade_at = current_period_end,
                downgrade_reason = $3,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('active', 'past_due', 'paused')
            "#,
        )
        .bind(subscription_id)
        .bind(downgrade_to)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DunningError::NotFound(format!(
                "subscription {} not found or not downgradable",
                subscription_id
            )));
        }

        tracing::info!(
            subscription_id = %subscription_id,
            downgrade_to = %downgrade_to,
            reason = %reason,
            "Scheduled subscription downgrade at period end"
        );
        Ok(())
    }

    async fn record_state_change(
        &self,
        subscription_id: Uuid,
        from_status: &str,
        to_status: &str,
        reason: &str,
        initiated_by: &str,
    ) -> DunningResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_state_changes
                (subscription_id, from_status, to_status, reason, initiated_by, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(subscription_id)
        .bind(from_status)
        .bind(to_status)
        .bind(reason)
        .bind(initiated_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
