//! Recovery campaigns
//!
//! A `DunningCampaign` is one recovery process for one failed charge. It is
//! opened when a recurring payment fails, drives a scheduled sequence of
//! attempts, and ends in exactly one of two terminal states: `recovered` or
//! `failed`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{DunningError, DunningResult};
use crate::policy::{DunningConfiguration, FinalAction};
use crate::store::LedgerStore;

/// What a campaign is recovering: exactly one of a subscription's recurring
/// charge or a standalone payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CampaignTarget {
    Subscription(Uuid),
    Payment(Uuid),
}

impl CampaignTarget {
    pub fn subscription_id(&self) -> Option<Uuid> {
        match self {
            CampaignTarget::Subscription(id) => Some(*id),
            CampaignTarget::Payment(_) => None,
        }
    }

    pub fn payment_id(&self) -> Option<Uuid> {
        match self {
            CampaignTarget::Payment(id) => Some(*id),
            CampaignTarget::Subscription(_) => None,
        }
    }
}

impl std::fmt::Display for CampaignTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignTarget::Subscription(id) => write!(f, "subscription {}", id),
            CampaignTarget::Payment(id) => write!(f, "payment {}", id),
        }
    }
}

/// Campaign lifecycle state. `Recovered` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    Recovered,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Active => "active",
            CampaignStatus::Recovered => "recovered",
            CampaignStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Recovered | CampaignStatus::Failed)
    }

    pub fn parse(value: &str) -> DunningResult<Self> {
        match value {
            "active" => Ok(CampaignStatus::Active),
            "recovered" => Ok(CampaignStatus::Recovered),
            "failed" => Ok(CampaignStatus::Failed),
            other => Err(DunningError::Storage(format!(
                "unknown campaign status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recovery process for one failed-payment context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DunningCampaign {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub configuration_id: Uuid,
    pub target: CampaignTarget,
    pub customer_id: Uuid,
    pub status: CampaignStatus,
    pub original_failure_reason: String,
    pub original_amount_cents: i64,
    pub currency: String,
    /// Next due time; always None once terminal
    pub next_retry_at: Option<OffsetDateTime>,
    pub recovered_amount_cents: Option<i64>,
    pub final_action_taken: Option<FinalAction>,
    /// Set once the terminal side effect actually ran. A failed campaign
    /// without it is picked up by the reconciliation job.
    pub final_action_completed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Parameters for opening a campaign
#[derive(Debug, Clone)]
pub struct CampaignParams {
    pub configuration_id: Uuid,
    pub target: CampaignTarget,
    /// Caller-resolved customer context. The engine never derives this
    /// itself; a missing value is a precondition leak from the caller.
    pub customer_id: Option<Uuid>,
    pub original_failure_reason: String,
    pub original_amount_cents: i64,
    pub currency: String,
}

/// Opens campaigns and owns their scheduling
pub struct CampaignManager {
    store: Arc<dyn LedgerStore>,
}

impl CampaignManager {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Open a campaign for a failed charge.
    ///
    /// The active-campaign lookup here is an optimization for a clean error;
    /// the real single-active-campaign guarantee is the ledger store's
    /// uniqueness constraint, which `create_campaign` maps to
    /// `CampaignAlreadyActive` when two creators race.
    pub async fn create_campaign(
        &self,
        params: CampaignParams,
    ) -> DunningResult<DunningCampaign> {
        if params.original_amount_cents <= 0 {
            return Err(DunningError::Validation(
                "original_amount_cents must be positive".to_string(),
            ));
        }
        if params.currency.trim().is_empty() {
            return Err(DunningError::Validation(
                "currency must not be empty".to_string(),
            ));
        }

        if let Some(existing) = self
            .store
            .get_active_campaign_for_target(&params.target)
            .await?
        {
            return Err(DunningError::CampaignAlreadyActive(format!(
                "{} (campaign {})",
                params.target, existing.id
            )));
        }

        let config = self
            .store
            .get_configuration(params.configuration_id)
            .await?
            .ok_or_else(|| {
                DunningError::NotFound(format!("configuration {}", params.configuration_id))
            })?;

        let customer_id = params.customer_id.ok_or_else(|| {
            DunningError::InsufficientContext(format!(
                "customer context not resolved for {}",
                params.target
            ))
        })?;

        // Schedule is computed before the write so the campaign is created
        // with its first due time in a single storage operation. There is no
        // window where an active campaign exists unscheduled.
        let now = OffsetDateTime::now_utc();
        let first_due = now + Duration::hours(config.grace_period_hours as i64);

        let campaign = DunningCampaign {
            id: Uuid::new_v4(),
            workspace_id: config.workspace_id,
            configuration_id: config.id,
            target: params.target,
            customer_id,
            status: CampaignStatus::Active,
            original_failure_reason: params.original_failure_reason,
            original_amount_cents: params.original_amount_cents,
            currency: params.currency,
            next_retry_at: Some(first_due),
            recovered_amount_cents: None,
            final_action_taken: None,
            final_action_completed_at: None,
            created_at: now,
            updated_at: now,
        };

        self.store.create_campaign(&campaign).await?;

        tracing::info!(
            campaign_id = %campaign.id,
            workspace_id = %campaign.workspace_id,
            target = %campaign.target,
            amount_cents = campaign.original_amount_cents,
            currency = %campaign.currency,
            first_due = %first_due,
            "Opened dunning campaign"
        );

        Ok(campaign)
    }

    pub async fn get_campaign(&self, id: Uuid) -> DunningResult<DunningCampaign> {
        self.store
            .get_campaign(id)
            .await?
            .ok_or_else(|| DunningError::NotFound(format!("campaign {}", id)))
    }

    /// Polling entry point for the driver: active campaigns whose
    /// `next_retry_at` is at or before `now`.
    pub async fn list_due_campaigns(
        &self,
        now: OffsetDateTime,
    ) -> DunningResult<Vec<DunningCampaign>> {
        self.store.list_active_campaigns_due(now).await
    }

    /// Reschedule after a non-recovering attempt.
    ///
    /// The next due time is anchored to `campaign.created_at`, not to the
    /// previous attempt, so interval edits never compound drift:
    /// `next_retry_at = created_at + days(retry_interval_days[n])` where `n`
    /// attempts have completed and attempt `n + 1` is the next one.
    pub async fn reschedule_after_attempt(
        &self,
        campaign: &DunningCampaign,
        config: &DunningConfiguration,
        completed_attempts: i32,
    ) -> DunningResult<OffsetDateTime> {
        let next_number = completed_attempts + 1;
        let offset_days = config.day_offset_for_attempt(next_number).ok_or_else(|| {
            DunningError::Validation(format!(
                "no retry interval for attempt {} (configuration {})",
                next_number, config.id
            ))
        })?;

        let next_due = campaign.created_at + Duration::days(offset_days as i64);
        self.store
            .update_campaign_schedule(campaign.id, next_due)
            .await?;

        tracing::info!(
            campaign_id = %campaign.id,
            next_attempt = next_number,
            next_due = %next_due,
            "Rescheduled campaign"
        );

        Ok(next_due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_accessors() {
        let sub = Uuid::new_v4();
        let target = CampaignTarget::Subscription(sub);
        assert_eq!(target.subscription_id(), Some(sub));
        assert_eq!(target.payment_id(), None);

        let pay = Uuid::new_v4();
        let target = CampaignTarget::Payment(pay);
        assert_eq!(target.payment_id(), Some(pay));
        assert_eq!(target.subscription_id(), None);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!CampaignStatus::Active.is_terminal());
        assert!(CampaignStatus::Recovered.is_terminal());
        assert!(CampaignStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            CampaignStatus::Active,
            CampaignStatus::Recovered,
            CampaignStatus::Failed,
        ] {
            assert_eq!(CampaignStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(CampaignStatus::parse("paused").is_err());
    }
}
