//! Campaign resolution
//!
//! Transitions campaigns into their terminal states. The ordering contract
//! here is deliberate: a campaign is marked `failed` *before* its terminal
//! side effect is attempted, so a side-effect failure never re-opens the
//! campaign (which would re-send duplicate communications on the next poll).
//! The cost is a window where a campaign is `failed` but its subscription
//! untouched; `final_action_completed_at` stays NULL in that window and the
//! reconciliation job closes it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::campaign::{CampaignStatus, DunningCampaign};
use crate::error::{DunningError, DunningResult};
use crate::lifecycle::SubscriptionLifecycle;
use crate::policy::FinalAction;
use crate::store::LedgerStore;

#[derive(Clone)]
pub struct ResolutionHandler {
    store: Arc<dyn LedgerStore>,
    lifecycle: Arc<dyn SubscriptionLifecycle>,
    collaborator_timeout: Duration,
}

impl ResolutionHandler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        lifecycle: Arc<dyn SubscriptionLifecycle>,
        collaborator_timeout: Duration,
    ) -> Self {
        Self {
            store,
            lifecycle,
            collaborator_timeout,
        }
    }

    /// Close a campaign as recovered.
    ///
    /// Repeat calls on an already-recovered campaign are no-op successes so
    /// a retried caller never double-counts recovery. Calling this on a
    /// failed campaign is a contradiction and is surfaced as an error.
    pub async fn recover_campaign(
        &self,
        campaign_id: Uuid,
        recovered_amount_cents: i64,
    ) -> DunningResult<()> {
        let campaign = self.load(campaign_id).await?;
        match campaign.status {
            CampaignStatus::Recovered => {
                tracing::debug!(campaign_id = %campaign_id, "Campaign already recovered");
                Ok(())
            }
            CampaignStatus::Failed => Err(DunningError::Validation(format!(
                "campaign {} already failed and cannot be recovered",
                campaign_id
            ))),
            CampaignStatus::Active => {
                self.store
                    .mark_campaign_recovered(campaign_id, recovered_amount_cents)
                    .await?;
                tracing::info!(
                    campaign_id = %campaign_id,
                    recovered_amount_cents = recovered_amount_cents,
                    "Campaign recovered"
                );
                Ok(())
            }
        }
    }

    /// Close a campaign as failed and apply its final action exactly once.
    ///
    /// The action string is parsed before anything is mutated: an unknown
    /// value is rejected with no side effect at all. Repeat calls on a
    /// campaign whose side effect already completed are no-op successes;
    /// repeat calls while the side effect is still pending retry it (this is
    /// also the reconciliation path). A repeat call naming a different action
    /// than the one recorded at failure time is rejected.
    pub async fn fail_campaign(&self, campaign_id: Uuid, final_action: &str) -> DunningResult<()> {
        let action = FinalAction::parse(final_action)?;
        let campaign = self.load(campaign_id).await?;

        match campaign.status {
            CampaignStatus::Recovered => Err(DunningError::Validation(format!(
                "campaign {} already recovered and cannot be failed",
                campaign_id
            ))),
            CampaignStatus::Failed => {
                // The action recorded at failure time is authoritative; a
                // retry with a different action must not apply it and leave
                // the record and the side effect disagreeing.
                if let Some(recorded) = campaign.final_action_taken {
                    if recorded != action {
                        return Err(DunningError::Validation(format!(
                            "campaign {} already failed with final action {}, got {}",
                            campaign_id, recorded, action
                        )));
                    }
                }
                if campaign.final_action_completed_at.is_some() {
                    tracing::debug!(campaign_id = %campaign_id, "Campaign already failed");
                    return Ok(());
                }
                // Failed but the side effect never landed; finish the job.
                self.execute_final_action(&campaign, action).await
            }
            CampaignStatus::Active => {
                self.store.mark_campaign_failed(campaign_id, action).await?;
                tracing::warn!(
                    campaign_id = %campaign_id,
                    final_action = %action,
                    "Campaign failed; executing final action"
                );
                self.execute_final_action(&campaign, action).await
            }
        }
    }

    /// Apply the terminal side effect for a failed campaign.
    ///
    /// On success the campaign is stamped complete and an audit state-change
    /// record is appended best-effort. On failure the campaign's `failed`
    /// status is NOT rolled back; the error is returned as
    /// `FinalActionFailed` and the campaign remains on the reconciliation
    /// queue.
    pub(crate) async fn execute_final_action(
        &self,
        campaign: &DunningCampaign,
        action: FinalAction,
    ) -> DunningResult<()> {
        let Some(subscription_id) = campaign.target.subscription_id() else {
            // Standalone-payment campaigns have no subscription to act on.
            tracing::warn!(
                campaign_id = %campaign.id,
                final_action = %action,
                "Final action has no subscription target; marking complete"
            );
            return self.mark_completed(campaign.id).await;
        };

        let reason = format!(
            "payment recovery exhausted (campaign {}, original failure: {})",
            campaign.id, campaign.original_failure_reason
        );

        let (result, to_status) = match action {
            FinalAction::Cancel => (
                self.bounded(self.lifecycle.schedule_cancellation(subscription_id, &reason))
                    .await,
                "pending_cancellation",
            ),
            FinalAction::Pause => (
                self.bounded(self.lifecycle.pause_subscription(subscription_id, &reason))
                    .await,
                "paused",
            ),
            FinalAction::Downgrade => {
                let config = self
                    .store
                    .get_configuration(campaign.configuration_id)
                    .await?
                    .ok_or_else(|| {
                        DunningError::NotFound(format!(
                            "configuration {}",
                            campaign.configuration_id
                        ))
                    })?;
                let Some(downgrade_to) = config
                    .final_action_config
                    .get("downgrade_to")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                else {
                    return Err(DunningError::FinalActionFailed(format!(
                        "configuration {} has no final_action_config.downgrade_to",
                        config.id
                    )));
                };
                (
                    self.bounded(self.lifecycle.schedule_downgrade(
                        subscription_id,
                        &downgrade_to,
                        &reason,
                    ))
                    .await,
                    "downgrade_scheduled",
                )
            }
        };

        if let Err(e) = result {
            tracing::error!(
                campaign_id = %campaign.id,
                subscription_id = %subscription_id,
                final_action = %action,
                error = %e,
                "Final action failed; campaign stays failed and queued for reconciliation"
            );
            return Err(DunningError::FinalActionFailed(e.to_string()));
        }

        self.mark_completed(campaign.id).await?;

        // Audit trail is best-effort: a failure here must not undo an
        // already-applied subscription action.
        if let Err(e) = self
            .bounded(self.lifecycle.record_state_change(
                subscription_id,
                "active",
                to_status,
                &reason,
                "dunning",
            ))
            .await
        {
            tracing::warn!(
                campaign_id = %campaign.id,
                subscription_id = %subscription_id,
                error = %e,
                "Failed to record subscription state change"
            );
        }

        tracing::info!(
            campaign_id = %campaign.id,
            subscription_id = %subscription_id,
            final_action = %action,
            "Final action applied"
        );
        Ok(())
    }

    async fn mark_completed(&self, campaign_id: Uuid) -> DunningResult<()> {
        self.store
            .mark_final_action_completed(campaign_id, OffsetDateTime::now_utc())
            .await
    }

    async fn load(&self, campaign_id: Uuid) -> DunningResult<DunningCampaign> {
        self.store
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| DunningError::NotFound(format!("campaign {}", campaign_id)))
    }

    async fn bounded<F>(&self, fut: F) -> DunningResult<()>
    where
        F: Future<Output = DunningResult<()>>,
    {
        match tokio::time::timeout(self.collaborator_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DunningError::Storage(format!(
                "subscription lifecycle call timed out after {:?}",
                self.collaborator_timeout
            ))),
        }
    }
}
