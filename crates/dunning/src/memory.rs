//! In-memory ledger store
//!
//! Backs the test suite and local development runs. All state lives behind a
//! single async mutex, so the same uniqueness guarantees the Postgres store
//! gets from its indexes hold here atomically: one active campaign per
//! target, unique attempt numbers, one default configuration per workspace.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::attempt::{AttemptStatus, DunningAttempt};
use crate::campaign::{CampaignStatus, CampaignTarget, DunningCampaign};
use crate::error::{DunningError, DunningResult};
use crate::policy::{DunningConfiguration, FinalAction};
use crate::store::LedgerStore;

#[derive(Default)]
struct State {
    configurations: HashMap<Uuid, DunningConfiguration>,
    campaigns: HashMap<Uuid, DunningCampaign>,
    attempts: HashMap<Uuid, DunningAttempt>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn create_configuration(&self, config: &DunningConfiguration) -> DunningResult<()> {
        let mut state = self.state.lock().await;
        if config.is_default {
            for existing in state.configurations.values_mut() {
                if existing.workspace_id == config.workspace_id && existing.is_default {
                    existing.is_default = false;
                    existing.updated_at = OffsetDateTime::now_utc();
                }
            }
        }
        state.configurations.insert(config.id, config.clone());
        Ok(())
    }

    async fn get_configuration(&self, id: Uuid) -> DunningResult<Option<DunningConfiguration>> {
        Ok(self.state.lock().await.configurations.get(&id).cloned())
    }

    async fn get_default_configuration(
        &self,
        workspace_id: Uuid,
    ) -> DunningResult<Option<DunningConfiguration>> {
        Ok(self
            .state
            .lock()
            .await
            .configurations
            .values()
            .find(|c| c.workspace_id == workspace_id && c.is_default)
            .cloned())
    }

    async fn update_configuration_labels(
        &self,
        id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> DunningResult<()> {
        let mut state = self.state.lock().await;
        let config = state
            .configurations
            .get_mut(&id)
            .ok_or_else(|| DunningError::NotFound(format!("configuration {}", id)))?;
        config.name = name.to_string();
        config.description = description.map(str::to_string);
        config.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn configuration_in_use(&self, id: Uuid) -> DunningResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .campaigns
            .values()
            .any(|c| c.configuration_id == id))
    }

    async fn delete_configuration(&self, id: Uuid) -> DunningResult<()> {
        self.state.lock().await.configurations.remove(&id);
        Ok(())
    }

    async fn create_campaign(&self, campaign: &DunningCampaign) -> DunningResult<()> {
        let mut state = self.state.lock().await;
        // Check-and-insert under the lock is what the partial unique index
        // gives the Postgres store.
        let conflict = state.campaigns.values().any(|c| {
            c.target == campaign.target && c.status == CampaignStatus::Active
        });
        if conflict {
            return Err(DunningError::CampaignAlreadyActive(
                campaign.target.to_string(),
            ));
        }
        state.campaigns.insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> DunningResult<Option<DunningCampaign>> {
        Ok(self.state.lock().await.campaigns.get(&id).cloned())
    }

    async fn get_active_campaign_for_target(
        &self,
        target: &CampaignTarget,
    ) -> DunningResult<Option<DunningCampaign>> {
        Ok(self
            .state
            .lock()
            .await
            .campaigns
            .values()
            .find(|c| c.target == *target && c.status == CampaignStatus::Active)
            .cloned())
    }

    async fn list_active_campaigns_due(
        &self,
        now: OffsetDateTime,
    ) -> DunningResult<Vec<DunningCampaign>> {
        let state = self.state.lock().await;
        let mut due: Vec<DunningCampaign> = state
            .campaigns
            .values()
            .filter(|c| {
                c.status == CampaignStatus::Active
                    && c.next_retry_at.map(|t| t <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by_key(|c| c.next_retry_at);
        Ok(due)
    }

    async fn update_campaign_schedule(
        &self,
        id: Uuid,
        next_retry_at: OffsetDateTime,
    ) -> DunningResult<()> {
        let mut state = self.state.lock().await;
        let campaign = state
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| DunningError::NotFound(format!("campaign {}", id)))?;
        if campaign.status != CampaignStatus::Active {
            return Err(DunningError::Validation(format!(
                "campaign {} is not active and cannot be rescheduled",
                id
            )));
        }
        campaign.next_retry_at = Some(next_retry_at);
        campaign.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn mark_campaign_recovered(
        &self,
        id: Uuid,
        recovered_amount_cents: i64,
    ) -> DunningResult<()> {
        let mut state = self.state.lock().await;
        let campaign = state
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| DunningError::NotFound(format!("campaign {}", id)))?;
        if campaign.status != CampaignStatus::Active {
            return Err(DunningError::Validation(format!(
                "campaign {} is not active and cannot be recovered",
                id
            )));
        }
        campaign.status = CampaignStatus::Recovered;
        campaign.recovered_amount_cents = Some(recovered_amount_cents);
        campaign.next_retry_at = None;
        campaign.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn mark_campaign_failed(&self, id: Uuid, final_action: FinalAction) -> DunningResult<()> {
        let mut state = self.state.lock().await;
        let campaign = state
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| DunningError::NotFound(format!("campaign {}", id)))?;
        if campaign.status != CampaignStatus::Active {
            return Err(DunningError::Validation(format!(
                "campaign {} is not active and cannot be failed",
                id
            )));
        }
        campaign.status = CampaignStatus::Failed;
        campaign.final_action_taken = Some(final_action);
        campaign.next_retry_at = None;
        campaign.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn mark_final_action_completed(
        &self,
        id: Uuid,
        at: OffsetDateTime,
    ) -> DunningResult<()> {
        let mut state = self.state.lock().await;
        if let Some(campaign) = state.campaigns.get_mut(&id) {
            if campaign.status == CampaignStatus::Failed
                && campaign.final_action_completed_at.is_none()
            {
                campaign.final_action_completed_at = Some(at);
                campaign.updated_at = OffsetDateTime::now_utc();
            }
        }
        Ok(())
    }

    async fn list_failed_campaigns_pending_final_action(
        &self,
        limit: i64,
    ) -> DunningResult<Vec<DunningCampaign>> {
        let state = self.state.lock().await;
        let mut pending: Vec<DunningCampaign> = state
            .campaigns
            .values()
            .filter(|c| {
                c.status == CampaignStatus::Failed && c.final_action_completed_at.is_none()
            })
            .cloned()
            .collect();
        pending.sort_by_key(|c| c.updated_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn create_attempt(&self, attempt: &DunningAttempt) -> DunningResult<()> {
        let mut state = self.state.lock().await;
        let existing = state
            .attempts
            .values()
            .filter(|a| a.campaign_id == attempt.campaign_id)
            .count() as i32;
        let duplicate = state.attempts.values().any(|a| {
            a.campaign_id == attempt.campaign_id && a.attempt_number == attempt.attempt_number
        });
        if duplicate {
            return Err(DunningError::OutOfOrderAttempt {
                expected: existing + 1,
                got: attempt.attempt_number,
            });
        }
        state.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> DunningResult<Option<DunningAttempt>> {
        Ok(self.state.lock().await.attempts.get(&id).cloned())
    }

    async fn count_attempts(&self, campaign_id: Uuid) -> DunningResult<i64> {
        Ok(self
            .state
            .lock()
            .await
            .attempts
            .values()
            .filter(|a| a.campaign_id == campaign_id)
            .count() as i64)
    }

    async fn list_attempts(&self, campaign_id: Uuid) -> DunningResult<Vec<DunningAttempt>> {
        let state = self.state.lock().await;
        let mut attempts: Vec<DunningAttempt> = state
            .attempts
            .values()
            .filter(|a| a.campaign_id == campaign_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn complete_attempt(
        &self,
        id: Uuid,
        status: AttemptStatus,
        payment_error: Option<&str>,
        payment_id: Option<&str>,
        completed_at: OffsetDateTime,
    ) -> DunningResult<()> {
        let mut state = self.state.lock().await;
        let attempt = state
            .attempts
            .get_mut(&id)
            .ok_or_else(|| DunningError::NotFound(format!("attempt {}", id)))?;
        if attempt.completed_at.is_some() {
            return Err(DunningError::Validation(format!(
                "attempt {} is already completed and immutable",
                id
            )));
        }
        attempt.status = status;
        attempt.payment_error = payment_error.map(str::to_string);
        if let Some(payment_id) = payment_id {
            attempt.payment_id = Some(payment_id.to_string());
        }
        attempt.completed_at = Some(completed_at);
        Ok(())
    }
}
