//! Attempt scheduling and execution
//!
//! A `DunningAttempt` is one execution step within a campaign: either a
//! templated communication or a real payment retry. Attempt numbers are
//! contiguous from 1 per campaign; a completed attempt is immutable.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::campaign::{CampaignManager, DunningCampaign};
use crate::error::{DunningError, DunningResult};
use crate::gateway::{ChargeOutcome, PaymentContext, PaymentGateway};
use crate::notify::Notifier;
use crate::policy::AttemptAction;
use crate::resolution::ResolutionHandler;
use crate::store::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptType {
    Communication,
    PaymentRetry,
}

impl AttemptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptType::Communication => "communication",
            AttemptType::PaymentRetry => "payment_retry",
        }
    }

    pub fn parse(value: &str) -> DunningResult<Self> {
        match value {
            "communication" => Ok(AttemptType::Communication),
            "payment_retry" => Ok(AttemptType::PaymentRetry),
            other => Err(DunningError::Storage(format!(
                "unknown attempt type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Succeeded,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Succeeded | AttemptStatus::Failed)
    }

    pub fn parse(value: &str) -> DunningResult<Self> {
        match value {
            "pending" => Ok(AttemptStatus::Pending),
            "succeeded" => Ok(AttemptStatus::Succeeded),
            "failed" => Ok(AttemptStatus::Failed),
            other => Err(DunningError::Storage(format!(
                "unknown attempt status '{}'",
                other
            ))),
        }
    }
}

/// One execution step within a campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DunningAttempt {
    pub id: Uuid,
    pub campaign_id: Uuid,
    /// 1-based, contiguous, unique per campaign
    pub attempt_number: i32,
    pub attempt_type: AttemptType,
    /// Provider charge reference, set when the attempt caused a real charge
    pub payment_id: Option<String>,
    pub communication_template: Option<String>,
    pub status: AttemptStatus,
    /// Populated only when status = failed
    pub payment_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

/// Outcome of processing one due campaign
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The attempt recovered the campaign
    Recovered { attempt_id: Uuid },
    /// The attempt completed (succeeded communication or failed anything)
    /// and the campaign was rescheduled
    Rescheduled {
        attempt_id: Uuid,
        next_retry_at: OffsetDateTime,
    },
    /// The retry budget is exhausted and the campaign was failed
    Exhausted { final_action: String },
}

/// Materializes due attempts and drives their side effects
pub struct AttemptExecutor {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    campaigns: CampaignManager,
    resolution: ResolutionHandler,
    /// Upper bound on any single collaborator call so one slow provider
    /// cannot stall the scheduler for other campaigns
    collaborator_timeout: Duration,
}

impl AttemptExecutor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        resolution: ResolutionHandler,
        collaborator_timeout: Duration,
    ) -> Self {
        let campaigns = CampaignManager::new(store.clone());
        Self {
            store,
            gateway,
            notifier,
            campaigns,
            resolution,
            collaborator_timeout,
        }
    }

    /// Create attempt `attempt_number` for a campaign.
    ///
    /// The number must be exactly one past the existing count. The ledger's
    /// unique `(campaign_id, attempt_number)` constraint backstops this check
    /// when two scheduler instances race.
    pub async fn create_attempt(
        &self,
        campaign_id: Uuid,
        attempt_number: i32,
        attempt_type: AttemptType,
        communication_template: Option<String>,
    ) -> DunningResult<DunningAttempt> {
        let campaign = self.campaigns.get_campaign(campaign_id).await?;
        if campaign.status.is_terminal() {
            return Err(DunningError::Validation(format!(
                "campaign {} is {} and does not accept new attempts",
                campaign_id, campaign.status
            )));
        }

        let existing = self.store.count_attempts(campaign_id).await?;
        let expected = existing as i32 + 1;
        if attempt_number != expected {
            return Err(DunningError::OutOfOrderAttempt {
                expected,
                got: attempt_number,
            });
        }

        let attempt = DunningAttempt {
            id: Uuid::new_v4(),
            campaign_id,
            attempt_number,
            attempt_type,
            payment_id: None,
            communication_template,
            status: AttemptStatus::Pending,
            payment_error: None,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
        };
        self.store.create_attempt(&attempt).await?;

        tracing::info!(
            campaign_id = %campaign_id,
            attempt_id = %attempt.id,
            attempt_number = attempt_number,
            attempt_type = %attempt_type.as_str(),
            "Created dunning attempt"
        );

        Ok(attempt)
    }

    /// Record the outcome of an attempt. `error_detail` is only accepted with
    /// a failed status; completed attempts are immutable.
    pub async fn update_attempt_status(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        error_detail: Option<String>,
    ) -> DunningResult<()> {
        if !status.is_terminal() {
            return Err(DunningError::Validation(
                "attempt status can only be updated to succeeded or failed".to_string(),
            ));
        }
        if error_detail.is_some() && status != AttemptStatus::Failed {
            return Err(DunningError::Validation(
                "error detail is only accepted for failed attempts".to_string(),
            ));
        }
        self.store
            .complete_attempt(
                attempt_id,
                status,
                error_detail.as_deref(),
                None,
                OffsetDateTime::now_utc(),
            )
            .await
    }

    /// Process one due campaign: either fail it (budget exhausted) or run
    /// the next attempt in its sequence.
    ///
    /// Called by the external driver for each campaign returned by
    /// `CampaignManager::list_due_campaigns`; never forked internally.
    pub async fn process_due_campaign(
        &self,
        campaign: &DunningCampaign,
    ) -> DunningResult<AttemptOutcome> {
        let config = self
            .store
            .get_configuration(campaign.configuration_id)
            .await?
            .ok_or_else(|| {
                DunningError::NotFound(format!("configuration {}", campaign.configuration_id))
            })?;

        let completed = self.store.count_attempts(campaign.id).await? as i32;

        // Exhaustion is a scheduling decision, not an attempt: no new attempt
        // row is created once the budget is spent.
        if completed >= config.max_retry_attempts {
            self.resolution
                .fail_campaign(campaign.id, config.final_action.as_str())
                .await?;
            return Ok(AttemptOutcome::Exhausted {
                final_action: config.final_action.as_str().to_string(),
            });
        }

        let attempt_number = completed + 1;
        let action = config.action_for_attempt(attempt_number);

        let outcome = match action {
            AttemptAction::Email { template_id } => {
                let attempt = self
                    .create_attempt(
                        campaign.id,
                        attempt_number,
                        AttemptType::Communication,
                        Some(template_id.clone()),
                    )
                    .await?;
                self.run_communication(campaign, &attempt, &template_id, config.allow_customer_retry)
                    .await?
            }
            AttemptAction::PaymentRetry => {
                let attempt = self
                    .create_attempt(campaign.id, attempt_number, AttemptType::PaymentRetry, None)
                    .await?;
                self.run_payment_retry(campaign, &attempt).await?
            }
        };

        // A successful payment retry recovers the campaign. Every other
        // outcome either consumes the last attempt (failure path) or
        // reschedules the next one; a succeeded final email is still
        // exhaustion.
        match outcome {
            StepResult::Charged { attempt_id } => {
                self.resolution
                    .recover_campaign(campaign.id, campaign.original_amount_cents)
                    .await?;
                Ok(AttemptOutcome::Recovered { attempt_id })
            }
            StepResult::Completed { attempt_id } => {
                if attempt_number >= config.max_retry_attempts {
                    self.resolution
                        .fail_campaign(campaign.id, config.final_action.as_str())
                        .await?;
                    Ok(AttemptOutcome::Exhausted {
                        final_action: config.final_action.as_str().to_string(),
                    })
                } else {
                    let next_retry_at = self
                        .campaigns
                        .reschedule_after_attempt(campaign, &config, attempt_number)
                        .await?;
                    Ok(AttemptOutcome::Rescheduled {
                        attempt_id,
                        next_retry_at,
                    })
                }
            }
        }
    }

    async fn run_communication(
        &self,
        campaign: &DunningCampaign,
        attempt: &DunningAttempt,
        template_id: &str,
        allow_customer_retry: bool,
    ) -> DunningResult<StepResult> {
        let variables = serde_json::json!({
            "amount_cents": campaign.original_amount_cents,
            "currency": campaign.currency,
            "failure_reason": campaign.original_failure_reason,
            "attempt_number": attempt.attempt_number,
            "allow_customer_retry": allow_customer_retry,
        });

        let send = self
            .notifier
            .send(template_id, campaign.customer_id, variables);
        let result = match tokio::time::timeout(self.collaborator_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(DunningError::Storage(format!(
                "notifier timed out after {:?}",
                self.collaborator_timeout
            ))),
        };

        match result {
            Ok(()) => {
                self.store
                    .complete_attempt(
                        attempt.id,
                        AttemptStatus::Succeeded,
                        None,
                        None,
                        OffsetDateTime::now_utc(),
                    )
                    .await?;
                tracing::info!(
                    campaign_id = %campaign.id,
                    attempt_number = attempt.attempt_number,
                    template = %template_id,
                    "Dunning communication sent"
                );
                Ok(StepResult::Completed {
                    attempt_id: attempt.id,
                })
            }
            Err(e) => {
                let detail = e.to_string();
                self.store
                    .complete_attempt(
                        attempt.id,
                        AttemptStatus::Failed,
                        Some(&detail),
                        None,
                        OffsetDateTime::now_utc(),
                    )
                    .await?;
                tracing::warn!(
                    campaign_id = %campaign.id,
                    attempt_number = attempt.attempt_number,
                    error = %detail,
                    "Dunning communication failed"
                );
                Ok(StepResult::Completed {
                    attempt_id: attempt.id,
                })
            }
        }
    }

    async fn run_payment_retry(
        &self,
        campaign: &DunningCampaign,
        attempt: &DunningAttempt,
    ) -> DunningResult<StepResult> {
        let ctx = PaymentContext {
            workspace_id: campaign.workspace_id,
            customer_id: campaign.customer_id,
            subscription_id: campaign.target.subscription_id(),
            payment_id: campaign.target.payment_id(),
            attempt_id: attempt.id,
        };

        let charge =
            self.gateway
                .retry_charge(&ctx, campaign.original_amount_cents, &campaign.currency);
        let outcome = match tokio::time::timeout(self.collaborator_timeout, charge).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ChargeOutcome::Declined {
                reason: e.to_string(),
            },
            // Indeterminate: the request may have reached the provider. The
            // gateway keys deduplication on the attempt id, so recording a
            // decline here cannot lead to a double charge on the next retry.
            Err(_) => ChargeOutcome::Declined {
                reason: format!("payment gateway timed out after {:?}", self.collaborator_timeout),
            },
        };

        match outcome {
            ChargeOutcome::Succeeded { payment_id } => {
                self.store
                    .complete_attempt(
                        attempt.id,
                        AttemptStatus::Succeeded,
                        None,
                        Some(&payment_id),
                        OffsetDateTime::now_utc(),
                    )
                    .await?;
                tracing::info!(
                    campaign_id = %campaign.id,
                    attempt_number = attempt.attempt_number,
                    payment_id = %payment_id,
                    amount_cents = campaign.original_amount_cents,
                    "Payment retry succeeded"
                );
                Ok(StepResult::Charged {
                    attempt_id: attempt.id,
                })
            }
            ChargeOutcome::Declined { reason } => {
                self.store
                    .complete_attempt(
                        attempt.id,
                        AttemptStatus::Failed,
                        Some(&reason),
                        None,
                        OffsetDateTime::now_utc(),
                    )
                    .await?;
                tracing::warn!(
                    campaign_id = %campaign.id,
                    attempt_number = attempt.attempt_number,
                    error = %reason,
                    "Payment retry declined"
                );
                Ok(StepResult::Completed {
                    attempt_id: attempt.id,
                })
            }
        }
    }
}

/// Internal result of running one attempt's side effect
enum StepResult {
    /// A real charge went through
    Charged { attempt_id: Uuid },
    /// The attempt completed without recovering the campaign
    Completed { attempt_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_type_round_trip() {
        for t in [AttemptType::Communication, AttemptType::PaymentRetry] {
            assert_eq!(AttemptType::parse(t.as_str()).unwrap(), t);
        }
        assert!(AttemptType::parse("sms").is_err());
    }

    #[test]
    fn test_attempt_status_terminality() {
        assert!(!AttemptStatus::Pending.is_terminal());
        assert!(AttemptStatus::Succeeded.is_terminal());
        assert!(AttemptStatus::Failed.is_terminal());
    }
}
