//! Dunning policies
//!
//! A `DunningConfiguration` is a workspace-scoped recovery policy: how many
//! retries, on which day-offsets, what each attempt does, and what happens
//! when the sequence is exhausted. Policies are structurally immutable once
//! created; only name/description may change afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{DunningError, DunningResult};
use crate::store::LedgerStore;

/// Terminal disposition applied when a campaign cannot be recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalAction {
    /// Schedule cancellation at period end (customer keeps the paid period)
    Cancel,
    /// Pause the subscription; the customer can resume after paying
    Pause,
    /// Schedule a downgrade to the plan named in `final_action_config`
    Downgrade,
}

impl FinalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalAction::Cancel => "cancel",
            FinalAction::Pause => "pause",
            FinalAction::Downgrade => "downgrade",
        }
    }

    /// Parse a stored/user-supplied action value.
    /// Unknown values must never reach the executor, so this is the single
    /// place they are rejected.
    pub fn parse(value: &str) -> DunningResult<Self> {
        match value {
            "cancel" => Ok(FinalAction::Cancel),
            "pause" => Ok(FinalAction::Pause),
            "downgrade" => Ok(FinalAction::Downgrade),
            other => Err(DunningError::UnknownFinalAction(other.to_string())),
        }
    }
}

impl std::fmt::Display for FinalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a single scheduled attempt does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptAction {
    /// Send a templated communication to the customer
    Email { template_id: String },
    /// Re-run the original charge through the payment gateway
    PaymentRetry,
}

/// Workspace-scoped dunning policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DunningConfiguration {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// At most one default per workspace; enforced by the ledger store
    pub is_default: bool,
    /// Number of attempts before the final action. Zero is allowed: the
    /// campaign goes straight to the final action once the grace period ends.
    pub max_retry_attempts: i32,
    /// Element i is the day-offset (from campaign creation) of attempt i+1.
    /// Length must be >= max_retry_attempts.
    pub retry_interval_days: Vec<i32>,
    /// Per-attempt action overrides; unmapped attempts default to PaymentRetry
    pub attempt_actions: BTreeMap<i32, AttemptAction>,
    pub final_action: FinalAction,
    /// Opaque payload interpreted by the final-action executor
    /// (e.g. {"downgrade_to": "free"})
    pub final_action_config: serde_json::Value,
    /// Delay between failure detection and the first attempt
    pub grace_period_hours: i32,
    pub allow_customer_retry: bool,
    pub pre_dunning_reminder_enabled: bool,
    /// Days before renewal to send the pre-dunning reminder
    pub pre_dunning_reminder_days: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl DunningConfiguration {
    /// Action configured for a 1-based attempt number
    pub fn action_for_attempt(&self, attempt_number: i32) -> AttemptAction {
        self.attempt_actions
            .get(&attempt_number)
            .cloned()
            .unwrap_or(AttemptAction::PaymentRetry)
    }

    /// Day-offset (from campaign creation) of a 1-based attempt number
    pub fn day_offset_for_attempt(&self, attempt_number: i32) -> Option<i32> {
        if attempt_number < 1 {
            return None;
        }
        self.retry_interval_days
            .get((attempt_number - 1) as usize)
            .copied()
    }
}

/// Parameters for creating a configuration
#[derive(Debug, Clone)]
pub struct NewConfiguration {
    pub workspace_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_default: bool,
    pub max_retry_attempts: i32,
    pub retry_interval_days: Vec<i32>,
    pub attempt_actions: BTreeMap<i32, AttemptAction>,
    pub final_action: FinalAction,
    pub final_action_config: serde_json::Value,
    pub grace_period_hours: i32,
    pub allow_customer_retry: bool,
    pub pre_dunning_reminder_enabled: bool,
    pub pre_dunning_reminder_days: i32,
}

/// Policy store service: lookup and admin-facing mutation of configurations
pub struct PolicyService {
    store: Arc<dyn LedgerStore>,
}

impl PolicyService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Create a configuration.
    ///
    /// If `is_default` is set, the ledger store clears any existing default
    /// for the workspace in the same atomic write; a failure there aborts
    /// creation so the workspace is never left without a consistent default.
    pub async fn create_configuration(
        &self,
        params: NewConfiguration,
    ) -> DunningResult<DunningConfiguration> {
        if params.name.trim().is_empty() {
            return Err(DunningError::Validation(
                "configuration name must not be empty".to_string(),
            ));
        }
        if params.max_retry_attempts < 0 {
            return Err(DunningError::Validation(
                "max_retry_attempts must not be negative".to_string(),
            ));
        }
        if (params.retry_interval_days.len() as i32) < params.max_retry_attempts {
            return Err(DunningError::Validation(format!(
                "retry_interval_days has {} entries but max_retry_attempts is {}",
                params.retry_interval_days.len(),
                params.max_retry_attempts
            )));
        }
        if params.retry_interval_days.iter().any(|d| *d < 0) {
            return Err(DunningError::Validation(
                "retry_interval_days entries must not be negative".to_string(),
            ));
        }
        if params.grace_period_hours < 0 {
            return Err(DunningError::Validation(
                "grace_period_hours must not be negative".to_string(),
            ));
        }
        if params.pre_dunning_reminder_enabled && params.pre_dunning_reminder_days < 1 {
            return Err(DunningError::Validation(
                "pre_dunning_reminder_days must be at least 1 when reminders are enabled"
                    .to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let config = DunningConfiguration {
            id: Uuid::new_v4(),
            workspace_id: params.workspace_id,
            name: params.name,
            description: params.description,
            is_default: params.is_default,
            max_retry_attempts: params.max_retry_attempts,
            retry_interval_days: params.retry_interval_days,
            attempt_actions: params.attempt_actions,
            final_action: params.final_action,
            final_action_config: params.final_action_config,
            grace_period_hours: params.grace_period_hours,
            allow_customer_retry: params.allow_customer_retry,
            pre_dunning_reminder_enabled: params.pre_dunning_reminder_enabled,
            pre_dunning_reminder_days: params.pre_dunning_reminder_days,
            created_at: now,
            updated_at: now,
        };

        self.store.create_configuration(&config).await?;

        tracing::info!(
            configuration_id = %config.id,
            workspace_id = %config.workspace_id,
            is_default = config.is_default,
            max_retry_attempts = config.max_retry_attempts,
            final_action = %config.final_action,
            "Created dunning configuration"
        );

        Ok(config)
    }

    pub async fn get_configuration(&self, id: Uuid) -> DunningResult<DunningConfiguration> {
        self.store
            .get_configuration(id)
            .await?
            .ok_or_else(|| DunningError::NotFound(format!("configuration {}", id)))
    }

    pub async fn get_default_configuration(
        &self,
        workspace_id: Uuid,
    ) -> DunningResult<DunningConfiguration> {
        self.store
            .get_default_configuration(workspace_id)
            .await?
            .ok_or_else(|| {
                DunningError::NotFound(format!(
                    "default configuration for workspace {}",
                    workspace_id
                ))
            })
    }

    /// Rename a configuration. Name and description are the only fields that
    /// may change after creation; the retry schedule a campaign was opened
    /// under must stay stable for its whole lifetime.
    pub async fn rename_configuration(
        &self,
        id: Uuid,
        name: String,
        description: Option<String>,
    ) -> DunningResult<()> {
        if name.trim().is_empty() {
            return Err(DunningError::Validation(
                "configuration name must not be empty".to_string(),
            ));
        }
        // Existence check first so the caller gets NotFound rather than a
        // silent zero-row update.
        self.get_configuration(id).await?;
        self.store
            .update_configuration_labels(id, &name, description.as_deref())
            .await
    }

    /// Delete a configuration. Refused while any campaign references it.
    pub async fn delete_configuration(&self, id: Uuid) -> DunningResult<()> {
        self.get_configuration(id).await?;
        if self.store.configuration_in_use(id).await? {
            return Err(DunningError::Validation(format!(
                "configuration {} is referenced by campaigns and cannot be deleted",
                id
            )));
        }
        self.store.delete_configuration(id).await?;
        tracing::info!(configuration_id = %id, "Deleted dunning configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_action_round_trip() {
        for action in [FinalAction::Cancel, FinalAction::Pause, FinalAction::Downgrade] {
            assert_eq!(FinalAction::parse(action.as_str()).unwrap(), action);
        }
        assert!(matches!(
            FinalAction::parse("archive"),
            Err(DunningError::UnknownFinalAction(_))
        ));
    }

    #[test]
    fn test_attempt_action_defaults_to_payment_retry() {
        let config = test_config(3, vec![1, 3, 7]);
        assert_eq!(config.action_for_attempt(2), AttemptAction::PaymentRetry);
    }

    #[test]
    fn test_day_offset_indexing() {
        let config = test_config(3, vec![1, 3, 7]);
        assert_eq!(config.day_offset_for_attempt(1), Some(1));
        assert_eq!(config.day_offset_for_attempt(3), Some(7));
        assert_eq!(config.day_offset_for_attempt(4), None);
        assert_eq!(config.day_offset_for_attempt(0), None);
    }

    #[test]
    fn test_attempt_action_serde_tagging() {
        let action = AttemptAction::Email {
            template_id: "dunning_first_notice".to_string(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "email");
        assert_eq!(json["template_id"], "dunning_first_notice");

        let retry: AttemptAction =
            serde_json::from_value(serde_json::json!({"kind": "payment_retry"})).unwrap();
        assert_eq!(retry, AttemptAction::PaymentRetry);
    }

    fn test_config(max: i32, intervals: Vec<i32>) -> DunningConfiguration {
        let now = OffsetDateTime::now_utc();
        DunningConfiguration {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            name: "standard".to_string(),
            description: None,
            is_default: true,
            max_retry_attempts: max,
            retry_interval_days: intervals,
            attempt_actions: BTreeMap::new(),
            final_action: FinalAction::Cancel,
            final_action_config: serde_json::json!({}),
            grace_period_hours: 24,
            allow_customer_retry: true,
            pre_dunning_reminder_enabled: false,
            pre_dunning_reminder_days: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
