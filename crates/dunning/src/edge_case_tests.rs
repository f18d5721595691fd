// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Dunning Engine
//!
//! Tests critical boundary conditions and race conditions in:
//! - Campaign creation (DUN-C01 to DUN-C03)
//! - Attempt sequencing (DUN-A01 to DUN-A03)
//! - Campaign resolution (DUN-R01 to DUN-R05)
//! - Scheduling end-to-end (DUN-S01 to DUN-S05)
//! - Reconciliation (DUN-RC01 to DUN-RC02)
//! - Configurations (DUN-P01 to DUN-P02)

mod support {
    use std::collections::BTreeMap;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::error::{DunningError, DunningResult};
    use crate::gateway::{ChargeOutcome, PaymentContext, PaymentGateway};
    use crate::lifecycle::SubscriptionLifecycle;
    use crate::memory::MemoryLedger;
    use crate::notify::Notifier;
    use crate::policy::{AttemptAction, DunningConfiguration, FinalAction, NewConfiguration};
    use crate::{DunningService, DunningServiceConfig, LedgerStore};

    /// Gateway that replays a scripted sequence of outcomes; once the script
    /// runs out every further charge is declined. Records the per-attempt
    /// context each charge arrived with.
    #[derive(Default)]
    pub struct ScriptedGateway {
        outcomes: Mutex<VecDeque<ChargeOutcome>>,
        pub charges: Mutex<Vec<(Uuid, Uuid, i64, String)>>,
    }

    impl ScriptedGateway {
        pub fn declining() -> Self {
            Self::default()
        }

        pub fn scripted(outcomes: Vec<ChargeOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                charges: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        async fn retry_charge(
            &self,
            ctx: &PaymentContext,
            amount_cents: i64,
            currency: &str,
        ) -> DunningResult<ChargeOutcome> {
            self.charges.lock().unwrap().push((
                ctx.attempt_id,
                ctx.customer_id,
                amount_cents,
                currency.to_string(),
            ));
            Ok(self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ChargeOutcome::Declined {
                    reason: "card_declined".to_string(),
                }))
        }
    }

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sends: Mutex<Vec<(String, Uuid, serde_json::Value)>>,
        pub fail: bool,
    }

    impl RecordingNotifier {
        pub fn failing() -> Self {
            Self {
                sends: Mutex::new(Vec::new()),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(
            &self,
            template_id: &str,
            customer_id: Uuid,
            variables: serde_json::Value,
        ) -> DunningResult<()> {
            self.sends
                .lock()
                .unwrap()
                .push((template_id.to_string(), customer_id, variables));
            if self.fail {
                Err(DunningError::Storage("smtp unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    /// Gateway that never resolves; exercises the collaborator timeout
    pub struct StalledGateway;

    #[async_trait]
    impl PaymentGateway for StalledGateway {
        async fn retry_charge(
            &self,
            _ctx: &PaymentContext,
            _amount_cents: i64,
            _currency: &str,
        ) -> DunningResult<ChargeOutcome> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    /// Notifier that never resolves
    pub struct StalledNotifier;

    #[async_trait]
    impl Notifier for StalledNotifier {
        async fn send(
            &self,
            _template_id: &str,
            _customer_id: Uuid,
            _variables: serde_json::Value,
        ) -> DunningResult<()> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    /// Lifecycle double that records calls and can fail the first N of them
    #[derive(Default)]
    pub struct RecordingLifecycle {
        pub cancellations: Mutex<Vec<Uuid>>,
        pub pauses: Mutex<Vec<Uuid>>,
        pub downgrades: Mutex<Vec<(Uuid, String)>>,
        pub state_changes: Mutex<Vec<(Uuid, String, String)>>,
        fail_remaining: Mutex<u32>,
    }

    impl RecordingLifecycle {
        pub fn failing_first(n: u32) -> Self {
            Self {
                fail_remaining: Mutex::new(n),
                ..Self::default()
            }
        }

        fn maybe_fail(&self) -> DunningResult<()> {
            let mut remaining = self.fail_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                Err(DunningError::Storage("billing provider down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SubscriptionLifecycle for RecordingLifecycle {
        async fn schedule_cancellation(
            &self,
            subscription_id: Uuid,
            _reason: &str,
        ) -> DunningResult<()> {
            self.maybe_fail()?;
            self.cancellations.lock().unwrap().push(subscription_id);
            Ok(())
        }

        async fn pause_subscription(
            &self,
            subscription_id: Uuid,
            _reason: &str,
        ) -> DunningResult<()> {
            self.maybe_fail()?;
            self.pauses.lock().unwrap().push(subscription_id);
            Ok(())
        }

        async fn schedule_downgrade(
            &self,
            subscription_id: Uuid,
            downgrade_to: &str,
            _reason: &str,
        ) -> DunningResult<()> {
            self.maybe_fail()?;
            self.downgrades
                .lock()
                .unwrap()
                .push((subscription_id, downgrade_to.to_string()));
            Ok(())
        }

        async fn record_state_change(
            &self,
            subscription_id: Uuid,
            from_status: &str,
            to_status: &str,
            _reason: &str,
            _initiated_by: &str,
        ) -> DunningResult<()> {
            self.state_changes.lock().unwrap().push((
                subscription_id,
                from_status.to_string(),
                to_status.to_string(),
            ));
            Ok(())
        }
    }

    pub fn build_service(
        gateway: Arc<ScriptedGateway>,
        notifier: Arc<RecordingNotifier>,
        lifecycle: Arc<RecordingLifecycle>,
    ) -> (DunningService, Arc<MemoryLedger>) {
        build_service_with_config(gateway, notifier, lifecycle, DunningServiceConfig::default())
    }

    pub fn build_service_with_config(
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        lifecycle: Arc<RecordingLifecycle>,
        config: DunningServiceConfig,
    ) -> (DunningService, Arc<MemoryLedger>) {
        let store = Arc::new(MemoryLedger::new());
        let service = DunningService::new(
            store.clone() as Arc<dyn LedgerStore>,
            gateway,
            notifier,
            lifecycle,
            config,
        );
        (service, store)
    }

    pub async fn make_config(
        service: &DunningService,
        max_retry_attempts: i32,
        retry_interval_days: Vec<i32>,
        final_action: FinalAction,
        attempt_actions: BTreeMap<i32, AttemptAction>,
        grace_period_hours: i32,
    ) -> DunningConfiguration {
        service
            .policies
            .create_configuration(NewConfiguration {
                workspace_id: Uuid::new_v4(),
                name: "standard".to_string(),
                description: None,
                is_default: true,
                max_retry_attempts,
                retry_interval_days,
                attempt_actions,
                final_action,
                final_action_config: serde_json::json!({"downgrade_to": "free"}),
                grace_period_hours,
                allow_customer_retry: true,
                pre_dunning_reminder_enabled: false,
                pre_dunning_reminder_days: 3,
            })
            .await
            .unwrap()
    }
}

mod campaign_creation_tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use time::{Duration, OffsetDateTime};
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use super::support::*;
    use crate::campaign::{CampaignParams, CampaignTarget};
    use crate::error::DunningError;
    use crate::policy::FinalAction;

    fn params(configuration_id: Uuid, target: CampaignTarget) -> CampaignParams {
        CampaignParams {
            configuration_id,
            target,
            customer_id: Some(Uuid::new_v4()),
            original_failure_reason: "card_declined".to_string(),
            original_amount_cents: 2900,
            currency: "usd".to_string(),
        }
    }

    // =========================================================================
    // DUN-C01: Concurrent creation for the same target - exactly one wins
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_creation_single_winner() {
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RecordingLifecycle::default()),
        );
        let service = Arc::new(service);
        let config = make_config(&service, 3, vec![1, 3, 7], FinalAction::Cancel, BTreeMap::new(), 0)
            .await;
        let target = CampaignTarget::Subscription(Uuid::new_v4());

        let barrier = Arc::new(Barrier::new(8));
        let mut handles = vec![];
        for _ in 0..8 {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            let p = params(config.id, target);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service.campaigns.create_campaign(p).await
            }));
        }

        let mut created = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(DunningError::CampaignAlreadyActive(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(created, 1, "Exactly one creator should win");
        assert_eq!(conflicts, 7, "All others should see the conflict");
    }

    // =========================================================================
    // DUN-C02: Campaign is born scheduled - grace period sets first due time
    // =========================================================================
    #[tokio::test]
    async fn test_campaign_created_with_grace_period_schedule() {
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RecordingLifecycle::default()),
        );
        let config =
            make_config(&service, 3, vec![1, 3, 7], FinalAction::Cancel, BTreeMap::new(), 24)
                .await;

        let before = OffsetDateTime::now_utc();
        let campaign = service
            .campaigns
            .create_campaign(params(config.id, CampaignTarget::Subscription(Uuid::new_v4())))
            .await
            .unwrap();

        let first_due = campaign.next_retry_at.expect("new campaign must be scheduled");
        assert!(first_due >= before + Duration::hours(24));
        assert!(first_due <= OffsetDateTime::now_utc() + Duration::hours(24));
    }

    // =========================================================================
    // DUN-C03: Missing customer context and bad amounts are rejected up front
    // =========================================================================
    #[tokio::test]
    async fn test_creation_preconditions() {
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RecordingLifecycle::default()),
        );
        let config = make_config(&service, 3, vec![1, 3, 7], FinalAction::Cancel, BTreeMap::new(), 0)
            .await;

        let mut no_customer = params(config.id, CampaignTarget::Payment(Uuid::new_v4()));
        no_customer.customer_id = None;
        assert!(matches!(
            service.campaigns.create_campaign(no_customer).await,
            Err(DunningError::InsufficientContext(_))
        ));

        let mut zero_amount = params(config.id, CampaignTarget::Payment(Uuid::new_v4()));
        zero_amount.original_amount_cents = 0;
        assert!(matches!(
            service.campaigns.create_campaign(zero_amount).await,
            Err(DunningError::Validation(_))
        ));

        let missing_config = params(Uuid::new_v4(), CampaignTarget::Payment(Uuid::new_v4()));
        assert!(matches!(
            service.campaigns.create_campaign(missing_config).await,
            Err(DunningError::NotFound(_))
        ));
    }
}

mod attempt_sequencing_tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use uuid::Uuid;

    use super::support::*;
    use crate::attempt::{AttemptStatus, AttemptType};
    use crate::campaign::{CampaignParams, CampaignTarget};
    use crate::error::DunningError;
    use crate::policy::FinalAction;
    use crate::LedgerStore;

    async fn campaign_fixture(
        service: &crate::DunningService,
    ) -> crate::campaign::DunningCampaign {
        let config = make_config(service, 5, vec![1, 3, 7, 10, 14], FinalAction::Cancel, BTreeMap::new(), 0)
            .await;
        service
            .campaigns
            .create_campaign(CampaignParams {
                configuration_id: config.id,
                target: CampaignTarget::Subscription(Uuid::new_v4()),
                customer_id: Some(Uuid::new_v4()),
                original_failure_reason: "card_declined".to_string(),
                original_amount_cents: 2900,
                currency: "usd".to_string(),
            })
            .await
            .unwrap()
    }

    // =========================================================================
    // DUN-A01: Attempt numbers are contiguous from 1 - gaps are rejected
    // =========================================================================
    #[tokio::test]
    async fn test_attempt_numbers_contiguous() {
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RecordingLifecycle::default()),
        );
        let campaign = campaign_fixture(&service).await;

        let first = service
            .attempts
            .create_attempt(campaign.id, 1, AttemptType::PaymentRetry, None)
            .await
            .unwrap();
        assert_eq!(first.attempt_number, 1);
        assert_eq!(first.status, AttemptStatus::Pending);

        // Skipping 2 is an ordering violation
        let gap = service
            .attempts
            .create_attempt(campaign.id, 3, AttemptType::PaymentRetry, None)
            .await;
        assert!(matches!(
            gap,
            Err(DunningError::OutOfOrderAttempt { expected: 2, got: 3 })
        ));

        // Re-using 1 is too
        let dup = service
            .attempts
            .create_attempt(campaign.id, 1, AttemptType::PaymentRetry, None)
            .await;
        assert!(matches!(dup, Err(DunningError::OutOfOrderAttempt { .. })));
    }

    // =========================================================================
    // DUN-A02: Completed attempts are immutable
    // =========================================================================
    #[tokio::test]
    async fn test_completed_attempt_immutable() {
        let (service, store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RecordingLifecycle::default()),
        );
        let campaign = campaign_fixture(&service).await;

        let attempt = service
            .attempts
            .create_attempt(campaign.id, 1, AttemptType::PaymentRetry, None)
            .await
            .unwrap();
        service
            .attempts
            .update_attempt_status(attempt.id, AttemptStatus::Failed, Some("declined".to_string()))
            .await
            .unwrap();

        let again = service
            .attempts
            .update_attempt_status(attempt.id, AttemptStatus::Succeeded, None)
            .await;
        assert!(matches!(again, Err(DunningError::Validation(_))));

        let stored = store.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Failed);
        assert_eq!(stored.payment_error.as_deref(), Some("declined"));
    }

    // =========================================================================
    // DUN-A03: Error detail is only accepted with a failed status, and
    // terminal campaigns accept no new attempts
    // =========================================================================
    #[tokio::test]
    async fn test_attempt_status_rules() {
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RecordingLifecycle::default()),
        );
        let campaign = campaign_fixture(&service).await;

        let attempt = service
            .attempts
            .create_attempt(campaign.id, 1, AttemptType::PaymentRetry, None)
            .await
            .unwrap();

        let bad = service
            .attempts
            .update_attempt_status(
                attempt.id,
                AttemptStatus::Succeeded,
                Some("should not be here".to_string()),
            )
            .await;
        assert!(matches!(bad, Err(DunningError::Validation(_))));

        service
            .resolution
            .recover_campaign(campaign.id, campaign.original_amount_cents)
            .await
            .unwrap();

        let after_terminal = service
            .attempts
            .create_attempt(campaign.id, 2, AttemptType::PaymentRetry, None)
            .await;
        assert!(matches!(after_terminal, Err(DunningError::Validation(_))));

        let stored = service.campaigns.get_campaign(campaign.id).await.unwrap();
        assert!(stored.next_retry_at.is_none(), "Terminal campaign keeps no schedule");
    }
}

mod resolution_tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use uuid::Uuid;

    use super::support::*;
    use crate::campaign::{CampaignParams, CampaignStatus, CampaignTarget};
    use crate::error::DunningError;
    use crate::policy::FinalAction;

    async fn campaign_with_action(
        service: &crate::DunningService,
        final_action: FinalAction,
        target: CampaignTarget,
    ) -> crate::campaign::DunningCampaign {
        let config =
            make_config(service, 3, vec![1, 3, 7], final_action, BTreeMap::new(), 0).await;
        service
            .campaigns
            .create_campaign(CampaignParams {
                configuration_id: config.id,
                target,
                customer_id: Some(Uuid::new_v4()),
                original_failure_reason: "card_declined".to_string(),
                original_amount_cents: 2900,
                currency: "usd".to_string(),
            })
            .await
            .unwrap()
    }

    // =========================================================================
    // DUN-R01: recover is idempotent; recover-after-fail is a contradiction
    // =========================================================================
    #[tokio::test]
    async fn test_recover_idempotency() {
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RecordingLifecycle::default()),
        );
        let campaign = campaign_with_action(
            &service,
            FinalAction::Cancel,
            CampaignTarget::Subscription(Uuid::new_v4()),
        )
        .await;

        service.resolution.recover_campaign(campaign.id, 2900).await.unwrap();
        // Second call is a no-op success
        service.resolution.recover_campaign(campaign.id, 2900).await.unwrap();

        let stored = service.campaigns.get_campaign(campaign.id).await.unwrap();
        assert_eq!(stored.status, CampaignStatus::Recovered);
        assert_eq!(stored.recovered_amount_cents, Some(2900));

        // Cross-terminal transition is rejected
        let failed = service.resolution.fail_campaign(campaign.id, "cancel").await;
        assert!(matches!(failed, Err(DunningError::Validation(_))));
    }

    // =========================================================================
    // DUN-R02: fail is idempotent and the final action runs exactly once
    // =========================================================================
    #[tokio::test]
    async fn test_fail_exactly_once_final_action() {
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            lifecycle.clone(),
        );
        let sub = Uuid::new_v4();
        let campaign = campaign_with_action(
            &service,
            FinalAction::Cancel,
            CampaignTarget::Subscription(sub),
        )
        .await;

        service.resolution.fail_campaign(campaign.id, "cancel").await.unwrap();
        service.resolution.fail_campaign(campaign.id, "cancel").await.unwrap();
        service.resolution.fail_campaign(campaign.id, "cancel").await.unwrap();

        assert_eq!(
            lifecycle.cancellations.lock().unwrap().as_slice(),
            &[sub],
            "Cancellation must run exactly once"
        );

        let stored = service.campaigns.get_campaign(campaign.id).await.unwrap();
        assert_eq!(stored.status, CampaignStatus::Failed);
        assert_eq!(stored.final_action_taken, Some(FinalAction::Cancel));
        assert!(stored.final_action_completed_at.is_some());

        // Recover after fail is a contradiction
        let recovered = service.resolution.recover_campaign(campaign.id, 2900).await;
        assert!(matches!(recovered, Err(DunningError::Validation(_))));
    }

    // =========================================================================
    // DUN-R03: Unknown final action is rejected with zero side effects
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_final_action_no_side_effects() {
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            lifecycle.clone(),
        );
        let campaign = campaign_with_action(
            &service,
            FinalAction::Cancel,
            CampaignTarget::Subscription(Uuid::new_v4()),
        )
        .await;

        let result = service.resolution.fail_campaign(campaign.id, "archive").await;
        assert!(matches!(result, Err(DunningError::UnknownFinalAction(_))));

        let stored = service.campaigns.get_campaign(campaign.id).await.unwrap();
        assert_eq!(stored.status, CampaignStatus::Active, "Campaign must be untouched");
        assert!(lifecycle.cancellations.lock().unwrap().is_empty());
        assert!(lifecycle.state_changes.lock().unwrap().is_empty());
    }

    // =========================================================================
    // DUN-R05: Retrying a pending failed campaign with a different action is
    // rejected; the recorded action stays authoritative
    // =========================================================================
    #[tokio::test]
    async fn test_pending_retry_honors_recorded_action() {
        let lifecycle = Arc::new(RecordingLifecycle::failing_first(1));
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            lifecycle.clone(),
        );
        let sub = Uuid::new_v4();
        let campaign = campaign_with_action(
            &service,
            FinalAction::Cancel,
            CampaignTarget::Subscription(sub),
        )
        .await;

        // The cancellation fails; the campaign is failed with the side
        // effect still pending
        let result = service.resolution.fail_campaign(campaign.id, "cancel").await;
        assert!(matches!(result, Err(DunningError::FinalActionFailed(_))));

        // A retry naming a different action must not apply it
        let mismatch = service.resolution.fail_campaign(campaign.id, "pause").await;
        assert!(matches!(mismatch, Err(DunningError::Validation(_))));
        assert!(lifecycle.pauses.lock().unwrap().is_empty());

        let stored = service.campaigns.get_campaign(campaign.id).await.unwrap();
        assert_eq!(stored.final_action_taken, Some(FinalAction::Cancel));
        assert!(stored.final_action_completed_at.is_none());

        // Retrying with the recorded action finishes the job
        service.resolution.fail_campaign(campaign.id, "cancel").await.unwrap();
        assert_eq!(lifecycle.cancellations.lock().unwrap().as_slice(), &[sub]);
        assert!(lifecycle.pauses.lock().unwrap().is_empty());

        let stored = service.campaigns.get_campaign(campaign.id).await.unwrap();
        assert!(stored.final_action_completed_at.is_some());
    }

    // =========================================================================
    // DUN-R04: Downgrade final action reads the plan from the configuration
    // =========================================================================
    #[tokio::test]
    async fn test_downgrade_final_action() {
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            lifecycle.clone(),
        );
        let sub = Uuid::new_v4();
        let campaign = campaign_with_action(
            &service,
            FinalAction::Downgrade,
            CampaignTarget::Subscription(sub),
        )
        .await;

        service
            .resolution
            .fail_campaign(campaign.id, "downgrade")
            .await
            .unwrap();

        assert_eq!(
            lifecycle.downgrades.lock().unwrap().as_slice(),
            &[(sub, "free".to_string())]
        );
        let changes = lifecycle.state_changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].2, "downgrade_scheduled");
    }
}

mod scheduling_tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use time::Duration;
    use uuid::Uuid;

    use super::support::*;
    use crate::attempt::{AttemptOutcome, AttemptStatus};
    use crate::campaign::{CampaignParams, CampaignStatus, CampaignTarget};
    use crate::gateway::ChargeOutcome;
    use crate::policy::{AttemptAction, FinalAction};
    use crate::LedgerStore;

    async fn due_campaign(
        service: &crate::DunningService,
        config: &crate::policy::DunningConfiguration,
        target: CampaignTarget,
    ) -> crate::campaign::DunningCampaign {
        service
            .campaigns
            .create_campaign(CampaignParams {
                configuration_id: config.id,
                target,
                customer_id: Some(Uuid::new_v4()),
                original_failure_reason: "insufficient_funds".to_string(),
                original_amount_cents: 4900,
                currency: "usd".to_string(),
            })
            .await
            .unwrap()
    }

    // =========================================================================
    // DUN-S01: max=3 with offsets [1,3,7] - three declines then the final
    // action, with no fourth attempt row and offsets anchored to creation
    // =========================================================================
    #[tokio::test]
    async fn test_exhaustion_after_three_declines() {
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let (service, store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            lifecycle.clone(),
        );
        let config =
            make_config(&service, 3, vec![1, 3, 7], FinalAction::Cancel, BTreeMap::new(), 0).await;
        let sub = Uuid::new_v4();
        let campaign = due_campaign(&service, &config, CampaignTarget::Subscription(sub)).await;

        // Attempts 1 and 2 fail and reschedule against created_at
        for (completed, expected_offset) in [(1, 3), (2, 7)] {
            let current = service.campaigns.get_campaign(campaign.id).await.unwrap();
            let outcome = service.attempts.process_due_campaign(&current).await.unwrap();
            match outcome {
                AttemptOutcome::Rescheduled { next_retry_at, .. } => {
                    assert_eq!(
                        next_retry_at,
                        campaign.created_at + Duration::days(expected_offset)
                    );
                }
                other => panic!("attempt {} expected reschedule, got {:?}", completed, other),
            }
        }

        // Attempt 3 consumes the budget
        let current = service.campaigns.get_campaign(campaign.id).await.unwrap();
        let outcome = service.attempts.process_due_campaign(&current).await.unwrap();
        assert_eq!(
            outcome,
            AttemptOutcome::Exhausted {
                final_action: "cancel".to_string()
            }
        );

        // A stale scheduler processing the campaign again creates no attempt
        let outcome = service.attempts.process_due_campaign(&current).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Exhausted { .. }));

        let attempts = store.list_attempts(campaign.id).await.unwrap();
        assert_eq!(attempts.len(), 3, "No attempt row past the budget");
        assert!(attempts.iter().all(|a| a.status == AttemptStatus::Failed));
        assert_eq!(lifecycle.cancellations.lock().unwrap().as_slice(), &[sub]);

        let stored = service.campaigns.get_campaign(campaign.id).await.unwrap();
        assert_eq!(stored.status, CampaignStatus::Failed);
        assert!(stored.next_retry_at.is_none());
    }

    // =========================================================================
    // DUN-S02: A successful payment retry recovers the campaign
    // =========================================================================
    #[tokio::test]
    async fn test_payment_retry_recovers() {
        let gateway = Arc::new(ScriptedGateway::scripted(vec![
            ChargeOutcome::Declined {
                reason: "card_declined".to_string(),
            },
            ChargeOutcome::Succeeded {
                payment_id: "pi_recovered".to_string(),
            },
        ]));
        let (service, store) = build_service(
            gateway.clone(),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RecordingLifecycle::default()),
        );
        let config =
            make_config(&service, 3, vec![1, 3, 7], FinalAction::Cancel, BTreeMap::new(), 0).await;
        let campaign =
            due_campaign(&service, &config, CampaignTarget::Payment(Uuid::new_v4())).await;

        let current = service.campaigns.get_campaign(campaign.id).await.unwrap();
        let first = service.attempts.process_due_campaign(&current).await.unwrap();
        assert!(matches!(first, AttemptOutcome::Rescheduled { .. }));

        let current = service.campaigns.get_campaign(campaign.id).await.unwrap();
        let second = service.attempts.process_due_campaign(&current).await.unwrap();
        assert!(matches!(second, AttemptOutcome::Recovered { .. }));

        let stored = service.campaigns.get_campaign(campaign.id).await.unwrap();
        assert_eq!(stored.status, CampaignStatus::Recovered);
        assert_eq!(stored.recovered_amount_cents, Some(4900));

        let attempts = store.list_attempts(campaign.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].status, AttemptStatus::Succeeded);
        assert_eq!(attempts[1].payment_id.as_deref(), Some("pi_recovered"));

        // Each charge carries its attempt's identity so the gateway can key
        // provider-side deduplication on it
        let charges = gateway.charges.lock().unwrap();
        assert_eq!(charges.len(), 2);
        assert_eq!(charges[0].0, attempts[0].id);
        assert_eq!(charges[1].0, attempts[1].id);
    }

    // =========================================================================
    // DUN-S03: Email attempts use the configured template and still advance
    // the schedule; a failed send is recorded but does not halt the campaign
    // =========================================================================
    #[tokio::test]
    async fn test_email_attempts_advance_schedule() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut actions = BTreeMap::new();
        actions.insert(
            1,
            AttemptAction::Email {
                template_id: "payment_failed".to_string(),
            },
        );

        let (service, store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            notifier.clone(),
            Arc::new(RecordingLifecycle::default()),
        );
        let config =
            make_config(&service, 3, vec![0, 3, 7], FinalAction::Pause, actions, 0).await;
        let campaign =
            due_campaign(&service, &config, CampaignTarget::Subscription(Uuid::new_v4())).await;

        let current = service.campaigns.get_campaign(campaign.id).await.unwrap();
        let outcome = service.attempts.process_due_campaign(&current).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Rescheduled { .. }));

        let sends = notifier.sends.lock().unwrap();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, "payment_failed");
        assert_eq!(sends[0].1, campaign.customer_id);
        assert_eq!(sends[0].2["amount_cents"], 4900);
        assert_eq!(sends[0].2["allow_customer_retry"], true);
        drop(sends);

        let attempts = store.list_attempts(campaign.id).await.unwrap();
        assert_eq!(attempts[0].status, AttemptStatus::Succeeded);
        assert_eq!(
            attempts[0].communication_template.as_deref(),
            Some("payment_failed")
        );

        // Failed sends complete the attempt as failed and keep going
        let failing = Arc::new(RecordingNotifier::failing());
        let mut actions = BTreeMap::new();
        actions.insert(
            1,
            AttemptAction::Email {
                template_id: "payment_failed".to_string(),
            },
        );
        let (service, store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            failing,
            Arc::new(RecordingLifecycle::default()),
        );
        let config =
            make_config(&service, 3, vec![0, 3, 7], FinalAction::Pause, actions, 0).await;
        let campaign =
            due_campaign(&service, &config, CampaignTarget::Subscription(Uuid::new_v4())).await;

        let current = service.campaigns.get_campaign(campaign.id).await.unwrap();
        let outcome = service.attempts.process_due_campaign(&current).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Rescheduled { .. }));

        let attempts = store.list_attempts(campaign.id).await.unwrap();
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert!(attempts[0].payment_error.is_some());
    }

    // =========================================================================
    // DUN-S04: Zero-retry policy goes straight to the final action once the
    // grace period elapses, with no attempt rows at all
    // =========================================================================
    #[tokio::test]
    async fn test_zero_retry_policy_goes_straight_to_final_action() {
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let (service, store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            lifecycle.clone(),
        );
        let config =
            make_config(&service, 0, vec![], FinalAction::Pause, BTreeMap::new(), 0).await;
        let sub = Uuid::new_v4();
        let campaign = due_campaign(&service, &config, CampaignTarget::Subscription(sub)).await;

        let current = service.campaigns.get_campaign(campaign.id).await.unwrap();
        let outcome = service.attempts.process_due_campaign(&current).await.unwrap();
        assert_eq!(
            outcome,
            AttemptOutcome::Exhausted {
                final_action: "pause".to_string()
            }
        );

        assert!(store.list_attempts(campaign.id).await.unwrap().is_empty());
        assert_eq!(lifecycle.pauses.lock().unwrap().as_slice(), &[sub]);

        let stored = service.campaigns.get_campaign(campaign.id).await.unwrap();
        assert_eq!(stored.status, CampaignStatus::Failed);
        assert_eq!(stored.final_action_taken, Some(FinalAction::Pause));
        assert!(stored.next_retry_at.is_none());
        assert!(stored.final_action_completed_at.is_some());
    }

    // =========================================================================
    // DUN-S05: A stalled gateway or notifier is cut off at the collaborator
    // timeout; the attempt completes as failed instead of hanging the pass
    // =========================================================================
    #[tokio::test]
    async fn test_stalled_collaborators_bounded_by_timeout() {
        let short_timeout = crate::DunningServiceConfig {
            collaborator_timeout: std::time::Duration::from_millis(50),
        };

        // Stalled payment gateway
        let (service, store) = build_service_with_config(
            Arc::new(StalledGateway),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RecordingLifecycle::default()),
            short_timeout.clone(),
        );
        let config =
            make_config(&service, 3, vec![0, 3, 7], FinalAction::Cancel, BTreeMap::new(), 0).await;
        let campaign =
            due_campaign(&service, &config, CampaignTarget::Payment(Uuid::new_v4())).await;

        let current = service.campaigns.get_campaign(campaign.id).await.unwrap();
        let outcome = service.attempts.process_due_campaign(&current).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Rescheduled { .. }));

        let attempts = store.list_attempts(campaign.id).await.unwrap();
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert!(attempts[0]
            .payment_error
            .as_deref()
            .unwrap()
            .contains("timed out"));

        // Stalled notifier
        let mut actions = BTreeMap::new();
        actions.insert(
            1,
            AttemptAction::Email {
                template_id: "payment_failed".to_string(),
            },
        );
        let (service, store) = build_service_with_config(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(StalledNotifier),
            Arc::new(RecordingLifecycle::default()),
            short_timeout,
        );
        let config =
            make_config(&service, 3, vec![0, 3, 7], FinalAction::Cancel, actions, 0).await;
        let campaign =
            due_campaign(&service, &config, CampaignTarget::Subscription(Uuid::new_v4())).await;

        let current = service.campaigns.get_campaign(campaign.id).await.unwrap();
        let outcome = service.attempts.process_due_campaign(&current).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Rescheduled { .. }));

        let attempts = store.list_attempts(campaign.id).await.unwrap();
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert!(attempts[0]
            .payment_error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }
}

mod reconciliation_tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use uuid::Uuid;

    use super::support::*;
    use crate::campaign::{CampaignParams, CampaignStatus, CampaignTarget};
    use crate::error::DunningError;
    use crate::policy::FinalAction;

    // =========================================================================
    // DUN-RC01: A final action that fails mid-flight leaves the campaign
    // failed-but-pending; the reconciliation pass completes it
    // =========================================================================
    #[tokio::test]
    async fn test_reconciliation_completes_pending_final_action() {
        let lifecycle = Arc::new(RecordingLifecycle::failing_first(1));
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            lifecycle.clone(),
        );
        let config =
            make_config(&service, 3, vec![1, 3, 7], FinalAction::Cancel, BTreeMap::new(), 0).await;
        let sub = Uuid::new_v4();
        let campaign = service
            .campaigns
            .create_campaign(CampaignParams {
                configuration_id: config.id,
                target: CampaignTarget::Subscription(sub),
                customer_id: Some(Uuid::new_v4()),
                original_failure_reason: "card_declined".to_string(),
                original_amount_cents: 2900,
                currency: "usd".to_string(),
            })
            .await
            .unwrap();

        // The billing provider is down for the first call
        let result = service.resolution.fail_campaign(campaign.id, "cancel").await;
        assert!(matches!(result, Err(DunningError::FinalActionFailed(_))));

        let stored = service.campaigns.get_campaign(campaign.id).await.unwrap();
        assert_eq!(stored.status, CampaignStatus::Failed, "Status is never rolled back");
        assert!(stored.final_action_completed_at.is_none());

        let summary = service.reconciler.run().await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.errors, 0);

        assert_eq!(lifecycle.cancellations.lock().unwrap().as_slice(), &[sub]);
        let stored = service.campaigns.get_campaign(campaign.id).await.unwrap();
        assert!(stored.final_action_completed_at.is_some());

        // Nothing left to reconcile
        let summary = service.reconciler.run().await.unwrap();
        assert_eq!(summary.scanned, 0);
    }

    // =========================================================================
    // DUN-RC02: One bad item does not abort the batch
    // =========================================================================
    #[tokio::test]
    async fn test_reconciliation_isolates_failures() {
        let lifecycle = Arc::new(RecordingLifecycle::failing_first(3));
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            lifecycle.clone(),
        );
        let config =
            make_config(&service, 3, vec![1, 3, 7], FinalAction::Cancel, BTreeMap::new(), 0).await;

        let mut ids = vec![];
        for _ in 0..2 {
            let campaign = service
                .campaigns
                .create_campaign(CampaignParams {
                    configuration_id: config.id,
                    target: CampaignTarget::Subscription(Uuid::new_v4()),
                    customer_id: Some(Uuid::new_v4()),
                    original_failure_reason: "card_declined".to_string(),
                    original_amount_cents: 2900,
                    currency: "usd".to_string(),
                })
                .await
                .unwrap();
            // First lifecycle call for each campaign fails (calls 1 and 2)
            let _ = service.resolution.fail_campaign(campaign.id, "cancel").await;
            ids.push(campaign.id);
        }

        // One more scripted failure remains: the first reconciled item fails,
        // the second succeeds.
        let summary = service.reconciler.run().await.unwrap();
        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.errors, 1);

        let summary = service.reconciler.run().await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.completed, 1);
    }
}

mod configuration_tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use uuid::Uuid;

    use super::support::*;
    use crate::campaign::{CampaignParams, CampaignTarget};
    use crate::error::DunningError;
    use crate::policy::{FinalAction, NewConfiguration};

    fn new_config(workspace_id: Uuid, name: &str, is_default: bool) -> NewConfiguration {
        NewConfiguration {
            workspace_id,
            name: name.to_string(),
            description: None,
            is_default,
            max_retry_attempts: 3,
            retry_interval_days: vec![1, 3, 7],
            attempt_actions: BTreeMap::new(),
            final_action: FinalAction::Cancel,
            final_action_config: serde_json::json!({}),
            grace_period_hours: 24,
            allow_customer_retry: true,
            pre_dunning_reminder_enabled: false,
            pre_dunning_reminder_days: 3,
        }
    }

    // =========================================================================
    // DUN-P01: Creating a new default atomically replaces the previous one
    // =========================================================================
    #[tokio::test]
    async fn test_default_replacement() {
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RecordingLifecycle::default()),
        );
        let workspace = Uuid::new_v4();

        let first = service
            .policies
            .create_configuration(new_config(workspace, "first", true))
            .await
            .unwrap();
        let second = service
            .policies
            .create_configuration(new_config(workspace, "second", true))
            .await
            .unwrap();

        let default = service
            .policies
            .get_default_configuration(workspace)
            .await
            .unwrap();
        assert_eq!(default.id, second.id);

        let demoted = service.policies.get_configuration(first.id).await.unwrap();
        assert!(!demoted.is_default);
    }

    // =========================================================================
    // DUN-P02: Structural validation and in-use deletion protection
    // =========================================================================
    #[tokio::test]
    async fn test_validation_and_delete_protection() {
        let (service, _store) = build_service(
            Arc::new(ScriptedGateway::declining()),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RecordingLifecycle::default()),
        );
        let workspace = Uuid::new_v4();

        // Schedule shorter than the retry budget
        let mut short = new_config(workspace, "short", false);
        short.retry_interval_days = vec![1, 3];
        assert!(matches!(
            service.policies.create_configuration(short).await,
            Err(DunningError::Validation(_))
        ));

        // Negative offsets
        let mut negative = new_config(workspace, "negative", false);
        negative.retry_interval_days = vec![1, -3, 7];
        assert!(matches!(
            service.policies.create_configuration(negative).await,
            Err(DunningError::Validation(_))
        ));

        // Zero retries is a valid straight-to-final-action policy
        let mut zero = new_config(workspace, "zero", false);
        zero.max_retry_attempts = 0;
        zero.retry_interval_days = vec![];
        assert!(service.policies.create_configuration(zero).await.is_ok());

        // In-use configurations cannot be deleted
        let config = service
            .policies
            .create_configuration(new_config(workspace, "in-use", false))
            .await
            .unwrap();
        service
            .campaigns
            .create_campaign(CampaignParams {
                configuration_id: config.id,
                target: CampaignTarget::Subscription(Uuid::new_v4()),
                customer_id: Some(Uuid::new_v4()),
                original_failure_reason: "card_declined".to_string(),
                original_amount_cents: 2900,
                currency: "usd".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(
            service.policies.delete_configuration(config.id).await,
            Err(DunningError::Validation(_))
        ));

        // Rename still works while in use
        service
            .policies
            .rename_configuration(config.id, "renamed".to_string(), None)
            .await
            .unwrap();
        let renamed = service.policies.get_configuration(config.id).await.unwrap();
        assert_eq!(renamed.name, "renamed");
    }
}
