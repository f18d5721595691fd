// Dunning crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Ledger operations carry full attempt context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PayRecover Dunning Module
//!
//! Automated recovery of failed subscription and one-off payments.
//!
//! ## Features
//!
//! - **Dunning Configurations**: Per-workspace retry policies (schedule, actions, final action)
//! - **Campaigns**: One recovery campaign per failed payment, with a strict lifecycle
//! - **Attempts**: Scheduled communications and real payment retries, numbered and immutable
//! - **Final Actions**: Cancel, pause, or downgrade the subscription when recovery fails
//! - **Reconciliation**: Re-applies final actions that failed mid-flight
//! - **Email Notifications**: Templated dunning emails via Resend

pub mod attempt;
pub mod campaign;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod memory;
pub mod notify;
pub mod policy;
pub mod reconcile;
pub mod resolution;
pub mod store;

#[cfg(test)]
mod edge_case_tests;

// Attempt
pub use attempt::{AttemptExecutor, AttemptOutcome, AttemptStatus, AttemptType, DunningAttempt};

// Campaign
pub use campaign::{
    CampaignManager, CampaignParams, CampaignStatus, CampaignTarget, DunningCampaign,
};

// Error
pub use error::{DunningError, DunningResult};

// Gateway
pub use gateway::{ChargeOutcome, PaymentContext, PaymentGateway, StripeGateway};

// Lifecycle
pub use lifecycle::{PgSubscriptionLifecycle, SubscriptionLifecycle};

// Memory
pub use memory::MemoryLedger;

// Notify
pub use notify::{Notifier, ResendNotifier};

// Policy
pub use policy::{
    AttemptAction, DunningConfiguration, FinalAction, NewConfiguration, PolicyService,
};

// Reconcile
pub use reconcile::{ReconciliationSummary, Reconciler};

// Resolution
pub use resolution::ResolutionHandler;

// Store
pub use store::{LedgerStore, PgLedgerStore};

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

/// Tuning knobs shared by every component
#[derive(Debug, Clone)]
pub struct DunningServiceConfig {
    /// Upper bound on any single external collaborator call
    pub collaborator_timeout: Duration,
}

impl Default for DunningServiceConfig {
    fn default() -> Self {
        Self {
            collaborator_timeout: Duration::from_secs(10),
        }
    }
}

/// Main dunning service that combines all recovery functionality
pub struct DunningService {
    pub policies: PolicyService,
    pub campaigns: CampaignManager,
    pub attempts: AttemptExecutor,
    pub resolution: ResolutionHandler,
    pub reconciler: Reconciler,
}

impl DunningService {
    /// Create a dunning service from explicit collaborators
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        lifecycle: Arc<dyn SubscriptionLifecycle>,
        config: DunningServiceConfig,
    ) -> Self {
        let resolution =
            ResolutionHandler::new(store.clone(), lifecycle, config.collaborator_timeout);

        Self {
            policies: PolicyService::new(store.clone()),
            campaigns: CampaignManager::new(store.clone()),
            attempts: AttemptExecutor::new(
                store.clone(),
                gateway,
                notifier,
                resolution.clone(),
                config.collaborator_timeout,
            ),
            reconciler: Reconciler::new(store, resolution.clone()),
            resolution,
        }
    }

    /// Create a dunning service from environment variables, backed by
    /// Postgres, Stripe, and Resend
    pub fn from_env(pool: PgPool) -> DunningResult<Self> {
        let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pool.clone()));
        let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::from_env(pool.clone())?);
        let notifier: Arc<dyn Notifier> = Arc::new(ResendNotifier::from_env(pool.clone())?);
        let lifecycle: Arc<dyn SubscriptionLifecycle> =
            Arc::new(PgSubscriptionLifecycle::new(pool));

        Ok(Self::new(
            store,
            gateway,
            notifier,
            lifecycle,
            DunningServiceConfig::default(),
        ))
    }
}
