//! Reconciliation of incomplete final actions
//!
//! A campaign can end up `failed` with its terminal side effect never
//! applied (provider outage, timeout, crash between the two writes). This
//! job scans for those campaigns and re-executes the side effect per item.
//! One item's failure is logged and skipped, never aborting the batch.

use std::sync::Arc;

use serde::Serialize;

use crate::error::DunningResult;
use crate::resolution::ResolutionHandler;
use crate::store::LedgerStore;

/// Aggregate result of one reconciliation pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationSummary {
    pub scanned: usize,
    pub completed: usize,
    pub errors: usize,
}

pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
    resolution: ResolutionHandler,
    batch_size: i64,
}

impl Reconciler {
    pub fn new(store: Arc<dyn LedgerStore>, resolution: ResolutionHandler) -> Self {
        Self {
            store,
            resolution,
            batch_size: 100,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run one reconciliation pass
    pub async fn run(&self) -> DunningResult<ReconciliationSummary> {
        let pending = self
            .store
            .list_failed_campaigns_pending_final_action(self.batch_size)
            .await?;

        let mut summary = ReconciliationSummary {
            scanned: pending.len(),
            ..Default::default()
        };

        for campaign in pending {
            let Some(action) = campaign.final_action_taken else {
                // Should not be reachable: mark_campaign_failed always stores
                // the action. Flag it for operators rather than guessing.
                tracing::error!(
                    campaign_id = %campaign.id,
                    "Failed campaign has no recorded final action; skipping"
                );
                summary.errors += 1;
                continue;
            };

            match self.resolution.execute_final_action(&campaign, action).await {
                Ok(()) => summary.completed += 1,
                Err(e) => {
                    tracing::warn!(
                        campaign_id = %campaign.id,
                        error = %e,
                        "Reconciliation could not complete final action"
                    );
                    summary.errors += 1;
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            completed = summary.completed,
            errors = summary.errors,
            "Reconciliation pass complete"
        );
        Ok(summary)
    }
}
