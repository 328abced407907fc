//! Completion detection: close out campaigns whose rows all finished.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tracing::{error, info, warn};

use cadence_common::{Signal, campaign::CampaignState};
use cadence_store::{CampaignStore, QueueStore, Store};

use crate::{agent::AgentPreprocessor, error::DeliveryError};

const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Watches `sending` campaigns and stamps their terminal outcome.
pub struct CompletionMonitor {
    store: Arc<dyn Store>,
    agent: Option<Arc<AgentPreprocessor>>,
}

impl std::fmt::Debug for CompletionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionMonitor").finish_non_exhaustive()
    }
}

impl CompletionMonitor {
    /// A monitor; when an agent preprocessor is supplied its KV keys are
    /// cleaned up as campaigns complete.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, agent: Option<Arc<AgentPreprocessor>>) -> Self {
        Self { store, agent }
    }

    /// One pass: complete every `sending` campaign whose rows are all
    /// terminal. Returns how many campaigns were closed.
    ///
    /// # Errors
    ///
    /// Returns the first store error; campaigns already closed stay
    /// closed.
    pub async fn run_cycle(&self) -> Result<u64, DeliveryError> {
        let sending = self
            .store
            .campaigns_in_state(CampaignState::Sending, 1_000)
            .await?;

        let mut closed = 0;
        for campaign in sending {
            let stats = self.store.row_stats(campaign.id).await?;
            if !stats.all_terminal() {
                continue;
            }

            let state = if stats.dead_letter == 0 {
                CampaignState::Completed
            } else if stats.dead_letter == stats.total {
                CampaignState::Failed
            } else {
                CampaignState::CompletedWithErrors
            };

            self.store
                .complete_campaign(campaign.id, state, stats.sent, Utc::now())
                .await?;
            closed += 1;
            info!(
                campaign = %campaign.id,
                state = state.as_str(),
                sent = stats.sent,
                skipped = stats.skipped,
                dead_letter = stats.dead_letter,
                "campaign completed"
            );

            if let Some(agent) = &self.agent {
                if let Err(e) = agent.cleanup_campaign(campaign.id).await {
                    warn!(campaign = %campaign.id, error = %e, "agent cleanup failed");
                }
            }
        }

        Ok(closed)
    }

    /// Run completion detection until shutdown.
    pub async fn serve(&self, mut shutdown: tokio::sync::broadcast::Receiver<Signal>) {
        let mut timer = tokio::time::interval(POLL_INTERVAL);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("completion detection failed: {e}");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) | Err(_) => break,
                    }
                }
            }
        }
    }
}
