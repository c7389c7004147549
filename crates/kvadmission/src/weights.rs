//! Periodic propagation of tenant weights into the admission queues.

use std::sync::Arc;
use std::time::Duration;

use api_types::StoreId;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::controller::AdmissionQueues;
use crate::queue::TenantWeightMap;
use crate::settings::Settings;

/// How often tenant weights are recomputed.
pub const WEIGHT_CALCULATION_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Tenant weights for one store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantWeightsForStore {
    pub store_id: StoreId,
    pub weights: TenantWeightMap,
}

/// A snapshot of tenant weights for the node and each of its stores.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantWeights {
    pub node: TenantWeightMap,
    pub stores: Vec<TenantWeightsForStore>,
}

/// Source of tenant weights, typically derived from the number of ranges each
/// tenant has on the node.
pub trait TenantWeightProvider: Send + Sync {
    fn get_tenant_weights(&self) -> TenantWeights;
}

/// State of the weight loop. Owned by the loop task, never shared.
pub(crate) struct TenantWeightUpdater {
    queues: AdmissionQueues,
    settings: Arc<Settings>,
    provider: Arc<dyn TenantWeightProvider>,
    all_weights_disabled: bool,
}

impl TenantWeightUpdater {
    pub(crate) fn new(
        queues: AdmissionQueues,
        settings: Arc<Settings>,
        provider: Arc<dyn TenantWeightProvider>,
    ) -> Self {
        Self {
            queues,
            settings,
            provider,
            all_weights_disabled: false,
        }
    }

    /// Run one weight update. Returns whether the provider was consulted.
    pub(crate) fn tick(&mut self) -> bool {
        let kv_disabled = !self.settings.kv_tenant_weights_enabled();
        let kv_stores_disabled = !self.settings.kv_stores_tenant_weights_enabled();
        if self.all_weights_disabled && kv_disabled && kv_stores_disabled {
            // Already pushed cleared weights.
            return false;
        }

        let TenantWeights { mut node, stores } = self.provider.get_tenant_weights();
        if kv_disabled {
            node.clear();
        }
        self.queues.kv_queue.set_tenant_weights(&node);
        self.queues.elastic_cpu_queue.set_tenant_weights(&node);

        let mut updated_stores = 0usize;
        for TenantWeightsForStore {
            store_id,
            mut weights,
        } in stores
        {
            let Some(queue) = self
                .queues
                .store_grant_coordinators
                .try_get_queue_for_store(store_id)
            else {
                tracing::debug!(
                    store_id = %store_id,
                    "No admission queue for store, skipping tenant weights"
                );
                continue;
            };
            if kv_stores_disabled {
                weights.clear();
            }
            queue.set_tenant_weights(&weights);
            updated_stores += 1;
        }

        tracing::debug!(
            node_tenants = node.len(),
            updated_stores,
            kv_disabled,
            kv_stores_disabled,
            "Updated tenant weights"
        );
        self.all_weights_disabled = kv_disabled && kv_stores_disabled;
        true
    }

    /// Tick every `period` until `shutdown` is cancelled. The first tick
    /// happens one period after start.
    pub(crate) async fn run(mut self, period: Duration, shutdown: CancellationToken) {
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(period = ?period, "Tenant weight loop started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Tenant weight loop received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.tick();
                }
            }
        }
        tracing::info!("Tenant weight loop stopped");
    }
}
