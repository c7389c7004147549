//! Contracts of the admission queues the controller consults.
//!
//! The queues own all token and slot accounting; the controller only decides
//! which of them to consult and guarantees that whatever it acquired is
//! released. Implementations must be internally thread-safe. `admit` calls may
//! suspend the caller until capacity is available and must return
//! [`AdmissionError::Cancelled`] once the supplied token is cancelled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use api_types::StoreId;
use api_types::TenantId;
use api_types::WorkPriority;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::AdmissionError;
use crate::Result;

/// Tenant ID => weight.
pub type TenantWeightMap = HashMap<u64, u32>;

/// Admission information derived once per request and handed unchanged to
/// every queue that is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkInfo {
    pub tenant_id: TenantId,
    pub priority: WorkPriority,
    /// Unix nanoseconds, used for FIFO ordering within a priority.
    pub create_time: i64,
    /// Exempt from capacity checks.
    pub bypass_admission: bool,
}

/// Admission information for the per-store write queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreWriteWorkInfo {
    pub work_info: WorkInfo,
}

/// Bytes actually written by admitted (or bypassed) work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreWorkDoneInfo {
    pub write_bytes: i64,
    pub ingested_bytes: i64,
}

/// Statistics of a bulk ingestion that should not count towards normal
/// write throughput.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOperationStats {
    pub bytes: u64,
    pub approx_ingested_into_l0_bytes: u64,
}

/// Token returned by a store write queue.
///
/// Not `Clone`: it goes back to the queue exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct StoreWorkHandle {
    tenant_id: TenantId,
    work_id: u64,
    admission_enabled: bool,
}

impl StoreWorkHandle {
    pub fn new(tenant_id: TenantId, work_id: u64, admission_enabled: bool) -> Self {
        Self {
            tenant_id,
            work_id,
            admission_enabled,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// Queue-assigned identifier of this admission.
    pub fn work_id(&self) -> u64 {
        self.work_id
    }

    /// Whether the queue charged this request. When false the request was let
    /// through without accounting and must not be reported as done.
    pub fn admission_enabled(&self) -> bool {
        self.admission_enabled
    }
}

/// Token returned by the elastic CPU queue: a bounded allotment of CPU time.
#[derive(Debug, PartialEq, Eq)]
pub struct ElasticCpuWorkHandle {
    work_id: u64,
    allotted: Duration,
    started_at: Instant,
}

impl ElasticCpuWorkHandle {
    pub fn new(work_id: u64, allotted: Duration) -> Self {
        Self {
            work_id,
            allotted,
            started_at: Instant::now(),
        }
    }

    pub fn work_id(&self) -> u64 {
        self.work_id
    }

    pub fn allotted(&self) -> Duration {
        self.allotted
    }

    pub fn running_time(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether the holder has used up its allotment and should yield.
    pub fn over_limit(&self) -> bool {
        self.running_time() >= self.allotted
    }
}

/// The general KV work queue.
#[async_trait::async_trait]
pub trait WorkQueue: Send + Sync {
    /// Returns whether [`WorkQueue::admitted_work_done`] must be called once the
    /// work completes.
    async fn admit(&self, cancel: &CancellationToken, info: WorkInfo)
        -> Result<bool, AdmissionError>;

    fn admitted_work_done(&self, tenant_id: TenantId);

    fn set_tenant_weights(&self, weights: &TenantWeightMap);
}

/// A per-store write admission queue.
#[async_trait::async_trait]
pub trait StoreWorkQueue: Send + Sync {
    async fn admit(
        &self,
        cancel: &CancellationToken,
        info: StoreWriteWorkInfo,
    ) -> Result<StoreWorkHandle, AdmissionError>;

    fn admitted_work_done(
        &self,
        handle: StoreWorkHandle,
        done: StoreWorkDoneInfo,
    ) -> Result<(), AdmissionError>;

    /// Account for work that was applied without passing through admission.
    fn bypassed_work_done(&self, num_entries: i64, done: StoreWorkDoneInfo);

    fn stats_to_ignore(&self, stats: IngestOperationStats);

    fn set_tenant_weights(&self, weights: &TenantWeightMap);
}

/// Resolves the write queue of each store on this node.
pub trait StoreGrantCoordinators: Send + Sync {
    fn try_get_queue_for_store(&self, store_id: StoreId) -> Option<Arc<dyn StoreWorkQueue>>;
}

/// The elastic CPU queue, handing out CPU time to background work.
#[async_trait::async_trait]
pub trait ElasticCpuWorkQueue: Send + Sync {
    async fn admit(
        &self,
        cancel: &CancellationToken,
        duration: Duration,
        info: WorkInfo,
    ) -> Result<ElasticCpuWorkHandle, AdmissionError>;

    /// Returns unused CPU time. A `None` handle is a no-op.
    fn admitted_work_done(&self, handle: Option<ElasticCpuWorkHandle>);

    fn set_tenant_weights(&self, weights: &TenantWeightMap);
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test(tokio::test(start_paused = true))]
    async fn elastic_cpu_handle_goes_over_limit() {
        let handle = ElasticCpuWorkHandle::new(7, Duration::from_millis(10));
        assert!(!handle.over_limit());

        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(handle.over_limit());
        assert_eq!(handle.work_id(), 7);
    }

    #[test]
    fn zero_allotment_is_immediately_over_limit() {
        let handle = ElasticCpuWorkHandle::new(1, Duration::ZERO);
        assert!(handle.over_limit());
    }
}
