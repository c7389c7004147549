//! Recording implementations of the queue and provider traits
//!
//! These stand in for the real admission queues in unit and integration tests.
//! Every call is recorded so tests can assert exactly which tokens were
//! acquired and released.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use api_types::StoreId;
use api_types::TenantId;
use error_stack::report;
use tokio_util::sync::CancellationToken;

use crate::controller::AdmissionQueues;
use crate::queue::ElasticCpuWorkHandle;
use crate::queue::ElasticCpuWorkQueue;
use crate::queue::IngestOperationStats;
use crate::queue::StoreGrantCoordinators;
use crate::queue::StoreWorkDoneInfo;
use crate::queue::StoreWorkHandle;
use crate::queue::StoreWorkQueue;
use crate::queue::StoreWriteWorkInfo;
use crate::queue::TenantWeightMap;
use crate::queue::WorkInfo;
use crate::queue::WorkQueue;
use crate::weights::TenantWeightProvider;
use crate::weights::TenantWeights;
use crate::AdmissionError;
use crate::Result;

async fn wait_for_admission(
    cancel: &CancellationToken,
    block_until_cancelled: &AtomicBool,
    reject: &AtomicBool,
) -> Result<(), AdmissionError> {
    if block_until_cancelled.load(Ordering::Relaxed) {
        cancel.cancelled().await;
    }
    if cancel.is_cancelled() {
        return Err(report!(AdmissionError::Cancelled));
    }
    if reject.load(Ordering::Relaxed) {
        return Err(report!(AdmissionError::rejected("queue is closed")));
    }
    Ok(())
}

/// Mock general KV work queue
pub struct MockWorkQueue {
    admitted: Mutex<Vec<WorkInfo>>,
    done: Mutex<Vec<TenantId>>,
    weights: Mutex<Vec<TenantWeightMap>>,
    reject: AtomicBool,
    block_until_cancelled: AtomicBool,
    must_report_completion: AtomicBool,
}

impl MockWorkQueue {
    pub fn new() -> Self {
        Self {
            admitted: Mutex::new(Vec::new()),
            done: Mutex::new(Vec::new()),
            weights: Mutex::new(Vec::new()),
            reject: AtomicBool::new(false),
            block_until_cancelled: AtomicBool::new(false),
            must_report_completion: AtomicBool::new(true),
        }
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::Relaxed);
    }

    /// Make `admit` wait until the caller's token is cancelled.
    pub fn set_block_until_cancelled(&self, block: bool) {
        self.block_until_cancelled.store(block, Ordering::Relaxed);
    }

    /// What `admit` answers when asked whether completion must be reported.
    pub fn set_must_report_completion(&self, must_report: bool) {
        self.must_report_completion
            .store(must_report, Ordering::Relaxed);
    }

    /// Work infos of successful admissions, in order.
    pub fn admitted(&self) -> Vec<WorkInfo> {
        self.admitted.lock().unwrap().clone()
    }

    /// Tenants reported through `admitted_work_done`, in order.
    pub fn done(&self) -> Vec<TenantId> {
        self.done.lock().unwrap().clone()
    }

    pub fn weights(&self) -> Vec<TenantWeightMap> {
        self.weights.lock().unwrap().clone()
    }
}

impl Default for MockWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl WorkQueue for MockWorkQueue {
    async fn admit(
        &self,
        cancel: &CancellationToken,
        info: WorkInfo,
    ) -> Result<bool, AdmissionError> {
        wait_for_admission(cancel, &self.block_until_cancelled, &self.reject).await?;
        self.admitted.lock().unwrap().push(info);
        Ok(self.must_report_completion.load(Ordering::Relaxed))
    }

    fn admitted_work_done(&self, tenant_id: TenantId) {
        self.done.lock().unwrap().push(tenant_id);
    }

    fn set_tenant_weights(&self, weights: &TenantWeightMap) {
        self.weights.lock().unwrap().push(weights.clone());
    }
}

/// Mock per-store write queue
pub struct MockStoreWorkQueue {
    admitted: Mutex<Vec<StoreWriteWorkInfo>>,
    done: Mutex<Vec<(u64, StoreWorkDoneInfo)>>,
    bypassed: Mutex<Vec<(i64, StoreWorkDoneInfo)>>,
    ignored: Mutex<Vec<IngestOperationStats>>,
    weights: Mutex<Vec<TenantWeightMap>>,
    next_work_id: AtomicU64,
    reject: AtomicBool,
    block_until_cancelled: AtomicBool,
    admission_enabled: AtomicBool,
    fail_work_done: AtomicBool,
}

impl MockStoreWorkQueue {
    pub fn new() -> Self {
        Self {
            admitted: Mutex::new(Vec::new()),
            done: Mutex::new(Vec::new()),
            bypassed: Mutex::new(Vec::new()),
            ignored: Mutex::new(Vec::new()),
            weights: Mutex::new(Vec::new()),
            next_work_id: AtomicU64::new(1),
            reject: AtomicBool::new(false),
            block_until_cancelled: AtomicBool::new(false),
            admission_enabled: AtomicBool::new(true),
            fail_work_done: AtomicBool::new(false),
        }
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::Relaxed);
    }

    pub fn set_block_until_cancelled(&self, block: bool) {
        self.block_until_cancelled.store(block, Ordering::Relaxed);
    }

    /// Whether handed out tokens are charged (see [`StoreWorkHandle::admission_enabled`]).
    pub fn set_admission_enabled(&self, enabled: bool) {
        self.admission_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Make `admitted_work_done` fail, simulating corrupted accounting.
    pub fn set_fail_work_done(&self, fail: bool) {
        self.fail_work_done.store(fail, Ordering::Relaxed);
    }

    pub fn admitted(&self) -> Vec<StoreWriteWorkInfo> {
        self.admitted.lock().unwrap().clone()
    }

    /// `(work_id, done_info)` pairs reported through `admitted_work_done`.
    pub fn done(&self) -> Vec<(u64, StoreWorkDoneInfo)> {
        self.done.lock().unwrap().clone()
    }

    pub fn bypassed(&self) -> Vec<(i64, StoreWorkDoneInfo)> {
        self.bypassed.lock().unwrap().clone()
    }

    pub fn ignored(&self) -> Vec<IngestOperationStats> {
        self.ignored.lock().unwrap().clone()
    }

    pub fn weights(&self) -> Vec<TenantWeightMap> {
        self.weights.lock().unwrap().clone()
    }
}

impl Default for MockStoreWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StoreWorkQueue for MockStoreWorkQueue {
    async fn admit(
        &self,
        cancel: &CancellationToken,
        info: StoreWriteWorkInfo,
    ) -> Result<StoreWorkHandle, AdmissionError> {
        wait_for_admission(cancel, &self.block_until_cancelled, &self.reject).await?;
        self.admitted.lock().unwrap().push(info);
        Ok(StoreWorkHandle::new(
            info.work_info.tenant_id,
            self.next_work_id.fetch_add(1, Ordering::Relaxed),
            // Bypassed work is let through without charging.
            self.admission_enabled.load(Ordering::Relaxed) && !info.work_info.bypass_admission,
        ))
    }

    fn admitted_work_done(
        &self,
        handle: StoreWorkHandle,
        done: StoreWorkDoneInfo,
    ) -> Result<(), AdmissionError> {
        if self.fail_work_done.load(Ordering::Relaxed) {
            return Err(report!(AdmissionError::invariant_violation(format!(
                "unknown store work {}",
                handle.work_id()
            ))));
        }
        self.done.lock().unwrap().push((handle.work_id(), done));
        Ok(())
    }

    fn bypassed_work_done(&self, num_entries: i64, done: StoreWorkDoneInfo) {
        self.bypassed.lock().unwrap().push((num_entries, done));
    }

    fn stats_to_ignore(&self, stats: IngestOperationStats) {
        self.ignored.lock().unwrap().push(stats);
    }

    fn set_tenant_weights(&self, weights: &TenantWeightMap) {
        self.weights.lock().unwrap().push(weights.clone());
    }
}

/// Mock store coordinators with a fixed set of store queues
#[derive(Default)]
pub struct MockStoreGrantCoordinators {
    queues: Mutex<HashMap<StoreId, Arc<MockStoreWorkQueue>>>,
}

impl MockStoreGrantCoordinators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue for `store_id` and return it.
    pub fn add_store(&self, store_id: StoreId) -> Arc<MockStoreWorkQueue> {
        let queue = Arc::new(MockStoreWorkQueue::new());
        self.queues
            .lock()
            .unwrap()
            .insert(store_id, queue.clone());
        queue
    }
}

impl StoreGrantCoordinators for MockStoreGrantCoordinators {
    fn try_get_queue_for_store(&self, store_id: StoreId) -> Option<Arc<dyn StoreWorkQueue>> {
        let queues = self.queues.lock().unwrap();
        queues
            .get(&store_id)
            .map(|queue| queue.clone() as Arc<dyn StoreWorkQueue>)
    }
}

/// Mock elastic CPU queue
pub struct MockElasticCpuWorkQueue {
    admitted: Mutex<Vec<(Duration, WorkInfo)>>,
    released: Mutex<Vec<u64>>,
    weights: Mutex<Vec<TenantWeightMap>>,
    next_work_id: AtomicU64,
    reject: AtomicBool,
    block_until_cancelled: AtomicBool,
    empty_releases: AtomicUsize,
}

impl MockElasticCpuWorkQueue {
    pub fn new() -> Self {
        Self {
            admitted: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            weights: Mutex::new(Vec::new()),
            next_work_id: AtomicU64::new(1),
            reject: AtomicBool::new(false),
            block_until_cancelled: AtomicBool::new(false),
            empty_releases: AtomicUsize::new(0),
        }
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::Relaxed);
    }

    pub fn set_block_until_cancelled(&self, block: bool) {
        self.block_until_cancelled.store(block, Ordering::Relaxed);
    }

    /// `(duration, work_info)` of successful admissions, in order.
    pub fn admitted(&self) -> Vec<(Duration, WorkInfo)> {
        self.admitted.lock().unwrap().clone()
    }

    /// Work IDs of returned allotments, in order.
    pub fn released(&self) -> Vec<u64> {
        self.released.lock().unwrap().clone()
    }

    pub fn released_count(&self) -> usize {
        self.released.lock().unwrap().len()
    }

    /// Number of `admitted_work_done(None)` calls.
    pub fn empty_releases(&self) -> usize {
        self.empty_releases.load(Ordering::Relaxed)
    }

    pub fn weights(&self) -> Vec<TenantWeightMap> {
        self.weights.lock().unwrap().clone()
    }
}

impl Default for MockElasticCpuWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ElasticCpuWorkQueue for MockElasticCpuWorkQueue {
    async fn admit(
        &self,
        cancel: &CancellationToken,
        duration: Duration,
        info: WorkInfo,
    ) -> Result<ElasticCpuWorkHandle, AdmissionError> {
        wait_for_admission(cancel, &self.block_until_cancelled, &self.reject).await?;
        self.admitted.lock().unwrap().push((duration, info));
        Ok(ElasticCpuWorkHandle::new(
            self.next_work_id.fetch_add(1, Ordering::Relaxed),
            duration,
        ))
    }

    fn admitted_work_done(&self, handle: Option<ElasticCpuWorkHandle>) {
        match handle {
            Some(handle) => self.released.lock().unwrap().push(handle.work_id()),
            None => {
                self.empty_releases.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn set_tenant_weights(&self, weights: &TenantWeightMap) {
        self.weights.lock().unwrap().push(weights.clone());
    }
}

/// Mock weight provider returning a configurable snapshot
#[derive(Default)]
pub struct MockTenantWeightProvider {
    weights: Mutex<TenantWeights>,
    calls: AtomicUsize,
}

impl MockTenantWeightProvider {
    pub fn new(weights: TenantWeights) -> Self {
        Self {
            weights: Mutex::new(weights),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_weights(&self, weights: TenantWeights) {
        *self.weights.lock().unwrap() = weights;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl TenantWeightProvider for MockTenantWeightProvider {
    fn get_tenant_weights(&self) -> TenantWeights {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.weights.lock().unwrap().clone()
    }
}

/// The three mock queues wired together.
pub struct MockQueues {
    pub kv: Arc<MockWorkQueue>,
    pub stores: Arc<MockStoreGrantCoordinators>,
    pub elastic_cpu: Arc<MockElasticCpuWorkQueue>,
}

impl MockQueues {
    pub fn new() -> Self {
        Self {
            kv: Arc::new(MockWorkQueue::new()),
            stores: Arc::new(MockStoreGrantCoordinators::new()),
            elastic_cpu: Arc::new(MockElasticCpuWorkQueue::new()),
        }
    }

    pub fn admission_queues(&self) -> AdmissionQueues {
        AdmissionQueues::new(
            self.kv.clone(),
            self.stores.clone(),
            self.elastic_cpu.clone(),
        )
    }
}

impl Default for MockQueues {
    fn default() -> Self {
        Self::new()
    }
}
