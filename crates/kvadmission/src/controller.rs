//! Admission control for KV requests.
//!
//! The [`Controller`] is consulted by the KV server before evaluating a batch
//! request. It classifies the request, routes it through the per-store write
//! queue and then either the elastic CPU queue (export requests) or the
//! general KV queue, and hands back a [`Handle`] that must be returned through
//! [`Controller::admitted_kv_work_done`] once the work is finished.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use api_types::AdmissionSource;
use api_types::BatchRequest;
use api_types::RangeFeedRequest;
use api_types::StoreId;
use api_types::TenantId;
use api_types::WorkPriority;
use error_stack::Report;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::accounting::FollowerStoreWriteBytes;
use crate::accounting::StoreWriteBytes;
use crate::handle::Handle;
use crate::handle::PendingHandle;
use crate::handle::StoreWork;
use crate::log_limiter::LogEvery;
use crate::pacer::Pacer;
use crate::queue::ElasticCpuWorkQueue;
use crate::queue::IngestOperationStats;
use crate::queue::StoreGrantCoordinators;
use crate::queue::StoreWorkDoneInfo;
use crate::queue::StoreWriteWorkInfo;
use crate::queue::WorkInfo;
use crate::queue::WorkQueue;
use crate::settings::Settings;
use crate::weights::TenantWeightProvider;
use crate::weights::TenantWeightUpdater;
use crate::weights::WEIGHT_CALCULATION_PERIOD;
use crate::AdmissionError;
use crate::Result;

/// Minimum spacing between two logged invariant violations.
const INVARIANT_LOG_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// The admission subsystems the controller routes through. They are either
/// all present or all absent.
#[derive(Clone)]
pub struct AdmissionQueues {
    pub kv_queue: Arc<dyn WorkQueue>,
    pub store_grant_coordinators: Arc<dyn StoreGrantCoordinators>,
    pub elastic_cpu_queue: Arc<dyn ElasticCpuWorkQueue>,
}

impl AdmissionQueues {
    pub fn new(
        kv_queue: Arc<dyn WorkQueue>,
        store_grant_coordinators: Arc<dyn StoreGrantCoordinators>,
        elastic_cpu_queue: Arc<dyn ElasticCpuWorkQueue>,
    ) -> Self {
        Self {
            kv_queue,
            store_grant_coordinators,
            elastic_cpu_queue,
        }
    }
}

impl fmt::Debug for AdmissionQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionQueues").finish_non_exhaustive()
    }
}

/// What to do when a queue reports accounting state that should be impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantPolicy {
    /// Panic.
    Fatal,
    /// Log an error, at most once per 10 seconds.
    Log,
}

impl Default for InvariantPolicy {
    fn default() -> Self {
        if cfg!(any(test, feature = "strict-invariants")) {
            Self::Fatal
        } else {
            Self::Log
        }
    }
}

/// Applies an [`InvariantPolicy`] to accounting failures reported by queues.
#[derive(Debug)]
pub(crate) struct InvariantReporter {
    policy: InvariantPolicy,
    every: LogEvery,
    violations: AtomicU64,
    logged: AtomicU64,
}

impl InvariantReporter {
    pub(crate) fn new(policy: InvariantPolicy) -> Self {
        Self {
            policy,
            every: LogEvery::new(INVARIANT_LOG_INTERVAL),
            violations: AtomicU64::new(0),
            logged: AtomicU64::new(0),
        }
    }

    pub(crate) fn policy(&self) -> InvariantPolicy {
        self.policy
    }

    /// Panics under [`InvariantPolicy::Fatal`]. Otherwise returns whether the
    /// violation was logged.
    pub(crate) fn report(&self, tenant_id: TenantId, report: Report<AdmissionError>) -> bool {
        self.violations.fetch_add(1, Ordering::Relaxed);
        match self.policy {
            InvariantPolicy::Fatal => {
                panic!("store admission accounting invariant violated: {report:?}")
            }
            InvariantPolicy::Log => {
                if !self.every.should_log() {
                    return false;
                }
                self.logged.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    tenant_id = %tenant_id,
                    error = ?report,
                    "Store admission accounting invariant violated"
                );
                true
            }
        }
    }

    /// Violations observed so far.
    pub(crate) fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Violations that made it into the log.
    pub(crate) fn logged(&self) -> u64 {
        self.logged.load(Ordering::Relaxed)
    }
}

/// Outcome of consulting the store write queue.
pub(crate) enum StoreAdmission {
    /// Not a store write, or the store has no queue.
    Skipped,
    /// Admitted and charged; the token must be returned on completion.
    AdmittedChargeable(StoreWork),
    /// Admitted without charging. The remaining queues are skipped.
    AdmittedExempt,
}

/// Admission control entry points used by the KV server.
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    /// Admit a batch request, waiting for capacity if needed.
    ///
    /// Either every queue the request needs admits it, or nothing acquired
    /// during this call stays held when the error is returned.
    async fn admit_kv_work(
        &self,
        cancel: &CancellationToken,
        tenant_id: TenantId,
        request: &BatchRequest,
    ) -> Result<Handle, AdmissionError>;

    /// Report completion of admitted work. `write_bytes` is what the request
    /// wrote to the store, if anything.
    fn admitted_kv_work_done(&self, handle: Handle, write_bytes: Option<&StoreWriteBytes>);

    /// Build a pacer for a rangefeed catch-up scan. `None` when admission
    /// control is not configured, in which case no pacing happens.
    fn admit_rangefeed_request(
        &self,
        tenant_id: TenantId,
        request: &RangeFeedRequest,
    ) -> Option<Pacer>;

    /// Start the periodic tenant weight loop. It stops once `shutdown` is
    /// cancelled.
    fn set_tenant_weight_provider(
        &self,
        provider: Arc<dyn TenantWeightProvider>,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>>;

    /// Tell the store queue to discount a snapshot ingestion.
    fn snapshot_ingested(&self, store_id: StoreId, stats: IngestOperationStats);

    /// Account for writes applied by a follower replica.
    fn follower_store_write_bytes(&self, store_id: StoreId, bytes: FollowerStoreWriteBytes);
}

/// [`Controller`] backed by the node's admission queues.
pub struct KvAdmissionController {
    queues: Option<AdmissionQueues>,
    settings: Arc<Settings>,
    invariants: InvariantReporter,
}

impl KvAdmissionController {
    /// `queues` is `None` when admission control is not configured on this
    /// node; every request is then admitted immediately.
    pub fn new(queues: Option<AdmissionQueues>, settings: Arc<Settings>) -> Self {
        Self {
            queues,
            settings,
            invariants: InvariantReporter::new(InvariantPolicy::default()),
        }
    }

    pub fn with_invariant_policy(mut self, policy: InvariantPolicy) -> Self {
        self.invariants = InvariantReporter::new(policy);
        self
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    fn work_info(&self, tenant_id: TenantId, request: &BatchRequest) -> WorkInfo {
        let header = &request.admission_header;
        let mut bypass_admission = request.is_admin;
        let mut source = header.source;
        if !tenant_id.is_system() {
            // Requests from SQL pods are always subject to admission.
            bypass_admission = false;
            source = AdmissionSource::FromSql;
        }
        if source == AdmissionSource::Other {
            bypass_admission = true;
        }
        if self.settings.kv_bulk_only_admission_control_enabled()
            && header.priority >= WorkPriority::NORMAL_PRI
        {
            bypass_admission = true;
        }

        let mut create_time = header.create_time;
        if !bypass_admission && create_time == 0 {
            create_time = unix_nanos_now();
        }

        WorkInfo {
            tenant_id,
            priority: header.priority,
            create_time,
            bypass_admission,
        }
    }

    async fn admit_store_write(
        &self,
        queues: &AdmissionQueues,
        cancel: &CancellationToken,
        request: &BatchRequest,
        info: WorkInfo,
    ) -> Result<StoreAdmission, AdmissionError> {
        // Heartbeats would take a slot even when bypassing, and throttled
        // writes produce more of them.
        if !request.is_write || request.is_single_heartbeat_txn_request {
            return Ok(StoreAdmission::Skipped);
        }
        let Some(queue) = queues
            .store_grant_coordinators
            .try_get_queue_for_store(request.store_id)
        else {
            return Ok(StoreAdmission::Skipped);
        };

        let handle = queue
            .admit(cancel, StoreWriteWorkInfo { work_info: info })
            .await?;
        if handle.admission_enabled() {
            Ok(StoreAdmission::AdmittedChargeable(StoreWork { queue, handle }))
        } else {
            tracing::debug!(
                tenant_id = %info.tenant_id,
                store_id = %request.store_id,
                "Store admitted write without charging"
            );
            Ok(StoreAdmission::AdmittedExempt)
        }
    }
}

impl fmt::Debug for KvAdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvAdmissionController")
            .field("enabled", &self.queues.is_some())
            .field("settings", &self.settings)
            .field("invariant_policy", &self.invariants.policy())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Controller for KvAdmissionController {
    async fn admit_kv_work(
        &self,
        cancel: &CancellationToken,
        tenant_id: TenantId,
        request: &BatchRequest,
    ) -> Result<Handle, AdmissionError> {
        let Some(queues) = &self.queues else {
            return Ok(Handle::new(tenant_id));
        };

        let info = self.work_info(tenant_id, request);
        let mut pending = PendingHandle::new(
            tenant_id,
            queues.elastic_cpu_queue.as_ref(),
            &self.invariants,
        );

        let admission_enabled = match self
            .admit_store_write(queues, cancel, request, info)
            .await?
        {
            StoreAdmission::Skipped => true,
            StoreAdmission::AdmittedChargeable(work) => {
                pending.set_store_work(work);
                true
            }
            StoreAdmission::AdmittedExempt => false,
        };

        if admission_enabled {
            if request.is_single_export_request {
                // Exports get a bounded CPU allotment and are expected to
                // return early once it is used up.
                let duration = self.settings.elastic_cpu_duration_per_export_request();
                let work = queues
                    .elastic_cpu_queue
                    .admit(cancel, duration, info)
                    .await?;
                pending.set_elastic_cpu_work(work);
            } else {
                let must_report = queues.kv_queue.admit(cancel, info).await?;
                pending.set_call_admitted_work_done_on_kv_queue(must_report);
            }
        }

        Ok(pending.commit())
    }

    fn admitted_kv_work_done(&self, handle: Handle, write_bytes: Option<&StoreWriteBytes>) {
        let Handle {
            tenant_id,
            store_work,
            elastic_cpu_work,
            call_admitted_work_done_on_kv_queue,
        } = handle;

        if let Some(queues) = &self.queues {
            queues.elastic_cpu_queue.admitted_work_done(elastic_cpu_work);
            if call_admitted_work_done_on_kv_queue {
                queues.kv_queue.admitted_work_done(tenant_id);
            }
        }

        if let Some(StoreWork { queue, handle }) = store_work {
            let done = write_bytes
                .map(StoreWorkDoneInfo::from)
                .unwrap_or_default();
            if let Err(report) = queue.admitted_work_done(handle, done) {
                self.invariants.report(tenant_id, report);
            }
        }
    }

    fn admit_rangefeed_request(
        &self,
        tenant_id: TenantId,
        request: &RangeFeedRequest,
    ) -> Option<Pacer> {
        let queues = self.queues.as_ref()?;
        let header = &request.admission_header;
        Some(Pacer::new(
            self.settings.elastic_cpu_duration_per_rangefeed_scan_unit(),
            WorkInfo {
                tenant_id,
                priority: header.priority,
                create_time: header.create_time,
                bypass_admission: false,
            },
            queues.elastic_cpu_queue.clone(),
        ))
    }

    fn set_tenant_weight_provider(
        &self,
        provider: Arc<dyn TenantWeightProvider>,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let Some(queues) = self.queues.clone() else {
            tracing::debug!("Admission control not configured, tenant weight loop not started");
            return None;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(error = %e, "No tokio runtime, tenant weight loop not started");
                return None;
            }
        };

        let updater = TenantWeightUpdater::new(queues, self.settings.clone(), provider);
        Some(runtime.spawn(updater.run(WEIGHT_CALCULATION_PERIOD, shutdown)))
    }

    fn snapshot_ingested(&self, store_id: StoreId, stats: IngestOperationStats) {
        let Some(queue) = self
            .queues
            .as_ref()
            .and_then(|queues| queues.store_grant_coordinators.try_get_queue_for_store(store_id))
        else {
            return;
        };
        queue.stats_to_ignore(stats);
    }

    fn follower_store_write_bytes(&self, store_id: StoreId, bytes: FollowerStoreWriteBytes) {
        if !bytes.has_bytes() {
            return;
        }
        let Some(queue) = self
            .queues
            .as_ref()
            .and_then(|queues| queues.store_grant_coordinators.try_get_queue_for_store(store_id))
        else {
            return;
        };
        queue.bypassed_work_done(bytes.num_entries, bytes.store_work_done_info());
    }
}

fn unix_nanos_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use api_types::AdmissionHeader;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::mock::MockQueues;
    use crate::mock::MockTenantWeightProvider;
    use crate::weights::TenantWeights;

    const TENANT: TenantId = TenantId::new(7);
    const STORE: StoreId = StoreId::new(1);

    struct Fixture {
        mocks: MockQueues,
        settings: Arc<Settings>,
        controller: KvAdmissionController,
    }

    fn fixture() -> Fixture {
        let mocks = MockQueues::new();
        let settings = Arc::new(Settings::default());
        let controller =
            KvAdmissionController::new(Some(mocks.admission_queues()), settings.clone());
        Fixture {
            mocks,
            settings,
            controller,
        }
    }

    fn lenient_controller(mocks: &MockQueues) -> KvAdmissionController {
        KvAdmissionController::new(Some(mocks.admission_queues()), Arc::new(Settings::default()))
            .with_invariant_policy(InvariantPolicy::Log)
    }

    fn read_request(source: AdmissionSource) -> BatchRequest {
        BatchRequest {
            admission_header: AdmissionHeader {
                priority: WorkPriority::NORMAL_PRI,
                create_time: 0,
                source,
            },
            store_id: STORE,
            ..Default::default()
        }
    }

    fn write_request() -> BatchRequest {
        BatchRequest {
            is_write: true,
            ..read_request(AdmissionSource::FromSql)
        }
    }

    fn export_request() -> BatchRequest {
        BatchRequest {
            is_single_export_request: true,
            ..read_request(AdmissionSource::FromSql)
        }
    }

    async fn admitted_info(f: &Fixture, tenant_id: TenantId, request: &BatchRequest) -> WorkInfo {
        let handle = f
            .controller
            .admit_kv_work(&CancellationToken::new(), tenant_id, request)
            .await
            .unwrap();
        f.controller.admitted_kv_work_done(handle, None);
        *f.mocks.kv.admitted().last().unwrap()
    }

    #[test(tokio::test)]
    async fn without_queues_every_request_is_admitted_empty() {
        let controller = KvAdmissionController::new(None, Arc::new(Settings::default()));
        let handle = controller
            .admit_kv_work(&CancellationToken::new(), TENANT, &write_request())
            .await
            .unwrap();

        assert!(handle.is_empty());
        assert_eq!(handle.tenant_id(), TENANT);
        controller.admitted_kv_work_done(handle, None);
        assert!(controller
            .admit_rangefeed_request(TENANT, &RangeFeedRequest::default())
            .is_none());
    }

    #[test(tokio::test)]
    async fn system_admin_request_bypasses() {
        let f = fixture();
        let request = BatchRequest {
            is_admin: true,
            ..read_request(AdmissionSource::FromSql)
        };
        let info = admitted_info(&f, TenantId::SYSTEM, &request).await;
        assert!(info.bypass_admission);
        assert_eq!(info.create_time, 0);
    }

    #[test(tokio::test)]
    async fn non_system_tenant_never_bypasses() {
        let f = fixture();
        let request = BatchRequest {
            is_admin: true,
            ..read_request(AdmissionSource::Other)
        };
        let info = admitted_info(&f, TENANT, &request).await;
        assert!(!info.bypass_admission);
    }

    #[test(tokio::test)]
    async fn system_tenant_with_other_source_bypasses() {
        let f = fixture();
        let info = admitted_info(&f, TenantId::SYSTEM, &read_request(AdmissionSource::Other)).await;
        assert!(info.bypass_admission);

        let request = read_request(AdmissionSource::RootKv);
        let info = admitted_info(&f, TenantId::SYSTEM, &request).await;
        assert!(!info.bypass_admission);
    }

    #[test(tokio::test)]
    async fn bulk_only_admission_bypasses_normal_priority() {
        let f = fixture();
        f.settings.set_kv_bulk_only_admission_control_enabled(true);

        let info = admitted_info(&f, TENANT, &read_request(AdmissionSource::FromSql)).await;
        assert!(info.bypass_admission);

        let mut bulk = read_request(AdmissionSource::FromSql);
        bulk.admission_header.priority = WorkPriority::BULK_NORMAL_PRI;
        let info = admitted_info(&f, TENANT, &bulk).await;
        assert!(!info.bypass_admission);
    }

    #[test(tokio::test)]
    async fn zero_create_time_is_filled_in_unless_bypassed() {
        let f = fixture();
        let before = unix_nanos_now();

        let info = admitted_info(&f, TENANT, &read_request(AdmissionSource::FromSql)).await;
        assert!(info.create_time >= before);

        let mut stamped = read_request(AdmissionSource::FromSql);
        stamped.admission_header.create_time = 1234;
        let info = admitted_info(&f, TENANT, &stamped).await;
        assert_eq!(info.create_time, 1234);
    }

    #[test(tokio::test)]
    async fn write_goes_through_store_then_kv_queue() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);

        let handle = f
            .controller
            .admit_kv_work(&CancellationToken::new(), TENANT, &write_request())
            .await
            .unwrap();

        assert_eq!(handle.store_work_handle().map(|h| h.work_id()), Some(1));
        assert!(handle.must_report_kv_completion());
        assert!(handle.elastic_cpu_work().is_none());
        assert_eq!(store.admitted().len(), 1);
        assert_eq!(store.admitted()[0].work_info, f.mocks.kv.admitted()[0]);

        let mut wb = StoreWriteBytes::new();
        wb.write_bytes = 100;
        wb.ingested_bytes = 5;
        f.controller.admitted_kv_work_done(handle, Some(&wb));
        StoreWriteBytes::release(Some(wb));

        assert_eq!(
            store.done(),
            vec![(
                1,
                StoreWorkDoneInfo {
                    write_bytes: 100,
                    ingested_bytes: 5
                }
            )]
        );
        assert_eq!(f.mocks.kv.done(), vec![TENANT]);
    }

    #[test(tokio::test)]
    async fn heartbeats_and_unknown_stores_skip_store_queue() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);

        let heartbeat = BatchRequest {
            is_single_heartbeat_txn_request: true,
            ..write_request()
        };
        let other_store = BatchRequest {
            store_id: StoreId::new(2),
            ..write_request()
        };
        for request in [heartbeat, other_store] {
            let handle = f
                .controller
                .admit_kv_work(&CancellationToken::new(), TenantId::SYSTEM, &request)
                .await
                .unwrap();
            assert!(handle.store_work_handle().is_none());
            f.controller.admitted_kv_work_done(handle, None);
        }

        assert!(store.admitted().is_empty());
        assert!(store.done().is_empty());
        assert_eq!(f.mocks.kv.admitted().len(), 2);
    }

    #[test(tokio::test)]
    async fn bypassed_write_is_admitted_by_store_without_charge() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);
        let admin = BatchRequest {
            is_admin: true,
            ..write_request()
        };
        let internal = BatchRequest {
            is_write: true,
            ..read_request(AdmissionSource::Other)
        };

        for request in [admin, internal] {
            let handle = f
                .controller
                .admit_kv_work(&CancellationToken::new(), TenantId::SYSTEM, &request)
                .await
                .unwrap();
            assert!(handle.store_work_handle().is_none());
            assert!(handle.is_empty());
            f.controller.admitted_kv_work_done(handle, None);
        }

        let admitted = store.admitted();
        assert_eq!(admitted.len(), 2);
        assert!(admitted.iter().all(|info| info.work_info.bypass_admission));
        assert!(store.done().is_empty());
        assert!(f.mocks.kv.admitted().is_empty());
    }

    #[test(tokio::test)]
    async fn exempt_store_admission_skips_remaining_queues() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);
        store.set_admission_enabled(false);

        let handle = f
            .controller
            .admit_kv_work(&CancellationToken::new(), TENANT, &write_request())
            .await
            .unwrap();

        assert!(handle.is_empty());
        assert!(f.mocks.kv.admitted().is_empty());
        f.controller.admitted_kv_work_done(handle, None);
        assert!(store.done().is_empty());
        assert!(f.mocks.kv.done().is_empty());
    }

    #[test(tokio::test)]
    async fn export_uses_elastic_cpu_queue() {
        let f = fixture();
        f.settings
            .set_elastic_cpu_duration_per_export_request(Duration::from_millis(50))
            .unwrap();

        let handle = f
            .controller
            .admit_kv_work(&CancellationToken::new(), TENANT, &export_request())
            .await
            .unwrap();

        let work = handle.elastic_cpu_work().unwrap();
        assert_eq!(work.allotted(), Duration::from_millis(50));
        assert!(!handle.must_report_kv_completion());
        assert!(f.mocks.kv.admitted().is_empty());

        f.controller.admitted_kv_work_done(handle, None);
        assert_eq!(f.mocks.elastic_cpu.released(), vec![1]);
        assert!(f.mocks.kv.done().is_empty());
    }

    #[test(tokio::test)]
    async fn store_rejection_acquires_nothing() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);
        store.set_reject(true);

        let err = f
            .controller
            .admit_kv_work(&CancellationToken::new(), TENANT, &write_request())
            .await
            .unwrap_err();

        assert!(matches!(err.current_context(), AdmissionError::Rejected { .. }));
        assert!(f.mocks.kv.admitted().is_empty());
        assert!(store.done().is_empty());
    }

    #[test(tokio::test)]
    async fn kv_rejection_rolls_back_store_token() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);
        f.mocks.kv.set_reject(true);

        let err = f
            .controller
            .admit_kv_work(&CancellationToken::new(), TENANT, &write_request())
            .await
            .unwrap_err();

        assert!(matches!(err.current_context(), AdmissionError::Rejected { .. }));
        assert_eq!(store.done(), vec![(1, StoreWorkDoneInfo::default())]);
    }

    #[test(tokio::test)]
    async fn elastic_rejection_rolls_back_store_token() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);
        f.mocks.elastic_cpu.set_reject(true);
        let request = BatchRequest {
            is_write: true,
            ..export_request()
        };

        let err = f
            .controller
            .admit_kv_work(&CancellationToken::new(), TENANT, &request)
            .await
            .unwrap_err();

        assert!(matches!(err.current_context(), AdmissionError::Rejected { .. }));
        assert_eq!(store.done(), vec![(1, StoreWorkDoneInfo::default())]);
        assert_eq!(f.mocks.elastic_cpu.released_count(), 0);
    }

    #[test(tokio::test)]
    async fn cancellation_while_queued_rolls_back_store_token() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);
        f.mocks.kv.set_block_until_cancelled(true);
        let request = write_request();
        let cancel = CancellationToken::new();

        let (result, ()) = tokio::join!(
            f.controller.admit_kv_work(&cancel, TENANT, &request),
            async {
                tokio::task::yield_now().await;
                cancel.cancel();
            }
        );

        let err = result.unwrap_err();
        assert!(matches!(err.current_context(), AdmissionError::Cancelled));
        assert_eq!(store.done(), vec![(1, StoreWorkDoneInfo::default())]);
    }

    #[test(tokio::test(start_paused = true))]
    async fn dropped_admission_future_rolls_back_store_token() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);
        f.mocks.kv.set_block_until_cancelled(true);

        let request = write_request();
        let cancel = CancellationToken::new();
        let timed_out = tokio::time::timeout(
            Duration::from_millis(10),
            f.controller.admit_kv_work(&cancel, TENANT, &request),
        )
        .await;

        assert!(timed_out.is_err());
        assert_eq!(store.done(), vec![(1, StoreWorkDoneInfo::default())]);
    }

    #[test(tokio::test)]
    async fn completion_touches_only_what_was_acquired() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);

        // Nothing to report.
        f.mocks.kv.set_must_report_completion(false);
        let request = read_request(AdmissionSource::FromSql);
        let handle = f
            .controller
            .admit_kv_work(&CancellationToken::new(), TENANT, &request)
            .await
            .unwrap();
        assert!(handle.is_empty());
        f.controller.admitted_kv_work_done(handle, None);
        assert!(f.mocks.kv.done().is_empty());

        // Store and elastic CPU tokens.
        let request = BatchRequest {
            is_write: true,
            ..export_request()
        };
        let handle = f
            .controller
            .admit_kv_work(&CancellationToken::new(), TENANT, &request)
            .await
            .unwrap();
        f.controller.admitted_kv_work_done(handle, None);

        assert_eq!(store.done(), vec![(1, StoreWorkDoneInfo::default())]);
        assert_eq!(f.mocks.elastic_cpu.released(), vec![1]);
        assert!(f.mocks.kv.done().is_empty());
    }

    #[test(tokio::test)]
    #[should_panic(expected = "invariant violated")]
    async fn store_completion_failure_is_fatal_in_strict_mode() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);
        store.set_fail_work_done(true);

        let handle = f
            .controller
            .admit_kv_work(&CancellationToken::new(), TENANT, &write_request())
            .await
            .unwrap();
        f.controller.admitted_kv_work_done(handle, None);
    }

    #[test(tokio::test)]
    async fn store_completion_failure_is_logged_in_lenient_mode() {
        let mocks = MockQueues::new();
        let store = mocks.stores.add_store(STORE);
        store.set_fail_work_done(true);
        let controller = lenient_controller(&mocks);

        for _ in 0..3 {
            let handle = controller
                .admit_kv_work(&CancellationToken::new(), TENANT, &write_request())
                .await
                .unwrap();
            controller.admitted_kv_work_done(handle, None);
        }
        assert_eq!(mocks.kv.done().len(), 3);
        // Only the first violation within the interval is logged.
        assert_eq!(controller.invariants.violations(), 3);
        assert_eq!(controller.invariants.logged(), 1);
    }

    #[test]
    fn lenient_reporter_rate_limits_logging() {
        let reporter = InvariantReporter::new(InvariantPolicy::Log);
        let logged: Vec<bool> = (0..3)
            .map(|_| {
                let report = Report::new(AdmissionError::invariant_violation("double release"));
                reporter.report(TENANT, report)
            })
            .collect();
        assert_eq!(logged, vec![true, false, false]);
        assert_eq!(reporter.violations(), 3);
    }

    #[test(tokio::test)]
    #[should_panic(expected = "invariant violated")]
    async fn store_rollback_failure_is_fatal_in_strict_mode() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);
        store.set_fail_work_done(true);
        f.mocks.kv.set_reject(true);

        let _ = f
            .controller
            .admit_kv_work(&CancellationToken::new(), TENANT, &write_request())
            .await;
    }

    #[test(tokio::test)]
    async fn store_rollback_failure_is_logged_in_lenient_mode() {
        let mocks = MockQueues::new();
        let store = mocks.stores.add_store(STORE);
        store.set_fail_work_done(true);
        mocks.kv.set_reject(true);
        let controller = lenient_controller(&mocks);

        let err = controller
            .admit_kv_work(&CancellationToken::new(), TENANT, &write_request())
            .await
            .unwrap_err();

        assert!(matches!(err.current_context(), AdmissionError::Rejected { .. }));
        assert!(store.done().is_empty());
        assert_eq!(controller.invariants.violations(), 1);
    }

    #[test(tokio::test)]
    async fn rangefeed_pacer_uses_scan_unit_and_request_header() {
        let f = fixture();
        f.settings
            .set_elastic_cpu_duration_per_rangefeed_scan_unit(Duration::from_millis(20))
            .unwrap();
        let request = RangeFeedRequest {
            admission_header: AdmissionHeader {
                priority: WorkPriority::BULK_NORMAL_PRI,
                create_time: 99,
                source: AdmissionSource::Other,
            },
        };

        let mut pacer = f
            .controller
            .admit_rangefeed_request(TenantId::SYSTEM, &request)
            .unwrap();
        assert_eq!(pacer.unit(), Duration::from_millis(20));
        assert_eq!(
            *pacer.work_info(),
            WorkInfo {
                tenant_id: TenantId::SYSTEM,
                priority: WorkPriority::BULK_NORMAL_PRI,
                create_time: 99,
                bypass_admission: false,
            }
        );

        pacer.pace(&CancellationToken::new()).await.unwrap();
        pacer.close();
        assert_eq!(f.mocks.elastic_cpu.released(), vec![1]);
    }

    #[test]
    fn snapshot_ingestion_is_forwarded_to_store() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);
        let stats = IngestOperationStats {
            bytes: 1 << 20,
            approx_ingested_into_l0_bytes: 4096,
        };

        f.controller.snapshot_ingested(STORE, stats);
        f.controller.snapshot_ingested(StoreId::new(3), stats);

        assert_eq!(store.ignored(), vec![stats]);
    }

    #[test]
    fn follower_writes_are_reported_as_bypassed() {
        let f = fixture();
        let store = f.mocks.stores.add_store(STORE);

        f.controller.follower_store_write_bytes(
            STORE,
            FollowerStoreWriteBytes {
                num_entries: 4,
                write_bytes: 0,
                ingested_bytes: 0,
            },
        );
        assert!(store.bypassed().is_empty());

        f.controller.follower_store_write_bytes(
            STORE,
            FollowerStoreWriteBytes {
                num_entries: 4,
                write_bytes: 300,
                ingested_bytes: 0,
            },
        );
        f.controller.follower_store_write_bytes(
            StoreId::new(5),
            FollowerStoreWriteBytes {
                num_entries: 1,
                write_bytes: 1,
                ingested_bytes: 1,
            },
        );

        assert_eq!(
            store.bypassed(),
            vec![(
                4,
                StoreWorkDoneInfo {
                    write_bytes: 300,
                    ingested_bytes: 0
                }
            )]
        );
    }

    #[test(tokio::test(start_paused = true))]
    async fn weight_loop_runs_until_shutdown() {
        let f = fixture();
        f.settings.set_kv_tenant_weights_enabled(true);
        let provider = Arc::new(MockTenantWeightProvider::new(TenantWeights::default()));
        let shutdown = CancellationToken::new();

        let task = f
            .controller
            .set_tenant_weight_provider(provider.clone(), shutdown.clone())
            .unwrap();
        tokio::time::sleep(WEIGHT_CALCULATION_PERIOD * 2 + Duration::from_secs(1)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(provider.calls(), 2);
        assert_eq!(f.mocks.kv.weights().len(), 2);
    }

    #[test]
    fn weight_loop_needs_queues() {
        let controller = KvAdmissionController::new(None, Arc::new(Settings::default()));
        let provider = Arc::new(MockTenantWeightProvider::default());
        assert!(controller
            .set_tenant_weight_provider(provider, CancellationToken::new())
            .is_none());
    }
}
