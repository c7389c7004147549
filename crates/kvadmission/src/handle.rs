//! Per-request admission receipts.

use std::fmt;
use std::sync::Arc;

use api_types::TenantId;

use crate::controller::InvariantReporter;
use crate::queue::ElasticCpuWorkHandle;
use crate::queue::ElasticCpuWorkQueue;
use crate::queue::StoreWorkDoneInfo;
use crate::queue::StoreWorkHandle;
use crate::queue::StoreWorkQueue;

/// A store write queue together with the token it handed out.
pub(crate) struct StoreWork {
    pub(crate) queue: Arc<dyn StoreWorkQueue>,
    pub(crate) handle: StoreWorkHandle,
}

impl fmt::Debug for StoreWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreWork")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Groups everything a request acquired during admission: references to the
/// queues that charged it, the state needed to tell them what work was done,
/// and the CPU allotment it may use (for cooperative scheduling with the
/// elastic CPU queue).
///
/// A handle with nothing in it is valid and means admission did not apply.
/// Pass it to `admitted_kv_work_done` exactly once after the work finishes.
#[must_use = "admitted work must be reported through admitted_kv_work_done"]
#[derive(Debug)]
pub struct Handle {
    pub(crate) tenant_id: TenantId,
    pub(crate) store_work: Option<StoreWork>,
    pub(crate) elastic_cpu_work: Option<ElasticCpuWorkHandle>,
    pub(crate) call_admitted_work_done_on_kv_queue: bool,
}

impl Handle {
    pub(crate) fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            store_work: None,
            elastic_cpu_work: None,
            call_admitted_work_done_on_kv_queue: false,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn store_work_handle(&self) -> Option<&StoreWorkHandle> {
        self.store_work.as_ref().map(|work| &work.handle)
    }

    /// CPU allotment granted to export requests. Long-running exports check
    /// [`ElasticCpuWorkHandle::over_limit`] and return early once it is used up.
    pub fn elastic_cpu_work(&self) -> Option<&ElasticCpuWorkHandle> {
        self.elastic_cpu_work.as_ref()
    }

    pub fn must_report_kv_completion(&self) -> bool {
        self.call_admitted_work_done_on_kv_queue
    }

    pub fn is_empty(&self) -> bool {
        self.store_work.is_none()
            && self.elastic_cpu_work.is_none()
            && !self.call_admitted_work_done_on_kv_queue
    }
}

/// A [`Handle`] being filled in by a single admission attempt.
///
/// Unless committed, whatever it holds is released with a "no work done"
/// outcome when it goes out of scope. That covers an admission error after an
/// earlier acquisition as well as the admitting future being dropped while
/// suspended in a later queue.
pub(crate) struct PendingHandle<'a> {
    handle: Handle,
    elastic_cpu_queue: &'a dyn ElasticCpuWorkQueue,
    invariants: &'a InvariantReporter,
    committed: bool,
}

impl<'a> PendingHandle<'a> {
    pub(crate) fn new(
        tenant_id: TenantId,
        elastic_cpu_queue: &'a dyn ElasticCpuWorkQueue,
        invariants: &'a InvariantReporter,
    ) -> Self {
        Self {
            handle: Handle::new(tenant_id),
            elastic_cpu_queue,
            invariants,
            committed: false,
        }
    }

    pub(crate) fn set_store_work(&mut self, store_work: StoreWork) {
        self.handle.store_work = Some(store_work);
    }

    pub(crate) fn set_elastic_cpu_work(&mut self, work: ElasticCpuWorkHandle) {
        self.handle.elastic_cpu_work = Some(work);
    }

    pub(crate) fn set_call_admitted_work_done_on_kv_queue(&mut self, call: bool) {
        self.handle.call_admitted_work_done_on_kv_queue = call;
    }

    pub(crate) fn commit(mut self) -> Handle {
        self.committed = true;
        let tenant_id = self.handle.tenant_id;
        std::mem::replace(&mut self.handle, Handle::new(tenant_id))
    }
}

impl Drop for PendingHandle<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let tenant_id = self.handle.tenant_id;

        if let Some(work) = self.handle.elastic_cpu_work.take() {
            tracing::debug!(
                tenant_id = %tenant_id,
                work_id = work.work_id(),
                "Rolling back elastic CPU admission"
            );
            self.elastic_cpu_queue.admitted_work_done(Some(work));
        }

        if let Some(StoreWork { queue, handle }) = self.handle.store_work.take() {
            tracing::debug!(
                tenant_id = %tenant_id,
                work_id = handle.work_id(),
                "Rolling back store admission"
            );
            // No bytes were written.
            if let Err(report) = queue.admitted_work_done(handle, StoreWorkDoneInfo::default()) {
                if std::thread::panicking() {
                    tracing::error!(
                        tenant_id = %tenant_id,
                        error = ?report,
                        "Failed to roll back store admission while unwinding"
                    );
                } else {
                    self.invariants.report(tenant_id, report);
                }
            }
        }
    }
}
