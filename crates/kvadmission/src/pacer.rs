//! Cooperative CPU pacing for tight, non-preemptible loops.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::queue::ElasticCpuWorkHandle;
use crate::queue::ElasticCpuWorkQueue;
use crate::queue::WorkInfo;
use crate::AdmissionError;
use crate::Result;

/// Paces CPU-bound elastic work (rangefeed catch-up scans and the like).
///
/// Callers invoke [`Pacer::pace`] on every loop iteration and [`Pacer::close`]
/// once done. Internally the pacer holds at most one CPU allotment from the
/// elastic CPU queue; once it is used up the allotment is returned and a new
/// one requested, waiting if none is available. The loop is never preempted,
/// only delayed before its next iteration.
///
/// Dropping a pacer closes it.
pub struct Pacer {
    unit: Duration,
    work_info: WorkInfo,
    queue: Arc<dyn ElasticCpuWorkQueue>,
    current: Option<ElasticCpuWorkHandle>,
}

impl Pacer {
    pub(crate) fn new(
        unit: Duration,
        work_info: WorkInfo,
        queue: Arc<dyn ElasticCpuWorkQueue>,
    ) -> Self {
        Self {
            unit,
            work_info,
            queue,
            current: None,
        }
    }

    /// CPU time requested per allotment.
    pub fn unit(&self) -> Duration {
        self.unit
    }

    pub fn work_info(&self) -> &WorkInfo {
        &self.work_info
    }

    /// Whether an allotment is currently held.
    pub fn is_holding(&self) -> bool {
        self.current.is_some()
    }

    /// Make sure the caller holds CPU budget for its next iteration.
    ///
    /// # Errors
    ///
    /// Returns the queue's error (typically [`AdmissionError::Cancelled`]) if no
    /// budget could be obtained; the caller must abandon its loop.
    pub async fn pace(&mut self, cancel: &CancellationToken) -> Result<(), AdmissionError> {
        if self
            .current
            .as_ref()
            .is_some_and(ElasticCpuWorkHandle::over_limit)
        {
            self.queue.admitted_work_done(self.current.take());
        }

        if self.current.is_none() {
            let handle = self.queue.admit(cancel, self.unit, self.work_info).await?;
            self.current = Some(handle);
        }
        Ok(())
    }

    /// Return any outstanding allotment. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(handle) = self.current.take() {
            self.queue.admitted_work_done(Some(handle));
        }
    }

    /// [`Pacer::pace`] for call chains where pacing is optional; `None` is a no-op.
    pub async fn pace_optional(
        pacer: Option<&mut Pacer>,
        cancel: &CancellationToken,
    ) -> Result<(), AdmissionError> {
        match pacer {
            Some(pacer) => pacer.pace(cancel).await,
            None => Ok(()),
        }
    }

    /// [`Pacer::close`] for call chains where pacing is optional; `None` is a no-op.
    pub fn close_optional(pacer: Option<&mut Pacer>) {
        if let Some(pacer) = pacer {
            pacer.close();
        }
    }
}

impl std::fmt::Debug for Pacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pacer")
            .field("unit", &self.unit)
            .field("work_info", &self.work_info)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl Drop for Pacer {
    fn drop(&mut self) {
        self.close();
    }
}
