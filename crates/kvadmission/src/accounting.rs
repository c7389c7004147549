//! Byte and entry counters describing completed store work.

use std::sync::Mutex;
use std::sync::PoisonError;

use once_cell::sync::Lazy;

use crate::queue::StoreWorkDoneInfo;

/// Upper bound on idle instances kept around for reuse.
const MAX_POOLED_STORE_WRITE_BYTES: usize = 1024;

static STORE_WRITE_BYTES_POOL: Lazy<Mutex<Vec<Box<StoreWriteBytes>>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Writes applied to a store by a replica that is not the leaseholder.
///
/// These never went through admission but still consume the store's write
/// capacity, so they are reported to the store queue after the fact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FollowerStoreWriteBytes {
    pub num_entries: i64,
    pub write_bytes: i64,
    pub ingested_bytes: i64,
}

impl FollowerStoreWriteBytes {
    /// Accumulate `from` into `self`. Order of merging does not matter.
    pub fn merge(&mut self, from: FollowerStoreWriteBytes) {
        self.num_entries += from.num_entries;
        self.write_bytes += from.write_bytes;
        self.ingested_bytes += from.ingested_bytes;
    }

    /// Whether any bytes were written or ingested.
    pub fn has_bytes(&self) -> bool {
        self.write_bytes != 0 || self.ingested_bytes != 0
    }

    pub fn store_work_done_info(&self) -> StoreWorkDoneInfo {
        StoreWorkDoneInfo {
            write_bytes: self.write_bytes,
            ingested_bytes: self.ingested_bytes,
        }
    }
}

/// Bytes written by a single admitted request, reported when it completes.
///
/// Instances live on the request hot path and are recycled through a pool:
/// obtain one with [`StoreWriteBytes::new`] and hand it back with
/// [`StoreWriteBytes::release`]. Release takes ownership, so a released
/// instance cannot be read or written again.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StoreWriteBytes {
    pub write_bytes: i64,
    pub ingested_bytes: i64,
}

impl StoreWriteBytes {
    /// Take a zeroed instance from the pool, allocating if it is empty.
    pub fn new() -> Box<Self> {
        let pooled = STORE_WRITE_BYTES_POOL
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match pooled {
            Some(mut wb) => {
                *wb = Self::default();
                wb
            }
            None => Box::default(),
        }
    }

    /// Return an instance to the pool. `None` is a no-op.
    pub fn release(wb: Option<Box<Self>>) {
        let Some(wb) = wb else {
            return;
        };
        let mut pool = STORE_WRITE_BYTES_POOL
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pool.len() < MAX_POOLED_STORE_WRITE_BYTES {
            pool.push(wb);
        }
    }
}

impl From<&StoreWriteBytes> for StoreWorkDoneInfo {
    fn from(wb: &StoreWriteBytes) -> Self {
        StoreWorkDoneInfo {
            write_bytes: wb.write_bytes,
            ingested_bytes: wb.ingested_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn bytes(num_entries: i64, write_bytes: i64, ingested_bytes: i64) -> FollowerStoreWriteBytes {
        FollowerStoreWriteBytes {
            num_entries,
            write_bytes,
            ingested_bytes,
        }
    }

    fn merged(
        mut a: FollowerStoreWriteBytes,
        b: FollowerStoreWriteBytes,
    ) -> FollowerStoreWriteBytes {
        a.merge(b);
        a
    }

    #[test]
    fn merge_accumulates_every_field() {
        let mut acc = bytes(1, 100, 0);
        acc.merge(bytes(2, 50, 4096));
        assert_eq!(acc, bytes(3, 150, 4096));
    }

    #[test]
    fn merge_is_associative_and_commutative() {
        let samples = [
            bytes(0, 0, 0),
            bytes(1, 512, 0),
            bytes(3, 0, 1 << 20),
            bytes(7, 12_345, 678),
        ];
        for &a in &samples {
            for &b in &samples {
                assert_eq!(merged(a, b), merged(b, a));
                for &c in &samples {
                    assert_eq!(merged(merged(a, b), c), merged(a, merged(b, c)));
                }
            }
        }
    }

    #[test]
    fn has_bytes_ignores_entry_count() {
        assert!(!bytes(5, 0, 0).has_bytes());
        assert!(bytes(0, 1, 0).has_bytes());
        assert!(bytes(0, 0, 1).has_bytes());
    }

    #[test]
    fn pooled_instances_come_back_zeroed() {
        let mut wb = StoreWriteBytes::new();
        wb.write_bytes = 10;
        wb.ingested_bytes = 20;
        StoreWriteBytes::release(Some(wb));

        for _ in 0..4 {
            let wb = StoreWriteBytes::new();
            assert_eq!(*wb, StoreWriteBytes::default());
            StoreWriteBytes::release(Some(wb));
        }
    }

    #[test]
    fn release_none_is_noop() {
        StoreWriteBytes::release(None);
    }

    #[test]
    fn converts_to_done_info() {
        let mut wb = StoreWriteBytes::new();
        wb.write_bytes = 7;
        let info = StoreWorkDoneInfo::from(&*wb);
        assert_eq!(
            info,
            StoreWorkDoneInfo {
                write_bytes: 7,
                ingested_bytes: 0
            }
        );
        StoreWriteBytes::release(Some(wb));
    }
}
