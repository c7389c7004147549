//! Shared request type definitions
//!
//! This crate contains the request vocabulary shared between the KV request path
//! and admission control: tenant and store identifiers, work priorities, and the
//! admission-relevant summaries of batch and rangefeed requests.

use serde::Deserialize;
use serde::Serialize;

/// Identifier of a tenant sharing the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(u64);

impl TenantId {
    /// The system tenant, owner of all KV-internal work.
    pub const SYSTEM: TenantId = TenantId(1);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn to_u64(self) -> u64 {
        self.0
    }

    pub const fn is_system(self) -> bool {
        self.0 == Self::SYSTEM.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_system() {
            write!(f, "system")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identifier of a store (one unit of physical storage on a node).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(i32);

impl StoreId {
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Priority of a unit of work. Higher values are admitted first.
///
/// Arbitrary values are allowed on the wire; the named constants are the ones
/// the system assigns itself.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkPriority(i8);

impl WorkPriority {
    pub const LOW_PRI: WorkPriority = WorkPriority(i8::MIN);
    pub const TTL_LOW_PRI: WorkPriority = WorkPriority(-100);
    pub const USER_LOW_PRI: WorkPriority = WorkPriority(-50);
    pub const BULK_NORMAL_PRI: WorkPriority = WorkPriority(-30);
    pub const NORMAL_PRI: WorkPriority = WorkPriority(0);
    pub const USER_HIGH_PRI: WorkPriority = WorkPriority(50);
    pub const LOCKING_PRI: WorkPriority = WorkPriority(100);
    pub const HIGH_PRI: WorkPriority = WorkPriority(i8::MAX);

    pub const fn new(priority: i8) -> Self {
        Self(priority)
    }

    pub const fn get(self) -> i8 {
        self.0
    }
}

impl std::fmt::Display for WorkPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::LOW_PRI => "low-pri",
            Self::TTL_LOW_PRI => "ttl-low-pri",
            Self::USER_LOW_PRI => "user-low-pri",
            Self::BULK_NORMAL_PRI => "bulk-normal-pri",
            Self::NORMAL_PRI => "normal-pri",
            Self::USER_HIGH_PRI => "user-high-pri",
            Self::LOCKING_PRI => "locking-pri",
            Self::HIGH_PRI => "high-pri",
            Self(other) => return write!(f, "{other}"),
        };
        f.write_str(name)
    }
}

/// Where a request originated, as declared by its sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionSource {
    /// Unclassified. Such requests are never subject to admission control.
    #[default]
    Other,
    /// Issued by a SQL node on behalf of a tenant.
    FromSql,
    /// Issued by KV itself (the root of a distributed operation).
    RootKv,
}

/// Admission-related fields carried on every request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionHeader {
    pub priority: WorkPriority,
    /// Unix nanoseconds; zero means unset.
    pub create_time: i64,
    pub source: AdmissionSource,
}

/// The parts of a KV batch request that admission control reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchRequest {
    pub admission_header: AdmissionHeader,
    /// Store the batch is addressed to.
    pub store_id: StoreId,
    /// Administrative requests (splits, merges, lease transfers...).
    pub is_admin: bool,
    /// Whether the batch contains any write.
    pub is_write: bool,
    /// The batch consists of exactly one transaction heartbeat.
    pub is_single_heartbeat_txn_request: bool,
    /// The batch consists of exactly one export (backup) request.
    pub is_single_export_request: bool,
}

/// The parts of a rangefeed request that admission control reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RangeFeedRequest {
    pub admission_header: AdmissionHeader,
}
