//! Admission control integration for the KV layer.
//!
//! This crate sits between the KV server and the node's admission queues:
//! - [`KvAdmissionController`]: classifies batch requests and routes them
//!   through the per-store write queue, the elastic CPU queue and the general
//!   KV queue, returning a [`Handle`] that releases everything on completion
//! - [`Pacer`]: cooperative CPU pacing for rangefeed catch-up scans
//! - [`Settings`]: live cluster settings, loadable from YAML
//!
//! The queues themselves are external and reached through the traits in
//! [`queue`]; [`mock`] provides recording implementations for tests.

use error_stack::Report;

mod accounting;
mod controller;
mod error;
mod handle;
mod log_limiter;
pub mod mock;
mod pacer;
pub mod queue;
mod settings;
mod weights;

/// Result type using error-stack for context-rich error reporting
pub type Result<T, C> = core::result::Result<T, Report<C>>;

pub use accounting::{FollowerStoreWriteBytes, StoreWriteBytes};
pub use api_types::{
    AdmissionHeader, AdmissionSource, BatchRequest, RangeFeedRequest, StoreId, TenantId,
    WorkPriority,
};
pub use controller::{AdmissionQueues, Controller, InvariantPolicy, KvAdmissionController};
pub use error::AdmissionError;
pub use handle::Handle;
pub use pacer::Pacer;
pub use settings::{
    Settings, SettingsConfig, MAX_ELASTIC_CPU_DURATION, MIN_ELASTIC_CPU_DURATION,
};
pub use weights::{
    TenantWeightProvider, TenantWeights, TenantWeightsForStore, WEIGHT_CALCULATION_PERIOD,
};
