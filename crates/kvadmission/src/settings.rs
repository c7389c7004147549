//! Cluster settings consulted by the admission controller.
//!
//! Values are live: the host may change them at any time and the controller
//! reads the current value on every request and every weight-loop tick.
//! Durations are validated when set, so the request path never sees an
//! out-of-bounds value.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use error_stack::report;
use serde::Deserialize;
use serde::Deserializer;

use crate::AdmissionError;
use crate::Result;

/// Smallest CPU allotment the elastic CPU queue hands out per request.
pub const MIN_ELASTIC_CPU_DURATION: Duration = Duration::from_millis(10);
/// Largest CPU allotment the elastic CPU queue hands out per request.
pub const MAX_ELASTIC_CPU_DURATION: Duration = Duration::from_millis(100);

/// Declarative form of [`Settings`], loadable from YAML.
///
/// Durations accept either a number of milliseconds or a string with a unit
/// suffix (`"250us"`, `"50ms"`, `"1s 500ms"`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsConfig {
    /// CPU tokens allotted to each export request.
    #[serde(deserialize_with = "deserialize_duration")]
    pub elastic_cpu_duration_per_export_request: Duration,
    /// CPU tokens allotted to each unit of work in a rangefeed catch-up scan.
    #[serde(deserialize_with = "deserialize_duration")]
    pub elastic_cpu_duration_per_rangefeed_scan_unit: Duration,
    /// Only subject bulk (below normal priority) work to KV admission control.
    pub kv_bulk_only_admission_control_enabled: bool,
    /// Push node-level tenant weights into the KV and elastic CPU queues.
    pub kv_tenant_weights_enabled: bool,
    /// Push per-store tenant weights into the store write queues.
    pub kv_stores_tenant_weights_enabled: bool,
    /// Provisioned bandwidth per store in bytes/s; zero means unset.
    pub store_provisioned_bandwidth: u64,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            elastic_cpu_duration_per_export_request: MAX_ELASTIC_CPU_DURATION,
            elastic_cpu_duration_per_rangefeed_scan_unit: MAX_ELASTIC_CPU_DURATION,
            kv_bulk_only_admission_control_enabled: false,
            kv_tenant_weights_enabled: false,
            kv_stores_tenant_weights_enabled: false,
            store_provisioned_bandwidth: 0,
        }
    }
}

impl SettingsConfig {
    /// Check every value against its bounds.
    pub fn validate(&self) -> Result<(), AdmissionError> {
        check_elastic_cpu_duration(
            " per export request",
            self.elastic_cpu_duration_per_export_request,
        )?;
        check_elastic_cpu_duration("", self.elastic_cpu_duration_per_rangefeed_scan_unit)?;
        Ok(())
    }
}

/// Live settings shared between the controller and the host.
#[derive(Debug)]
pub struct Settings {
    elastic_cpu_duration_per_export_request: AtomicU64,
    elastic_cpu_duration_per_rangefeed_scan_unit: AtomicU64,
    kv_bulk_only_admission_control_enabled: AtomicBool,
    kv_tenant_weights_enabled: AtomicBool,
    kv_stores_tenant_weights_enabled: AtomicBool,
    store_provisioned_bandwidth: AtomicU64,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_valid_config(&SettingsConfig::default())
    }
}

impl Settings {
    pub fn from_config(config: &SettingsConfig) -> Result<Self, AdmissionError> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, AdmissionError> {
        let config: SettingsConfig = serde_yaml::from_str(yaml).map_err(|e| {
            report!(AdmissionError::invalid_config(format!(
                "failed to parse admission settings: {e}"
            )))
        })?;
        Self::from_config(&config)
    }

    fn from_valid_config(config: &SettingsConfig) -> Self {
        Self {
            elastic_cpu_duration_per_export_request: AtomicU64::new(duration_to_nanos(
                config.elastic_cpu_duration_per_export_request,
            )),
            elastic_cpu_duration_per_rangefeed_scan_unit: AtomicU64::new(duration_to_nanos(
                config.elastic_cpu_duration_per_rangefeed_scan_unit,
            )),
            kv_bulk_only_admission_control_enabled: AtomicBool::new(
                config.kv_bulk_only_admission_control_enabled,
            ),
            kv_tenant_weights_enabled: AtomicBool::new(config.kv_tenant_weights_enabled),
            kv_stores_tenant_weights_enabled: AtomicBool::new(
                config.kv_stores_tenant_weights_enabled,
            ),
            store_provisioned_bandwidth: AtomicU64::new(config.store_provisioned_bandwidth),
        }
    }

    /// Replace every value. Nothing is changed unless the whole config is valid.
    pub fn apply(&self, config: &SettingsConfig) -> Result<(), AdmissionError> {
        config.validate()?;
        self.elastic_cpu_duration_per_export_request.store(
            duration_to_nanos(config.elastic_cpu_duration_per_export_request),
            Ordering::Relaxed,
        );
        self.elastic_cpu_duration_per_rangefeed_scan_unit.store(
            duration_to_nanos(config.elastic_cpu_duration_per_rangefeed_scan_unit),
            Ordering::Relaxed,
        );
        self.set_kv_bulk_only_admission_control_enabled(
            config.kv_bulk_only_admission_control_enabled,
        );
        self.set_kv_tenant_weights_enabled(config.kv_tenant_weights_enabled);
        self.set_kv_stores_tenant_weights_enabled(config.kv_stores_tenant_weights_enabled);
        self.set_store_provisioned_bandwidth(config.store_provisioned_bandwidth);
        tracing::info!(?config, "Applied admission settings");
        Ok(())
    }

    pub fn elastic_cpu_duration_per_export_request(&self) -> Duration {
        Duration::from_nanos(
            self.elastic_cpu_duration_per_export_request
                .load(Ordering::Relaxed),
        )
    }

    pub fn set_elastic_cpu_duration_per_export_request(
        &self,
        duration: Duration,
    ) -> Result<(), AdmissionError> {
        check_elastic_cpu_duration(" per export request", duration)?;
        self.elastic_cpu_duration_per_export_request
            .store(duration_to_nanos(duration), Ordering::Relaxed);
        Ok(())
    }

    pub fn elastic_cpu_duration_per_rangefeed_scan_unit(&self) -> Duration {
        Duration::from_nanos(
            self.elastic_cpu_duration_per_rangefeed_scan_unit
                .load(Ordering::Relaxed),
        )
    }

    pub fn set_elastic_cpu_duration_per_rangefeed_scan_unit(
        &self,
        duration: Duration,
    ) -> Result<(), AdmissionError> {
        check_elastic_cpu_duration("", duration)?;
        self.elastic_cpu_duration_per_rangefeed_scan_unit
            .store(duration_to_nanos(duration), Ordering::Relaxed);
        Ok(())
    }

    pub fn kv_bulk_only_admission_control_enabled(&self) -> bool {
        self.kv_bulk_only_admission_control_enabled
            .load(Ordering::Relaxed)
    }

    pub fn set_kv_bulk_only_admission_control_enabled(&self, enabled: bool) {
        self.kv_bulk_only_admission_control_enabled
            .store(enabled, Ordering::Relaxed);
    }

    pub fn kv_tenant_weights_enabled(&self) -> bool {
        self.kv_tenant_weights_enabled.load(Ordering::Relaxed)
    }

    pub fn set_kv_tenant_weights_enabled(&self, enabled: bool) {
        self.kv_tenant_weights_enabled
            .store(enabled, Ordering::Relaxed);
    }

    pub fn kv_stores_tenant_weights_enabled(&self) -> bool {
        self.kv_stores_tenant_weights_enabled
            .load(Ordering::Relaxed)
    }

    pub fn set_kv_stores_tenant_weights_enabled(&self, enabled: bool) {
        self.kv_stores_tenant_weights_enabled
            .store(enabled, Ordering::Relaxed);
    }

    /// Informational only; consumed by the store write queues, not by the controller.
    pub fn store_provisioned_bandwidth(&self) -> u64 {
        self.store_provisioned_bandwidth.load(Ordering::Relaxed)
    }

    pub fn set_store_provisioned_bandwidth(&self, bytes_per_second: u64) {
        self.store_provisioned_bandwidth
            .store(bytes_per_second, Ordering::Relaxed);
    }
}

fn check_elastic_cpu_duration(scope: &str, duration: Duration) -> Result<(), AdmissionError> {
    if duration < MIN_ELASTIC_CPU_DURATION {
        return Err(report!(AdmissionError::invalid_config(format!(
            "minimum CPU duration allowed{scope} is {MIN_ELASTIC_CPU_DURATION:?}, got {duration:?}"
        ))));
    }
    if duration > MAX_ELASTIC_CPU_DURATION {
        return Err(report!(AdmissionError::invalid_config(format!(
            "maximum CPU duration allowed{scope} is {MAX_ELASTIC_CPU_DURATION:?}, got {duration:?}"
        ))));
    }
    Ok(())
}

// Bounded by MAX_ELASTIC_CPU_DURATION once validated, so this never truncates.
fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Accepts a plain number of milliseconds or a humantime string.
fn deserialize_duration<'de, D>(deserializer: D) -> core::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrMillis {
        String(String),
        Millis(u64),
    }

    match StringOrMillis::deserialize(deserializer)? {
        StringOrMillis::String(s) => {
            humantime::parse_duration(&s).map_err(serde::de::Error::custom)
        }
        StringOrMillis::Millis(ms) => Ok(Duration::from_millis(ms)),
    }
}
