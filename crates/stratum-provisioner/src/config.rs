use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stratum_core::ResourceKind;

use crate::error::ProvisionerError;

/// Current config version. Bump this when adding fields or changing shape.
/// Each bump requires a corresponding entry in [`migrate`].
const CURRENT_VERSION: u32 = 1;

/// Engine tuning: concurrency, retries, timeouts, and where state lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Schema version. Missing or 0 = pre-versioned config.
    pub config_version: u32,
    pub state_dir: PathBuf,
    /// Upper bound on concurrent resource operations within one wave.
    pub max_parallel: usize,
    /// Deadline for one provider operation, retries included.
    pub operation_timeout_secs: u64,
    pub retry: RetryConfig,
    /// Consistency wait used for eventual kinds without an override.
    pub wait: WaitConfig,
    pub wait_overrides: BTreeMap<ResourceKind, WaitConfig>,
    /// Re-read every tracked resource from the provider before planning.
    pub refresh: bool,
    /// A state lock older than this is assumed abandoned.
    pub lock_stale_after_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut wait_overrides = BTreeMap::new();
        wait_overrides.insert(
            ResourceKind::ManagedDatabase,
            WaitConfig {
                timeout_secs: 1800,
                interval_ms: 15_000,
                ..WaitConfig::default()
            },
        );
        Self {
            config_version: CURRENT_VERSION,
            state_dir: PathBuf::from(".stratum"),
            max_parallel: 4,
            operation_timeout_secs: 600,
            retry: RetryConfig::default(),
            wait: WaitConfig::default(),
            wait_overrides,
            refresh: true,
            lock_stale_after_secs: 3600,
        }
    }
}

impl EngineConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_after_secs)
    }

    /// Wait settings for `kind`, falling back to the global ones.
    pub fn wait_for(&self, kind: ResourceKind) -> &WaitConfig {
        self.wait_overrides.get(&kind).unwrap_or(&self.wait)
    }

    pub fn validate(&self) -> Result<(), ProvisionerError> {
        if self.max_parallel == 0 {
            return Err(ProvisionerError::Config("max_parallel must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ProvisionerError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.operation_timeout_secs == 0 {
            return Err(ProvisionerError::Config(
                "operation_timeout_secs must be positive".into(),
            ));
        }
        for (kind, wait) in
            std::iter::once((None, &self.wait)).chain(self.wait_overrides.iter().map(|(k, w)| (Some(k), w)))
        {
            if wait.interval_ms == 0 {
                let scope = kind.map_or("wait".to_string(), |k| format!("wait_overrides.{k}"));
                return Err(ProvisionerError::Config(format!(
                    "{scope}.interval_ms must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// Bounded exponential backoff for transient provider errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): base doubled per
    /// attempt, capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Polling parameters for the consistency waiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub interval_ms: u64,
    pub timeout_secs: u64,
    /// Fixed delay used only when the provider has no readiness check.
    pub fallback_delay_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            timeout_secs: 600,
            fallback_delay_secs: 60,
        }
    }
}

impl WaitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn fallback_delay(&self) -> Duration {
        Duration::from_secs(self.fallback_delay_secs)
    }
}

pub fn load_config(path: &Path) -> Result<EngineConfig, ProvisionerError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ProvisionerError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;

    // Parse as raw JSON so we can run migrations before deserializing.
    let json: serde_json::Value = serde_json::from_str(&contents)?;
    let on_disk_version = json
        .get("config_version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;

    let migrated = migrate(json, on_disk_version)?;
    let config: EngineConfig = serde_json::from_value(migrated)?;
    config.validate()?;
    Ok(config)
}

/// Run sequential migrations from `from_version` up to [`CURRENT_VERSION`].
fn migrate(
    mut json: serde_json::Value,
    from_version: u32,
) -> Result<serde_json::Value, ProvisionerError> {
    if from_version > CURRENT_VERSION {
        return Err(ProvisionerError::Config(format!(
            "config_version {from_version} is newer than this build supports ({CURRENT_VERSION})"
        )));
    }

    // v0 → v1: `parallelism` renamed to `max_parallel`
    if from_version < 1 {
        let obj = json
            .as_object_mut()
            .ok_or_else(|| ProvisionerError::Config("config is not a JSON object".into()))?;
        if let Some(parallelism) = obj.remove("parallelism") {
            obj.entry("max_parallel").or_insert(parallelism);
        }
        obj.insert(
            "config_version".to_string(),
            serde_json::Value::Number(1.into()),
        );
        tracing::info!("migrated engine config v0 → v1 (parallelism → max_parallel)");
    }

    Ok(json)
}

pub fn save_config(path: &Path, config: &EngineConfig) -> Result<(), ProvisionerError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    // Always write the current version, regardless of what was loaded.
    let mut stamped = config.clone();
    stamped.config_version = CURRENT_VERSION;
    let json = serde_json::to_string_pretty(&stamped)?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json.as_bytes())?;
    std::fs::rename(&tmp_path, path)?;

    tracing::info!(path = %path.display(), "engine config saved");
    Ok(())
}
