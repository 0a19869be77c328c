//! Engine configuration types for sagaflow.
//!
//! `EngineConfig` represents `sagaflow.toml`, which controls step timeouts,
//! circuit breaker thresholds, named retry policies and admission limits.
//! Every field has a default so an empty file (or no file) is valid.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Name of the retry policy used when a step does not reference one.
pub const DEFAULT_RETRY_POLICY: &str = "default";

/// Top-level configuration for the orchestration engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Named retry policies. `default` is always present after `normalized()`.
    #[serde(default)]
    pub retry_policies: HashMap<String, RetryPolicyConfig>,

    #[serde(default)]
    pub distributor: DistributorConfig,
}

impl EngineConfig {
    /// Ensure the `default` retry policy exists.
    pub fn normalized(mut self) -> Self {
        self.retry_policies
            .entry(DEFAULT_RETRY_POLICY.to_string())
            .or_default();
        self
    }

    /// Breaker settings for one dependency, with per-dependency overrides applied.
    pub fn breaker_for(&self, dependency: &str) -> BreakerSettings {
        let base = BreakerSettings {
            failure_threshold: self.breaker.failure_threshold,
            success_threshold: self.breaker.success_threshold,
            cool_down_ms: self.breaker.cool_down_ms,
            half_open_max_calls: self.breaker.half_open_max_calls,
        };
        match self.breaker.overrides.get(dependency) {
            Some(o) => BreakerSettings {
                failure_threshold: o.failure_threshold.unwrap_or(base.failure_threshold),
                success_threshold: o.success_threshold.unwrap_or(base.success_threshold),
                cool_down_ms: o.cool_down_ms.unwrap_or(base.cool_down_ms),
                half_open_max_calls: o.half_open_max_calls.unwrap_or(base.half_open_max_calls),
            },
            None => base,
        }
    }

    /// Concurrent-run quota for a tenant.
    pub fn tenant_quota(&self, tenant: &str) -> usize {
        self.distributor
            .tenant_quotas
            .get(tenant)
            .copied()
            .unwrap_or(self.distributor.default_tenant_quota)
    }
}

// ---------------------------------------------------------------------------
// [engine]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Timeout applied to steps that do not declare `timeout_ms`.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    /// Broadcast channel capacity for observability events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Raw submissions classified below this confidence are rejected.
    #[serde(default = "default_min_intent_confidence")]
    pub min_intent_confidence: f64,

    /// Priority assigned when a request does not carry one.
    #[serde(default = "default_priority")]
    pub default_priority: u8,

    /// Capability names workflows may reference (steps and compensations).
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_min_intent_confidence() -> f64 {
    0.6
}

fn default_priority() -> u8 {
    5
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: default_step_timeout_ms(),
            event_capacity: default_event_capacity(),
            min_intent_confidence: default_min_intent_confidence(),
            default_priority: default_priority(),
            capabilities: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// [breaker]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed breaker open.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes required to close.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long an open breaker rejects before allowing trial calls.
    #[serde(default = "default_cool_down_ms")]
    pub cool_down_ms: u64,

    /// Concurrent trial calls allowed while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,

    /// Per-dependency overrides keyed by dependency name.
    #[serde(default)]
    pub overrides: HashMap<String, BreakerOverride>,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

fn default_cool_down_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cool_down_ms: default_cool_down_ms(),
            half_open_max_calls: default_half_open_max_calls(),
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cool_down_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_open_max_calls: Option<u32>,
}

/// Fully resolved breaker settings for one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cool_down_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cool_down_ms: default_cool_down_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

// ---------------------------------------------------------------------------
// [retry_policies.<name>]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of the computed delay added or removed at random (0.0..=1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

// ---------------------------------------------------------------------------
// [distributor]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    /// Global limit on concurrently running runs.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Concurrent-run quota for tenants without an explicit entry.
    #[serde(default = "default_tenant_quota")]
    pub default_tenant_quota: usize,

    #[serde(default)]
    pub tenant_quotas: HashMap<String, usize>,

    /// Queue wait after which a run's priority improves by one.
    #[serde(default = "default_starvation_threshold_secs")]
    pub starvation_threshold_secs: u64,

    /// Period of the aging and deadline sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Completed durations kept per workflow for deadline estimates.
    #[serde(default = "default_timing_window")]
    pub timing_window: usize,
}

fn default_max_concurrent_runs() -> usize {
    16
}

fn default_tenant_quota() -> usize {
    4
}

fn default_starvation_threshold_secs() -> u64 {
    600
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_timing_window() -> usize {
    20
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            default_tenant_quota: default_tenant_quota(),
            tenant_quotas: HashMap::new(),
            starvation_threshold_secs: default_starvation_threshold_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            timing_window: default_timing_window(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default().normalized();
        assert_eq!(config.engine.default_step_timeout_ms, 30_000);
        assert_eq!(config.engine.default_priority, 5);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.success_threshold, 2);
        assert_eq!(config.distributor.starvation_threshold_secs, 600);
        assert!(config.retry_policies.contains_key(DEFAULT_RETRY_POLICY));
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.event_capacity, 1024);
        assert_eq!(config.distributor.max_concurrent_runs, 16);
        assert!(config.retry_policies.is_empty());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
[engine]
default_step_timeout_ms = 5000
capabilities = ["flight-agent", "flight-cancel"]

[breaker]
failure_threshold = 5

[breaker.overrides.payments]
failure_threshold = 2
cool_down_ms = 60000

[retry_policies.patient]
max_attempts = 6
initial_backoff_ms = 500

[distributor]
max_concurrent_runs = 8

[distributor.tenant_quotas]
acme = 2
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.default_step_timeout_ms, 5000);
        assert_eq!(config.engine.capabilities.len(), 2);
        assert_eq!(config.breaker.failure_threshold, 5);

        let payments = config.breaker_for("payments");
        assert_eq!(payments.failure_threshold, 2);
        assert_eq!(payments.cool_down_ms, 60_000);
        assert_eq!(payments.success_threshold, 2);

        let other = config.breaker_for("search");
        assert_eq!(other.failure_threshold, 5);

        let patient = &config.retry_policies["patient"];
        assert_eq!(patient.max_attempts, 6);
        assert!((patient.multiplier - 2.0).abs() < f64::EPSILON);

        assert_eq!(config.tenant_quota("acme"), 2);
        assert_eq!(config.tenant_quota("globex"), 4);
    }
}
