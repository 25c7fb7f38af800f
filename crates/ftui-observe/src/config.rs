#![forbid(unsafe_code)]

//! Runtime configuration for the observation registry.
//!
//! Settings can be built in code with the `with_*` helpers or read from the
//! environment:
//!
//! | Variable | Values | Field |
//! |----------|--------|-------|
//! | `FTUI_OBSERVE_DELIVERY` | `deferred` / `immediate` | [`ObserveConfig::delivery`] |
//! | `FTUI_OBSERVE_FAILURES` | `propagate` / `report` | [`ObserveConfig::failure_policy`] |
//! | `FTUI_OBSERVE_MAX_DELIVERIES` | positive integer | [`ObserveConfig::max_deliveries_per_flush`] |
//! | `FTUI_OBSERVE_LOG` | bool (`1/0/true/false/yes/no/on/off`) | [`ObserveConfig::log_deliveries`] |
//!
//! Unparseable values leave the default in place and are reported through
//! [`ObserveConfigParse::errors`].

use std::env;

use crate::error::ConfigError;

const ENV_DELIVERY: &str = "FTUI_OBSERVE_DELIVERY";
const ENV_FAILURES: &str = "FTUI_OBSERVE_FAILURES";
const ENV_MAX_DELIVERIES: &str = "FTUI_OBSERVE_MAX_DELIVERIES";
const ENV_LOG: &str = "FTUI_OBSERVE_LOG";

/// When queued deliveries are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeliveryMode {
    /// Deliveries wait in the queue until the host calls
    /// [`run_pending`](crate::run_pending) or [`step`](crate::step).
    #[default]
    Deferred,
    /// The queue is drained when the outermost mutation scope ends.
    Immediate,
}

impl DeliveryMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "deferred" => Some(Self::Deferred),
            "immediate" => Some(Self::Immediate),
            _ => None,
        }
    }
}

/// What happens after a re-run fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FailurePolicy {
    /// Finish the delivery, then re-raise the first failure out of the
    /// flush call.
    #[default]
    Propagate,
    /// Log the failure at error level and keep going.
    Report,
}

impl FailurePolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "propagate" => Some(Self::Propagate),
            "report" => Some(Self::Report),
            _ => None,
        }
    }
}

/// Configuration for the thread's observation registry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObserveConfig {
    /// When queued deliveries run.
    pub delivery: DeliveryMode,
    /// How re-run failures surface.
    pub failure_policy: FailurePolicy,
    /// Upper bound on deliveries processed by one `run_pending` call. Guards
    /// against observations that keep mutating what they read.
    pub max_deliveries_per_flush: usize,
    /// Emit a debug event per delivery.
    pub log_deliveries: bool,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::Deferred,
            failure_policy: FailurePolicy::Propagate,
            max_deliveries_per_flush: 1024,
            log_deliveries: false,
        }
    }
}

/// Configuration parse diagnostics (env + validation).
#[derive(Debug, Clone)]
pub struct ObserveConfigParse {
    pub config: ObserveConfig,
    pub errors: Vec<ConfigError>,
}

impl ObserveConfig {
    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the runaway guard. Zero is clamped to one.
    #[must_use]
    pub fn with_max_deliveries_per_flush(mut self, max: usize) -> Self {
        self.max_deliveries_per_flush = max.max(1);
        self
    }

    #[must_use]
    pub fn with_log_deliveries(mut self, enabled: bool) -> Self {
        self.log_deliveries = enabled;
        self
    }

    /// Parse config from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_with_diagnostics().config
    }

    /// Parse config from environment variables and return diagnostics.
    #[must_use]
    pub fn from_env_with_diagnostics() -> ObserveConfigParse {
        Self::from_env_with(|key| env::var(key).ok())
    }

    /// Parse config through a custom environment lookup.
    pub fn from_env_with<F>(mut get: F) -> ObserveConfigParse
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let mut errors = Vec::new();

        if let Some(value) = get(ENV_DELIVERY) {
            match DeliveryMode::parse(&value) {
                Some(parsed) => config.delivery = parsed,
                None => errors.push(ConfigError::new(
                    "delivery",
                    value,
                    "expected deferred|immediate",
                )),
            }
        }

        if let Some(value) = get(ENV_FAILURES) {
            match FailurePolicy::parse(&value) {
                Some(parsed) => config.failure_policy = parsed,
                None => errors.push(ConfigError::new(
                    "failure_policy",
                    value,
                    "expected propagate|report",
                )),
            }
        }

        if let Some(value) = get(ENV_MAX_DELIVERIES) {
            match value.trim().parse::<usize>() {
                Ok(parsed) if parsed > 0 => config.max_deliveries_per_flush = parsed,
                _ => errors.push(ConfigError::new(
                    "max_deliveries_per_flush",
                    value,
                    "expected positive integer",
                )),
            }
        }

        if let Some(value) = get(ENV_LOG) {
            match parse_bool(&value) {
                Some(parsed) => config.log_deliveries = parsed,
                None => errors.push(ConfigError::new(
                    "log_deliveries",
                    value,
                    "expected bool (1/0/true/false)",
                )),
            }
        }

        if let Err(mut violations) = config.validate() {
            errors.append(&mut violations);
        }

        ObserveConfigParse { config, errors }
    }

    /// Validate config constraints and return all violations.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();
        if self.max_deliveries_per_flush == 0 {
            errors.push(ConfigError::new(
                "max_deliveries_per_flush",
                "0",
                "must be greater than zero",
            ));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
