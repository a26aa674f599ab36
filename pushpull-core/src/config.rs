//! Bridge configuration.
//!
//! Loaded from defaults, environment variables, or TOML. Durations are
//! written in milliseconds in both external forms.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// What the subscription registry does when a backend subscription fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ResubscribePolicy {
    /// Forward the error to every listener and tear the subscription down.
    /// Retrying is left to the pull cache's own retry settings.
    #[default]
    Never,
    /// Keep listeners attached and reopen the subscription with exponential
    /// backoff, giving up after `max_attempts` consecutive failures.
    Backoff {
        #[serde(rename = "initial_ms", with = "duration_ms")]
        initial: Duration,
        #[serde(rename = "max_ms", with = "duration_ms")]
        max: Duration,
        multiplier: f64,
        max_attempts: u32,
    },
}

impl ResubscribePolicy {
    /// Exponential backoff starting at `initial`, capped at `max`.
    pub fn backoff(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        ResubscribePolicy::Backoff {
            initial,
            max,
            multiplier: 2.0,
            max_attempts,
        }
    }

    /// Delay before resubscribe attempt number `attempt` (1-based), or `None`
    /// once the policy gives up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            ResubscribePolicy::Never => None,
            ResubscribePolicy::Backoff {
                initial,
                max,
                multiplier,
                max_attempts,
            } => {
                if attempt == 0 || attempt > *max_attempts {
                    return None;
                }
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let millis = (initial.as_millis() as f64 * factor).min(max.as_millis() as f64);
                Some(Duration::from_millis(millis as u64))
            }
        }
    }
}

/// Configuration for a `QueryBridge`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Policy applied when a live subscription fails.
    pub resubscribe: ResubscribePolicy,

    /// How long a reactive cache entry (and so its backend subscription)
    /// survives without observers. `None` uses the cache's own default.
    #[serde(rename = "reactive_gc_ms", with = "option_duration_ms")]
    pub reactive_gc_time: Option<Duration>,

    /// Stale time applied to action descriptors. `None` means actions are
    /// stale immediately and re-run on every cache-triggered fetch.
    #[serde(rename = "action_stale_ms", with = "option_duration_ms")]
    pub action_stale_time: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            resubscribe: ResubscribePolicy::Never,
            reactive_gc_time: None,
            action_stale_time: None,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resubscribe(mut self, policy: ResubscribePolicy) -> Self {
        self.resubscribe = policy;
        self
    }

    pub fn with_reactive_gc_time(mut self, gc_time: Duration) -> Self {
        self.reactive_gc_time = Some(gc_time);
        self
    }

    pub fn with_action_stale_time(mut self, stale_time: Duration) -> Self {
        self.action_stale_time = Some(stale_time);
        self
    }

    /// Create a BridgeConfig from environment variables.
    ///
    /// Environment variables:
    /// - `PUSHPULL_RESUBSCRIBE_MAX_ATTEMPTS`: enables backoff resubscription when > 0
    /// - `PUSHPULL_RESUBSCRIBE_INITIAL_MS`: first backoff delay (default: 250)
    /// - `PUSHPULL_RESUBSCRIBE_MAX_MS`: backoff cap (default: 30000)
    /// - `PUSHPULL_REACTIVE_GC_MS`: gc time for reactive entries
    /// - `PUSHPULL_ACTION_STALE_MS`: stale time for action entries
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_attempts: u32 = env_parse("PUSHPULL_RESUBSCRIBE_MAX_ATTEMPTS")?.unwrap_or(0);
        let initial_ms: u64 = env_parse("PUSHPULL_RESUBSCRIBE_INITIAL_MS")?.unwrap_or(250);
        let max_ms: u64 = env_parse("PUSHPULL_RESUBSCRIBE_MAX_MS")?.unwrap_or(30_000);

        let resubscribe = if max_attempts > 0 {
            ResubscribePolicy::backoff(
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
                max_attempts,
            )
        } else {
            ResubscribePolicy::Never
        };

        let config = Self {
            resubscribe,
            reactive_gc_time: env_parse::<u64>("PUSHPULL_REACTIVE_GC_MS")?
                .map(Duration::from_millis),
            action_stale_time: env_parse::<u64>("PUSHPULL_ACTION_STALE_MS")?
                .map(Duration::from_millis),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    ///
    /// ```toml
    /// reactive_gc_ms = 5000
    ///
    /// [resubscribe]
    /// mode = "backoff"
    /// initial_ms = 250
    /// max_ms = 30000
    /// multiplier = 2.0
    /// max_attempts = 5
    /// ```
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - backoff `initial` is positive and not above `max`
    /// - backoff `multiplier` >= 1.0
    /// - backoff `max_attempts` > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let ResubscribePolicy::Backoff {
            initial,
            max,
            multiplier,
            max_attempts,
        } = &self.resubscribe
        {
            if initial.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "resubscribe.initial_ms".to_string(),
                    value: initial.as_millis().to_string(),
                    reason: "initial backoff must be positive".to_string(),
                });
            }
            if initial > max {
                return Err(ConfigError::InvalidValue {
                    field: "resubscribe.max_ms".to_string(),
                    value: max.as_millis().to_string(),
                    reason: "max backoff must not be below initial backoff".to_string(),
                });
            }
            if !(*multiplier >= 1.0) {
                return Err(ConfigError::InvalidValue {
                    field: "resubscribe.multiplier".to_string(),
                    value: multiplier.to_string(),
                    reason: "multiplier must be at least 1.0".to_string(),
                });
            }
            if *max_attempts == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "resubscribe.max_attempts".to_string(),
                    value: "0".to_string(),
                    reason: "use mode = \"never\" to disable resubscription".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                value: raw.clone(),
                reason: "not a valid number".to_string(),
            }),
        Err(_) => Ok(None),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
