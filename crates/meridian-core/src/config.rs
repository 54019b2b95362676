use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::fairness::object::SendFailurePolicy;
use crate::fairness::{EmptyQueuePolicy, FairQueueOptions};
use crate::message::ServiceTag;

/// Top-level configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    pub send: PacingConfig,
    pub receive: PacingConfig,
    pub objects: ObjectQueueConfig,
    pub forwarder: ForwarderConfig,
    pub estimator: EstimatorConfig,
    pub driver: DriverConfig,
}

/// Rate and admission settings of one paced queue direction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub rate_bytes_per_sec: f64,
    /// Byte bound of each per-key sub-queue.
    pub queue_capacity_bytes: usize,
    /// Larger pushes are rejected outright.
    pub max_message_bytes: usize,
    /// Weight of keys registered without negotiation.
    pub default_weight: f64,
    pub rescale_on_weight_change: bool,
    /// Size of the phantom message an idle key competes with. Zero lets
    /// idle keys give up their share.
    pub empty_queue_message_length: usize,
    /// Floor for the retry delay after a budget-blocked pass.
    pub min_retry_interval_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectQueueKind {
    Fair,
    Fifo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectQueueConfig {
    #[serde(flatten)]
    pub pacing: PacingConfig,
    pub kind: ObjectQueueKind,
    pub send_failure: SendFailurePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceWeight {
    pub tag: u16,
    pub weight: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    pub service_queue_capacity_bytes: usize,
    pub services: Vec<ServiceWeight>,
}

/// Capacity estimator settings shared by all directions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub window_ms: u64,
    /// Multiplier applied to the estimate while the queue is not blocked.
    pub optimism_factor: f64,
}

/// Service loop configuration (channel capacity, idle and retry timers).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub command_channel_capacity: usize,
    pub idle_timeout_ms: u64,
    /// Delay before retrying a pass halted by a refused send.
    pub send_retry_interval_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            rate_bytes_per_sec: 1_000_000.0,
            queue_capacity_bytes: 65_536,
            max_message_bytes: 16_384,
            default_weight: 1.0,
            rescale_on_weight_change: true,
            empty_queue_message_length: 0,
            min_retry_interval_us: 100,
        }
    }
}

impl Default for ObjectQueueConfig {
    fn default() -> Self {
        Self {
            pacing: PacingConfig::default(),
            kind: ObjectQueueKind::Fair,
            send_failure: SendFailurePolicy::Keep,
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            service_queue_capacity_bytes: 16_384,
            services: vec![
                ServiceWeight {
                    tag: ServiceTag::LOCATION.0,
                    weight: 1.0,
                },
                ServiceWeight {
                    tag: ServiceTag::PROXIMITY.0,
                    weight: 1.0,
                },
                ServiceWeight {
                    tag: ServiceTag::OBJECT_ROUTING.0,
                    weight: 2.0,
                },
            ],
        }
    }
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            window_ms: 200,
            optimism_factor: 1.25,
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command_channel_capacity: 10_000,
            idle_timeout_ms: 100,
            send_retry_interval_ms: 5,
        }
    }
}

impl PacingConfig {
    pub fn fair_queue_options(&self) -> FairQueueOptions {
        FairQueueOptions {
            empty_queue: EmptyQueuePolicy::from_message_length(self.empty_queue_message_length),
            rescale_on_weight_change: self.rescale_on_weight_change,
            max_message_bytes: Some(self.max_message_bytes),
        }
    }

    pub fn min_retry_interval(&self) -> Duration {
        Duration::from_micros(self.min_retry_interval_us)
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if !(self.rate_bytes_per_sec.is_finite() && self.rate_bytes_per_sec > 0.0) {
            return Err(ConfigError::InvalidValue(format!(
                "{section}.rate_bytes_per_sec must be positive, got {}",
                self.rate_bytes_per_sec
            )));
        }
        if self.queue_capacity_bytes == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{section}.queue_capacity_bytes must be non-zero"
            )));
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{section}.max_message_bytes must be non-zero"
            )));
        }
        if !(self.default_weight.is_finite() && self.default_weight > 0.0) {
            return Err(ConfigError::InvalidValue(format!(
                "{section}.default_weight must be positive, got {}",
                self.default_weight
            )));
        }
        Ok(())
    }
}

impl EstimatorConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl DriverConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn send_retry_interval(&self) -> Duration {
        Duration::from_millis(self.send_retry_interval_ms)
    }
}

impl MeridianConfig {
    /// Read and parse a TOML file. Missing sections and keys take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: MeridianConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.send.validate("send")?;
        self.receive.validate("receive")?;
        self.objects.pacing.validate("objects")?;

        if self.forwarder.service_queue_capacity_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "forwarder.service_queue_capacity_bytes must be non-zero".to_string(),
            ));
        }
        for service in &self.forwarder.services {
            if !(service.weight.is_finite() && service.weight >= 0.0) {
                return Err(ConfigError::InvalidValue(format!(
                    "forwarder service {} has invalid weight {}",
                    service.tag, service.weight
                )));
            }
        }
        if let SendFailurePolicy::Deprioritize { factor, floor } = self.objects.send_failure {
            if !(factor > 0.0 && factor <= 1.0) || !(floor >= 0.0) {
                return Err(ConfigError::InvalidValue(format!(
                    "objects.send_failure needs 0 < factor <= 1 and floor >= 0, got factor {factor} floor {floor}"
                )));
            }
        }
        if self.estimator.window_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "estimator.window_ms must be non-zero".to_string(),
            ));
        }
        if self.driver.command_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "driver.command_channel_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
