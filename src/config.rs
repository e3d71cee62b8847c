//! Layered configuration (spec.md §6 "Configuration", SPEC_FULL.md §4.H):
//! built-in defaults, an optional TOML file, then `TELEMETRY_`-prefixed
//! environment variables with `__` as the section separator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::resilience::{BackoffKind, BreakerConfig, PolicyConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetryServerSettings {
    pub tcp_port: u16,
    pub udp_port: u16,
    pub admin_port: u16,
    pub buffer_class_size: usize,
    pub max_connections: usize,
}

impl Default for TelemetryServerSettings {
    fn default() -> Self {
        TelemetryServerSettings {
            tcp_port: 8080,
            udp_port: 8081,
            admin_port: 9090,
            buffer_class_size: 4096,
            max_connections: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    pub topic_prefix: String,
    pub partition_count: u32,
    pub compression: String,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        KafkaSettings {
            bootstrap_servers: "localhost:9092".to_string(),
            topic_prefix: "telemetry.gps".to_string(),
            partition_count: 12,
            compression: "snappy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct PluginSettings {
    pub directory: Option<String>,
    pub enable_hot_reload: bool,
}

/// Worker-pool and back-pressure sizing for the Pipeline (spec.md §4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PipelineSettings {
    pub worker_count: usize,
    pub channel_capacity_multiplier: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            worker_count: num_cpus_fallback(),
            channel_capacity_multiplier: 4,
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// A serializable, operator-overridable mirror of `resilience::BackoffKind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackoffSettings {
    /// `"exponential"` or `"linear"`.
    pub kind: String,
    /// Exponential: the initial interval. Linear: the fixed per-attempt step.
    pub initial_ms: u64,
    /// Exponential: the interval ceiling. Ignored for `"linear"`.
    pub max_ms: u64,
}

/// A serializable, operator-overridable mirror of `resilience::BreakerConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BreakerSettings {
    pub failure_ratio: f64,
    pub window_secs: u64,
    pub minimum_throughput: u32,
    pub break_duration_secs: u64,
}

/// Per-policy overrides for one of the Resilience Core's three named
/// policies (spec.md §4.D; SPEC_FULL.md §4.H, "per-policy parameters").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetryPolicySettings {
    pub max_attempts: u32,
    pub backoff: BackoffSettings,
    pub timeout_secs: Option<u64>,
    pub breaker: Option<BreakerSettings>,
}

impl From<&PolicyConfig> for RetryPolicySettings {
    fn from(p: &PolicyConfig) -> Self {
        let backoff = match &p.backoff {
            BackoffKind::Exponential { initial, max } => BackoffSettings {
                kind: "exponential".to_string(),
                initial_ms: initial.as_millis() as u64,
                max_ms: max.as_millis() as u64,
            },
            BackoffKind::Linear { step } => BackoffSettings {
                kind: "linear".to_string(),
                initial_ms: step.as_millis() as u64,
                max_ms: 0,
            },
        };
        RetryPolicySettings {
            max_attempts: p.max_attempts,
            backoff,
            timeout_secs: p.timeout.map(|d| d.as_secs()),
            breaker: p.breaker.as_ref().map(|b| BreakerSettings {
                failure_ratio: b.failure_ratio,
                window_secs: b.window.as_secs(),
                minimum_throughput: b.minimum_throughput,
                break_duration_secs: b.break_duration.as_secs(),
            }),
        }
    }
}

impl RetryPolicySettings {
    /// Build the runtime `PolicyConfig` this section describes.
    pub fn to_policy_config(&self) -> PolicyConfig {
        let backoff = if self.backoff.kind.eq_ignore_ascii_case("linear") {
            BackoffKind::Linear {
                step: Duration::from_millis(self.backoff.initial_ms),
            }
        } else {
            BackoffKind::Exponential {
                initial: Duration::from_millis(self.backoff.initial_ms),
                max: Duration::from_millis(self.backoff.max_ms),
            }
        };
        PolicyConfig {
            max_attempts: self.max_attempts,
            backoff,
            timeout: self.timeout_secs.map(Duration::from_secs),
            breaker: self.breaker.as_ref().map(|b| BreakerConfig {
                failure_ratio: b.failure_ratio,
                window: Duration::from_secs(b.window_secs),
                minimum_throughput: b.minimum_throughput,
                break_duration: Duration::from_secs(b.break_duration_secs),
            }),
        }
    }
}

/// Overridable parameters for the Resilience Core's three named policies
/// (spec.md §4.D: Kafka publish, message processing, connection reconnect).
/// Defaults reproduce `PolicyConfig::kafka_publish()` /
/// `message_processing()` / `connection_reconnect()` exactly, so an operator
/// who sets no override gets the same behavior as before this section
/// existed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResilienceSettings {
    pub kafka_publish: RetryPolicySettings,
    pub message_processing: RetryPolicySettings,
    pub connection_reconnect: RetryPolicySettings,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        ResilienceSettings {
            kafka_publish: RetryPolicySettings::from(&PolicyConfig::kafka_publish()),
            message_processing: RetryPolicySettings::from(&PolicyConfig::message_processing()),
            connection_reconnect: RetryPolicySettings::from(&PolicyConfig::connection_reconnect()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitoringSettings {
    pub service_name: String,
    pub exporter: String,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        MonitoringSettings {
            service_name: "telemetry-gateway".to_string(),
            exporter: "none".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub telemetry_server: TelemetryServerSettings,
    #[serde(default)]
    pub kafka: KafkaSettings,
    #[serde(default)]
    pub plugin_settings: PluginSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub resilience: ResilienceSettings,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
}

impl Settings {
    /// Load defaults, then an optional `config.toml` in the current
    /// directory, then `TELEMETRY_`-prefixed environment variables. A
    /// malformed configuration is startup-fatal (spec.md §7).
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?);

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        } else {
            builder = builder.add_source(config::File::with_name("config").required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TELEMETRY")
                .separator("__")
                .try_parsing(true),
        );

        let raw = builder.build()?;
        raw.try_deserialize().map_err(ConfigError::Load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_documented_ports() {
        let settings = TelemetryServerSettings::default();
        assert_eq!(settings.tcp_port, 8080);
        assert_eq!(settings.udp_port, 8081);
    }

    #[test]
    fn kafka_defaults_use_the_documented_prefix() {
        let kafka = KafkaSettings::default();
        assert_eq!(kafka.topic_prefix, "telemetry.gps");
    }

    #[test]
    fn pipeline_defaults_fall_back_to_available_parallelism() {
        let pipeline = PipelineSettings::default();
        assert!(pipeline.worker_count >= 1);
        assert_eq!(pipeline.channel_capacity_multiplier, 4);
    }

    #[test]
    fn resilience_defaults_round_trip_into_the_same_policy_constants() {
        let settings = ResilienceSettings::default();
        let policy = settings.kafka_publish.to_policy_config();
        assert_eq!(policy.max_attempts, PolicyConfig::kafka_publish().max_attempts);
        assert!(matches!(policy.backoff, BackoffKind::Exponential { .. }));
        assert!(policy.breaker.is_some());
    }

    #[test]
    fn resilience_message_processing_default_is_linear() {
        let settings = ResilienceSettings::default();
        let policy = settings.message_processing.to_policy_config();
        assert!(matches!(policy.backoff, BackoffKind::Linear { .. }));
        assert!(policy.breaker.is_none());
    }
}
