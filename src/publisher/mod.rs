//! The Publisher (spec.md §4.D): serializes a `CanonicalRecord` to the bus
//! wire format and emits it to Kafka with per-device partition affinity,
//! wrapped in the Resilience Core's Kafka policy.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info};
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tokio_util::sync::CancellationToken;

use crate::error::PublishError;
use crate::record::CanonicalRecord;
use crate::resilience::{ResiliencePolicy, RetryOutcome};

const SCHEMA_VERSION: &str = "1.0";
const PRODUCER_NAME: &str = "telemetry-gateway";

#[derive(Debug, Clone)]
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

/// Derive `<prefix>.<protocol>`; `unknown` stands in for a record with no
/// recorded protocol tag (spec.md §6).
fn topic_for(prefix: &str, protocol_tag: Option<&str>) -> String {
    let protocol = protocol_tag
        .map(|p| p.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{prefix}.{protocol}")
}

/// `<device-id>_<|hash(device-id)| mod partition-count>` (spec.md §4.D).
fn partition_key(device_id: &str, partition_count: u32) -> String {
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    let index = (hasher.finish() % partition_count as u64) as u64;
    format!("{device_id}_{index}")
}

/// What the Pipeline needs from a publish target. Implemented by `Publisher`
/// for the real Kafka path; test code implements it directly for an
/// in-memory sink so `Pipeline::spawn` can be exercised end-to-end without a
/// live broker (spec.md §8).
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn publish(&self, cancel: &CancellationToken, record: &CanonicalRecord) -> Result<(), PublishError>;
    fn is_healthy(&self) -> bool;
}

/// Publishes canonical records to Kafka, retrying and circuit-breaking
/// through a `ResiliencePolicy` rather than re-implementing either.
pub struct Publisher {
    producer: FutureProducer,
    settings: KafkaSettings,
    policy: ResiliencePolicy,
}

impl Publisher {
    pub fn new(settings: KafkaSettings, policy: ResiliencePolicy) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("compression.type", &settings.compression)
            .set("message.timeout.ms", "30000")
            .create()?;

        Ok(Publisher {
            producer,
            settings,
            policy,
        })
    }

    /// Publish one record, retrying/circuit-breaking per the Kafka policy.
    /// Returns `PublishError` only once the policy gives up — the pipeline
    /// treats that as a counted drop (spec.md §7).
    pub async fn publish(&self, cancel: &CancellationToken, record: &CanonicalRecord) -> Result<(), PublishError> {
        if self.policy.is_circuit_open() {
            return Err(PublishError::Circuit(crate::error::CircuitOpenError));
        }

        let topic = topic_for(&self.settings.topic_prefix, record.protocol_tag());
        let key = partition_key(&record.device_id, self.settings.partition_count);
        let payload = serde_json::to_vec(record).map_err(|e| PublishError::Rejected(e.to_string()))?;
        let protocol = record.protocol_tag().unwrap_or("unknown").to_string();
        let quality = record
            .quality_score()
            .map(|q| q.to_string())
            .unwrap_or_default();

        let result = self
            .policy
            .run(cancel, || {
                let producer = &self.producer;
                let topic = topic.clone();
                let key = key.clone();
                let payload = payload.clone();
                let device_id = record.device_id.clone();
                let protocol = protocol.clone();
                let quality = quality.clone();
                async move {
                    let headers = rdkafka::message::OwnedHeaders::new()
                        .insert(rdkafka::message::Header {
                            key: "device_id",
                            value: Some(&device_id),
                        })
                        .insert(rdkafka::message::Header {
                            key: "schema_version",
                            value: Some(SCHEMA_VERSION),
                        })
                        .insert(rdkafka::message::Header {
                            key: "content_type",
                            value: Some("application/json"),
                        })
                        .insert(rdkafka::message::Header {
                            key: "producer",
                            value: Some(PRODUCER_NAME),
                        })
                        .insert(rdkafka::message::Header {
                            key: "protocol",
                            value: Some(&protocol),
                        })
                        .insert(rdkafka::message::Header {
                            key: "quality_score",
                            value: Some(&quality),
                        });

                    let record = FutureRecord::to(&topic)
                        .key(&key)
                        .payload(&payload)
                        .headers(headers);

                    producer
                        .send(record, Timeout::After(Duration::from_secs(5)))
                        .await
                        .map(|_| ())
                        .map_err(|(e, _)| PublishError::BrokerUnavailable(e.to_string()))
                }
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(RetryOutcome::OperationFailed(e)) => Err(e),
            Err(RetryOutcome::AttemptsExhausted) => {
                Err(PublishError::BrokerUnavailable("attempts exhausted".to_string()))
            }
            Err(RetryOutcome::CircuitOpen(e)) => Err(PublishError::Circuit(e)),
            Err(RetryOutcome::Cancelled(_)) => Err(PublishError::BrokerUnavailable("cancelled".to_string())),
        }
    }

    /// Block until the producer's local queue drains or `deadline` elapses
    /// (spec.md §5 shutdown step 5, `Publisher.Flush(30s)`).
    pub async fn flush(&self, deadline: Duration) -> Result<(), crate::error::FlushTimeoutError> {
        let producer = self.producer.clone();
        let handle = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(deadline)));
        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(Ok(()))) => {
                info!("publisher flush completed");
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                error!("publisher flush returned an error: {e}");
                Err(crate::error::FlushTimeoutError)
            }
            Ok(Err(e)) => {
                error!("publisher flush task panicked: {e}");
                Err(crate::error::FlushTimeoutError)
            }
            Err(_) => {
                error!("publisher flush exceeded its deadline of {deadline:?}");
                Err(crate::error::FlushTimeoutError)
            }
        }
    }

    /// Cheap health predicate for the admin surface: the circuit being
    /// closed is treated as healthy, open as degraded.
    pub fn is_healthy(&self) -> bool {
        !self.policy.is_circuit_open()
    }
}

#[async_trait]
impl PublishSink for Publisher {
    async fn publish(&self, cancel: &CancellationToken, record: &CanonicalRecord) -> Result<(), PublishError> {
        Publisher::publish(self, cancel, record).await
    }

    fn is_healthy(&self) -> bool {
        Publisher::is_healthy(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_uses_the_configured_prefix_and_lowercases_the_protocol() {
        assert_eq!(topic_for("telemetry.gps", Some("NMEA")), "telemetry.gps.nmea");
        assert_eq!(topic_for("telemetry.gps", None), "telemetry.gps.unknown");
    }

    #[test]
    fn partition_key_is_stable_for_the_same_device_id() {
        let a = partition_key("truck-1", 12);
        let b = partition_key("truck-1", 12);
        assert_eq!(a, b);
        assert!(a.starts_with("truck-1_"));
    }

    #[test]
    fn partition_key_index_is_within_bounds() {
        for id in ["a", "truck-42", "udp_10.0.0.1_9999"] {
            let key = partition_key(id, 12);
            let index: u32 = key.rsplit('_').next().unwrap().parse().unwrap();
            assert!(index < 12);
        }
    }
}
