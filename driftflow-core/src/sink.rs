//! The sink trait and construction of the configured sink.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::config::{SinkConfig, SinkType};
use crate::error::Error;
use crate::message::SchemaEvent;

mod kafka;

/// Set of operations a schema sink must support.
#[trait_variant::make(Sink: Send)]
pub trait LocalSink {
    /// Write the schema events to the sink.
    async fn sink(&mut self, events: Vec<SchemaEvent>) -> Result<()>;

    /// Release the sink's resources. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Builds the sink described by the config. The cancellation token aborts
/// in-flight initialization I/O; a cancelled or failed initialization leaves
/// no connections behind.
pub async fn create_schema_sink(
    config: SinkConfig,
    cln_token: CancellationToken,
) -> Result<impl Sink> {
    match config.sink_type {
        SinkType::KafkaSchema(kafka_config) => {
            info!(topic = %kafka_config.topic, "Creating Kafka schema sink");
            driftflow_kafka::schema_sink::new_schema_sink(*kafka_config, cln_token)
                .await
                .map_err(|e| Error::Sink(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use driftflow_kafka::schema_sink::KafkaSchemaSinkConfig;

    use super::*;

    fn kafka_config(topic: &str) -> KafkaSchemaSinkConfig {
        KafkaSchemaSinkConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic: topic.to_string(),
            format: None,
            auth: None,
            tls: None,
            partition_count: None,
            replication_factor: None,
            max_message_bytes: None,
            request_timeout: None,
            routing_rules: vec![],
            kafka_raw_config: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_schema_sink_rejects_invalid_destination() {
        // Resolution fails before any connection is attempted, so this needs
        // no broker.
        let config = SinkConfig {
            sink_type: SinkType::KafkaSchema(Box::new(kafka_config("bad topic!"))),
        };
        let err = create_schema_sink(config, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Sink(_)));
        assert!(err.to_string().contains("Invalid sink destination"));
    }

    #[tokio::test]
    async fn test_create_schema_sink_rejects_invalid_options() {
        let mut kafka = kafka_config("schema-events");
        kafka.brokers = vec![":9092".to_string()];
        let config = SinkConfig {
            sink_type: SinkType::KafkaSchema(Box::new(kafka)),
        };
        let err = create_schema_sink(config, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Invalid sink config"));
    }
}
