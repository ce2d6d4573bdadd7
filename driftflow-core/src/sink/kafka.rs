use driftflow_kafka::schema_sink::KafkaSchemaSink;
use driftflow_kafka::{SchemaChangeEvent, SchemaEventType as KafkaSchemaEventType};

use crate::Result;
use crate::error::Error;
use crate::message::{SchemaEvent, SchemaEventType};
use crate::sink::Sink;

impl From<SchemaEvent> for SchemaChangeEvent {
    fn from(event: SchemaEvent) -> Self {
        SchemaChangeEvent {
            schema: event.schema,
            table: event.table,
            event_type: event.event_type.into(),
            query: event.query,
            commit_ts_ms: event.commit_ts_ms,
        }
    }
}

impl From<SchemaEventType> for KafkaSchemaEventType {
    fn from(event_type: SchemaEventType) -> Self {
        match event_type {
            SchemaEventType::Create => KafkaSchemaEventType::Create,
            SchemaEventType::Alter => KafkaSchemaEventType::Alter,
            SchemaEventType::Drop => KafkaSchemaEventType::Drop,
            SchemaEventType::Rename => KafkaSchemaEventType::Rename,
            SchemaEventType::Truncate => KafkaSchemaEventType::Truncate,
            SchemaEventType::Other => KafkaSchemaEventType::Other,
        }
    }
}

impl Sink for KafkaSchemaSink {
    async fn sink(&mut self, events: Vec<SchemaEvent>) -> Result<()> {
        let events = events.into_iter().map(Into::into).collect();
        self.publish_events(events)
            .await
            .map_err(|e| Error::Sink(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        KafkaSchemaSink::close(self)
            .await
            .map_err(|e| Error::Sink(e.to_string()))
    }
}
