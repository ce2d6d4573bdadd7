//! Wire-format selection and schema-event encoding.

use bytes::Bytes;
use serde::Serialize;

use crate::schema_sink::ConnectionOptions;
use crate::{Error, Result, SchemaChangeEvent};

/// Smallest size limit that can still hold a minimum-viable encoded schema
/// event.
const MIN_MESSAGE_BYTES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// A self-describing JSON envelope.
    Json,
    /// The bare DDL statement text.
    Raw,
}

impl WireFormat {
    pub(crate) fn parse(name: &str) -> Option<WireFormat> {
        match name.to_lowercase().as_str() {
            "json" => Some(WireFormat::Json),
            "raw" => Some(WireFormat::Raw),
            _ => None,
        }
    }
}

/// Encoder settings, bounded by the transport's maximum message size.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingConfig {
    pub format: WireFormat,
    pub max_message_bytes: usize,
}

#[derive(Serialize)]
struct JsonEnvelope<'a> {
    schema: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    table: Option<&'a str>,
    #[serde(rename = "type")]
    event_type: &'a str,
    query: &'a str,
    commit_ts_ms: u64,
}

impl EncodingConfig {
    pub(crate) fn build(format: WireFormat, options: &ConnectionOptions) -> Result<Self> {
        if options.max_message_bytes < MIN_MESSAGE_BYTES {
            return Err(Error::InvalidConfig(format!(
                "max message bytes {} cannot hold a minimum-viable schema event ({MIN_MESSAGE_BYTES} bytes)",
                options.max_message_bytes
            )));
        }
        Ok(EncodingConfig {
            format,
            max_message_bytes: options.max_message_bytes,
        })
    }

    /// Encodes an event into (message key, payload).
    pub(crate) fn encode(&self, event: &SchemaChangeEvent) -> Result<(Bytes, Bytes)> {
        let key = Bytes::from(event.qualified_name());
        let payload = match self.format {
            WireFormat::Json => {
                let envelope = JsonEnvelope {
                    schema: &event.schema,
                    table: event.table.as_deref(),
                    event_type: event.event_type.as_str(),
                    query: &event.query,
                    commit_ts_ms: event.commit_ts_ms,
                };
                let encoded = serde_json::to_vec(&envelope)
                    .map_err(|e| Error::Other(format!("Encoding schema event: {e}")))?;
                Bytes::from(encoded)
            }
            WireFormat::Raw => Bytes::copy_from_slice(event.query.as_bytes()),
        };
        if payload.len() > self.max_message_bytes {
            return Err(Error::Other(format!(
                "encoded schema event of {} bytes exceeds the {} byte message limit",
                payload.len(),
                self.max_message_bytes
            )));
        }
        Ok((key, payload))
    }
}
