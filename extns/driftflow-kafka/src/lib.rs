//! Kafka schema-change sink for driftflow.
//!
//! The entry point is [`schema_sink::new_schema_sink`], which runs the full
//! sink-initialization sequence: destination and connection-option
//! resolution, admin-client acquisition, topic adjustment and provisioning,
//! publisher creation, event-router and encoder construction. Initialization
//! either returns a ready [`schema_sink::SchemaSink`] or an error with every
//! already-acquired handle released.

use rdkafka::config::ClientConfig;
use tracing::warn;

pub mod encoding;
pub mod router;
pub mod schema_sink;
pub mod topic;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid sink destination - {0}")]
    InvalidDestination(String),

    #[error("Invalid sink config - {0}")]
    InvalidConfig(String),

    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Topic config mismatch - {0}")]
    TopicConfigMismatch(String),

    #[error("Invalid routing rule - {0}")]
    InvalidRoutingRule(String),

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("Cancelled while {0}")]
    Cancelled(&'static str),

    #[error("{0}")]
    Other(String),
}

/// SASL credentials used to connect to Kafka.
#[derive(Debug, Clone, PartialEq)]
pub enum KafkaSaslAuth {
    Plain { username: String, password: String },
    ScramSha256 { username: String, password: String },
    ScramSha512 { username: String, password: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<String>,
    pub client_auth: Option<TlsClientAuthCerts>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsClientAuthCerts {
    pub client_cert: String,
    pub client_cert_private_key: String,
}

/// A schema-change event as published by this crate. The core crate converts
/// its own event representation into this before handing it to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaChangeEvent {
    /// Database/schema the change applies to.
    pub schema: String,
    /// Table the change applies to; `None` for database-level statements.
    pub table: Option<String>,
    pub event_type: SchemaEventType,
    /// The DDL statement text.
    pub query: String,
    /// Commit timestamp of the change, epoch time in milliseconds.
    pub commit_ts_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaEventType {
    Create,
    Alter,
    Drop,
    Rename,
    Truncate,
    Other,
}

impl SchemaEventType {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            SchemaEventType::Create => "create",
            SchemaEventType::Alter => "alter",
            SchemaEventType::Drop => "drop",
            SchemaEventType::Rename => "rename",
            SchemaEventType::Truncate => "truncate",
            SchemaEventType::Other => "other",
        }
    }
}

impl SchemaChangeEvent {
    /// `schema` or `schema.table`, used as the message key so that consumers
    /// can correlate schema events with the row events they affect.
    pub(crate) fn qualified_name(&self) -> String {
        match &self.table {
            Some(table) => format!("{}.{}", self.schema, table),
            None => self.schema.clone(),
        }
    }
}

/// Applies TLS and SASL settings to a client config. Shared by the admin and
/// publishing clients so both connections authenticate identically.
pub(crate) fn update_auth_config(
    client_config: &mut ClientConfig,
    tls_config: Option<TlsConfig>,
    auth: Option<KafkaSaslAuth>,
) {
    match (&auth, &tls_config) {
        (Some(_), Some(_)) => {
            client_config.set("security.protocol", "SASL_SSL");
        }
        (Some(_), None) => {
            client_config.set("security.protocol", "SASL_PLAINTEXT");
        }
        (None, Some(_)) => {
            client_config.set("security.protocol", "SSL");
        }
        (None, None) => {}
    }

    if let Some(auth) = auth {
        let (mechanism, username, password) = match auth {
            KafkaSaslAuth::Plain { username, password } => ("PLAIN", username, password),
            KafkaSaslAuth::ScramSha256 { username, password } => {
                ("SCRAM-SHA-256", username, password)
            }
            KafkaSaslAuth::ScramSha512 { username, password } => {
                ("SCRAM-SHA-512", username, password)
            }
        };
        client_config
            .set("sasl.mechanisms", mechanism)
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    if let Some(tls_config) = tls_config {
        if tls_config.insecure_skip_verify {
            warn!(
                "'insecureSkipVerify' is set to true, certificate validation will not be performed when connecting to Kafka server"
            );
            client_config.set("ssl.endpoint.identification.algorithm", "none");
        }
        if let Some(ca_cert) = tls_config.ca_cert {
            client_config.set("ssl.ca.location", ca_cert);
        }
        if let Some(client_auth) = tls_config.client_auth {
            client_config
                .set("ssl.certificate.location", client_auth.client_cert)
                .set("ssl.key.location", client_auth.client_cert_private_key);
        }
    }
}
