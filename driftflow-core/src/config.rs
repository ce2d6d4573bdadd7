//! Sink configuration, loaded from the spec object the platform mounts into
//! the environment as base64-encoded JSON.

use std::collections::HashMap;
use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use driftflow_kafka::router::RoutingRuleConfig;
use driftflow_kafka::schema_sink::KafkaSchemaSinkConfig;
use driftflow_kafka::{KafkaSaslAuth, TlsClientAuthCerts, TlsConfig};
use serde::Deserialize;

use crate::Result;
use crate::error::Error;

const ENV_SCHEMA_SINK_OBJ: &str = "DRIFTFLOW_SINK_OBJECT";

pub fn config() -> &'static Settings {
    static CONF: OnceLock<Settings> = OnceLock::new();
    CONF.get_or_init(|| match Settings::load() {
        Ok(v) => v,
        Err(e) => {
            panic!("Failed to load configuration: {e:?}");
        }
    })
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub sink: SinkConfig,
}

impl Settings {
    fn load() -> Result<Self> {
        let Ok(obj) = env::var(ENV_SCHEMA_SINK_OBJ) else {
            return Err(Error::Config("No configuration found".to_string()));
        };
        Ok(Settings {
            sink: SinkConfig::load(obj)?,
        })
    }
}

/// User-facing sink spec as written by the operator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SchemaSinkSpec {
    kafka: Option<Box<KafkaSink>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KafkaSink {
    brokers: Option<Vec<String>>,
    topic: String,
    format: Option<String>,
    sasl: Option<Sasl>,
    tls: Option<Tls>,
    partition_count: Option<i32>,
    replication_factor: Option<i16>,
    max_message_bytes: Option<usize>,
    request_timeout_ms: Option<u64>,
    routing_rules: Option<Vec<RoutingRule>>,
    /// Multiline `key: value` pairs passed through to librdkafka.
    config: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Sasl {
    mechanism: String,
    username: String,
    password: Option<String>,
    /// Path of a mounted secret holding the password; takes effect when no
    /// inline password is set.
    password_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Tls {
    #[serde(default)]
    insecure_skip_verify: bool,
    ca_cert_path: Option<String>,
    cert_path: Option<String>,
    key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RoutingRule {
    matcher: Vec<String>,
    topic: Option<String>,
    partition: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub sink_type: SinkType,
}

#[derive(Debug, Clone)]
pub enum SinkType {
    KafkaSchema(Box<KafkaSchemaSinkConfig>),
}

impl SinkConfig {
    /// Decodes and validates a base64-encoded JSON spec object. Fails closed;
    /// nothing is created from a spec that does not validate.
    pub fn load(encoded: String) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| Error::Config(format!("Failed to decode sink spec: {e}")))?;
        let spec: SchemaSinkSpec = serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("Failed to parse sink spec: {e}")))?;
        SinkConfig::try_from(spec)
    }
}

impl TryFrom<SchemaSinkSpec> for SinkConfig {
    type Error = Error;

    fn try_from(spec: SchemaSinkSpec) -> Result<Self> {
        let Some(kafka) = spec.kafka else {
            return Err(Error::Config("Sink type not found".to_string()));
        };
        Ok(SinkConfig {
            sink_type: kafka.try_into()?,
        })
    }
}

impl TryFrom<Box<KafkaSink>> for SinkType {
    type Error = Error;

    fn try_from(kafka: Box<KafkaSink>) -> Result<Self> {
        let Some(brokers) = kafka.brokers else {
            return Err(Error::Config(
                "Brokers must be specified in the Kafka sink config".to_string(),
            ));
        };
        if brokers.is_empty() {
            return Err(Error::Config(
                "At-least 1 broker URL must be specified in Kafka sink config".to_string(),
            ));
        }

        let (auth, tls) = parse_kafka_auth_config(kafka.sasl, kafka.tls)?;

        Ok(SinkType::KafkaSchema(Box::new(KafkaSchemaSinkConfig {
            brokers,
            topic: kafka.topic,
            format: kafka.format,
            auth,
            tls,
            partition_count: kafka.partition_count,
            replication_factor: kafka.replication_factor,
            max_message_bytes: kafka.max_message_bytes,
            request_timeout: kafka.request_timeout_ms.map(Duration::from_millis),
            routing_rules: kafka
                .routing_rules
                .unwrap_or_default()
                .into_iter()
                .map(|rule| RoutingRuleConfig {
                    matcher: rule.matcher,
                    topic: rule.topic,
                    partition: rule.partition,
                })
                .collect(),
            kafka_raw_config: parse_raw_config(kafka.config.unwrap_or_default()),
        })))
    }
}

// config is a multiline string with key: value pairs.
// Eg:
//  max.poll.interval.ms: 100
//  socket.timeout.ms: 10000
fn parse_raw_config(config: String) -> HashMap<String, String> {
    config
        .trim()
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, value)| !key.is_empty() && !value.is_empty())
        .collect()
}

fn parse_kafka_auth_config(
    sasl: Option<Sasl>,
    tls: Option<Tls>,
) -> Result<(Option<KafkaSaslAuth>, Option<TlsConfig>)> {
    let auth = match sasl {
        Some(sasl) => {
            let password = read_sasl_password(&sasl)?;
            let username = sasl.username;
            Some(match sasl.mechanism.to_uppercase().as_str() {
                "PLAIN" => KafkaSaslAuth::Plain { username, password },
                "SCRAM-SHA-256" => KafkaSaslAuth::ScramSha256 { username, password },
                "SCRAM-SHA-512" => KafkaSaslAuth::ScramSha512 { username, password },
                mechanism => {
                    return Err(Error::Config(format!(
                        "Unsupported SASL mechanism {mechanism} in the Kafka sink configuration"
                    )));
                }
            })
        }
        None => None,
    };

    let tls = match tls {
        Some(tls) => {
            let client_auth = match (tls.cert_path, tls.key_path) {
                (Some(client_cert), Some(client_cert_private_key)) => Some(TlsClientAuthCerts {
                    client_cert,
                    client_cert_private_key,
                }),
                (None, None) => None,
                _ => {
                    return Err(Error::Config(
                        "Both certPath and keyPath must be provided for TLS client authentication"
                            .to_string(),
                    ));
                }
            };
            Some(TlsConfig {
                insecure_skip_verify: tls.insecure_skip_verify,
                ca_cert: tls.ca_cert_path,
                client_auth,
            })
        }
        None => None,
    };

    Ok((auth, tls))
}

fn read_sasl_password(sasl: &Sasl) -> Result<String> {
    if let Some(password) = &sasl.password {
        return Ok(password.clone());
    }
    if let Some(path) = &sasl.password_path {
        return std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| Error::Config(format!("Failed to read SASL password from {path}: {e}")));
    }
    Err(Error::Config(
        "Authentication configuration is enabled, however credentials are not provided in the Kafka sink configuration"
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SECRET_BASE_PATH: &str = "/tmp/driftflow";

    fn setup_secret(name: &str, value: &str) -> String {
        std::fs::create_dir_all(SECRET_BASE_PATH).unwrap();
        let path = format!("{SECRET_BASE_PATH}/{name}");
        std::fs::write(&path, value).unwrap();
        path
    }

    fn cleanup_secret(path: &str) {
        if std::path::Path::new(path).exists() {
            std::fs::remove_file(path).unwrap();
        }
    }

    fn encode(spec: serde_json::Value) -> String {
        BASE64_STANDARD.encode(spec.to_string())
    }

    #[test]
    fn test_load_minimal_kafka_spec() {
        let config = SinkConfig::load(encode(json!({
            "kafka": {
                "brokers": ["localhost:9092"],
                "topic": "schema-events"
            }
        })))
        .unwrap();
        let SinkType::KafkaSchema(kafka) = config.sink_type;
        assert_eq!(kafka.brokers, vec!["localhost:9092".to_string()]);
        assert_eq!(kafka.topic, "schema-events");
        assert_eq!(kafka.format, None);
        assert!(kafka.auth.is_none());
        assert!(kafka.tls.is_none());
        assert!(kafka.routing_rules.is_empty());
        assert!(kafka.kafka_raw_config.is_empty());
    }

    #[test]
    fn test_load_full_kafka_spec() {
        let config = SinkConfig::load(encode(json!({
            "kafka": {
                "brokers": ["kafka-0:9092", "kafka-1:9092"],
                "topic": "schema-events",
                "format": "json",
                "partitionCount": 3,
                "replicationFactor": 2,
                "maxMessageBytes": 1048576,
                "requestTimeoutMs": 5000,
                "routingRules": [
                    {"matcher": ["inventory.*"], "topic": "{schema}-events", "partition": "table"}
                ],
                "config": "max.poll.interval.ms: 100\nsocket.timeout.ms: 10000"
            }
        })))
        .unwrap();
        let SinkType::KafkaSchema(kafka) = config.sink_type;
        assert_eq!(kafka.partition_count, Some(3));
        assert_eq!(kafka.replication_factor, Some(2));
        assert_eq!(kafka.max_message_bytes, Some(1048576));
        assert_eq!(kafka.request_timeout, Some(Duration::from_millis(5000)));
        assert_eq!(kafka.routing_rules.len(), 1);
        assert_eq!(
            kafka.routing_rules.first().unwrap().matcher,
            vec!["inventory.*".to_string()]
        );
        assert_eq!(
            kafka.kafka_raw_config.get("max.poll.interval.ms"),
            Some(&"100".to_string())
        );
        assert_eq!(
            kafka.kafka_raw_config.get("socket.timeout.ms"),
            Some(&"10000".to_string())
        );
    }

    #[test]
    fn test_load_rejects_missing_sink_type() {
        let err = SinkConfig::load(encode(json!({}))).unwrap_err();
        assert_eq!(err.to_string(), "Config Error - Sink type not found");
    }

    #[test]
    fn test_load_rejects_missing_brokers() {
        let err = SinkConfig::load(encode(json!({
            "kafka": {"topic": "schema-events"}
        })))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Config Error - Brokers must be specified in the Kafka sink config"
        );
    }

    #[test]
    fn test_load_rejects_empty_brokers() {
        let err = SinkConfig::load(encode(json!({
            "kafka": {"brokers": [], "topic": "schema-events"}
        })))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Config Error - At-least 1 broker URL must be specified in Kafka sink config"
        );
    }

    #[test]
    fn test_load_rejects_undecodable_spec() {
        let err = SinkConfig::load("not-base64!".to_string()).unwrap_err();
        assert!(err.to_string().contains("Failed to decode sink spec"));

        let err = SinkConfig::load(BASE64_STANDARD.encode("not json")).unwrap_err();
        assert!(err.to_string().contains("Failed to parse sink spec"));
    }

    #[test]
    fn test_sasl_with_inline_password() {
        let config = SinkConfig::load(encode(json!({
            "kafka": {
                "brokers": ["localhost:9092"],
                "topic": "schema-events",
                "sasl": {"mechanism": "SCRAM-SHA-512", "username": "user", "password": "pass"}
            }
        })))
        .unwrap();
        let SinkType::KafkaSchema(kafka) = config.sink_type;
        assert_eq!(
            kafka.auth,
            Some(KafkaSaslAuth::ScramSha512 {
                username: "user".to_string(),
                password: "pass".to_string()
            })
        );
    }

    #[test]
    fn test_sasl_with_password_file() {
        let path = setup_secret("test_sasl_with_password_file", "secret-pass\n");
        let config = SinkConfig::load(encode(json!({
            "kafka": {
                "brokers": ["localhost:9092"],
                "topic": "schema-events",
                "sasl": {"mechanism": "plain", "username": "user", "passwordPath": path}
            }
        })))
        .unwrap();
        let SinkType::KafkaSchema(kafka) = config.sink_type;
        assert_eq!(
            kafka.auth,
            Some(KafkaSaslAuth::Plain {
                username: "user".to_string(),
                password: "secret-pass".to_string()
            })
        );
        cleanup_secret(&path);
    }

    #[test]
    fn test_sasl_without_credentials() {
        let err = SinkConfig::load(encode(json!({
            "kafka": {
                "brokers": ["localhost:9092"],
                "topic": "schema-events",
                "sasl": {"mechanism": "PLAIN", "username": "user"}
            }
        })))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Config Error - Authentication configuration is enabled, however credentials are not provided in the Kafka sink configuration"
        );
    }

    #[test]
    fn test_sasl_with_missing_password_file() {
        let err = SinkConfig::load(encode(json!({
            "kafka": {
                "brokers": ["localhost:9092"],
                "topic": "schema-events",
                "sasl": {
                    "mechanism": "PLAIN",
                    "username": "user",
                    "passwordPath": "/tmp/driftflow/does-not-exist"
                }
            }
        })))
        .unwrap_err();
        assert!(err.to_string().contains("Failed to read SASL password"));
    }

    #[test]
    fn test_sasl_with_unsupported_mechanism() {
        let err = SinkConfig::load(encode(json!({
            "kafka": {
                "brokers": ["localhost:9092"],
                "topic": "schema-events",
                "sasl": {"mechanism": "GSSAPI", "username": "user", "password": "pass"}
            }
        })))
        .unwrap_err();
        assert!(err.to_string().contains("Unsupported SASL mechanism"));
    }

    #[test]
    fn test_tls_client_auth_requires_both_paths() {
        let err = SinkConfig::load(encode(json!({
            "kafka": {
                "brokers": ["localhost:9092"],
                "topic": "schema-events",
                "tls": {"certPath": "/etc/ssl/client.pem"}
            }
        })))
        .unwrap_err();
        assert!(err.to_string().contains("certPath and keyPath"));
    }

    #[test]
    fn test_tls_settings_are_carried_over() {
        let config = SinkConfig::load(encode(json!({
            "kafka": {
                "brokers": ["localhost:9092"],
                "topic": "schema-events",
                "tls": {
                    "insecureSkipVerify": true,
                    "caCertPath": "/etc/ssl/ca.pem",
                    "certPath": "/etc/ssl/client.pem",
                    "keyPath": "/etc/ssl/client.key"
                }
            }
        })))
        .unwrap();
        let SinkType::KafkaSchema(kafka) = config.sink_type;
        assert_eq!(
            kafka.tls,
            Some(TlsConfig {
                insecure_skip_verify: true,
                ca_cert: Some("/etc/ssl/ca.pem".to_string()),
                client_auth: Some(TlsClientAuthCerts {
                    client_cert: "/etc/ssl/client.pem".to_string(),
                    client_cert_private_key: "/etc/ssl/client.key".to_string()
                })
            })
        );
    }

    #[test]
    fn test_parse_raw_config_skips_malformed_lines() {
        let parsed = parse_raw_config(
            "  max.poll.interval.ms: 100\nnot-a-pair\n : no-key\nqueue.buffering.max.ms: 10000  "
                .to_string(),
        );
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("max.poll.interval.ms"), Some(&"100".to_string()));
        assert_eq!(
            parsed.get("queue.buffering.max.ms"),
            Some(&"10000".to_string())
        );
    }
}
