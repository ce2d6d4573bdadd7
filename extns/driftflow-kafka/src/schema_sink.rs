//! The schema sink and its initialization sequence.
//!
//! Initialization acquires several independently-fallible handles in a fixed
//! order: admin client, publishing client, publisher, topic provisioner,
//! event router, encoder config. Each stage's failure closes exactly the
//! handles acquired before it and returns the stage's error; a successful run
//! hands every handle to the returned [`SchemaSink`], whose `close` owns
//! teardown from then on.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{StreamExt, stream::FuturesUnordered};
use rdkafka::ClientConfig;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::encoding::{EncodingConfig, WireFormat};
use crate::router::{EventRouter, PartitionDispatch, RoutingRuleConfig};
use crate::topic::{AdminHandle, KafkaAdmin, TopicProvisioner, TopicSpec, adjust_topic_settings};
use crate::{Error, KafkaSaslAuth, Result, SchemaChangeEvent, TlsConfig, update_auth_config};

const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
const MAX_MESSAGE_BYTES_CEILING: usize = 100 * 1024 * 1024;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PARTITION_COUNT: i32 = 1;
const DEFAULT_REPLICATION_FACTOR: i16 = 1;
const MAX_TOPIC_NAME_LENGTH: usize = 249;
const CLIENT_ID: &str = "driftflow-schema-sink";

const STAGE_CREATE_ADMIN: &str = "creating the Kafka admin client";
const STAGE_ADJUST_TOPIC: &str = "adjusting destination topic settings";
const STAGE_CREATE_CLIENT: &str = "creating the Kafka publishing client";
const STAGE_CREATE_PUBLISHER: &str = "creating the schema sink publisher";
const STAGE_ENSURE_TOPIC: &str = "provisioning the destination topic";

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSchemaSinkConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    /// Wire format name, `json` when unset.
    pub format: Option<String>,
    pub auth: Option<KafkaSaslAuth>,
    pub tls: Option<TlsConfig>,
    /// Desired partition count when the destination topic has to be created.
    /// When set, an existing topic with a different count is a config
    /// mismatch.
    pub partition_count: Option<i32>,
    pub replication_factor: Option<i16>,
    pub max_message_bytes: Option<usize>,
    pub request_timeout: Option<Duration>,
    pub routing_rules: Vec<RoutingRuleConfig>,
    /// Raw librdkafka overrides applied on top of the derived client config.
    pub kafka_raw_config: HashMap<String, String>,
}

/// Derives the destination topic name from the sink config. Pure; no side
/// effects.
pub(crate) fn resolve_topic(config: &KafkaSchemaSinkConfig) -> Result<String> {
    let topic = config.topic.trim();
    if topic.is_empty() {
        return Err(Error::InvalidDestination(
            "topic name must not be empty".to_string(),
        ));
    }
    if topic.len() > MAX_TOPIC_NAME_LENGTH {
        return Err(Error::InvalidDestination(format!(
            "topic name exceeds {MAX_TOPIC_NAME_LENGTH} characters"
        )));
    }
    if !topic
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::InvalidDestination(format!(
            "topic name {topic} contains characters outside [a-zA-Z0-9._-]"
        )));
    }
    Ok(topic.to_string())
}

/// Resolves the configured wire-format name. Pure; no side effects.
pub(crate) fn resolve_wire_format(config: &KafkaSchemaSinkConfig) -> Result<WireFormat> {
    match config.format.as_deref() {
        None => Ok(WireFormat::Json),
        Some(name) => WireFormat::parse(name)
            .ok_or_else(|| Error::InvalidDestination(format!("unrecognized wire format {name}"))),
    }
}

/// Validated connection settings shared by the admin and publishing clients.
/// Must resolve successfully before any client is created.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    pub brokers: Vec<String>,
    pub auth: Option<KafkaSaslAuth>,
    pub tls: Option<TlsConfig>,
    pub request_timeout: Duration,
    pub max_message_bytes: usize,
    pub partition_count: Option<i32>,
    pub replication_factor: i16,
    pub kafka_raw_config: HashMap<String, String>,
}

impl ConnectionOptions {
    /// Validates the sink config into connection options. No network I/O;
    /// fails closed without creating anything.
    pub(crate) fn resolve(config: &KafkaSchemaSinkConfig) -> Result<Self> {
        if config.brokers.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one broker endpoint must be specified".to_string(),
            ));
        }
        for broker in &config.brokers {
            validate_broker_endpoint(broker)?;
        }

        let max_message_bytes = config.max_message_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);
        if max_message_bytes == 0 || max_message_bytes > MAX_MESSAGE_BYTES_CEILING {
            return Err(Error::InvalidConfig(format!(
                "max message bytes {max_message_bytes} is out of range (1..={MAX_MESSAGE_BYTES_CEILING})"
            )));
        }
        if let Some(partitions) = config.partition_count {
            if partitions <= 0 {
                return Err(Error::InvalidConfig(format!(
                    "partition count must be positive, got {partitions}"
                )));
            }
        }
        if let Some(replication_factor) = config.replication_factor {
            if replication_factor <= 0 {
                return Err(Error::InvalidConfig(format!(
                    "replication factor must be positive, got {replication_factor}"
                )));
            }
        }
        let request_timeout = config.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        if request_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "request timeout must not be zero".to_string(),
            ));
        }

        Ok(ConnectionOptions {
            brokers: config.brokers.clone(),
            auth: config.auth.clone(),
            tls: config.tls.clone(),
            request_timeout,
            max_message_bytes,
            partition_count: config.partition_count,
            replication_factor: config
                .replication_factor
                .unwrap_or(DEFAULT_REPLICATION_FACTOR),
            kafka_raw_config: config.kafka_raw_config.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(brokers: Vec<String>) -> Self {
        ConnectionOptions {
            brokers,
            auth: None,
            tls: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            partition_count: None,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            kafka_raw_config: HashMap::new(),
        }
    }
}

fn validate_broker_endpoint(endpoint: &str) -> Result<()> {
    let (host, port) = match endpoint.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (endpoint, None),
    };
    if host.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "broker endpoint {endpoint} has an empty host"
        )));
    }
    if let Some(port) = port {
        match port.parse::<u16>() {
            Ok(port) if port != 0 => {}
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "broker endpoint {endpoint} has an invalid port"
                )));
            }
        }
    }
    Ok(())
}

/// Derives the low-level librdkafka client config from the validated options.
pub(crate) fn build_client_config(options: &ConnectionOptions) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", options.brokers.join(","))
        .set("client.id", CLIENT_ID)
        .set("message.max.bytes", options.max_message_bytes.to_string())
        .set(
            "request.timeout.ms",
            options.request_timeout.as_millis().to_string(),
        )
        .set_log_level(RDKafkaLogLevel::Warning);
    update_auth_config(&mut client_config, options.tls.clone(), options.auth.clone());
    for (key, value) in &options.kafka_raw_config {
        client_config.set(key.as_str(), value.as_str());
    }
    client_config
}

/// A connected publishing client. Only its lifecycle lives here; once a
/// publisher adopts it, closing the publisher is the sole way to release it.
#[trait_variant::make(PublishClient: Send)]
pub trait LocalPublishClient {
    async fn close(self);
}

/// The object schema events are sent through. Owns the publishing client it
/// was built from.
#[trait_variant::make(SchemaPublisher: Send)]
pub trait LocalSchemaPublisher {
    /// Sends one payload to every partition of the topic, so each downstream
    /// consumer observes the schema change regardless of which partitions it
    /// reads.
    async fn broadcast(&self, topic: &str, partitions: i32, key: Bytes, payload: Bytes)
    -> Result<()>;

    /// Sends one payload, leaving partition placement to the key hash.
    async fn send_keyed(&self, topic: &str, key: Bytes, payload: Bytes) -> Result<()>;

    /// Flushes and releases the publisher together with its adopted client.
    async fn close(self);
}

/// Factories for the externally-supplied handles, injectable so the
/// initialization sequence can be exercised without a broker.
#[trait_variant::make(SinkFactory: Send)]
pub trait LocalSinkFactory {
    type Admin: AdminHandle;
    type Client: PublishClient;
    type Publisher: SchemaPublisher;

    async fn create_admin(&self, options: &ConnectionOptions) -> Result<Self::Admin>;

    async fn create_client(&self, options: &ConnectionOptions) -> Result<Self::Client>;

    /// Builds a publisher from the client. Ownership of the client transfers
    /// on success; on failure the never-adopted client is handed back so the
    /// caller can close it.
    async fn create_publisher(
        &self,
        client: Self::Client,
        admin: &Self::Admin,
    ) -> core::result::Result<Self::Publisher, (Self::Client, Error)>;
}

/// Production publishing client: a connected rdkafka producer, on its own
/// connection separate from the admin client's.
pub struct KafkaPublishClient {
    producer: FutureProducer,
    request_timeout: Duration,
    servers: String,
}

impl PublishClient for KafkaPublishClient {
    async fn close(self) {
        debug!(servers = %self.servers, "Releasing Kafka publishing client");
    }
}

pub struct KafkaSchemaPublisher {
    producer: FutureProducer,
    request_timeout: Duration,
}

impl SchemaPublisher for KafkaSchemaPublisher {
    async fn broadcast(
        &self,
        topic: &str,
        partitions: i32,
        key: Bytes,
        payload: Bytes,
    ) -> Result<()> {
        let mut send_futures = FuturesUnordered::new();
        for partition in 0..partitions {
            let key = key.clone();
            let payload = payload.clone();
            send_futures.push(async move {
                let record = FutureRecord::to(topic)
                    .partition(partition)
                    .key(key.as_ref())
                    .payload(payload.as_ref());
                self.producer.send(record, self.request_timeout).await
            });
        }
        while let Some(result) = send_futures.next().await {
            if let Err((e, _)) = result {
                return Err(Error::Kafka(format!(
                    "Sending schema event to topic {topic}: {e}"
                )));
            }
        }
        Ok(())
    }

    async fn send_keyed(&self, topic: &str, key: Bytes, payload: Bytes) -> Result<()> {
        let record = FutureRecord::to(topic)
            .key(key.as_ref())
            .payload(payload.as_ref());
        self.producer
            .send(record, self.request_timeout)
            .await
            .map(|_| ())
            .map_err(|(e, _)| Error::Kafka(format!("Sending schema event to topic {topic}: {e}")))
    }

    async fn close(self) {
        if let Err(e) = self.producer.flush(self.request_timeout) {
            warn!(error = %e, "Flushing Kafka producer during close");
        }
    }
}

/// Production factory wiring the rdkafka-backed handles together.
pub struct KafkaSinkFactory;

impl SinkFactory for KafkaSinkFactory {
    type Admin = KafkaAdmin;
    type Client = KafkaPublishClient;
    type Publisher = KafkaSchemaPublisher;

    async fn create_admin(&self, options: &ConnectionOptions) -> Result<KafkaAdmin> {
        KafkaAdmin::connect(options)
    }

    async fn create_client(&self, options: &ConnectionOptions) -> Result<KafkaPublishClient> {
        let servers = options.brokers.join(",");
        let producer: FutureProducer =
            build_client_config(options)
                .create()
                .map_err(|e| Error::Connection {
                    server: servers.clone(),
                    error: e.to_string(),
                })?;
        Ok(KafkaPublishClient {
            producer,
            request_timeout: options.request_timeout,
            servers,
        })
    }

    async fn create_publisher(
        &self,
        client: KafkaPublishClient,
        _admin: &KafkaAdmin,
    ) -> core::result::Result<KafkaSchemaPublisher, (KafkaPublishClient, Error)> {
        // Force a metadata round-trip so an unreachable cluster surfaces here
        // rather than on the first publish.
        if let Err(e) = client
            .producer
            .client()
            .fetch_metadata(None, client.request_timeout)
        {
            let error = Error::Connection {
                server: client.servers.clone(),
                error: e.to_string(),
            };
            return Err((client, error));
        }
        Ok(KafkaSchemaPublisher {
            producer: client.producer,
            request_timeout: client.request_timeout,
        })
    }
}

/// Creates a Kafka schema sink, verifying the config and acquiring every
/// handle the sink needs. On any failure the handles acquired so far are
/// closed before the error is returned.
pub async fn new_schema_sink(
    config: KafkaSchemaSinkConfig,
    cln_token: CancellationToken,
) -> Result<KafkaSchemaSink> {
    build_schema_sink(config, KafkaSinkFactory, cln_token).await
}

pub(crate) async fn build_schema_sink<F: SinkFactory>(
    config: KafkaSchemaSinkConfig,
    factory: F,
    cln_token: CancellationToken,
) -> Result<SchemaSink<F>> {
    // Pure resolution first: nothing is acquired yet, nothing to roll back.
    let topic = resolve_topic(&config)?;
    let mut options = ConnectionOptions::resolve(&config)?;

    let admin = run_stage(
        &cln_token,
        STAGE_CREATE_ADMIN,
        factory.create_admin(&options),
    )
    .await?;

    // The admin client owns a connection now; every failure below must close
    // it exactly once before returning.
    if let Err(e) = run_stage(
        &cln_token,
        STAGE_ADJUST_TOPIC,
        adjust_topic_settings(&admin, &mut options, &topic),
    )
    .await
    {
        admin.close().await;
        return Err(e);
    }

    let format = match resolve_wire_format(&config) {
        Ok(format) => format,
        Err(e) => {
            admin.close().await;
            return Err(e);
        }
    };

    let client = match run_stage(
        &cln_token,
        STAGE_CREATE_CLIENT,
        factory.create_client(&options),
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            admin.close().await;
            return Err(e);
        }
    };

    info!(brokers = ?options.brokers, topic = %topic, "Creating schema sink publisher");
    let start = Instant::now();
    let publisher = tokio::select! {
        _ = cln_token.cancelled() => {
            // The dropped factory future releases the client it owned.
            error!(stage = STAGE_CREATE_PUBLISHER, "Schema sink initialization cancelled");
            admin.close().await;
            return Err(Error::Cancelled(STAGE_CREATE_PUBLISHER));
        }
        res = factory.create_publisher(client, &admin) => match res {
            Ok(publisher) => publisher,
            Err((client, e)) => {
                error!(stage = STAGE_CREATE_PUBLISHER, error = %e, "Schema sink initialization stage failed");
                PublishClient::close(client).await;
                admin.close().await;
                return Err(e);
            }
        },
    };
    info!(elapsed = ?start.elapsed(), "Schema sink publisher created");

    let spec = TopicSpec {
        name: topic.clone(),
        partitions: options.partition_count.unwrap_or(DEFAULT_PARTITION_COUNT),
        replication_factor: options.replication_factor,
    };
    let provisioner = match run_stage(
        &cln_token,
        STAGE_ENSURE_TOPIC,
        TopicProvisioner::ensure(spec, &admin),
    )
    .await
    {
        Ok(provisioner) => provisioner,
        Err(e) => {
            SchemaPublisher::close(publisher).await;
            admin.close().await;
            return Err(e);
        }
    };

    let router = match EventRouter::new(&config.routing_rules, &topic) {
        Ok(router) => router,
        Err(e) => {
            SchemaPublisher::close(publisher).await;
            admin.close().await;
            return Err(e);
        }
    };

    let encoding = match EncodingConfig::build(format, &options) {
        Ok(encoding) => encoding,
        Err(e) => {
            SchemaPublisher::close(publisher).await;
            admin.close().await;
            return Err(e);
        }
    };

    info!(topic = %topic, "Schema sink ready");
    Ok(SchemaSink {
        publisher: Some(publisher),
        admin: Some(admin),
        provisioner,
        router,
        encoding,
    })
}

/// Races one initialization stage against the cancellation token. A cancelled
/// stage fails like any other so the caller runs the same compensating
/// closes; the dropped operation future releases anything it acquired.
async fn run_stage<T>(
    cln_token: &CancellationToken,
    stage: &'static str,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    let result = tokio::select! {
        _ = cln_token.cancelled() => Err(Error::Cancelled(stage)),
        result = operation => result,
    };
    if let Err(e) = &result {
        error!(stage, error = %e, "Schema sink initialization stage failed");
    }
    result
}

/// A fully assembled schema sink. Exclusively owns the publisher (and through
/// it the publishing client), the admin handle, the topic provisioner, the
/// event router, and the encoder config.
pub struct SchemaSink<F: SinkFactory> {
    publisher: Option<F::Publisher>,
    admin: Option<F::Admin>,
    provisioner: TopicProvisioner,
    router: EventRouter,
    encoding: EncodingConfig,
}

pub type KafkaSchemaSink = SchemaSink<KafkaSinkFactory>;

impl<F: SinkFactory> SchemaSink<F> {
    /// Publishes schema events in order. Broadcast-dispatched events go to
    /// every partition of their destination topic; keyed events are placed by
    /// the partitioner.
    pub async fn publish_events(&mut self, events: Vec<SchemaChangeEvent>) -> Result<()> {
        for event in events {
            self.publish_event(&event).await?;
        }
        Ok(())
    }

    async fn publish_event(&mut self, event: &SchemaChangeEvent) -> Result<()> {
        let (Some(publisher), Some(admin)) = (self.publisher.as_ref(), self.admin.as_ref()) else {
            return Err(Error::Other("schema sink is closed".to_string()));
        };
        let route = self.router.route(event);
        let (key, payload) = self.encoding.encode(event)?;
        match route.dispatch {
            PartitionDispatch::Broadcast => {
                let partitions = self.provisioner.partitions_for(&route.topic, admin).await?;
                SchemaPublisher::broadcast(publisher, &route.topic, partitions, key, payload)
                    .await?;
            }
            PartitionDispatch::Table => {
                self.provisioner.partitions_for(&route.topic, admin).await?;
                let key = route.partition_key.map(Bytes::from).unwrap_or(key);
                SchemaPublisher::send_keyed(publisher, &route.topic, key, payload).await?;
            }
        }
        debug!(schema = %event.schema, query = %event.query, "Published schema event");
        Ok(())
    }

    /// Closes owned resources in reverse-acquisition order: publisher (which
    /// releases its adopted client) first, then the admin handle. Idempotent;
    /// close failures are logged by the handles, never propagated.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(publisher) = self.publisher.take() {
            SchemaPublisher::close(publisher).await;
        }
        if let Some(admin) = self.admin.take() {
            admin.close().await;
        }
        Ok(())
    }
}
