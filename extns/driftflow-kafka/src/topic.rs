//! Control-plane access: the cluster admin handle, destination-topic
//! adjustment, and idempotent topic provisioning.

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::schema_sink::{ConnectionOptions, build_client_config};
use crate::{Error, Result};

/// Topic creation is asynchronous on the broker; metadata is polled at this
/// cadence until the new topic shows up.
const CREATE_VISIBILITY_ATTEMPTS: u32 = 10;
const CREATE_VISIBILITY_INTERVAL: Duration = Duration::from_millis(500);

/// Desired settings for a destination topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i16,
}

/// A connection to the cluster control plane, used for metadata queries and
/// topic management. Exactly one live instance per sink; the owner must call
/// [`AdminHandle::close`] on every failure path until the assembled sink
/// takes over.
#[trait_variant::make(AdminHandle: Send)]
pub trait LocalAdminHandle {
    /// Partition count of the topic, `None` when the topic does not exist.
    async fn topic_partitions(&self, topic: &str) -> Result<Option<i32>>;

    /// Creates the topic. A "topic already exists" response from the broker
    /// is success, so idempotent retries are safe.
    async fn create_topic(&self, spec: &TopicSpec) -> Result<()>;

    /// Releases the underlying control-plane connection.
    async fn close(self);
}

/// Production [`AdminHandle`] backed by the rdkafka admin client. Owns its
/// own network connection, separate from the publishing client's.
pub struct KafkaAdmin {
    client: AdminClient<DefaultClientContext>,
    request_timeout: Duration,
    servers: String,
}

impl KafkaAdmin {
    pub(crate) fn connect(options: &ConnectionOptions) -> Result<Self> {
        let servers = options.brokers.join(",");
        let client = build_client_config(options)
            .create()
            .map_err(|e| Error::Connection {
                server: servers.clone(),
                error: e.to_string(),
            })?;
        Ok(KafkaAdmin {
            client,
            request_timeout: options.request_timeout,
            servers,
        })
    }
}

impl AdminHandle for KafkaAdmin {
    async fn topic_partitions(&self, topic: &str) -> Result<Option<i32>> {
        // Fetch metadata for all topics and search. Asking the broker about
        // one specific topic can auto-create it when auto.create.topics.enable
        // is on, with the broker-default partition count.
        let metadata = self
            .client
            .inner()
            .fetch_metadata(None, self.request_timeout)
            .map_err(|e| Error::Connection {
                server: self.servers.clone(),
                error: e.to_string(),
            })?;
        Ok(metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .map(|t| t.partitions().len() as i32))
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<()> {
        let new_topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor as i32),
        );
        let admin_opts = AdminOptions::new().operation_timeout(Some(self.request_timeout));
        let results = self
            .client
            .create_topics(&[new_topic], &admin_opts)
            .await
            .map_err(|e| Error::Kafka(format!("Failed to create topic {}: {}", spec.name, e)))?;
        for result in results {
            match result {
                Ok(_) => {}
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %spec.name, "Topic already exists");
                }
                Err((name, code)) => {
                    return Err(Error::Kafka(format!("Failed to create topic {name}: {code}")));
                }
            }
        }
        Ok(())
    }

    async fn close(self) {
        debug!(servers = %self.servers, "Closing Kafka admin client");
        drop(self.client);
    }
}

/// Reconciles the desired topic settings against what the cluster reports.
///
/// A partition count that was explicitly configured must match the existing
/// topic exactly; when it was left unset, the existing count is adopted into
/// the options. An absent topic is left alone, the provisioner creates it
/// later with the desired settings. Re-running against an already-consistent
/// topic is a no-op.
pub(crate) async fn adjust_topic_settings<A: AdminHandle>(
    admin: &A,
    options: &mut ConnectionOptions,
    topic: &str,
) -> Result<()> {
    let Some(actual) = admin.topic_partitions(topic).await? else {
        return Ok(());
    };
    match options.partition_count {
        Some(want) if want != actual => Err(Error::TopicConfigMismatch(format!(
            "topic {topic} has {actual} partitions, but {want} were requested"
        ))),
        _ => {
            options.partition_count = Some(actual);
            Ok(())
        }
    }
}

/// Ensures destination topics exist and tracks their partition counts for
/// publish-time lookups. Created only after the primary destination topic is
/// confirmed or created; borrows the admin handle per operation instead of
/// owning it.
#[derive(Debug)]
pub struct TopicProvisioner {
    spec: TopicSpec,
    partitions: HashMap<String, i32>,
}

impl TopicProvisioner {
    /// Binds to the destination topic, creating it when absent. An existing
    /// topic whose partition count differs from the requested one fails with
    /// a config mismatch.
    pub(crate) async fn ensure<A: AdminHandle>(spec: TopicSpec, admin: &A) -> Result<Self> {
        let partitions = ensure_topic(admin, &spec, true).await?;
        let cache = HashMap::from([(spec.name.clone(), partitions)]);
        Ok(TopicProvisioner {
            spec,
            partitions: cache,
        })
    }

    pub fn destination(&self) -> &TopicSpec {
        &self.spec
    }

    /// Partition count of the topic, ensuring it on first use. Routed topics
    /// other than the primary destination adopt whatever partition count they
    /// already have and are created with the destination's settings when
    /// absent.
    pub(crate) async fn partitions_for<A: AdminHandle>(
        &mut self,
        topic: &str,
        admin: &A,
    ) -> Result<i32> {
        if let Some(&count) = self.partitions.get(topic) {
            return Ok(count);
        }
        let spec = TopicSpec {
            name: topic.to_string(),
            ..self.spec.clone()
        };
        let count = ensure_topic(admin, &spec, false).await?;
        self.partitions.insert(topic.to_string(), count);
        Ok(count)
    }
}

async fn ensure_topic<A: AdminHandle>(admin: &A, spec: &TopicSpec, strict: bool) -> Result<i32> {
    if let Some(actual) = admin.topic_partitions(&spec.name).await? {
        if strict && actual != spec.partitions {
            return Err(Error::TopicConfigMismatch(format!(
                "topic {} has {} partitions, but {} were requested",
                spec.name, actual, spec.partitions
            )));
        }
        return Ok(actual);
    }

    admin.create_topic(spec).await?;
    info!(
        topic = %spec.name,
        partitions = spec.partitions,
        replication_factor = spec.replication_factor,
        "Created topic"
    );

    for _ in 0..CREATE_VISIBILITY_ATTEMPTS {
        if let Some(actual) = admin.topic_partitions(&spec.name).await? {
            return Ok(actual);
        }
        sleep(CREATE_VISIBILITY_INTERVAL).await;
    }
    Err(Error::Kafka(format!(
        "topic {} did not become visible after creation",
        spec.name
    )))
}
