//! Kafka backend over librdkafka (feature `transport-kafka`).
//!
//! Every `ConnectOptions` entry is passed through as a librdkafka property, so
//! `--connect linger.ms=5` tunes the producer directly.

use crate::transport::{
    ConnectOptions, Delivery, DeliveryReport, DeliveryReports, PartitionSelector, Publisher,
    Subscriber, TopicResult, TopicSpec, TopicStatus, Transport, TransportError,
};
use bytes::Bytes;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::{ClientContext, DefaultClientContext};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Back-off while librdkafka's local queue is full.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(1);
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Producer context that forwards librdkafka delivery callbacks.
#[derive(Default)]
struct DeliveryContext {
    reports: DeliveryReports,
}

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        let report = match result {
            Ok(msg) => DeliveryReport::delivered(msg.topic(), msg.partition(), msg.offset()),
            Err((e, msg)) => DeliveryReport::failed(msg.topic(), msg.partition(), e.to_string()),
        };
        self.reports.emit(report);
    }
}

pub struct KafkaTransport {
    opts: ConnectOptions,
    producer: Arc<ThreadedProducer<DeliveryContext>>,
    admin: AdminClient<DefaultClientContext>,
}

fn client_config(opts: &ConnectOptions) -> ClientConfig {
    let mut cfg = ClientConfig::new();
    for (k, v) in &opts.params {
        cfg.set(k, v);
    }
    cfg
}

/// Consumer properties: defaults first, then every non-producer option, so
/// `--connect auto.offset.reset=earliest` replays a topic from the start.
fn consumer_config(opts: &ConnectOptions, group_id: &str) -> ClientConfig {
    let mut cfg = ClientConfig::new();
    cfg.set("group.id", group_id)
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", "latest");
    for (k, v) in &opts.params {
        // producer-only properties make librdkafka warn on a consumer
        if k != "linger.ms" && k != "queue.buffering.max.messages" {
            cfg.set(k, v);
        }
    }
    cfg
}

pub async fn connect(opts: ConnectOptions) -> Result<Box<dyn Transport>, TransportError> {
    let producer: ThreadedProducer<DeliveryContext> = client_config(&opts)
        .create_with_context(DeliveryContext::default())
        .map_err(|e| TransportError::Connect(format!("producer: {}", e)))?;
    let admin: AdminClient<DefaultClientContext> = client_config(&opts)
        .create()
        .map_err(|e| TransportError::Connect(format!("admin client: {}", e)))?;
    debug!(bootstrap = ?opts.get("bootstrap.servers"), "kafka transport ready");
    Ok(Box::new(KafkaTransport {
        opts,
        producer: Arc::new(producer),
        admin,
    }))
}

#[async_trait::async_trait]
impl Transport for KafkaTransport {
    async fn publisher(&self) -> Result<Arc<dyn Publisher>, TransportError> {
        Ok(Arc::new(KafkaPublisher {
            producer: self.producer.clone(),
        }))
    }

    async fn subscriber(&self, group_id: &str) -> Result<Box<dyn Subscriber>, TransportError> {
        let consumer: StreamConsumer = consumer_config(&self.opts, group_id)
            .create()
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        Ok(Box::new(KafkaSubscriber { consumer }))
    }

    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<Vec<TopicResult>, TransportError> {
        let topics: Vec<NewTopic<'_>> = specs
            .iter()
            .map(|s| {
                NewTopic::new(
                    &s.name,
                    s.partitions,
                    TopicReplication::Fixed(s.replication),
                )
            })
            .collect();
        let results = self
            .admin
            .create_topics(topics.iter(), &AdminOptions::new())
            .await
            .map_err(|e| TransportError::Admin(e.to_string()))?;
        Ok(results
            .into_iter()
            .map(|r| match r {
                Ok(name) => TopicResult {
                    name,
                    status: Ok(TopicStatus::Created),
                },
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => TopicResult {
                    name,
                    status: Ok(TopicStatus::AlreadyExists),
                },
                Err((name, code)) => TopicResult {
                    name,
                    status: Err(TransportError::Admin(code.to_string())),
                },
            })
            .collect())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Duration::from_secs(5)))
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|_| ())
        })
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?
        .map_err(|e| TransportError::Connect(e.to_string()))
    }
}

struct KafkaPublisher {
    producer: Arc<ThreadedProducer<DeliveryContext>>,
}

#[async_trait::async_trait]
impl Publisher for KafkaPublisher {
    async fn enqueue(
        &self,
        topic: &str,
        partition: PartitionSelector,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), TransportError> {
        loop {
            let mut record = BaseRecord::<[u8], [u8]>::to(topic)
                .key(key.as_ref())
                .payload(value.as_ref());
            if let PartitionSelector::Partition(p) = partition {
                record = record.partition(p);
            }
            let sent = self.producer.send(record).map_err(|(e, _)| e);
            match sent {
                Ok(()) => return Ok(()),
                Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)) => {
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err(KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopic))
                | Err(KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition)) => {
                    return Err(TransportError::UnknownTopic(topic.to_string()));
                }
                Err(e) => return Err(TransportError::Publish(e.to_string())),
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> usize {
        let producer = self.producer.clone();
        // A timed-out flush is reported through the in-flight count.
        let _ = tokio::task::spawn_blocking(move || producer.flush(timeout)).await;
        self.in_flight()
    }

    fn in_flight(&self) -> usize {
        self.producer.in_flight_count().max(0) as usize
    }

    fn delivery_reports(&self) -> flume::Receiver<DeliveryReport> {
        self.producer.context().reports.listen()
    }
}

struct KafkaSubscriber {
    consumer: StreamConsumer,
}

impl KafkaSubscriber {
    async fn recv(&self) -> Result<Delivery, TransportError> {
        let msg = self
            .consumer
            .recv()
            .await
            .map_err(|e| TransportError::Read(e.to_string()))?;
        Ok(Delivery {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            key: msg.key().map(Bytes::copy_from_slice),
            value: Bytes::copy_from_slice(msg.payload().unwrap_or_default()),
        })
    }
}

#[async_trait::async_trait]
impl Subscriber for KafkaSubscriber {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), TransportError> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn read(&mut self, timeout: Option<Duration>) -> Result<Delivery, TransportError> {
        match timeout {
            Some(t) => tokio::time::timeout(t, self.recv())
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => self.recv().await,
        }
    }
}
