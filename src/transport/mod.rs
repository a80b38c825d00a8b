//! Transport abstraction: publisher, subscriber and admin capabilities, plus
//! the builder that picks an engine.

pub mod config;
#[cfg(feature = "transport-kafka")]
pub mod kafka;
#[cfg(any(test, feature = "transport-mock"))]
pub mod mock;

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Engine {
    Kafka,
    #[cfg(any(test, feature = "transport-mock"))]
    Mock,
}

#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    pub params: BTreeMap<String, String>,
}

impl ConnectOptions {
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("publish: {0}")]
    Publish(String),
    #[error("subscribe: {0}")]
    Subscribe(String),
    #[error("read: {0}")]
    Read(String),
    #[error("admin: {0}")]
    Admin(String),
    #[error("unknown topic {0}")]
    UnknownTopic(String),
    #[error("topic {topic} has no partition {partition}")]
    InvalidPartition { topic: String, partition: i32 },
    #[error("timeout")]
    Timeout,
    #[error("disconnected")]
    Disconnected,
}

/// Where a message lands within its topic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PartitionSelector {
    /// The transport picks the partition from the message key.
    #[default]
    Any,
    Partition(i32),
}

impl From<Option<i32>> for PartitionSelector {
    fn from(p: Option<i32>) -> Self {
        p.map_or(Self::Any, Self::Partition)
    }
}

/// A message read back from a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

/// Final outcome of one enqueued message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: i32,
    /// Position in the partition log; `None` when delivery failed.
    pub offset: Option<i64>,
    pub error: Option<String>,
}

impl DeliveryReport {
    pub fn delivered(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset: Some(offset),
            error: None,
        }
    }

    pub fn failed(topic: impl Into<String>, partition: i32, error: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset: None,
            error: Some(error.into()),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.error.is_none()
    }
}

/// Copies delivery reports to every live listener. Reports emitted while
/// nobody listens are dropped.
#[derive(Default)]
pub struct DeliveryReports {
    listeners: Mutex<Vec<flume::Sender<DeliveryReport>>>,
}

impl DeliveryReports {
    pub fn listen(&self) -> flume::Receiver<DeliveryReport> {
        let (tx, rx) = flume::unbounded();
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn emit(&self, report: DeliveryReport) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|tx| tx.send(report.clone()).is_ok());
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication: i32,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: 1,
            replication: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicStatus {
    Created,
    AlreadyExists,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicResult {
    pub name: String,
    pub status: Result<TopicStatus, TransportError>,
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Shared producer handle; safe to use from many tasks at once.
    async fn publisher(&self) -> Result<Arc<dyn Publisher>, TransportError>;
    async fn subscriber(&self, group_id: &str) -> Result<Box<dyn Subscriber>, TransportError>;
    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<Vec<TopicResult>, TransportError>;
    async fn shutdown(&self) -> Result<(), TransportError>;
    async fn health_check(&self) -> Result<(), TransportError>;
}

#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    /// Queues one message for asynchronous delivery. May wait while the local
    /// queue is full; returns once the message is queued, not delivered.
    async fn enqueue(
        &self,
        topic: &str,
        partition: PartitionSelector,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), TransportError>;

    /// Waits up to `timeout` for queued messages to be delivered and returns
    /// how many were still outstanding when it gave up.
    async fn flush(&self, timeout: Duration) -> usize;

    fn in_flight(&self) -> usize;

    /// Stream of outcomes for messages enqueued after the call.
    fn delivery_reports(&self) -> flume::Receiver<DeliveryReport>;
}

#[async_trait::async_trait]
pub trait Subscriber: Send {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), TransportError>;
    /// Blocks for the next message; `None` waits forever.
    async fn read(&mut self, timeout: Option<Duration>) -> Result<Delivery, TransportError>;
}

pub struct TransportBuilder;

impl TransportBuilder {
    pub async fn connect(
        engine: Engine,
        opts: ConnectOptions,
    ) -> Result<Box<dyn Transport>, TransportError> {
        match engine {
            Engine::Kafka => {
                #[cfg(feature = "transport-kafka")]
                {
                    crate::transport::kafka::connect(opts).await
                }
                #[cfg(not(feature = "transport-kafka"))]
                {
                    let _ = opts;
                    Err(TransportError::Connect("kafka feature disabled".into()))
                }
            }
            #[cfg(any(test, feature = "transport-mock"))]
            Engine::Mock => crate::transport::mock::connect(opts).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_reach_every_live_listener() {
        let reports = DeliveryReports::default();
        reports.emit(DeliveryReport::delivered("t", 0, 0));
        let a = reports.listen();
        let b = reports.listen();
        reports.emit(DeliveryReport::delivered("t", 0, 1));
        drop(b);
        reports.emit(DeliveryReport::failed("t", 1, "broker down"));

        let seen: Vec<DeliveryReport> = a.try_iter().collect();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].offset, Some(1));
        assert!(!seen[1].is_delivered());
        assert_eq!(reports.listeners.lock().unwrap().len(), 1);
    }
}
