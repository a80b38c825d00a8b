//! In-memory partitioned broker (feature `transport-mock`).
//!
//! Enqueued messages sit in a local queue until a background task moves them
//! into the topic's partition log, optionally after `linger.ms`, so `flush`
//! has real outstanding work to wait for. Consumer groups are not modelled:
//! every subscriber sees every message delivered after it subscribed.

use crate::transport::{
    ConnectOptions, Delivery, DeliveryReport, DeliveryReports, PartitionSelector, Publisher,
    Subscriber, TopicResult, TopicSpec, TopicStatus, Transport, TransportError,
};
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Pending {
    topic: String,
    partition: i32,
    key: Bytes,
    value: Bytes,
    ready_at: Instant,
}

#[derive(Default)]
struct State {
    // topic -> partition -> (key, value) in delivery order
    topics: HashMap<String, Vec<Vec<(Bytes, Bytes)>>>,
    subscribers: HashMap<String, Vec<flume::Sender<Delivery>>>,
}

struct Broker {
    state: Mutex<State>,
    queue: flume::Sender<Pending>,
    queued: AtomicUsize,
    drained: Notify,
    reports: DeliveryReports,
    linger: Duration,
    round_robin: AtomicUsize,
}

impl Broker {
    fn start(linger: Duration, capacity: usize) -> Arc<Self> {
        let (queue, rx) = if capacity == 0 {
            flume::unbounded()
        } else {
            flume::bounded(capacity)
        };
        let broker = Arc::new(Self {
            state: Mutex::new(State::default()),
            queue,
            queued: AtomicUsize::new(0),
            drained: Notify::new(),
            reports: DeliveryReports::default(),
            linger,
            round_robin: AtomicUsize::new(0),
        });
        tokio::spawn(deliver_loop(Arc::downgrade(&broker), rx));
        broker
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn route(
        &self,
        topic: &str,
        selector: PartitionSelector,
        key: &Bytes,
    ) -> Result<i32, TransportError> {
        let state = self.state();
        let count = state
            .topics
            .get(topic)
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))?
            .len();
        match selector {
            PartitionSelector::Partition(p) if p >= 0 && (p as usize) < count => Ok(p),
            PartitionSelector::Partition(p) => Err(TransportError::InvalidPartition {
                topic: topic.to_string(),
                partition: p,
            }),
            PartitionSelector::Any if key.is_empty() => {
                Ok((self.round_robin.fetch_add(1, Ordering::Relaxed) % count) as i32)
            }
            PartitionSelector::Any => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                Ok((hasher.finish() % count as u64) as i32)
            }
        }
    }

    fn deliver(&self, p: Pending) {
        let mut state = self.state();
        let report = match state
            .topics
            .get_mut(&p.topic)
            .and_then(|parts| parts.get_mut(p.partition as usize))
        {
            Some(partition) => {
                partition.push((p.key.clone(), p.value.clone()));
                DeliveryReport::delivered(&p.topic, p.partition, partition.len() as i64 - 1)
            }
            None => DeliveryReport::failed(&p.topic, p.partition, "partition vanished"),
        };
        if report.is_delivered() {
            if let Some(subs) = state.subscribers.get_mut(&p.topic) {
                let delivery = Delivery {
                    topic: p.topic,
                    partition: p.partition,
                    key: Some(p.key),
                    value: p.value,
                };
                subs.retain(|tx| tx.send(delivery.clone()).is_ok());
            }
        }
        drop(state);
        // Emitted before the counter drops so a completed flush has every report.
        self.reports.emit(report);
        if self.queued.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

async fn deliver_loop(broker: Weak<Broker>, rx: flume::Receiver<Pending>) {
    while let Ok(pending) = rx.recv_async().await {
        tokio::time::sleep_until(pending.ready_at).await;
        let Some(broker) = broker.upgrade() else {
            break;
        };
        broker.deliver(pending);
    }
}

/// Handle to one in-memory broker; clones share it.
#[derive(Clone)]
pub struct MockTransport {
    broker: Arc<Broker>,
}

impl MockTransport {
    /// Must be called inside a tokio runtime; spawns the delivery task.
    pub fn new(linger: Duration, queue_capacity: usize) -> Self {
        Self {
            broker: Broker::start(linger, queue_capacity),
        }
    }

    /// Delivered `(key, value)` pairs of one partition, oldest first.
    pub fn messages(&self, topic: &str, partition: i32) -> Vec<(Bytes, Bytes)> {
        self.broker
            .state()
            .topics
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.broker.state().topics.get(topic).map(Vec::len)
    }
}

fn param<T: FromStr>(opts: &ConnectOptions, key: &str, default: T) -> Result<T, TransportError> {
    match opts.get(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| TransportError::Connect(format!("invalid {}: {}", key, v))),
    }
}

pub async fn connect(opts: ConnectOptions) -> Result<Box<dyn Transport>, TransportError> {
    let linger_ms: u64 = param(&opts, "linger.ms", 0)?;
    let capacity: usize = param(&opts, "queue.buffering.max.messages", 0)?;
    Ok(Box::new(MockTransport::new(
        Duration::from_millis(linger_ms),
        capacity,
    )))
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn publisher(&self) -> Result<Arc<dyn Publisher>, TransportError> {
        Ok(Arc::new(MockPublisher {
            broker: self.broker.clone(),
        }))
    }

    async fn subscriber(&self, _group_id: &str) -> Result<Box<dyn Subscriber>, TransportError> {
        let (tx, rx) = flume::unbounded();
        Ok(Box::new(MockSubscriber {
            broker: self.broker.clone(),
            tx,
            rx,
            topics: HashSet::new(),
        }))
    }

    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<Vec<TopicResult>, TransportError> {
        let mut state = self.broker.state();
        let results = specs
            .iter()
            .map(|spec| {
                let status = if spec.partitions < 1 {
                    Err(TransportError::Admin(format!(
                        "invalid partition count {}",
                        spec.partitions
                    )))
                } else if state.topics.contains_key(&spec.name) {
                    Ok(TopicStatus::AlreadyExists)
                } else {
                    state
                        .topics
                        .insert(spec.name.clone(), vec![Vec::new(); spec.partitions as usize]);
                    Ok(TopicStatus::Created)
                };
                TopicResult {
                    name: spec.name.clone(),
                    status,
                }
            })
            .collect();
        Ok(results)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct MockPublisher {
    broker: Arc<Broker>,
}

#[async_trait::async_trait]
impl Publisher for MockPublisher {
    async fn enqueue(
        &self,
        topic: &str,
        partition: PartitionSelector,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), TransportError> {
        let partition = self.broker.route(topic, partition, &key)?;
        self.broker.queued.fetch_add(1, Ordering::AcqRel);
        let pending = Pending {
            topic: topic.to_string(),
            partition,
            key,
            value,
            ready_at: Instant::now() + self.broker.linger,
        };
        if self.broker.queue.send_async(pending).await.is_err() {
            self.broker.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    async fn flush(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before reading the counter so a drain in between is not missed.
            let drained = self.broker.drained.notified();
            if self.broker.queued.load(Ordering::Acquire) == 0 {
                return 0;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                return self.broker.queued.load(Ordering::Acquire);
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.broker.queued.load(Ordering::Acquire)
    }

    fn delivery_reports(&self) -> flume::Receiver<DeliveryReport> {
        self.broker.reports.listen()
    }
}

struct MockSubscriber {
    broker: Arc<Broker>,
    tx: flume::Sender<Delivery>,
    rx: flume::Receiver<Delivery>,
    topics: HashSet<String>,
}

#[async_trait::async_trait]
impl Subscriber for MockSubscriber {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        for topic in topics {
            if self.topics.insert(topic.clone()) {
                state
                    .subscribers
                    .entry(topic.clone())
                    .or_default()
                    .push(self.tx.clone());
            }
        }
        Ok(())
    }

    async fn read(&mut self, timeout: Option<Duration>) -> Result<Delivery, TransportError> {
        if self.topics.is_empty() {
            return Err(TransportError::Subscribe("no active subscription".into()));
        }
        let next = self.rx.recv_async();
        match timeout {
            Some(t) => tokio::time::timeout(t, next)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::Disconnected),
            None => next.await.map_err(|_| TransportError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn with_topic(linger: Duration, partitions: i32) -> MockTransport {
        let t = MockTransport::new(linger, 0);
        let mut spec = TopicSpec::new("t");
        spec.partitions = partitions;
        t.create_topics(&[spec]).await.unwrap();
        t
    }

    #[tokio::test]
    async fn create_topics_reports_existing() {
        let t = with_topic(Duration::ZERO, 1).await;
        let res = t
            .create_topics(&[TopicSpec::new("t"), TopicSpec::new("u")])
            .await
            .unwrap();
        assert_eq!(res[0].status, Ok(TopicStatus::AlreadyExists));
        assert_eq!(res[1].status, Ok(TopicStatus::Created));

        let mut bad = TopicSpec::new("v");
        bad.partitions = 0;
        let res = t.create_topics(&[bad]).await.unwrap();
        assert!(res[0].status.is_err());
    }

    #[tokio::test]
    async fn unknown_topic_and_partition_are_rejected() {
        let t = with_topic(Duration::ZERO, 2).await;
        let p = t.publisher().await.unwrap();
        let err = p
            .enqueue("nope", PartitionSelector::Any, Bytes::from_static(b"k"), Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::UnknownTopic("nope".into()));
        let err = p
            .enqueue("t", PartitionSelector::Partition(2), Bytes::new(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidPartition { partition: 2, .. }));
        assert_eq!(p.in_flight(), 0);
    }

    #[tokio::test]
    async fn same_key_same_partition() {
        let t = with_topic(Duration::ZERO, 8).await;
        let p = t.publisher().await.unwrap();
        for i in 0..20u8 {
            p.enqueue("t", PartitionSelector::Any, Bytes::from_static(b"flow-a"), Bytes::from(vec![i]))
                .await
                .unwrap();
        }
        assert_eq!(p.flush(Duration::from_secs(5)).await, 0);
        let non_empty: Vec<i32> = (0..8).filter(|i| !t.messages("t", *i).is_empty()).collect();
        assert_eq!(non_empty.len(), 1);
        let values: Vec<u8> = t.messages("t", non_empty[0]).iter().map(|(_, v)| v[0]).collect();
        assert_eq!(values, (0..20).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn zero_flush_with_linger_leaves_everything_queued() {
        let t = with_topic(Duration::from_secs(60), 1).await;
        let p = t.publisher().await.unwrap();
        for _ in 0..7 {
            p.enqueue("t", PartitionSelector::Any, Bytes::from_static(b"k"), Bytes::new())
                .await
                .unwrap();
        }
        assert_eq!(p.flush(Duration::ZERO).await, 7);
        assert!(t.messages("t", 0).is_empty());
    }

    #[tokio::test]
    async fn flush_waits_for_linger() {
        let t = with_topic(Duration::from_millis(20), 1).await;
        let p = t.publisher().await.unwrap();
        p.enqueue("t", PartitionSelector::Partition(0), Bytes::new(), Bytes::from_static(b"v"))
            .await
            .unwrap();
        assert_eq!(p.flush(Duration::from_secs(5)).await, 0);
        assert_eq!(t.messages("t", 0).len(), 1);
    }

    #[tokio::test]
    async fn subscriber_reads_in_order() {
        let t = with_topic(Duration::ZERO, 1).await;
        let mut sub = t.subscriber("g").await.unwrap();
        assert!(matches!(
            sub.read(Some(Duration::from_millis(1))).await,
            Err(TransportError::Subscribe(_))
        ));
        sub.subscribe(&["t".to_string()]).await.unwrap();

        let p = t.publisher().await.unwrap();
        for i in 0..3u8 {
            p.enqueue("t", PartitionSelector::Any, Bytes::from_static(b"k"), Bytes::from(vec![i]))
                .await
                .unwrap();
        }
        for i in 0..3u8 {
            let d = sub.read(Some(Duration::from_secs(5))).await.unwrap();
            assert_eq!(d.topic, "t");
            assert_eq!(d.key.as_deref(), Some(&b"k"[..]));
            assert_eq!(d.value[0], i);
        }
        assert_eq!(
            sub.read(Some(Duration::from_millis(10))).await,
            Err(TransportError::Timeout)
        );
    }

    #[tokio::test]
    async fn deliveries_are_reported_with_offsets() {
        let t = with_topic(Duration::ZERO, 2).await;
        let p = t.publisher().await.unwrap();
        let reports = p.delivery_reports();
        for i in 0..3u8 {
            p.enqueue("t", PartitionSelector::Partition(1), Bytes::new(), Bytes::from(vec![i]))
                .await
                .unwrap();
        }
        assert_eq!(p.flush(Duration::from_secs(5)).await, 0);
        let seen: Vec<DeliveryReport> = reports.try_iter().collect();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|r| r.is_delivered() && r.partition == 1));
        assert_eq!(
            seen.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![Some(0), Some(1), Some(2)]
        );
    }

    #[tokio::test]
    async fn health_check_passes_on_live_broker() {
        let t = MockTransport::new(Duration::ZERO, 0);
        assert_eq!(t.health_check().await, Ok(()));
    }

    #[tokio::test]
    async fn invalid_params_fail_connect() {
        let opts = ConnectOptions::default().with("linger.ms", "soon");
        assert!(matches!(connect(opts).await, Err(TransportError::Connect(_))));
    }
}
