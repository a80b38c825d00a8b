//! Per-flow report generator and publisher.

use crate::report::assemble::{ReportAssembler, ReportGenerator};
use crate::report::{FlowKey, ReportError};
use crate::transport::{PartitionSelector, Publisher};
use bytes::BytesMut;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Initial capacity of a worker's encode buffer; grows on demand.
const ENCODE_BUF_CAPACITY: usize = 64 * 1024;

/// Topic and partition all reports of a flow are published to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub topic: String,
    pub partition: PartitionSelector,
}

impl Route {
    pub fn new(topic: impl Into<String>, partition: PartitionSelector) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// A unidirectional flow between two INT nodes.
#[derive(Clone)]
pub struct Flow {
    pub key: FlowKey,
    /// Appends the flow's hops to each report.
    pub generator: Arc<dyn ReportGenerator>,
    pub pkt_count: u64,
    pub route: Route,
    pub assembler: ReportAssembler,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowOutcome {
    pub attempted: u64,
    pub enqueued: u64,
    /// Reports skipped because they failed validation or encoding.
    pub encode_failures: u64,
    pub enqueue_failures: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum FlowError {
    #[error("flow key {key}: {source}")]
    Key {
        key: FlowKey,
        #[source]
        source: ReportError,
    },
}

/// Generates and enqueues `flow.pkt_count` reports.
///
/// The key is marshaled once; the report and its encode buffer are reused
/// across iterations. A report that fails to encode, or that the publisher
/// rejects, is counted and skipped.
pub async fn run_flow(flow: Flow, publisher: Arc<dyn Publisher>) -> Result<FlowOutcome, FlowError> {
    let wire_key = flow.key.marshal().map_err(|source| FlowError::Key {
        key: flow.key,
        source,
    })?;
    let mut report = flow.assembler.new_report();
    let mut buf = BytesMut::with_capacity(ENCODE_BUF_CAPACITY);
    let mut outcome = FlowOutcome::default();

    debug!(flow = %flow.key, topic = %flow.route.topic, count = flow.pkt_count, "flow started");

    for seq in 0..flow.pkt_count {
        outcome.attempted += 1;
        flow.assembler.fill(&mut report, flow.generator.as_ref());

        let value = match report.marshal_into(&mut buf) {
            Ok(v) => v,
            Err(e) => {
                outcome.encode_failures += 1;
                if outcome.encode_failures == 1 {
                    warn!(flow = %flow.key, seq, error = %e, "skipping report that failed to encode");
                }
                continue;
            }
        };

        match publisher
            .enqueue(&flow.route.topic, flow.route.partition, wire_key.clone(), value)
            .await
        {
            Ok(()) => outcome.enqueued += 1,
            Err(e) => {
                outcome.enqueue_failures += 1;
                if outcome.enqueue_failures == 1 {
                    warn!(flow = %flow.key, seq, error = %e, "enqueue failed");
                }
            }
        }
    }

    debug!(
        flow = %flow.key,
        enqueued = outcome.enqueued,
        encode_failures = outcome.encode_failures,
        enqueue_failures = outcome.enqueue_failures,
        "flow finished"
    );
    Ok(outcome)
}

/// Spawns [`run_flow`] on the runtime.
pub fn start(flow: Flow, publisher: Arc<dyn Publisher>) -> JoinHandle<Result<FlowOutcome, FlowError>> {
    tokio::spawn(run_flow(flow, publisher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::node::{MetadataNode, StaticNode};
    use crate::report::{Hop, Report};
    use crate::transport::mock::MockTransport;
    use crate::transport::{TopicSpec, Transport};
    use std::time::Duration;

    async fn transport() -> MockTransport {
        let t = MockTransport::new(Duration::ZERO, 0);
        t.create_topics(&[TopicSpec::new("t")]).await.unwrap();
        t
    }

    fn flow(generator: Arc<dyn ReportGenerator>, pkt_count: u64, topic: &str) -> Flow {
        Flow {
            key: FlowKey::new(1, 4, 7),
            generator,
            pkt_count,
            route: Route::new(topic, PartitionSelector::Any),
            assembler: ReportAssembler::benchmark(),
        }
    }

    #[tokio::test]
    async fn publishes_every_report_with_same_key() {
        let t = transport().await;
        let publisher = t.publisher().await.unwrap();
        let node = StaticNode::new(0xff00_0000_0001, 1, 10000, 500);
        let generator = Arc::new(move |r: &mut Report| node.append_metadata(Some((0, 1)), r));

        let outcome = run_flow(flow(generator, 25, "t"), publisher.clone()).await.unwrap();
        assert_eq!(outcome.attempted, 25);
        assert_eq!(outcome.enqueued, 25);
        assert_eq!(publisher.flush(Duration::from_secs(5)).await, 0);

        let messages = t.messages("t", 0);
        assert_eq!(messages.len(), 25);
        let expected_key = FlowKey::new(1, 4, 7).marshal().unwrap();
        for (key, value) in &messages {
            assert_eq!(key, &expected_key);
            let report = Report::unmarshal(value).unwrap();
            assert_eq!(report.hops.len(), 1);
        }
    }

    #[tokio::test]
    async fn bad_reports_are_skipped_not_fatal() {
        let t = transport().await;
        let publisher = t.publisher().await.unwrap();
        let calls = std::sync::atomic::AtomicU64::new(0);
        let generator = Arc::new(move |r: &mut Report| {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let mut hop = Hop::new(1, 1);
            let width = if n % 2 == 0 { 4 } else { 3 };
            hop.metadata.insert(2, vec![0; width]);
            r.hops.push(hop);
        });

        let outcome = run_flow(flow(generator, 10, "t"), publisher.clone()).await.unwrap();
        assert_eq!(outcome.encode_failures, 5);
        assert_eq!(outcome.enqueued, 5);
        publisher.flush(Duration::from_secs(5)).await;
        assert_eq!(t.messages("t", 0).len(), 5);
    }

    #[tokio::test]
    async fn enqueue_failures_are_counted() {
        let t = transport().await;
        let publisher = t.publisher().await.unwrap();
        let generator = Arc::new(|_: &mut Report| {});
        let outcome = run_flow(flow(generator, 4, "missing"), publisher).await.unwrap();
        assert_eq!(outcome.enqueue_failures, 4);
        assert_eq!(outcome.enqueued, 0);
    }

    #[tokio::test]
    async fn zero_packets_publish_nothing() {
        let t = transport().await;
        let publisher = t.publisher().await.unwrap();
        let outcome = start(flow(Arc::new(|_: &mut Report| {}), 0, "t"), publisher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, FlowOutcome::default());
    }
}
