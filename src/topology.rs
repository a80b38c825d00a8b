//! Simulated topology, flow routing and the benchmark driver.

use crate::config::{ConfigError, NodeKind, TopologyConfig};
use crate::flow::{self, Flow, FlowOutcome, Route};
use crate::report::FlowKey;
use crate::report::assemble::{Path, PathHop, ReportAssembler};
use crate::report::node::{MetadataNode, RandomNode, StaticNode};
use crate::transport::{PartitionSelector, TopicSpec, TopicStatus, Transport, TransportError};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Topic a reporting node publishes to, e.g. `ASff00_0_1-1`.
pub fn topic_name(asn: u64, node_id: u32) -> String {
    format!(
        "AS{:x}_{:x}_{:x}-{:x}",
        (asn >> 32) & 0xffff,
        (asn >> 16) & 0xffff,
        asn & 0xffff,
        node_id
    )
}

/// A flow's identity, hop sequence and destination.
#[derive(Clone)]
pub struct FlowPlan {
    pub key: FlowKey,
    pub path: Arc<Path>,
    pub route: Route,
}

/// Nodes are built once and shared read-only by every flow that crosses them.
#[derive(Clone)]
pub struct Topology {
    flows: Vec<FlowPlan>,
    topics: Vec<String>,
}

impl Topology {
    pub fn from_config(cfg: &TopologyConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let nodes: HashMap<&str, Arc<dyn MetadataNode>> = cfg
            .nodes
            .iter()
            .map(|n| {
                let node: Arc<dyn MetadataNode> = match n.kind {
                    NodeKind::Static => {
                        Arc::new(StaticNode::new(n.asn, n.node_id, n.latency, n.tx_util))
                    }
                    NodeKind::Random => Arc::new(RandomNode::new(n.asn, n.node_id)),
                };
                (n.name.as_str(), node)
            })
            .collect();

        let mut flows = Vec::with_capacity(cfg.flows.len());
        let mut topics: Vec<String> = Vec::new();
        for f in &cfg.flows {
            let hops = f
                .path
                .iter()
                .map(|h| {
                    nodes
                        .get(h.node.as_str())
                        .map(|node| PathHop::new(node.clone(), h.ingress, h.egress))
                        .ok_or_else(|| ConfigError::UnknownNode {
                            flow_id: f.flow_id,
                            node: h.node.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let path = Path::new(hops);
            let topic = match (&f.topic, path.first()) {
                (Some(t), _) => t.clone(),
                (None, Some(first)) => topic_name(first.node.asn(), first.node.node_id()),
                (None, None) => topic_name(f.src_as, 1),
            };
            if !topics.contains(&topic) {
                topics.push(topic.clone());
            }
            flows.push(FlowPlan {
                key: FlowKey::new(f.src_as, f.dst_as, f.flow_id),
                path: Arc::new(path),
                route: Route::new(topic, PartitionSelector::from(f.partition)),
            });
        }
        Ok(Self { flows, topics })
    }

    pub fn flows(&self) -> &[FlowPlan] {
        &self.flows
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// One worker description per flow, each producing `pkt_count` reports.
    pub fn build_flows(&self, pkt_count: u64, assembler: ReportAssembler) -> Vec<Flow> {
        self.flows
            .iter()
            .map(|plan| Flow {
                key: plan.key,
                generator: plan.path.clone(),
                pkt_count,
                route: plan.route.clone(),
                assembler,
            })
            .collect()
    }
}

/// Creates `topics` with one partition and replication factor one.
/// Topics that already exist are fine; any other failure is returned.
pub async fn provision_topics(
    transport: &dyn Transport,
    topics: &[String],
) -> Result<(), TransportError> {
    let specs: Vec<TopicSpec> = topics.iter().map(TopicSpec::new).collect();
    for result in transport.create_topics(&specs).await? {
        match result.status {
            Ok(TopicStatus::Created) => info!(topic = %result.name, "topic created"),
            Ok(TopicStatus::AlreadyExists) => info!(topic = %result.name, "topic already exists"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Where the reports of a run ended up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryAccount {
    /// flows x reports per flow
    pub attempted: u64,
    pub encode_failures: u64,
    pub enqueue_failures: u64,
    /// Reports of flows whose worker aborted before producing.
    pub aborted: u64,
    /// Still queued when the final flush timed out.
    pub undelivered: u64,
}

impl DeliveryAccount {
    pub fn new(attempted: u64) -> Self {
        Self {
            attempted,
            ..Self::default()
        }
    }

    pub fn absorb(&mut self, outcome: &FlowOutcome) {
        self.encode_failures += outcome.encode_failures;
        self.enqueue_failures += outcome.enqueue_failures;
    }

    /// Never above `attempted`, never below zero.
    pub fn delivered(&self) -> u64 {
        self.attempted
            .saturating_sub(self.encode_failures)
            .saturating_sub(self.enqueue_failures)
            .saturating_sub(self.aborted)
            .saturating_sub(self.undelivered)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchSummary {
    pub flows: usize,
    pub pkts_per_flow: u64,
    pub failed_flows: usize,
    pub account: DeliveryAccount,
    pub delivered: u64,
    pub elapsed_secs: f64,
    pub rate: f64,
}

impl BenchSummary {
    pub fn new(
        flows: usize,
        pkts_per_flow: u64,
        failed_flows: usize,
        account: DeliveryAccount,
        elapsed: Duration,
    ) -> Self {
        let delivered = account.delivered();
        let elapsed_secs = elapsed.as_secs_f64();
        let rate = if elapsed_secs > 0.0 {
            delivered as f64 / elapsed_secs
        } else {
            0.0
        };
        Self {
            flows,
            pkts_per_flow,
            failed_flows,
            account,
            delivered,
            elapsed_secs,
            rate,
        }
    }

    pub fn lines(&self) -> String {
        format!(
            "Sent {} reports in {:.3} seconds.\nRate: {:.2} reports/second",
            self.delivered, self.elapsed_secs, self.rate
        )
    }
}

/// Provisions topics, runs one worker per flow, waits for all of them to
/// finish producing, then flushes once with `flush_timeout` and accounts for
/// whatever is still queued.
pub async fn run_benchmark(
    topology: &Topology,
    transport: &dyn Transport,
    pkt_count: u64,
    flush_timeout: Duration,
) -> anyhow::Result<BenchSummary> {
    provision_topics(transport, topology.topics())
        .await
        .map_err(|e| anyhow::Error::msg(format!("topic provisioning error: {}", e)))?;
    let publisher = transport
        .publisher()
        .await
        .map_err(|e| anyhow::Error::msg(format!("create publisher error: {}", e)))?;

    let flows = topology.build_flows(pkt_count, ReportAssembler::benchmark());
    let flow_count = flows.len();
    let mut account = DeliveryAccount::new(flow_count as u64 * pkt_count);
    let mut failed_flows = 0;

    info!(flows = flow_count, pkts_per_flow = pkt_count, "starting flows");
    let t0 = Instant::now();
    let handles: Vec<_> = flows
        .into_iter()
        .map(|f| flow::start(f, publisher.clone()))
        .collect();
    for joined in join_all(handles).await {
        match joined {
            Ok(Ok(outcome)) => account.absorb(&outcome),
            Ok(Err(e)) => {
                error!(error = %e, "flow aborted");
                failed_flows += 1;
                account.aborted += pkt_count;
            }
            Err(e) => {
                error!(error = %e, "flow task failed");
                failed_flows += 1;
                account.aborted += pkt_count;
            }
        }
    }
    account.undelivered = publisher.flush(flush_timeout).await as u64;
    let elapsed = t0.elapsed();

    if account.undelivered > 0 {
        info!(undelivered = account.undelivered, "flush timed out with reports still queued");
    }
    Ok(BenchSummary::new(
        flow_count,
        pkt_count,
        failed_flows,
        account,
        elapsed,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{MetadataType, PacketType, Report};
    use crate::transport::mock::MockTransport;

    fn benchmark() -> Topology {
        Topology::from_config(&TopologyConfig::benchmark_default()).unwrap()
    }

    #[test]
    fn topic_names_follow_as_groups() {
        assert_eq!(topic_name(0xff00_0000_0001, 1), "ASff00_0_1-1");
        assert_eq!(topic_name(0xff00_0000_0004, 1), "ASff00_0_4-1");
        assert_eq!(topic_name(0x0001_ff00_0001_0110, 0x1f), "ASff00_1_110-1f");
    }

    #[test]
    fn benchmark_topology_routes() {
        let t = benchmark();
        assert_eq!(t.topics(), &["ASff00_0_1-1".to_string(), "ASff00_0_4-1".to_string()]);
        let routes: Vec<&str> = t.flows().iter().map(|f| f.route.topic.as_str()).collect();
        assert_eq!(routes, vec!["ASff00_0_1-1", "ASff00_0_1-1", "ASff00_0_4-1"]);
        assert!(t.flows().iter().all(|f| f.route.partition == PartitionSelector::Any));
    }

    #[test]
    fn benchmark_flow_generates_static_path() {
        let t = benchmark();
        let flows = t.build_flows(1, ReportAssembler::benchmark());
        let mut report: Report = flows[2].assembler.new_report();
        flows[2].assembler.fill(&mut report, flows[2].generator.as_ref());
        assert_eq!(report.packet_type(), PacketType::None);
        let hops: Vec<(u64, u64)> = report
            .hops
            .iter()
            .map(|h| (h.asn, h.get(MetadataType::InterfaceLevel1).unwrap().unwrap()))
            .collect();
        assert_eq!(
            hops,
            vec![
                (0xff00_0000_0004, 0x0000_0001),
                (0xff00_0000_0002, 0x0002_0001),
                (0xff00_0000_0001, 0x0001_0000),
            ]
        );
    }

    #[test]
    fn explicit_topic_and_partition_win() {
        let mut cfg = TopologyConfig::benchmark_default();
        cfg.flows[0].topic = Some("custom".into());
        cfg.flows[0].partition = Some(3);
        let t = Topology::from_config(&cfg).unwrap();
        assert_eq!(t.flows()[0].route, Route::new("custom", PartitionSelector::Partition(3)));
        assert!(t.topics().contains(&"custom".to_string()));
    }

    #[test]
    fn delivered_is_bounded() {
        let mut account = DeliveryAccount::new(30);
        account.undelivered = 5;
        account.encode_failures = 2;
        assert_eq!(account.delivered(), 23);
        account.aborted = 10;
        assert_eq!(account.delivered(), 13);
        account.undelivered = 100;
        assert_eq!(account.delivered(), 0);
    }

    #[test]
    fn zero_elapsed_rate_is_zero() {
        let summary = BenchSummary::new(1, 1, 0, DeliveryAccount::new(1), Duration::ZERO);
        assert_eq!(summary.rate, 0.0);
        assert!(summary.lines().starts_with("Sent 1 reports"));
    }

    #[tokio::test]
    async fn provisioning_is_idempotent() {
        let transport = MockTransport::new(Duration::ZERO, 0);
        let topics = vec!["a".to_string(), "b".to_string()];
        provision_topics(&transport, &topics).await.unwrap();
        provision_topics(&transport, &topics).await.unwrap();
        assert_eq!(transport.partition_count("a"), Some(1));
    }

    #[tokio::test]
    async fn benchmark_delivers_everything() {
        let transport = MockTransport::new(Duration::ZERO, 0);
        let summary = run_benchmark(&benchmark(), &transport, 50, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(summary.flows, 3);
        assert_eq!(summary.account.attempted, 150);
        assert_eq!(summary.account.undelivered, 0);
        assert_eq!(summary.delivered, 150);
        assert_eq!(transport.messages("ASff00_0_1-1", 0).len(), 100);
        assert_eq!(transport.messages("ASff00_0_4-1", 0).len(), 50);
    }
}
