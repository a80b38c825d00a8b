//! Builds reports by walking a path of INT nodes.

use crate::clock::Clock;
use crate::report::node::{MetadataNode, RandomNode};
use crate::report::{PacketType, Report};
use std::sync::Arc;

/// Length of the truncated-packet placeholder in SCION reports.
pub const TRUNCATED_PACKET_LEN: usize = 64;

/// Appends a flow's hop sequence to a report.
pub trait ReportGenerator: Send + Sync {
    fn generate(&self, report: &mut Report);
}

impl<F> ReportGenerator for F
where
    F: Fn(&mut Report) + Send + Sync,
{
    fn generate(&self, report: &mut Report) {
        self(report)
    }
}

/// One node on a path together with the interfaces the packet used there,
/// when they are known.
#[derive(Clone)]
pub struct PathHop {
    pub node: Arc<dyn MetadataNode>,
    pub interfaces: Option<(u16, u16)>,
}

impl PathHop {
    pub fn new(node: Arc<dyn MetadataNode>, ingress_if: u16, egress_if: u16) -> Self {
        Self {
            node,
            interfaces: Some((ingress_if, egress_if)),
        }
    }

    /// Hop whose interfaces are not known; it reports no INTERFACE_LEVEL1.
    pub fn unlinked(node: Arc<dyn MetadataNode>) -> Self {
        Self {
            node,
            interfaces: None,
        }
    }
}

/// Ordered sequence of hops, ingress first.
#[derive(Clone, Default)]
pub struct Path {
    hops: Vec<PathHop>,
}

impl Path {
    pub fn new(hops: Vec<PathHop>) -> Self {
        Self { hops }
    }

    /// Randomized nodes for a list of AS numbers, all sharing `node_id`.
    /// AS lists carry no interface numbers, so none are reported.
    pub fn random(asns: &[u64], node_id: u32, clock: Arc<dyn Clock>) -> Self {
        let hops = asns
            .iter()
            .map(|asn| {
                PathHop::unlinked(Arc::new(RandomNode::with_clock(
                    *asn,
                    node_id,
                    clock.clone(),
                )))
            })
            .collect();
        Self { hops }
    }

    pub fn first(&self) -> Option<&PathHop> {
        self.hops.first()
    }
}

impl ReportGenerator for Path {
    fn generate(&self, report: &mut Report) {
        for hop in &self.hops {
            hop.node.append_metadata(hop.interfaces, report);
        }
    }
}

/// Fixes the packet type and truncated-packet size of generated reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportAssembler {
    packet_type: PacketType,
    truncated_len: usize,
}

impl ReportAssembler {
    pub fn new(packet_type: PacketType, truncated_len: usize) -> Self {
        Self {
            packet_type,
            truncated_len,
        }
    }

    /// Untyped reports with no packet excerpt, used for raw throughput runs.
    pub fn benchmark() -> Self {
        Self::new(PacketType::None, 0)
    }

    /// SCION reports carrying a zeroed packet excerpt.
    pub fn scion() -> Self {
        Self::new(PacketType::Scion, TRUNCATED_PACKET_LEN)
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn new_report(&self) -> Report {
        Report::with_packet(self.packet_type, vec![0; self.truncated_len])
    }

    /// Replaces the hops of `report` with a fresh run of `generator`.
    pub fn fill(&self, report: &mut Report, generator: &dyn ReportGenerator) {
        report.clear_hops();
        generator.generate(report);
    }

    pub fn assemble(&self, generator: &dyn ReportGenerator) -> Report {
        let mut report = self.new_report();
        generator.generate(&mut report);
        report
    }
}

/// Random SCION report along an AS-level path.
pub fn generate_random_report(asns: &[u64], node_id: u32, clock: Arc<dyn Clock>) -> Report {
    ReportAssembler::scion().assemble(&Path::random(asns, node_id, clock))
}
