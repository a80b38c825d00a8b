//! INT nodes: append one hop of metadata to a report.

use crate::clock::{Clock, SystemClock};
use crate::report::{Hop, MetadataType, Report};
use rand::Rng;
use std::fmt;
use std::sync::Arc;

/// A telemetry-reporting device on a simulated path.
pub trait MetadataNode: Send + Sync {
    fn asn(&self) -> u64;
    fn node_id(&self) -> u32;
    /// Appends exactly one hop describing this node to `report`.
    /// INTERFACE_LEVEL1 is only reported when `interfaces` is known.
    fn append_metadata(&self, interfaces: Option<(u16, u16)>, report: &mut Report);
}

/// Ingress interface in the upper 16 bits, egress in the lower 16.
pub fn pack_interfaces(ingress_if: u16, egress_if: u16) -> [u8; 4] {
    ((u32::from(ingress_if) << 16) | u32::from(egress_if)).to_be_bytes()
}

pub fn unpack_interfaces(value: u64) -> (u16, u16) {
    ((value >> 16) as u16, value as u16)
}

fn insert_interfaces(hop: &mut Hop, interfaces: Option<(u16, u16)>) {
    if let Some((ingress_if, egress_if)) = interfaces {
        hop.metadata.insert(
            MetadataType::InterfaceLevel1.tag(),
            pack_interfaces(ingress_if, egress_if).to_vec(),
        );
    }
}

/// Node that reports the same latency and utilisation on every call.
#[derive(Clone, PartialEq, Eq)]
pub struct StaticNode {
    asn: u64,
    id: u32,
    latency: [u8; 4],
    tx_util: [u8; 4],
}

impl StaticNode {
    pub fn new(asn: u64, id: u32, latency: u32, tx_util: u32) -> Self {
        Self {
            asn,
            id,
            latency: latency.to_be_bytes(),
            tx_util: tx_util.to_be_bytes(),
        }
    }
}

impl fmt::Debug for StaticNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticNode")
            .field("asn", &format_args!("{:#x}", self.asn))
            .field("id", &self.id)
            .field("latency", &u32::from_be_bytes(self.latency))
            .field("tx_util", &u32::from_be_bytes(self.tx_util))
            .finish()
    }
}

impl MetadataNode for StaticNode {
    fn asn(&self) -> u64 {
        self.asn
    }

    fn node_id(&self) -> u32 {
        self.id
    }

    fn append_metadata(&self, interfaces: Option<(u16, u16)>, report: &mut Report) {
        let mut hop = Hop::new(self.asn, self.id);
        hop.metadata.reserve(3);
        insert_interfaces(&mut hop, interfaces);
        hop.metadata
            .insert(MetadataType::HopLatency.tag(), self.latency.to_vec());
        hop.metadata
            .insert(MetadataType::TxUtilization.tag(), self.tx_util.to_vec());
        report.hops.push(hop);
    }
}

/// Base value the random latency and utilisation jitter around.
const JITTER_CENTER: u32 = 1000;
/// Fixed part of the modelled ingress-to-egress delay.
const MIN_RESIDENCE_NS: u64 = 10_000;

/// Node that draws fresh latency, utilisation and timestamps per call.
#[derive(Clone)]
pub struct RandomNode {
    asn: u64,
    id: u32,
    clock: Arc<dyn Clock>,
}

impl RandomNode {
    pub fn new(asn: u64, id: u32) -> Self {
        Self::with_clock(asn, id, Arc::new(SystemClock))
    }

    pub fn with_clock(asn: u64, id: u32, clock: Arc<dyn Clock>) -> Self {
        Self { asn, id, clock }
    }
}

impl fmt::Debug for RandomNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomNode")
            .field("asn", &format_args!("{:#x}", self.asn))
            .field("id", &self.id)
            .finish()
    }
}

fn jitter<R: Rng>(rng: &mut R) -> u32 {
    JITTER_CENTER + rng.gen_range(0..=100) - 50
}

impl MetadataNode for RandomNode {
    fn asn(&self) -> u64 {
        self.asn
    }

    fn node_id(&self) -> u32 {
        self.id
    }

    fn append_metadata(&self, interfaces: Option<(u16, u16)>, report: &mut Report) {
        let mut rng = rand::thread_rng();
        let t0 = self.clock.now_ns();
        let t1 = t0 + MIN_RESIDENCE_NS + 1000 * rng.gen_range(0..100u64);

        let mut hop = Hop::new(self.asn, self.id);
        hop.metadata.reserve(5);
        insert_interfaces(&mut hop, interfaces);
        hop.metadata.insert(
            MetadataType::HopLatency.tag(),
            jitter(&mut rng).to_be_bytes().to_vec(),
        );
        hop.metadata.insert(
            MetadataType::IngressTimestamp.tag(),
            t0.to_be_bytes().to_vec(),
        );
        hop.metadata.insert(
            MetadataType::EgressTimestamp.tag(),
            t1.to_be_bytes().to_vec(),
        );
        hop.metadata.insert(
            MetadataType::TxUtilization.tag(),
            jitter(&mut rng).to_be_bytes().to_vec(),
        );
        report.hops.push(hop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::report::PacketType;

    fn empty_report() -> Report {
        Report::with_packet(PacketType::None, Vec::new())
    }

    #[test]
    fn static_node_metadata_bytes() {
        let node = StaticNode::new(0xff00_0000_0001, 1, 10000, 500);
        let mut report = empty_report();
        node.append_metadata(Some((0, 1)), &mut report);

        assert_eq!(report.hops.len(), 1);
        let hop = &report.hops[0];
        assert_eq!(hop.asn, 0xff00_0000_0001);
        assert_eq!(hop.node_id, 1);
        assert_eq!(hop.metadata.len(), 3);
        assert_eq!(
            hop.raw(MetadataType::InterfaceLevel1),
            Some(&[0x00, 0x00, 0x00, 0x01][..])
        );
        assert_eq!(
            hop.raw(MetadataType::HopLatency),
            Some(&[0x00, 0x00, 0x27, 0x10][..])
        );
        assert_eq!(
            hop.raw(MetadataType::TxUtilization),
            Some(&[0x00, 0x00, 0x01, 0xf4][..])
        );
    }

    #[test]
    fn static_node_is_idempotent() {
        let node = StaticNode::new(0xff00_0000_0002, 7, 123, 456);
        let mut report = empty_report();
        node.append_metadata(Some((3, 4)), &mut report);
        node.append_metadata(Some((3, 4)), &mut report);
        assert_eq!(report.hops.len(), 2);
        assert_eq!(report.hops[0], report.hops[1]);
    }

    #[test]
    fn unknown_interfaces_are_not_reported() {
        let mut report = empty_report();
        StaticNode::new(1, 1, 10, 20).append_metadata(None, &mut report);
        RandomNode::with_clock(2, 1, Arc::new(FixedClock::new(0))).append_metadata(Some((5, 6)), &mut report);
        assert_eq!(report.hops[0].metadata.len(), 2);
        assert_eq!(report.hops[0].raw(MetadataType::InterfaceLevel1), None);
        assert_eq!(
            report.hops[1].get(MetadataType::InterfaceLevel1).unwrap(),
            Some(0x0005_0006)
        );
    }

    #[test]
    fn interfaces_pack_ingress_high() {
        assert_eq!(pack_interfaces(0x0102, 0x0304), [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(unpack_interfaces(0x0102_0304), (0x0102, 0x0304));
    }

    #[test]
    fn random_node_values_in_range() {
        let clock = Arc::new(FixedClock::new(1_000_000));
        let node = RandomNode::with_clock(0xff00_0000_0003, 1, clock);
        let mut report = empty_report();
        for _ in 0..200 {
            node.append_metadata(None, &mut report);
        }
        for hop in &report.hops {
            hop.validate().unwrap();
            assert_eq!(hop.raw(MetadataType::InterfaceLevel1), None);
            let latency = hop.get(MetadataType::HopLatency).unwrap().unwrap();
            let util = hop.get(MetadataType::TxUtilization).unwrap().unwrap();
            assert!((950..=1050).contains(&latency));
            assert!((950..=1050).contains(&util));

            let t0 = hop.get(MetadataType::IngressTimestamp).unwrap().unwrap();
            let t1 = hop.get(MetadataType::EgressTimestamp).unwrap().unwrap();
            assert_eq!(t0, 1_000_000);
            assert!(t1 >= t0 + 10_000 && t1 < t0 + 10_000 + 100_000);
            assert_eq!((t1 - t0) % 1000, 0);
        }
    }
}
