//! Telemetry report data model.
//!
//! Reports, hops and flow keys are protobuf messages. Per-hop metadata is a
//! map from a [`MetadataType`] tag to a fixed-width big-endian byte string;
//! the width depends only on the type and is looked up in [`METADATA_TABLE`].

pub mod assemble;
pub mod node;

use bytes::{Bytes, BytesMut};
use prost::Message;
use std::collections::HashMap;
use std::fmt;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error("unknown metadata tag {0}")]
    UnknownTag(u32),
    #[error("{ty} expects {expected} bytes, got {actual}")]
    Width {
        ty: MetadataType,
        expected: usize,
        actual: usize,
    },
    #[error("value {value} does not fit {ty} ({width} bytes)")]
    OutOfRange {
        ty: MetadataType,
        value: u64,
        width: usize,
    },
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
}

/// Telemetry fields a hop may report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetadataType {
    InterfaceLevel1,
    HopLatency,
    QueueOccupancy,
    IngressTimestamp,
    EgressTimestamp,
    InterfaceLevel2,
    TxUtilization,
    BufferOccupancy,
    QueueDropReason,
}

struct MetadataEntry {
    ty: MetadataType,
    tag: u32,
    width: usize,
    name: &'static str,
}

/// Tag and wire width of every metadata type, indexed by discriminant.
static METADATA_TABLE: [MetadataEntry; 9] = [
    MetadataEntry { ty: MetadataType::InterfaceLevel1, tag: 1, width: 4, name: "INTERFACE_LEVEL1" },
    MetadataEntry { ty: MetadataType::HopLatency, tag: 2, width: 4, name: "HOP_LATENCY" },
    MetadataEntry { ty: MetadataType::QueueOccupancy, tag: 3, width: 4, name: "QUEUE_OCCUPANCY" },
    MetadataEntry { ty: MetadataType::IngressTimestamp, tag: 4, width: 8, name: "INGRESS_TIMESTAMP" },
    MetadataEntry { ty: MetadataType::EgressTimestamp, tag: 5, width: 8, name: "EGRESS_TIMESTAMP" },
    MetadataEntry { ty: MetadataType::InterfaceLevel2, tag: 6, width: 8, name: "INTERFACE_LEVEL2" },
    MetadataEntry { ty: MetadataType::TxUtilization, tag: 7, width: 4, name: "EGRESS_TX_UTILIZATION" },
    MetadataEntry { ty: MetadataType::BufferOccupancy, tag: 8, width: 4, name: "BUFFER_OCCUPANCY" },
    MetadataEntry { ty: MetadataType::QueueDropReason, tag: 15, width: 4, name: "QUEUE_DROP_REASON" },
];

impl MetadataType {
    pub const ALL: [MetadataType; 9] = [
        MetadataType::InterfaceLevel1,
        MetadataType::HopLatency,
        MetadataType::QueueOccupancy,
        MetadataType::IngressTimestamp,
        MetadataType::EgressTimestamp,
        MetadataType::InterfaceLevel2,
        MetadataType::TxUtilization,
        MetadataType::BufferOccupancy,
        MetadataType::QueueDropReason,
    ];

    fn entry(self) -> &'static MetadataEntry {
        &METADATA_TABLE[self as usize]
    }

    /// Map key used on the wire.
    pub fn tag(self) -> u32 {
        self.entry().tag
    }

    /// Encoded size in bytes.
    pub fn width(self) -> usize {
        self.entry().width
    }

    pub fn name(self) -> &'static str {
        self.entry().name
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        METADATA_TABLE.iter().find(|e| e.tag == tag).map(|e| e.ty)
    }

    /// Big-endian encoding of `value` in exactly `self.width()` bytes.
    pub fn encode(self, value: u64) -> Result<Vec<u8>, ReportError> {
        let width = self.width();
        if width < 8 && value >> (width * 8) != 0 {
            return Err(ReportError::OutOfRange { ty: self, value, width });
        }
        Ok(value.to_be_bytes()[8 - width..].to_vec())
    }

    pub fn decode(self, bytes: &[u8]) -> Result<u64, ReportError> {
        self.check_width(bytes)?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    fn check_width(self, bytes: &[u8]) -> Result<(), ReportError> {
        if bytes.len() != self.width() {
            return Err(ReportError::Width {
                ty: self,
                expected: self.width(),
                actual: bytes.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for MetadataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PacketType {
    None = 0,
    Scion = 1,
}

impl PacketType {
    pub fn name(self) -> &'static str {
        match self {
            PacketType::None => "NONE",
            PacketType::Scion => "SCION",
        }
    }
}

/// Identity of a flow; used as the publish key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, prost::Message)]
pub struct FlowKey {
    #[prost(uint64, tag = "1")]
    pub src_as: u64,
    #[prost(uint64, tag = "2")]
    pub dst_as: u64,
    #[prost(uint32, tag = "3")]
    pub flow_id: u32,
}

impl FlowKey {
    pub fn new(src_as: u64, dst_as: u64, flow_id: u32) -> Self {
        Self {
            src_as,
            dst_as,
            flow_id,
        }
    }

    pub fn marshal(&self) -> Result<Bytes, ReportError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)
            .map_err(|e| ReportError::Encode(e.to_string()))?;
        Ok(buf.freeze())
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, ReportError> {
        Self::decode(bytes).map_err(|e| ReportError::Decode(e.to_string()))
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "src_as: {} dst_as: {} flow_id: {}",
            fmt_asn(self.src_as),
            fmt_asn(self.dst_as),
            self.flow_id
        )
    }
}

/// One node's contribution to a report.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Hop {
    #[prost(uint64, tag = "1")]
    pub asn: u64,
    #[prost(uint32, tag = "2")]
    pub node_id: u32,
    #[prost(map = "uint32, bytes", tag = "3")]
    pub metadata: HashMap<u32, Vec<u8>>,
}

impl Hop {
    pub fn new(asn: u64, node_id: u32) -> Self {
        Self {
            asn,
            node_id,
            metadata: HashMap::new(),
        }
    }

    pub fn set(&mut self, ty: MetadataType, value: u64) -> Result<(), ReportError> {
        self.metadata.insert(ty.tag(), ty.encode(value)?);
        Ok(())
    }

    pub fn raw(&self, ty: MetadataType) -> Option<&[u8]> {
        self.metadata.get(&ty.tag()).map(Vec::as_slice)
    }

    /// Decoded value, `Ok(None)` when the node did not report it.
    pub fn get(&self, ty: MetadataType) -> Result<Option<u64>, ReportError> {
        self.raw(ty).map(|b| ty.decode(b)).transpose()
    }

    pub fn validate(&self) -> Result<(), ReportError> {
        for (tag, value) in &self.metadata {
            let ty = MetadataType::from_tag(*tag).ok_or(ReportError::UnknownTag(*tag))?;
            ty.check_width(value)?;
        }
        Ok(())
    }
}

/// A packet's path as reported by the INT nodes it traversed, ingress hop first.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Report {
    #[prost(enumeration = "PacketType", tag = "1")]
    pub packet_type: i32,
    #[prost(message, repeated, tag = "2")]
    pub hops: Vec<Hop>,
    #[prost(bytes = "vec", tag = "3")]
    pub truncated_packet: Vec<u8>,
}

impl Report {
    pub fn with_packet(packet_type: PacketType, truncated_packet: Vec<u8>) -> Self {
        Self {
            packet_type: packet_type as i32,
            hops: Vec::new(),
            truncated_packet,
        }
    }

    /// Drops all hops but keeps the allocation for the next fill.
    pub fn clear_hops(&mut self) {
        self.hops.clear();
    }

    pub fn validate(&self) -> Result<(), ReportError> {
        self.hops.iter().try_for_each(Hop::validate)
    }

    /// Validates and encodes into `buf`, returning the encoded frame.
    ///
    /// The frame is split off `buf`, so the spare capacity left behind is
    /// reused by the next call.
    pub fn marshal_into(&self, buf: &mut BytesMut) -> Result<Bytes, ReportError> {
        self.validate()?;
        buf.clear();
        buf.reserve(self.encoded_len());
        self.encode(buf)
            .map_err(|e| ReportError::Encode(e.to_string()))?;
        Ok(buf.split().freeze())
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, ReportError> {
        Self::decode(bytes).map_err(|e| ReportError::Decode(e.to_string()))
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "packet_type: {} hops: {} truncated_packet: {} bytes",
            self.packet_type().name(),
            self.hops.len(),
            self.truncated_packet.len()
        )?;
        for (i, hop) in self.hops.iter().enumerate() {
            write!(f, "  hop {}: as {} node {}", i, fmt_asn(hop.asn), hop.node_id)?;
            let mut tags: Vec<&u32> = hop.metadata.keys().collect();
            tags.sort();
            for tag in tags {
                let value = &hop.metadata[tag];
                match MetadataType::from_tag(*tag) {
                    Some(ty) => match ty.decode(value) {
                        Ok(v) => write!(f, " {}={}", ty, v)?,
                        Err(_) => write!(f, " {}=<{} bytes>", ty, value.len())?,
                    },
                    None => write!(f, " tag{}=<{} bytes>", tag, value.len())?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Formats an AS number as `ff00:0:1`, prefixed with the ISD when the upper
/// 16 bits are set (`1-ff00:0:1`).
pub fn fmt_asn(asn: u64) -> String {
    let isd = asn >> 48;
    let groups = format!(
        "{:x}:{:x}:{:x}",
        (asn >> 32) & 0xffff,
        (asn >> 16) & 0xffff,
        asn & 0xffff
    );
    if isd == 0 {
        groups
    } else {
        format!("{}-{}", isd, groups)
    }
}

/// Parses `ff00:0:1` (optionally ISD-prefixed, `1-ff00:0:1`) into an AS number.
pub fn parse_asn(s: &str) -> Option<u64> {
    let (isd, rest) = match s.split_once('-') {
        Some((isd, rest)) => (isd.parse::<u16>().ok()?, rest),
        None => (0, s),
    };
    let mut asn = u64::from(isd);
    let mut parts = 0;
    for group in rest.split(':') {
        asn = (asn << 16) | u64::from(u16::from_str_radix(group, 16).ok()?);
        parts += 1;
    }
    (parts == 3).then_some(asn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_indexed_by_discriminant() {
        for ty in MetadataType::ALL {
            assert_eq!(METADATA_TABLE[ty as usize].ty, ty);
            assert_eq!(MetadataType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(MetadataType::from_tag(9), None);
    }

    #[test]
    fn widths_follow_type() {
        for ty in MetadataType::ALL {
            let max = if ty.width() == 8 { u64::MAX } else { u64::from(u32::MAX) };
            for value in [0, 0x0102, max] {
                let bytes = ty.encode(value).unwrap();
                assert_eq!(bytes.len(), ty.width());
                assert_eq!(ty.decode(&bytes).unwrap(), value);
            }
            if ty.width() == 4 {
                assert!(ty.encode(u64::from(u32::MAX) + 1).is_err());
            }
        }
        assert_eq!(MetadataType::IngressTimestamp.width(), 8);
        assert_eq!(MetadataType::HopLatency.width(), 4);
    }

    #[test]
    fn encode_is_big_endian() {
        assert_eq!(
            MetadataType::HopLatency.encode(10_000).unwrap(),
            vec![0x00, 0x00, 0x27, 0x10]
        );
        assert_eq!(
            MetadataType::EgressTimestamp.encode(1).unwrap(),
            vec![0, 0, 0, 0, 0, 0, 0, 1]
        );
    }

    #[test]
    fn encode_rejects_values_wider_than_type() {
        let err = MetadataType::HopLatency.encode(1 << 32).unwrap_err();
        assert!(matches!(err, ReportError::OutOfRange { width: 4, .. }));
        assert!(MetadataType::IngressTimestamp.encode(u64::MAX).is_ok());
    }

    #[test]
    fn decode_rejects_wrong_width() {
        let err = MetadataType::HopLatency.decode(&[0, 1]).unwrap_err();
        assert_eq!(
            err,
            ReportError::Width {
                ty: MetadataType::HopLatency,
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn hop_absent_metadata_is_none() {
        let mut hop = Hop::new(1, 2);
        hop.set(MetadataType::HopLatency, 7).unwrap();
        assert_eq!(hop.get(MetadataType::HopLatency).unwrap(), Some(7));
        assert_eq!(hop.get(MetadataType::QueueOccupancy).unwrap(), None);
    }

    #[test]
    fn validate_catches_bad_metadata() {
        let mut report = Report::with_packet(PacketType::None, Vec::new());
        let mut hop = Hop::new(1, 1);
        hop.metadata.insert(MetadataType::HopLatency.tag(), vec![1, 2, 3]);
        report.hops.push(hop);
        assert!(matches!(report.validate(), Err(ReportError::Width { .. })));

        report.hops[0].metadata.clear();
        report.hops[0].metadata.insert(42, vec![0; 4]);
        assert_eq!(report.validate(), Err(ReportError::UnknownTag(42)));
    }

    #[test]
    fn report_decode_preserves_hop_order_and_metadata() {
        let mut report = Report::with_packet(PacketType::Scion, vec![0; 64]);
        for (i, asn) in [0xff00_0000_0004u64, 0xff00_0000_0002, 0xff00_0000_0001]
            .into_iter()
            .enumerate()
        {
            let mut hop = Hop::new(asn, i as u32);
            hop.set(MetadataType::InterfaceLevel1, (i as u64) << 16).unwrap();
            hop.set(MetadataType::IngressTimestamp, 1_000 + i as u64).unwrap();
            report.hops.push(hop);
        }

        let mut buf = BytesMut::new();
        let wire = report.marshal_into(&mut buf).unwrap();
        let decoded = Report::unmarshal(&wire).unwrap();

        assert_eq!(decoded, report);
        assert_eq!(decoded.packet_type(), PacketType::Scion);
        let asns: Vec<u64> = decoded.hops.iter().map(|h| h.asn).collect();
        assert_eq!(asns, vec![0xff00_0000_0004, 0xff00_0000_0002, 0xff00_0000_0001]);
    }

    #[test]
    fn marshal_into_reuses_buffer() {
        let report = Report::with_packet(PacketType::None, vec![1, 2, 3]);
        let mut buf = BytesMut::with_capacity(1024);
        let first = report.marshal_into(&mut buf).unwrap();
        let second = report.marshal_into(&mut buf).unwrap();
        assert_eq!(first, second);
        assert!(buf.is_empty());
    }

    #[test]
    fn flow_key_roundtrip() {
        let key = FlowKey::new(0xff00_0000_0001, 0xff00_0000_0004, 2);
        let wire = key.marshal().unwrap();
        assert_eq!(FlowKey::unmarshal(&wire).unwrap(), key);
        assert!(FlowKey::unmarshal(&[0xff, 0xff]).is_err());
    }

    #[test]
    fn asn_notation() {
        assert_eq!(fmt_asn(0xff00_0000_0001), "ff00:0:1");
        assert_eq!(fmt_asn(0x0001_ff00_0000_0110), "1-ff00:0:110");
        assert_eq!(parse_asn("ff00:0:1"), Some(0xff00_0000_0001));
        assert_eq!(parse_asn("1-ff00:0:110"), Some(0x0001_ff00_0000_0110));
        assert_eq!(parse_asn("ff00:0"), None);
        assert_eq!(parse_asn("zz:0:1"), None);
    }

    #[test]
    fn display_names_metadata() {
        let mut report = Report::with_packet(PacketType::None, Vec::new());
        let mut hop = Hop::new(0xff00_0000_0001, 1);
        hop.set(MetadataType::HopLatency, 10_000).unwrap();
        report.hops.push(hop);
        let text = report.to_string();
        assert!(text.contains("packet_type: NONE"));
        assert!(text.contains("as ff00:0:1 node 1 HOP_LATENCY=10000"));
    }
}
