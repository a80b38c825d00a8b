//! Topology file: simulated nodes and the flows that traverse them.
//!
//! ```yaml
//! nodes:
//!   - { name: n1, asn: "ff00:0:1", node_id: 1, latency: 10000, tx_util: 500 }
//!   - { name: n4, asn: "ff00:0:4", kind: random }
//! flows:
//!   - src_as: "ff00:0:1"
//!     dst_as: "ff00:0:4"
//!     flow_id: 1
//!     path:
//!       - { node: n1, ingress: 0, egress: 1 }
//!       - { node: n4, ingress: 1, egress: 0 }
//! ```

use crate::report::parse_asn;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse topology: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate node name {0}")]
    DuplicateNode(String),
    #[error("flow {flow_id} references unknown node {node}")]
    UnknownNode { flow_id: u32, node: String },
    #[error("duplicate flow key src={src_as:#x} dst={dst_as:#x} id={flow_id}")]
    DuplicateFlow { src_as: u64, dst_as: u64, flow_id: u32 },
    #[error("topology has no flows")]
    NoFlows,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Static,
    Random,
}

fn default_node_id() -> u32 {
    1
}

fn default_latency() -> u32 {
    10_000
}

fn default_tx_util() -> u32 {
    500
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(deserialize_with = "de_asn")]
    pub asn: u64,
    #[serde(default = "default_node_id")]
    pub node_id: u32,
    #[serde(default)]
    pub kind: NodeKind,
    /// Ignored for random nodes.
    #[serde(default = "default_latency")]
    pub latency: u32,
    #[serde(default = "default_tx_util")]
    pub tx_util: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopConfig {
    pub node: String,
    pub ingress: u16,
    pub egress: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(deserialize_with = "de_asn")]
    pub src_as: u64,
    #[serde(deserialize_with = "de_asn")]
    pub dst_as: u64,
    pub flow_id: u32,
    /// Defaults to the topic of the first node on the path.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub partition: Option<i32>,
    pub path: Vec<HopConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub nodes: Vec<NodeConfig>,
    pub flows: Vec<FlowConfig>,
}

/// Accepts either a plain integer or `ff00:0:1` notation.
fn de_asn<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }
    match Raw::deserialize(de)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => parse_asn(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid AS number {:?}", s))),
    }
}

impl TopologyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::DuplicateNode(node.name.clone()));
            }
        }
        if self.flows.is_empty() {
            return Err(ConfigError::NoFlows);
        }
        let mut keys = HashSet::new();
        for flow in &self.flows {
            if !keys.insert((flow.src_as, flow.dst_as, flow.flow_id)) {
                return Err(ConfigError::DuplicateFlow {
                    src_as: flow.src_as,
                    dst_as: flow.dst_as,
                    flow_id: flow.flow_id,
                });
            }
            if let Some(hop) = flow.path.iter().find(|h| !names.contains(h.node.as_str())) {
                return Err(ConfigError::UnknownNode {
                    flow_id: flow.flow_id,
                    node: hop.node.clone(),
                });
            }
        }
        Ok(())
    }

    /// Four static nodes and three flows over two directional routes.
    pub fn benchmark_default() -> Self {
        let node = |name: &str, asn: u64| NodeConfig {
            name: name.to_string(),
            asn,
            node_id: 1,
            kind: NodeKind::Static,
            latency: default_latency(),
            tx_util: default_tx_util(),
        };
        let hop = |node: &str, ingress: u16, egress: u16| HopConfig {
            node: node.to_string(),
            ingress,
            egress,
        };
        let flow = |src_as: u64, dst_as: u64, flow_id: u32, path: Vec<HopConfig>| FlowConfig {
            src_as,
            dst_as,
            flow_id,
            topic: None,
            partition: None,
            path,
        };
        Self {
            nodes: vec![
                node("n1", 0xff00_0000_0001),
                node("n2", 0xff00_0000_0002),
                node("n3", 0xff00_0000_0003),
                node("n4", 0xff00_0000_0004),
            ],
            flows: vec![
                flow(
                    0xff00_0000_0001,
                    0xff00_0000_0004,
                    1,
                    vec![hop("n1", 0, 1), hop("n2", 1, 2), hop("n4", 1, 0)],
                ),
                flow(
                    0xff00_0000_0001,
                    0xff00_0000_0004,
                    2,
                    vec![hop("n1", 0, 2), hop("n3", 1, 2), hop("n4", 2, 0)],
                ),
                flow(
                    0xff00_0000_0004,
                    0xff00_0000_0001,
                    1,
                    vec![hop("n4", 0, 1), hop("n2", 2, 1), hop("n1", 1, 0)],
                ),
            ],
        }
    }
}
