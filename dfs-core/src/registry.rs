//! Fixed node registry and per-session liveness

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::placement::NODE_COUNT;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Expected exactly {expected} nodes, got {actual}")]
    WrongNodeCount { expected: usize, actual: usize },

    #[error("Duplicate node id: {0}")]
    DuplicateId(String),

    #[error("Invalid node endpoint {0:?}, expected ID=HOST:PORT")]
    InvalidEndpoint(String),
}

/// Address of one storage node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub id: String,
    pub address: String,
    pub port: u16,
}

impl NodeEndpoint {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.id, self.address, self.port)
    }
}

impl FromStr for NodeEndpoint {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidEndpoint(s.to_string());

        let (id, addr) = s.split_once('=').ok_or_else(invalid)?;
        let (address, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse().map_err(|_| invalid())?;
        if id.is_empty() || address.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(id, address, port))
    }
}

/// The ordered set of four nodes
///
/// Position in the registry is the node index used by placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRegistry {
    nodes: Vec<NodeEndpoint>,
}

impl NodeRegistry {
    pub fn new(nodes: Vec<NodeEndpoint>) -> Result<Self, RegistryError> {
        if nodes.len() != NODE_COUNT {
            return Err(RegistryError::WrongNodeCount {
                expected: NODE_COUNT,
                actual: nodes.len(),
            });
        }
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].iter().any(|other| other.id == node.id) {
                return Err(RegistryError::DuplicateId(node.id.clone()));
            }
        }
        Ok(Self { nodes })
    }

    /// `DFS1..DFS4` on `127.0.0.1:10001..10004`
    pub fn local_default() -> Self {
        let nodes = (1..=NODE_COUNT as u16)
            .map(|n| NodeEndpoint::new(format!("DFS{}", n), "127.0.0.1", 10000 + n))
            .collect();
        Self { nodes }
    }

    pub fn nodes(&self) -> &[NodeEndpoint] {
        &self.nodes
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &NodeEndpoint)> {
        self.nodes.iter().enumerate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Alive,
    Dead,
}

/// Session-scoped liveness, keyed by node id
///
/// A node starts alive; once marked dead it stays dead for the session.
#[derive(Debug, Default)]
pub struct Liveness {
    states: HashMap<String, NodeState>,
}

impl Liveness {
    pub fn new(registry: &NodeRegistry) -> Self {
        let states = registry
            .nodes()
            .iter()
            .map(|node| (node.id.clone(), NodeState::Alive))
            .collect();
        Self { states }
    }

    pub fn mark_dead(&mut self, id: &str) {
        self.states.insert(id.to_string(), NodeState::Dead);
    }

    pub fn is_alive(&self, id: &str) -> bool {
        !matches!(self.states.get(id), Some(NodeState::Dead))
    }

    pub fn dead_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| **s == NodeState::Dead)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_default_matches_reference_deployment() {
        let registry = NodeRegistry::local_default();
        let rendered: Vec<String> = registry.nodes().iter().map(|n| n.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "DFS1=127.0.0.1:10001",
                "DFS2=127.0.0.1:10002",
                "DFS3=127.0.0.1:10003",
                "DFS4=127.0.0.1:10004",
            ]
        );
        assert!(NodeRegistry::new(registry.nodes().to_vec()).is_ok());
    }

    #[test]
    fn test_endpoint_parsing() {
        let node: NodeEndpoint = "DFS2=10.0.0.7:9000".parse().unwrap();
        assert_eq!(node, NodeEndpoint::new("DFS2", "10.0.0.7", 9000));
        assert_eq!(node.socket_addr(), "10.0.0.7:9000");

        assert!("DFS2".parse::<NodeEndpoint>().is_err());
        assert!("DFS2=host".parse::<NodeEndpoint>().is_err());
        assert!("DFS2=host:notaport".parse::<NodeEndpoint>().is_err());
        assert!("=host:1".parse::<NodeEndpoint>().is_err());
    }

    #[test]
    fn test_registry_requires_four_distinct_nodes() {
        let three: Vec<NodeEndpoint> = NodeRegistry::local_default().nodes()[..3].to_vec();
        assert_eq!(
            NodeRegistry::new(three),
            Err(RegistryError::WrongNodeCount {
                expected: 4,
                actual: 3
            })
        );

        let mut dup = NodeRegistry::local_default().nodes().to_vec();
        dup[3].id = "DFS1".to_string();
        assert_eq!(
            NodeRegistry::new(dup),
            Err(RegistryError::DuplicateId("DFS1".to_string()))
        );
    }

    #[test]
    fn test_liveness_is_sticky() {
        let registry = NodeRegistry::local_default();
        let mut liveness = Liveness::new(&registry);
        assert!(liveness.is_alive("DFS3"));
        assert_eq!(liveness.dead_count(), 0);

        liveness.mark_dead("DFS3");
        liveness.mark_dead("DFS3");
        assert!(!liveness.is_alive("DFS3"));
        assert_eq!(liveness.dead_count(), 1);
        assert!(liveness.is_alive("DFS1"));
    }
}
