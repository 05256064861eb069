// Common types for the RustyMesh message plane
//
// This module defines the shared data model: node identity and addressing,
// cluster identifiers, container addresses, the node information blob
// published in the coordination directory, and the message records that
// cross the wire.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{MeshError, Result};

// ============================================================================
// Node Identification and Addressing
// ============================================================================

/// Opaque identity of a peer node.
///
/// Two addresses are equal iff their guids are equal; the network fields are
/// advertisement, not identity. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Stable unique identifier for the node process
    pub guid: String,
    /// Reachable host (IP or name) the node's receiver is bound to
    pub host: String,
    /// Receiver port
    pub port: u16,
    /// Identifier of the serializer the node expects on the wire
    pub serializer_id: u32,
    /// Advertised receive buffer size in bytes
    pub recv_buffer_size: usize,
    /// Largest frame the node will accept
    pub max_message_size: usize,
}

impl NodeAddress {
    pub fn new(
        guid: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        serializer_id: u32,
        recv_buffer_size: usize,
        max_message_size: usize,
    ) -> Self {
        Self {
            guid: guid.into(),
            host: host.into(),
            port,
            serializer_id,
            recv_buffer_size,
            max_message_size,
        }
    }

    /// Host:port form suitable for connecting
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for NodeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid
    }
}

impl Eq for NodeAddress {}

impl Hash for NodeAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.guid.hash(state);
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.guid, self.host, self.port)
    }
}

/// Identifier of a logical cluster: (application, cluster) pair.
///
/// Total-ordered lexicographically, application first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId {
    pub application: String,
    pub cluster: String,
}

impl ClusterId {
    pub fn new(application: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            cluster: cluster.into(),
        }
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.application, self.cluster)
    }
}

/// Destination of a routed message: a node plus the container slots on that
/// node that should receive it.
///
/// Co-hosted clusters share one network hop; `clusters` is non-empty and may
/// accumulate indexes when routers agree on the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerAddress {
    pub node: NodeAddress,
    pub clusters: Vec<u16>,
}

impl ContainerAddress {
    pub fn new(node: NodeAddress, clusters: Vec<u16>) -> Self {
        debug_assert!(!clusters.is_empty());
        Self { node, clusters }
    }
}

impl fmt::Display for ContainerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.node, self.clusters)
    }
}

// ============================================================================
// Directory Blobs
// ============================================================================

/// Per-cluster entry of a node's directory registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInformation {
    pub cluster_id: ClusterId,
    /// Container slot this cluster occupies on the node
    pub container_index: u16,
    /// Message types the cluster's processors handle
    pub message_types: Vec<String>,
    /// Opaque routing-strategy metadata
    pub metadata: BTreeMap<String, String>,
}

impl ClusterInformation {
    pub fn new(cluster_id: ClusterId, container_index: u16, message_types: Vec<String>) -> Self {
        Self {
            cluster_id,
            container_index,
            message_types,
            metadata: BTreeMap::new(),
        }
    }
}

/// What each node publishes at `<root>/nodes/<guid>`.
///
/// The reconciler treats the encoded form as an opaque blob for change
/// detection and only decodes it to rebuild routing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInformation {
    pub address: NodeAddress,
    pub clusters: BTreeMap<ClusterId, ClusterInformation>,
}

impl NodeInformation {
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            clusters: BTreeMap::new(),
        }
    }

    pub fn add_cluster(&mut self, info: ClusterInformation) {
        self.clusters.insert(info.cluster_id.clone(), info);
    }

    /// Nodes that host no containers only dispatch; routing skips them.
    pub fn is_adaptor_only(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map(Bytes::from)
            .map_err(|e| MeshError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::serde::decode_from_slice(data, bincode::config::standard())
            .map(|(info, _)| info)
            .map_err(|e| MeshError::Serialization(e.to_string()))
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Application-level keyed message handed to the dispatcher.
///
/// `message_types` drives router lookup; key and payload are opaque to the
/// plane.
#[derive(Debug, Clone)]
pub struct KeyedMessage {
    pub key: Bytes,
    pub payload: Bytes,
    pub message_types: Vec<String>,
}

impl KeyedMessage {
    pub fn new(key: impl Into<Bytes>, payload: impl Into<Bytes>, message_types: Vec<String>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            message_types,
        }
    }
}

/// Wire-level record carried inside a frame.
///
/// Message types do not cross the wire; destination container slots already
/// encode the routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedMessage {
    pub container_indexes: Vec<u16>,
    pub key: Bytes,
    pub payload: Bytes,
}
