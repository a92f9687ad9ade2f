//! Node roles, startup ordering and launch descriptors.
//!
//! The bootstrap node is validator 1 and listens on a port reserved once per
//! simulation with a fixed secret key, so every other node can be told where
//! to dial before the bootstrap is even running. The proposer is validator 0
//! and starts last so it never broadcasts into a network that is not yet
//! listening.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::ports::PortAllocator;
use crate::{SimulationResult, ValidatorId};

// The secret key determines the peer id, so the two must change together.
pub const BOOTSTRAP_SECRET_KEY: &str =
    "0xabcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcd";
pub const BOOTSTRAP_PEER_ID: &str = "12D3KooWDFYi71juk6dYWo3UDvqs5gAzGDc124LSvcR5d187Tdvi";

/// Validator acting as the network entry point
pub const BOOTSTRAP_VALIDATOR: ValidatorId = 1;

/// Validator proposing the first value
pub const PROPOSER_VALIDATOR: ValidatorId = 0;

/// Listen host for every node in the cluster
pub const NODE_HOST: &str = "127.0.0.1";

/// Role of a node within the simulated cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Bootstrap,
    Proposer,
    Peer,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Bootstrap => write!(f, "bootstrap"),
            NodeRole::Proposer => write!(f, "proposer"),
            NodeRole::Peer => write!(f, "peer"),
        }
    }
}

/// Startup order for a cluster of `num_validators`: bootstrap, peers in
/// ascending id order, proposer last.
pub fn startup_order(num_validators: usize) -> Vec<(NodeRole, ValidatorId)> {
    let mut order = Vec::with_capacity(num_validators);
    order.push((NodeRole::Bootstrap, BOOTSTRAP_VALIDATOR));
    order.extend((2..num_validators as ValidatorId).map(|id| (NodeRole::Peer, id)));
    order.push((NodeRole::Proposer, PROPOSER_VALIDATOR));
    order
}

/// Listen ports of a single node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePorts {
    pub network: u16,
    pub rpc: u16,
    pub monitoring: u16,
}

impl NodePorts {
    pub fn as_array(&self) -> [u16; 3] {
        [self.network, self.rpc, self.monitoring]
    }
}

/// Fixed identity of the bootstrap node, reserved before any descriptor is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub network_port: u16,
    pub secret_key: String,
    pub peer_id: String,
}

impl BootstrapPeer {
    /// Reserve the bootstrap network port from the allocator
    pub fn reserve(allocator: &PortAllocator) -> SimulationResult<Self> {
        Ok(Self::with_port(allocator.allocate()?))
    }

    /// Bootstrap identity on an explicit port
    pub fn with_port(network_port: u16) -> Self {
        Self {
            network_port,
            secret_key: BOOTSTRAP_SECRET_KEY.to_string(),
            peer_id: BOOTSTRAP_PEER_ID.to_string(),
        }
    }

    /// Multiaddr other nodes dial to join the network
    pub fn multiaddr(&self) -> String {
        format!("/ip4/{}/tcp/{}/p2p/{}", NODE_HOST, self.network_port, self.peer_id)
    }
}

/// Cluster-wide inputs shared by every descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLayout {
    pub num_validators: usize,
    pub data_root: PathBuf,
    pub log_root: PathBuf,
    pub base_layer_node_url: String,
}

impl ClusterLayout {
    pub fn from_config(config: &SimulationConfig, data_root: PathBuf, log_root: PathBuf) -> Self {
        Self {
            num_validators: config.num_validators,
            data_root,
            log_root,
            base_layer_node_url: config.base_layer_node_url.clone(),
        }
    }

    pub fn data_dir(&self, id: ValidatorId) -> PathBuf {
        self.data_root.join(format!("data{}", id))
    }

    pub fn log_path(&self, id: ValidatorId) -> PathBuf {
        self.log_root.join(format!("validator{}.txt", id))
    }
}

/// Everything needed to launch one node, fixed before the process starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub id: ValidatorId,
    pub role: NodeRole,
    pub data_dir: PathBuf,
    pub log_path: PathBuf,
    pub ports: NodePorts,
    /// Bootstrap multiaddr, absent on the bootstrap itself
    pub peer_address: Option<String>,
    pub launch_args: Vec<OsString>,
}

impl NodeDescriptor {
    /// Build the descriptor for `id` in `role`.
    ///
    /// Only the rpc and monitoring ports (and every non-bootstrap network
    /// port) come from the allocator; everything else is derived from the
    /// layout and the bootstrap identity.
    pub fn build(
        role: NodeRole,
        id: ValidatorId,
        layout: &ClusterLayout,
        bootstrap: &BootstrapPeer,
        allocator: &PortAllocator,
    ) -> SimulationResult<Self> {
        let network = match role {
            NodeRole::Bootstrap => bootstrap.network_port,
            NodeRole::Proposer | NodeRole::Peer => allocator.allocate()?,
        };
        let ports = NodePorts {
            network,
            rpc: allocator.allocate()?,
            monitoring: allocator.allocate()?,
        };

        Ok(Self::with_ports(role, id, layout, bootstrap, ports))
    }

    /// Build the descriptor with explicit ports
    pub fn with_ports(
        role: NodeRole,
        id: ValidatorId,
        layout: &ClusterLayout,
        bootstrap: &BootstrapPeer,
        ports: NodePorts,
    ) -> Self {
        let data_dir = layout.data_dir(id);
        let peer_address = match role {
            NodeRole::Bootstrap => None,
            NodeRole::Proposer | NodeRole::Peer => Some(bootstrap.multiaddr()),
        };

        let launch_args = LaunchArgs::new()
            .flag("--network.#is_none", "false")
            .flag("--base_layer.node_url", &layout.base_layer_node_url)
            .flag("--storage.db_config.path_prefix", data_dir.as_os_str())
            .flag("--consensus.#is_none", "false")
            .flag("--consensus.validator_id", format!("0x{:x}", id))
            .flag("--consensus.num_of_validators", layout.num_validators.to_string())
            .flag("--network.tcp_port", ports.network.to_string())
            .flag("--rpc.server_address", format!("{}:{}", NODE_HOST, ports.rpc))
            .flag(
                "--monitoring_gateway.server_address",
                format!("{}:{}", NODE_HOST, ports.monitoring),
            );

        let launch_args = match &peer_address {
            None => launch_args.flag("--network.secret_key", &bootstrap.secret_key),
            Some(address) => launch_args
                .flag("--network.bootstrap_peer_multiaddr.#is_none", "false")
                .flag("--network.bootstrap_peer_multiaddr", address),
        };

        Self {
            id,
            role,
            data_dir,
            log_path: layout.log_path(id),
            ports,
            peer_address,
            launch_args: launch_args.into_inner(),
        }
    }

    /// Monitoring endpoint base, e.g. `http://127.0.0.1:4012`
    pub fn monitoring_base_url(&self) -> String {
        format!("http://{}:{}", NODE_HOST, self.ports.monitoring)
    }
}

#[derive(Default)]
struct LaunchArgs(Vec<OsString>);

impl LaunchArgs {
    fn new() -> Self {
        Self::default()
    }

    fn flag(mut self, name: &str, value: impl Into<OsString>) -> Self {
        self.0.push(name.into());
        self.0.push(value.into());
        self
    }

    fn into_inner(self) -> Vec<OsString> {
        self.0
    }
}
