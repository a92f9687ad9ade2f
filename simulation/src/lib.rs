//! # Consensus Simulation - Cluster Orchestration Primitives
//!
//! This library provides the building blocks for running a real consensus
//! implementation as a cluster of independent OS processes on one machine.
//! The harness crate composes these pieces into a supervised simulation run.
//!
//! ## Architecture
//!
//! - **Ports**: collision-free TCP port allocation for every node listener
//! - **Descriptor**: role assignment, startup ordering and launch arguments
//! - **Lock**: advisory exclusive lock over a shared storage root
//! - **Node**: supervised child process (start, graceful stop, progress query)
//! - **Metrics**: scraping a single counter from the plaintext monitoring endpoint
//!
//! ## Usage
//!
//! ```rust,no_run
//! use consensus_simulation::{
//!     BootstrapPeer, ClusterLayout, NodeDescriptor, PortAllocator, SimulationConfig,
//! };
//!
//! # async fn demo() -> consensus_simulation::SimulationResult<()> {
//! let config = SimulationConfig::new("http://localhost:8545")
//!     .with_validators(4);
//! config.validate()?;
//!
//! let allocator = PortAllocator::new();
//! let bootstrap = BootstrapPeer::reserve(&allocator)?;
//! let layout = ClusterLayout::from_config(&config, "/tmp/sim/data".into(), "/tmp/sim/logs".into());
//!
//! for (role, id) in consensus_simulation::startup_order(config.num_validators) {
//!     let descriptor = NodeDescriptor::build(role, id, &layout, &bootstrap, &allocator)?;
//!     println!("{} -> {:?}", descriptor.id, descriptor.ports);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub mod config;
pub mod descriptor;
pub mod lock;
pub mod metrics;
pub mod node;
pub mod ports;

pub use config::SimulationConfig;
pub use descriptor::{
    startup_order, BootstrapPeer, ClusterLayout, NodeDescriptor, NodePorts, NodeRole,
    BOOTSTRAP_PEER_ID, BOOTSTRAP_SECRET_KEY, BOOTSTRAP_VALIDATOR, PROPOSER_VALIDATOR,
};
pub use lock::{DirectoryLock, LockError, LockMeta, LOCK_FILE_NAME};
pub use metrics::{parse_counter, MetricsClient, ScrapeError, METRICS_PATH};
pub use node::{NodeFactory, ProcessNode, ProcessNodeFactory, Supervised};
pub use ports::PortAllocator;

/// Validator identifier, also used as the node ordinal within a cluster
pub type ValidatorId = u64;

/// Consensus height as reported by the progress counter
pub type Height = u64;

/// Errors raised while preparing or supervising a simulated cluster
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Configuration rejected before anything was launched
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shared storage root could not be locked
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Node binary could not be started
    #[error("failed to spawn validator {id} from {binary:?}: {source}")]
    Spawn {
        id: ValidatorId,
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Signalling or reaping a node process failed
    #[error("failed to stop validator {id}: {source}")]
    Signal {
        id: ValidatorId,
        #[source]
        source: io::Error,
    },

    /// Progress counter present but unreadable
    #[error("malformed metrics from validator {id}: {reason}")]
    MalformedMetrics { id: ValidatorId, reason: ScrapeError },

    /// No free port could be probed
    #[error("port allocation failed: {0}")]
    PortAllocation(#[source] io::Error),

    /// HTTP client for scraping progress could not be built
    #[error("failed to build metrics client: {0}")]
    MetricsClient(#[from] reqwest::Error),

    /// Filesystem error while preparing directories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SimulationError {
    /// True for errors that are raised before any process exists
    pub fn is_config_error(&self) -> bool {
        matches!(self, SimulationError::InvalidConfig(_))
    }

    /// True when another run holds the storage root
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, SimulationError::Lock(LockError::AlreadyLocked { .. }))
    }
}

/// Result type for simulation operations
pub type SimulationResult<T> = Result<T, SimulationError>;
