//! Consensus Simulation Harness
//!
//! Runs a real consensus node binary as a local multi-process cluster and
//! watches it for liveness. The harness builds on the orchestration
//! primitives of `consensus-simulation` and adds the pieces that give a run
//! its shape: the per-tick liveness monitor, the simulation controller that
//! owns startup, monitoring and teardown, and layered settings loading for
//! the `run_simulation` binary.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use consensus_sim_harness::prelude::*;
//!
//! # async fn demo() -> HarnessResult<()> {
//! let config = SimulationConfig::new("http://localhost:8545")
//!     .with_validators(4)
//!     .with_duration(Some(std::time::Duration::from_secs(300)));
//!
//! let controller = SimulationController::for_processes(config)?;
//! let mut events = controller.subscribe_liveness();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! });
//!
//! let report = controller.run().await?;
//! println!("outcome: {:?}", report.outcome);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod controller;
pub mod liveness;
pub mod settings;

pub use controller::{SimulationController, SimulationOutcome, SimulationPhase, SimulationReport};
pub use liveness::{
    LivenessConfig, LivenessEvent, LivenessMonitor, ProgressState, StopReason, TickVerdict,
};
pub use settings::{load_settings, render_toml, ENV_PREFIX};

// Error types and result aliases
pub mod error {
    //! Error types for the harness

    use consensus_simulation::{Height, SimulationError, ValidatorId};

    /// Errors that end a simulation run
    #[derive(Debug, thiserror::Error)]
    pub enum HarnessError {
        /// Orchestration error from the core crate
        #[error("Simulation error: {0}")]
        Simulation(#[from] SimulationError),

        /// A validator's progress counter went backwards
        #[error("validator {id} progress regressed from {previous} to {current}")]
        ProgressRegression {
            id: ValidatorId,
            previous: Height,
            current: Height,
        },

        /// Settings file or environment could not be loaded
        #[error("Settings error: {0}")]
        Settings(#[from] config::ConfigError),

        /// Settings could not be rendered
        #[error("Settings render error: {0}")]
        Render(#[from] toml::ser::Error),

        /// I/O error
        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),
    }

    impl HarnessError {
        /// Process exit status for this error
        pub fn exit_code(&self) -> i32 {
            match self {
                HarnessError::Simulation(err) if err.is_config_error() => 2,
                HarnessError::Simulation(err) if err.is_lock_contention() => 3,
                HarnessError::Settings(_) | HarnessError::Render(_) => 2,
                HarnessError::ProgressRegression { .. } => 4,
                _ => 1,
            }
        }
    }

    /// Result type for harness operations
    pub type HarnessResult<T> = Result<T, HarnessError>;
}

pub use error::{HarnessError, HarnessResult};

/// Prelude for common imports
pub mod prelude {
    pub use crate::controller::{
        SimulationController, SimulationOutcome, SimulationPhase, SimulationReport,
    };
    pub use crate::error::{HarnessError, HarnessResult};
    pub use crate::liveness::{LivenessConfig, LivenessEvent, LivenessMonitor, StopReason};
    pub use consensus_simulation::{
        Height, NodeFactory, SimulationConfig, SimulationError, Supervised, ValidatorId,
    };
}

pub mod utils {
    //! Formatting helpers for reports and log lines

    use std::time::Duration;

    /// Format duration for display
    pub fn format_duration(duration: Duration) -> String {
        let secs = duration.as_secs();
        let millis = duration.subsec_millis();

        if secs > 0 {
            format!("{}.{:03}s", secs, millis)
        } else {
            format!("{}ms", millis)
        }
    }
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version information
pub fn version_info() -> String {
    format!("consensus-sim-harness {}", VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use consensus_simulation::{LockError, SimulationError};
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_version_info() {
        let version = version_info();
        assert!(version.contains("consensus-sim-harness"));
        assert!(version.contains(VERSION));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(utils::format_duration(Duration::from_millis(1500)), "1.500s");
        assert_eq!(utils::format_duration(Duration::from_millis(250)), "250ms");
    }

    #[test]
    fn test_exit_codes() {
        let config = HarnessError::from(SimulationError::InvalidConfig("n".to_string()));
        assert_eq!(config.exit_code(), 2);

        let locked = HarnessError::from(SimulationError::from(LockError::AlreadyLocked {
            path: PathBuf::from("/tmp/.simulation.lock"),
            holder_pid: None,
        }));
        assert_eq!(locked.exit_code(), 3);

        let regression = HarnessError::ProgressRegression { id: 1, previous: 7, current: 6 };
        assert_eq!(regression.exit_code(), 4);

        let io = HarnessError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(io.exit_code(), 1);
    }
}
