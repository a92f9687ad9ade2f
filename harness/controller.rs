//! Simulation controller.
//!
//! Drives one run through `Building → Launching → Monitoring → Stopping →
//! Released`. Whatever ends the run (a stop condition, an interrupt, or a
//! fatal error) the same teardown stops every node and releases the
//! directory lock before `run` returns.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use consensus_simulation::config::validate_existing_data_root;
use consensus_simulation::lock::release_slot;
use consensus_simulation::{
    startup_order, BootstrapPeer, ClusterLayout, DirectoryLock, Height, MetricsClient,
    NodeDescriptor, NodeFactory, PortAllocator, ProcessNodeFactory, SimulationConfig,
    SimulationError, SimulationResult, Supervised, ValidatorId,
};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::HarnessResult;
use crate::liveness::{LivenessConfig, LivenessEvent, LivenessMonitor, StopReason, TickVerdict};
use crate::utils::format_duration;
use crate::version_info;

/// Phase of a simulation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SimulationPhase {
    Building,
    Launching,
    Monitoring,
    Stopping,
    Released,
}

/// How a run that did not fail ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimulationOutcome {
    /// The configured duration elapsed; normal completion
    DurationElapsed,
    Stagnated { validators: Vec<ValidatorId> },
    Interrupted,
}

impl From<StopReason> for SimulationOutcome {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::DurationElapsed => SimulationOutcome::DurationElapsed,
            StopReason::Stagnated { validators } => SimulationOutcome::Stagnated { validators },
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Harness build that produced the report
    pub harness_version: String,
    pub outcome: SimulationOutcome,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub data_root: PathBuf,
    pub log_root: PathBuf,
    /// Validator ids in the order their processes were started
    pub start_order: Vec<ValidatorId>,
    pub last_heights: BTreeMap<ValidatorId, Option<Height>>,
}

/// Storage and log directories of one run
#[derive(Debug, Clone)]
struct RunRoots {
    data_root: PathBuf,
    log_root: PathBuf,
}

/// What the launch and monitoring phases produced
#[derive(Debug, Default)]
struct RunProgress {
    outcome: Option<SimulationOutcome>,
    start_order: Vec<ValidatorId>,
    last_heights: BTreeMap<ValidatorId, Option<Height>>,
}

/// Owns one simulation run over nodes produced by `F`
pub struct SimulationController<F: NodeFactory> {
    config: SimulationConfig,
    factory: F,
    cancel: CancellationToken,
    phase_sender: watch::Sender<SimulationPhase>,
    event_sender: broadcast::Sender<LivenessEvent>,
}

impl SimulationController<ProcessNodeFactory> {
    /// Controller launching the configured node binary as real processes
    pub fn for_processes(config: SimulationConfig) -> HarnessResult<Self> {
        let metrics = MetricsClient::new(config.metric_name.clone(), config.scrape_timeout())?;
        let factory = ProcessNodeFactory::new(
            config.node_binary.clone(),
            config.node_log_filter.clone(),
            metrics,
        );
        Ok(Self::new(config, factory))
    }
}

impl<F: NodeFactory> SimulationController<F> {
    pub fn new(config: SimulationConfig, factory: F) -> Self {
        let (phase_sender, _) = watch::channel(SimulationPhase::Building);
        let (event_sender, _) = broadcast::channel(256);
        Self {
            config,
            factory,
            cancel: CancellationToken::new(),
            phase_sender,
            event_sender,
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Token that interrupts the run when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SimulationPhase> {
        self.phase_sender.subscribe()
    }

    pub fn subscribe_liveness(&self) -> broadcast::Receiver<LivenessEvent> {
        self.event_sender.subscribe()
    }

    pub fn phase(&self) -> SimulationPhase {
        *self.phase_sender.borrow()
    }

    fn set_phase(&self, phase: SimulationPhase) {
        info!(?phase, "simulation phase");
        self.phase_sender.send_replace(phase);
    }

    /// Run the simulation to completion.
    ///
    /// Configuration and lock errors return before any process exists.
    /// Every later error is returned only after teardown has finished.
    pub async fn run(&self) -> HarnessResult<SimulationReport> {
        let started_at = Utc::now();
        let run_start = Instant::now();
        self.set_phase(SimulationPhase::Building);

        self.config.validate()?;
        let roots = self.prepare_roots()?;
        let mut lock = Some(DirectoryLock::acquire(&roots.data_root).map_err(SimulationError::from)?);

        let mut nodes: Vec<F::Node> = Vec::new();
        let mut progress = RunProgress::default();
        let result = self.launch_and_monitor(&roots, &mut nodes, &mut progress).await;

        self.set_phase(SimulationPhase::Stopping);
        teardown(&mut nodes).await;
        release_slot(&mut lock);
        self.set_phase(SimulationPhase::Released);

        let elapsed = run_start.elapsed();
        if let Err(err) = result {
            error!(error = %err, elapsed = %format_duration(elapsed), "simulation failed");
            return Err(err);
        }

        let outcome = progress.outcome.unwrap_or(SimulationOutcome::Interrupted);
        info!(?outcome, elapsed = %format_duration(elapsed), "simulation finished");

        Ok(SimulationReport {
            harness_version: version_info(),
            outcome,
            started_at,
            elapsed_ms: elapsed.as_millis() as u64,
            data_root: roots.data_root,
            log_root: roots.log_root,
            start_order: progress.start_order,
            last_heights: progress.last_heights,
        })
    }

    /// Resolve and create the data and log roots.
    ///
    /// A supplied data root must already hold exactly the per-validator
    /// directories; otherwise a fresh run directory is created.
    fn prepare_roots(&self) -> SimulationResult<RunRoots> {
        let stamp = format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S%.6f"), std::process::id());

        let data_root = match &self.config.data_root {
            Some(root) => {
                validate_existing_data_root(root, self.config.num_validators)?;
                root.clone()
            }
            None => {
                let root = std::env::temp_dir().join(format!("consensus-sim-{}", stamp));
                fs::create_dir_all(&root)?;
                root
            }
        };

        let log_root = match &self.config.log_root {
            Some(root) => root.clone(),
            None => std::env::temp_dir().join(format!("consensus-sim-logs-{}", stamp)),
        };
        fs::create_dir_all(&log_root)?;

        info!(data_root = %data_root.display(), log_root = %log_root.display(), "prepared run directories");
        Ok(RunRoots { data_root, log_root })
    }

    async fn launch_and_monitor(
        &self,
        roots: &RunRoots,
        nodes: &mut Vec<F::Node>,
        progress: &mut RunProgress,
    ) -> HarnessResult<()> {
        for descriptor in self.build_descriptors(roots)? {
            nodes.push(self.factory.create(descriptor));
        }

        self.set_phase(SimulationPhase::Launching);
        for node in nodes.iter_mut() {
            if self.cancel.is_cancelled() {
                warn!("interrupted while launching");
                progress.outcome = Some(SimulationOutcome::Interrupted);
                return Ok(());
            }
            node.start().await?;
            progress.start_order.push(node.id());
        }

        self.set_phase(SimulationPhase::Monitoring);
        self.monitor(nodes, progress).await
    }

    /// Create data directories and build descriptors in startup order
    fn build_descriptors(&self, roots: &RunRoots) -> SimulationResult<Vec<NodeDescriptor>> {
        let layout = ClusterLayout::from_config(
            &self.config,
            roots.data_root.clone(),
            roots.log_root.clone(),
        );
        for id in 0..self.config.num_validators as ValidatorId {
            fs::create_dir_all(layout.data_dir(id))?;
        }

        let allocator = PortAllocator::new();
        let bootstrap = BootstrapPeer::reserve(&allocator)?;
        startup_order(self.config.num_validators)
            .into_iter()
            .map(|(role, id)| NodeDescriptor::build(role, id, &layout, &bootstrap, &allocator))
            .collect()
    }

    async fn monitor(&self, nodes: &[F::Node], progress: &mut RunProgress) -> HarnessResult<()> {
        let start = Instant::now();
        let period = self.config.monitoring_period();
        let mut monitor = LivenessMonitor::with_events(
            LivenessConfig::from(&self.config),
            start,
            self.event_sender.clone(),
        );

        let mut ticker = interval_at(start + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!(ticks = monitor.ticks(), "interrupted while monitoring");
                    progress.outcome = Some(SimulationOutcome::Interrupted);
                    progress.last_heights = monitor.last_heights();
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let readings = poll_all(nodes).await?;
            let verdict = monitor.evaluate(&readings, Instant::now());
            progress.last_heights = monitor.last_heights();

            if let TickVerdict::Stop(reason) = verdict? {
                progress.outcome = Some(reason.into());
                return Ok(());
            }
        }
    }
}

/// Query every node concurrently; the tick is complete only when all answered
async fn poll_all<N: Supervised>(nodes: &[N]) -> SimulationResult<Vec<(ValidatorId, Option<Height>)>> {
    join_all(nodes.iter().map(|node| async move { (node.id(), node.query_progress().await) }))
        .await
        .into_iter()
        .map(|(id, reading)| reading.map(|height| (id, height)))
        .collect()
}

/// Stop every node, continuing past individual failures
async fn teardown<N: Supervised>(nodes: &mut [N]) {
    for node in nodes.iter_mut() {
        if let Err(err) = node.stop().await {
            error!(validator = node.id(), error = %err, "failed to stop validator");
        }
    }
}
