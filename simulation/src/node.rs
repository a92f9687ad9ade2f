//! Supervised node processes.
//!
//! Every node runs in its own process group so that stopping it also stops
//! anything the node binary spawned. Stop sends `SIGTERM` to the group, reaps
//! the leader and then waits until no member of the group is left. There is
//! no force-kill escalation: a member that ignores the signal blocks `stop`.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, trace, warn};

use crate::descriptor::NodeDescriptor;
use crate::metrics::MetricsClient;
use crate::{Height, SimulationError, SimulationResult, ValidatorId};

/// Interval between checks for remaining process group members
const GROUP_EXIT_POLL: Duration = Duration::from_millis(20);

type Signaller = fn(u32) -> io::Result<()>;

/// Lifecycle of one cluster member as seen by the controller
#[async_trait]
pub trait Supervised: Send + Sync {
    /// Descriptor the node was created from
    fn descriptor(&self) -> &NodeDescriptor;

    fn id(&self) -> ValidatorId {
        self.descriptor().id
    }

    /// Launch the node. Fatal for the simulation on error.
    async fn start(&mut self) -> SimulationResult<()>;

    /// Stop the node and wait for it to exit. A no-op when not running.
    async fn stop(&mut self) -> SimulationResult<()>;

    /// Current progress counter, `None` while the node is not ready
    async fn query_progress(&self) -> SimulationResult<Option<Height>>;

    fn is_running(&self) -> bool;
}

/// Creates supervised nodes from descriptors
pub trait NodeFactory: Send + Sync {
    type Node: Supervised;

    fn create(&self, descriptor: NodeDescriptor) -> Self::Node;
}

/// A node backed by a real child process
#[derive(Debug)]
pub struct ProcessNode {
    descriptor: NodeDescriptor,
    binary: PathBuf,
    log_filter: String,
    metrics: MetricsClient,
    child: Option<Child>,
    /// Process group of the running child, equal to its pid
    pgid: Option<u32>,
    signal: Signaller,
}

impl ProcessNode {
    pub fn new(
        descriptor: NodeDescriptor,
        binary: impl Into<PathBuf>,
        log_filter: impl Into<String>,
        metrics: MetricsClient,
    ) -> Self {
        Self {
            descriptor,
            binary: binary.into(),
            log_filter: log_filter.into(),
            metrics,
            child: None,
            pgid: None,
            signal: signal_group,
        }
    }

    /// OS process id while running
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    fn open_log(&self) -> io::Result<(Stdio, Stdio)> {
        let log = File::create(&self.descriptor.log_path)?;
        let err_log = log.try_clone()?;
        Ok((Stdio::from(log), Stdio::from(err_log)))
    }
}

#[async_trait]
impl Supervised for ProcessNode {
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    async fn start(&mut self) -> SimulationResult<()> {
        if self.child.is_some() {
            return Ok(());
        }

        let id = self.descriptor.id;
        let spawn_error = |source| SimulationError::Spawn {
            id,
            binary: self.binary.clone(),
            source,
        };

        let (stdout, stderr) = self.open_log().map_err(spawn_error)?;

        let mut command = Command::new(&self.binary);
        command
            .args(&self.descriptor.launch_args)
            .env("RUST_LOG", &self.log_filter)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(spawn_error)?;

        self.pgid = child.id();
        info!(
            validator = id,
            role = %self.descriptor.role,
            pid = ?child.id(),
            monitoring_port = self.descriptor.ports.monitoring,
            log = %self.descriptor.log_path.display(),
            "started validator"
        );
        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self) -> SimulationResult<()> {
        let id = self.descriptor.id;
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };

        if let Some(pid) = child.id() {
            if let Err(source) = (self.signal)(pid) {
                // The group is already gone when the leader has exited.
                if source.raw_os_error() != Some(libc::ESRCH) {
                    warn!(validator = id, pid, error = %source, "failed to signal process group");
                    return Err(SimulationError::Signal { id, source });
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|source| SimulationError::Signal { id, source })?;
        debug!(validator = id, %status, "validator leader exited");

        if let Some(pgid) = self.pgid {
            wait_for_group_exit(id, pgid).await;
        }

        self.child = None;
        self.pgid = None;
        Ok(())
    }

    async fn query_progress(&self) -> SimulationResult<Option<Height>> {
        self.metrics
            .fetch(&self.descriptor.monitoring_base_url())
            .await
            .map_err(|reason| SimulationError::MalformedMetrics {
                id: self.descriptor.id,
                reason,
            })
    }

    fn is_running(&self) -> bool {
        self.child.is_some()
    }
}

impl Drop for ProcessNode {
    fn drop(&mut self) {
        if let (Some(_), Some(pgid)) = (&self.child, self.pgid) {
            warn!(validator = self.descriptor.id, pgid, "node dropped while running, signalling group");
            let _ = signal_group(pgid);
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32) -> io::Result<()> {
    // The child was spawned with process_group(0), so its pgid equals its pid.
    // SAFETY: killpg takes plain integers and passes no memory.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "process groups require a unix host"))
}

/// Wait until no live member of process group `pgid` remains
async fn wait_for_group_exit(id: ValidatorId, pgid: u32) {
    let mut polls: u64 = 0;
    while group_has_live_members(pgid) {
        if polls > 0 && polls % 250 == 0 {
            warn!(validator = id, pgid, "process group still has live members");
        }
        polls += 1;
        tokio::time::sleep(GROUP_EXIT_POLL).await;
    }
    trace!(validator = id, pgid, polls, "process group exited");
}

/// Whether any non-zombie process still belongs to group `pgid`.
///
/// Orphaned members are reaped by init rather than by this process, so a
/// zombie waiting for that reap counts as gone.
#[cfg(target_os = "linux")]
pub fn group_has_live_members(pgid: u32) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return group_signalable(pgid);
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter_map(|stat| parse_stat(&stat))
        .any(|(state, pgrp)| pgrp == pgid && state != 'Z' && state != 'X')
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn group_has_live_members(pgid: u32) -> bool {
    group_signalable(pgid)
}

#[cfg(not(unix))]
pub fn group_has_live_members(_pgid: u32) -> bool {
    false
}

#[cfg(unix)]
fn group_signalable(pgid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence and passes no memory.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// State and process group fields of `/proc/<pid>/stat`
#[cfg(target_os = "linux")]
fn parse_stat(stat: &str) -> Option<(char, u32)> {
    // The command name may contain spaces, so fields are read after its ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

/// Factory producing [`ProcessNode`]s that share one metrics client
#[derive(Debug, Clone)]
pub struct ProcessNodeFactory {
    binary: PathBuf,
    log_filter: String,
    metrics: MetricsClient,
}

impl ProcessNodeFactory {
    pub fn new(binary: impl Into<PathBuf>, log_filter: impl Into<String>, metrics: MetricsClient) -> Self {
        Self {
            binary: binary.into(),
            log_filter: log_filter.into(),
            metrics,
        }
    }
}

impl NodeFactory for ProcessNodeFactory {
    type Node = ProcessNode;

    fn create(&self, descriptor: NodeDescriptor) -> ProcessNode {
        ProcessNode::new(descriptor, self.binary.clone(), self.log_filter.clone(), self.metrics.clone())
    }
}

/// Whether a process with `pid` is still alive (zombies count as gone)
#[cfg(target_os = "linux")]
pub fn process_exists(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => parse_stat(&stat).is_some_and(|(state, _)| state != 'Z' && state != 'X'),
        Err(_) => false,
    }
}

/// Whether a process with `pid` still exists
#[cfg(all(unix, not(target_os = "linux")))]
pub fn process_exists(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence and passes no memory.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::descriptor::{BootstrapPeer, ClusterLayout, NodePorts, NodeRole};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn fake_binary(dir: &Path) -> PathBuf {
        let path = dir.join("fake_node.sh");
        std::fs::write(&path, "#!/bin/sh\necho \"fake node $*\"\nexec sleep 600\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn descriptor(root: &Path) -> NodeDescriptor {
        let layout = ClusterLayout {
            num_validators: 2,
            data_root: root.join("data"),
            log_root: root.to_path_buf(),
            base_layer_node_url: "http://localhost:8545".to_string(),
        };
        let ports = NodePorts { network: 1, rpc: 2, monitoring: 3 };
        NodeDescriptor::with_ports(NodeRole::Proposer, 0, &layout, &BootstrapPeer::with_port(4), ports)
    }

    fn metrics() -> MetricsClient {
        MetricsClient::new("papyrus_consensus_height", Duration::from_millis(200)).unwrap()
    }

    #[tokio::test]
    async fn test_start_and_stop_process() {
        let temp = tempfile::tempdir().unwrap();
        let mut node = ProcessNode::new(descriptor(temp.path()), fake_binary(temp.path()), "info", metrics());

        node.start().await.unwrap();
        assert!(node.is_running());
        let pid = node.pid().unwrap();
        assert!(process_exists(pid));

        node.stop().await.unwrap();
        assert!(!node.is_running());
        assert!(!process_exists(pid));

        // Second stop is a no-op.
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_never_started_is_noop() {
        let temp = tempfile::tempdir().unwrap();
        let mut node = ProcessNode::new(descriptor(temp.path()), fake_binary(temp.path()), "info", metrics());
        assert!(node.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let temp = tempfile::tempdir().unwrap();
        let mut node = ProcessNode::new(descriptor(temp.path()), temp.path().join("missing"), "info", metrics());

        match node.start().await {
            Err(SimulationError::Spawn { id, .. }) => assert_eq!(id, 0),
            other => panic!("expected spawn error, got {:?}", other),
        }
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_launch_args_reach_process_log() {
        let temp = tempfile::tempdir().unwrap();
        let descriptor = descriptor(temp.path());
        let log_path = descriptor.log_path.clone();
        let mut node = ProcessNode::new(descriptor, fake_binary(temp.path()), "info", metrics());

        node.start().await.unwrap();
        let mut logged = String::new();
        for _ in 0..50 {
            logged = std::fs::read_to_string(&log_path).unwrap_or_default();
            if !logged.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        node.stop().await.unwrap();

        assert!(logged.contains("--consensus.validator_id 0x0"));
        assert!(logged.contains("--network.bootstrap_peer_multiaddr"));
    }

    /// Node script that backgrounds a member which records its pid and
    /// takes a second to exit after `SIGTERM`
    fn forking_binary(dir: &Path, member_pid: &Path) -> PathBuf {
        let path = dir.join("forking_node.sh");
        let script = format!(
            "#!/bin/sh\nsh -c 'echo $$ > \"{}\"; trap \"sleep 1; exit 0\" TERM; while :; do sleep 0.1; done' &\nexec sleep 600\n",
            member_pid.display()
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn read_pid(path: &Path) -> u32 {
        for _ in 0..100 {
            if let Some(pid) = std::fs::read_to_string(path).ok().and_then(|s| s.trim().parse().ok()) {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    #[tokio::test]
    async fn test_stop_waits_for_whole_process_group() {
        let temp = tempfile::tempdir().unwrap();
        let member_pid = temp.path().join("member.pid");
        let binary = forking_binary(temp.path(), &member_pid);
        let mut node = ProcessNode::new(descriptor(temp.path()), binary, "info", metrics());

        node.start().await.unwrap();
        let pgid = node.pid().unwrap();
        let member = read_pid(&member_pid).await;
        assert!(process_exists(member));
        assert!(group_has_live_members(pgid));

        node.stop().await.unwrap();

        assert!(!node.is_running());
        assert!(!process_exists(pgid));
        assert!(!process_exists(member), "group member {} outlived stop", member);
        assert!(!group_has_live_members(pgid));
    }

    #[tokio::test]
    async fn test_failed_signal_keeps_node_running() {
        let temp = tempfile::tempdir().unwrap();
        let mut node = ProcessNode::new(descriptor(temp.path()), fake_binary(temp.path()), "info", metrics());
        node.signal = |_| Err(io::Error::from_raw_os_error(libc::EPERM));

        node.start().await.unwrap();
        let pid = node.pid().unwrap();

        match node.stop().await {
            Err(SimulationError::Signal { id, source }) => {
                assert_eq!(id, 0);
                assert_eq!(source.raw_os_error(), Some(libc::EPERM));
            }
            other => panic!("expected signal error, got {:?}", other),
        }
        assert!(node.is_running());
        assert_eq!(node.pid(), Some(pid));
        assert!(process_exists(pid));

        // The retained child can still be stopped once signalling works.
        node.signal = signal_group;
        node.stop().await.unwrap();
        assert!(!node.is_running());
        assert!(!process_exists(pid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_stat_with_spaces_in_name() {
        let stat = "4242 (fake (node) sh) S 1 4240 4240 0 -1 4194304";
        assert_eq!(parse_stat(stat), Some(('S', 4240)));
        assert_eq!(parse_stat("4242 (sh) Z 1"), None);
        assert_eq!(parse_stat("garbage"), None);
    }

    #[tokio::test]
    async fn test_unready_node_reports_none() {
        let temp = tempfile::tempdir().unwrap();
        let node = ProcessNode::new(descriptor(temp.path()), fake_binary(temp.path()), "info", metrics());
        assert!(matches!(node.query_progress().await, Ok(None)));
    }
}
