use nix::unistd::Uid;
use std::convert::Infallible;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cgroup::{self, CgroupManager, CgroupStats};
use crate::config::{
    ENV_CGROUP, ENV_CHILD_MARKER, ENV_CONTAINER_ID, ENV_HOSTNAME, ENV_NETWORK, ENV_ROOTFS,
    EngineConfig,
};
use crate::error::{ContainerError, ContainerResult, Context};
use crate::filesystem::FilesystemManager;
use crate::namespace::{IdMapping, NamespaceConfig, NamespaceManager};
use crate::network::{NetworkProvisioner, VethProvisioner};
use crate::process::{ProcessManager, SpawnRequest};
use crate::registry::{Container, ContainerStatus, Registry, generate_id};
use crate::rootfs::RootfsProvider;

const CGROUP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Parameters of `run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub command: Vec<String>,
    /// `100M`, `1G` or plain bytes.
    pub memory: Option<String>,
    /// `max` or `<quota> <period>`.
    pub cpu: Option<String>,
    /// Operator-owned root; the per-container default is used when absent.
    pub rootfs: Option<PathBuf>,
    pub hostname: Option<String>,
    pub network: bool,
    pub user_namespace: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub id: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone)]
pub struct InspectReport {
    pub container: Container,
    pub alive: bool,
    pub state: Option<String>,
    pub cgroup: Option<CgroupStats>,
    pub namespaces: Vec<(String, String)>,
}

/// What the isolated child reads from its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildContext {
    pub container_id: String,
    pub rootfs: PathBuf,
    pub cgroup: Option<PathBuf>,
    pub hostname: String,
    pub network: bool,
}

impl ChildContext {
    pub fn from_env() -> ContainerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ContainerResult<Self> {
        if lookup(ENV_CHILD_MARKER).as_deref() != Some("1") {
            return Err(ContainerError::initialization(format!(
                "{ENV_CHILD_MARKER} is not set; the child entry is only reachable through run/start"
            )));
        }
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ContainerError::initialization(format!("{key} not set")))
        };
        Ok(Self {
            container_id: required(ENV_CONTAINER_ID)?,
            rootfs: PathBuf::from(required(ENV_ROOTFS)?),
            cgroup: lookup(ENV_CGROUP).filter(|v| !v.is_empty()).map(PathBuf::from),
            hostname: required(ENV_HOSTNAME)?,
            network: lookup(ENV_NETWORK).as_deref() == Some("1"),
        })
    }
}

/// Drives the container lifecycle. Owns the registry for this engine instance.
pub struct ContainerEngine {
    config: EngineConfig,
    registry: Registry,
    cgroups: CgroupManager,
    rootfs: RootfsProvider,
    network: Box<dyn NetworkProvisioner>,
}

impl ContainerEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_network(config, Box::new(VethProvisioner))
    }

    pub fn with_network(config: EngineConfig, network: Box<dyn NetworkProvisioner>) -> Self {
        Self {
            registry: Registry::new(&config.state_dir),
            cgroups: CgroupManager::new(&config.cgroup_root),
            rootfs: RootfsProvider::new(config.image.clone()),
            network,
            config,
        }
    }

    /// Creates a container and runs it to completion. Steps that already happened are left
    /// in place when a later one fails.
    pub fn create_and_run(&mut self, options: RunOptions) -> ContainerResult<RunOutcome> {
        if options.command.is_empty() {
            return Err(ContainerError::invalid_configuration("command must not be empty"));
        }
        Self::require_privileges(options.user_namespace)?;

        let id = generate_id();
        log::info!("Creating container {id} for {:?}", options.command);
        let rootfs = options
            .rootfs
            .clone()
            .unwrap_or_else(|| self.config.default_rootfs(&id));
        self.rootfs
            .ensure(&rootfs)
            .context(format!("preparing rootfs for {id}"))?;

        let cgroup = self.cgroups.create(&id)?;
        Self::apply_limits(&cgroup, options.memory.as_deref(), options.cpu.as_deref());

        let mut container = Container::new(&id, options.command, rootfs);
        container.cgroup = Some(cgroup);
        container.hostname = options.hostname;
        container.network = options.network;
        container.user_namespace = options.user_namespace;

        let exit_code = self.spawn_and_wait(container)?;
        Ok(RunOutcome { id, exit_code })
    }

    /// Runs a stopped container's command again with its stored root and cgroup.
    pub fn start(&mut self, id: &str) -> ContainerResult<RunOutcome> {
        let container = self.registry.lookup(id)?;
        Self::require_privileges(container.user_namespace)?;
        if container.is_running() && ProcessManager::is_alive(container.pid) {
            log::warn!(
                "Container {id} is recorded as running with live PID {}; starting another instance",
                container.pid
            );
        }
        log::info!("Starting container {id}: {:?}", container.command);
        let exit_code = self.spawn_and_wait(container)?;
        Ok(RunOutcome {
            id: id.to_string(),
            exit_code,
        })
    }

    /// SIGKILLs the recorded pid and marks the container stopped. The pid is not checked
    /// against the original process and the exit is not awaited.
    pub fn stop(&mut self, id: &str) -> ContainerResult<()> {
        let mut container = self.registry.lookup(id)?;
        if let Err(e) = ProcessManager::kill(container.pid) {
            log::warn!("Stopping {id}: {e}");
        } else {
            log::info!("Sent SIGKILL to PID {} of container {id}", container.pid);
        }
        container.status = ContainerStatus::Stopped;
        self.registry.persist(&container)?;
        self.registry.put(container);
        Ok(())
    }

    /// Kills a running container and forgets it, deleting its cgroup node and, when the
    /// engine created it, its root filesystem. Cleanup problems are only logged.
    pub fn remove(&mut self, id: &str) -> ContainerResult<()> {
        let container = self.registry.lookup(id)?;
        if container.is_running() {
            match ProcessManager::kill(container.pid) {
                Ok(()) => log::info!("Container process {} killed", container.pid),
                Err(e) => log::warn!("Failed to kill process {}: {e}", container.pid),
            }
        }
        match self.registry.remove_record(id) {
            Ok(true) => {}
            Ok(false) => log::warn!("Metadata file for {id} was already gone"),
            Err(e) => log::warn!("Failed to remove metadata file: {e}"),
        }
        self.registry.delete(id);

        if let Some(node) = &container.cgroup {
            if let Err(e) = cgroup::delete_node(node, CGROUP_DRAIN_TIMEOUT) {
                log::warn!("Leaving cgroup of {id} behind: {e}");
            }
        }
        if self.config.owns_rootfs(id, &container.rootfs) {
            let dir = self.config.container_dir(id);
            if let Err(e) = fs::remove_dir_all(&dir) {
                log::warn!("Failed to remove {dir:?}: {e}");
            }
        }
        log::info!("Container {id} removed");
        Ok(())
    }

    pub fn inspect(&mut self, id: &str) -> ContainerResult<InspectReport> {
        let container = self.registry.lookup(id)?;
        let alive = ProcessManager::is_alive(container.pid);
        let state = alive
            .then(|| ProcessManager::process_state(container.pid))
            .flatten();
        let cgroup = container
            .cgroup
            .as_deref()
            .filter(|path| path.exists())
            .map(cgroup::read_stats);
        let namespaces = if alive {
            NamespaceManager::list_namespaces(container.pid).unwrap_or_else(|e| {
                log::debug!("Unable to read namespaces of {}: {e}", container.pid);
                Vec::new()
            })
        } else {
            Vec::new()
        };
        Ok(InspectReport {
            container,
            alive,
            state,
            cgroup,
            namespaces,
        })
    }

    pub fn list(&self) -> ContainerResult<Vec<Container>> {
        self.registry.list()
    }

    fn require_privileges(user_namespace: bool) -> ContainerResult<()> {
        if !user_namespace && !Uid::effective().is_root() {
            log::error!("Root privileges required for container operations");
            return Err(ContainerError::RootRequired);
        }
        Ok(())
    }

    fn apply_limits(node: &Path, memory: Option<&str>, cpu: Option<&str>) {
        if let Some(memory) = memory {
            if let Err(e) = cgroup::set_memory_limit(node, memory) {
                log::warn!("Cannot set memory limit, running without one: {e}");
            }
        }
        if let Some(cpu) = cpu {
            if let Err(e) = cgroup::set_cpu_quota(node, cpu) {
                log::warn!("Cannot set CPU quota, running without one: {e}");
            }
        }
    }

    fn spawn_and_wait(&mut self, mut container: Container) -> ContainerResult<i32> {
        let namespaces = NamespaceConfig::default()
            .with_network(container.network)
            .with_user(container.user_namespace);
        let hostname = container
            .hostname
            .clone()
            .unwrap_or_else(|| self.config.hostname.clone());
        let request = SpawnRequest {
            container_id: &container.id,
            command: &container.command,
            rootfs: &container.rootfs,
            cgroup: container.cgroup.as_deref(),
            hostname: &hostname,
            namespaces,
        };
        let child = ProcessManager::spawn_isolated(&request)?;
        let pid = child.pid;

        container.pid = pid.as_raw();
        container.status = ContainerStatus::Running;
        self.registry.persist(&container)?;
        self.registry.put(container.clone());
        log::info!("Container {} registered with PID {pid}", container.id);

        if namespaces.isolate_user {
            if let Err(e) = NamespaceManager::write_id_mappings(pid, IdMapping::current_user()) {
                // The child cannot continue unmapped; dropping the gate makes it exit.
                drop(child);
                let _ = ProcessManager::wait_for_child(pid);
                return Err(e);
            }
        }
        if namespaces.isolate_net {
            if let Err(e) = self.network.attach(&container.id, pid) {
                log::warn!("Network setup failed, container keeps loopback only: {e}");
            }
        }
        child.release()?;
        ProcessManager::wait_for_child(pid)
    }
}

/// Runs inside the new namespaces. Never returns on success: the process image is replaced
/// by the container command.
pub fn child_entry(command: &[String]) -> ContainerResult<Infallible> {
    let ctx = ChildContext::from_env()?;
    log::info!(
        "Child for container {} started (PID {} in namespace)",
        ctx.container_id,
        nix::unistd::getpid()
    );
    if let Some(cgroup) = &ctx.cgroup {
        if let Err(e) = cgroup::add_process(cgroup, nix::unistd::getpid().as_raw()) {
            log::warn!("Cannot add self to cgroup, running unconfined: {e}");
        }
    }
    if ctx.network {
        if let Err(e) = VethProvisioner.configure_inside(&ctx.container_id) {
            log::warn!("Container-side network setup failed: {e}");
        }
    }
    FilesystemManager::setup_container_filesystem(&ctx.rootfs)
        .context("mount setup failed")?;
    if let Err(e) = NamespaceManager::set_hostname(&ctx.hostname) {
        log::warn!("{e}");
    }
    ProcessManager::exec_container_command(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::process::{Child, Command};

    struct Fixture {
        _state: tempfile::TempDir,
        _cgroups: tempfile::TempDir,
        engine: ContainerEngine,
    }

    fn fixture() -> Fixture {
        let state = tempfile::tempdir().unwrap();
        let cgroups = tempfile::tempdir().unwrap();
        let config = EngineConfig::default()
            .with_state_dir(state.path())
            .with_cgroup_root(cgroups.path());
        Fixture {
            engine: ContainerEngine::new(config),
            _state: state,
            _cgroups: cgroups,
        }
    }

    fn register(engine: &mut ContainerEngine, id: &str, pid: i32) -> Container {
        let mut container = Container::new(
            id,
            vec!["/bin/sleep".into(), "30".into()],
            engine.config.default_rootfs(id),
        );
        container.pid = pid;
        container.status = ContainerStatus::Running;
        engine.registry.persist(&container).unwrap();
        container
    }

    fn exited_child() -> Child {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        child
    }

    // The recorded pid belongs to a plain `sleep` the engine never spawned: stop signals
    // whatever currently holds that pid.
    #[test]
    fn stop_kills_whatever_process_holds_the_recorded_pid() {
        let mut fx = fixture();
        let mut sleeper = Command::new("sleep").arg("30").spawn().unwrap();
        register(&mut fx.engine, "run00001", sleeper.id() as i32);

        fx.engine.stop("run00001").unwrap();
        let status = sleeper.wait().unwrap();
        assert!(!status.success());

        let report = fx.engine.inspect("run00001").unwrap();
        assert_eq!(report.container.status, ContainerStatus::Stopped);
        assert!(!report.alive);
    }

    #[test]
    fn stop_after_process_already_exited_still_marks_stopped() {
        let mut fx = fixture();
        let child = exited_child();
        register(&mut fx.engine, "gone0001", child.id() as i32);

        fx.engine.stop("gone0001").unwrap();

        // A fresh engine only sees what reached the disk.
        let config = fx.engine.config.clone();
        let mut other = ContainerEngine::new(config);
        let report = other.inspect("gone0001").unwrap();
        assert_eq!(report.container.status, ContainerStatus::Stopped);
    }

    #[test]
    fn remove_of_exited_container_clears_registry() {
        let mut fx = fixture();
        let child = exited_child();
        register(&mut fx.engine, "dead0001", child.id() as i32);
        let rootfs = fx.engine.config.default_rootfs("dead0001");
        fs::create_dir_all(&rootfs).unwrap();

        fx.engine.remove("dead0001").unwrap();

        assert!(fx.engine.registry.get("dead0001").is_none());
        assert!(!fx.engine.registry.record_path("dead0001").exists());
        assert!(!rootfs.exists());
        assert!(matches!(
            fx.engine.inspect("dead0001"),
            Err(ContainerError::NotFound { .. })
        ));
    }

    #[test]
    fn remove_keeps_operator_owned_rootfs() {
        let mut fx = fixture();
        let own_root = tempfile::tempdir().unwrap();
        let child = exited_child();
        let mut container = register(&mut fx.engine, "keep0001", child.id() as i32);
        container.rootfs = own_root.path().to_path_buf();
        container.status = ContainerStatus::Stopped;
        fx.engine.registry.persist(&container).unwrap();

        fx.engine.remove("keep0001").unwrap();
        assert!(own_root.path().exists());
    }

    #[test]
    fn remove_deletes_empty_cgroup_node() {
        let mut fx = fixture();
        let child = exited_child();
        let mut container = register(&mut fx.engine, "cgrp0001", child.id() as i32);
        let node = fx.engine.cgroups.node_path("cgrp0001");
        fs::create_dir_all(&node).unwrap();
        container.cgroup = Some(node.clone());
        fx.engine.registry.persist(&container).unwrap();

        fx.engine.remove("cgrp0001").unwrap();
        assert!(!node.exists());
    }

    #[test]
    fn remove_deletes_recorded_cgroup_not_one_under_current_root() {
        let mut fx = fixture();
        let elsewhere = tempfile::tempdir().unwrap();
        let recorded = elsewhere.path().join("cellbox").join("moved001");
        fs::create_dir_all(&recorded).unwrap();
        let decoy = fx.engine.cgroups.node_path("moved001");
        fs::create_dir_all(&decoy).unwrap();

        let child = exited_child();
        let mut container = register(&mut fx.engine, "moved001", child.id() as i32);
        container.cgroup = Some(recorded.clone());
        fx.engine.registry.persist(&container).unwrap();

        fx.engine.remove("moved001").unwrap();
        assert!(!recorded.exists());
        assert!(decoy.exists());
    }

    #[test]
    fn unknown_ids_are_reported() {
        let mut fx = fixture();
        for result in [fx.engine.stop("nothere0"), fx.engine.remove("nothere0")] {
            assert!(matches!(result, Err(ContainerError::NotFound { .. })));
        }
        assert!(fx.engine.start("nothere0").is_err());
    }

    #[test]
    fn inspect_reads_cgroup_figures() {
        let mut fx = fixture();
        let child = exited_child();
        let mut container = register(&mut fx.engine, "insp0001", child.id() as i32);
        let node = fx.engine.cgroups.node_path("insp0001");
        fs::create_dir_all(&node).unwrap();
        fs::write(node.join("memory.max"), "104857600\n").unwrap();
        fs::write(node.join("cpu.max"), "max 100000\n").unwrap();
        container.cgroup = Some(node);
        fx.engine.registry.persist(&container).unwrap();

        let report = fx.engine.inspect("insp0001").unwrap();
        let stats = report.cgroup.unwrap();
        assert_eq!(stats.memory_limit, Some(Some(104857600)));
        assert_eq!(stats.cpu_limit, Some(cgroup::CpuLimit::Unlimited));
        assert!(report.namespaces.is_empty());
    }

    #[test]
    fn list_returns_records_sorted_by_id() {
        let mut fx = fixture();
        register(&mut fx.engine, "zzzz0001", 0);
        register(&mut fx.engine, "aaaa0001", 0);
        let ids: Vec<String> = fx.engine.list().unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["aaaa0001", "zzzz0001"]);
    }

    #[test]
    fn empty_command_is_rejected_before_any_side_effect() {
        let mut fx = fixture();
        let err = fx.engine.create_and_run(RunOptions::default()).unwrap_err();
        assert!(matches!(err, ContainerError::InvalidConfiguration { .. }));
        assert!(fx.engine.list().unwrap().is_empty());
    }

    #[test]
    fn child_context_requires_marker() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_CONTAINER_ID, "ctx00001"),
            (ENV_ROOTFS, "/tmp/cellbox/ctx00001/rootfs"),
            (ENV_HOSTNAME, "cellbox"),
        ]);
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());
        assert!(ChildContext::from_lookup(lookup).is_err());

        let mut env = env.clone();
        env.insert(ENV_CHILD_MARKER, "1");
        env.insert(ENV_CGROUP, "/sys/fs/cgroup/cellbox/ctx00001");
        let ctx = ChildContext::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(ctx.container_id, "ctx00001");
        assert_eq!(
            ctx.cgroup,
            Some(PathBuf::from("/sys/fs/cgroup/cellbox/ctx00001"))
        );
        assert!(!ctx.network);
    }
}
