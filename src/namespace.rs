use nix::sched::CloneFlags;
use nix::unistd::{Gid, Pid, Uid, sethostname};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ContainerError, ContainerResult, Context};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceConfig {
    pub isolate_pid: bool,
    pub isolate_net: bool,
    pub isolate_mount: bool,
    pub isolate_uts: bool,
    pub isolate_ipc: bool,
    pub isolate_user: bool,
}
impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            isolate_pid: true,
            isolate_net: false,
            isolate_mount: true,
            isolate_uts: true,
            isolate_ipc: false,
            isolate_user: false,
        }
    }
}
impl NamespaceConfig {
    pub fn with_network(mut self, enabled: bool) -> Self {
        self.isolate_net = enabled;
        self
    }
    pub fn with_user(mut self, enabled: bool) -> Self {
        self.isolate_user = enabled;
        self
    }
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.isolate_pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.isolate_net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.isolate_mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.isolate_uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.isolate_ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.isolate_user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        flags
    }
}

/// Single-entry identity map: root inside the namespace is the invoking user outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub host_uid: u32,
    pub host_gid: u32,
}
impl IdMapping {
    pub fn current_user() -> Self {
        Self {
            host_uid: Uid::current().as_raw(),
            host_gid: Gid::current().as_raw(),
        }
    }
    pub fn uid_map(&self) -> String {
        format!("0 {} 1", self.host_uid)
    }
    pub fn gid_map(&self) -> String {
        format!("0 {} 1", self.host_gid)
    }
}

#[derive(Debug)]
pub struct NamespaceManager;
impl NamespaceManager {
    pub fn set_hostname(hostname: &str) -> ContainerResult<()> {
        log::info!("Setting hostname to: {hostname}");
        sethostname(hostname)
            .map_err(|e| ContainerError::NamespaceSetup {
                message: format!("Failed to set hostname: {e}"),
            })
            .context("sethostname system call failed")?;
        log::debug!("Hostname set successfully");

        Ok(())
    }

    /// Writes `setgroups`, `uid_map` and `gid_map` for a child that was cloned into a new
    /// user namespace. Must run in the parent before the child is released.
    pub fn write_id_mappings(pid: Pid, mapping: IdMapping) -> ContainerResult<()> {
        Self::write_id_mappings_under(Path::new("/proc"), pid, mapping)
    }

    fn write_id_mappings_under(
        proc_root: &Path,
        pid: Pid,
        mapping: IdMapping,
    ) -> ContainerResult<()> {
        let proc_dir = proc_root.join(pid.to_string());
        // gid_map is refused for unprivileged writers until setgroups is denied.
        let setgroups = proc_dir.join("setgroups");
        if setgroups.exists() {
            fs::write(&setgroups, "deny").map_err(|e| {
                ContainerError::name_space(format!("Failed to write {:?}: {}", setgroups, e))
            })?;
        }
        for (file, content) in [("uid_map", mapping.uid_map()), ("gid_map", mapping.gid_map())] {
            let path = proc_dir.join(file);
            fs::write(&path, &content).map_err(|e| {
                ContainerError::name_space(format!("Failed to write {:?}: {}", path, e))
            })?;
        }
        log::info!(
            "Mapped container root to uid {} gid {} for PID {}",
            mapping.host_uid,
            mapping.host_gid,
            pid
        );
        Ok(())
    }

    /// `(name, target)` pairs for `/proc/<pid>/ns/*`, e.g. `("pid", "pid:[4026532201]")`.
    pub fn list_namespaces(pid: i32) -> ContainerResult<Vec<(String, String)>> {
        Self::list_namespaces_in(&PathBuf::from(format!("/proc/{pid}/ns")))
    }

    fn list_namespaces_in(ns_dir: &Path) -> ContainerResult<Vec<(String, String)>> {
        let mut namespaces = Vec::new();
        for entry in fs::read_dir(ns_dir)?.flatten() {
            if let Ok(target) = fs::read_link(entry.path()) {
                namespaces.push((
                    entry.file_name().to_string_lossy().into_owned(),
                    target.to_string_lossy().into_owned(),
                ));
            }
        }
        namespaces.sort();
        Ok(namespaces)
    }
}
