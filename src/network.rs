use nix::unistd::Pid;
use std::process::Command;

use crate::error::{ContainerError, ContainerResult};

const HOST_ADDR: &str = "10.0.0.1/24";
const CONTAINER_ADDR: &str = "10.0.0.2/24";
const CONTAINER_IFACE: &str = "eth0";

/// Connects a container's network namespace to the host.
pub trait NetworkProvisioner {
    /// Host side, called by the parent once the child's namespaces exist.
    fn attach(&self, container_id: &str, pid: Pid) -> ContainerResult<()>;
    /// Container side, called by the child before it leaves the host root.
    fn configure_inside(&self, container_id: &str) -> ContainerResult<()>;
}

/// veth pair driven through the `ip` tool.
#[derive(Debug, Default, Clone)]
pub struct VethProvisioner;

impl VethProvisioner {
    /// `(host end, container end)` interface names for a container.
    pub fn interface_names(container_id: &str) -> (String, String) {
        let short: String = container_id.chars().take(4).collect();
        (format!("veth{short}"), format!("vc{short}"))
    }

    fn ip(args: &[&str]) -> ContainerResult<()> {
        log::debug!("ip {}", args.join(" "));
        let output = Command::new("ip").args(args).output().map_err(|e| {
            ContainerError::network(format!("failed to run ip {}: {e}", args.join(" ")))
        })?;
        if !output.status.success() {
            return Err(ContainerError::network(format!(
                "ip {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl NetworkProvisioner for VethProvisioner {
    fn attach(&self, container_id: &str, pid: Pid) -> ContainerResult<()> {
        let (host_if, peer_if) = Self::interface_names(container_id);
        let pid = pid.to_string();
        Self::ip(&["link", "add", &host_if, "type", "veth", "peer", "name", &peer_if])?;
        Self::ip(&["link", "set", &peer_if, "netns", &pid])?;
        Self::ip(&["link", "set", &host_if, "up"])?;
        if let Err(e) = Self::ip(&["addr", "add", HOST_ADDR, "dev", &host_if]) {
            log::warn!("Could not address {host_if}: {e}");
        }
        log::info!("Attached {host_if} <-> {peer_if} to PID {pid}");
        Ok(())
    }

    fn configure_inside(&self, container_id: &str) -> ContainerResult<()> {
        let (_, peer_if) = Self::interface_names(container_id);
        Self::ip(&["link", "set", "lo", "up"])?;
        Self::ip(&["link", "set", &peer_if, "name", CONTAINER_IFACE])?;
        Self::ip(&["link", "set", CONTAINER_IFACE, "up"])?;
        Self::ip(&["addr", "add", CONTAINER_ADDR, "dev", CONTAINER_IFACE])?;
        log::info!("Configured {CONTAINER_IFACE} with {CONTAINER_ADDR}");
        Ok(())
    }
}
