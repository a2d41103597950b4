use std::path::{Path, PathBuf};

use crate::rootfs::ImageSource;

pub const DEFAULT_STATE_DIR: &str = "/tmp/cellbox";
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const CGROUP_PREFIX: &str = "cellbox";
pub const DEFAULT_HOSTNAME: &str = "cellbox";
pub const DEFAULT_IMAGE: &str = "https://dl-cdn.alpinelinux.org/alpine/v3.19/releases/x86_64/alpine-minirootfs-3.19.1-x86_64.tar.gz";

// Re-exec contract between the engine and its isolated child.
pub const ENV_CHILD_MARKER: &str = "CELLBOX_CHILD";
pub const ENV_CONTAINER_ID: &str = "CELLBOX_CONTAINER_ID";
pub const ENV_ROOTFS: &str = "CELLBOX_ROOTFS";
pub const ENV_CGROUP: &str = "CELLBOX_CGROUP";
pub const ENV_HOSTNAME: &str = "CELLBOX_HOSTNAME";
pub const ENV_NETWORK: &str = "CELLBOX_NETWORK";
pub const CHILD_SUBCOMMAND: &str = "child";

pub const INTERNAL_ENV_VARS: [&str; 6] = [
    ENV_CHILD_MARKER,
    ENV_CONTAINER_ID,
    ENV_ROOTFS,
    ENV_CGROUP,
    ENV_HOSTNAME,
    ENV_NETWORK,
];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub state_dir: PathBuf,
    pub cgroup_root: PathBuf,
    pub hostname: String,
    /// Root filesystem archive used to populate empty per-container roots.
    pub image: Option<ImageSource>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            hostname: DEFAULT_HOSTNAME.to_string(),
            image: Some(ImageSource::Remote(DEFAULT_IMAGE.to_string())),
        }
    }
}

impl EngineConfig {
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }
    pub fn with_image(mut self, image: Option<ImageSource>) -> Self {
        self.image = image;
        self
    }
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.state_dir.join(id)
    }
    pub fn default_rootfs(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("rootfs")
    }
    /// True when `rootfs` is the engine-managed root for `id`, which makes it ours to delete.
    pub fn owns_rootfs(&self, id: &str, rootfs: &Path) -> bool {
        rootfs == self.default_rootfs(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_container_paths_live_under_state_dir() {
        let config = EngineConfig::default().with_state_dir("/var/tmp/cb");
        assert_eq!(
            config.default_rootfs("k3j9x0ab"),
            PathBuf::from("/var/tmp/cb/k3j9x0ab/rootfs")
        );
        assert!(config.owns_rootfs("k3j9x0ab", Path::new("/var/tmp/cb/k3j9x0ab/rootfs")));
        assert!(!config.owns_rootfs("k3j9x0ab", Path::new("/srv/alpine")));
    }
}
