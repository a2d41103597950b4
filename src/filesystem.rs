use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use nix::unistd::{chdir, pivot_root};
use std::fs::{self, DirBuilder};
use std::os::unix::fs::{DirBuilderExt, symlink};
use std::path::{Path, PathBuf};

use crate::error::{ContainerError, ContainerResult, Context};

const OLD_ROOT: &str = ".pivot_root";
const DEV_TMPFS_OPTIONS: &str = "mode=755,size=65536k";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNode {
    pub name: &'static str,
    pub major: u64,
    pub minor: u64,
    pub mode: u32,
}

pub const DEVICE_NODES: [DeviceNode; 7] = [
    DeviceNode { name: "null", major: 1, minor: 3, mode: 0o666 },
    DeviceNode { name: "zero", major: 1, minor: 5, mode: 0o666 },
    DeviceNode { name: "full", major: 1, minor: 7, mode: 0o666 },
    DeviceNode { name: "random", major: 1, minor: 8, mode: 0o666 },
    DeviceNode { name: "urandom", major: 1, minor: 9, mode: 0o666 },
    DeviceNode { name: "tty", major: 5, minor: 0, mode: 0o666 },
    DeviceNode { name: "console", major: 5, minor: 1, mode: 0o600 },
];

pub const DEV_SYMLINKS: [(&str, &str); 4] = [
    ("/dev/fd", "/proc/self/fd"),
    ("/dev/stdin", "/proc/self/fd/0"),
    ("/dev/stdout", "/proc/self/fd/1"),
    ("/dev/stderr", "/proc/self/fd/2"),
];

#[derive(Debug)]
pub struct FilesystemManager;
impl FilesystemManager {
    pub fn validate_rootfs(rootfs_path: &Path) -> ContainerResult<()> {
        log::info!("Validating rootfs at: {rootfs_path:?}");
        if !rootfs_path.exists() {
            return Err(ContainerError::Filesystem {
                message: format!("Rootfs path does not exist: {rootfs_path:?}"),
            });
        }
        if !rootfs_path.is_dir() {
            return Err(ContainerError::Filesystem {
                message: format!("Rootfs path is not a directory: {rootfs_path:?}"),
            });
        }
        let essential_dir = ["bin", "lib", "etc"];
        for dir in essential_dir {
            let dir_path = rootfs_path.join(dir);
            if !dir_path.exists() {
                log::warn!("Essential directory missing in rootfs: {dir}")
            }
        }
        log::debug!("Rootfs validation passed");
        Ok(())
    }

    /// Turns `rootfs` into `/` for the calling process. Runs once, inside fresh mount and PID
    /// namespaces; any failure leaves whatever was already mounted in place.
    pub fn setup_container_filesystem(rootfs: &Path) -> ContainerResult<()> {
        let rootfs = Self::absolute(rootfs)?;
        Self::validate_rootfs(&rootfs)?;
        Self::pivot_into(&rootfs).context("switching root")?;
        Self::mount_essentials().context("mounting /proc, /sys and /dev")?;
        Self::populate_dev().context("populating /dev")?;
        log::info!("Container filesystem ready");
        Ok(())
    }

    fn absolute(rootfs: &Path) -> ContainerResult<PathBuf> {
        std::path::absolute(rootfs).map_err(|e| {
            ContainerError::filesystem_setup(format!(
                "Failed to resolve rootfs {rootfs:?}: {e}"
            ))
        })
    }

    fn pivot_into(rootfs: &Path) -> ContainerResult<()> {
        // Keep later mounts and unmounts from propagating back to the host.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| ContainerError::filesystem_setup(format!("Failed to make / private: {e}")))?;

        // pivot_root needs the new root to be a mount point.
        mount(
            Some(rootfs),
            rootfs,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| {
            ContainerError::filesystem_setup(format!("Failed to bind mount {rootfs:?}: {e}"))
        })?;

        let put_old = rootfs.join(OLD_ROOT);
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&put_old)
            .map_err(|e| {
                ContainerError::filesystem_setup(format!("Failed to create {put_old:?}: {e}"))
            })?;

        pivot_root(rootfs, put_old.as_path())
            .map_err(|e| ContainerError::filesystem_setup(format!("pivot_root failed: {e}")))?;
        chdir("/").map_err(|e| ContainerError::filesystem_setup(format!("chdir failed: {e}")))?;

        let old_root = Path::new("/").join(OLD_ROOT);
        umount2(old_root.as_path(), MntFlags::MNT_DETACH).map_err(|e| {
            ContainerError::filesystem_setup(format!("Failed to unmount old root: {e}"))
        })?;
        fs::remove_dir(&old_root).map_err(|e| {
            ContainerError::filesystem_setup(format!("Failed to remove {old_root:?}: {e}"))
        })?;
        log::debug!("Pivoted into {rootfs:?}");
        Ok(())
    }

    fn mount_essentials() -> ContainerResult<()> {
        Self::mount_fresh("proc", "/proc", 0o555, MsFlags::empty(), None)?;
        Self::mount_fresh("sysfs", "/sys", 0o555, MsFlags::empty(), None)?;
        Self::mount_fresh(
            "tmpfs",
            "/dev",
            0o755,
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            Some(DEV_TMPFS_OPTIONS),
        )?;
        Ok(())
    }

    fn mount_fresh(
        fstype: &str,
        target: &str,
        dir_mode: u32,
        flags: MsFlags,
        data: Option<&str>,
    ) -> ContainerResult<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(dir_mode)
            .create(target)
            .map_err(|e| {
                ContainerError::filesystem_setup(format!("Failed to create {target}: {e}"))
            })?;
        mount(Some(fstype), target, Some(fstype), flags, data).map_err(|e| {
            ContainerError::filesystem_setup(format!("Failed to mount {fstype} on {target}: {e}"))
        })?;
        log::debug!("Mounted {fstype} on {target}");
        Ok(())
    }

    fn populate_dev() -> ContainerResult<()> {
        for device in DEVICE_NODES {
            let path = Path::new("/dev").join(device.name);
            match mknod(
                path.as_path(),
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(device.mode),
                makedev(device.major, device.minor),
            ) {
                Ok(()) | Err(Errno::EEXIST) => {}
                Err(e) => return Err(mknod_error(&path, &device, e)),
            }
        }
        for dir in ["/dev/pts", "/dev/shm"] {
            fs::create_dir_all(dir).map_err(|e| {
                ContainerError::filesystem_setup(format!("Failed to create {dir}: {e}"))
            })?;
        }
        for (link, target) in DEV_SYMLINKS {
            let _ = fs::remove_file(link);
            if let Err(e) = symlink(target, link) {
                log::warn!("Failed to create symlink {link} -> {target}: {e}");
            }
        }
        log::debug!("Created {} device nodes in /dev", DEVICE_NODES.len());
        Ok(())
    }
}

fn mknod_error(path: &Path, device: &DeviceNode, errno: Errno) -> ContainerError {
    let hint = if errno == Errno::EPERM {
        " (device nodes cannot be created inside a user namespace)"
    } else {
        ""
    };
    ContainerError::filesystem_setup(format!(
        "mknod {path:?} ({}:{}) failed: {errno}{hint}",
        device.major, device.minor
    ))
}
