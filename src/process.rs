use crate::config::{
    CHILD_SUBCOMMAND, ENV_CGROUP, ENV_CHILD_MARKER, ENV_CONTAINER_ID, ENV_HOSTNAME, ENV_NETWORK,
    ENV_ROOTFS, INTERNAL_ENV_VARS,
};
use crate::error::{ContainerError, ContainerResult, Context};
use crate::namespace::NamespaceConfig;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sched::clone;
use nix::sys::signal::{SigHandler, Signal, kill, signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Pid, execve, pipe2};
use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

const SELF_EXE: &str = "/proc/self/exe";
const CHILD_STACK_SIZE: usize = 1024 * 1024;
const SEARCH_DIRS: [&str; 4] = ["/bin", "/usr/bin", "/sbin", "/usr/sbin"];

static CHILD_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_signal(sig: i32) {
    let child = CHILD_PID.load(Ordering::SeqCst);
    if child > 0 {
        if let Ok(signal) = Signal::try_from(sig) {
            let _ = kill(Pid::from_raw(child), signal);
        }
    }
}

/// Everything the isolated child needs, handed over through its environment.
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub container_id: &'a str,
    pub command: &'a [String],
    pub rootfs: &'a Path,
    pub cgroup: Option<&'a Path>,
    pub hostname: &'a str,
    pub namespaces: NamespaceConfig,
}

/// A cloned child parked on its start gate. Dropping it without `release` makes the child exit.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: Pid,
    gate: File,
}

impl SpawnedChild {
    pub fn release(mut self) -> ContainerResult<()> {
        self.gate.write_all(&[1]).map_err(|e| {
            ContainerError::process_execution(format!("Failed to release child {}: {e}", self.pid))
        })?;
        log::debug!("Released child {}", self.pid);
        Ok(())
    }
}

#[derive(Debug)]
pub struct ProcessManager;

impl ProcessManager {
    /// Clones a child into the requested namespaces which then re-executes this binary as
    /// `child -- <command>`. The child waits on a pipe until `SpawnedChild::release`, so the
    /// parent can write ID maps and wire up networking first.
    pub fn spawn_isolated(request: &SpawnRequest<'_>) -> ContainerResult<SpawnedChild> {
        let exe = CString::new(SELF_EXE)?;
        let argv = Self::reexec_argv(request.command)?;
        let envp = Self::child_environment(request, std::env::vars_os())?;
        let flags = request.namespaces.to_clone_flags();

        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(|e| {
            ContainerError::process_execution(format!("Failed to create start gate: {e}"))
        })?;
        let write_raw = write_end.as_raw_fd();
        let mut gate_in = File::from(read_end);

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let child_main = Box::new(move || -> isize {
            // Without this the child would hold the gate open itself and never see EOF.
            unsafe { libc::close(write_raw) };
            let mut byte = [0u8; 1];
            match gate_in.read(&mut byte) {
                Ok(1) => {}
                _ => return 1,
            }
            let _ = execve(&exe, &argv, &envp);
            127
        });

        log::info!("Spawning isolated child with flags {flags:?}");
        let pid = unsafe { clone(child_main, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
            .map_err(|e| ContainerError::NamespaceSetup {
                message: format!("clone failed: {e} (flags: {flags:?})"),
            })
            .context("spawning container process")?;
        log::info!("Container process PID: {pid}");
        Ok(SpawnedChild {
            pid,
            gate: File::from(write_end),
        })
    }

    fn reexec_argv(command: &[String]) -> ContainerResult<Vec<CString>> {
        let mut argv = Vec::with_capacity(command.len() + 3);
        argv.push(CString::new(SELF_EXE)?);
        argv.push(CString::new(CHILD_SUBCOMMAND)?);
        argv.push(CString::new("--")?);
        for arg in command {
            argv.push(CString::new(arg.as_str()).map_err(|e| {
                ContainerError::process_execution(format!(
                    "Invalid argument (contains null byte): {}",
                    e
                ))
            })?);
        }
        Ok(argv)
    }

    /// Inherited environment minus stale markers, plus the markers for this child.
    pub fn child_environment(
        request: &SpawnRequest<'_>,
        inherited: impl IntoIterator<Item = (OsString, OsString)>,
    ) -> ContainerResult<Vec<CString>> {
        let mut env = Self::inherited_environment(inherited)?;
        let mut markers = vec![
            (ENV_CHILD_MARKER, "1".to_string()),
            (ENV_CONTAINER_ID, request.container_id.to_string()),
            (ENV_ROOTFS, request.rootfs.to_string_lossy().into_owned()),
            (ENV_HOSTNAME, request.hostname.to_string()),
        ];
        if let Some(cgroup) = request.cgroup {
            markers.push((ENV_CGROUP, cgroup.to_string_lossy().into_owned()));
        }
        if request.namespaces.isolate_net {
            markers.push((ENV_NETWORK, "1".to_string()));
        }
        for (key, value) in markers {
            env.push(CString::new(format!("{key}={value}"))?);
        }
        Ok(env)
    }

    pub fn inherited_environment(
        vars: impl IntoIterator<Item = (OsString, OsString)>,
    ) -> ContainerResult<Vec<CString>> {
        let mut env = Vec::new();
        for (key, value) in vars {
            if key.to_str().is_some_and(|k| INTERNAL_ENV_VARS.contains(&k)) {
                continue;
            }
            let mut entry = key.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            env.push(CString::new(entry).map_err(|e| {
                ContainerError::process_execution(format!("Invalid environment variable: {}", e))
            })?);
        }
        Ok(env)
    }

    /// Blocks until `child` exits and returns its exit code, 128+signal when it was killed.
    /// SIGINT, SIGTERM and SIGQUIT received meanwhile are passed on to the child.
    pub fn wait_for_child(child: Pid) -> ContainerResult<i32> {
        CHILD_PID.store(child.as_raw(), Ordering::SeqCst);
        unsafe {
            signal(Signal::SIGINT, SigHandler::Handler(handle_signal)).ok();
            signal(Signal::SIGTERM, SigHandler::Handler(handle_signal)).ok();
            signal(Signal::SIGQUIT, SigHandler::Handler(handle_signal)).ok();
        }
        let outcome = loop {
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, status)) => {
                    log::info!("Container exited with status: {status}");
                    break Ok(status);
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    log::warn!("Container killed by signal: {sig}");
                    break Ok(128 + sig as i32);
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    break Err(ContainerError::process_execution(format!(
                        "waitpid failed: {e}"
                    )));
                }
            }
        };
        CHILD_PID.store(0, Ordering::SeqCst);
        unsafe {
            signal(Signal::SIGINT, SigHandler::SigDfl).ok();
            signal(Signal::SIGTERM, SigHandler::SigDfl).ok();
            signal(Signal::SIGQUIT, SigHandler::SigDfl).ok();
        }
        outcome
    }

    /// Replaces the current process image with `command`. Only returns on failure.
    pub fn exec_container_command(command: &[String]) -> ContainerResult<Infallible> {
        let Some((program, args)) = command.split_first() else {
            return Err(ContainerError::process_execution("empty command"));
        };
        log::info!("Executing container command: {program} with args: {args:?}");
        let command_path = Self::resolve_command_path(Path::new("/"), program)?;
        let argv = Self::build_argv(&command_path, args)?;
        let envp = Self::inherited_environment(std::env::vars_os())?;
        log::debug!("Executing: {command_path} with argv: {argv:?}");
        execve(&argv[0], &argv, &envp)
            .map_err(|e| {
                ContainerError::process_execution(format!("execve failed for {program}: {e}"))
            })
            .context("executing container command")
    }

    /// Absolute paths are taken as given, bare names are looked up in the standard bin dirs.
    pub fn resolve_command_path(root: &Path, command: &str) -> ContainerResult<String> {
        let under_root = |p: &str| root.join(p.trim_start_matches('/'));
        let command_path = if command.starts_with('/') {
            command.to_string()
        } else {
            SEARCH_DIRS
                .iter()
                .map(|prefix| format!("{prefix}/{command}"))
                .find(|p| under_root(p).exists())
                .unwrap_or_else(|| format!("/bin/{command}"))
        };
        if !under_root(&command_path).exists() {
            return Err(ContainerError::process_execution(format!(
                "Command not found in container: {command} (tried: {command_path})"
            )));
        }
        Ok(command_path)
    }

    pub fn build_argv(command_path: &str, args: &[String]) -> ContainerResult<Vec<CString>> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(CString::new(command_path).map_err(|e| {
            ContainerError::process_execution(format!(
                "Invalid command path (contains null byte): {}",
                e
            ))
        })?);
        for arg in args {
            argv.push(CString::new(arg.as_str()).map_err(|e| {
                ContainerError::process_execution(format!(
                    "Invalid argument (contains null byte): {}",
                    e
                ))
            })?)
        }
        Ok(argv)
    }

    /// Existence check via signal 0. A zombie or a recycled pid also counts as alive.
    pub fn is_alive(pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        matches!(
            kill(Pid::from_raw(pid), None::<Signal>),
            Ok(()) | Err(Errno::EPERM)
        )
    }

    pub fn kill(pid: i32) -> ContainerResult<()> {
        if pid <= 0 {
            return Err(ContainerError::process_execution(format!(
                "refusing to signal pid {pid}"
            )));
        }
        kill(Pid::from_raw(pid), Signal::SIGKILL).map_err(|e| {
            ContainerError::process_execution(format!("Failed to kill process {pid}: {e}"))
        })
    }

    /// The `State:` line of `/proc/<pid>/status`, e.g. `S (sleeping)`.
    pub fn process_state(pid: i32) -> Option<String> {
        let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        status
            .lines()
            .find_map(|line| line.strip_prefix("State:"))
            .map(|state| state.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request<'a>(command: &'a [String], rootfs: &'a Path, cgroup: Option<&'a Path>) -> SpawnRequest<'a> {
        SpawnRequest {
            container_id: "q1w2e3r4",
            command,
            rootfs,
            cgroup,
            hostname: "box",
            namespaces: NamespaceConfig::default(),
        }
    }

    #[test]
    fn reexec_argv_selects_child_entry() {
        let argv = ProcessManager::reexec_argv(&["/bin/echo".into(), "hi".into()]).unwrap();
        let argv: Vec<&str> = argv.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(argv, ["/proc/self/exe", "child", "--", "/bin/echo", "hi"]);
    }

    #[test]
    fn child_environment_carries_markers_and_drops_stale_ones() {
        let command = vec!["/bin/sh".to_string()];
        let rootfs = PathBuf::from("/tmp/cellbox/q1w2e3r4/rootfs");
        let cgroup = PathBuf::from("/sys/fs/cgroup/cellbox/q1w2e3r4");
        let inherited = vec![
            (OsString::from("PATH"), OsString::from("/usr/bin:/bin")),
            (OsString::from(ENV_CONTAINER_ID), OsString::from("stale000")),
        ];
        let env = ProcessManager::child_environment(&request(&command, &rootfs, Some(&cgroup)), inherited)
            .unwrap();
        let env: Vec<&str> = env.iter().map(|e| e.to_str().unwrap()).collect();
        assert!(env.contains(&"PATH=/usr/bin:/bin"));
        assert!(env.contains(&"CELLBOX_CHILD=1"));
        assert!(env.contains(&"CELLBOX_CONTAINER_ID=q1w2e3r4"));
        assert!(env.contains(&"CELLBOX_ROOTFS=/tmp/cellbox/q1w2e3r4/rootfs"));
        assert!(env.contains(&"CELLBOX_CGROUP=/sys/fs/cgroup/cellbox/q1w2e3r4"));
        assert!(!env.iter().any(|e| e.contains("stale000")));
        assert!(!env.iter().any(|e| e.starts_with("CELLBOX_NETWORK")));
    }

    #[test]
    fn inherited_environment_strips_markers() {
        let env = ProcessManager::inherited_environment(vec![
            (OsString::from(ENV_CHILD_MARKER), OsString::from("1")),
            (OsString::from("TERM"), OsString::from("xterm")),
        ])
        .unwrap();
        assert_eq!(env, vec![CString::new("TERM=xterm").unwrap()]);
    }

    #[test]
    fn resolves_bare_names_against_search_dirs() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        fs::write(root.path().join("usr/bin/env"), "").unwrap();

        assert_eq!(
            ProcessManager::resolve_command_path(root.path(), "env").unwrap(),
            "/usr/bin/env"
        );
        assert_eq!(
            ProcessManager::resolve_command_path(root.path(), "/usr/bin/env").unwrap(),
            "/usr/bin/env"
        );
        assert!(ProcessManager::resolve_command_path(root.path(), "missing").is_err());
    }

    #[test]
    fn build_argv_rejects_nul_bytes() {
        assert!(ProcessManager::build_argv("/bin/echo", &["a\0b".to_string()]).is_err());
        let argv = ProcessManager::build_argv("/bin/echo", &["hi".to_string()]).unwrap();
        assert_eq!(argv.len(), 2);
    }

    #[test]
    fn liveness_and_state_of_current_process() {
        let me = std::process::id() as i32;
        assert!(ProcessManager::is_alive(me));
        assert!(ProcessManager::process_state(me).is_some());
        assert!(!ProcessManager::is_alive(0));
        assert!(ProcessManager::kill(0).is_err());
    }

    #[test]
    fn wait_reports_exit_code_of_child() {
        let child = std::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let code = ProcessManager::wait_for_child(Pid::from_raw(child.id() as i32)).unwrap();
        assert_eq!(code, 3);
    }
}
