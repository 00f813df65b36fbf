//! Child process handle
//!
//! Wraps a spawned node program: its pid, an exit watcher task that owns
//! the `tokio::process::Child`, and signal delivery. Raw signal numbers and
//! rlimit calls never leave this module.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use crate::manifest::ResourceLimits;

/// Environment variable carrying the node's descriptor id
pub const NODE_ID_ENV: &str = "NODEHUB_NODE_ID";

/// Signals the supervisor sends to node processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Polite termination request (SIGTERM)
    Terminate,
    /// Unconditional kill (SIGKILL)
    Kill,
}

impl Signal {
    const fn as_raw(self) -> libc::c_int {
        match self {
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// How a node process ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Whether the process exited with code 0
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// What to spawn for one node
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub node_id: &'a str,
    pub program: &'a Path,
    /// Passed as the first argument
    pub socket_path: &'a Path,
    pub args: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    pub working_dir: Option<&'a Path>,
    /// Applied in the child before exec
    pub limits: &'a ResourceLimits,
}

/// Handle to a spawned node process
///
/// Cloning is cheap; all clones observe the same exit.
#[derive(Debug, Clone)]
pub struct ChildProcess {
    pid: u32,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ChildProcess {
    /// Spawn the program and start watching for its exit
    ///
    /// `on_exit` runs once on the watcher task after the exit is published.
    /// Stdout and stderr are forwarded to the log. The process is killed if
    /// the runtime drops the watcher.
    ///
    /// # Errors
    ///
    /// Returns error if the program can't be spawned
    pub fn start<F>(spec: &LaunchSpec<'_>, on_exit: F) -> io::Result<Self>
    where
        F: FnOnce(u32, ExitInfo) + Send + 'static,
    {
        let mut command = Command::new(spec.program);
        command
            .arg(spec.socket_path)
            .args(spec.args)
            .env(NODE_ID_ENV, spec.node_id)
            .envs(spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = spec.working_dir {
            command.current_dir(dir);
        }
        if !spec.limits.is_unlimited() {
            limit_before_exec(&mut command, *spec.limits);
        }

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("child exited before its pid was read"))?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(spec.node_id.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(spec.node_id.to_string(), "stderr", stderr);
        }

        let (tx, rx) = watch::channel(None);
        let node_id = spec.node_id.to_string();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    tracing::warn!(
                        node_id = %node_id,
                        pid,
                        error = %e,
                        "failed to wait for node process"
                    );
                    ExitInfo::default()
                }
            };
            tracing::debug!(node_id = %node_id, pid, %exit, "node process exited");
            // signal() checks this before calling kill(2)
            tx.send_replace(Some(exit));
            on_exit(pid, exit);
        });

        Ok(Self { pid, exit: rx })
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status, if the process has exited
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Wait for the process to exit
    ///
    /// Returns `None` only if the watcher went away without an exit, which
    /// happens when the runtime is shutting down.
    pub async fn wait(&self) -> Option<ExitInfo> {
        let mut exit = self.exit.clone();
        exit.wait_for(Option::is_some).await.ok().and_then(|exit| *exit)
    }

    /// Wait up to `timeout` for the process to exit
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .ok()
            .flatten()
    }

    /// Deliver a signal; a no-op once the process has exited
    ///
    /// # Errors
    ///
    /// Returns error if the kernel rejects the signal
    pub fn signal(&self, signal: Signal) -> io::Result<()> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        send_signal(self.pid, signal.as_raw())
    }
}

#[allow(unsafe_code)]
fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) takes plain integers and does not touch our memory
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone
        Ok(())
    } else {
        Err(err)
    }
}

#[allow(unsafe_code)]
fn limit_before_exec(command: &mut Command, limits: ResourceLimits) {
    // SAFETY: the hook runs in the forked child before exec; apply_limits
    // makes only async-signal-safe calls and does not allocate
    unsafe {
        command.pre_exec(move || apply_limits(&limits));
    }
}

/// Set rlimits and niceness on the calling process
#[allow(unsafe_code)]
fn apply_limits(limits: &ResourceLimits) -> io::Result<()> {
    fn check(rc: libc::c_int) -> io::Result<()> {
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    let fixed = |value: u64| libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };

    // SAFETY: getrlimit(2), setrlimit(2) and setpriority(2) only access the
    // rlimit struct passed to them, which lives on this stack frame
    unsafe {
        if let Some(bytes) = limits.memory_bytes {
            check(libc::setrlimit(libc::RLIMIT_AS, &fixed(bytes)))?;
        }
        if let Some(files) = limits.max_file_descriptors {
            check(libc::setrlimit(libc::RLIMIT_NOFILE, &fixed(files)))?;
        }
        if let Some(secs) = limits.cpu_time_secs {
            check(libc::setrlimit(libc::RLIMIT_CPU, &fixed(secs)))?;
        }
        match limits.core_dumps {
            Some(true) => {
                let mut core = fixed(0);
                check(libc::getrlimit(libc::RLIMIT_CORE, &mut core))?;
                core.rlim_cur = core.rlim_max;
                check(libc::setrlimit(libc::RLIMIT_CORE, &core))?;
            }
            Some(false) => check(libc::setrlimit(libc::RLIMIT_CORE, &fixed(0)))?,
            None => {}
        }
        if let Some(nice) = limits.nice {
            check(libc::setpriority(libc::PRIO_PROCESS, 0, nice))?;
        }
    }
    Ok(())
}

fn forward_lines<R>(node_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(node_id = %node_id, stream, "{line}");
        }
    });
}
