//! Process-level sandboxing and resource limits
//!
//! Implements CPU, memory, and file descriptor limits for sandboxed child
//! processes, and reads back the resource usage they accumulated.

#[cfg(unix)]
use nix::sys::resource::{getrusage, setrlimit, Resource, UsageWho};
#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Resource ceilings for one sandboxed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time (`RLIMIT_CPU`), also used as the wall-clock deadline
    pub max_cpu_seconds: u64,
    /// Virtual address space in bytes (`RLIMIT_AS`)
    pub max_memory_bytes: u64,
    /// Open file descriptors (`RLIMIT_NOFILE`)
    pub max_open_files: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_seconds: 5,
            max_memory_bytes: 256 * 1024 * 1024,
            max_open_files: 64,
        }
    }
}

impl ResourceLimits {
    /// Wall-clock deadline armed around the execution
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.max_cpu_seconds.max(1))
    }
}

/// Execution environment for one sandboxed invocation
///
/// Built by [`super::Sandbox::create_context`]; never shared across modules.
#[derive(Debug, Clone)]
pub struct SandboxContext {
    /// Module the execution is attributed to
    pub module: String,
    /// Ceilings applied in the child before the interpreter starts
    pub limits: ResourceLimits,
    /// Host commands reachable from the code; must be a subset of the
    /// sandbox's available primitives
    pub allowed_primitives: Vec<String>,
    /// Directory the code runs in
    pub working_dir: Option<PathBuf>,
}

impl SandboxContext {
    /// Narrow the commands reachable from the code
    pub fn with_primitives<I, S>(mut self, primitives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_primitives = primitives.into_iter().map(Into::into).collect();
        self
    }

    /// Run the code in this directory instead of the sandbox namespace
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Resource usage reported by the OS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// User-mode CPU time
    pub user_time: Duration,
    /// Kernel-mode CPU time
    pub system_time: Duration,
    /// Peak resident set size (KiB) across reaped children
    pub max_rss_kib: u64,
}

impl ResourceUsage {
    /// Usage accumulated by every reaped child of this process
    #[cfg(unix)]
    pub fn children() -> Self {
        match getrusage(UsageWho::RUSAGE_CHILDREN) {
            Ok(usage) => {
                let user = usage.user_time();
                let system = usage.system_time();
                Self {
                    user_time: Duration::from_micros(
                        (user.tv_sec() as u64) * 1_000_000 + user.tv_usec() as u64,
                    ),
                    system_time: Duration::from_micros(
                        (system.tv_sec() as u64) * 1_000_000 + system.tv_usec() as u64,
                    ),
                    max_rss_kib: usage.max_rss().max(0) as u64,
                }
            }
            Err(e) => {
                debug!("getrusage failed: {}", e);
                Self::default()
            }
        }
    }

    #[cfg(not(unix))]
    pub fn children() -> Self {
        Self::default()
    }

    /// Usage between two snapshots
    ///
    /// Process-wide counters, so overlapping executions of other modules leak
    /// into the delta.
    pub fn since(&self, earlier: &ResourceUsage) -> Self {
        Self {
            user_time: self.user_time.saturating_sub(earlier.user_time),
            system_time: self.system_time.saturating_sub(earlier.system_time),
            max_rss_kib: self.max_rss_kib,
        }
    }
}

/// Install the ceilings in the child between fork and exec
#[cfg(unix)]
#[allow(unsafe_code)]
pub(crate) fn apply_limits(cmd: &mut tokio::process::Command, limits: ResourceLimits) {
    // Hard CPU limit one second above soft: SIGXCPU first, then SIGKILL
    let cpu_soft = limits.max_cpu_seconds.max(1);
    let cpu_hard = cpu_soft + 1;

    // SAFETY: the closure only issues setrlimit syscalls on captured integers;
    // no allocation or locking happens between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            setrlimit(Resource::RLIMIT_CPU, cpu_soft, cpu_hard)?;
            setrlimit(
                Resource::RLIMIT_AS,
                limits.max_memory_bytes,
                limits.max_memory_bytes,
            )?;
            setrlimit(
                Resource::RLIMIT_NOFILE,
                limits.max_open_files,
                limits.max_open_files,
            )?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub(crate) fn apply_limits(_cmd: &mut tokio::process::Command, _limits: ResourceLimits) {
    tracing::warn!("Resource ceilings are not enforced on this platform");
}

/// Kill the process group led by `pid`; a group that is already gone is fine
#[cfg(unix)]
pub(crate) fn kill_process_group(pid: u32) {
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => debug!("Killed sandbox process group {}", pid),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => debug!("Failed to kill sandbox process group {}: {}", pid, e),
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_process_group(_pid: u32) {}

/// Signal that terminated a child, if any
#[cfg(unix)]
pub(crate) fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
pub(crate) fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Whether a terminating signal means a ceiling was hit
#[cfg(unix)]
pub(crate) fn is_limit_signal(signal: i32) -> bool {
    signal == Signal::SIGXCPU as i32 || signal == Signal::SIGKILL as i32
}

#[cfg(not(unix))]
pub(crate) fn is_limit_signal(_signal: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_is_at_least_one_second() {
        let limits = ResourceLimits {
            max_cpu_seconds: 0,
            ..ResourceLimits::default()
        };
        assert_eq!(limits.deadline(), Duration::from_secs(1));
    }

    #[test]
    fn test_usage_delta_saturates() {
        let later = ResourceUsage {
            user_time: Duration::from_millis(10),
            system_time: Duration::from_millis(5),
            max_rss_kib: 100,
        };
        let earlier = ResourceUsage {
            user_time: Duration::from_millis(20),
            system_time: Duration::from_millis(1),
            max_rss_kib: 50,
        };
        let delta = later.since(&earlier);
        assert_eq!(delta.user_time, Duration::ZERO);
        assert_eq!(delta.system_time, Duration::from_millis(4));
        assert_eq!(delta.max_rss_kib, 100);
    }
}
