//! Sandboxed execution
//!
//! Every execution runs in its own OS process: resource ceilings are set in
//! the child, the environment is cleared and `PATH` only reaches links to the
//! primitives the context allows. The pre-scan rejects paths, redirections and
//! expanded command names, so `PATH` is the only way to reach a host command.
//! Executions of the same module are serialized.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::module::sandbox::process::{
    apply_limits, exit_signal, is_limit_signal, kill_process_group, ResourceLimits,
    ResourceUsage, SandboxContext,
};
use crate::module::sandbox::scanner::CodeScanner;
use crate::module::traits::ModuleError;

/// Captured output of one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub runtime: Duration,
}

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Per-module execution statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStats {
    /// Cumulative wall-clock runtime
    pub runtime: Duration,
    /// Runtime of the most recent attempt (zero for rejected code)
    pub last_runtime: Duration,
    pub executions: u64,
    /// Attempts rejected by the pre-scan
    pub violations: u64,
    /// Executions killed at a ceiling or the deadline
    pub limit_exceeded: u64,
    /// Approximate usage of the most recent execution
    pub resource_usage: ResourceUsage,
}

#[derive(Default)]
struct RunState {
    stats: SandboxStats,
    /// Process group of the live child
    running: Option<u32>,
    terminate_requested: bool,
}

#[derive(Default)]
struct ModuleSlot {
    exec_lock: Mutex<()>,
    state: Mutex<RunState>,
}

/// Sandbox for untrusted module code
pub struct Sandbox {
    config: SandboxConfig,
    scanner: CodeScanner,
    /// Directory holding links to the allow-listed primitives
    namespace: TempDir,
    /// Primitives that resolved on this host
    available: Vec<String>,
    /// Host binary behind each available primitive
    targets: HashMap<String, PathBuf>,
    slots: Mutex<HashMap<String, Arc<ModuleSlot>>>,
}

impl Sandbox {
    /// Create a sandbox and build its primitive namespace
    pub fn new(config: SandboxConfig) -> Result<Self, ModuleError> {
        let namespace = tempfile::Builder::new()
            .prefix("modrt-sandbox-")
            .tempdir()
            .map_err(|e| {
                ModuleError::OperationError(format!("Failed to create sandbox namespace: {}", e))
            })?;

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let mut available = Vec::new();
        let mut targets = HashMap::new();
        for primitive in &config.allowed_primitives {
            if primitive.contains('/') {
                warn!("Ignoring allowed primitive with a path separator: {}", primitive);
                continue;
            }
            match which::which_in(primitive, Some(&config.host_path), &cwd) {
                Ok(target) => {
                    link_primitive(&target, &namespace.path().join(primitive))?;
                    available.push(primitive.clone());
                    targets.insert(primitive.clone(), target);
                }
                Err(e) => debug!("Primitive {} not available on this host: {}", primitive, e),
            }
        }

        info!(
            "Sandbox namespace ready with {} of {} primitives",
            available.len(),
            config.allowed_primitives.len()
        );

        Ok(Self {
            scanner: CodeScanner::new(config.blocked_operations.iter().cloned()),
            config,
            namespace,
            available,
            targets,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Build an execution context for one invocation on behalf of `module`
    pub fn create_context(&self, module: &str, limits: Option<ResourceLimits>) -> SandboxContext {
        SandboxContext {
            module: module.to_string(),
            limits: limits.unwrap_or_else(|| self.config.limits()),
            allowed_primitives: self.available.clone(),
            working_dir: None,
        }
    }

    /// Execute code inside the sandbox
    ///
    /// Code containing a blocked operation is rejected before anything runs.
    /// A non-zero exit status is returned as output; hitting a ceiling or the
    /// deadline is `ResourceLimitExceeded`, and a concurrent `terminate` is
    /// `Terminated`.
    pub async fn execute(
        &self,
        context: &SandboxContext,
        code: &str,
        bindings: &HashMap<String, String>,
    ) -> Result<ExecutionOutput, ModuleError> {
        let slot = self.slot(&context.module).await;

        if let Err(e) = self.prescan(&context.module, code) {
            let mut state = slot.state.lock().await;
            state.stats.violations += 1;
            state.stats.last_runtime = Duration::ZERO;
            warn!(module = %context.module, "Rejected sandboxed code: {}", e);
            return Err(e);
        }

        validate_bindings(bindings)?;
        let narrowed = self.context_namespace(context)?;
        let namespace = narrowed
            .as_ref()
            .map(|dir| dir.path())
            .unwrap_or_else(|| self.namespace.path());

        let _exclusive = slot.exec_lock.lock().await;
        slot.state.lock().await.terminate_requested = false;

        let mut cmd = tokio::process::Command::new(&self.config.interpreter);
        cmd.arg("-c")
            .arg(code)
            .env_clear()
            .env("PATH", namespace)
            .env("MODULE_NAME", &context.module)
            .envs(bindings)
            .current_dir(
                context
                    .working_dir
                    .as_deref()
                    .unwrap_or(namespace),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        apply_limits(&mut cmd, context.limits);

        let usage_before = ResourceUsage::children();
        let started = Instant::now();

        let mut child = cmd.spawn().map_err(|e| {
            ModuleError::OperationError(format!("Failed to start sandboxed process: {}", e))
        })?;
        let pid = child.id();
        slot.state.lock().await.running = pid;

        let stdout = tokio::spawn(read_stream(child.stdout.take()));
        let stderr = tokio::spawn(read_stream(child.stderr.take()));

        let waited = tokio::time::timeout(context.limits.deadline(), child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                slot.state.lock().await.running = None;
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                return Err(ModuleError::OperationError(format!(
                    "Failed to wait for sandboxed process: {}",
                    e
                )));
            }
            Err(_) => {
                warn!(module = %context.module, "Sandboxed execution hit its deadline");
                None
            }
        };

        // Reap the whole group so nothing the code started outlives it
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
        if status.is_none() {
            let _ = child.kill().await;
        }

        let runtime = started.elapsed();
        let usage = ResourceUsage::children().since(&usage_before);
        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        let mut state = slot.state.lock().await;
        state.running = None;
        state.stats.executions += 1;
        state.stats.runtime += runtime;
        state.stats.last_runtime = runtime;
        state.stats.resource_usage = usage;
        let terminated = std::mem::take(&mut state.terminate_requested);

        let status = match status {
            Some(status) => status,
            None => {
                state.stats.limit_exceeded += 1;
                return Err(ModuleError::ResourceLimitExceeded(format!(
                    "{} exceeded its {}s deadline",
                    context.module, context.limits.max_cpu_seconds
                )));
            }
        };

        if let Some(signal) = exit_signal(&status) {
            if terminated {
                return Err(ModuleError::Terminated(context.module.clone()));
            }
            if is_limit_signal(signal) {
                state.stats.limit_exceeded += 1;
                return Err(ModuleError::ResourceLimitExceeded(format!(
                    "{} was killed by signal {}",
                    context.module, signal
                )));
            }
            return Err(ModuleError::OperationError(format!(
                "{} was terminated by signal {}",
                context.module, signal
            )));
        }

        debug!(
            module = %context.module,
            "Sandboxed execution finished in {:?} with status {:?}", runtime, status.code()
        );

        Ok(ExecutionOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
            runtime,
        })
    }

    /// Private `PATH` directory for a context that narrows the allow-list
    ///
    /// `None` means the context uses every available primitive and shares the
    /// sandbox namespace.
    fn context_namespace(&self, context: &SandboxContext) -> Result<Option<TempDir>, ModuleError> {
        if context.allowed_primitives == self.available {
            return Ok(None);
        }

        let dir = tempfile::Builder::new()
            .prefix("modrt-context-")
            .tempdir()
            .map_err(|e| {
                ModuleError::OperationError(format!("Failed to create context namespace: {}", e))
            })?;
        for primitive in &context.allowed_primitives {
            let target = self.targets.get(primitive).ok_or_else(|| {
                ModuleError::InvalidConfiguration(format!(
                    "Primitive {} is not available in this sandbox",
                    primitive
                ))
            })?;
            link_primitive(target, &dir.path().join(primitive))?;
        }
        Ok(Some(dir))
    }

    /// Textual pre-scan without executing anything
    pub fn prescan(&self, module: &str, code: &str) -> Result<(), ModuleError> {
        match self.scanner.scan(code) {
            Some(operation) => Err(ModuleError::SecurityViolation {
                module: module.to_string(),
                operation,
            }),
            None => Ok(()),
        }
    }

    /// Kill any live execution of `module`; safe to call at any time
    pub async fn terminate(&self, module: &str) {
        let slot = match self.slots.lock().await.get(module) {
            Some(slot) => slot.clone(),
            None => return,
        };
        let mut state = slot.state.lock().await;
        if let Some(pid) = state.running.take() {
            info!(module = %module, "Terminating sandboxed execution");
            state.terminate_requested = true;
            kill_process_group(pid);
        }
    }

    /// Execution statistics for `module`
    pub async fn stats(&self, module: &str) -> SandboxStats {
        match self.slots.lock().await.get(module) {
            Some(slot) => slot.state.lock().await.stats.clone(),
            None => SandboxStats::default(),
        }
    }

    /// Primitives reachable from sandboxed code on this host
    pub fn available_primitives(&self) -> &[String] {
        &self.available
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    async fn slot(&self, module: &str) -> Arc<ModuleSlot> {
        self.slots
            .lock()
            .await
            .entry(module.to_string())
            .or_default()
            .clone()
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        if let Err(e) = stream.read_to_end(&mut buf).await {
            debug!("Failed to read sandbox output: {}", e);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Binding names become environment variables
fn validate_bindings(bindings: &HashMap<String, String>) -> Result<(), ModuleError> {
    for name in bindings.keys() {
        let valid = !name.is_empty()
            && !name.starts_with(|c: char| c.is_ascii_digit())
            && name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !valid || name == "PATH" || name == "MODULE_NAME" {
            return Err(ModuleError::InvalidConfiguration(format!(
                "Invalid sandbox binding name: {}",
                name
            )));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn link_primitive(target: &Path, link: &Path) -> Result<(), ModuleError> {
    std::os::unix::fs::symlink(target, link).map_err(|e| {
        ModuleError::OperationError(format!("Failed to link primitive {:?}: {}", target, e))
    })
}

#[cfg(not(unix))]
fn link_primitive(target: &Path, link: &Path) -> Result<(), ModuleError> {
    std::fs::copy(target, link).map(|_| ()).map_err(|e| {
        ModuleError::OperationError(format!("Failed to copy primitive {:?}: {}", target, e))
    })
}
