//! Script-backed modules
//!
//! The entry point is a shell script run inside the sandbox once per hook.
//! The hook name arrives in `MODULE_HOOK` and the tenant configuration as JSON
//! in `MODULE_CONFIG`; a non-zero exit fails the hook.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::module::descriptor::ConfigMap;
use crate::module::registry::manifest::ModuleManifest;
use crate::module::sandbox::{ExecutionOutput, Sandbox};
use crate::module::tasks::BackgroundTasks;
use crate::module::traits::{
    Capabilities, HealthStatus, Module, ModuleContext, ModuleError, ModuleHooks, ModuleKey,
};

struct ScriptState {
    key: ModuleKey,
    config: ConfigMap,
    data_dir: PathBuf,
}

/// Module whose hooks are sandboxed executions of one script
pub struct ScriptModule {
    manifest: ModuleManifest,
    script: String,
    hooks: ModuleHooks,
    sandbox: Arc<Sandbox>,
    state: Mutex<Option<ScriptState>>,
}

impl ScriptModule {
    pub fn new(manifest: ModuleManifest, script: String, sandbox: Arc<Sandbox>) -> Self {
        let (hooks, _) = manifest.declared_hooks();
        Self {
            manifest,
            script,
            hooks,
            sandbox,
            state: Mutex::new(None),
        }
    }

    async fn run_hook(
        &self,
        hook: &str,
        extra: &[(&str, String)],
    ) -> Result<ExecutionOutput, ModuleError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or_else(|| {
            ModuleError::OperationError(format!(
                "{} hook called before initialize on {}",
                hook, self.manifest.name
            ))
        })?;

        let context = self
            .sandbox
            .create_context(&state.key.to_string(), None)
            .with_working_dir(&state.data_dir);

        let mut bindings = HashMap::new();
        bindings.insert("MODULE_HOOK".to_string(), hook.to_string());
        bindings.insert(
            "MODULE_CONFIG".to_string(),
            serde_json::to_string(&state.config)?,
        );
        bindings.insert("MODULE_TENANT".to_string(), state.key.tenant.clone());
        for (name, value) in extra {
            bindings.insert(name.to_string(), value.clone());
        }
        drop(guard);

        debug!("Running {} hook of script module {}", hook, self.manifest.name);
        let output = self.sandbox.execute(&context, &self.script, &bindings).await?;
        if !output.success() {
            return Err(ModuleError::OperationError(format!(
                "{} hook of {} exited with status {}: {}",
                hook,
                self.manifest.name,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl Module for ScriptModule {
    fn hooks(&self) -> ModuleHooks {
        self.hooks
    }

    async fn initialize(&self, context: ModuleContext) -> Result<(), ModuleError> {
        tokio::fs::create_dir_all(&context.data_dir).await?;
        *self.state.lock().await = Some(ScriptState {
            key: context.key,
            config: context.config,
            data_dir: context.data_dir,
        });

        if let Err(e) = self.run_hook("initialize", &[]).await {
            *self.state.lock().await = None;
            return Err(ModuleError::InitializationError(e.to_string()));
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), ModuleError> {
        if self.state.lock().await.is_none() {
            return Ok(());
        }
        let result = self.run_hook("cleanup", &[]).await.map(|_| ());
        *self.state.lock().await = None;
        result
    }

    async fn start_background_tasks(&self, _tasks: &BackgroundTasks) -> Result<(), ModuleError> {
        self.run_hook("start_background_tasks", &[]).await.map(|_| ())
    }

    async fn stop_background_tasks(&self) -> Result<(), ModuleError> {
        self.run_hook("stop_background_tasks", &[]).await.map(|_| ())
    }

    async fn health_check(&self) -> Result<HealthStatus, ModuleError> {
        match self.run_hook("health_check", &[]).await {
            Ok(output) => match output.stdout.trim() {
                "" | "healthy" => Ok(HealthStatus::Healthy),
                detail => Ok(HealthStatus::Degraded(detail.to_string())),
            },
            Err(ModuleError::OperationError(detail)) => Ok(HealthStatus::Unhealthy(detail)),
            Err(e) => Err(e),
        }
    }

    async fn on_config_update(&self, config: &ConfigMap) -> Result<(), ModuleError> {
        if let Some(state) = self.state.lock().await.as_mut() {
            state.config = config.clone();
        }
        self.run_hook("on_config_update", &[]).await.map(|_| ())
    }

    fn get_capabilities(&self) -> Capabilities {
        self.manifest.capabilities.clone()
    }

    async fn prepare_handover(&self) -> Result<(), ModuleError> {
        self.run_hook("prepare_handover", &[]).await.map(|_| ())
    }

    async fn invoke(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ModuleError> {
        if !self.manifest.capabilities.tools.iter().any(|t| t == tool) {
            return Err(ModuleError::OperationError(format!(
                "Tool {} is not declared by {}",
                tool, self.manifest.name
            )));
        }

        let output = self
            .run_hook(
                "invoke",
                &[
                    ("MODULE_TOOL", tool.to_string()),
                    ("MODULE_ARGS", serde_json::to_string(&arguments)?),
                ],
            )
            .await?;

        let stdout = output.stdout.trim();
        Ok(serde_json::from_str(stdout)
            .unwrap_or_else(|_| serde_json::Value::String(stdout.to_string())))
    }
}
