//! Shared fixtures for module runtime integration tests
//!
//! Provides an artifact builder, a recording module that logs every hook call,
//! and a store wrapper that records each persisted status and can be told to
//! fail writes.

#![allow(dead_code)]

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use module_runtime::config::RuntimeConfig;
use module_runtime::module::descriptor::{
    ConfigMap, InstalledVersion, ModuleConfiguration, ModuleDescriptor,
};
use module_runtime::module::registry::{
    ModuleRegistry, RegistryEntry, RegistryMetadata, VersionRecord,
};
use module_runtime::module::store::{MemoryModuleStore, ModuleStore};
use module_runtime::module::{
    BackgroundTasks, Capabilities, HealthStatus, Module, ModuleContext, ModuleError,
    ModuleFactoryTable, ModuleHooks, ModuleManager, ModuleStatus, ProtocolHub,
};

/// One observed hook call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEvent {
    pub module: String,
    /// Construction order of the instance, starting at 1
    pub generation: u64,
    pub hook: &'static str,
}

/// Shared log and knobs for every [`RecordingModule`] a fixture builds
#[derive(Default)]
pub struct HookRecorder {
    events: Mutex<Vec<HookEvent>>,
    configs: Mutex<Vec<ConfigMap>>,
    generations: AtomicU64,
    pub fail_initialize: AtomicBool,
    pub unhealthy: AtomicBool,
    /// Milliseconds every initialize call sleeps first
    pub initialize_delay_ms: AtomicU64,
}

impl HookRecorder {
    fn record(&self, module: &str, generation: u64, hook: &'static str) {
        self.events.lock().unwrap().push(HookEvent {
            module: module.to_string(),
            generation,
            hook,
        });
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Hook names in call order, tagged with the instance generation
    pub fn calls(&self) -> Vec<(u64, &'static str)> {
        self.events()
            .into_iter()
            .map(|e| (e.generation, e.hook))
            .collect()
    }

    pub fn count(&self, hook: &str) -> usize {
        self.events().iter().filter(|e| e.hook == hook).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Configurations passed to initialize, in call order
    pub fn initialized_configs(&self) -> Vec<ConfigMap> {
        self.configs.lock().unwrap().clone()
    }

    pub fn generations(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }
}

/// Module that records every lifecycle call into a [`HookRecorder`]
pub struct RecordingModule {
    name: String,
    generation: u64,
    recorder: Arc<HookRecorder>,
}

impl RecordingModule {
    pub fn new(name: &str, recorder: Arc<HookRecorder>) -> Self {
        let generation = recorder.generations.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            name: name.to_string(),
            generation,
            recorder,
        }
    }

    fn record(&self, hook: &'static str) {
        self.recorder.record(&self.name, self.generation, hook);
    }
}

#[async_trait]
impl Module for RecordingModule {
    fn hooks(&self) -> ModuleHooks {
        ModuleHooks::all()
    }

    async fn initialize(&self, context: ModuleContext) -> Result<(), ModuleError> {
        let delay = self.recorder.initialize_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.record("initialize");
        self.recorder.configs.lock().unwrap().push(context.config);
        if self.recorder.fail_initialize.load(Ordering::SeqCst) {
            return Err(ModuleError::InitializationError(format!(
                "{} refused to start",
                self.name
            )));
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), ModuleError> {
        self.record("cleanup");
        Ok(())
    }

    async fn start_background_tasks(&self, tasks: &BackgroundTasks) -> Result<(), ModuleError> {
        self.record("start_background_tasks");
        let recorder = self.recorder.clone();
        let name = self.name.clone();
        let generation = self.generation;
        tasks
            .spawn("ticker", move |token| async move {
                token.cancelled().await;
                recorder.record(&name, generation, "task_stopped");
                Ok(())
            })
            .await
    }

    async fn stop_background_tasks(&self) -> Result<(), ModuleError> {
        self.record("stop_background_tasks");
        Ok(())
    }

    async fn health_check(&self) -> Result<HealthStatus, ModuleError> {
        self.record("health_check");
        if self.recorder.unhealthy.load(Ordering::SeqCst) {
            Ok(HealthStatus::Unhealthy("backend unreachable".to_string()))
        } else {
            Ok(HealthStatus::Healthy)
        }
    }

    async fn on_config_update(&self, _config: &ConfigMap) -> Result<(), ModuleError> {
        self.record("on_config_update");
        Ok(())
    }

    fn get_capabilities(&self) -> Capabilities {
        Capabilities {
            tools: vec![format!("{}_status", self.name)],
            ..Capabilities::default()
        }
    }

    async fn prepare_handover(&self) -> Result<(), ModuleError> {
        self.record("prepare_handover");
        Ok(())
    }

    async fn invoke(
        &self,
        tool: &str,
        _arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ModuleError> {
        Ok(serde_json::json!({
            "tool": tool,
            "generation": self.generation,
        }))
    }
}

/// Store wrapper that remembers every status it was asked to persist
pub struct StatusTrackingStore {
    inner: MemoryModuleStore,
    statuses: Mutex<Vec<(String, ModuleStatus)>>,
    /// Fail every configuration write
    pub fail_configuration: AtomicBool,
    /// Fail every version history write
    pub fail_versions: AtomicBool,
    /// Fail descriptor writes carrying this status
    fail_status: Mutex<Option<ModuleStatus>>,
}

impl StatusTrackingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryModuleStore::new(),
            statuses: Mutex::new(Vec::new()),
            fail_configuration: AtomicBool::new(false),
            fail_versions: AtomicBool::new(false),
            fail_status: Mutex::new(None),
        }
    }

    pub fn fail_descriptor_writes_with(&self, status: Option<ModuleStatus>) {
        *self.fail_status.lock().unwrap() = status;
    }

    fn disk_full() -> ModuleError {
        ModuleError::Storage("disk full".to_string())
    }

    /// Persisted statuses of `name`, oldest first
    pub fn statuses(&self, name: &str) -> Vec<ModuleStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, s)| *s)
            .collect()
    }
}

#[async_trait]
impl ModuleStore for StatusTrackingStore {
    async fn get_descriptor(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<ModuleDescriptor>, ModuleError> {
        self.inner.get_descriptor(tenant, name).await
    }

    async fn upsert_descriptor(&self, descriptor: &ModuleDescriptor) -> Result<(), ModuleError> {
        if *self.fail_status.lock().unwrap() == Some(descriptor.status) {
            return Err(Self::disk_full());
        }
        {
            let mut statuses = self.statuses.lock().unwrap();
            let changed = statuses
                .iter()
                .rev()
                .find(|(n, _)| n == &descriptor.name)
                .map(|(_, s)| *s != descriptor.status)
                .unwrap_or(true);
            if changed {
                statuses.push((descriptor.name.clone(), descriptor.status));
            }
        }
        self.inner.upsert_descriptor(descriptor).await
    }

    async fn get_configuration(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<ModuleConfiguration>, ModuleError> {
        self.inner.get_configuration(tenant, name).await
    }

    async fn upsert_configuration(
        &self,
        tenant: &str,
        name: &str,
        data: &ConfigMap,
    ) -> Result<(), ModuleError> {
        if self.fail_configuration.load(Ordering::SeqCst) {
            return Err(Self::disk_full());
        }
        self.inner.upsert_configuration(tenant, name, data).await
    }

    async fn delete_descriptor_and_configuration(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<(), ModuleError> {
        self.inner.delete_descriptor_and_configuration(tenant, name).await
    }

    async fn list_descriptors(&self, tenant: &str) -> Result<Vec<ModuleDescriptor>, ModuleError> {
        self.inner.list_descriptors(tenant).await
    }

    async fn record_version(
        &self,
        tenant: &str,
        name: &str,
        version: InstalledVersion,
    ) -> Result<(), ModuleError> {
        if self.fail_versions.load(Ordering::SeqCst) {
            return Err(Self::disk_full());
        }
        self.inner.record_version(tenant, name, version).await
    }

    async fn version_history(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Vec<InstalledVersion>, ModuleError> {
        self.inner.version_history(tenant, name).await
    }

    async fn upsert_registry_entry(&self, entry: &RegistryEntry) -> Result<(), ModuleError> {
        self.inner.upsert_registry_entry(entry).await
    }

    async fn list_registry_entries(&self) -> Result<Vec<RegistryEntry>, ModuleError> {
        self.inner.list_registry_entries().await
    }
}

/// Write an artifact directory with a manifest and its entry point
pub fn write_artifact(
    dir: &Path,
    name: &str,
    version: &str,
    manifest_extra: &str,
    entry_point: &str,
) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join("module.toml"),
        format!(
            "name = \"{}\"\nversion = \"{}\"\nentry_point = \"main.mod\"\n{}",
            name, version, manifest_extra
        ),
    )
    .unwrap();
    fs::write(dir.join("main.mod"), entry_point).unwrap();
    dir.to_path_buf()
}

/// Manager over a temp directory with recording modules
pub struct ModuleTestFixture {
    pub temp_dir: TempDir,
    pub artifacts_dir: PathBuf,
    pub registry: Arc<ModuleRegistry>,
    pub hub: ProtocolHub,
    pub store: Arc<StatusTrackingStore>,
    pub recorder: Arc<HookRecorder>,
    pub manager: Arc<ModuleManager>,
}

impl ModuleTestFixture {
    /// Fixture whose factory table builds a [`RecordingModule`] for each name
    pub fn new(module_names: &[&str]) -> Self {
        Self::with_config(module_names, |_| {})
    }

    pub fn with_config(module_names: &[&str], adjust: impl FnOnce(&mut RuntimeConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let artifacts_dir = temp_dir.path().join("modules");
        fs::create_dir_all(&artifacts_dir).unwrap();

        let mut config = RuntimeConfig {
            artifacts_dir: artifacts_dir.clone(),
            data_dir: temp_dir.path().join("data"),
            ..RuntimeConfig::default()
        };
        config.lifecycle.task_grace_period_millis = 500;
        adjust(&mut config);

        let recorder = Arc::new(HookRecorder::default());
        let mut factories = ModuleFactoryTable::new();
        for name in module_names {
            let recorder = recorder.clone();
            let module_name = name.to_string();
            factories.register(*name, move |_| {
                Ok(Arc::new(RecordingModule::new(&module_name, recorder.clone())) as Arc<dyn Module>)
            });
        }

        let registry = Arc::new(ModuleRegistry::new());
        let hub = ProtocolHub::new();
        let store = Arc::new(StatusTrackingStore::new());
        let manager = ModuleManager::new(
            config,
            registry.clone(),
            factories,
            store.clone(),
            Arc::new(hub.clone()),
        )
        .unwrap();

        Self {
            temp_dir,
            artifacts_dir,
            registry,
            hub,
            store,
            recorder,
            manager: Arc::new(manager),
        }
    }

    /// Artifact directory used for `name` at `version`
    pub fn artifact_dir(&self, name: &str, version: &str) -> PathBuf {
        self.artifacts_dir.join(format!("{}-{}", name, version))
    }

    /// Write a native artifact and publish it in the registry
    pub async fn publish(&self, name: &str, version: &str, metadata: RegistryMetadata) -> PathBuf {
        let dir = write_artifact(
            &self.artifact_dir(name, version),
            name,
            version,
            "hooks = [\"initialize\", \"cleanup\", \"health_check\", \"prepare_handover\"]\n",
            &format!("{} {}", name, version),
        );
        self.publish_dir(name, version, metadata, &dir).await;
        dir
    }

    /// Publish an already written artifact directory
    pub async fn publish_dir(&self, name: &str, version: &str, metadata: RegistryMetadata, dir: &Path) {
        self.registry.register(name, metadata).await.unwrap();
        self.registry
            .add_version(name, VersionRecord::new(version, dir))
            .await
            .unwrap();
    }

    /// Change one byte of the entry point of a published artifact
    pub fn modify_artifact(&self, name: &str, version: &str) {
        let path = self.artifact_dir(name, version).join("main.mod");
        let mut contents = fs::read(&path).unwrap();
        contents.push(b'!');
        fs::write(&path, contents).unwrap();
    }

    /// Publish, install and activate `name` v1.0.0 for `tenant`
    pub async fn activate_fresh(&self, tenant: &str, name: &str) {
        self.publish(name, "1.0.0", RegistryMetadata::default()).await;
        self.manager.install(tenant, name, None, None).await.unwrap();
        self.manager.activate(tenant, name).await.unwrap();
    }

    pub async fn status(&self, tenant: &str, name: &str) -> Option<ModuleStatus> {
        self.manager
            .get_descriptor(tenant, name)
            .await
            .unwrap()
            .map(|d| d.status)
    }
}

/// Defaults map from JSON
pub fn config_map(value: serde_json::Value) -> ConfigMap {
    value.as_object().cloned().unwrap_or_default()
}
