//! Module manager for orchestrating all modules
//!
//! Owns the lifecycle state machine of every (tenant, module) installation,
//! the live instance map and each instance's background tasks. Operations on
//! the same key are serialized; different keys proceed concurrently.
//!
//! | Operation | Valid from | Result |
//! |---|---|---|
//! | install | absent | inactive |
//! | activate | inactive | active |
//! | deactivate | active | inactive |
//! | reload | active | active |
//! | uninstall | inactive | absent (never for system modules) |
//! | reset | error | inactive |

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::module::api::{ProtocolClient, ProtocolClientFactory};
use crate::module::descriptor::{ConfigMap, InstalledVersion, ModuleDescriptor};
use crate::module::loader::loader::checksum_of;
use crate::module::loader::{LoadedModule, ModuleFactoryTable, ModuleLoader};
use crate::module::monitor::{self, HealthMonitor, HealthReport, HealthSweepSummary};
use crate::module::registry::{DiscoveredModule, ModuleDependencies, ModuleDiscovery, ModuleRegistry};
use crate::module::sandbox::{Sandbox, SandboxStats};
use crate::module::store::{open_store, ModuleStore};
use crate::module::tasks::BackgroundTasks;
use crate::module::traits::{
    ModuleContext, ModuleError, ModuleHooks, ModuleKey, ModuleStatus,
};
use crate::module::validation::missing_required_keys;
use crate::utils::{current_timestamp, with_hook_timeout};

/// A live instance together with everything the manager owns on its behalf
pub struct ActiveModule {
    pub loaded: Arc<LoadedModule>,
    /// The one protocol client of this instance
    pub client: Arc<dyn ProtocolClient>,
    pub tasks: Arc<BackgroundTasks>,
}

/// Snapshot returned by [`ModuleManager::get_health`]
#[derive(Debug, Clone, Serialize)]
pub struct ModuleHealth {
    pub tenant: String,
    pub name: String,
    pub status: ModuleStatus,
    pub version: String,
    /// Checksum of the live instance, if any
    pub checksum: Option<String>,
    pub last_report: Option<HealthReport>,
    pub background_tasks: usize,
    pub sandbox: SandboxStats,
    pub last_error: Option<String>,
}

/// Module manager coordinates all installed modules
pub struct ModuleManager {
    config: RuntimeConfig,
    host_version: semver::Version,
    registry: Arc<ModuleRegistry>,
    loader: ModuleLoader,
    sandbox: Arc<Sandbox>,
    store: Arc<dyn ModuleStore>,
    clients: Arc<dyn ProtocolClientFactory>,
    active: RwLock<HashMap<ModuleKey, Arc<ActiveModule>>>,
    key_locks: Arc<KeyLocks>,
    health: RwLock<HashMap<ModuleKey, HealthReport>>,
    monitor: HealthMonitor,
}

impl ModuleManager {
    /// Create a manager over an explicit store
    pub fn new(
        config: RuntimeConfig,
        registry: Arc<ModuleRegistry>,
        factories: ModuleFactoryTable,
        store: Arc<dyn ModuleStore>,
        clients: Arc<dyn ProtocolClientFactory>,
    ) -> Result<Self, ModuleError> {
        config
            .validate()
            .map_err(|e| ModuleError::InvalidConfiguration(e.to_string()))?;
        let host_version = semver::Version::parse(&config.host_version).map_err(|e| {
            ModuleError::InvalidConfiguration(format!(
                "Invalid host version {}: {}",
                config.host_version, e
            ))
        })?;
        let sandbox = Arc::new(Sandbox::new(config.sandbox.clone())?);
        let loader = ModuleLoader::new(factories, sandbox.clone());

        info!("Module manager ready (host version {})", host_version);
        Ok(Self {
            config,
            host_version,
            registry,
            loader,
            sandbox,
            store,
            clients,
            active: RwLock::new(HashMap::new()),
            key_locks: Arc::new(KeyLocks::default()),
            health: RwLock::new(HashMap::new()),
            monitor: HealthMonitor::new(),
        })
    }

    /// Create a manager with the store backend named in the configuration
    pub fn with_config(
        config: RuntimeConfig,
        registry: Arc<ModuleRegistry>,
        factories: ModuleFactoryTable,
        clients: Arc<dyn ProtocolClientFactory>,
    ) -> Result<Self, ModuleError> {
        let store = open_store(&config.store)?;
        Self::new(config, registry, factories, store, clients)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub fn store(&self) -> &Arc<dyn ModuleStore> {
        &self.store
    }

    /// Install a catalogue module for `tenant`
    ///
    /// `version` defaults to the latest available one; `config` is merged over
    /// the catalogue defaults.
    pub async fn install(
        &self,
        tenant: &str,
        name: &str,
        version: Option<&str>,
        config: Option<ConfigMap>,
    ) -> Result<ModuleDescriptor, ModuleError> {
        let key = ModuleKey::new(tenant, name);
        let _guard = self.lock_key(&key).await;

        if let Some(existing) = self.store.get_descriptor(tenant, name).await? {
            return Err(ModuleError::lifecycle(&key, "install", existing.status));
        }

        let entry = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| ModuleError::ModuleNotFound(format!("{} is not in the registry", name)))?;
        let version = match version {
            Some(v) => v.to_string(),
            None => entry.latest_version.clone().ok_or_else(|| {
                ModuleError::ModuleNotFound(format!("{} has no available version", name))
            })?,
        };
        let record = entry.version(&version).cloned().ok_or_else(|| {
            ModuleError::ModuleNotFound(format!("{} has no version {}", name, version))
        })?;

        let metadata = entry.metadata;
        let mut descriptor = ModuleDescriptor {
            tenant: tenant.to_string(),
            name: name.to_string(),
            version: version.clone(),
            status: ModuleStatus::Installing,
            is_system: metadata.is_system,
            artifact_path: record.artifact_path.clone(),
            config_schema: metadata.config_schema,
            default_config: metadata.default_config,
            dependencies: metadata.dependencies,
            min_host_version: metadata.min_host_version,
            max_host_version: metadata.max_host_version,
            installed_at: None,
            activated_at: None,
            last_used_at: None,
            last_error: None,
        };
        self.store.upsert_descriptor(&descriptor).await?;
        info!(module = %key, "Installing v{}", version);

        let mut data = descriptor.default_config.clone();
        if let Some(config) = config {
            data.extend(config);
        }

        let checks = async {
            if !record.available {
                return Err(ModuleError::VersionIncompatible(format!(
                    "{} v{} is not available",
                    name, version
                )));
            }
            if !record.compatible {
                return Err(ModuleError::VersionIncompatible(format!(
                    "{} v{} is marked incompatible",
                    name, version
                )));
            }

            let manifest = self.loader.validate_structure(&record.artifact_path)?;
            if manifest.name != name || manifest.version != version {
                return Err(ModuleError::StructuralValidation(format!(
                    "Artifact {:?} contains {} v{}, expected {} v{}",
                    record.artifact_path, manifest.name, manifest.version, name, version
                )));
            }

            self.check_host_version(&descriptor)?;
            self.check_dependencies(&descriptor).await?;

            let missing = missing_required_keys(&descriptor.config_schema, &data);
            if !missing.is_empty() {
                return Err(ModuleError::InvalidConfiguration(format!(
                    "Missing required keys: {}",
                    missing.join(", ")
                )));
            }

            checksum_of(&record.artifact_path).await
        };

        let outcome = checks.await;
        let checksum = match outcome {
            Ok(checksum) => checksum,
            Err(e) => {
                self.mark_error(&mut descriptor, &e).await;
                return Err(e);
            }
        };

        let persisted = async {
            self.store.upsert_configuration(tenant, name, &data).await?;
            self.store
                .record_version(
                    tenant,
                    name,
                    InstalledVersion {
                        version: version.clone(),
                        checksum: Some(checksum),
                        recorded_at: current_timestamp(),
                    },
                )
                .await?;

            let mut installed = descriptor.clone();
            installed.status = ModuleStatus::Inactive;
            installed.installed_at = Some(current_timestamp());
            self.store.upsert_descriptor(&installed).await?;
            Ok::<_, ModuleError>(installed)
        }
        .await;

        match persisted {
            Ok(installed) => {
                info!(module = %key, "Installed v{}", version);
                Ok(installed)
            }
            Err(e) => {
                self.mark_error(&mut descriptor, &e).await;
                Err(e)
            }
        }
    }

    /// Load, initialize and start an inactive module
    pub async fn activate(&self, tenant: &str, name: &str) -> Result<ModuleDescriptor, ModuleError> {
        let key = ModuleKey::new(tenant, name);
        let _guard = self.lock_key(&key).await;

        let mut descriptor = self.descriptor_for(&key, "activate").await?;
        require_status(&key, &descriptor, "activate", ModuleStatus::Inactive)?;

        if let Err(e) = self.start_instance(&key, &descriptor).await {
            self.mark_error(&mut descriptor, &e).await;
            return Err(e);
        }

        descriptor.status = ModuleStatus::Active;
        descriptor.activated_at = Some(current_timestamp());
        descriptor.last_error = None;
        if let Err(e) = self.store.upsert_descriptor(&descriptor).await {
            // An instance the store does not know about must not stay live
            if let Err(stop_err) = self.stop_instance(&key).await {
                warn!(module = %key, "Teardown after failed activation failed: {}", stop_err);
            }
            self.mark_error(&mut descriptor, &e).await;
            return Err(e);
        }
        info!(module = %key, "Activated v{}", descriptor.version);
        Ok(descriptor)
    }

    /// Stop an active module and release its instance
    pub async fn deactivate(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<ModuleDescriptor, ModuleError> {
        let key = ModuleKey::new(tenant, name);
        let _guard = self.lock_key(&key).await;

        let mut descriptor = self.descriptor_for(&key, "deactivate").await?;
        require_status(&key, &descriptor, "deactivate", ModuleStatus::Active)?;

        let result = self.stop_instance(&key).await;
        if let Err(e) = result {
            self.mark_error(&mut descriptor, &e).await;
            return Err(e);
        }

        descriptor.status = ModuleStatus::Inactive;
        if let Err(e) = self.store.upsert_descriptor(&descriptor).await {
            self.mark_error(&mut descriptor, &e).await;
            return Err(e);
        }
        info!(module = %key, "Deactivated");
        Ok(descriptor)
    }

    /// Hot-swap an active module if its artifact changed
    ///
    /// The old instance keeps serving until the new one is initialized; the
    /// live map is never without an instance for `key`.
    pub async fn reload(&self, tenant: &str, name: &str) -> Result<ModuleDescriptor, ModuleError> {
        let key = ModuleKey::new(tenant, name);
        let _guard = self.lock_key(&key).await;

        let mut descriptor = self.descriptor_for(&key, "reload").await?;
        require_status(&key, &descriptor, "reload", ModuleStatus::Active)?;

        let old = self.live(&key).await.ok_or_else(|| {
            ModuleError::OperationError(format!(
                "Module {} has no live instance; restore it before reloading",
                key
            ))
        })?;

        let loaded = match self.loader.reload(&key, &descriptor.artifact_path).await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.loader.restore(old.loaded.clone()).await;
                self.mark_error(&mut descriptor, &e).await;
                return Err(e);
            }
        };

        if Arc::ptr_eq(&loaded, &old.loaded) {
            debug!(module = %key, "Artifact unchanged, nothing to reload");
            return Ok(descriptor);
        }

        if old.loaded.instance.hooks().contains(ModuleHooks::PREPARE_HANDOVER) {
            let handover = with_hook_timeout(
                self.hook_timeout(),
                old.loaded.instance.prepare_handover(),
            )
            .await;
            if let Err(e) = handover {
                self.loader.restore(old.loaded.clone()).await;
                self.mark_error(&mut descriptor, &e).await;
                return Err(e);
            }
        }

        let config = match self.current_config(&descriptor).await {
            Ok(config) => config,
            Err(e) => {
                self.loader.restore(old.loaded.clone()).await;
                self.mark_error(&mut descriptor, &e).await;
                return Err(e);
            }
        };

        let new = self.new_active(&key, loaded.clone());
        self.active.write().await.insert(key.clone(), new.clone());

        if let Err(e) = self.initialize_instance(&key, &new, config).await {
            warn!(module = %key, "New instance failed to initialize, keeping the old one: {}", e);
            self.active.write().await.insert(key.clone(), old.clone());
            self.loader.restore(old.loaded.clone()).await;
            if let Err(close_err) = new.client.close().await {
                debug!(module = %key, "Closing discarded client failed: {}", close_err);
            }
            self.mark_error(&mut descriptor, &e).await;
            return Err(e);
        }

        if let Err(e) = self.teardown(&key, &old).await {
            warn!(module = %key, "Old instance did not shut down cleanly: {}", e);
        }

        if let Err(e) = self.start_tasks(&new).await {
            self.mark_error(&mut descriptor, &e).await;
            return Err(e);
        }

        descriptor.version = loaded.manifest.version.clone();
        descriptor.last_error = None;
        self.health.write().await.remove(&key);
        let persisted = async {
            self.store
                .record_version(
                    tenant,
                    name,
                    InstalledVersion {
                        version: descriptor.version.clone(),
                        checksum: Some(loaded.checksum.clone()),
                        recorded_at: current_timestamp(),
                    },
                )
                .await?;
            self.store.upsert_descriptor(&descriptor).await
        }
        .await;
        if let Err(e) = persisted {
            // The new instance stays live; reset tears it down
            self.mark_error(&mut descriptor, &e).await;
            return Err(e);
        }

        info!(
            module = %key,
            "Reloaded v{} ({} -> {})",
            descriptor.version, old.loaded.checksum, loaded.checksum
        );
        Ok(descriptor)
    }

    /// Remove an inactive installation with its configuration and history
    pub async fn uninstall(&self, tenant: &str, name: &str) -> Result<(), ModuleError> {
        let key = ModuleKey::new(tenant, name);
        let _guard = self.lock_key(&key).await;

        let descriptor = self.descriptor_for(&key, "uninstall").await?;
        if descriptor.is_system {
            return Err(ModuleError::SystemModuleProtected(key.to_string()));
        }
        require_status(&key, &descriptor, "uninstall", ModuleStatus::Inactive)?;

        self.store
            .delete_descriptor_and_configuration(tenant, name)
            .await?;
        self.loader.unload(&key).await;
        self.sandbox.terminate(&key.to_string()).await;
        self.health.write().await.remove(&key);

        let data_dir = self.data_dir(&key);
        match tokio::fs::remove_dir_all(&data_dir).await {
            Ok(()) => debug!(module = %key, "Removed data directory {:?}", data_dir),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(module = %key, "Failed to remove data directory {:?}: {}", data_dir, e),
        }

        info!(module = %key, "Uninstalled");
        Ok(())
    }

    /// Replace the configuration of an installed module
    ///
    /// A live instance providing `on_config_update` is notified.
    pub async fn update_configuration(
        &self,
        tenant: &str,
        name: &str,
        config: ConfigMap,
    ) -> Result<ModuleDescriptor, ModuleError> {
        let key = ModuleKey::new(tenant, name);
        let _guard = self.lock_key(&key).await;

        let descriptor = self.descriptor_for(&key, "update configuration of").await?;
        if !matches!(
            descriptor.status,
            ModuleStatus::Inactive | ModuleStatus::Active
        ) {
            return Err(ModuleError::lifecycle(
                &key,
                "update configuration of",
                descriptor.status,
            ));
        }

        let missing = missing_required_keys(&descriptor.config_schema, &config);
        if !missing.is_empty() {
            return Err(ModuleError::InvalidConfiguration(format!(
                "Missing required keys: {}",
                missing.join(", ")
            )));
        }

        self.store.upsert_configuration(tenant, name, &config).await?;
        debug!(module = %key, "Configuration updated");

        if let Some(active) = self.live(&key).await {
            let instance = &active.loaded.instance;
            if instance.hooks().contains(ModuleHooks::ON_CONFIG_UPDATE) {
                with_hook_timeout(self.hook_timeout(), instance.on_config_update(&config)).await?;
            }
        }
        Ok(descriptor)
    }

    /// Return an errored module to `inactive`, tearing down anything still live
    pub async fn reset(&self, tenant: &str, name: &str) -> Result<ModuleDescriptor, ModuleError> {
        let key = ModuleKey::new(tenant, name);
        let _guard = self.lock_key(&key).await;

        let mut descriptor = self.descriptor_for(&key, "reset").await?;
        require_status(&key, &descriptor, "reset", ModuleStatus::Error)?;

        if let Err(e) = self.stop_instance(&key).await {
            warn!(module = %key, "Teardown during reset failed: {}", e);
        }

        descriptor.status = ModuleStatus::Inactive;
        descriptor.last_error = None;
        self.store.upsert_descriptor(&descriptor).await?;
        info!(module = %key, "Reset to inactive");
        Ok(descriptor)
    }

    /// Health snapshot of one installation
    pub async fn get_health(&self, tenant: &str, name: &str) -> Result<ModuleHealth, ModuleError> {
        let key = ModuleKey::new(tenant, name);
        let descriptor = self.require_descriptor(&key).await?;
        let live = self.live(&key).await;

        let background_tasks = match &live {
            Some(active) => active.tasks.len().await,
            None => 0,
        };
        Ok(ModuleHealth {
            tenant: descriptor.tenant,
            name: descriptor.name,
            status: descriptor.status,
            version: descriptor.version,
            checksum: live.as_ref().map(|a| a.loaded.checksum.clone()),
            last_report: self.health.read().await.get(&key).cloned(),
            background_tasks,
            sandbox: self.sandbox.stats(&key.to_string()).await,
            last_error: descriptor.last_error,
        })
    }

    /// Scan the artifacts directory
    pub async fn discover(&self) -> Result<Vec<DiscoveredModule>, ModuleError> {
        let discovery = ModuleDiscovery::new(&self.config.artifacts_dir);
        tokio::task::spawn_blocking(move || discovery.discover_modules())
            .await
            .map_err(|e| ModuleError::OperationError(format!("Discovery task failed: {}", e)))?
    }

    pub async fn get_descriptor(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<ModuleDescriptor>, ModuleError> {
        self.store.get_descriptor(tenant, name).await
    }

    pub async fn list_modules(&self, tenant: &str) -> Result<Vec<ModuleDescriptor>, ModuleError> {
        self.store.list_descriptors(tenant).await
    }

    /// Live instance for `(tenant, name)`, if any
    pub async fn get_loaded(&self, tenant: &str, name: &str) -> Option<Arc<LoadedModule>> {
        self.live(&ModuleKey::new(tenant, name))
            .await
            .map(|a| a.loaded.clone())
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Call a tool on a live module and stamp `last_used_at`
    pub async fn invoke(
        &self,
        tenant: &str,
        name: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ModuleError> {
        let key = ModuleKey::new(tenant, name);
        let active = self
            .live(&key)
            .await
            .ok_or_else(|| ModuleError::ModuleNotFound(format!("{} is not active", key)))?;

        let result = active.loaded.instance.invoke(tool, arguments).await;

        let _guard = self.lock_key(&key).await;
        if let Some(mut descriptor) = self.store.get_descriptor(tenant, name).await? {
            descriptor.last_used_at = Some(current_timestamp());
            self.store.upsert_descriptor(&descriptor).await?;
        }
        result
    }

    /// Bring back every persisted `active` module of `tenant` that has no
    /// live instance, dependencies first
    ///
    /// Modules that fail to start move to `error`; the rest continue.
    pub async fn restore_active(&self, tenant: &str) -> Result<Vec<ModuleKey>, ModuleError> {
        let descriptors = self.store.list_descriptors(tenant).await?;
        let order = match ModuleDependencies::resolve(&descriptors) {
            Ok(resolution) => resolution.load_order,
            Err(e) => {
                warn!("Dependency order for tenant {} unavailable, using name order: {}", tenant, e);
                descriptors.iter().map(|d| d.name.clone()).collect()
            }
        };

        let mut restored = Vec::new();
        for name in order {
            let key = ModuleKey::new(tenant, name.as_str());
            let _guard = self.lock_key(&key).await;

            let Some(mut descriptor) = self.store.get_descriptor(tenant, &name).await? else {
                continue;
            };
            if descriptor.status != ModuleStatus::Active || self.live(&key).await.is_some() {
                continue;
            }

            match self.start_instance(&key, &descriptor).await {
                Ok(()) => {
                    descriptor.activated_at = Some(current_timestamp());
                    if let Err(e) = self.store.upsert_descriptor(&descriptor).await {
                        warn!(module = %key, "Failed to stamp activation time: {}", e);
                    }
                    info!(module = %key, "Restored");
                    restored.push(key);
                }
                Err(e) => self.mark_error(&mut descriptor, &e).await,
            }
        }
        Ok(restored)
    }

    /// Health-check every live instance once
    pub async fn run_health_sweep(&self) -> HealthSweepSummary {
        let targets: Vec<_> = self
            .active
            .read()
            .await
            .iter()
            .map(|(key, active)| (key.clone(), active.loaded.instance.clone()))
            .collect();

        let timeout = Duration::from_secs(self.config.health.check_timeout_seconds);
        let (reports, summary) = monitor::sweep(targets, timeout).await;

        let mut health = self.health.write().await;
        for (key, report) in reports {
            health.insert(key, report);
        }
        summary
    }

    /// Start the periodic health sweep; returns false when disabled or already running
    pub async fn start_health_monitor(self: &Arc<Self>) -> bool {
        if !self.config.health.enabled {
            debug!("Health monitoring disabled");
            return false;
        }

        let manager = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.health.interval_seconds);
        self.monitor
            .start(interval, move || {
                let manager = manager.clone();
                async move {
                    match manager.upgrade() {
                        Some(manager) => {
                            manager.run_health_sweep().await;
                            true
                        }
                        None => false,
                    }
                }
            })
            .await
    }

    /// Stop the health monitor and tear down every live instance
    ///
    /// Persisted statuses are left as they are so `restore_active` can bring
    /// the same modules back.
    pub async fn shutdown(&self) {
        info!("Shutting down module manager");
        self.monitor.stop().await;

        let keys: Vec<ModuleKey> = self.active.read().await.keys().cloned().collect();
        for key in keys {
            let _guard = self.lock_key(&key).await;
            if let Err(e) = self.stop_instance(&key).await {
                warn!(module = %key, "Teardown during shutdown failed: {}", e);
            }
        }
        info!("Module manager shut down");
    }

    async fn lock_key(&self, key: &ModuleKey) -> KeyGuard {
        let lock = self.key_locks.entry(key);
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: self.key_locks.clone(),
            key: key.clone(),
            guard: Some(guard),
        }
    }

    async fn live(&self, key: &ModuleKey) -> Option<Arc<ActiveModule>> {
        self.active.read().await.get(key).cloned()
    }

    async fn require_descriptor(&self, key: &ModuleKey) -> Result<ModuleDescriptor, ModuleError> {
        self.store
            .get_descriptor(&key.tenant, &key.name)
            .await?
            .ok_or_else(|| ModuleError::ModuleNotFound(key.to_string()))
    }

    /// Descriptor for a lifecycle operation; a missing one is the `absent` state
    async fn descriptor_for(
        &self,
        key: &ModuleKey,
        operation: &str,
    ) -> Result<ModuleDescriptor, ModuleError> {
        self.store
            .get_descriptor(&key.tenant, &key.name)
            .await?
            .ok_or_else(|| ModuleError::LifecycleState {
                module: key.to_string(),
                operation: operation.to_string(),
                status: "absent".to_string(),
            })
    }

    async fn current_config(&self, descriptor: &ModuleDescriptor) -> Result<ConfigMap, ModuleError> {
        Ok(self
            .store
            .get_configuration(&descriptor.tenant, &descriptor.name)
            .await?
            .map(|c| c.data)
            .unwrap_or_else(|| descriptor.default_config.clone()))
    }

    async fn mark_error(&self, descriptor: &mut ModuleDescriptor, err: &ModuleError) {
        error!(
            module = %descriptor.key(),
            "Moving to error state: {}", err
        );
        descriptor.status = ModuleStatus::Error;
        descriptor.last_error = Some(err.to_string());
        if let Err(e) = self.store.upsert_descriptor(descriptor).await {
            error!(module = %descriptor.key(), "Failed to persist error state: {}", e);
        }
    }

    fn check_host_version(&self, descriptor: &ModuleDescriptor) -> Result<(), ModuleError> {
        let parse = |v: &str| {
            semver::Version::parse(v).map_err(|e| {
                ModuleError::VersionIncompatible(format!("Invalid host version bound {}: {}", v, e))
            })
        };

        if let Some(min) = descriptor.min_host_version.as_deref() {
            if self.host_version < parse(min)? {
                return Err(ModuleError::VersionIncompatible(format!(
                    "{} requires host >= {}, host is {}",
                    descriptor.name, min, self.host_version
                )));
            }
        }
        if let Some(max) = descriptor.max_host_version.as_deref() {
            if self.host_version > parse(max)? {
                return Err(ModuleError::VersionIncompatible(format!(
                    "{} requires host <= {}, host is {}",
                    descriptor.name, max, self.host_version
                )));
            }
        }
        Ok(())
    }

    async fn check_dependencies(&self, descriptor: &ModuleDescriptor) -> Result<(), ModuleError> {
        let mut missing = Vec::new();
        for dep in &descriptor.dependencies {
            match self.store.get_descriptor(&descriptor.tenant, dep).await? {
                Some(d) if d.status != ModuleStatus::Installing => {}
                _ => missing.push(dep.clone()),
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ModuleError::DependencyMissing(format!(
                "{} requires {} to be installed for tenant {}",
                descriptor.name,
                missing.join(", "),
                descriptor.tenant
            )))
        }
    }

    fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.config.lifecycle.hook_timeout_seconds)
    }

    fn data_dir(&self, key: &ModuleKey) -> PathBuf {
        self.config.data_dir.join(&key.tenant).join(&key.name)
    }

    fn new_active(&self, key: &ModuleKey, loaded: Arc<LoadedModule>) -> Arc<ActiveModule> {
        let client = self.clients.create_client(key, loaded.instance.clone());
        Arc::new(ActiveModule {
            loaded,
            client,
            tasks: Arc::new(BackgroundTasks::new(key.clone())),
        })
    }

    /// Load, initialize and start tasks, then publish the instance
    async fn start_instance(
        &self,
        key: &ModuleKey,
        descriptor: &ModuleDescriptor,
    ) -> Result<(), ModuleError> {
        let loaded = self.loader.load(key, &descriptor.artifact_path).await?;
        let active = self.new_active(key, loaded);
        let config = self.current_config(descriptor).await?;

        if let Err(e) = self.initialize_instance(key, &active, config).await {
            let _ = active.client.close().await;
            self.loader.unload(key).await;
            return Err(e);
        }

        if let Err(e) = self.start_tasks(&active).await {
            if let Err(teardown_err) = self.teardown(key, &active).await {
                warn!(module = %key, "Teardown after failed start also failed: {}", teardown_err);
            }
            self.loader.unload(key).await;
            return Err(e);
        }

        self.active.write().await.insert(key.clone(), active);
        Ok(())
    }

    /// Remove the live instance (if any) and tear it down
    async fn stop_instance(&self, key: &ModuleKey) -> Result<(), ModuleError> {
        let removed = self.active.write().await.remove(key);
        let result = match &removed {
            Some(active) => self.teardown(key, active).await,
            None => Ok(()),
        };
        self.loader.unload(key).await;
        self.sandbox.terminate(&key.to_string()).await;
        self.health.write().await.remove(key);
        result
    }

    async fn initialize_instance(
        &self,
        key: &ModuleKey,
        active: &ActiveModule,
        config: ConfigMap,
    ) -> Result<(), ModuleError> {
        let instance = &active.loaded.instance;
        let context = ModuleContext {
            key: key.clone(),
            instance_id: active.loaded.instance_id,
            config,
            client: active.client.clone(),
            data_dir: self.data_dir(key),
            sandbox: self.sandbox.clone(),
        };
        with_hook_timeout(self.hook_timeout(), instance.initialize(context)).await?;

        if let Err(e) = self.register_capabilities(active).await {
            warn!(module = %key, "Capability registration failed, cleaning up: {}", e);
            if let Err(cleanup_err) =
                with_hook_timeout(self.hook_timeout(), instance.cleanup()).await
            {
                warn!(module = %key, "cleanup failed: {}", cleanup_err);
            }
            return Err(e);
        }
        debug!(module = %key, "Instance {} initialized", active.loaded.instance_id);
        Ok(())
    }

    async fn register_capabilities(&self, active: &ActiveModule) -> Result<(), ModuleError> {
        let instance = &active.loaded.instance;
        let capabilities = if instance.hooks().contains(ModuleHooks::GET_CAPABILITIES) {
            instance.get_capabilities()
        } else {
            active.loaded.manifest.capabilities.clone()
        };
        if capabilities.is_empty() {
            return Ok(());
        }
        active.client.register_capabilities(capabilities).await
    }

    async fn start_tasks(&self, active: &ActiveModule) -> Result<(), ModuleError> {
        let instance = &active.loaded.instance;
        if instance.hooks().contains(ModuleHooks::START_BACKGROUND_TASKS) {
            with_hook_timeout(
                self.hook_timeout(),
                instance.start_background_tasks(&active.tasks),
            )
            .await?;
        }
        Ok(())
    }

    /// Stop hook, cancel and await tasks, then cleanup and close the client
    ///
    /// Every step runs even if an earlier one failed; the first error is returned.
    async fn teardown(&self, key: &ModuleKey, active: &ActiveModule) -> Result<(), ModuleError> {
        let instance = &active.loaded.instance;
        let mut first_error = None;

        if instance.hooks().contains(ModuleHooks::STOP_BACKGROUND_TASKS) {
            if let Err(e) =
                with_hook_timeout(self.hook_timeout(), instance.stop_background_tasks()).await
            {
                warn!(module = %key, "stop_background_tasks failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        let grace = Duration::from_millis(self.config.lifecycle.task_grace_period_millis);
        let aborted = active.tasks.shutdown(grace).await;
        if aborted > 0 {
            self.sandbox.terminate(&key.to_string()).await;
        }

        if let Err(e) = with_hook_timeout(self.hook_timeout(), instance.cleanup()).await {
            warn!(module = %key, "cleanup failed: {}", e);
            first_error.get_or_insert(e);
        }

        if let Err(e) = active.client.close().await {
            warn!(module = %key, "Closing protocol client failed: {}", e);
        }

        debug!(module = %key, "Instance {} torn down", active.loaded.instance_id);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Per-key operation locks
///
/// An entry lives only while some operation holds or waits on it.
#[derive(Default)]
struct KeyLocks {
    locks: StdMutex<HashMap<ModuleKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn entry(&self, key: &ModuleKey) -> Arc<Mutex<()>> {
        self.map().entry(key.clone()).or_default().clone()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<ModuleKey, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

/// Exclusive access to one key; dropping it releases the key and forgets
/// the lock once nobody else holds or waits on it
struct KeyGuard {
    locks: Arc<KeyLocks>,
    key: ModuleKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut map = self.locks.map();
        self.guard.take();
        // Clones are only handed out under the map lock
        if map.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(&self.key);
        }
    }
}

fn require_status(
    key: &ModuleKey,
    descriptor: &ModuleDescriptor,
    operation: &str,
    expected: ModuleStatus,
) -> Result<(), ModuleError> {
    if descriptor.status == expected {
        Ok(())
    } else {
        Err(ModuleError::lifecycle(key, operation, descriptor.status))
    }
}
