use std::sync::Arc;

use tracing::info;

use crate::app::adb::apk::normalize_apk_path;
use crate::app::adb::locator::{resolve_adb_program, validate_adb_program};
use crate::app::adb::transport::{AdbTransport, DeviceTransport};
use crate::app::automation::{AdbAutomationConnector, AutomationConnector};
use crate::app::batch::BatchExecutor;
use crate::app::cache::DeviceCache;
use crate::app::config::FarmConfig;
use crate::app::error::AppError;
use crate::app::features::bloatware::BloatwareRemover;
use crate::app::features::configurator::DeviceConfigurator;
use crate::app::features::installer::LocalApkInstaller;
use crate::app::features::policy::{PackagePolicy, StaticPackagePolicy};
use crate::app::orchestrator::ConnectionOrchestrator;
use crate::app::registry::{DeviceRegistry, RegistryOptions};
use crate::app::scheduler::TaskScheduler;

/// Application context. Owns the registry and everything that talks to devices.
pub struct AppState {
    pub config: FarmConfig,
    pub scheduler: Arc<TaskScheduler>,
    pub transport: Arc<dyn DeviceTransport>,
    pub registry: Arc<DeviceRegistry>,
    pub executor: Arc<BatchExecutor>,
    pub orchestrator: ConnectionOrchestrator,
    pub policy: Arc<dyn PackagePolicy>,
}

impl AppState {
    /// Resolves and validates the bridge executable, then wires the components over it.
    pub fn new(config: FarmConfig, trace_id: &str) -> Result<Self, AppError> {
        let program = resolve_adb_program(&config.adb.command_path);
        validate_adb_program(&program).map_err(|err| AppError::dependency(err, trace_id))?;
        let scheduler = Arc::new(TaskScheduler::new(
            config.connection.max_concurrent_connections,
        ));
        let transport: Arc<dyn DeviceTransport> = Arc::new(AdbTransport::new(
            program,
            Arc::clone(&scheduler),
            config.timeouts.clone(),
        ));
        Ok(Self::with_transport(config, scheduler, transport, trace_id))
    }

    pub fn with_transport(
        config: FarmConfig,
        scheduler: Arc<TaskScheduler>,
        transport: Arc<dyn DeviceTransport>,
        trace_id: &str,
    ) -> Self {
        let connector: Arc<dyn AutomationConnector> = Arc::new(AdbAutomationConnector::new(
            Arc::clone(&transport),
            config.timeouts.clone(),
            config.connection.connect_timeout(),
        ));
        let cache = config
            .cache
            .enabled
            .then(|| DeviceCache::new(config.cache_path()));
        let registry = Arc::new(DeviceRegistry::new(
            Arc::clone(&transport),
            connector,
            cache,
            RegistryOptions {
                timeouts: config.timeouts.clone(),
                miss_grace_scans: config.connection.miss_grace_scans,
                liveness_concurrency: config.connection.max_concurrent_connections,
            },
            trace_id,
        ));
        let executor = Arc::new(BatchExecutor::new(
            Arc::clone(&transport),
            Arc::clone(&scheduler),
            config.timeouts.clone(),
        ));
        let orchestrator = ConnectionOrchestrator::new(
            Arc::clone(&registry),
            config.connection.max_concurrent_connections,
        );
        let policy: Arc<dyn PackagePolicy> =
            Arc::new(StaticPackagePolicy::new(config.keep_packages.iter().cloned()));
        Self {
            config,
            scheduler,
            transport,
            registry,
            executor,
            orchestrator,
            policy,
        }
    }

    pub fn bloatware_remover(&self) -> BloatwareRemover {
        BloatwareRemover::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.policy),
            self.config.parallel.bloatware_removal,
        )
    }

    pub fn installer(&self) -> LocalApkInstaller {
        LocalApkInstaller::new(
            Arc::clone(&self.executor),
            normalize_apk_path(&self.config.apks_dir),
            self.config.parallel.install,
        )
    }

    pub fn configurator(&self) -> DeviceConfigurator {
        DeviceConfigurator::new(Arc::clone(&self.executor), self.config.parallel.configure)
    }

    /// Releases every automation session held by the registry.
    pub fn teardown(&self, trace_id: &str) {
        let released = self.registry.teardown(trace_id);
        info!(trace_id = %trace_id, released, "application state torn down");
    }
}
