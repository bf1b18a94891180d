use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::adb::packages::{disable_package, list_packages, uninstall_package};
use crate::app::adb::transport::DeviceTransport;
use crate::app::batch::BatchExecutor;
use crate::app::error::AppError;
use crate::app::features::policy::PackagePolicy;
use crate::app::models::BatchResults;
use crate::app::scheduler::CancelToken;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    /// Removes only packages the policy flags as bloatware.
    Bloatware,
    /// Removes everything the policy does not allow. Falls back to disabling.
    Allowlist,
    /// Removes every user-installed package outside the keep list.
    ThirdParty,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.removed.len() + self.failed.len()
    }
}

/// Splits the installed packages into removal targets and explicitly kept ones. Packages that
/// are neither are left out of both lists.
pub fn select_targets(
    mode: CleanupMode,
    packages: &[String],
    policy: &dyn PackagePolicy,
) -> (Vec<String>, Vec<String>) {
    let mut targets = Vec::new();
    let mut skipped = Vec::new();
    for package in packages {
        let protected = policy.is_critical(package) || policy.is_allowed(package);
        match mode {
            CleanupMode::Bloatware => {
                if policy.is_bloatware(package) {
                    targets.push(package.clone());
                } else if protected {
                    skipped.push(package.clone());
                }
            }
            CleanupMode::Allowlist | CleanupMode::ThirdParty => {
                if protected {
                    skipped.push(package.clone());
                } else {
                    targets.push(package.clone());
                }
            }
        }
    }
    (targets, skipped)
}

pub fn clean_device(
    transport: &dyn DeviceTransport,
    executor: &BatchExecutor,
    serial: &str,
    mode: CleanupMode,
    policy: &dyn PackagePolicy,
    cancel: &CancelToken,
    trace_id: &str,
) -> Result<CleanupReport, AppError> {
    let timeouts = executor.timeouts();
    let packages = list_packages(
        transport,
        serial,
        mode == CleanupMode::ThirdParty,
        timeouts.shell(),
        cancel,
        trace_id,
    )?;
    let (targets, skipped) = select_targets(mode, &packages, policy);
    debug!(
        trace_id = %trace_id,
        serial = %serial,
        installed = packages.len(),
        targets = targets.len(),
        "cleanup targets selected"
    );

    let mut report = CleanupReport {
        skipped,
        ..CleanupReport::default()
    };
    for package in targets {
        let removed = match uninstall_package(
            transport,
            serial,
            &package,
            timeouts.uninstall(),
            cancel,
            trace_id,
        ) {
            Ok(true) => true,
            Ok(false) if mode == CleanupMode::Allowlist => {
                match disable_package(transport, serial, &package, timeouts.uninstall(), cancel, trace_id) {
                    Ok(disabled) => disabled,
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(_) => false,
                }
            }
            Ok(false) => false,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                debug!(trace_id = %trace_id, serial = %serial, package = %package, error = %err, "uninstall failed");
                false
            }
        };
        if removed {
            report.removed.push(package);
        } else {
            report.failed.push(package);
        }
    }

    info!(
        trace_id = %trace_id,
        serial = %serial,
        removed = report.removed.len(),
        kept = report.skipped.len(),
        failed = report.failed.len(),
        "cleanup finished"
    );
    Ok(report)
}

pub struct BloatwareRemover {
    executor: Arc<BatchExecutor>,
    policy: Arc<dyn PackagePolicy>,
    limit: usize,
}

impl BloatwareRemover {
    pub fn new(executor: Arc<BatchExecutor>, policy: Arc<dyn PackagePolicy>, limit: usize) -> Self {
        Self {
            executor,
            policy,
            limit: limit.max(1),
        }
    }

    pub fn run(
        &self,
        ids: &[String],
        mode: CleanupMode,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> BatchResults<CleanupReport> {
        let transport = Arc::clone(self.executor.transport());
        self.executor
            .run_locked(ids, self.limit, cancel, trace_id, |serial, cancel| {
                clean_device(
                    transport.as_ref(),
                    &self.executor,
                    serial,
                    mode,
                    self.policy.as_ref(),
                    cancel,
                    trace_id,
                )
            })
    }
}
