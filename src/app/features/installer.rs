use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::app::adb::apk::{probe_package_name, resolve_app_artifact, scan_apk_folders};
use crate::app::adb::packages::list_packages;
use crate::app::batch::BatchExecutor;
use crate::app::error::AppError;
use crate::app::models::{ApkInstallErrorCode, BatchCounts, BatchResult, BatchResults, InstallOutcome};
use crate::app::scheduler::CancelToken;

const ALREADY_INSTALLED: &str = "App already installed";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallReport {
    pub app_name: String,
    pub package: Option<String>,
    pub results: BatchResults<InstallOutcome>,
    pub counts: BatchCounts,
}

/// Installs apps from a local folder tree, one sub-folder (or bundle) per app.
pub struct LocalApkInstaller {
    executor: Arc<BatchExecutor>,
    apks_dir: PathBuf,
    limit: usize,
}

impl LocalApkInstaller {
    pub fn new(executor: Arc<BatchExecutor>, apks_dir: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            executor,
            apks_dir: apks_dir.into(),
            limit: limit.max(1),
        }
    }

    pub fn available_apps(&self) -> BTreeMap<String, Vec<String>> {
        scan_apk_folders(&self.apks_dir)
    }

    /// `package` skips the badging probe. Without a package name the installed check is
    /// skipped and every device gets the install.
    pub fn install_app(
        &self,
        app: &str,
        package: Option<&str>,
        ids: &[String],
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<InstallReport, AppError> {
        let artifact = resolve_app_artifact(&self.apks_dir, app, trace_id)?;
        let package = package
            .map(str::to_string)
            .or_else(|| artifact.base_apk().and_then(|base| probe_package_name(base, trace_id)));
        info!(
            trace_id = %trace_id,
            app = %artifact.app_name,
            package = package.as_deref().unwrap_or("unknown"),
            files = artifact.apk_paths.len(),
            devices = ids.len(),
            "installing app"
        );

        let transport = Arc::clone(self.executor.transport());
        let list_timeout = self.executor.timeouts().shell();
        let raw = self
            .executor
            .run_locked(ids, self.limit, cancel, trace_id, |serial, cancel| {
                if let Some(package) = package.as_deref() {
                    let installed =
                        list_packages(transport.as_ref(), serial, false, list_timeout, cancel, trace_id)?;
                    if installed.iter().any(|candidate| candidate == package) {
                        return Ok(None);
                    }
                }
                transport
                    .install(serial, &artifact.apk_paths, true, cancel, trace_id)
                    .map(Some)
            });

        let results: BatchResults<InstallOutcome> = raw
            .into_iter()
            .map(|(serial, result)| {
                let converted = classify(&serial, result);
                (serial, converted)
            })
            .collect();
        let counts = BatchCounts::from_results(&results);
        info!(
            trace_id = %trace_id,
            app = %artifact.app_name,
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            "install finished"
        );
        Ok(InstallReport {
            app_name: artifact.app_name.clone(),
            package,
            results,
            counts,
        })
    }
}

fn classify(serial: &str, result: BatchResult<Option<InstallOutcome>>) -> BatchResult<InstallOutcome> {
    if !result.success {
        return BatchResult {
            device_id: result.device_id,
            success: false,
            payload: None,
            error: result.error,
            error_code: result.error_code,
            timed_out: result.timed_out,
            skipped: false,
        };
    }
    match result.payload.flatten() {
        None => BatchResult::skipped(serial, ALREADY_INSTALLED),
        Some(outcome) if outcome.error_code == ApkInstallErrorCode::InstallFailedAlreadyExists => {
            BatchResult::skipped(serial, ALREADY_INSTALLED)
        }
        Some(outcome) if outcome.success() => BatchResult::ok(serial, outcome),
        Some(outcome) => BatchResult {
            device_id: serial.to_string(),
            success: false,
            error: Some(outcome.error_code.description().to_string()),
            error_code: Some(outcome.error_code.code().to_string()),
            timed_out: false,
            skipped: false,
            payload: Some(outcome),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::transport::DeviceTransport;
    use crate::app::config::TimeoutSettings;
    use crate::app::scheduler::TaskScheduler;
    use crate::app::testing::FakeTransport;
    use std::fs;
    use tempfile::TempDir;

    fn setup(fake: &Arc<FakeTransport>) -> (TempDir, LocalApkInstaller) {
        let tmp = TempDir::new().expect("tmp");
        let app = tmp.path().join("superproxy");
        fs::create_dir(&app).expect("app dir");
        fs::write(app.join("base.apk"), b"base").expect("base");
        fs::write(app.join("split_arm64.apk"), b"split").expect("split");
        let transport: Arc<dyn DeviceTransport> = fake.clone();
        let executor = Arc::new(BatchExecutor::new(
            transport,
            Arc::new(TaskScheduler::new(8)),
            TimeoutSettings::default(),
        ));
        let installer = LocalApkInstaller::new(executor, tmp.path(), 4);
        (tmp, installer)
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn skips_devices_with_package_and_installs_the_rest() {
        let fake = Arc::new(FakeTransport::with_devices(&[("A", "device"), ("B", "device"), ("C", "device")]));
        fake.set_packages("A", &["com.scheler.superproxy"]);
        fake.set_install_code("C", ApkInstallErrorCode::InstallFailedInsufficientStorage);
        let (_tmp, installer) = setup(&fake);

        let report = installer
            .install_app(
                "superproxy",
                Some("com.scheler.superproxy"),
                &ids(&["A", "B", "C"]),
                &CancelToken::new(),
                "t",
            )
            .expect("install");

        assert_eq!(
            report.counts,
            BatchCounts {
                succeeded: 1,
                failed: 1,
                skipped: 1
            }
        );
        assert!(report.results["A"].skipped);
        assert!(report.results["B"].success);
        assert_eq!(
            report.results["C"].error_code.as_deref(),
            Some("INSTALL_FAILED_INSUFFICIENT_STORAGE")
        );

        let installs = fake.install_calls.lock().expect("installs").clone();
        assert_eq!(installs.len(), 2);
        let (_, paths, grant) = &installs[0];
        assert!(paths[0].ends_with("base.apk"));
        assert_eq!(paths.len(), 2);
        assert!(*grant);
    }

    #[test]
    fn missing_app_is_a_validation_error() {
        let fake = Arc::new(FakeTransport::with_devices(&[("A", "device")]));
        let (_tmp, installer) = setup(&fake);
        let err = installer
            .install_app("nothing", None, &ids(&["A"]), &CancelToken::new(), "t")
            .err()
            .expect("missing");
        assert_eq!(err.code, crate::app::error::ERR_VALIDATION);
        assert!(installer.available_apps().contains_key("superproxy"));
    }

    #[test]
    fn already_exists_output_counts_as_skipped() {
        let fake = Arc::new(FakeTransport::with_devices(&[("A", "device")]));
        fake.set_install_code("A", ApkInstallErrorCode::InstallFailedAlreadyExists);
        let (_tmp, installer) = setup(&fake);
        let report = installer
            .install_app("superproxy", Some("com.scheler.superproxy"), &ids(&["A"]), &CancelToken::new(), "t")
            .expect("install");
        assert_eq!(report.counts.skipped, 1);
    }
}
