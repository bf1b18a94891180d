use std::collections::{BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::adb::packages::{list_packages, uninstall_package};
use crate::app::adb::parse::parse_ip_addr;
use crate::app::adb::runner::CommandOutput;
use crate::app::adb::transport::DeviceTransport;
use crate::app::automation::{launch_command, launch_succeeded};
use crate::app::config::TimeoutSettings;
use crate::app::error::{AppError, ERR_CANCELLED, ERR_DEPENDENCY, ERR_SYSTEM};
use crate::app::models::{BatchCounts, BatchResult, BatchResults, InstallOutcome, UNKNOWN};
use crate::app::scheduler::{CancelToken, TaskScheduler};

fn result_from_error<T>(device_id: &str, err: &AppError) -> BatchResult<T> {
    BatchResult::failed(
        device_id,
        err.error.clone(),
        Some(err.code.clone()),
        err.is_timeout(),
    )
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

/// Runs `operation` once per distinct id with at most `limit` in flight.
///
/// Every input id gets an entry. A failing or panicking task is recorded and never stops its
/// siblings. Once `cancel` fires, ids that have not started are recorded as cancelled; the call
/// returns only after running tasks have returned.
pub fn run_batch<T, F>(
    ids: &[String],
    limit: usize,
    cancel: &CancelToken,
    trace_id: &str,
    operation: F,
) -> BatchResults<T>
where
    T: Send,
    F: Fn(&str, &CancelToken) -> Result<T, AppError> + Sync,
{
    let mut seen = BTreeSet::new();
    let queue: VecDeque<String> = ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect();
    let total = queue.len();
    if total == 0 {
        return BatchResults::new();
    }

    let workers = limit.max(1).min(total);
    let queue = Mutex::new(queue);
    let results: Mutex<BatchResults<T>> = Mutex::new(BatchResults::new());
    let started = Instant::now();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let next = queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                let Some(device_id) = next else {
                    break;
                };
                let result = if cancel.is_cancelled() {
                    BatchResult::failed(
                        device_id.as_str(),
                        "Cancelled before start",
                        Some(ERR_CANCELLED.to_string()),
                        false,
                    )
                } else {
                    let attempt =
                        panic::catch_unwind(AssertUnwindSafe(|| operation(device_id.as_str(), cancel)));
                    match attempt {
                        Ok(Ok(payload)) => BatchResult::ok(device_id.as_str(), payload),
                        Ok(Err(err)) => result_from_error(&device_id, &err),
                        Err(payload) => {
                            let message = panic_message(payload.as_ref());
                            warn!(
                                trace_id = %trace_id,
                                serial = %device_id,
                                error = %message,
                                "batch task panicked"
                            );
                            BatchResult::failed(
                                device_id.as_str(),
                                format!("Task panicked: {message}"),
                                Some(ERR_SYSTEM.to_string()),
                                false,
                            )
                        }
                    }
                };
                results
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(device_id, result);
            });
        }
    });

    let results = results.into_inner().unwrap_or_else(PoisonError::into_inner);
    let counts = BatchCounts::from_results(&results);
    info!(
        trace_id = %trace_id,
        total,
        workers,
        succeeded = counts.succeeded,
        failed = counts.failed,
        skipped = counts.skipped,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "batch finished"
    );
    results
}

/// Holds the per-device lock for the duration of `f`.
pub fn with_device_lock<T>(
    scheduler: &TaskScheduler,
    serial: &str,
    trace_id: &str,
    f: impl FnOnce() -> Result<T, AppError>,
) -> Result<T, AppError> {
    let device_lock = scheduler.device_lock(serial);
    let _device_guard = device_lock.lock().map_err(|_| {
        warn!(trace_id = %trace_id, serial = %serial, "device lock poisoned");
        AppError::system("Failed to access the device. Please try again.", trace_id)
    })?;
    f()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceProperties {
    pub model: String,
    pub android_version: String,
    pub sdk: String,
    pub brand: String,
    pub ip: Option<String>,
}

/// Typed batch operations over the bridge. Each task takes the device lock, so two batches
/// never interleave commands on the same device.
pub struct BatchExecutor {
    transport: Arc<dyn DeviceTransport>,
    scheduler: Arc<TaskScheduler>,
    timeouts: TimeoutSettings,
}

impl BatchExecutor {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        scheduler: Arc<TaskScheduler>,
        timeouts: TimeoutSettings,
    ) -> Self {
        Self {
            transport,
            scheduler,
            timeouts,
        }
    }

    pub fn transport(&self) -> &Arc<dyn DeviceTransport> {
        &self.transport
    }

    pub fn timeouts(&self) -> &TimeoutSettings {
        &self.timeouts
    }

    /// Generic fan-out with the per-device lock held around each task.
    pub fn run_locked<T, F>(
        &self,
        ids: &[String],
        limit: usize,
        cancel: &CancelToken,
        trace_id: &str,
        operation: F,
    ) -> BatchResults<T>
    where
        T: Send,
        F: Fn(&str, &CancelToken) -> Result<T, AppError> + Sync,
    {
        run_batch(ids, limit, cancel, trace_id, |serial, cancel| {
            with_device_lock(&self.scheduler, serial, trace_id, || operation(serial, cancel))
        })
    }

    /// A non-zero exit is a failure, but the captured output is kept as the payload.
    pub fn run_command_batch(
        &self,
        ids: &[String],
        command: &str,
        limit: usize,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> BatchResults<CommandOutput> {
        let timeout = self.timeouts.shell();
        let mut results = self.run_locked(ids, limit, cancel, trace_id, |serial, cancel| {
            self.transport.shell(serial, command, timeout, cancel, trace_id)
        });
        for result in results.values_mut() {
            let failed_exit = result
                .payload
                .as_ref()
                .map(|output| !output.success())
                .unwrap_or(false);
            if failed_exit {
                result.success = false;
                result.error = result
                    .payload
                    .as_ref()
                    .map(|output| output.primary_text().trim().to_string());
                result.error_code = Some(ERR_DEPENDENCY.to_string());
            }
        }
        results
    }

    pub fn get_device_properties_batch(
        &self,
        ids: &[String],
        limit: usize,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> BatchResults<DeviceProperties> {
        let timeout = self.timeouts.property_probe();
        self.run_locked(ids, limit, cancel, trace_id, |serial, cancel| {
            let transport = self.transport.as_ref();
            let read = |key: &str| -> String {
                transport
                    .getprop(serial, key, timeout, cancel, trace_id)
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| UNKNOWN.to_string())
            };
            // The model probe doubles as the reachability check.
            let model = transport
                .getprop(serial, "ro.product.model", timeout, cancel, trace_id)?
                .unwrap_or_else(|| UNKNOWN.to_string());
            let android_version = read("ro.build.version.release");
            let sdk = read("ro.build.version.sdk");
            let brand = read("ro.product.brand");
            let ip = transport
                .shell(serial, "ip addr show wlan0", timeout, cancel, trace_id)
                .ok()
                .and_then(|output| parse_ip_addr(&output.stdout).into_iter().next())
                .map(|interface| interface.ip);
            Ok(DeviceProperties {
                model,
                android_version,
                sdk,
                brand,
                ip,
            })
        })
    }

    /// Installs the same artifact set on every device with `-r` and optionally `-g`.
    pub fn install_apk_batch(
        &self,
        ids: &[String],
        apk_paths: &[String],
        grant_permissions: bool,
        limit: usize,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> BatchResults<InstallOutcome> {
        let mut results = self.run_locked(ids, limit, cancel, trace_id, |serial, cancel| {
            self.transport
                .install(serial, apk_paths, grant_permissions, cancel, trace_id)
        });
        for result in results.values_mut() {
            let Some(outcome) = result.payload.as_ref() else {
                continue;
            };
            if !outcome.error_code.leaves_package_installed() {
                result.success = false;
                result.error = Some(outcome.error_code.description().to_string());
                result.error_code = Some(outcome.error_code.code().to_string());
            }
        }
        results
    }

    pub fn launch_app_batch(
        &self,
        ids: &[String],
        package: &str,
        activity: Option<&str>,
        limit: usize,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> BatchResults<()> {
        let command = launch_command(package, activity);
        let timeout = self.timeouts.launch();
        self.run_locked(ids, limit, cancel, trace_id, |serial, cancel| {
            let output = self
                .transport
                .shell(serial, &command, timeout, cancel, trace_id)?;
            if !launch_succeeded(&output) {
                return Err(AppError::dependency(
                    format!("Failed to launch {package}: {}", output.primary_text().trim()),
                    trace_id,
                ));
            }
            Ok(())
        })
    }

    pub fn list_packages_batch(
        &self,
        ids: &[String],
        third_party_only: bool,
        limit: usize,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> BatchResults<Vec<String>> {
        let timeout = self.timeouts.shell();
        self.run_locked(ids, limit, cancel, trace_id, |serial, cancel| {
            list_packages(
                self.transport.as_ref(),
                serial,
                third_party_only,
                timeout,
                cancel,
                trace_id,
            )
        })
    }

    pub fn uninstall_package_batch(
        &self,
        ids: &[String],
        package: &str,
        limit: usize,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> BatchResults<()> {
        let timeout = self.timeouts.uninstall();
        self.run_locked(ids, limit, cancel, trace_id, |serial, cancel| {
            let removed =
                uninstall_package(self.transport.as_ref(), serial, package, timeout, cancel, trace_id)?;
            if removed {
                Ok(())
            } else {
                Err(AppError::dependency(
                    format!("Failed to uninstall {package}"),
                    trace_id,
                ))
            }
        })
    }
}
