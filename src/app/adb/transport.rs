use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::app::adb::parse::{parse_adb_devices, parse_device_serials, parse_getprop_value};
use crate::app::adb::runner::{run_command_cancellable, CommandOutput};
use crate::app::config::TimeoutSettings;
use crate::app::error::AppError;
use crate::app::models::{ApkInstallErrorCode, DeviceSummary, InstallOutcome};
use crate::app::scheduler::{CancelToken, TaskScheduler};

const SERVER_RESTART_PAUSE: Duration = Duration::from_millis(500);
const SERVER_START_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the fleet engine needs from the device bridge.
pub trait DeviceTransport: Send + Sync {
    /// Full `devices -l` listing with authorization state and model hints.
    fn enumerate(&self, trace_id: &str) -> Result<Vec<DeviceSummary>, AppError>;

    /// Serial-only listing, cheaper than `enumerate`.
    fn list_serials(&self, trace_id: &str) -> Result<Vec<String>, AppError>;

    fn shell(
        &self,
        serial: &str,
        command: &str,
        timeout: Duration,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError>;

    /// One path installs with `install`, several with `install-multiple` (base APK first).
    fn install(
        &self,
        serial: &str,
        apk_paths: &[String],
        grant_permissions: bool,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<InstallOutcome, AppError>;

    fn start_server(&self, trace_id: &str) -> Result<(), AppError>;

    fn kill_server(&self, trace_id: &str) -> Result<(), AppError>;

    fn restart_server(&self, trace_id: &str) -> Result<(), AppError> {
        if let Err(err) = self.kill_server(trace_id) {
            debug!(trace_id = %trace_id, error = %err, "kill-server failed; starting anyway");
        }
        std::thread::sleep(SERVER_RESTART_PAUSE);
        self.start_server(trace_id)
    }

    fn getprop(
        &self,
        serial: &str,
        key: &str,
        timeout: Duration,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<Option<String>, AppError> {
        let output = self.shell(serial, &format!("getprop {key}"), timeout, cancel, trace_id)?;
        if !output.success() {
            return Ok(None);
        }
        Ok(parse_getprop_value(&output.stdout))
    }
}

pub struct AdbTransport {
    program: String,
    scheduler: Arc<TaskScheduler>,
    timeouts: TimeoutSettings,
}

impl AdbTransport {
    pub fn new(program: impl Into<String>, scheduler: Arc<TaskScheduler>, timeouts: TimeoutSettings) -> Self {
        Self {
            program: program.into(),
            scheduler,
            timeouts,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Every bridge subprocess passes through the global admission gate.
    fn run(
        &self,
        args: Vec<String>,
        timeout: Duration,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let Some(_permit) = self.scheduler.acquire_global_cancellable(cancel) else {
            return Err(AppError::cancelled("Cancelled while waiting for a bridge slot", trace_id));
        };
        run_command_cancellable(&self.program, &args, timeout, cancel, trace_id)
    }

    fn run_server_command(&self, verb: &str, timeout: Duration, trace_id: &str) -> Result<(), AppError> {
        let output = self.run(vec![verb.to_string()], timeout, &CancelToken::new(), trace_id)?;
        if !output.success() {
            return Err(AppError::transport(
                format!("adb {verb} failed: {}", output.primary_text().trim()),
                trace_id,
            ));
        }
        Ok(())
    }
}

pub fn build_install_args(serial: &str, apk_paths: &[String], grant_permissions: bool) -> Vec<String> {
    let verb = if apk_paths.len() > 1 {
        "install-multiple"
    } else {
        "install"
    };
    let mut args = vec![
        "-s".to_string(),
        serial.to_string(),
        verb.to_string(),
        "-r".to_string(),
    ];
    if grant_permissions {
        args.push("-g".to_string());
    }
    args.extend(apk_paths.iter().cloned());
    args
}

impl DeviceTransport for AdbTransport {
    fn enumerate(&self, trace_id: &str) -> Result<Vec<DeviceSummary>, AppError> {
        let output = self.run(
            vec!["devices".to_string(), "-l".to_string()],
            self.timeouts.enumerate(),
            &CancelToken::new(),
            trace_id,
        )?;
        if !output.success() {
            return Err(AppError::transport(
                format!("adb devices failed: {}", output.primary_text().trim()),
                trace_id,
            ));
        }
        Ok(parse_adb_devices(&output.stdout))
    }

    fn list_serials(&self, trace_id: &str) -> Result<Vec<String>, AppError> {
        let output = self.run(
            vec!["devices".to_string()],
            self.timeouts.enumerate(),
            &CancelToken::new(),
            trace_id,
        )?;
        if !output.success() {
            return Err(AppError::transport(
                format!("adb devices failed: {}", output.primary_text().trim()),
                trace_id,
            ));
        }
        Ok(parse_device_serials(&output.stdout))
    }

    fn shell(
        &self,
        serial: &str,
        command: &str,
        timeout: Duration,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let args = vec![
            "-s".to_string(),
            serial.to_string(),
            "shell".to_string(),
            command.to_string(),
        ];
        self.run(args, timeout, cancel, trace_id)
    }

    fn install(
        &self,
        serial: &str,
        apk_paths: &[String],
        grant_permissions: bool,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<InstallOutcome, AppError> {
        if apk_paths.is_empty() {
            return Err(AppError::validation("No APK files to install", trace_id));
        }
        let started = Instant::now();
        let output = self.run(
            build_install_args(serial, apk_paths, grant_permissions),
            self.timeouts.install(),
            cancel,
            trace_id,
        )?;
        let raw_output = format!("{}\n{}", output.stdout, output.stderr).trim().to_string();
        let mut error_code = ApkInstallErrorCode::from_output(&raw_output);
        if error_code == ApkInstallErrorCode::Success && !output.success() {
            error_code = ApkInstallErrorCode::UnknownError;
        }
        if !error_code.leaves_package_installed() {
            warn!(
                trace_id = %trace_id,
                serial = %serial,
                code = error_code.code(),
                "install failed"
            );
        }
        Ok(InstallOutcome {
            error_code,
            raw_output,
            duration_seconds: started.elapsed().as_secs_f64(),
        })
    }

    fn start_server(&self, trace_id: &str) -> Result<(), AppError> {
        self.run_server_command("start-server", SERVER_START_TIMEOUT, trace_id)
    }

    fn kill_server(&self, trace_id: &str) -> Result<(), AppError> {
        self.run_server_command("kill-server", SERVER_KILL_TIMEOUT, trace_id)
    }
}
