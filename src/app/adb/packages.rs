use std::time::Duration;

use crate::app::adb::parse::parse_pm_list_packages;
use crate::app::adb::runner::CommandOutput;
use crate::app::adb::transport::DeviceTransport;
use crate::app::error::AppError;
use crate::app::scheduler::CancelToken;

/// `pm` commands scoped to the primary user, as cleanup never touches other profiles.
pub fn uninstall_command(package: &str) -> String {
    format!("pm uninstall --user 0 {package}")
}

pub fn disable_command(package: &str) -> String {
    format!("pm disable-user --user 0 {package}")
}

pub fn pm_succeeded(output: &CommandOutput) -> bool {
    output.stdout.contains("Success") || output.success()
}

pub fn list_packages(
    transport: &dyn DeviceTransport,
    serial: &str,
    third_party_only: bool,
    timeout: Duration,
    cancel: &CancelToken,
    trace_id: &str,
) -> Result<Vec<String>, AppError> {
    let command = if third_party_only {
        "pm list packages -3"
    } else {
        "pm list packages"
    };
    let output = transport.shell(serial, command, timeout, cancel, trace_id)?;
    if !output.success() {
        return Err(AppError::dependency(
            format!(
                "Failed to list packages on {serial}: {}",
                output.primary_text().trim()
            ),
            trace_id,
        ));
    }
    Ok(parse_pm_list_packages(&output.stdout))
}

pub fn uninstall_package(
    transport: &dyn DeviceTransport,
    serial: &str,
    package: &str,
    timeout: Duration,
    cancel: &CancelToken,
    trace_id: &str,
) -> Result<bool, AppError> {
    let output = transport.shell(serial, &uninstall_command(package), timeout, cancel, trace_id)?;
    Ok(pm_succeeded(&output))
}

pub fn disable_package(
    transport: &dyn DeviceTransport,
    serial: &str,
    package: &str,
    timeout: Duration,
    cancel: &CancelToken,
    trace_id: &str,
) -> Result<bool, AppError> {
    let output = transport.shell(serial, &disable_command(package), timeout, cancel, trace_id)?;
    Ok(output.success() && !output.stdout.contains("Error"))
}
