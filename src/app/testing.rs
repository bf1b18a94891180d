//! Scripted in-memory transport for registry, orchestrator and batch tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::app::adb::runner::CommandOutput;
use crate::app::adb::transport::DeviceTransport;
use crate::app::error::AppError;
use crate::app::models::{ApkInstallErrorCode, DeviceSummary, InstallOutcome};
use crate::app::scheduler::CancelToken;

type ShellHandler =
    Arc<dyn Fn(&str, &str) -> Option<Result<CommandOutput, AppError>> + Send + Sync>;

pub fn output(stdout: &str, exit_code: i32) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(exit_code),
    }
}

pub fn summary(serial: &str, state: &str, model: Option<&str>) -> DeviceSummary {
    DeviceSummary {
        serial: serial.to_string(),
        state: state.to_string(),
        model: model.map(str::to_string),
        product: None,
        device: None,
        transport_id: None,
    }
}

#[derive(Default)]
pub struct FakeTransport {
    devices: Mutex<Vec<DeviceSummary>>,
    props: Mutex<HashMap<(String, String), String>>,
    packages: Mutex<HashMap<String, Vec<String>>>,
    third_party: Mutex<HashMap<String, Vec<String>>>,
    unreachable: Mutex<HashSet<String>>,
    install_codes: Mutex<HashMap<String, ApkInstallErrorCode>>,
    handler: Mutex<Option<ShellHandler>>,
    shell_delay: Mutex<Duration>,
    enumerate_failure: Mutex<Option<AppError>>,
    pub shell_calls: Mutex<Vec<(String, String)>>,
    pub install_calls: Mutex<Vec<(String, Vec<String>, bool)>>,
    pub server_calls: Mutex<Vec<String>>,
    pub enumerate_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(serial, state)` pairs, no model hints.
    pub fn with_devices(devices: &[(&str, &str)]) -> Self {
        let fake = Self::new();
        fake.set_devices(
            devices
                .iter()
                .map(|(serial, state)| summary(serial, state, None))
                .collect(),
        );
        fake
    }

    pub fn set_devices(&self, devices: Vec<DeviceSummary>) {
        *self.devices.lock().expect("devices") = devices;
    }

    pub fn set_prop(&self, serial: &str, key: &str, value: &str) {
        self.props
            .lock()
            .expect("props")
            .insert((serial.to_string(), key.to_string()), value.to_string());
    }

    pub fn set_packages(&self, serial: &str, packages: &[&str]) {
        self.packages.lock().expect("packages").insert(
            serial.to_string(),
            packages.iter().map(|p| p.to_string()).collect(),
        );
    }

    pub fn set_third_party_packages(&self, serial: &str, packages: &[&str]) {
        self.third_party.lock().expect("third party").insert(
            serial.to_string(),
            packages.iter().map(|p| p.to_string()).collect(),
        );
    }

    /// Shell and install calls against `serial` fail with a transport error.
    pub fn make_unreachable(&self, serial: &str) {
        self.unreachable
            .lock()
            .expect("unreachable")
            .insert(serial.to_string());
    }

    pub fn make_reachable(&self, serial: &str) {
        self.unreachable.lock().expect("unreachable").remove(serial);
    }

    pub fn set_install_code(&self, serial: &str, code: ApkInstallErrorCode) {
        self.install_codes
            .lock()
            .expect("install codes")
            .insert(serial.to_string(), code);
    }

    /// Takes precedence over the built-in responses when it returns `Some`.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &str) -> Option<Result<CommandOutput, AppError>> + Send + Sync + 'static,
    {
        *self.handler.lock().expect("handler") = Some(Arc::new(handler));
    }

    pub fn set_shell_delay(&self, delay: Duration) {
        *self.shell_delay.lock().expect("delay") = delay;
    }

    pub fn fail_enumerate(&self, err: AppError) {
        *self.enumerate_failure.lock().expect("enumerate failure") = Some(err);
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn commands_for(&self, serial: &str) -> Vec<String> {
        self.shell_calls
            .lock()
            .expect("calls")
            .iter()
            .filter(|(s, _)| s == serial)
            .map(|(_, command)| command.clone())
            .collect()
    }

    fn is_unreachable(&self, serial: &str) -> bool {
        self.unreachable.lock().expect("unreachable").contains(serial)
    }

    fn wait_out_delay(&self, cancel: &CancelToken, trace_id: &str) -> Result<(), AppError> {
        let delay = *self.shell_delay.lock().expect("delay");
        let started = Instant::now();
        while started.elapsed() < delay {
            if cancel.is_cancelled() {
                return Err(AppError::cancelled("Command cancelled", trace_id));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    fn builtin_response(&self, serial: &str, command: &str) -> CommandOutput {
        if let Some(key) = command.strip_prefix("getprop ") {
            let value = self
                .props
                .lock()
                .expect("props")
                .get(&(serial.to_string(), key.trim().to_string()))
                .cloned()
                .unwrap_or_default();
            return output(&format!("{value}\n"), 0);
        }
        if let Some(text) = command.strip_prefix("echo ") {
            return output(&format!("{}\n", text.trim()), 0);
        }
        if command.starts_with("pm list packages") {
            let source = if command.contains("-3") {
                &self.third_party
            } else {
                &self.packages
            };
            let listing = source
                .lock()
                .expect("packages")
                .get(serial)
                .map(|packages| {
                    packages
                        .iter()
                        .map(|p| format!("package:{p}\n"))
                        .collect::<String>()
                })
                .unwrap_or_default();
            return output(&listing, 0);
        }
        if command.starts_with("pm uninstall") {
            return output("Success\n", 0);
        }
        output("", 0)
    }
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DeviceTransport for FakeTransport {
    fn enumerate(&self, _trace_id: &str) -> Result<Vec<DeviceSummary>, AppError> {
        self.enumerate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.enumerate_failure.lock().expect("failure").clone() {
            return Err(err);
        }
        Ok(self.devices.lock().expect("devices").clone())
    }

    fn list_serials(&self, trace_id: &str) -> Result<Vec<String>, AppError> {
        Ok(self
            .enumerate(trace_id)?
            .into_iter()
            .map(|device| device.serial)
            .collect())
    }

    fn shell(
        &self,
        serial: &str,
        command: &str,
        _timeout: Duration,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::cancelled("Command cancelled before start", trace_id));
        }
        self.shell_calls
            .lock()
            .expect("calls")
            .push((serial.to_string(), command.to_string()));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight {
            counter: &self.in_flight,
        };

        self.wait_out_delay(cancel, trace_id)?;
        if self.is_unreachable(serial) {
            return Err(AppError::transport(
                format!("device '{serial}' not found"),
                trace_id,
            ));
        }
        let handler = self.handler.lock().expect("handler").clone();
        if let Some(handler) = handler {
            if let Some(result) = handler(serial, command) {
                return result;
            }
        }
        Ok(self.builtin_response(serial, command))
    }

    fn install(
        &self,
        serial: &str,
        apk_paths: &[String],
        grant_permissions: bool,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<InstallOutcome, AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::cancelled("Install cancelled", trace_id));
        }
        self.install_calls.lock().expect("installs").push((
            serial.to_string(),
            apk_paths.to_vec(),
            grant_permissions,
        ));
        if self.is_unreachable(serial) {
            return Err(AppError::transport(
                format!("device '{serial}' not found"),
                trace_id,
            ));
        }
        let error_code = self
            .install_codes
            .lock()
            .expect("install codes")
            .get(serial)
            .cloned()
            .unwrap_or(ApkInstallErrorCode::Success);
        Ok(InstallOutcome {
            raw_output: error_code.code().to_string(),
            error_code,
            duration_seconds: 0.0,
        })
    }

    fn start_server(&self, _trace_id: &str) -> Result<(), AppError> {
        self.server_calls.lock().expect("server").push("start".into());
        Ok(())
    }

    fn kill_server(&self, _trace_id: &str) -> Result<(), AppError> {
        self.server_calls.lock().expect("server").push("kill".into());
        Ok(())
    }
}
