use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::app::adb::parse::{build_network_info, display_model, parse_ifconfig, parse_ip_addr};
use crate::app::adb::transport::DeviceTransport;
use crate::app::automation::{AutomationConnector, AutomationSession};
use crate::app::batch::run_batch;
use crate::app::cache::{CachedDevice, DeviceCache};
use crate::app::config::TimeoutSettings;
use crate::app::error::AppError;
use crate::app::models::{
    ConnectionMode, DeviceSnapshot, DeviceSummary, LifecycleState, NetworkInfo, UNKNOWN,
};
use crate::app::scheduler::CancelToken;

const LIVENESS_MARKER: &str = "alive";

/// Lifecycle of one device. The automation session only exists inside `Connected`.
#[derive(Clone)]
pub enum DeviceState {
    Disconnected,
    Unauthorized,
    Authorized,
    Connected {
        mode: ConnectionMode,
        session: Option<Arc<dyn AutomationSession>>,
    },
    Error {
        message: String,
    },
}

impl DeviceState {
    pub fn lifecycle(&self) -> LifecycleState {
        match self {
            DeviceState::Disconnected => LifecycleState::Disconnected,
            DeviceState::Unauthorized => LifecycleState::Unauthorized,
            DeviceState::Authorized => LifecycleState::Authorized,
            DeviceState::Connected { .. } => LifecycleState::Connected,
            DeviceState::Error { .. } => LifecycleState::Error,
        }
    }

    fn from_summary(summary: &DeviceSummary) -> Self {
        if summary.is_ready() {
            DeviceState::Authorized
        } else {
            DeviceState::Unauthorized
        }
    }
}

impl std::fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Connected { mode, session } => f
                .debug_struct("Connected")
                .field("mode", mode)
                .field("has_session", &session.is_some())
                .finish(),
            DeviceState::Error { message } => {
                f.debug_struct("Error").field("message", message).finish()
            }
            other => f.write_str(other.lifecycle().label()),
        }
    }
}

#[derive(Debug)]
struct DeviceRecord {
    serial: String,
    model: String,
    platform_version: String,
    state: DeviceState,
    transport_state: Option<String>,
    network_info: Option<NetworkInfo>,
    aux_status: Option<String>,
    last_error: Option<String>,
    missed_scans: u32,
    /// Bumped whenever a scan or teardown moves the record; a connect that started under an
    /// older generation must not commit.
    generation: u64,
    connecting: bool,
}

impl DeviceRecord {
    fn new(serial: &str, model: String, platform_version: String, state: DeviceState) -> Self {
        Self {
            serial: serial.to_string(),
            model,
            platform_version,
            state,
            transport_state: None,
            network_info: None,
            aux_status: None,
            last_error: None,
            missed_scans: 0,
            generation: 0,
            connecting: false,
        }
    }

    fn set_state(&mut self, state: DeviceState) {
        self.state = state;
        self.generation += 1;
    }

    fn snapshot(&self) -> DeviceSnapshot {
        let (connection_mode, has_automation) = match &self.state {
            DeviceState::Connected { mode, session } => (Some(*mode), session.is_some()),
            _ => (None, false),
        };
        DeviceSnapshot {
            serial: self.serial.clone(),
            model: self.model.clone(),
            platform_version: self.platform_version.clone(),
            state: self.state.lifecycle(),
            transport_state: self.transport_state.clone(),
            connection_mode,
            has_automation,
            network_info: self.network_info.clone(),
            aux_status: self.aux_status.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanSummary {
    pub reported: usize,
    pub added: Vec<String>,
    pub reinstated: Vec<String>,
    pub disconnected: Vec<String>,
    /// Connected devices missing from this scan but still inside their grace window.
    pub grace: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LivenessReport {
    pub checked: usize,
    pub alive: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub timeouts: TimeoutSettings,
    pub miss_grace_scans: u32,
    pub liveness_concurrency: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            timeouts: TimeoutSettings::default(),
            miss_grace_scans: 0,
            liveness_concurrency: 50,
        }
    }
}

/// What a successful connection attempt learned, applied under the map lock.
struct ConnectOutcome {
    mode: ConnectionMode,
    session: Option<Arc<dyn AutomationSession>>,
    model: Option<String>,
    platform_version: Option<String>,
}

/// Sole owner of device records. The map lock is only held for bookkeeping, never across a
/// bridge call.
pub struct DeviceRegistry {
    transport: Arc<dyn DeviceTransport>,
    connector: Arc<dyn AutomationConnector>,
    cache: Option<DeviceCache>,
    options: RegistryOptions,
    devices: Mutex<BTreeMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    /// Cached devices start out `Disconnected` with their last known model and version.
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        connector: Arc<dyn AutomationConnector>,
        cache: Option<DeviceCache>,
        options: RegistryOptions,
        trace_id: &str,
    ) -> Self {
        let mut devices = BTreeMap::new();
        if let Some(cache) = cache.as_ref() {
            for (serial, cached) in cache.load(trace_id) {
                let record = DeviceRecord::new(
                    &serial,
                    cached.model,
                    cached.platform_version,
                    DeviceState::Disconnected,
                );
                devices.insert(serial, record);
            }
            debug!(trace_id = %trace_id, count = devices.len(), "loaded device cache");
        }
        Self {
            transport,
            connector,
            cache,
            options,
            devices: Mutex::new(devices),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DeviceRecord>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transport(&self) -> &Arc<dyn DeviceTransport> {
        &self.transport
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn scan(&self, trace_id: &str) -> Result<ScanSummary, AppError> {
        let reported = self.transport.enumerate(trace_id)?;
        Ok(self.apply_scan(&reported, trace_id))
    }

    /// Merges one enumeration into the registry.
    ///
    /// New ids are created in the reported state, `Disconnected` ids are reinstated, and a
    /// `Connected` device is never downgraded while present. Absent ids become `Disconnected`
    /// with their session released, after `miss_grace_scans` consecutive misses for connected
    /// devices.
    pub fn apply_scan(&self, reported: &[DeviceSummary], trace_id: &str) -> ScanSummary {
        let mut summary = ScanSummary {
            reported: reported.len(),
            ..ScanSummary::default()
        };
        let mut devices = self.lock();

        let mut present = std::collections::BTreeSet::new();
        for device in reported {
            if !present.insert(device.serial.as_str()) {
                continue;
            }
            let reported_state = DeviceState::from_summary(device);
            let model_hint = device
                .model
                .as_deref()
                .filter(|hint| !hint.is_empty())
                .map(display_model);

            let Some(record) = devices.get_mut(&device.serial) else {
                let mut record = DeviceRecord::new(
                    &device.serial,
                    model_hint.unwrap_or_else(|| UNKNOWN.to_string()),
                    UNKNOWN.to_string(),
                    reported_state,
                );
                record.transport_state = Some(device.state.clone());
                devices.insert(device.serial.clone(), record);
                summary.added.push(device.serial.clone());
                continue;
            };

            record.missed_scans = 0;
            record.transport_state = Some(device.state.clone());
            if record.model == UNKNOWN {
                if let Some(hint) = model_hint {
                    record.model = hint;
                }
            }
            match record.state.lifecycle() {
                LifecycleState::Connected => {}
                LifecycleState::Disconnected => {
                    record.set_state(reported_state);
                    summary.reinstated.push(device.serial.clone());
                }
                current => {
                    if current != reported_state.lifecycle() {
                        record.set_state(reported_state);
                    }
                }
            }
        }

        for (serial, record) in devices.iter_mut() {
            if present.contains(serial.as_str()) {
                continue;
            }
            match record.state.lifecycle() {
                LifecycleState::Disconnected => {}
                LifecycleState::Connected => {
                    record.missed_scans += 1;
                    if record.missed_scans > self.options.miss_grace_scans {
                        record.set_state(DeviceState::Disconnected);
                        record.transport_state = None;
                        summary.disconnected.push(serial.clone());
                    } else {
                        summary.grace.push(serial.clone());
                    }
                }
                _ => {
                    record.set_state(DeviceState::Disconnected);
                    record.transport_state = None;
                    summary.disconnected.push(serial.clone());
                }
            }
        }
        drop(devices);

        if !summary.disconnected.is_empty() {
            info!(
                trace_id = %trace_id,
                serials = ?summary.disconnected,
                "devices left the bridge"
            );
        }
        debug!(
            trace_id = %trace_id,
            reported = summary.reported,
            added = summary.added.len(),
            reinstated = summary.reinstated.len(),
            disconnected = summary.disconnected.len(),
            "scan merged"
        );
        summary
    }

    /// Connects and persists the cache on success.
    pub fn connect(
        &self,
        serial: &str,
        mode: ConnectionMode,
        trace_id: &str,
    ) -> Result<DeviceSnapshot, AppError> {
        let snapshot = self.connect_device(serial, mode, &CancelToken::new(), trace_id)?;
        if let Err(err) = self.persist_cache(trace_id) {
            warn!(trace_id = %trace_id, error = %err, "failed to persist device cache");
        }
        Ok(snapshot)
    }

    /// One connection attempt without touching the cache. Only `Authorized` devices qualify;
    /// a second attempt on the same id while one is running is a state conflict. Failures
    /// leave the record in `Error`. A cancelled attempt leaves it `Authorized`.
    pub fn connect_device(
        &self,
        serial: &str,
        mode: ConnectionMode,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<DeviceSnapshot, AppError> {
        let generation = {
            let mut devices = self.lock();
            let record = devices.get_mut(serial).ok_or_else(|| {
                AppError::not_authorized(format!("Unknown device: {serial}"), trace_id)
            })?;
            if record.connecting {
                return Err(AppError::state_conflict(
                    format!("A connection attempt for {serial} is already running"),
                    trace_id,
                ));
            }
            if !matches!(record.state, DeviceState::Authorized) {
                return Err(AppError::not_authorized(
                    format!(
                        "Device {serial} is {}, not authorized",
                        record.state.lifecycle().label()
                    ),
                    trace_id,
                ));
            }
            record.connecting = true;
            record.generation
        };

        let attempt = match mode {
            ConnectionMode::Fast => Ok(self.fast_connect(serial, cancel, trace_id)),
            ConnectionMode::Full => self.full_connect(serial, cancel, trace_id),
        };

        let mut devices = self.lock();
        let Some(record) = devices.get_mut(serial) else {
            return Err(AppError::state_conflict(
                format!("Device {serial} vanished during connect"),
                trace_id,
            ));
        };
        record.connecting = false;
        if record.generation != generation {
            return Err(AppError::state_conflict(
                format!(
                    "Device {serial} changed state during connect (now {})",
                    record.state.lifecycle().label()
                ),
                trace_id,
            ));
        }
        if cancel.is_cancelled() {
            debug!(trace_id = %trace_id, serial = %serial, "connect cancelled");
            return Err(match attempt {
                Err(err) if err.is_cancelled() => err,
                _ => AppError::cancelled(format!("Connect to {serial} cancelled"), trace_id),
            });
        }
        match attempt {
            Ok(outcome) => {
                if let Some(model) = outcome.model {
                    record.model = model;
                }
                if let Some(version) = outcome.platform_version {
                    record.platform_version = version;
                }
                record.last_error = None;
                record.set_state(DeviceState::Connected {
                    mode: outcome.mode,
                    session: outcome.session,
                });
                debug!(trace_id = %trace_id, serial = %serial, mode = ?mode, "device connected");
                Ok(record.snapshot())
            }
            Err(err) => {
                warn!(trace_id = %trace_id, serial = %serial, error = %err, "connect failed");
                record.last_error = Some(err.error.clone());
                record.set_state(DeviceState::Error {
                    message: err.error.clone(),
                });
                Err(err)
            }
        }
    }

    /// Marks the device connected after a best-effort model probe; the session is bound later.
    fn fast_connect(&self, serial: &str, cancel: &CancelToken, trace_id: &str) -> ConnectOutcome {
        let model = match self.transport.getprop(
            serial,
            "ro.product.model",
            self.options.timeouts.property_probe(),
            cancel,
            trace_id,
        ) {
            Ok(model) => model,
            Err(err) => {
                debug!(trace_id = %trace_id, serial = %serial, error = %err, "model probe failed");
                None
            }
        };
        ConnectOutcome {
            mode: ConnectionMode::Fast,
            session: None,
            model,
            platform_version: None,
        }
    }

    fn full_connect(
        &self,
        serial: &str,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<ConnectOutcome, AppError> {
        let session = self.connector.connect(serial, cancel, trace_id)?;
        let info = session.info(cancel, trace_id)?;
        Ok(ConnectOutcome {
            mode: ConnectionMode::Full,
            session: Some(session),
            model: info.model,
            platform_version: info.platform_version,
        })
    }

    /// Upgrades a fast-mode connection by binding and verifying the automation session.
    pub fn ensure_full_connection(
        &self,
        serial: &str,
        trace_id: &str,
    ) -> Result<Arc<dyn AutomationSession>, AppError> {
        let generation = {
            let mut devices = self.lock();
            let record = devices.get_mut(serial).ok_or_else(|| {
                AppError::not_authorized(format!("Unknown device: {serial}"), trace_id)
            })?;
            match &record.state {
                DeviceState::Connected {
                    session: Some(session),
                    ..
                } => return Ok(Arc::clone(session)),
                DeviceState::Connected { session: None, .. } => {}
                other => {
                    return Err(AppError::not_authorized(
                        format!("Device {serial} is {}, not connected", other.lifecycle().label()),
                        trace_id,
                    ))
                }
            }
            if record.connecting {
                return Err(AppError::state_conflict(
                    format!("A connection attempt for {serial} is already running"),
                    trace_id,
                ));
            }
            record.connecting = true;
            record.generation
        };

        let attempt = self.full_connect(serial, &CancelToken::new(), trace_id);

        let mut devices = self.lock();
        let Some(record) = devices.get_mut(serial) else {
            return Err(AppError::state_conflict(
                format!("Device {serial} vanished during connect"),
                trace_id,
            ));
        };
        record.connecting = false;
        if record.generation != generation {
            return Err(AppError::state_conflict(
                format!("Device {serial} changed state during upgrade"),
                trace_id,
            ));
        }
        match attempt {
            Ok(outcome) => {
                let Some(session) = outcome.session else {
                    return Err(AppError::system("Automation session missing", trace_id));
                };
                if let Some(model) = outcome.model {
                    record.model = model;
                }
                if let Some(version) = outcome.platform_version {
                    record.platform_version = version;
                }
                record.set_state(DeviceState::Connected {
                    mode: ConnectionMode::Full,
                    session: Some(Arc::clone(&session)),
                });
                Ok(session)
            }
            Err(err) => {
                warn!(trace_id = %trace_id, serial = %serial, error = %err, "session upgrade failed");
                record.last_error = Some(err.error.clone());
                record.set_state(DeviceState::Error {
                    message: err.error.clone(),
                });
                Err(err)
            }
        }
    }

    /// Releases the session of a connected device. Returns whether anything changed.
    pub fn disconnect(&self, serial: &str, trace_id: &str) -> bool {
        let mut devices = self.lock();
        let Some(record) = devices.get_mut(serial) else {
            return false;
        };
        if !matches!(record.state, DeviceState::Connected { .. }) {
            return false;
        }
        record.set_state(DeviceState::Disconnected);
        debug!(trace_id = %trace_id, serial = %serial, "device disconnected");
        true
    }

    /// Releases every session. Records stay so the cache and snapshots remain available.
    pub fn teardown(&self, trace_id: &str) -> usize {
        let mut devices = self.lock();
        let mut released = 0;
        for record in devices.values_mut() {
            if matches!(record.state, DeviceState::Connected { .. }) {
                record.set_state(DeviceState::Disconnected);
                released += 1;
            }
        }
        info!(trace_id = %trace_id, released, "registry torn down");
        released
    }

    pub fn record_error(&self, serial: &str, message: &str) {
        let mut devices = self.lock();
        if let Some(record) = devices.get_mut(serial) {
            record.last_error = Some(message.to_string());
            record.set_state(DeviceState::Error {
                message: message.to_string(),
            });
        }
    }

    pub fn set_aux_status(
        &self,
        serial: &str,
        status: Option<String>,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let mut devices = self.lock();
        let record = devices
            .get_mut(serial)
            .ok_or_else(|| AppError::validation(format!("Unknown device: {serial}"), trace_id))?;
        record.aux_status = status;
        Ok(())
    }

    pub fn session(&self, serial: &str) -> Option<Arc<dyn AutomationSession>> {
        match &self.lock().get(serial)?.state {
            DeviceState::Connected {
                session: Some(session),
                ..
            } => Some(Arc::clone(session)),
            _ => None,
        }
    }

    pub fn snapshot(&self, serial: &str) -> Option<DeviceSnapshot> {
        self.lock().get(serial).map(DeviceRecord::snapshot)
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.lock().values().map(DeviceRecord::snapshot).collect()
    }

    pub fn ids_in_state(&self, state: LifecycleState) -> Vec<String> {
        self.lock()
            .values()
            .filter(|record| record.state.lifecycle() == state)
            .map(|record| record.serial.clone())
            .collect()
    }

    pub fn authorized_ids(&self) -> Vec<String> {
        self.ids_in_state(LifecycleState::Authorized)
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.ids_in_state(LifecycleState::Connected)
    }

    /// Overwrites the cache with every known record.
    pub fn persist_cache(&self, trace_id: &str) -> Result<(), AppError> {
        let Some(cache) = self.cache.as_ref() else {
            return Ok(());
        };
        let entries: BTreeMap<String, CachedDevice> = self
            .lock()
            .values()
            .map(|record| {
                (
                    record.serial.clone(),
                    CachedDevice {
                        model: record.model.clone(),
                        platform_version: record.platform_version.clone(),
                    },
                )
            })
            .collect();
        cache.save(&entries, trace_id)
    }

    /// Reads interface addresses with `ip addr`, falling back to `ifconfig`.
    pub fn refresh_network_info(
        &self,
        serial: &str,
        trace_id: &str,
    ) -> Result<NetworkInfo, AppError> {
        if self.snapshot(serial).is_none() {
            return Err(AppError::validation(
                format!("Unknown device: {serial}"),
                trace_id,
            ));
        }
        let timeout = self.options.timeouts.shell();
        let cancel = CancelToken::new();
        let mut interfaces = match self
            .transport
            .shell(serial, "ip addr show", timeout, &cancel, trace_id)
        {
            Ok(output) if output.success() => parse_ip_addr(&output.stdout),
            Ok(_) => Vec::new(),
            Err(err) if err.is_timeout() => return Err(err),
            Err(err) => {
                debug!(trace_id = %trace_id, serial = %serial, error = %err, "ip addr failed");
                Vec::new()
            }
        };
        if interfaces.is_empty() {
            let output = self
                .transport
                .shell(serial, "ifconfig", timeout, &cancel, trace_id)?;
            interfaces = parse_ifconfig(&output.stdout);
        }
        let network_info = build_network_info(interfaces);
        if let Some(record) = self.lock().get_mut(serial) {
            record.network_info = Some(network_info.clone());
        }
        Ok(network_info)
    }

    /// Caller-initiated revalidation of connected devices with a shell echo. Devices that do
    /// not answer move to `Error` and lose their session.
    pub fn probe_liveness(&self, cancel: &CancelToken, trace_id: &str) -> LivenessReport {
        let connected = self.connected_ids();
        let timeout = self.options.timeouts.property_probe();
        let results = run_batch(
            &connected,
            self.options.liveness_concurrency,
            cancel,
            trace_id,
            |serial, cancel| {
                let output = self.transport.shell(
                    serial,
                    &format!("echo {LIVENESS_MARKER}"),
                    timeout,
                    cancel,
                    trace_id,
                )?;
                if output.stdout.trim() == LIVENESS_MARKER {
                    Ok(())
                } else {
                    Err(AppError::transport(
                        format!("Device {serial} did not answer the liveness probe"),
                        trace_id,
                    ))
                }
            },
        );

        let mut report = LivenessReport {
            checked: connected.len(),
            ..LivenessReport::default()
        };
        let mut devices = self.lock();
        for (serial, result) in results {
            if result.success {
                report.alive.push(serial);
                continue;
            }
            if result.error_code.as_deref() == Some(crate::app::error::ERR_CANCELLED) {
                continue;
            }
            if let Some(record) = devices.get_mut(&serial) {
                if matches!(record.state, DeviceState::Connected { .. }) {
                    let message = result
                        .error
                        .unwrap_or_else(|| "liveness probe failed".to_string());
                    record.last_error = Some(message.clone());
                    record.set_state(DeviceState::Error { message });
                }
            }
            report.failed.push(serial);
        }
        drop(devices);
        if !report.failed.is_empty() {
            warn!(trace_id = %trace_id, failed = ?report.failed, "liveness probe failures");
        }
        report
    }
}
