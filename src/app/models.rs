use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const UNKNOWN: &str = "Unknown";

/// One line of `adb devices -l`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
    pub device: Option<String>,
    pub transport_id: Option<String>,
}

impl DeviceSummary {
    /// `device` is the only bridge state that accepts shell commands.
    pub fn is_ready(&self) -> bool {
        self.state == "device"
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Disconnected,
    Unauthorized,
    Authorized,
    Connected,
    Error,
}

impl LifecycleState {
    pub fn label(&self) -> &'static str {
        match self {
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Unauthorized => "unauthorized",
            LifecycleState::Authorized => "authorized",
            LifecycleState::Connected => "connected",
            LifecycleState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Marked connected after a property probe; automation session bound lazily.
    Fast,
    /// Automation session bound and verified at connect time.
    Full,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InterfaceKind {
    WiFi,
    Ethernet,
    Mobile,
    Loopback,
    Tunnel,
    Usb,
    Unknown,
}

impl InterfaceKind {
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("wlan") || lower.contains("wifi") {
            InterfaceKind::WiFi
        } else if lower.contains("eth") {
            InterfaceKind::Ethernet
        } else if lower.contains("rmnet") || lower.contains("ccmni") {
            InterfaceKind::Mobile
        } else if lower.starts_with("lo") {
            InterfaceKind::Loopback
        } else if lower.contains("tun") || lower.contains("tap") {
            InterfaceKind::Tunnel
        } else if lower.contains("usb") || lower.contains("rndis") {
            InterfaceKind::Usb
        } else {
            InterfaceKind::Unknown
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: String,
    pub kind: InterfaceKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInfo {
    pub interfaces: Vec<NetworkInterface>,
    pub primary_ip: Option<String>,
    pub primary_interface: Option<String>,
}

/// Read-only view of a registry entry. The automation session itself never leaves the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub serial: String,
    pub model: String,
    pub platform_version: String,
    pub state: LifecycleState,
    pub transport_state: Option<String>,
    pub connection_mode: Option<ConnectionMode>,
    pub has_automation: bool,
    pub network_info: Option<NetworkInfo>,
    pub aux_status: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchResult<T> {
    pub device_id: String,
    pub success: bool,
    pub payload: Option<T>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub timed_out: bool,
    #[serde(default)]
    pub skipped: bool,
}

impl<T> BatchResult<T> {
    pub fn ok(device_id: impl Into<String>, payload: T) -> Self {
        Self {
            device_id: device_id.into(),
            success: true,
            payload: Some(payload),
            error: None,
            error_code: None,
            timed_out: false,
            skipped: false,
        }
    }

    pub fn failed(
        device_id: impl Into<String>,
        error: impl Into<String>,
        error_code: Option<String>,
        timed_out: bool,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            success: false,
            payload: None,
            error: Some(error.into()),
            error_code,
            timed_out,
            skipped: false,
        }
    }

    /// Nothing to do on this device; counts apart from successes and failures.
    pub fn skipped(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            success: true,
            payload: None,
            error: Some(reason.into()),
            error_code: None,
            timed_out: false,
            skipped: true,
        }
    }
}

/// Every batch API returns results keyed by device id.
pub type BatchResults<T> = BTreeMap<String, BatchResult<T>>;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchCounts {
    pub fn from_results<T>(results: &BatchResults<T>) -> Self {
        let mut counts = BatchCounts::default();
        for result in results.values() {
            if result.skipped {
                counts.skipped += 1;
            } else if result.success {
                counts.succeeded += 1;
            } else {
                counts.failed += 1;
            }
        }
        counts
    }

    pub fn is_partial_failure(&self) -> bool {
        self.failed > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApkInstallErrorCode {
    Success,
    InstallFailedAlreadyExists,
    InstallFailedUpdateIncompatible,
    InstallFailedDuplicatePackage,
    InstallFailedOlderSdk,
    InstallFailedVersionDowngrade,
    InstallFailedInsufficientStorage,
    InstallFailedUserRestricted,
    InstallFailedVerificationFailure,
    InstallParseFailedNotApk,
    InstallParseFailedNoCertificates,
    InstallFailedInvalidApk,
    InstallFailedAborted,
    InstallFailedNoMatchingAbis,
    InstallFailedTestOnly,
    UnknownError,
}

impl ApkInstallErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            ApkInstallErrorCode::Success => "SUCCESS",
            ApkInstallErrorCode::InstallFailedAlreadyExists => "INSTALL_FAILED_ALREADY_EXISTS",
            ApkInstallErrorCode::InstallFailedUpdateIncompatible => {
                "INSTALL_FAILED_UPDATE_INCOMPATIBLE"
            }
            ApkInstallErrorCode::InstallFailedDuplicatePackage => {
                "INSTALL_FAILED_DUPLICATE_PACKAGE"
            }
            ApkInstallErrorCode::InstallFailedOlderSdk => "INSTALL_FAILED_OLDER_SDK",
            ApkInstallErrorCode::InstallFailedVersionDowngrade => {
                "INSTALL_FAILED_VERSION_DOWNGRADE"
            }
            ApkInstallErrorCode::InstallFailedInsufficientStorage => {
                "INSTALL_FAILED_INSUFFICIENT_STORAGE"
            }
            ApkInstallErrorCode::InstallFailedUserRestricted => "INSTALL_FAILED_USER_RESTRICTED",
            ApkInstallErrorCode::InstallFailedVerificationFailure => {
                "INSTALL_FAILED_VERIFICATION_FAILURE"
            }
            ApkInstallErrorCode::InstallParseFailedNotApk => "INSTALL_PARSE_FAILED_NOT_APK",
            ApkInstallErrorCode::InstallParseFailedNoCertificates => {
                "INSTALL_PARSE_FAILED_NO_CERTIFICATES"
            }
            ApkInstallErrorCode::InstallFailedInvalidApk => "INSTALL_FAILED_INVALID_APK",
            ApkInstallErrorCode::InstallFailedAborted => "INSTALL_FAILED_ABORTED",
            ApkInstallErrorCode::InstallFailedNoMatchingAbis => "INSTALL_FAILED_NO_MATCHING_ABIS",
            ApkInstallErrorCode::InstallFailedTestOnly => "INSTALL_FAILED_TEST_ONLY",
            ApkInstallErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ApkInstallErrorCode::Success => "Installation successful",
            ApkInstallErrorCode::InstallFailedAlreadyExists => "App already installed",
            ApkInstallErrorCode::InstallFailedUpdateIncompatible => {
                "Update incompatible with existing installation"
            }
            ApkInstallErrorCode::InstallFailedDuplicatePackage => "Package already exists",
            ApkInstallErrorCode::InstallFailedOlderSdk => "Device Android version too old",
            ApkInstallErrorCode::InstallFailedVersionDowngrade => "Version downgrade",
            ApkInstallErrorCode::InstallFailedInsufficientStorage => "Insufficient storage",
            ApkInstallErrorCode::InstallFailedUserRestricted => "User restricted from installing",
            ApkInstallErrorCode::InstallFailedVerificationFailure => "Package verification failed",
            ApkInstallErrorCode::InstallParseFailedNotApk => "File is not a valid APK",
            ApkInstallErrorCode::InstallParseFailedNoCertificates => "APK is not signed",
            ApkInstallErrorCode::InstallFailedInvalidApk => "APK file is corrupted or invalid",
            ApkInstallErrorCode::InstallFailedAborted => "Installation was aborted",
            ApkInstallErrorCode::InstallFailedNoMatchingAbis => "Incompatible CPU architecture",
            ApkInstallErrorCode::InstallFailedTestOnly => "Test-only APK",
            ApkInstallErrorCode::UnknownError => "Unknown installation error",
        }
    }

    pub fn from_output(output: &str) -> Self {
        if output.trim().is_empty() {
            return ApkInstallErrorCode::UnknownError;
        }
        let upper = output.to_uppercase();
        for code in [
            ApkInstallErrorCode::InstallFailedAlreadyExists,
            ApkInstallErrorCode::InstallFailedUpdateIncompatible,
            ApkInstallErrorCode::InstallFailedDuplicatePackage,
            ApkInstallErrorCode::InstallFailedOlderSdk,
            ApkInstallErrorCode::InstallFailedVersionDowngrade,
            ApkInstallErrorCode::InstallFailedInsufficientStorage,
            ApkInstallErrorCode::InstallFailedUserRestricted,
            ApkInstallErrorCode::InstallFailedVerificationFailure,
            ApkInstallErrorCode::InstallParseFailedNotApk,
            ApkInstallErrorCode::InstallParseFailedNoCertificates,
            ApkInstallErrorCode::InstallFailedInvalidApk,
            ApkInstallErrorCode::InstallFailedAborted,
            ApkInstallErrorCode::InstallFailedNoMatchingAbis,
            ApkInstallErrorCode::InstallFailedTestOnly,
        ] {
            if upper.contains(code.code()) {
                return code;
            }
        }
        if upper.contains("SUCCESS") {
            return ApkInstallErrorCode::Success;
        }
        ApkInstallErrorCode::UnknownError
    }

    /// The package is present afterwards, whether or not this call put it there.
    pub fn leaves_package_installed(&self) -> bool {
        matches!(
            self,
            ApkInstallErrorCode::Success | ApkInstallErrorCode::InstallFailedAlreadyExists
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallOutcome {
    pub error_code: ApkInstallErrorCode,
    pub raw_output: String,
    pub duration_seconds: f64,
}

impl InstallOutcome {
    pub fn success(&self) -> bool {
        self.error_code == ApkInstallErrorCode::Success
    }
}
