use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::batch::BatchExecutor;
use crate::app::error::AppError;
use crate::app::models::BatchResults;
use crate::app::scheduler::CancelToken;

/// One setting and the commands that make it stick. Every command runs in order; the step
/// counts as applied when at least one of them exits cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigStep {
    pub name: &'static str,
    pub commands: &'static [&'static str],
}

pub const DISABLE_ANIMATIONS: ConfigStep = ConfigStep {
    name: "animations",
    commands: &[
        "settings put global window_animation_scale 0",
        "settings put global transition_animation_scale 0",
        "settings put global animator_duration_scale 0",
    ],
};

pub const DISABLE_BLUETOOTH: ConfigStep = ConfigStep {
    name: "bluetooth",
    commands: &[
        "settings put global bluetooth_on 0",
        "svc bluetooth disable",
        "cmd bluetooth_manager disable",
    ],
};

pub const SCREEN_TIMEOUT: ConfigStep = ConfigStep {
    name: "screen_timeout",
    commands: &[
        "settings put system screen_off_timeout 600000",
        "settings put global stay_on_while_plugged_in 3",
    ],
};

pub const PORTRAIT_LOCK: ConfigStep = ConfigStep {
    name: "portrait_mode",
    commands: &[
        "settings put system accelerometer_rotation 0",
        "settings put system user_rotation 0",
    ],
};

pub const DISABLE_AUTO_ROTATE: ConfigStep = ConfigStep {
    name: "auto_rotate",
    commands: &[
        "settings put system accelerometer_rotation 0",
        "settings put system rotation_lock 1",
    ],
};

pub const DISABLE_CELLULAR_DATA: ConfigStep = ConfigStep {
    name: "cellular",
    commands: &["svc data disable", "settings put global data_roaming 0"],
};

pub const DISABLE_NFC: ConfigStep = ConfigStep {
    name: "nfc",
    commands: &["svc nfc disable", "settings put secure nfc_on 0"],
};

pub const DISABLE_LOCATION: ConfigStep = ConfigStep {
    name: "location",
    commands: &[
        "settings put secure location_mode 0",
        "settings put secure location_providers_allowed ''",
    ],
};

pub const DISABLE_BACKUP: ConfigStep = ConfigStep {
    name: "backup",
    commands: &[
        "settings put secure backup_enabled 0",
        "settings put secure backup_auto_restore 0",
    ],
};

pub const DO_NOT_DISTURB: ConfigStep = ConfigStep {
    name: "do_not_disturb",
    commands: &["cmd notification set_dnd on", "settings put global zen_mode 2"],
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfigPreset {
    /// Display tweaks that speed up UI automation.
    Minimal,
    Standard,
    /// Standard plus radios, location, backup and notifications off.
    Lockdown,
}

impl ConfigPreset {
    pub fn steps(&self) -> Vec<ConfigStep> {
        let mut steps = vec![DISABLE_ANIMATIONS, SCREEN_TIMEOUT];
        if matches!(self, ConfigPreset::Minimal) {
            return steps;
        }
        steps.extend([
            PORTRAIT_LOCK,
            DISABLE_AUTO_ROTATE,
            DISABLE_BLUETOOTH,
            DISABLE_CELLULAR_DATA,
        ]);
        if matches!(self, ConfigPreset::Lockdown) {
            steps.extend([DISABLE_NFC, DISABLE_LOCATION, DISABLE_BACKUP, DO_NOT_DISTURB]);
        }
        steps
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigureReport {
    pub steps: BTreeMap<String, bool>,
}

impl ConfigureReport {
    pub fn applied(&self) -> usize {
        self.steps.values().filter(|ok| **ok).count()
    }
}

pub struct DeviceConfigurator {
    executor: Arc<BatchExecutor>,
    limit: usize,
}

impl DeviceConfigurator {
    pub fn new(executor: Arc<BatchExecutor>, limit: usize) -> Self {
        Self {
            executor,
            limit: limit.max(1),
        }
    }

    fn apply_step(
        &self,
        serial: &str,
        step: &ConfigStep,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        let timeout = self.executor.timeouts().shell();
        let mut applied = false;
        for command in step.commands {
            match self
                .executor
                .transport()
                .shell(serial, command, timeout, cancel, trace_id)
            {
                Ok(output) if output.success() => applied = true,
                Ok(output) => {
                    debug!(trace_id = %trace_id, serial = %serial, command, output = %output.primary_text().trim(), "config command rejected");
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    debug!(trace_id = %trace_id, serial = %serial, command, error = %err, "config command failed");
                }
            }
        }
        Ok(applied)
    }

    /// A device fails only when no step could be applied at all.
    pub fn apply(
        &self,
        ids: &[String],
        preset: ConfigPreset,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> BatchResults<ConfigureReport> {
        let steps = preset.steps();
        self.executor
            .run_locked(ids, self.limit, cancel, trace_id, |serial, cancel| {
                let mut report = ConfigureReport::default();
                for step in &steps {
                    let applied = self.apply_step(serial, step, cancel, trace_id)?;
                    report.steps.insert(step.name.to_string(), applied);
                }
                info!(
                    trace_id = %trace_id,
                    serial = %serial,
                    applied = report.applied(),
                    total = steps.len(),
                    "device configured"
                );
                if report.applied() == 0 {
                    return Err(AppError::dependency(
                        format!("No settings could be applied on {serial}"),
                        trace_id,
                    ));
                }
                Ok(report)
            })
    }
}
