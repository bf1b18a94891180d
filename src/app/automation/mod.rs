pub mod ui_dump;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::adb::parse::{parse_getprop_value, parse_wm_size};
use crate::app::adb::runner::CommandOutput;
use crate::app::adb::transport::DeviceTransport;
use crate::app::config::TimeoutSettings;
use crate::app::error::AppError;
use crate::app::scheduler::CancelToken;

use self::ui_dump::{find_by_text, parse_ui_nodes, UiNode};

const UI_DUMP_PATH: &str = "/sdcard/window_dump.xml";
const LAUNCHER_CATEGORY: &str = "android.intent.category.LAUNCHER";
const READY_MARKER: &str = "automation-ready";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutomationInfo {
    pub model: Option<String>,
    pub platform_version: Option<String>,
    pub sdk: Option<u32>,
    pub display_size: Option<(u32, u32)>,
}

/// Per-device UI-automation handle. Owned by the registry while the device is connected.
pub trait AutomationSession: Send + Sync {
    fn serial(&self) -> &str;

    fn shell(&self, command: &str, trace_id: &str) -> Result<CommandOutput, AppError>;

    fn click(&self, x: i32, y: i32, trace_id: &str) -> Result<(), AppError>;

    fn send_text(&self, text: &str, trace_id: &str) -> Result<(), AppError>;

    fn press_key(&self, key: &str, trace_id: &str) -> Result<(), AppError>;

    fn launch(&self, package: &str, activity: Option<&str>, trace_id: &str) -> Result<(), AppError>;

    fn dump_ui(&self, trace_id: &str) -> Result<Vec<UiNode>, AppError>;

    fn exists(&self, text: &str, trace_id: &str) -> Result<bool, AppError> {
        let nodes = self.dump_ui(trace_id)?;
        Ok(find_by_text(&nodes, text).is_some())
    }

    /// Clicks the center of the first node whose text or description matches.
    fn click_text(&self, text: &str, trace_id: &str) -> Result<bool, AppError> {
        let nodes = self.dump_ui(trace_id)?;
        match find_by_text(&nodes, text).and_then(UiNode::center) {
            Some((x, y)) => {
                self.click(x, y, trace_id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reads model, platform and display size. Stops early once `cancel` fires.
    fn info(&self, cancel: &CancelToken, trace_id: &str) -> Result<AutomationInfo, AppError>;
}

pub trait AutomationConnector: Send + Sync {
    fn connect(
        &self,
        serial: &str,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<Arc<dyn AutomationSession>, AppError>;
}

/// `input text` treats `%s` as space and needs shell metacharacters escaped.
pub fn escape_input_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() * 2);
    for ch in text.chars() {
        match ch {
            ' ' => escaped.push_str("%s"),
            '\\' | '\'' | '"' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '$' | '`' | '*' | '?'
            | '#' | '~' | '!' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            _ => escaped.push(ch),
        }
    }
    escaped
}

pub fn launch_command(package: &str, activity: Option<&str>) -> String {
    match activity.filter(|activity| !activity.trim().is_empty()) {
        Some(activity) => format!("am start -n {package}/{activity}"),
        None => format!("monkey -p {package} -c {LAUNCHER_CATEGORY} 1"),
    }
}

/// `am`/`monkey` report most failures on stdout with a zero exit code.
pub fn launch_succeeded(output: &CommandOutput) -> bool {
    if !output.success() {
        return false;
    }
    let text = format!("{}\n{}", output.stdout, output.stderr);
    !(text.contains("Error:")
        || text.contains("No activities found")
        || text.contains("monkey aborted")
        || text.contains("does not exist"))
}

pub struct AdbAutomationSession {
    serial: String,
    transport: Arc<dyn DeviceTransport>,
    timeouts: TimeoutSettings,
}

impl AdbAutomationSession {
    fn run(&self, command: &str, trace_id: &str) -> Result<CommandOutput, AppError> {
        self.run_until(command, &CancelToken::new(), trace_id)
    }

    fn run_until(
        &self,
        command: &str,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        self.transport
            .shell(&self.serial, command, self.timeouts.shell(), cancel, trace_id)
    }

    fn run_checked(&self, command: &str, trace_id: &str) -> Result<CommandOutput, AppError> {
        let output = self.run(command, trace_id)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!(
                    "'{command}' failed on {}: {}",
                    self.serial,
                    output.primary_text().trim()
                ),
                trace_id,
            ));
        }
        Ok(output)
    }

    fn prop(
        &self,
        key: &str,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<Option<String>, AppError> {
        self.transport.getprop(
            &self.serial,
            key,
            self.timeouts.property_probe(),
            cancel,
            trace_id,
        )
    }
}

impl AutomationSession for AdbAutomationSession {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn shell(&self, command: &str, trace_id: &str) -> Result<CommandOutput, AppError> {
        self.run(command, trace_id)
    }

    fn click(&self, x: i32, y: i32, trace_id: &str) -> Result<(), AppError> {
        self.run_checked(&format!("input tap {x} {y}"), trace_id)
            .map(|_| ())
    }

    fn send_text(&self, text: &str, trace_id: &str) -> Result<(), AppError> {
        if text.is_empty() {
            return Ok(());
        }
        self.run_checked(&format!("input text {}", escape_input_text(text)), trace_id)
            .map(|_| ())
    }

    fn press_key(&self, key: &str, trace_id: &str) -> Result<(), AppError> {
        if key.trim().is_empty() {
            return Err(AppError::validation("key is required", trace_id));
        }
        self.run_checked(&format!("input keyevent {}", key.trim()), trace_id)
            .map(|_| ())
    }

    fn launch(&self, package: &str, activity: Option<&str>, trace_id: &str) -> Result<(), AppError> {
        if package.trim().is_empty() {
            return Err(AppError::validation("package is required", trace_id));
        }
        let output = self.transport.shell(
            &self.serial,
            &launch_command(package, activity),
            self.timeouts.launch(),
            &CancelToken::new(),
            trace_id,
        )?;
        if !launch_succeeded(&output) {
            return Err(AppError::dependency(
                format!("Failed to launch {package}: {}", output.primary_text().trim()),
                trace_id,
            ));
        }
        Ok(())
    }

    fn dump_ui(&self, trace_id: &str) -> Result<Vec<UiNode>, AppError> {
        let output = self.run_checked(
            &format!("uiautomator dump {UI_DUMP_PATH} >/dev/null && cat {UI_DUMP_PATH}"),
            trace_id,
        )?;
        Ok(parse_ui_nodes(&output.stdout))
    }

    fn info(&self, cancel: &CancelToken, trace_id: &str) -> Result<AutomationInfo, AppError> {
        let model = self.prop("ro.product.model", cancel, trace_id)?;
        let platform_version = self.prop("ro.build.version.release", cancel, trace_id)?;
        let sdk = self
            .prop("ro.build.version.sdk", cancel, trace_id)?
            .and_then(|value| value.parse::<u32>().ok());
        let display_size = match self.run_until("wm size", cancel, trace_id) {
            Ok(output) if output.success() => parse_wm_size(&output.stdout),
            Ok(_) => None,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                debug!(trace_id = %trace_id, serial = %self.serial, error = %err, "wm size failed");
                None
            }
        };
        Ok(AutomationInfo {
            model,
            platform_version,
            sdk,
            display_size,
        })
    }
}

/// Binds sessions over the bridge shell after a round-trip check.
pub struct AdbAutomationConnector {
    transport: Arc<dyn DeviceTransport>,
    timeouts: TimeoutSettings,
    handshake_timeout: Duration,
}

impl AdbAutomationConnector {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        timeouts: TimeoutSettings,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            timeouts,
            handshake_timeout,
        }
    }
}

impl AutomationConnector for AdbAutomationConnector {
    fn connect(
        &self,
        serial: &str,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<Arc<dyn AutomationSession>, AppError> {
        let output = self.transport.shell(
            serial,
            &format!("echo {READY_MARKER}"),
            self.handshake_timeout,
            cancel,
            trace_id,
        )?;
        let echoed = parse_getprop_value(&output.stdout);
        if !output.success() || echoed.as_deref() != Some(READY_MARKER) {
            return Err(AppError::transport(
                format!("Device {serial} did not answer the automation handshake"),
                trace_id,
            ));
        }
        Ok(Arc::new(AdbAutomationSession {
            serial: serial.to_string(),
            transport: Arc::clone(&self.transport),
            timeouts: self.timeouts.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{output, FakeTransport};

    fn connector(fake: &Arc<FakeTransport>) -> AdbAutomationConnector {
        let transport: Arc<dyn DeviceTransport> = fake.clone();
        AdbAutomationConnector::new(transport, TimeoutSettings::default(), Duration::from_secs(5))
    }

    #[test]
    fn escapes_text_for_input() {
        assert_eq!(escape_input_text("hello world"), "hello%sworld");
        assert_eq!(escape_input_text("a&b"), "a\\&b");
        assert_eq!(escape_input_text("it's"), "it\\'s");
    }

    #[test]
    fn builds_launch_commands() {
        assert_eq!(
            launch_command("com.app", Some(".MainActivity")),
            "am start -n com.app/.MainActivity"
        );
        assert_eq!(
            launch_command("com.app", None),
            "monkey -p com.app -c android.intent.category.LAUNCHER 1"
        );
        assert!(!launch_succeeded(&output(
            "** No activities found to run, monkey aborted.",
            0
        )));
        assert!(launch_succeeded(&output("Events injected: 1", 0)));
    }

    #[test]
    fn connect_requires_handshake() {
        let fake = Arc::new(FakeTransport::with_devices(&[("A", "device")]));
        let session = connector(&fake).connect("A", &CancelToken::new(), "t").expect("session");
        assert_eq!(session.serial(), "A");

        fake.make_unreachable("A");
        let err = connector(&fake)
            .connect("A", &CancelToken::new(), "t")
            .err()
            .expect("handshake fails");
        assert_eq!(err.code, crate::app::error::ERR_TRANSPORT);
    }

    #[test]
    fn handshake_and_info_stop_when_cancelled() {
        let fake = Arc::new(FakeTransport::with_devices(&[("A", "device")]));
        let session = connector(&fake).connect("A", &CancelToken::new(), "t").expect("session");

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = connector(&fake)
            .connect("A", &cancel, "t")
            .err()
            .expect("cancelled handshake");
        assert!(err.is_cancelled());
        let err = session.info(&cancel, "t").expect_err("cancelled info");
        assert!(err.is_cancelled());
    }

    #[test]
    fn info_reads_properties_and_display() {
        let fake = Arc::new(FakeTransport::with_devices(&[("A", "device")]));
        fake.set_prop("A", "ro.product.model", "Pixel 7");
        fake.set_prop("A", "ro.build.version.release", "14");
        fake.set_prop("A", "ro.build.version.sdk", "34");
        fake.set_handler(|_, command| {
            (command == "wm size").then(|| Ok(output("Physical size: 1080x2400\n", 0)))
        });
        let session = connector(&fake).connect("A", &CancelToken::new(), "t").expect("session");
        let info = session.info(&CancelToken::new(), "t").expect("info");
        assert_eq!(info.model.as_deref(), Some("Pixel 7"));
        assert_eq!(info.platform_version.as_deref(), Some("14"));
        assert_eq!(info.sdk, Some(34));
        assert_eq!(info.display_size, Some((1080, 2400)));
    }

    #[test]
    fn click_text_taps_node_center() {
        let fake = Arc::new(FakeTransport::with_devices(&[("A", "device")]));
        fake.set_handler(|_, command| {
            command.starts_with("uiautomator dump").then(|| {
                Ok(output(
                    "<hierarchy><node text=\"Allow\" bounds=\"[0,0][200,100]\" /></hierarchy>",
                    0,
                ))
            })
        });
        let session = connector(&fake).connect("A", &CancelToken::new(), "t").expect("session");
        assert!(session.exists("Allow", "t").expect("exists"));
        assert!(session.click_text("Allow", "t").expect("click"));
        assert!(!session.click_text("Deny", "t").expect("click"));
        assert!(fake.commands_for("A").contains(&"input tap 100 50".to_string()));
    }
}
