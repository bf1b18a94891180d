use std::io::{ErrorKind, Read};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::app::error::AppError;
use crate::app::scheduler::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout when it carries anything, otherwise stderr.
    pub fn primary_text(&self) -> &str {
        if self.stdout.trim().is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    run_command_cancellable(program, args, timeout, &CancelToken::new(), trace_id)
}

/// Runs `program` to completion, killing and reaping it when `timeout` elapses or `cancel`
/// fires. Never leaves the child running on any return path.
pub fn run_command_cancellable(
    program: &str,
    args: &[String],
    timeout: Duration,
    cancel: &CancelToken,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    if cancel.is_cancelled() {
        return Err(AppError::cancelled("Command cancelled before start", trace_id));
    }

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound => {
                AppError::transport(format!("Bridge executable not found: {program}"), trace_id)
            }
            _ => AppError::transport(format!("Failed to spawn command: {err}"), trace_id),
        })?;

    // Drain stdout/stderr in parallel; a chatty child blocks once the pipe buffer fills and
    // would otherwise look like a hang.
    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            kill_and_reap(&mut child);
            return Err(AppError::system("Failed to capture stdout", trace_id));
        }
    };
    let stderr = match child.stderr.take() {
        Some(stderr) => stderr,
        None => {
            kill_and_reap(&mut child);
            return Err(AppError::system("Failed to capture stderr", trace_id));
        }
    };
    let stdout_handle = drain_pipe(stdout);
    let stderr_handle = drain_pipe(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if cancel.is_cancelled() {
                    kill_and_reap(&mut child);
                    return Err(AppError::cancelled("Command cancelled", trace_id));
                }
                if start.elapsed() > timeout {
                    kill_and_reap(&mut child);
                    // Reader threads finish on their own once the pipes close; joining here could
                    // block on a grandchild that inherited the pipe.
                    return Err(AppError::timeout(
                        format!("Command timed out after {}s", timeout.as_secs_f64()),
                        trace_id,
                    ));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                kill_and_reap(&mut child);
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

fn drain_pipe<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> (String, Vec<String>) {
        ("sh".to_string(), vec!["-c".to_string(), script.to_string()])
    }

    #[cfg(unix)]
    #[test]
    fn run_command_with_timeout_does_not_deadlock_on_large_stdout() {
        let (program, args) =
            sh("i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done");

        let output = run_command_with_timeout(&program, &args, Duration::from_secs(10), "trace")
            .expect("expected large-output command to complete without timing out");

        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.len() >= 1_000_000);
    }

    #[cfg(unix)]
    #[test]
    fn captures_stderr_and_exit_code() {
        let (program, args) = sh("echo oops 1>&2; exit 3");
        let output =
            run_command_with_timeout(&program, &args, Duration::from_secs(5), "trace").unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.primary_text().trim(), "oops");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timeout_kills_hung_process_within_grace() {
        let dir = tempfile::TempDir::new().expect("tmp");
        let pid_file = dir.path().join("pid");
        let (program, args) = sh(&format!(
            "echo $$ > {}; exec sleep 30",
            pid_file.display()
        ));

        let started = Instant::now();
        let err = run_command_with_timeout(&program, &args, Duration::from_secs(1), "trace-t")
            .expect_err("expected timeout");
        let elapsed = started.elapsed();

        assert!(err.is_timeout());
        assert_eq!(err.trace_id, "trace-t");
        assert!(elapsed <= Duration::from_secs(2), "took {elapsed:?}");

        let pid = std::fs::read_to_string(&pid_file).expect("pid");
        let proc_path = std::path::PathBuf::from(format!("/proc/{}", pid.trim()));
        assert!(!proc_path.exists(), "process {} still running", pid.trim());
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_stops_running_command() {
        let (program, args) = sh("exec sleep 30");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });

        let started = Instant::now();
        let err = run_command_cancellable(&program, &args, Duration::from_secs(20), &cancel, "t")
            .expect_err("expected cancellation");
        canceller.join().expect("join");

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_binary_is_transport_error() {
        let err = run_command_with_timeout(
            "/this/path/should/not/exist/adb",
            &[],
            Duration::from_secs(1),
            "trace",
        )
        .expect_err("expected spawn failure");
        assert_eq!(err.code, crate::app::error::ERR_TRANSPORT);
    }
}
