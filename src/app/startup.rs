use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::adb::transport::DeviceTransport;
use crate::app::batch::run_batch;
use crate::app::error::AppError;
use crate::app::plan::{batch_plan_for, estimate_connection_time, ConnectionBatchPlan};
use crate::app::scheduler::CancelToken;

const AUTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const AUTH_PROBE_MARKER: &str = "test";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartupPlan {
    pub device_count: usize,
    pub plan: ConnectionBatchPlan,
    pub estimated_secs: f64,
    pub prewarmed: bool,
}

/// Restarts the bridge daemon and waits for it to answer a listing. Best effort.
pub fn prewarm_transport(transport: &dyn DeviceTransport, trace_id: &str) -> bool {
    let started = Instant::now();
    if let Err(err) = transport.restart_server(trace_id) {
        warn!(trace_id = %trace_id, error = %err, "bridge restart failed");
        return false;
    }
    match transport.list_serials(trace_id) {
        Ok(serials) => {
            info!(
                trace_id = %trace_id,
                devices = serials.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "bridge prewarmed"
            );
            true
        }
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err, "bridge did not answer after restart");
            false
        }
    }
}

/// Serial-only listing used to size the fleet before the full scan.
pub fn parallel_scan(transport: &dyn DeviceTransport, trace_id: &str) -> Result<Vec<String>, AppError> {
    transport.list_serials(trace_id)
}

/// The planner always recommends fast mode; waves follow the shared plan.
pub fn plan_for(device_count: usize) -> ConnectionBatchPlan {
    batch_plan_for(device_count, true)
}

pub fn prepare_startup(
    transport: &dyn DeviceTransport,
    prewarm: bool,
    trace_id: &str,
) -> Result<StartupPlan, AppError> {
    let prewarmed = prewarm && prewarm_transport(transport, trace_id);
    let serials = parallel_scan(transport, trace_id)?;
    let plan = plan_for(serials.len());
    let estimated_secs = estimate_connection_time(serials.len(), plan.fast_mode);
    info!(
        trace_id = %trace_id,
        devices = serials.len(),
        batch_size = plan.batch_size,
        wave_size = plan.wave_size,
        estimated_secs,
        "startup plan ready"
    );
    Ok(StartupPlan {
        device_count: serials.len(),
        plan,
        estimated_secs,
        prewarmed,
    })
}

/// Probes each id with a shell echo and returns those that answered, i.e. whose
/// authorization has been granted since the last scan.
pub fn check_authorized(
    transport: &dyn DeviceTransport,
    ids: &[String],
    limit: usize,
    cancel: &CancelToken,
    trace_id: &str,
) -> Vec<String> {
    let results = run_batch(ids, limit, cancel, trace_id, |serial, cancel| {
        let output = transport.shell(
            serial,
            &format!("echo {AUTH_PROBE_MARKER}"),
            AUTH_PROBE_TIMEOUT,
            cancel,
            trace_id,
        )?;
        Ok(output.success() && output.stdout.contains(AUTH_PROBE_MARKER))
    });
    results
        .into_iter()
        .filter(|(_, result)| result.payload == Some(true))
        .map(|(serial, _)| serial)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::FakeTransport;

    #[test]
    fn prewarm_restarts_then_lists() {
        let fake = FakeTransport::with_devices(&[("A", "device")]);
        assert!(prewarm_transport(&fake, "t"));
        assert_eq!(*fake.server_calls.lock().expect("calls"), vec!["kill", "start"]);
    }

    #[test]
    fn prepare_sizes_plan_from_scan() {
        let serials: Vec<String> = (0..40).map(|i| format!("dev-{i}")).collect();
        let pairs: Vec<(&str, &str)> = serials.iter().map(|s| (s.as_str(), "device")).collect();
        let fake = FakeTransport::with_devices(&pairs);
        let startup = prepare_startup(&fake, false, "t").expect("plan");
        assert_eq!(startup.device_count, 40);
        assert_eq!(startup.plan.batch_size, 25);
        assert!(startup.plan.fast_mode);
        assert!(startup.plan.use_cache);
        assert!(!startup.prewarmed);
        assert!(fake.server_calls.lock().expect("calls").is_empty());
    }

    #[test]
    fn planner_thresholds() {
        assert_eq!(plan_for(8).batch_size, 10);
        assert_eq!(plan_for(20).concurrency_limit, 15);
        assert_eq!(plan_for(40).batch_size, 25);
        assert_eq!(plan_for(75).batch_size, 50);
        assert_eq!(plan_for(150).batch_size, 75);
    }

    #[test]
    fn check_authorized_reports_responsive_devices() {
        let fake = FakeTransport::with_devices(&[("A", "unauthorized"), ("B", "unauthorized")]);
        fake.make_unreachable("B");
        let ids = vec!["A".to_string(), "B".to_string()];
        let authorized = check_authorized(&fake, &ids, 4, &CancelToken::new(), "t");
        assert_eq!(authorized, vec!["A"]);
    }
}
