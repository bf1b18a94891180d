use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::batch::run_batch;
use crate::app::error::AppError;
use crate::app::models::{BatchResults, ConnectionMode, DeviceSnapshot, LifecycleState};
use crate::app::plan::{batch_plan_for, partition_waves, ConnectionBatchPlan};
use crate::app::registry::DeviceRegistry;
use crate::app::scheduler::CancelToken;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectProgress {
    pub wave: usize,
    pub waves: usize,
    pub connected: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectSummary {
    pub total: usize,
    pub connected: usize,
    pub failed: Vec<String>,
    pub wave_sizes: Vec<usize>,
    pub plan: Option<ConnectionBatchPlan>,
    pub elapsed_secs: f64,
    pub results: BatchResults<DeviceSnapshot>,
}

impl ConnectSummary {
    fn empty() -> Self {
        Self {
            total: 0,
            connected: 0,
            failed: Vec::new(),
            wave_sizes: Vec::new(),
            plan: None,
            elapsed_secs: 0.0,
            results: BatchResults::new(),
        }
    }
}

/// Drives connection attempts for every authorized device in sequential waves.
pub struct ConnectionOrchestrator {
    registry: Arc<DeviceRegistry>,
    max_concurrent: usize,
}

impl ConnectionOrchestrator {
    pub fn new(registry: Arc<DeviceRegistry>, max_concurrent: usize) -> Self {
        Self {
            registry,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Connects all `Authorized` devices. Waves run one after another; devices inside a wave
    /// connect concurrently. Per-device failures end up in the summary and as `Error` records.
    /// The cache is written once, after the last wave. Cancellation interrupts in-flight
    /// attempts, skips the remaining waves and is returned as an error once they unwound.
    pub fn connect_all<P>(
        &self,
        fast_mode: bool,
        batch_size_override: Option<usize>,
        cancel: &CancelToken,
        trace_id: &str,
        mut on_progress: P,
    ) -> Result<ConnectSummary, AppError>
    where
        P: FnMut(&ConnectProgress),
    {
        let started = Instant::now();
        let has_live_records = self
            .registry
            .snapshots()
            .iter()
            .any(|snapshot| snapshot.state != LifecycleState::Disconnected);
        if !has_live_records {
            self.registry.scan(trace_id)?;
        }

        let authorized = self.registry.authorized_ids();
        if authorized.is_empty() {
            info!(trace_id = %trace_id, "no authorized devices to connect");
            return Ok(ConnectSummary::empty());
        }

        let total = authorized.len();
        let plan = batch_plan_for(total, fast_mode);
        let override_size = batch_size_override.filter(|size| *size > 0);
        let wave_size = override_size.unwrap_or(plan.wave_size);
        let limit = override_size
            .unwrap_or(plan.concurrency_limit)
            .min(self.max_concurrent);
        let mode = if fast_mode {
            ConnectionMode::Fast
        } else {
            ConnectionMode::Full
        };
        let waves = partition_waves(&authorized, wave_size);
        info!(
            trace_id = %trace_id,
            total,
            wave_size,
            waves = waves.len(),
            limit,
            fast_mode,
            "connecting devices"
        );

        let mut summary = ConnectSummary {
            total,
            plan: Some(plan),
            ..ConnectSummary::empty()
        };
        let wave_count = waves.len();
        for (index, wave) in waves.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            summary.wave_sizes.push(wave.len());
            let results = run_batch(&wave, limit, cancel, trace_id, |serial, cancel| {
                self.registry.connect_device(serial, mode, cancel, trace_id)
            });
            for (serial, result) in results {
                if result.success {
                    summary.connected += 1;
                } else {
                    summary.failed.push(serial.clone());
                }
                summary.results.insert(serial, result);
            }
            on_progress(&ConnectProgress {
                wave: index + 1,
                waves: wave_count,
                connected: summary.connected,
                total,
            });
        }

        if summary.connected > 0 {
            if let Err(err) = self.registry.persist_cache(trace_id) {
                warn!(trace_id = %trace_id, error = %err, "failed to persist device cache");
            }
        }
        summary.elapsed_secs = started.elapsed().as_secs_f64();

        if cancel.is_cancelled() {
            warn!(
                trace_id = %trace_id,
                connected = summary.connected,
                total,
                "connection pass cancelled"
            );
            return Err(AppError::cancelled(
                format!(
                    "Connection cancelled after {} of {} devices connected",
                    summary.connected, total
                ),
                trace_id,
            ));
        }

        info!(
            trace_id = %trace_id,
            connected = summary.connected,
            failed = summary.failed.len(),
            total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "connection pass finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::transport::DeviceTransport;
    use crate::app::automation::AdbAutomationConnector;
    use crate::app::cache::DeviceCache;
    use crate::app::config::TimeoutSettings;
    use crate::app::registry::RegistryOptions;
    use crate::app::testing::FakeTransport;
    use std::time::Duration;

    fn fleet(count: usize) -> Arc<FakeTransport> {
        let serials: Vec<String> = (0..count).map(|i| format!("dev-{i:03}")).collect();
        let pairs: Vec<(&str, &str)> = serials.iter().map(|s| (s.as_str(), "device")).collect();
        Arc::new(FakeTransport::with_devices(&pairs))
    }

    fn orchestrator(fake: &Arc<FakeTransport>, cache: Option<DeviceCache>) -> ConnectionOrchestrator {
        let transport: Arc<dyn DeviceTransport> = fake.clone();
        let connector = Arc::new(AdbAutomationConnector::new(
            Arc::clone(&transport),
            TimeoutSettings::default(),
            Duration::from_secs(5),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            transport,
            connector,
            cache,
            RegistryOptions::default(),
            "t",
        ));
        ConnectionOrchestrator::new(registry, 50)
    }

    #[test]
    fn small_fleet_connects_in_one_wave() {
        let fake = fleet(8);
        let orchestrator = orchestrator(&fake, None);
        let mut progress = Vec::new();
        let summary = orchestrator
            .connect_all(true, None, &CancelToken::new(), "t", |p| progress.push(*p))
            .expect("connect");
        assert_eq!(summary.connected, 8);
        assert_eq!(summary.wave_sizes, vec![8]);
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].connected, 8);
        assert_eq!(fake.enumerate_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn forty_devices_run_in_two_waves() {
        let fake = fleet(40);
        let orchestrator = orchestrator(&fake, None);
        let mut progress = Vec::new();
        let summary = orchestrator
            .connect_all(false, None, &CancelToken::new(), "t", |p| progress.push(*p))
            .expect("connect");
        assert_eq!(summary.wave_sizes, vec![25, 15]);
        assert_eq!(summary.connected, 40);
        let cumulative: Vec<usize> = progress.iter().map(|p| p.connected).collect();
        assert_eq!(cumulative, vec![25, 40]);
        assert!(progress.iter().all(|p| p.total == 40 && p.waves == 2));
    }

    #[test]
    fn mid_size_fleet_runs_one_wave_at_fifteen_in_flight() {
        let fake = fleet(20);
        fake.set_shell_delay(Duration::from_millis(20));
        let orchestrator = orchestrator(&fake, None);
        let summary = orchestrator
            .connect_all(true, None, &CancelToken::new(), "t", |_| {})
            .expect("connect");
        assert_eq!(summary.wave_sizes, vec![20]);
        assert_eq!(summary.plan.map(|plan| plan.concurrency_limit), Some(15));
        assert!(fake.peak_concurrency() <= 15);
        assert_eq!(summary.connected, 20);
    }

    #[test]
    fn override_controls_wave_size_and_bounds_concurrency() {
        let fake = fleet(12);
        fake.set_shell_delay(Duration::from_millis(20));
        let orchestrator = orchestrator(&fake, None);
        let summary = orchestrator
            .connect_all(true, Some(5), &CancelToken::new(), "t", |_| {})
            .expect("connect");
        assert_eq!(summary.wave_sizes, vec![5, 5, 2]);
        assert!(fake.peak_concurrency() <= 5);
        assert_eq!(summary.connected, 12);
    }

    #[test]
    fn no_authorized_devices_reports_zero() {
        let fake = Arc::new(FakeTransport::with_devices(&[("A", "unauthorized")]));
        let orchestrator = orchestrator(&fake, None);
        let mut calls = 0;
        let summary = orchestrator
            .connect_all(true, None, &CancelToken::new(), "t", |_| calls += 1)
            .expect("no error");
        assert_eq!(summary.connected, 0);
        assert_eq!(summary.total, 0);
        assert_eq!(calls, 0);
    }

    #[test]
    fn single_failures_do_not_stop_the_pass() {
        let fake = fleet(5);
        fake.make_unreachable("dev-002");
        let orchestrator = orchestrator(&fake, None);
        let summary = orchestrator
            .connect_all(false, None, &CancelToken::new(), "t", |_| {})
            .expect("connect");
        assert_eq!(summary.connected, 4);
        assert_eq!(summary.failed, vec!["dev-002"]);
        let snapshot = orchestrator.registry.snapshot("dev-002").expect("record");
        assert_eq!(snapshot.state, LifecycleState::Error);
    }

    #[test]
    fn cache_written_after_pass() {
        let dir = tempfile::TempDir::new().expect("tmp");
        let path = dir.path().join("device_cache.json");
        let fake = fleet(3);
        fake.set_prop("dev-001", "ro.product.model", "Pixel 7");
        let orchestrator = orchestrator(&fake, Some(DeviceCache::new(&path)));
        orchestrator
            .connect_all(true, None, &CancelToken::new(), "t", |_| {})
            .expect("connect");
        let cached = DeviceCache::new(&path).load("t");
        assert_eq!(cached.len(), 3);
        assert_eq!(cached["dev-001"].model, "Pixel 7");
    }

    #[test]
    fn cancellation_stops_remaining_waves() {
        let fake = fleet(30);
        fake.set_shell_delay(Duration::from_millis(30));
        let orchestrator = orchestrator(&fake, None);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let mut waves_seen = 0;
        let err = orchestrator
            .connect_all(false, Some(10), &cancel, "t", |_| {
                waves_seen += 1;
                trigger.cancel();
            })
            .expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(waves_seen, 1);
        assert_eq!(orchestrator.registry.connected_ids().len(), 10);
    }

    #[test]
    fn cancel_interrupts_a_running_wave() {
        let fake = fleet(5);
        fake.set_shell_delay(Duration::from_secs(2));
        let orchestrator = orchestrator(&fake, None);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let started = std::time::Instant::now();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let err = orchestrator
            .connect_all(false, None, &cancel, "t", |_| {})
            .expect_err("cancelled");
        canceller.join().expect("join");
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert!(orchestrator.registry.connected_ids().is_empty());
        assert_eq!(orchestrator.registry.authorized_ids().len(), 5);
    }
}
