use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::warn;

use crate::app::error::AppError;

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Routes Ctrl-C into `cancel`. A second Ctrl-C while work is still unwinding exits with 130.
/// Can only be installed once per process.
pub fn cancel_on_interrupt(cancel: &CancelToken, trace_id: &str) -> Result<(), AppError> {
    let token = cancel.clone();
    let trace = trace_id.to_string();
    ctrlc::set_handler(move || {
        if token.is_cancelled() {
            std::process::exit(130);
        }
        warn!(trace_id = %trace, "interrupt received, cancelling running work");
        token.cancel();
    })
    .map_err(|err| {
        AppError::system(format!("Failed to install interrupt handler: {err}"), trace_id)
    })
}

pub struct GlobalSemaphore {
    limit: usize,
    used: Mutex<usize>,
    cv: Condvar,
}

impl GlobalSemaphore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            used: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_use(&self) -> usize {
        *self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(self: &Arc<Self>) -> GlobalPermit {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        while *used >= self.limit {
            used = self.cv.wait(used).unwrap_or_else(PoisonError::into_inner);
        }
        *used += 1;
        GlobalPermit {
            semaphore: Arc::clone(self),
        }
    }

    /// Like `acquire`, but gives up once `cancel` fires. Returns `None` when cancelled.
    pub fn acquire_cancellable(self: &Arc<Self>, cancel: &CancelToken) -> Option<GlobalPermit> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        while *used >= self.limit {
            if cancel.is_cancelled() {
                return None;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(used, CANCEL_POLL)
                .unwrap_or_else(PoisonError::into_inner);
            used = guard;
        }
        if cancel.is_cancelled() {
            return None;
        }
        *used += 1;
        Some(GlobalPermit {
            semaphore: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        *used = used.saturating_sub(1);
        self.cv.notify_one();
    }
}

pub struct GlobalPermit {
    semaphore: Arc<GlobalSemaphore>,
}

impl Drop for GlobalPermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Bridge-wide admission gate for subprocesses plus one serialization lock per device.
pub struct TaskScheduler {
    global: Arc<GlobalSemaphore>,
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskScheduler {
    pub fn new(global_limit: usize) -> Self {
        Self {
            global: Arc::new(GlobalSemaphore::new(global_limit)),
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn global_limit(&self) -> usize {
        self.global.limit()
    }

    pub fn acquire_global(&self) -> GlobalPermit {
        self.global.acquire()
    }

    pub fn acquire_global_cancellable(&self, cancel: &CancelToken) -> Option<GlobalPermit> {
        self.global.acquire_cancellable(cancel)
    }

    pub fn in_flight(&self) -> usize {
        self.global.in_use()
    }

    pub fn device_lock(&self, serial: &str) -> Arc<Mutex<()>> {
        let mut guard = self
            .device_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .entry(serial.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    #[cfg(unix)]
    #[test]
    fn interrupt_signal_cancels_token() {
        let cancel = CancelToken::new();
        cancel_on_interrupt(&cancel, "t").expect("handler");
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("kill -INT {}", std::process::id()))
            .status()
            .expect("kill");
        assert!(status.success());

        let started = Instant::now();
        while !cancel.is_cancelled() && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(cancel.is_cancelled());
        assert!(cancel_on_interrupt(&CancelToken::new(), "t").is_err());
    }

    #[test]
    fn global_semaphore_limits_concurrency() {
        let scheduler = Arc::new(TaskScheduler::new(2));

        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let scheduler = Arc::clone(&scheduler);
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            handles.push(thread::spawn(move || {
                let _permit = scheduler.acquire_global();
                let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(current, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.join().expect("join");
        }

        assert!(max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn cancellable_acquire_gives_up_when_cancelled() {
        let scheduler = TaskScheduler::new(1);
        let _held = scheduler.acquire_global();
        let cancel = CancelToken::new();

        let waiter_cancel = cancel.clone();
        let started = Instant::now();
        thread::scope(|scope| {
            let waiter =
                scope.spawn(|| scheduler.acquire_global_cancellable(&waiter_cancel).is_some());
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
            assert!(!waiter.join().expect("join"));
        });
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(scheduler.in_flight(), 1);
    }

    #[test]
    fn device_lock_serializes_same_device() {
        let scheduler = Arc::new(TaskScheduler::new(8));
        let serial = "device-1";

        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let scheduler = Arc::clone(&scheduler);
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            let serial = serial.to_string();
            handles.push(thread::spawn(move || {
                let _permit = scheduler.acquire_global();
                let lock = scheduler.device_lock(&serial);
                let _guard = lock.lock().expect("lock");
                let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(current, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.join().expect("join");
        }

        assert_eq!(max_running.load(Ordering::SeqCst), 1);
    }
}
