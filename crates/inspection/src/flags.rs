use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

const PAUSE_SLICE: Duration = Duration::from_millis(25);

/// Cooperative stop signals shared by the pipeline loops.
///
/// `running` is per pipeline attempt (cleared by the watchdog or a failing
/// stage); `shutdown` is process wide (Ctrl+C).
#[derive(Clone)]
pub(crate) struct RunFlags {
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl RunFlags {
    pub(crate) fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            shutdown,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.running.load(Ordering::Relaxed) && !self.shutdown.load(Ordering::Relaxed)
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub(crate) fn shutdown(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Sleep for `duration`, waking early when asked to stop. Returns whether
    /// the caller should keep going.
    pub(crate) fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while self.is_active() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(PAUSE_SLICE));
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_returns_early_on_shutdown() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flags = RunFlags::new(shutdown.clone());
        assert!(flags.pause(Duration::from_millis(5)));

        shutdown.store(true, Ordering::SeqCst);
        let started = Instant::now();
        assert!(!flags.pause(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
