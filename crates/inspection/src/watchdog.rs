//! Watchdog detecting stalled capture or dispatch loops.
//!
//! Both loops beat once per iteration. When one falls silent for longer than
//! the stale threshold the watchdog stops the pipeline and the supervisor
//! restarts it.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::error;

use crate::{config::WatchdogSettings, telemetry};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HealthComponent {
    Capture,
    Dispatch,
}

impl HealthComponent {
    pub(crate) fn label(self) -> &'static str {
        match self {
            HealthComponent::Capture => "capture",
            HealthComponent::Dispatch => "dispatch",
        }
    }
}

pub(crate) struct PipelineHealth {
    capture: AtomicU64,
    dispatch: AtomicU64,
    stale_after_ms: u64,
}

impl PipelineHealth {
    /// Heartbeats start in the future so slow device opens are not flagged.
    pub(crate) fn new(settings: &WatchdogSettings) -> Self {
        let grace_deadline = current_millis().saturating_add(millis(settings.startup_grace));
        Self {
            capture: AtomicU64::new(grace_deadline),
            dispatch: AtomicU64::new(grace_deadline),
            stale_after_ms: millis(settings.stale_after),
        }
    }

    pub(crate) fn beat(&self, component: HealthComponent) {
        let now = current_millis();
        match component {
            HealthComponent::Capture => self.capture.store(now, Ordering::Relaxed),
            HealthComponent::Dispatch => self.dispatch.store(now, Ordering::Relaxed),
        }
    }

    pub(crate) fn stale_component(&self, now: u64) -> Option<HealthComponent> {
        if now.saturating_sub(self.capture.load(Ordering::Relaxed)) > self.stale_after_ms {
            return Some(HealthComponent::Capture);
        }
        if now.saturating_sub(self.dispatch.load(Ordering::Relaxed)) > self.stale_after_ms {
            return Some(HealthComponent::Dispatch);
        }
        None
    }
}

pub(crate) struct WatchdogState {
    triggered: AtomicBool,
    reason: Mutex<Option<HealthComponent>>,
}

impl WatchdogState {
    pub(crate) fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    pub(crate) fn arm(&self, component: HealthComponent) {
        if let Ok(mut guard) = self.reason.lock() {
            *guard = Some(component);
        }
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub(crate) fn reason(&self) -> Option<HealthComponent> {
        match self.reason.lock() {
            Ok(guard) => *guard,
            Err(_) => None,
        }
    }
}

pub(crate) fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    state: Arc<WatchdogState>,
    poll_interval: Duration,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("inspect-watchdog", move || {
        while running.load(Ordering::Relaxed) && !shutdown.load(Ordering::Relaxed) {
            thread::sleep(poll_interval);
            if let Some(component) = health.stale_component(current_millis()) {
                error!(
                    "Watchdog detected stalled {} loop; requesting pipeline restart",
                    component.label()
                );
                metrics::counter!("inspect_watchdog_trips_total", "component" => component.label())
                    .increment(1);
                state.arm(component);
                running.store(false, Ordering::SeqCst);
                break;
            }
        }
    })
    .expect("failed to spawn watchdog thread")
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
