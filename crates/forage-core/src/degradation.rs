//! Graceful degradation bookkeeping.
//!
//! Counts consecutive errors per service. A service that reaches the
//! threshold is marked degraded; while degraded, callers prefer fallbacks.
//! With auto-recovery on, a timer clears the degraded flag after
//! `recovery_check_interval` regardless of the service's actual health.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::notify::{NotificationLevel, Notifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DegradationConfig {
    pub enabled: bool,

    /// Consecutive errors before a service is marked degraded.
    pub threshold: u32,

    pub auto_recover: bool,
    pub recovery_check_interval: Duration,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 3,
            auto_recover: true,
            recovery_check_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
struct DegradationState {
    error_counts: HashMap<String, u32>,
    degraded: BTreeSet<String>,
    timers: HashMap<String, AbortHandle>,
}

impl DegradationState {
    fn cancel_timer(&mut self, service: &str) {
        if let Some(timer) = self.timers.remove(service) {
            timer.abort();
        }
    }
}

fn lock(state: &Mutex<DegradationState>) -> MutexGuard<'_, DegradationState> {
    state.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned degradation mutex");
        poisoned.into_inner()
    })
}

pub struct DegradationTracker {
    config: DegradationConfig,
    state: Arc<Mutex<DegradationState>>,
    notifier: Notifier,
}

impl DegradationTracker {
    pub fn new(config: DegradationConfig, notifier: Notifier) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(DegradationState::default())),
            notifier,
        }
    }

    pub fn config(&self) -> &DegradationConfig {
        &self.config
    }

    /// Count one more consecutive error. Returns `true` if this error
    /// pushed the service into the degraded state.
    pub fn record_error(&self, service: &str) -> bool {
        let mut state = lock(&self.state);
        let count = {
            let count = state.error_counts.entry(service.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if !self.config.enabled || count < self.config.threshold || state.degraded.contains(service)
        {
            return false;
        }

        state.degraded.insert(service.to_string());
        tracing::warn!(service = %service, errors = count, "Service degraded");
        self.arm_recovery_timer(&mut state, service);
        drop(state);

        self.notifier.service(
            &format!("Service '{service}' degraded after {count} consecutive errors"),
            NotificationLevel::Warning,
        );
        true
    }

    /// Clear the error streak. Returns `true` if the service was degraded.
    pub fn record_success(&self, service: &str) -> bool {
        let mut state = lock(&self.state);
        state.error_counts.remove(service);
        let was_degraded = state.degraded.remove(service);
        if was_degraded {
            state.cancel_timer(service);
        }
        drop(state);

        if was_degraded {
            tracing::info!(service = %service, "Service restored");
            self.notifier
                .service(&format!("Service '{service}' restored"), NotificationLevel::Info);
        }
        was_degraded
    }

    /// Forget the error streak and degraded flag of a service.
    pub fn clear(&self, service: &str) {
        let mut state = lock(&self.state);
        state.error_counts.remove(service);
        state.degraded.remove(service);
        state.cancel_timer(service);
    }

    pub fn is_degraded(&self, service: &str) -> bool {
        lock(&self.state).degraded.contains(service)
    }

    pub fn error_count(&self, service: &str) -> u32 {
        lock(&self.state)
            .error_counts
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    /// Degraded services in name order.
    pub fn degraded_services(&self) -> Vec<String> {
        lock(&self.state).degraded.iter().cloned().collect()
    }

    pub fn error_counts(&self) -> HashMap<String, u32> {
        lock(&self.state).error_counts.clone()
    }

    fn arm_recovery_timer(&self, state: &mut DegradationState, service: &str) {
        if !self.config.auto_recover {
            return;
        }
        state.cancel_timer(service);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(service = %service, "No async runtime, auto-recovery disabled");
            return;
        };

        let shared = Arc::downgrade(&self.state);
        let notifier = self.notifier.clone();
        let interval = self.config.recovery_check_interval;
        let name = service.to_string();

        let handle = runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            {
                let mut state = lock(&shared);
                // A re-armed service has a newer timer; leave it in charge.
                let own = tokio::task::try_id();
                if own.is_none() || state.timers.get(&name).map(AbortHandle::id) != own {
                    tracing::debug!(service = %name, "Stale recovery timer, skipping");
                    return;
                }
                state.timers.remove(&name);
                state.error_counts.remove(&name);
                state.degraded.remove(&name);
            }
            tracing::info!(service = %name, "Auto-recovery cleared degraded state");
            notifier.service(
                &format!("Service '{name}' auto-recovered, resuming normal operation"),
                NotificationLevel::Info,
            );
        });

        state.timers.insert(service.to_string(), handle.abort_handle());
    }
}

impl Drop for DegradationTracker {
    fn drop(&mut self) {
        for (_, timer) in lock(&self.state).timers.drain() {
            timer.abort();
        }
    }
}
