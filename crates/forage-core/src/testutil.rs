//! Test utilities: scripted operations and a recording notification sink.
//!
//! Both use `Arc<Mutex<_>>` for interior mutability so clones share state,
//! allowing assertions on recorded calls after the value was moved into
//! a handler.

use std::future::{Ready, ready};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::AppError;
use crate::notify::{NotificationLevel, NotificationSink};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// ScriptedOperation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Script<T> {
    responses: Vec<Result<T, AppError>>,
    calls: usize,
}

/// Operation that replays a fixed sequence of results.
///
/// Each call returns the next response; once the script runs out the last
/// response repeats forever.
#[derive(Debug)]
pub struct ScriptedOperation<T> {
    script: Arc<Mutex<Script<T>>>,
}

impl<T> Clone for ScriptedOperation<T> {
    fn clone(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
        }
    }
}

impl<T: Clone> ScriptedOperation<T> {
    /// # Panics
    ///
    /// Panics if `responses` is empty.
    pub fn sequence(responses: Vec<Result<T, AppError>>) -> Self {
        assert!(!responses.is_empty(), "script needs at least one response");
        Self {
            script: Arc::new(Mutex::new(Script {
                responses,
                calls: 0,
            })),
        }
    }

    pub fn always(response: Result<T, AppError>) -> Self {
        Self::sequence(vec![response])
    }

    pub fn call(&self) -> Ready<Result<T, AppError>> {
        let mut script = lock(&self.script);
        let index = script.calls.min(script.responses.len() - 1);
        script.calls += 1;
        ready(script.responses[index].clone())
    }

    pub fn calls(&self) -> usize {
        lock(&self.script).calls
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// Notification sink that keeps every notice it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    messages: Arc<Mutex<Vec<(String, NotificationLevel)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, NotificationLevel)> {
        lock(&self.messages).clone()
    }

    /// Whether any recorded message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        lock(&self.messages).iter().any(|(m, _)| m.contains(needle))
    }

    pub fn clear(&self) {
        lock(&self.messages).clear();
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, message: &str, level: NotificationLevel) {
        lock(&self.messages).push((message.to_string(), level));
    }
}
