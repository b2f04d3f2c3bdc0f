//! Single transient status line, last write wins.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use tokio::{runtime::Handle, task::JoinHandle, time::Instant};
use tracing::debug;

use crate::types::{Severity, StatusMessage};

struct ActiveStatus {
    message: StatusMessage,
    expires_at: Instant,
    expiry_task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct NotifierState {
    next_id: u64,
    active: Option<ActiveStatus>,
}

/// Holds at most one [`StatusMessage`]. Each message owns its expiry task, and a newer message
/// aborts the older one's task before scheduling its own.
#[derive(Clone)]
pub struct StatusNotifier {
    ttl: Duration,
    state: Arc<Mutex<NotifierState>>,
}

impl StatusNotifier {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Arc::new(Mutex::new(NotifierState::default())),
        }
    }

    pub fn notify(&self, text: impl Into<String>, severity: Severity) -> StatusMessage {
        let mut state = self.lock();
        state.next_id += 1;
        let message = StatusMessage {
            id: state.next_id,
            text: text.into(),
            severity,
            created_at: Utc::now(),
        };
        if let Some(previous) = state.active.take() {
            if let Some(task) = previous.expiry_task {
                task.abort();
            }
        }
        state.active = Some(ActiveStatus {
            message: message.clone(),
            expires_at: Instant::now() + self.ttl,
            expiry_task: None,
        });
        drop(state);

        debug!(id = message.id, severity = ?severity, text = %message.text, "status");
        self.schedule_expiry(message.id, self.ttl);
        message
    }

    /// Reschedules expiry of the current message to `interval` from now.
    pub fn clear_after(&self, interval: Duration) {
        let id = {
            let mut state = self.lock();
            let Some(active) = state.active.as_mut() else {
                return;
            };
            active.expires_at = Instant::now() + interval;
            if let Some(task) = active.expiry_task.take() {
                task.abort();
            }
            active.message.id
        };
        self.schedule_expiry(id, interval);
    }

    pub fn clear(&self) {
        if let Some(previous) = self.lock().active.take() {
            if let Some(task) = previous.expiry_task {
                task.abort();
            }
        }
    }

    pub fn current(&self) -> Option<StatusMessage> {
        let state = self.lock();
        state
            .active
            .as_ref()
            .filter(|active| Instant::now() < active.expires_at)
            .map(|active| active.message.clone())
    }

    fn schedule_expiry(&self, id: u64, after: Duration) {
        // Outside a runtime, `current` still hides the message once it is past its deadline.
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let state = Arc::clone(&self.state);
        let task = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            let mut guard = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if guard.active.as_ref().map(|active| active.message.id) == Some(id) {
                guard.active = None;
            }
        });

        let mut state = self.lock();
        match state.active.as_mut() {
            Some(active) if active.message.id == id => active.expiry_task = Some(task),
            _ => task.abort(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NotifierState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "tests/notifier_tests.rs"]
mod tests;
