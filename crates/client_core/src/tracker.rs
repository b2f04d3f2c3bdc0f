//! Follows a submitted operation until the network reports a terminal outcome.
//!
//! Whether the network integration polls or pushes is hidden behind
//! [`ConfirmationInterface`]: [`PollingConfirmation`] asks an [`OutcomeProbe`] on an interval,
//! [`OutcomeFeed`] is fed outcomes as they are observed. Interface faults are never mistaken for
//! an observed failure; the tracker keeps waiting and retries.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::OperationHandle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{
    types::{Outcome, TerminalStatus},
    ConfirmationInterface,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Pending,
    Resolved(Outcome),
}

/// One non-blocking look at an operation's status.
#[async_trait]
pub trait OutcomeProbe: Send + Sync {
    async fn probe(&self, handle: &OperationHandle) -> Result<ProbeStatus>;
}

#[async_trait]
impl<T> OutcomeProbe for Arc<T>
where
    T: OutcomeProbe + ?Sized,
{
    async fn probe(&self, handle: &OperationHandle) -> Result<ProbeStatus> {
        (**self).probe(handle).await
    }
}

/// Shortest wait between two polls or retries.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Handles remembered for duplicate suppression.
const DELIVERED_CAPACITY: usize = 64;

/// Turns a probe into a single-resolution wait. No deadline: the network has none.
pub struct PollingConfirmation<P> {
    probe: P,
    interval: Duration,
}

impl<P: OutcomeProbe> PollingConfirmation<P> {
    pub fn new(probe: P, interval: Duration) -> Self {
        Self {
            probe,
            interval: interval.max(MIN_POLL_INTERVAL),
        }
    }
}

#[async_trait]
impl<P: OutcomeProbe> ConfirmationInterface for PollingConfirmation<P> {
    async fn await_outcome(&self, handle: &OperationHandle) -> Result<Outcome> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.probe.probe(handle).await {
                Ok(ProbeStatus::Pending) => debug!(%handle, "still pending"),
                Ok(ProbeStatus::Resolved(outcome)) => return Ok(outcome),
                Err(err) => warn!(%handle, error = %err, "outcome probe failed; polling again"),
            }
        }
    }
}

/// Push-side source: outcomes are published as they are observed. Published outcomes are kept so
/// a waiter that subscribes late still resolves.
pub struct OutcomeFeed {
    resolved: Mutex<HashMap<OperationHandle, Outcome>>,
    updates: broadcast::Sender<(OperationHandle, Outcome)>,
}

impl Default for OutcomeFeed {
    fn default() -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            resolved: Mutex::new(HashMap::new()),
            updates,
        }
    }
}

impl OutcomeFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, handle: OperationHandle, outcome: Outcome) {
        self.resolved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(handle.clone(), outcome.clone());
        let _ = self.updates.send((handle, outcome));
    }

    fn lookup(&self, handle: &OperationHandle) -> Option<Outcome> {
        self.resolved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(handle)
            .cloned()
    }
}

#[async_trait]
impl ConfirmationInterface for OutcomeFeed {
    async fn await_outcome(&self, handle: &OperationHandle) -> Result<Outcome> {
        let mut updates = self.updates.subscribe();
        if let Some(outcome) = self.lookup(handle) {
            return Ok(outcome);
        }
        loop {
            match updates.recv().await {
                Ok((resolved, outcome)) if &resolved == handle => return Ok(outcome),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%handle, skipped, "outcome feed lagged");
                    if let Some(outcome) = self.lookup(handle) {
                        return Ok(outcome);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow!("outcome feed closed"));
                }
            }
        }
    }
}

/// Derived view of one tracked handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingStatus {
    Pending,
    Confirmed { detail: Option<String> },
    Failed { reason: Option<String> },
}

impl TrackingStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TrackingStatus::Pending)
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            TrackingStatus::Pending => None,
            TrackingStatus::Confirmed { detail } => Some(Outcome {
                status: TerminalStatus::Confirmed,
                detail: detail.clone(),
            }),
            TrackingStatus::Failed { reason } => Some(Outcome {
                status: TerminalStatus::Failed,
                detail: reason.clone(),
            }),
        }
    }
}

impl From<Outcome> for TrackingStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome.status {
            TerminalStatus::Confirmed => TrackingStatus::Confirmed {
                detail: outcome.detail,
            },
            TerminalStatus::Failed => TrackingStatus::Failed {
                reason: outcome.detail,
            },
        }
    }
}

/// Most recently delivered handles, oldest evicted first.
#[derive(Default)]
struct DeliveredLog {
    seen: HashSet<OperationHandle>,
    order: VecDeque<OperationHandle>,
}

impl DeliveredLog {
    fn insert(&mut self, handle: &OperationHandle) -> bool {
        if !self.seen.insert(handle.clone()) {
            return false;
        }
        self.order.push_back(handle.clone());
        if self.order.len() > DELIVERED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

pub struct ConfirmationTracker {
    source: Arc<dyn ConfirmationInterface>,
    retry_interval: Duration,
    delivered: Mutex<DeliveredLog>,
}

impl ConfirmationTracker {
    pub fn new(source: Arc<dyn ConfirmationInterface>, retry_interval: Duration) -> Self {
        Self {
            source,
            retry_interval: retry_interval.max(MIN_POLL_INTERVAL),
            delivered: Mutex::new(DeliveredLog::default()),
        }
    }

    /// Starts following `handle`. The receiver reads `Pending` until exactly one terminal
    /// status is published. Dropping every receiver stops the wait.
    pub fn track(self: &Arc<Self>, handle: OperationHandle) -> watch::Receiver<TrackingStatus> {
        let (tx, rx) = watch::channel(TrackingStatus::Pending);
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                outcome = tracker.await_terminal(&handle) => {
                    let _ = tx.send(TrackingStatus::from(outcome));
                }
                _ = tx.closed() => debug!(%handle, "no longer followed; tracking stopped"),
            }
        });
        rx
    }

    /// Waits for the terminal outcome of `handle`, retrying interface faults indefinitely.
    pub async fn await_terminal(&self, handle: &OperationHandle) -> Outcome {
        loop {
            match self.source.await_outcome(handle).await {
                Ok(outcome) => {
                    info!(%handle, status = ?outcome.status, detail = ?outcome.detail, "outcome observed");
                    return outcome;
                }
                Err(err) => {
                    warn!(%handle, error = %err, "confirmation source failed; retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }

    /// Returns `true` the first time a terminal outcome is handed over for `handle`.
    pub fn mark_delivered(&self, handle: &OperationHandle) -> bool {
        let first = self
            .delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(handle);
        if !first {
            debug!(%handle, "duplicate terminal outcome ignored");
        }
        first
    }
}

#[cfg(test)]
#[path = "tests/tracker_tests.rs"]
mod tests;
