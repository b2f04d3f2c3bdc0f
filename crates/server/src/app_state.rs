use std::{collections::HashMap, time::Duration};

use server_api::{Action, Ledger};
use shared::{
    domain::{Address, CorrelationId, OperationHandle},
    protocol::{OperationStatusResponse, OutcomeStatus},
};
use tokio::sync::Mutex;

pub(crate) struct OperationRecord {
    pub(crate) action: Action,
    pub(crate) from: Option<Address>,
    pub(crate) status: OutcomeStatus,
    pub(crate) detail: Option<String>,
}

#[derive(Default)]
pub(crate) struct OperationBook {
    pub(crate) records: HashMap<OperationHandle, OperationRecord>,
    pub(crate) by_correlation: HashMap<CorrelationId, OperationHandle>,
}

impl OperationBook {
    pub(crate) fn status(&self, handle: &OperationHandle) -> Option<OperationStatusResponse> {
        self.records.get(handle).map(|record| OperationStatusResponse {
            handle: handle.clone(),
            status: record.status,
            detail: record.detail.clone(),
        })
    }
}

pub(crate) struct AppState {
    pub(crate) ledger: Mutex<Ledger>,
    pub(crate) operations: Mutex<OperationBook>,
    pub(crate) inclusion_delay: Duration,
}

impl AppState {
    pub(crate) fn new(ledger: Ledger, inclusion_delay: Duration) -> Self {
        Self {
            ledger: Mutex::new(ledger),
            operations: Mutex::new(OperationBook::default()),
            inclusion_delay,
        }
    }
}
