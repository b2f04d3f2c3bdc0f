use std::sync::Arc;

use shared::domain::OperationHandle;
use tracing::{info, warn};

use crate::{error::SubmissionError, types::OperationRequest, SubmissionInterface};

/// Hands validated requests to the signing agent. One call is one submission attempt; nothing
/// here retries.
#[derive(Clone)]
pub struct TransactionSubmitter {
    backend: Arc<dyn SubmissionInterface>,
}

impl TransactionSubmitter {
    pub fn new(backend: Arc<dyn SubmissionInterface>) -> Self {
        Self { backend }
    }

    pub async fn submit(
        &self,
        request: &OperationRequest,
    ) -> Result<OperationHandle, SubmissionError> {
        match self.backend.submit(request).await {
            Ok(handle) => {
                info!(
                    correlation_id = %request.correlation_id(),
                    action = %request.action(),
                    %handle,
                    "operation accepted"
                );
                Ok(handle)
            }
            Err(err) => {
                let error = SubmissionError::classify(format!("{err:#}"));
                warn!(
                    correlation_id = %request.correlation_id(),
                    action = %request.action(),
                    kind = ?error.kind,
                    error = %err,
                    "operation rejected before acceptance"
                );
                Err(error)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/submitter_tests.rs"]
mod tests;
