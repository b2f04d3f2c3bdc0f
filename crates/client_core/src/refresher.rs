use std::sync::Arc;

use futures::future::join_all;
use shared::domain::QueryKey;
use tracing::{debug, warn};

use crate::{error::RefreshError, ReadQueryInterface};

/// Re-reads the queries a flow declared stale once its write confirms.
#[derive(Clone)]
pub struct DependentDataRefresher {
    reader: Arc<dyn ReadQueryInterface>,
    affected: Vec<QueryKey>,
}

impl DependentDataRefresher {
    pub fn new(reader: Arc<dyn ReadQueryInterface>, affected: Vec<QueryKey>) -> Self {
        Self { reader, affected }
    }

    pub fn affected_queries(&self) -> &[QueryKey] {
        &self.affected
    }

    pub async fn refresh(&self) -> Result<(), RefreshError> {
        let results = join_all(self.affected.iter().map(|key| async move {
            (key.clone(), self.reader.refetch(key).await)
        }))
        .await;

        let failures: Vec<(QueryKey, String)> = results
            .into_iter()
            .filter_map(|(key, result)| match result {
                Ok(()) => {
                    debug!(query = %key, "refetched");
                    None
                }
                Err(err) => {
                    warn!(query = %key, error = %err, "refetch failed");
                    Some((key, err.to_string()))
                }
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RefreshError { failures })
        }
    }
}

#[cfg(test)]
#[path = "tests/refresher_tests.rs"]
mod tests;
