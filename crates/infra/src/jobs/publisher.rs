use std::sync::Arc;

use tracing::{Span, debug, info, info_span};

use newsflow_core::{NewsEventId, TraceId};

use super::store::{JobStore, JobStoreError};
use super::types::JobType;

/// Publishes analysis jobs for stored news events.
///
/// Idempotent per `(news_event_id, job_type)`: the store's uniqueness constraint
/// decides, and the call reports whether a row was created.
#[derive(Clone)]
pub struct JobPublisher {
    store: Arc<dyn JobStore>,
    span: Span,
}

impl JobPublisher {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            span: info_span!("job_publisher"),
        }
    }

    pub async fn publish_job(
        &self,
        news_event_id: NewsEventId,
        trace_id: TraceId,
        job_type: JobType,
    ) -> Result<bool, JobStoreError> {
        let inserted = self.store.publish(news_event_id, trace_id, job_type).await?;

        let _guard = self.span.enter();
        if inserted {
            info!(%news_event_id, %trace_id, %job_type, "job published");
        } else {
            debug!(%news_event_id, %job_type, "job already exists");
        }
        Ok(inserted)
    }
}
