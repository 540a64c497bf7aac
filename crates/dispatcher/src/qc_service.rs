//! Quality-control surface. QC inspects product versions after an
//! attempt finishes; its verdicts gate downstream readiness.

use std::sync::Arc;

use tracing::{debug, info};

use pipeline_domain::repositories::{AttemptRepository, ProductRepository};
use pipeline_domain::{PipelineError, PipelineResult};

pub struct QcService {
    attempts: Arc<dyn AttemptRepository>,
    products: Arc<dyn ProductRepository>,
}

impl QcService {
    pub fn new(attempts: Arc<dyn AttemptRepository>, products: Arc<dyn ProductRepository>) -> Self {
        Self { attempts, products }
    }

    /// Records the verdict for one product version and folds it into
    /// the owning attempt's QC outcome.
    pub async fn record_version_qc(&self, version_id: i64, passed: bool) -> PipelineResult<()> {
        let version = self
            .products
            .find_version_by_id(version_id)
            .await?
            .ok_or(PipelineError::ProductVersionNotFound { id: version_id })?;
        self.products.set_version_qc(version_id, passed).await?;
        self.attempts.refresh_qc_outcome(version.attempt_id).await?;
        debug!(version_id, passed, attempt_id = version.attempt_id, "recorded QC verdict");
        Ok(())
    }

    /// Declares QC inspection of an attempt finished. Downstream tasks
    /// only become ready once this has run.
    pub async fn complete_attempt_qc(&self, attempt_id: i64) -> PipelineResult<()> {
        self.attempts.refresh_qc_outcome(attempt_id).await?;
        self.attempts.mark_qc_complete(attempt_id).await?;
        info!(attempt_id, "QC inspection complete");
        Ok(())
    }
}
