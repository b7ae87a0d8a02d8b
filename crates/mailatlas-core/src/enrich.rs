use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::contacts::Contact;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("enrichment failed: {0}")]
    Failed(String),
}

/// Optional third-party enrichment. Best-effort: a failure is recorded on the
/// contact and never fails the surrounding job.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, contact: &Contact) -> Result<Value, EnrichError>;
}

/// Enricher that always fails, for tests that assert failure handling.
pub struct FailingEnricher;

#[async_trait]
impl Enricher for FailingEnricher {
    async fn enrich(&self, _contact: &Contact) -> Result<Value, EnrichError> {
        Err(EnrichError::Failed("no provider configured".to_string()))
    }
}

/// Enricher returning a fixed record, for tests.
pub struct StaticEnricher(pub Value);

#[async_trait]
impl Enricher for StaticEnricher {
    async fn enrich(&self, _contact: &Contact) -> Result<Value, EnrichError> {
        Ok(self.0.clone())
    }
}
