use std::sync::Arc;

use tracing::{debug, warn};

use super::model::ProductRecord;
use super::source::ProductSource;
use crate::scan::decode::DecodedCode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no product found for barcode {0}")]
    NotFound(String),

    #[error("product source unavailable: {0}")]
    Upstream(String),
}

#[derive(Clone)]
pub struct ProductResolver {
    source: Arc<dyn ProductSource>,
}

impl ProductResolver {
    pub fn new(source: Arc<dyn ProductSource>) -> Self {
        Self { source }
    }

    pub async fn resolve(&self, code: &DecodedCode) -> Result<ProductRecord, ResolveError> {
        self.resolve_str(code.value()).await
    }

    /// Lookup by raw barcode string, for callers that never decoded an image.
    pub async fn resolve_str(&self, code: &str) -> Result<ProductRecord, ResolveError> {
        let found = self.source.lookup(code).await.map_err(|e| {
            warn!(error = %e, code, source = self.source.name(), "product lookup failed");
            ResolveError::Upstream(e.to_string())
        })?;

        let Some(record) = found else {
            debug!(code, "product not found");
            return Err(ResolveError::NotFound(code.to_string()));
        };

        if let Err(e) = record.validate() {
            warn!(error = %e, code, source = self.source.name(), "rejecting invalid product record");
            return Err(ResolveError::Upstream(e.to_string()));
        }
        Ok(record)
    }
}
