use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use super::model::ProductRecord;

const BUILTIN_FIXTURES: &str = include_str!("../../fixtures/products.json");

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("backing source unreachable: {0}")]
    Unavailable(String),

    #[error("backing source returned status {0}")]
    Status(u16),

    #[error("malformed backing source payload: {0}")]
    Malformed(String),
}

/// Exact-match lookup of product records by barcode.
#[async_trait]
pub trait ProductSource: Send + Sync {
    async fn lookup(&self, code: &str) -> Result<Option<ProductRecord>, SourceError>;

    fn name(&self) -> &'static str;
}

/// In-memory map loaded from JSON (`{ "<barcode>": ProductRecord, ... }`).
#[derive(Debug, Clone, Default)]
pub struct FixtureSource {
    products: HashMap<String, ProductRecord>,
}

impl FixtureSource {
    pub fn new(products: HashMap<String, ProductRecord>) -> Self {
        Self { products }
    }

    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_json(BUILTIN_FIXTURES).context("parse built-in product fixtures")
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let products: HashMap<String, ProductRecord> = serde_json::from_str(json)?;
        for (code, rec) in &products {
            rec.validate()
                .with_context(|| format!("fixture record {}", code))?;
        }
        Ok(Self::new(products))
    }

    pub async fn from_path(path: &Path) -> anyhow::Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read product fixtures {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("parse product fixtures {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }
}

#[async_trait]
impl ProductSource for FixtureSource {
    async fn lookup(&self, code: &str) -> Result<Option<ProductRecord>, SourceError> {
        Ok(self.products.get(code).cloned())
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}

/// Tries `primary` first and consults `fallback` only on a miss.
pub struct LayeredSource {
    primary: Arc<dyn ProductSource>,
    fallback: Arc<dyn ProductSource>,
}

impl LayeredSource {
    pub fn new(primary: Arc<dyn ProductSource>, fallback: Arc<dyn ProductSource>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl ProductSource for LayeredSource {
    async fn lookup(&self, code: &str) -> Result<Option<ProductRecord>, SourceError> {
        if let Some(rec) = self.primary.lookup(code).await? {
            return Ok(Some(rec));
        }
        debug!(code, primary = self.primary.name(), fallback = self.fallback.name(), "primary miss");
        self.fallback.lookup(code).await
    }

    fn name(&self) -> &'static str {
        "layered"
    }
}

#[cfg(test)]
mod source_tests {
    use super::*;

    struct Down;

    #[async_trait]
    impl ProductSource for Down {
        async fn lookup(&self, _code: &str) -> Result<Option<ProductRecord>, SourceError> {
            Err(SourceError::Unavailable("connection refused".into()))
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn builtin_fixtures_contain_reference_products() {
        let src = FixtureSource::builtin().unwrap();
        assert_eq!(src.len(), 2);

        let granola = src.lookup("5901234123457").await.unwrap().unwrap();
        assert_eq!(granola.name, "Organic Granola");
        assert_eq!(granola.nutrition.calories, 120.0);

        let yogurt = src.lookup("8901234567890").await.unwrap().unwrap();
        assert_eq!(yogurt.brand, "Dairy Delight");

        assert!(src.lookup("0000000000000").await.unwrap().is_none());
    }

    #[test]
    fn from_json_rejects_invalid_records() {
        let err = FixtureSource::from_json(
            r#"{"1": {"name": "Bad", "nutrition": {"calories": -5}}}"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("calories"));
    }

    #[tokio::test]
    async fn from_path_reports_missing_file() {
        let err = FixtureSource::from_path(Path::new("/definitely/not/here.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read product fixtures"));
    }

    #[tokio::test]
    async fn layered_only_consults_fallback_on_miss() {
        let fixtures = Arc::new(FixtureSource::builtin().unwrap());
        let layered = LayeredSource::new(fixtures, Arc::new(Down));

        // hit in primary never touches the broken fallback
        let hit = layered.lookup("5901234123457").await.unwrap();
        assert!(hit.is_some());

        let miss = layered.lookup("0000000000000").await;
        assert!(matches!(miss, Err(SourceError::Unavailable(_))));
    }
}
