use std::sync::Arc;

use tracing::info;

use crate::config::{AppConfig, SourceKind};
use crate::products::edamam::EdamamClient;
use crate::products::resolver::ProductResolver;
use crate::products::source::{FixtureSource, LayeredSource, ProductSource};
use crate::scan::acquire::{Camera, SnapshotCamera};
use crate::scan::controller::ScanController;
use crate::scan::decode::BarcodeDecoder;
use crate::scan::registry::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub decoder: BarcodeDecoder,
    pub resolver: ProductResolver,
    pub camera: Arc<dyn Camera>,
    pub sessions: SessionRegistry,
    /// Food search needs the remote source; absent when it is not configured.
    pub search: Option<EdamamClient>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let fixtures = match &config.fixtures_path {
            Some(path) => FixtureSource::from_path(path).await?,
            None => FixtureSource::builtin()?,
        };
        info!(products = fixtures.len(), "product fixtures loaded");
        let remote = config.edamam.as_ref().map(EdamamClient::new).transpose()?;

        let source: Arc<dyn ProductSource> = match (config.product_source, remote.clone()) {
            (SourceKind::Fixture, _) => Arc::new(fixtures),
            (SourceKind::Remote, Some(remote)) => Arc::new(remote),
            (SourceKind::Layered, Some(remote)) => {
                Arc::new(LayeredSource::new(Arc::new(fixtures), Arc::new(remote)))
            }
            (kind, None) => anyhow::bail!("product source {:?} needs Edamam credentials", kind),
        };
        info!(source = source.name(), search = remote.is_some(), "product source ready");

        let camera = Arc::new(SnapshotCamera::new(config.camera_snapshot_path.clone())) as Arc<dyn Camera>;

        Ok(Self::from_parts(config, ProductResolver::new(source), camera, remote))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        resolver: ProductResolver,
        camera: Arc<dyn Camera>,
        search: Option<EdamamClient>,
    ) -> Self {
        let sessions = SessionRegistry::new(config.session_limits());
        Self {
            config,
            decoder: BarcodeDecoder::default(),
            resolver,
            camera,
            sessions,
            search,
        }
    }

    pub fn new_controller(&self) -> ScanController {
        ScanController::new(self.decoder, self.resolver.clone(), self.camera.clone())
    }

    /// Built-in fixtures, no camera device, no remote search.
    #[cfg(test)]
    pub fn fake() -> Self {
        let config = Arc::new(AppConfig {
            host: "127.0.0.1".into(),
            port: 0,
            max_upload_bytes: 1024 * 1024,
            product_source: SourceKind::Fixture,
            fixtures_path: None,
            edamam: None,
            camera_snapshot_path: None,
            session_capacity: 16,
            session_idle_ttl_secs: 60,
        });
        let source = Arc::new(FixtureSource::builtin().expect("built-in fixtures parse"));
        Self::from_parts(
            config,
            ProductResolver::new(source),
            Arc::new(SnapshotCamera::default()),
            None,
        )
    }
}
