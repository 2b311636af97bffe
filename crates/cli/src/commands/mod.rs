pub mod decide;
pub mod feed;
pub mod groups;
pub mod scan;
pub mod status;
pub mod timeline;

use std::path::Path;
use std::sync::Arc;

use photosift_core::{Engine, EngineConfig, ManualPressure};

use crate::fingerprint::FingerprintExtractor;
use crate::library::DirectorySource;

/// Start an engine over `library`, storing its catalog and cache in `data_dir`.
pub(crate) fn open_engine(data_dir: &Path, library: Arc<DirectorySource>) -> Engine {
    let config = EngineConfig::in_dir(data_dir).from_env();
    Engine::start(
        config,
        library.clone(),
        Arc::new(FingerprintExtractor::new(library)),
        Arc::new(ManualPressure::default()),
    )
}

/// Engine for commands that only read or annotate the catalog.
pub(crate) fn open_catalog(data_dir: &Path) -> Engine {
    open_engine(data_dir, Arc::new(DirectorySource::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_catalog_lives_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_catalog(dir.path());
        let path = engine.config().catalog_path.clone().unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(!engine.is_degraded());
        engine.shutdown().await.unwrap();
    }
}
