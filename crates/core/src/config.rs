use std::path::PathBuf;
use std::time::Duration;

/// Version stamped on every analysis cache entry and on the cache file.
/// Bump whenever the meaning of any derived field changes.
pub const CACHE_SCHEMA_VERSION: u32 = 3;

/// Tunables for the analysis engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite catalog location. `None` keeps the catalog in memory.
    pub catalog_path: Option<PathBuf>,
    /// Analysis cache file location. `None` disables persistence.
    pub cache_path: Option<PathBuf>,
    pub cache_schema_version: u32,
    /// Ids pulled from the scheduler per worker chunk.
    pub worker_chunk_size: usize,
    /// Flush the pending analysis buffer once it holds this many results.
    pub flush_count: usize,
    /// Flush the pending analysis buffer once this much time has passed.
    pub flush_interval: Duration,
    /// Pause between worker chunks at nominal pressure.
    pub pressure_backoff: Duration,
    pub max_extraction_retries: u32,
    pub retry_backoff: Duration,
    /// Maximum capture-date gap between consecutive assets of one burst.
    pub cluster_window: Duration,
    /// Hamming distances strictly below this join a cluster.
    pub hamming_threshold: u32,
    /// Delay between ingestion pages.
    pub page_pacing: Duration,
    /// Page size requested from the asset source during ingestion.
    pub ingest_page_size: usize,
    /// Sharpness below this marks an asset as blurred.
    pub blur_threshold: f64,
    pub large_file_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catalog_path: None,
            cache_path: None,
            cache_schema_version: CACHE_SCHEMA_VERSION,
            worker_chunk_size: 16,
            flush_count: 50,
            flush_interval: Duration::from_secs(2),
            pressure_backoff: Duration::from_millis(10),
            max_extraction_retries: 2,
            retry_backoff: Duration::from_millis(500),
            cluster_window: Duration::from_secs(3),
            hamming_threshold: 10,
            page_pacing: Duration::from_millis(30),
            ingest_page_size: 200,
            blur_threshold: 0.35,
            large_file_threshold: 20 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Config rooted in a data directory: `catalog.db` and `analysis-cache.json`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            catalog_path: Some(dir.join("catalog.db")),
            cache_path: Some(dir.join("analysis-cache.json")),
            ..Self::default()
        }
    }

    /// Overlay environment variables on top of `self`.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `PHOTOSIFT_CATALOG` | `catalog_path` |
    /// | `PHOTOSIFT_CACHE` | `cache_path` |
    /// | `PHOTOSIFT_FLUSH_COUNT` | `flush_count` |
    /// | `PHOTOSIFT_FLUSH_INTERVAL_MS` | `flush_interval` |
    /// | `PHOTOSIFT_MAX_RETRIES` | `max_extraction_retries` |
    /// | `PHOTOSIFT_HAMMING_THRESHOLD` | `hamming_threshold` |
    /// | `PHOTOSIFT_CLUSTER_WINDOW_MS` | `cluster_window` |
    pub fn from_env(mut self) -> Self {
        if let Ok(v) = std::env::var("PHOTOSIFT_CATALOG") {
            self.catalog_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("PHOTOSIFT_CACHE") {
            self.cache_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse::<usize>("PHOTOSIFT_FLUSH_COUNT") {
            self.flush_count = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("PHOTOSIFT_FLUSH_INTERVAL_MS") {
            self.flush_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u32>("PHOTOSIFT_MAX_RETRIES") {
            self.max_extraction_retries = v;
        }
        if let Some(v) = env_parse::<u32>("PHOTOSIFT_HAMMING_THRESHOLD") {
            self.hamming_threshold = v.min(64);
        }
        if let Some(v) = env_parse::<u64>("PHOTOSIFT_CLUSTER_WINDOW_MS") {
            self.cluster_window = Duration::from_millis(v);
        }
        self
    }

    pub fn with_catalog_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.catalog_path = Some(path.into());
        self
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_flush(mut self, count: usize, interval: Duration) -> Self {
        self.flush_count = count.max(1);
        self.flush_interval = interval;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.worker_chunk_size = size.max(1);
        self
    }

    pub fn with_retries(mut self, max: u32, backoff: Duration) -> Self {
        self.max_extraction_retries = max;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_page_pacing(mut self, pacing: Duration) -> Self {
        self.page_pacing = pacing;
        self
    }

    pub fn with_ingest_page_size(mut self, size: usize) -> Self {
        self.ingest_page_size = size.max(1);
        self
    }

    pub fn with_pressure_backoff(mut self, backoff: Duration) -> Self {
        self.pressure_backoff = backoff;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_schema_version, CACHE_SCHEMA_VERSION);
        assert_eq!(config.cluster_window, Duration::from_secs(3));
        assert_eq!(config.hamming_threshold, 10);
        assert!(config.catalog_path.is_none());
    }

    #[test]
    fn test_in_dir_sets_paths() {
        let config = EngineConfig::in_dir("/data");
        assert_eq!(config.catalog_path, Some(PathBuf::from("/data/catalog.db")));
        assert_eq!(config.cache_path, Some(PathBuf::from("/data/analysis-cache.json")));

        let moved = config
            .with_catalog_path("/elsewhere/catalog.db")
            .with_cache_path("/elsewhere/cache.json");
        assert_eq!(moved.catalog_path, Some(PathBuf::from("/elsewhere/catalog.db")));
        assert_eq!(moved.cache_path, Some(PathBuf::from("/elsewhere/cache.json")));
    }

    #[test]
    fn test_builders_clamp_zero() {
        let config = EngineConfig::default()
            .with_flush(0, Duration::from_millis(5))
            .with_chunk_size(0)
            .with_ingest_page_size(0);
        assert_eq!(config.flush_count, 1);
        assert_eq!(config.worker_chunk_size, 1);
        assert_eq!(config.ingest_page_size, 1);
    }
}
