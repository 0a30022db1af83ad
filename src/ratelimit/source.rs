//! Where throttling configuration comes from.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::rules::{ConfigSnapshot, ThrottleConfig};
use crate::error::Result;

/// Asynchronous getter for the current configuration.
///
/// Implementations may read static values, files or a remote config service.
/// Errors are never fatal to traffic: the throttler logs them and keeps (or
/// falls back to) a permissive snapshot.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self) -> Result<ConfigSnapshot>;
}

/// A fixed, in-code configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    snapshot: ConfigSnapshot,
}

impl StaticConfigSource {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn fetch(&self) -> Result<ConfigSnapshot> {
        Ok(self.snapshot.clone())
    }
}

/// YAML or JSON file re-read on every fetch.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
    default_unique_name: Option<String>,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            default_unique_name: None,
        }
    }

    /// Namespace used when the file leaves `unique_name` empty.
    pub fn with_default_unique_name(mut self, name: impl Into<String>) -> Self {
        self.default_unique_name = Some(name.into());
        self
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn fetch(&self) -> Result<ConfigSnapshot> {
        debug!(path = %self.path.display(), "Reading throttling configuration");
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let mut config = ThrottleConfig::from_contents(&self.path, &contents)?;
        if config.unique_name.is_empty() {
            if let Some(name) = &self.default_unique_name {
                config.unique_name = name.clone();
            }
        }
        config.compile()
    }
}

type FetchFuture = Pin<Box<dyn Future<Output = Result<ConfigSnapshot>> + Send>>;

/// Configuration produced by a closure, e.g. a call to a remote service.
#[derive(Clone)]
pub struct FnConfigSource {
    fetch: Arc<dyn Fn() -> FetchFuture + Send + Sync>,
}

impl FnConfigSource {
    pub fn new<F, Fut>(fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ConfigSnapshot>> + Send + 'static,
    {
        Self {
            fetch: Arc::new(move || Box::pin(fetch()) as FetchFuture),
        }
    }
}

#[async_trait]
impl ConfigSource for FnConfigSource {
    async fn fetch(&self) -> Result<ConfigSnapshot> {
        (self.fetch)().await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::error::ThrottleError;

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticConfigSource::new(ConfigSnapshot::new("svc"));
        let snapshot = assert_ok!(source.fetch().await);
        assert_eq!(snapshot.unique_name, "svc");
    }

    #[tokio::test]
    async fn test_file_source() {
        let path = std::env::temp_dir().join(format!("throttlegate-{}.yaml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "unique_name: files\nrules:\n  - uri_pattern: /x\n    limit_method:\n      \
             algorithm: fixed_window\n      permit_limit: 1\n      interval_seconds: 1"
        )
        .unwrap();

        let snapshot = assert_ok!(FileConfigSource::new(&path).fetch().await);
        assert_eq!(snapshot.unique_name, "files");
        assert_eq!(snapshot.rules.len(), 1);

        std::fs::remove_file(&path).unwrap();
        assert_err!(FileConfigSource::new(&path).fetch().await);
    }

    #[tokio::test]
    async fn test_file_source_default_name() {
        let path = std::env::temp_dir().join(format!("throttlegate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "rules: []\n").unwrap();

        let source = FileConfigSource::new(&path).with_default_unique_name("fallback");
        let snapshot = assert_ok!(source.fetch().await);
        assert_eq!(snapshot.unique_name, "fallback");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_fn_source() {
        let source =
            FnConfigSource::new(|| async { Err(ThrottleError::Config("down".to_string())) });
        assert_err!(source.fetch().await);
    }
}
