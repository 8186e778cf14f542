//! Base image cache.
//!
//! Makes sure an image is present locally before a container is built from
//! it. The presence check and the pull run under a per-tag lock, so two
//! runs asking for the same missing tag issue one pull between them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::sandbox::error::{Result, SandboxError};
use crate::sandbox::runtime::ContainerRuntime;

/// Ensures base images are available, pulling each at most once at a time.
pub struct ImageCache {
    runtime: Arc<dyn ContainerRuntime>,
    tag_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ImageCache {
    /// Create a cache over the given runtime.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            tag_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Make `image` available locally.
    ///
    /// After a successful call, later calls for the same tag only perform
    /// the local presence check.
    pub async fn ensure(&self, image: &str) -> Result<()> {
        let lock = self.tag_lock(image).await;
        let _guard = lock.lock().await;

        let present = self
            .runtime
            .image_exists(image)
            .await
            .map_err(|e| unavailable(image, e))?;
        if present {
            tracing::debug!(image = %image, "Image present locally");
            return Ok(());
        }

        tracing::info!(image = %image, "Pulling image");
        self.runtime
            .pull_image(image)
            .await
            .map_err(|e| unavailable(image, e))?;
        tracing::info!(image = %image, "Image pulled");
        Ok(())
    }

    async fn tag_lock(&self, image: &str) -> Arc<Mutex<()>> {
        let mut locks = self.tag_locks.lock().await;
        Arc::clone(locks.entry(image.to_string()).or_default())
    }
}

fn unavailable(image: &str, err: SandboxError) -> SandboxError {
    match err {
        SandboxError::ImageUnavailable { .. } => err,
        other => SandboxError::ImageUnavailable {
            image: image.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sandbox::ErrorKind;
    use crate::sandbox::testing::MockRuntime;

    const IMAGE: &str = "python:3.11-slim";

    #[tokio::test]
    async fn test_present_image_is_not_pulled() {
        let runtime = Arc::new(MockRuntime::new().with_image(IMAGE));
        let cache = ImageCache::new(runtime.clone());
        cache.ensure(IMAGE).await.unwrap();
        assert_eq!(runtime.pulls(), 0);
    }

    #[tokio::test]
    async fn test_ensure_twice_pulls_once() {
        let runtime = Arc::new(MockRuntime::new());
        let cache = ImageCache::new(runtime.clone());
        cache.ensure(IMAGE).await.unwrap();
        cache.ensure(IMAGE).await.unwrap();
        assert_eq!(runtime.pulls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_ensure_serializes_pull() {
        let mut mock = MockRuntime::new();
        mock.pull_delay = Duration::from_secs(5);
        let runtime = Arc::new(mock);
        let cache = ImageCache::new(runtime.clone());

        let (a, b) = tokio::join!(cache.ensure(IMAGE), cache.ensure(IMAGE));
        a.unwrap();
        b.unwrap();
        assert_eq!(runtime.pulls(), 1);
    }

    #[tokio::test]
    async fn test_distinct_tags_pull_independently() {
        let runtime = Arc::new(MockRuntime::new());
        let cache = ImageCache::new(runtime.clone());
        cache.ensure("python:3.10-slim").await.unwrap();
        cache.ensure("python:3.12-slim").await.unwrap();
        assert_eq!(runtime.pulls(), 2);
    }

    #[tokio::test]
    async fn test_failed_pull_is_image_unavailable() {
        let mut mock = MockRuntime::new();
        mock.pull_fails = true;
        let cache = ImageCache::new(Arc::new(mock));
        let err = cache.ensure("python:0.0-nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImageUnavailable);
        assert!(err.to_string().contains("python:0.0-nope"));
    }

    #[test]
    fn test_unavailable_wraps_other_errors() {
        let err = unavailable(
            IMAGE,
            SandboxError::DockerNotAvailable {
                reason: "socket closed".to_string(),
            },
        );
        assert_eq!(err.kind(), ErrorKind::ImageUnavailable);
        assert!(err.to_string().contains("socket closed"));
    }
}
