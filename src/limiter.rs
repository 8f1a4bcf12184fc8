//! The narrow concurrency-limiter contract shared by the compressor and the uploader.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A resource limiter that can be acquired for `n` units of work and released afterward.
///
/// Implementors back onto whatever resource actually bounds concurrency: an OS thread pool
/// for the compressor, an outbound connection pool for the uploader, or a fixed-size in-flight
/// counter for the cache. The trait is deliberately narrow so call sites don't need to know
/// which.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Reserves `n` units, waiting until they are available.
    async fn acquire(&self, n: u32) -> Permit;
}

/// A held reservation. Releases its units when dropped.
pub struct Permit {
    inner: PermitInner,
}

enum PermitInner {
    Semaphore(OwnedSemaphorePermit),
    Noop,
}

/// A [`Limiter`] backed by a fixed-size [`tokio::sync::Semaphore`].
///
/// This is the default limiter used for [`StorageConfig::max_upload_concurrency`] and
/// [`StorageConfig::compression_concurrency`].
///
/// [`StorageConfig::max_upload_concurrency`]: crate::config::StorageConfig::max_upload_concurrency
/// [`StorageConfig::compression_concurrency`]: crate::config::StorageConfig::compression_concurrency
pub struct SemaphoreLimiter {
    semaphore: Arc<Semaphore>,
}

impl SemaphoreLimiter {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }
}

#[async_trait]
impl Limiter for SemaphoreLimiter {
    async fn acquire(&self, n: u32) -> Permit {
        let permit = Arc::clone(&self.semaphore)
            .acquire_many_owned(n)
            .await
            .expect("semaphore is never closed");
        Permit {
            inner: PermitInner::Semaphore(permit),
        }
    }
}

/// A [`Limiter`] that never blocks, for backends with no useful concurrency ceiling.
pub struct UnboundedLimiter;

#[async_trait]
impl Limiter for UnboundedLimiter {
    async fn acquire(&self, _n: u32) -> Permit {
        Permit {
            inner: PermitInner::Noop,
        }
    }
}
