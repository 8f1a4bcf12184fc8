//! Storage backend capability traits.
//!
//! A concrete backend rarely implements every operation a storage layer might ever need (a
//! read-only mirror has no uploader; a local test double has no public URL signer). Rather than
//! one monolithic trait with default-`Unsupported` methods, capabilities are split into small,
//! object-safe, `async_trait` interfaces, and [`Backend`] composes whichever ones a concrete
//! driver provides.

pub mod local;
pub mod multipart;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::{Error, Result};

/// A boxed, owned async byte stream returned by download-style operations.
pub type BoxAsyncRead = std::pin::Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// Upload and whole-object download.
#[async_trait]
pub trait BasicBackend: Send + Sync {
    /// Uploads the full contents of `reader` to `path`, with `metadata` persisted alongside it
    /// (backend-defined storage; the local backend uses a `.meta` sidecar).
    async fn upload(
        &self,
        path: &str,
        reader: BoxAsyncRead,
        metadata: &[(String, String)],
    ) -> Result<()>;

    /// Opens a stream over the whole object at `path`.
    ///
    /// Fails with [`Error::NotFound`] if the object does not exist.
    async fn start_download(&self, path: &str) -> Result<BoxAsyncRead>;
}

/// Byte-range reads, the primitive [`crate::decode`] and the cache build on.
#[async_trait]
pub trait RangeBackend: Send + Sync {
    /// Opens a stream over `[offset, offset + length)` of the object at `path`.
    ///
    /// A request past end of file returns a short or empty reader rather than failing.
    async fn range_get(&self, path: &str, offset: i64, length: usize) -> Result<BoxAsyncRead>;
}

/// Size and deletion.
#[async_trait]
pub trait ManagerBackend: Send + Sync {
    /// Returns `(virt, raw)`: the uncompressed (virtual, addressable) size and the number of
    /// bytes actually stored. When the object carries no compression these are equal.
    async fn size(&self, path: &str) -> Result<(i64, i64)>;

    /// Deletes every object whose path starts with `prefix`.
    async fn delete_with_prefix(&self, prefix: &str) -> Result<()>;
}

/// Pre-signed or otherwise publicly reachable download URLs.
#[async_trait]
pub trait PublicUploaderBackend: Send + Sync {
    /// Returns a URL the object at `path` can be fetched from without further authorization,
    /// valid for approximately `ttl_secs` seconds.
    async fn public_upload_url(&self, path: &str, ttl_secs: u64) -> Result<String>;
}

/// One multipart upload session, as spec'd in [`crate::uploader`].
#[async_trait]
pub trait MultipartUpload: Send + Sync {
    async fn start(&self) -> Result<String>;
    async fn upload_part(&self, part_number: u32, data: &[Bytes]) -> Result<()>;
    async fn complete(&self) -> Result<()>;
    /// The concurrency the backend recommends for this session's part uploads.
    fn target_concurrency(&self) -> usize;
}

/// Backends that can open a new multipart upload session.
#[async_trait]
pub trait MultipartFactoryBackend: Send + Sync {
    /// Allocates a new multipart session for `path`. `metadata` is attached to the object at
    /// initiate time (e.g. as `x-goog-meta-<k>`/`x-amz-meta-<k>` headers), the same pass-through
    /// [`BasicBackend::upload`] gives whole-object writes.
    async fn make_multipart_upload(
        &self,
        path: &str,
        metadata: &[(String, String)],
    ) -> Result<Box<dyn MultipartUpload>>;
}

/// A composed backend exposing whichever capabilities its concrete driver implements.
///
/// Capabilities absent from a given backend return [`Error::Unsupported`] rather than panicking
/// or silently no-op'ing, so callers get a typed signal they can branch on.
#[derive(Clone, Default)]
pub struct Backend {
    basic: Option<Arc<dyn BasicBackend>>,
    range: Option<Arc<dyn RangeBackend>>,
    manager: Option<Arc<dyn ManagerBackend>>,
    public_uploader: Option<Arc<dyn PublicUploaderBackend>>,
    multipart_factory: Option<Arc<dyn MultipartFactoryBackend>>,
}

impl Backend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_basic(mut self, basic: Arc<dyn BasicBackend>) -> Self {
        self.basic = Some(basic);
        self
    }

    pub fn with_range(mut self, range: Arc<dyn RangeBackend>) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_manager(mut self, manager: Arc<dyn ManagerBackend>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn with_public_uploader(mut self, uploader: Arc<dyn PublicUploaderBackend>) -> Self {
        self.public_uploader = Some(uploader);
        self
    }

    pub fn with_multipart_factory(mut self, factory: Arc<dyn MultipartFactoryBackend>) -> Self {
        self.multipart_factory = Some(factory);
        self
    }

    pub fn basic(&self) -> Result<&Arc<dyn BasicBackend>> {
        self.basic.as_ref().ok_or(Error::Unsupported("basic"))
    }

    pub fn range(&self) -> Result<&Arc<dyn RangeBackend>> {
        self.range.as_ref().ok_or(Error::Unsupported("range"))
    }

    pub fn manager(&self) -> Result<&Arc<dyn ManagerBackend>> {
        self.manager.as_ref().ok_or(Error::Unsupported("manager"))
    }

    pub fn public_uploader(&self) -> Result<&Arc<dyn PublicUploaderBackend>> {
        self.public_uploader
            .as_ref()
            .ok_or(Error::Unsupported("public_uploader"))
    }

    pub fn multipart_factory(&self) -> Result<&Arc<dyn MultipartFactoryBackend>> {
        self.multipart_factory
            .as_ref()
            .ok_or(Error::Unsupported("multipart_factory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_capability_is_unsupported() {
        let backend = Backend::new();
        assert!(matches!(backend.basic(), Err(Error::Unsupported("basic"))));
        assert!(matches!(backend.range(), Err(Error::Unsupported("range"))));
    }
}
