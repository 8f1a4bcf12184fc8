//! A chunk-addressed, read-through local filesystem cache fronting any [`RangeBackend`].

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, instrument};

use crate::backend::RangeBackend;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::limiter::Limiter;

/// Single-flight guards keyed by `(object, chunk_index)`, so concurrent misses for the same
/// chunk collapse into one fetch.
type InFlight = DashMap<(String, u64), Arc<Notify>>;

/// A chunk-addressed cache rooted at a local directory, fronting an inner [`RangeBackend`].
///
/// Chunk files live at `<root>/<object>/<chunk_index:012>-<chunk_size>.bin`. Reads prefer the
/// local file; misses fall through to `inner` and opportunistically populate the cache via a
/// temp-then-rename (move-without-replace) write, so a reader never observes a partially written
/// chunk and concurrent writers never clobber each other.
pub struct ChunkCache<B> {
    root: PathBuf,
    chunk_size: usize,
    inner: Arc<B>,
    write_through: bool,
    in_flight: InFlight,
    fanout: Arc<dyn Limiter>,
}

impl<B: RangeBackend + 'static> ChunkCache<B> {
    pub fn new(
        root: impl Into<PathBuf>,
        chunk_size: usize,
        inner: Arc<B>,
        write_through: bool,
        fanout: Arc<dyn Limiter>,
    ) -> Self {
        Self {
            root: root.into(),
            chunk_size,
            inner,
            write_through,
            in_flight: DashMap::new(),
            fanout,
        }
    }

    fn chunk_path(&self, object: &str, chunk_index: u64) -> PathBuf {
        self.root
            .join(object)
            .join(format!("{chunk_index:012}-{}.bin", self.chunk_size))
    }

    /// Reads one chunk-aligned range. `off` must be a multiple of `chunk_size`, and `buf` must
    /// not extend past the chunk boundary.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Invalid`] if `buf`/`off` violate the alignment contract, otherwise
    /// propagates errors from the inner backend.
    #[instrument(skip(self, buf), fields(object, off))]
    pub async fn read_at(&self, object: &str, buf: &mut [u8], off: i64) -> Result<usize> {
        self.check_alignment(buf.len(), off)?;
        let chunk_index = off as u64 / self.chunk_size as u64;
        let path = self.chunk_path(object, chunk_index);

        if let Ok(n) = self.read_chunk_file(&path, buf).await {
            return Ok(n);
        }

        let _permit = self.fanout.acquire(1).await;
        let fetched = self.fetch_and_populate(object, chunk_index, &path, off, buf).await?;
        Ok(fetched)
    }

    async fn read_chunk_file(&self, path: &PathBuf, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut file = fs::File::open(path).await?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    async fn fetch_and_populate(
        &self,
        object: &str,
        chunk_index: u64,
        path: &PathBuf,
        off: i64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let key = (object.to_string(), chunk_index);

        loop {
            if let Some(notify) = self.in_flight.get(&key).map(|e| Arc::clone(e.value())) {
                notify.notified().await;
                if let Ok(n) = self.read_chunk_file(path, buf).await {
                    return Ok(n);
                }
                continue;
            }

            let notify = Arc::new(Notify::new());
            self.in_flight.insert(key.clone(), Arc::clone(&notify));
            break;
        }

        let result = self.do_fetch(object, path, off, buf).await;

        if let Some((_, notify)) = self.in_flight.remove(&key) {
            notify.notify_waiters();
        }

        result
    }

    async fn do_fetch(
        &self,
        object: &str,
        path: &PathBuf,
        off: i64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let mut reader = self.inner.range_get(object, off, buf.len()).await?;
        let mut total = 0;
        while total < buf.len() {
            let n = reader.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }

        self.populate(path, &buf[..total]).await;
        Ok(total)
    }

    async fn populate(&self, path: &PathBuf, data: &[u8]) {
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).await.is_err() {
                return;
            }
        }

        let tmp = fsutil::temp_sibling(path);
        let write = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.flush().await?;
            Ok::<(), std::io::Error>(())
        };

        match write.await {
            Ok(()) => fsutil::rename_no_replace(&tmp, path).await,
            Err(err) => debug!(path = %path.display(), error = %err, "failed to stage cache chunk"),
        }
    }

    /// Writes `buf` at `off` into the local chunk cache. If write-through caching is enabled,
    /// the bytes are staged into a per-chunk file via the same temp-then-rename protocol as a
    /// read-path miss; without it, the call is a no-op rather than a pass-through write, because
    /// this cache has no partial-write path into `inner` to pass the bytes through to (see below).
    ///
    /// Remote backends in this model only expose whole-object `upload`, not a partial write at
    /// an offset, so `write_at` never itself pushes to `inner`: callers write the whole object
    /// through [`crate::backend::BasicBackend::upload`] and use `write_at` purely to warm the
    /// cache so the following `read_at` calls are served locally. With write-through disabled,
    /// there is nothing left for this call to do, so it returns `Ok(())` without touching disk.
    #[instrument(skip(self, buf), fields(object, off))]
    pub async fn write_at(&self, object: &str, buf: &[u8], off: i64) -> Result<()>
    where
        B: crate::backend::BasicBackend,
    {
        self.check_alignment(buf.len(), off)?;

        if !self.write_through {
            return Ok(());
        }

        let chunk_index = off as u64 / self.chunk_size as u64;
        let path = self.chunk_path(object, chunk_index);
        self.populate(&path, buf).await;
        Ok(())
    }

    /// Reads the whole object, preferring cached chunks, and writes it to `dst`.
    ///
    /// # Errors
    ///
    /// Propagates I/O and backend errors. Populates any chunks that were missing from the cache
    /// as a side effect.
    #[instrument(skip(self, dst), fields(object, virt_size))]
    pub async fn write_to<W>(&self, object: &str, virt_size: i64, mut dst: W) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let mut off = 0i64;
        while off < virt_size {
            let remaining = (virt_size - off) as usize;
            let len = remaining.min(self.chunk_size);
            let mut buf = vec![0u8; len];
            self.read_at(object, &mut buf, off).await?;
            dst.write_all(&buf).await?;
            off += len as i64;
        }
        dst.flush().await?;
        Ok(())
    }

    fn check_alignment(&self, len: usize, off: i64) -> Result<()> {
        if len == 0 {
            return Err(Error::invalid("buffer must be non-empty"));
        }
        if len > self.chunk_size {
            return Err(Error::invalid("buffer larger than chunk_size"));
        }
        if off < 0 || off as u64 % self.chunk_size as u64 != 0 {
            return Err(Error::invalid("offset must be chunk-aligned"));
        }
        let within = off as u64 % self.chunk_size as u64;
        if within as usize + len > self.chunk_size {
            return Err(Error::invalid("read crosses a chunk boundary"));
        }
        Ok(())
    }

    /// Deletes every object whose path starts with `prefix`, both from `inner` and from any
    /// matching local cache files.
    #[instrument(skip(self), fields(prefix))]
    pub async fn delete_with_prefix(&self, prefix: &str) -> Result<()>
    where
        B: crate::backend::ManagerBackend,
    {
        self.inner.delete_with_prefix(prefix).await?;

        let local_prefix = self.root.join(prefix);
        if let Some(parent) = local_prefix.parent() {
            if let Ok(mut entries) = fs::read_dir(parent).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let p = entry.path();
                    if p.as_os_str()
                        .to_string_lossy()
                        .starts_with(&*local_prefix.as_os_str().to_string_lossy())
                    {
                        let is_dir = entry.file_type().await.map(|ft| ft.is_dir()).unwrap_or(false);
                        let _ = if is_dir {
                            fs::remove_dir_all(&p).await
                        } else {
                            fs::remove_file(&p).await
                        };
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use crate::limiter::UnboundedLimiter;

    fn cache(root: &std::path::Path, chunk_size: usize) -> ChunkCache<LocalBackend> {
        let backend_root = root.join("remote");
        std::fs::create_dir_all(&backend_root).unwrap();
        ChunkCache::new(
            root.join("cache"),
            chunk_size,
            Arc::new(LocalBackend::new(backend_root)),
            false,
            Arc::new(UnboundedLimiter),
        )
    }

    #[tokio::test]
    async fn rejects_misaligned_offset() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 16);
        let mut buf = [0u8; 8];
        let err = cache.read_at("obj", &mut buf, 3).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test]
    async fn rejects_cross_chunk_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 16);
        let mut buf = [0u8; 20];
        let err = cache.read_at("obj", &mut buf, 0).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test]
    async fn falls_through_to_inner_on_miss_and_populates() {
        let dir = tempfile::tempdir().unwrap();
        let backend_root = dir.path().join("remote");
        std::fs::create_dir_all(&backend_root).unwrap();
        let backend = Arc::new(LocalBackend::new(backend_root));

        use crate::backend::BasicBackend;
        backend
            .upload("obj", Box::pin(std::io::Cursor::new(vec![9u8; 16])), &[])
            .await
            .unwrap();

        let cache = ChunkCache::new(
            dir.path().join("cache"),
            16,
            Arc::clone(&backend),
            false,
            Arc::new(UnboundedLimiter),
        );

        let mut buf = [0u8; 16];
        let n = cache.read_at("obj", &mut buf, 0).await.unwrap();
        assert_eq!(n, 16);
        assert_eq!(buf, [9u8; 16]);

        // Second read should now be served from the populated chunk file.
        std::fs::remove_dir_all(dir.path().join("remote")).unwrap();
        let mut buf2 = [0u8; 16];
        let n2 = cache.read_at("obj", &mut buf2, 0).await.unwrap();
        assert_eq!(n2, 16);
        assert_eq!(buf2, [9u8; 16]);
    }

    #[tokio::test]
    async fn delete_with_prefix_empties_nested_cache_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend_root = dir.path().join("remote");
        std::fs::create_dir_all(&backend_root).unwrap();
        let backend = Arc::new(LocalBackend::new(backend_root));

        use crate::backend::BasicBackend;
        backend
            .upload(
                "build1/memfile",
                Box::pin(std::io::Cursor::new(vec![9u8; 16])),
                &[],
            )
            .await
            .unwrap();

        let cache = ChunkCache::new(
            dir.path().join("cache"),
            16,
            Arc::clone(&backend),
            false,
            Arc::new(UnboundedLimiter),
        );

        let mut buf = [0u8; 16];
        cache.read_at("build1/memfile", &mut buf, 0).await.unwrap();
        assert!(dir.path().join("cache/build1").is_dir());

        cache.delete_with_prefix("build1").await.unwrap();

        assert!(!dir.path().join("cache/build1").exists());
        assert!(matches!(
            backend.start_download("build1/memfile").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn write_to_reassembles_whole_object() {
        let dir = tempfile::tempdir().unwrap();
        let backend_root = dir.path().join("remote");
        std::fs::create_dir_all(&backend_root).unwrap();
        let backend = Arc::new(LocalBackend::new(backend_root));

        use crate::backend::BasicBackend;
        let data: Vec<u8> = (0..40u8).collect();
        backend
            .upload("obj", Box::pin(std::io::Cursor::new(data.clone())), &[])
            .await
            .unwrap();

        let cache = ChunkCache::new(
            dir.path().join("cache"),
            16,
            backend,
            false,
            Arc::new(UnboundedLimiter),
        );

        let mut out = Vec::new();
        cache
            .write_to("obj", data.len() as i64, &mut out)
            .await
            .unwrap();
        assert_eq!(out, data);
    }
}
