//! A reference backend against the local filesystem.
//!
//! Implements every capability trait in [`crate::backend`], used by this crate's own tests and
//! suitable as a single-machine object store. Per-object metadata (notably the uncompressed size)
//! is persisted as a `<path>.meta` sidecar of `key=value` lines, since the plain filesystem has no
//! place to hang arbitrary attributes off a file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{instrument, warn};

use super::{
    BasicBackend, BoxAsyncRead, ManagerBackend, MultipartFactoryBackend, MultipartUpload,
    PublicUploaderBackend, RangeBackend,
};
use crate::error::{Error, Result};
use crate::fsutil;

const UNCOMPRESSED_SIZE_KEY: &str = "e2b-uncompressed-size";

/// A [`crate::backend::Backend`] driver rooted at a directory on the local filesystem.
#[derive(Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".meta");
        PathBuf::from(p)
    }

    async fn read_meta(meta_path: &Path) -> Option<Vec<(String, String)>> {
        let content = fs::read_to_string(meta_path).await.ok()?;
        Some(
            content
                .lines()
                .filter_map(|line| line.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

#[async_trait]
impl BasicBackend for LocalBackend {
    #[instrument(skip(self, reader, metadata), fields(path))]
    async fn upload(
        &self,
        path: &str,
        mut reader: BoxAsyncRead,
        metadata: &[(String, String)],
    ) -> Result<()> {
        let dest = self.resolve(path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = fsutil::temp_sibling(&dest);
        let mut file = fs::File::create(&tmp).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        drop(file);

        fsutil::rename_no_replace(&tmp, &dest).await;

        let meta_path = Self::meta_path(&dest);
        let meta_tmp = fsutil::temp_sibling(&meta_path);
        let mut body = String::new();
        for (k, v) in metadata {
            body.push_str(k);
            body.push('=');
            body.push_str(v);
            body.push('\n');
        }
        fs::write(&meta_tmp, body).await?;
        fsutil::rename_no_replace(&meta_tmp, &meta_path).await;

        Ok(())
    }

    #[instrument(skip(self), fields(path))]
    async fn start_download(&self, path: &str) -> Result<BoxAsyncRead> {
        let dest = self.resolve(path);
        let file = fs::File::open(&dest)
            .await
            .map_err(|_| Error::NotFound(path.to_string()))?;
        Ok(Box::pin(file))
    }
}

#[async_trait]
impl RangeBackend for LocalBackend {
    #[instrument(skip(self), fields(path, offset, length))]
    async fn range_get(&self, path: &str, offset: i64, length: usize) -> Result<BoxAsyncRead> {
        let dest = self.resolve(path);
        let mut file = fs::File::open(&dest)
            .await
            .map_err(|_| Error::NotFound(path.to_string()))?;

        let file_len = file.metadata().await?.len();
        if offset < 0 || offset as u64 >= file_len {
            return Ok(Box::pin(std::io::Cursor::new(Vec::new())));
        }

        file.seek(std::io::SeekFrom::Start(offset as u64)).await?;
        let available = (file_len - offset as u64) as usize;
        let take = length.min(available) as u64;
        Ok(Box::pin(file.take(take)))
    }
}

#[async_trait]
impl ManagerBackend for LocalBackend {
    #[instrument(skip(self), fields(path))]
    async fn size(&self, path: &str) -> Result<(i64, i64)> {
        let dest = self.resolve(path);
        let meta_path = Self::meta_path(&dest);

        let raw = fs::metadata(&dest)
            .await
            .map_err(|_| Error::NotFound(path.to_string()))?
            .len() as i64;

        if let Some(meta) = Self::read_meta(&meta_path).await {
            if let Some((_, v)) = meta.iter().find(|(k, _)| k == UNCOMPRESSED_SIZE_KEY) {
                if let Ok(virt) = v.parse::<i64>() {
                    return Ok((virt, raw));
                }
            }
        }

        Ok((raw, raw))
    }

    #[instrument(skip(self), fields(prefix))]
    async fn delete_with_prefix(&self, prefix: &str) -> Result<()> {
        let target_prefix = self.resolve(prefix);
        let parent = target_prefix
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        let mut entries = match fs::read_dir(&parent).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let entry_path = entry.path();
            if entry_path.as_os_str().to_string_lossy().starts_with(
                &*target_prefix.as_os_str().to_string_lossy(),
            ) {
                let is_dir = match entry.file_type().await {
                    Ok(ft) => ft.is_dir(),
                    Err(err) => {
                        warn!(path = %entry_path.display(), error = %err, "failed to stat prefixed entry");
                        continue;
                    }
                };
                let result = if is_dir {
                    fs::remove_dir_all(&entry_path).await
                } else {
                    fs::remove_file(&entry_path).await
                };
                if let Err(err) = result {
                    warn!(path = %entry_path.display(), error = %err, "failed to delete prefixed entry");
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl PublicUploaderBackend for LocalBackend {
    async fn public_upload_url(&self, path: &str, ttl_secs: u64) -> Result<String> {
        let dest = self.resolve(path);
        Ok(format!("file://{}?ttl={}", dest.display(), ttl_secs))
    }
}

#[async_trait]
impl MultipartFactoryBackend for LocalBackend {
    async fn make_multipart_upload(
        &self,
        path: &str,
        metadata: &[(String, String)],
    ) -> Result<Box<dyn MultipartUpload>> {
        Ok(Box::new(LocalMultipartUpload {
            dest: self.resolve(path),
            metadata: metadata.to_vec(),
            parts: Mutex::new(Vec::new()),
        }))
    }
}

struct LocalMultipartUpload {
    dest: PathBuf,
    metadata: Vec<(String, String)>,
    parts: Mutex<Vec<(u32, Bytes)>>,
}

#[async_trait]
impl MultipartUpload for LocalMultipartUpload {
    async fn start(&self) -> Result<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn upload_part(&self, part_number: u32, data: &[Bytes]) -> Result<()> {
        let mut combined = Vec::new();
        for chunk in data {
            combined.extend_from_slice(chunk);
        }
        self.parts
            .lock()
            .expect("multipart upload mutex poisoned")
            .push((part_number, Bytes::from(combined)));
        Ok(())
    }

    async fn complete(&self) -> Result<()> {
        let mut parts = self
            .parts
            .lock()
            .expect("multipart upload mutex poisoned")
            .clone();
        parts.sort_by_key(|(n, _)| *n);

        if let Some(parent) = self.dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = fsutil::temp_sibling(&self.dest);
        let mut file = fs::File::create(&tmp).await?;
        for (_, bytes) in &parts {
            file.write_all(bytes).await?;
        }
        file.flush().await?;
        drop(file);

        fsutil::rename_no_replace(&tmp, &self.dest).await;

        let meta_path = LocalBackend::meta_path(&self.dest);
        let meta_tmp = fsutil::temp_sibling(&meta_path);
        let total_len: usize = parts.iter().map(|(_, b)| b.len()).sum();
        let mut body = format!("{UNCOMPRESSED_SIZE_KEY}={total_len}\n");
        for (k, v) in &self.metadata {
            body.push_str(k);
            body.push('=');
            body.push_str(v);
            body.push('\n');
        }
        fs::write(&meta_tmp, body).await?;
        fsutil::rename_no_replace(&meta_tmp, &meta_path).await;

        Ok(())
    }

    fn target_concurrency(&self) -> usize {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;

    #[tokio::test]
    async fn upload_and_download_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());

        let data = b"hello world".to_vec();
        backend
            .upload(
                "obj1",
                Box::pin(std::io::Cursor::new(data.clone())),
                &[(UNCOMPRESSED_SIZE_KEY.to_string(), data.len().to_string())],
            )
            .await
            .unwrap();

        let mut reader = backend.start_download("obj1").await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);

        assert_eq!(
            backend.size("obj1").await.unwrap(),
            (data.len() as i64, data.len() as i64)
        );
    }

    #[tokio::test]
    async fn range_get_past_eof_is_short() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend
            .upload("obj1", Box::pin(std::io::Cursor::new(b"abc".to_vec())), &[])
            .await
            .unwrap();

        let mut reader = backend.range_get("obj1", 100, 10).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let err = backend.start_download("nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_with_prefix_removes_nested_objects() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());

        backend
            .upload(
                "build1/memfile",
                Box::pin(std::io::Cursor::new(b"mem".to_vec())),
                &[],
            )
            .await
            .unwrap();
        backend
            .upload(
                "build1/rootfs",
                Box::pin(std::io::Cursor::new(b"rootfs".to_vec())),
                &[],
            )
            .await
            .unwrap();
        backend
            .upload(
                "build2/memfile",
                Box::pin(std::io::Cursor::new(b"other".to_vec())),
                &[],
            )
            .await
            .unwrap();

        backend.delete_with_prefix("build1").await.unwrap();

        assert!(matches!(
            backend.start_download("build1/memfile").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            backend.start_download("build1/rootfs").await.unwrap_err(),
            Error::NotFound(_)
        ));
        let mut reader = backend.start_download("build2/memfile").await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"other");
    }

    #[tokio::test]
    async fn multipart_upload_orders_parts_by_number() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let upload = backend.make_multipart_upload("obj2", &[]).await.unwrap();

        upload.start().await.unwrap();
        upload
            .upload_part(2, &[Bytes::from_static(b"world")])
            .await
            .unwrap();
        upload
            .upload_part(1, &[Bytes::from_static(b"hello ")])
            .await
            .unwrap();
        upload.complete().await.unwrap();

        let content = fs::read(dir.path().join("obj2")).await.unwrap();
        assert_eq!(content, b"hello world");
    }
}
