//! Frame-aware random reads over a compressed object.

use tracing::instrument;

use crate::backend::RangeBackend;
use crate::decode::decode_frame;
use crate::error::{Error, Result};
use crate::frame_table::{Compression, FrameTable};

/// The result of [`get_frame`]: where the returned bytes start and how long they are, in
/// whichever coordinate space was requested (uncompressed if `decompress`, else compressed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchedRange {
    pub start: i64,
    pub length: usize,
}

/// Reads the single frame covering `off_u` from `path` via `backend`, optionally decompressing.
///
/// - If `frame_table` is `None` or its compression is [`Compression::None`], the range
///   `[off_u, off_u + buf.len())` is fetched directly with no decode step.
/// - Otherwise the frame containing `off_u` is looked up, its compressed bytes are fetched with
///   [`RangeBackend::range_get`], and (if `decompress`) streamed through [`decode_frame`].
///
/// `buf` must be sized to match what's being returned: the frame's uncompressed size when
/// decompressing, or its compressed size when not. A short buffer fails with
/// [`Error::ShortBuffer`].
///
/// # Errors
///
/// Propagates backend and codec errors, plus [`Error::OutOfRange`] if `off_u` falls outside the
/// frame table and [`Error::ShortBuffer`] on an undersized `buf`.
#[instrument(skip(backend, frame_table, buf), fields(path, off_u))]
pub async fn get_frame(
    backend: &dyn RangeBackend,
    path: &str,
    off_u: i64,
    frame_table: Option<&FrameTable>,
    decompress: bool,
    buf: &mut [u8],
) -> Result<FetchedRange> {
    let Some(table) = frame_table.filter(|t| t.compression() != Compression::None) else {
        let mut reader = backend.range_get(path, off_u, buf.len()).await?;
        let n = read_fully(&mut reader, buf).await?;
        return Ok(FetchedRange {
            start: off_u,
            length: n,
        });
    };

    let (start, size) = table.frame_for(off_u)?;
    let mut reader = backend
        .range_get(path, start.c, size.c as usize)
        .await?;

    if decompress {
        if buf.len() < size.u as usize {
            return Err(Error::ShortBuffer {
                needed: size.u as usize,
                got: buf.len(),
            });
        }
        let n = decode_frame(&mut reader, &mut buf[..size.u as usize]).await?;
        Ok(FetchedRange {
            start: start.c,
            length: n,
        })
    } else {
        if buf.len() < size.c as usize {
            return Err(Error::ShortBuffer {
                needed: size.c as usize,
                got: buf.len(),
            });
        }
        let n = read_fully(&mut reader, &mut buf[..size.c as usize]).await?;
        Ok(FetchedRange {
            start: start.c,
            length: n,
        })
    }
}

async fn read_fully<R: tokio::io::AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    use tokio::io::AsyncReadExt;
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::backend::local::LocalBackend;
    use crate::backend::BasicBackend;
    use crate::encode::EncodeOptions;
    use tokio_util::sync::CancellationToken;

    async fn upload_compressed(backend: &LocalBackend, path: &str, data: &[u8]) -> FrameTable {
        let encoder = EncodeOptions::new()
            .chunk_size(4096)
            .target_frame_size(2048)
            .into_encoder()
            .unwrap();
        let token = CancellationToken::new();
        let mut full = Vec::new();
        let table = encoder
            .encode(Cursor::new(data.to_vec()), &token, |frame| {
                full.extend_from_slice(&frame.bytes);
                std::future::ready(Ok(()))
            })
            .await
            .unwrap();

        backend
            .upload(path, Box::pin(Cursor::new(full)), &[])
            .await
            .unwrap();
        table
    }

    #[tokio::test]
    async fn get_frame_decompresses_the_containing_frame() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let data = vec![11u8; 20_000];
        let table = upload_compressed(&backend, "obj", &data).await;

        let (start, size) = table.frame_for(5000).unwrap();
        let mut buf = vec![0u8; size.u as usize];
        let fetched = get_frame(&backend, "obj", 5000, Some(&table), true, &mut buf)
            .await
            .unwrap();

        assert_eq!(fetched.start, start.c);
        assert_eq!(buf, vec![11u8; size.u as usize]);
    }

    #[tokio::test]
    async fn get_frame_without_table_reads_raw_range() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend
            .upload("obj", Box::pin(Cursor::new(b"hello world".to_vec())), &[])
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        let fetched = get_frame(&backend, "obj", 6, None, false, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"world");
        assert_eq!(fetched.start, 6);
    }

    #[tokio::test]
    async fn short_buffer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let data = vec![1u8; 20_000];
        let table = upload_compressed(&backend, "obj", &data).await;

        let mut buf = [0u8; 4];
        let err = get_frame(&backend, "obj", 0, Some(&table), true, &mut buf)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShortBuffer { .. }));
    }
}
