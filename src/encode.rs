//! Streaming, frame-chunked compression.
//!
//! [`FramedEncoder`] partitions an input stream into fixed-size uncompressed chunks, groups
//! chunks into independently decodable zstd frames, and hands each finished frame to a callback
//! as it completes, alongside building up the [`FrameTable`] that indexes them.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use zstd::stream::raw::{CParameter, Encoder as RawFrameEncoder, Operation};

use crate::error::{Error, Result};
use crate::frame_table::{Compression, FrameOffset, FrameSize, FrameTable};

/// A zstd output buffer large enough that most frames finish without reallocating.
const OUT_BUF_HINT: usize = 64 * 1024;

/// Configuration for a [`FramedEncoder`], mirroring the knobs in [`crate::config::StorageConfig`].
///
/// # Examples
///
/// ```
/// use snapstore::encode::EncodeOptions;
///
/// let opts = EncodeOptions::new()
///     .level(5)
///     .chunk_size(8192)
///     .target_frame_size(16384);
/// ```
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    level: i32,
    chunk_size: usize,
    target_frame_size: usize,
    compression_concurrency: u32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            level: 3,
            chunk_size: crate::config::DEFAULT_CHUNK_SIZE,
            target_frame_size: crate::config::DEFAULT_TARGET_FRAME_SIZE,
            compression_concurrency: 0,
        }
    }
}

impl EncodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn target_frame_size(mut self, size: usize) -> Self {
        self.target_frame_size = size;
        self
    }

    pub fn compression_concurrency(mut self, workers: u32) -> Self {
        self.compression_concurrency = workers;
        self
    }

    /// Builds a [`FramedEncoder`] from these options.
    ///
    /// # Errors
    ///
    /// Fails if the underlying zstd compression context cannot be created or configured.
    pub fn into_encoder(self) -> Result<FramedEncoder> {
        FramedEncoder::with_opts(self)
    }
}

/// A finished frame, ready to hand off to a part batcher or write to disk.
#[derive(Debug, Clone)]
pub struct Frame {
    pub offset: FrameOffset,
    pub size: FrameSize,
    pub bytes: Bytes,
    /// Set on the frame that closes out the input stream.
    pub last: bool,
}

/// Drives zstd frame-by-frame compression over chunk-sized writes.
///
/// A new frame starts whenever the running compressed length of the current frame reaches
/// `target_frame_size`, or when the input ends. A chunk is never split across a frame boundary:
/// if a single chunk's compressed output alone exceeds `target_frame_size`, that chunk still
/// becomes one (oversized) frame.
pub struct FramedEncoder {
    raw: RawFrameEncoder<'static>,
    level: i32,
    chunk_size: usize,
    target_frame_size: usize,
    compression_concurrency: u32,
    frame_u: i64,
    frame_buf: BytesMut,
    offset: FrameOffset,
    table: FrameTable,
}

impl FramedEncoder {
    /// Creates an encoder with default options.
    ///
    /// # Errors
    ///
    /// Fails if the zstd compression context cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_opts(EncodeOptions::new())
    }

    /// Creates an encoder with the given options.
    ///
    /// # Errors
    ///
    /// Fails if the zstd compression context cannot be created or configured.
    pub fn with_opts(opts: EncodeOptions) -> Result<Self> {
        let raw = new_raw_encoder(opts.level, opts.compression_concurrency)?;
        Ok(Self {
            raw,
            level: opts.level,
            chunk_size: opts.chunk_size,
            target_frame_size: opts.target_frame_size,
            compression_concurrency: opts.compression_concurrency,
            frame_u: 0,
            frame_buf: BytesMut::with_capacity(OUT_BUF_HINT),
            offset: FrameOffset::ZERO,
            table: FrameTable::new(Compression::Zstd),
        })
    }

    /// Reads `source` to completion in `chunk_size` chunks, calling `on_frame_ready` for every
    /// finished frame, and returns the final [`FrameTable`].
    ///
    /// `token` is checked between chunks; a cancelled token stops production before the next
    /// chunk is read and fails with [`Error::Cancelled`].
    ///
    /// # Errors
    ///
    /// Propagates codec errors, I/O errors from `source`, and errors returned by `on_frame_ready`.
    /// Cancellation also surfaces as an error; no partial frame table is returned in that case.
    #[instrument(skip_all, fields(chunk_size = self.chunk_size, target_frame_size = self.target_frame_size))]
    pub async fn encode<R, F, Fut>(
        mut self,
        mut source: R,
        token: &CancellationToken,
        mut on_frame_ready: F,
    ) -> Result<FrameTable>
    where
        R: AsyncRead + Unpin,
        F: FnMut(Frame) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let n = read_chunk(&mut source, &mut chunk).await?;
            let eof = n < chunk.len();
            if n > 0 {
                self.compress_chunk(&chunk[..n])?;
            }

            let should_rotate = eof || self.frame_buf.len() >= self.target_frame_size;
            if should_rotate {
                let frame = self.finish_frame(eof)?;
                if let Some(frame) = frame {
                    on_frame_ready(frame).await?;
                }
            }

            if eof {
                break;
            }
        }

        Ok(self.table)
    }

    fn compress_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        use zstd::stream::raw::{InBuffer, OutBuffer};

        self.frame_u += chunk.len() as i64;
        let mut in_buf = InBuffer::around(chunk);
        while in_buf.pos() < chunk.len() {
            let mut scratch = [0u8; OUT_BUF_HINT];
            let mut out_buf = OutBuffer::around(&mut scratch);
            self.raw
                .run(&mut in_buf, &mut out_buf)
                .map_err(Error::Codec)?;
            let written = out_buf.pos();
            self.frame_buf.extend_from_slice(&scratch[..written]);
        }
        Ok(())
    }

    /// Flushes the frame epilogue and, if any uncompressed bytes were seen since the last
    /// rotation, records and returns the finished frame.
    fn finish_frame(&mut self, last: bool) -> Result<Option<Frame>> {
        use zstd::stream::raw::OutBuffer;

        loop {
            let mut scratch = [0u8; OUT_BUF_HINT];
            let mut out_buf = OutBuffer::around(&mut scratch);
            let remaining = self.raw.finish(&mut out_buf, true).map_err(Error::Codec)?;
            let written = out_buf.pos();
            self.frame_buf.extend_from_slice(&scratch[..written]);
            if remaining == 0 {
                break;
            }
        }

        if self.frame_u == 0 {
            return Ok(None);
        }

        let size = FrameSize {
            u: self.frame_u as i32,
            c: self.frame_buf.len() as i32,
        };
        let offset = self.offset;
        self.table.push_frame(size);
        self.offset = FrameOffset {
            u: offset.u + i64::from(size.u),
            c: offset.c + i64::from(size.c),
        };

        let bytes = self.frame_buf.split().freeze();
        self.frame_u = 0;
        self.raw = new_raw_encoder(self.level, self.compression_concurrency)?;

        debug!(frame_u = size.u, frame_c = size.c, last, "frame ready");

        Ok(Some(Frame {
            offset,
            size,
            bytes,
            last,
        }))
    }
}

fn new_raw_encoder(level: i32, workers: u32) -> Result<RawFrameEncoder<'static>> {
    let mut encoder = RawFrameEncoder::new(level).map_err(Error::Codec)?;
    if workers > 0 {
        encoder
            .set_parameter(CParameter::NbWorkers(workers))
            .map_err(Error::Codec)?;
    }
    Ok(encoder)
}

/// Reads until `buf` is full or the source hits EOF, returning the number of bytes read.
///
/// Per the framing contract, only the final chunk of a stream may come back short.
async fn read_chunk<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    async fn run_encode(
        data: &[u8],
        chunk_size: usize,
        target_frame_size: usize,
    ) -> (Vec<Frame>, FrameTable) {
        let encoder = EncodeOptions::new()
            .chunk_size(chunk_size)
            .target_frame_size(target_frame_size)
            .into_encoder()
            .unwrap();

        let mut frames = Vec::new();
        let token = CancellationToken::new();
        let table = encoder
            .encode(Cursor::new(data.to_vec()), &token, |frame| {
                frames.push(frame);
                std::future::ready(Ok(()))
            })
            .await
            .unwrap();

        (frames, table)
    }

    #[tokio::test]
    async fn empty_input_yields_zero_frames() {
        let (frames, table) = run_encode(&[], 1024, 4096).await;
        assert!(frames.is_empty());
        assert_eq!(table.num_frames(), 0);
        assert_eq!(table.total_u(), 0);
    }

    #[tokio::test]
    async fn partial_final_chunk_becomes_its_own_frame() {
        let data = vec![7u8; 1500];
        let (frames, table) = run_encode(&data, 1024, 1_000_000).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(table.total_u(), 1500);
        assert!(frames[0].last);
    }

    #[tokio::test]
    async fn rotates_when_target_frame_size_reached() {
        let data = vec![42u8; 64 * 1024];
        let (frames, table) = run_encode(&data, 4096, 256).await;
        assert!(frames.len() > 1);
        assert_eq!(table.total_u(), data.len() as i64);
        let last = frames.last().unwrap();
        assert!(last.last);

        let mut cursor = FrameOffset::ZERO;
        for frame in &frames {
            assert_eq!(frame.offset, cursor);
            cursor = FrameOffset {
                u: cursor.u + i64::from(frame.size.u),
                c: cursor.c + i64::from(frame.size.c),
            };
        }
    }

    #[tokio::test]
    async fn single_oversized_chunk_is_not_split() {
        let data = vec![9u8; 8192];
        let (frames, _table) = run_encode(&data, 8192, 16).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].size.u, 8192);
    }

    #[tokio::test]
    async fn cancellation_before_first_chunk_fails() {
        let encoder = EncodeOptions::new().into_encoder().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = encoder
            .encode(Cursor::new(vec![1, 2, 3]), &token, |_| {
                std::future::ready(Ok(()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
