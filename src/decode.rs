//! Single-frame decompression.
//!
//! Every frame produced by [`crate::encode::FramedEncoder`] is an independently decodable zstd
//! frame, so random reads never need more state than "decompress these compressed bytes".

use tokio::io::{AsyncRead, AsyncReadExt};
use zstd::stream::raw::{Decoder as RawFrameDecoder, InBuffer, Operation, OutBuffer};

use crate::error::{Error, Result};

const IN_BUF_HINT: usize = 64 * 1024;

/// Decompresses one independent zstd frame read from `reader` into `buf`.
///
/// `buf` must be exactly the frame's uncompressed size; a buffer that fills up before the frame
/// ends fails with [`Error::ShortBuffer`]. Returns the number of bytes written, i.e. `buf.len()`
/// on success.
///
/// # Errors
///
/// Fails with [`Error::Codec`] on malformed input, [`Error::Io`] if `reader` fails, and
/// [`Error::ShortBuffer`] if `buf` is smaller than the frame's uncompressed content.
pub async fn decode_frame<R: AsyncRead + Unpin>(mut reader: R, buf: &mut [u8]) -> Result<usize> {
    let mut decoder = RawFrameDecoder::new().map_err(Error::Codec)?;
    let mut in_buf = vec![0u8; IN_BUF_HINT];
    let mut written = 0;
    let mut finished = false;

    while !finished {
        let read = reader.read(&mut in_buf).await?;
        if read == 0 {
            break;
        }

        let mut input = InBuffer::around(&in_buf[..read]);
        while input.pos() < read {
            if written >= buf.len() {
                return Err(Error::ShortBuffer {
                    needed: written + 1,
                    got: buf.len(),
                });
            }

            let mut output = OutBuffer::around(&mut buf[written..]);
            let remaining = decoder.run(&mut input, &mut output).map_err(Error::Codec)?;
            written += output.pos();
            if remaining == 0 {
                finished = true;
            }
        }
    }

    Ok(written)
}
