//! Overlaps frame production with parallel part uploads to a multipart session.
//!
//! Frames from [`crate::encode::FramedEncoder`] are batched until the accumulated compressed
//! length reaches `target_part_size` (or the stream ends), then handed to the backend's
//! [`MultipartUpload`] session as one part. Frame boundaries are never split across parts.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::backend::MultipartUpload;
use crate::config::{StorageConfig, ENCODE_AHEAD_CHUNKS};
use crate::encode::{EncodeOptions, Frame, FramedEncoder};
use crate::error::{Error, Result};
use crate::frame_table::FrameTable;
use crate::limiter::Limiter;

/// A batch of frames whose combined compressed length reached `target_part_size`, or the final
/// (possibly short) batch at end of stream.
struct PartBatch {
    part_number: u32,
    slices: Vec<Bytes>,
}

/// Drives one complete upload: encode `source`, batch frames into parts, upload them with bounded
/// concurrency, and complete the multipart session.
///
/// Returns the [`FrameTable`] describing the uploaded object.
///
/// # Errors
///
/// If any part fails after exhausting its retries, the whole session fails and `token` is
/// cancelled so the encoder stops producing further frames. Propagates codec, I/O, and transport
/// errors.
#[instrument(skip(source, upload, limiter, cfg, token), fields(target_part_size = cfg.target_part_size()))]
pub async fn upload_stream<R>(
    source: R,
    upload: Arc<dyn MultipartUpload>,
    limiter: Arc<dyn Limiter>,
    cfg: &StorageConfig,
    token: CancellationToken,
) -> Result<FrameTable>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    upload.start().await?;

    let (tx, mut rx) = mpsc::channel::<Frame>(ENCODE_AHEAD_CHUNKS);

    let encoder = EncodeOptions::new()
        .level(cfg.compression_level())
        .chunk_size(cfg.chunk_size())
        .target_frame_size(cfg.target_frame_size())
        .compression_concurrency(cfg.compression_concurrency())
        .into_encoder()?;

    let encode_token = token.clone();
    let encode_task = tokio::spawn(async move {
        encoder
            .encode(source, &encode_token, |frame| {
                let tx = tx.clone();
                async move {
                    tx.send(frame)
                        .await
                        .map_err(|_| Error::Fatal("part batcher channel closed".into()))
                }
            })
            .await
    });

    let target_part_size = cfg.target_part_size();
    let mut current: Vec<Bytes> = Vec::new();
    let mut current_len = 0usize;
    let mut part_number = 1u32;
    let mut in_flight = Vec::new();

    while let Some(frame) = rx.recv().await {
        current_len += frame.bytes.len();
        let last = frame.last;
        current.push(frame.bytes);

        if current_len >= target_part_size || last {
            let batch = PartBatch {
                part_number,
                slices: std::mem::take(&mut current),
            };
            current_len = 0;
            part_number += 1;

            let permit_upload = Arc::clone(&upload);
            let permit_limiter = Arc::clone(&limiter);
            let permit_token = token.clone();
            in_flight.push(tokio::spawn(async move {
                let _permit = permit_limiter.acquire(1).await;
                if permit_token.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                permit_upload
                    .upload_part(batch.part_number, &batch.slices)
                    .await
            }));

            if last {
                break;
            }
        }
    }

    if !current.is_empty() {
        // The channel closed (the encoder task finished) without the trailing batch ever hitting
        // `target_part_size` or seeing a frame flagged `last` — e.g. a rotation triggered by
        // `target_frame_size` can land exactly on the final chunk, leaving the encoder's closing
        // (zero-byte) round with nothing to flag. Flush whatever is left rather than drop it.
        let batch = PartBatch {
            part_number,
            slices: std::mem::take(&mut current),
        };
        part_number += 1;

        let permit_upload = Arc::clone(&upload);
        let permit_limiter = Arc::clone(&limiter);
        let permit_token = token.clone();
        in_flight.push(tokio::spawn(async move {
            let _permit = permit_limiter.acquire(1).await;
            if permit_token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            permit_upload
                .upload_part(batch.part_number, &batch.slices)
                .await
        }));
    } else if part_number == 1 {
        // No frame was ever emitted at all, which only happens for a zero-byte input (an empty
        // source yields zero frames, never a batch to flush). The wire protocol still requires at
        // least one part to complete a multipart session, so an empty object uploads a single
        // zero-length part.
        let batch = PartBatch {
            part_number,
            slices: vec![Bytes::new()],
        };
        part_number += 1;

        let permit_upload = Arc::clone(&upload);
        let permit_limiter = Arc::clone(&limiter);
        let permit_token = token.clone();
        in_flight.push(tokio::spawn(async move {
            let _permit = permit_limiter.acquire(1).await;
            if permit_token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            permit_upload
                .upload_part(batch.part_number, &batch.slices)
                .await
        }));
    }

    for handle in in_flight {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                token.cancel();
                return Err(err);
            }
            Err(join_err) => {
                token.cancel();
                return Err(Error::Fatal(format!("part upload task panicked: {join_err}")));
            }
        }
    }

    let table = match encode_task.await {
        Ok(Ok(table)) => table,
        Ok(Err(err)) => {
            token.cancel();
            return Err(err);
        }
        Err(join_err) => {
            token.cancel();
            return Err(Error::Fatal(format!("encoder task panicked: {join_err}")));
        }
    };

    if table.num_frames() == 0 {
        warn!("uploading an empty object: zero frames, zero parts");
    }

    upload.complete().await?;
    info!(num_frames = table.num_frames(), num_parts = part_number - 1, "upload complete");

    Ok(table)
}
