//! The chunk write pipeline.
//!
//! Bytes flow from the request stream through a length limiter and an
//! optional digest into a file handle that is already positioned at the
//! chunk's offset. The first bytes of an upload can be held back briefly to
//! sniff the real content type; they are written out unchanged afterwards.

use crate::{
    errors::{ErrorCode, UploadError},
    models::{BodyStream, Checksum},
};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bytes buffered before sniffing the content type.
pub const SNIFF_LEN: usize = 4096;

/// Limits and checks applied to one chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkLimits<'a> {
    /// Declared chunk length.
    pub content_length: Option<u64>,
    /// Bytes left before the declared upload size is exceeded.
    pub room: Option<u64>,
    /// Bytes left before the storage-wide size limit is exceeded.
    pub ceiling: Option<u64>,
    pub checksum: Option<&'a Checksum>,
    pub sniff: bool,
}

#[derive(Debug, Default)]
pub struct ChunkOutcome {
    pub written: u64,
    pub sniffed: Option<String>,
}

#[derive(Debug)]
pub enum ChunkError {
    /// The client went away or the write was cancelled.
    Aborted { written: u64 },
    /// The chunk is invalid or the disk write failed.
    Failed { written: u64, error: UploadError },
}

impl ChunkError {
    fn failed(written: u64, error: UploadError) -> Self {
        Self::Failed { written, error }
    }
}

/// Copy `body` into `out`, enforcing `limits`.
pub async fn write_chunk<W>(
    out: &mut W,
    mut body: BodyStream,
    limits: ChunkLimits<'_>,
    abort: Option<&CancellationToken>,
) -> Result<ChunkOutcome, ChunkError>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut hasher = limits.checksum.map(|c| c.algorithm.hasher());
    let mut prefix = limits.sniff.then(|| Vec::with_capacity(SNIFF_LEN));
    let mut outcome = ChunkOutcome::default();
    let mut received: u64 = 0;

    loop {
        let next = match abort {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(written = outcome.written, "chunk write cancelled");
                    return Err(ChunkError::Aborted { written: outcome.written });
                }
                item = body.next() => item,
            },
            None => body.next().await,
        };
        let chunk = match next {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                debug!(error = %err, written = outcome.written, "request stream ended early");
                return Err(ChunkError::Aborted { written: outcome.written });
            }
        };

        received += chunk.len() as u64;
        if limits.content_length.is_some_and(|limit| received > limit) {
            return Err(ChunkError::failed(
                outcome.written,
                UploadError::with_message(
                    ErrorCode::RequestEntityTooLarge,
                    "chunk is larger than its declared length",
                ),
            ));
        }
        if limits.ceiling.is_some_and(|ceiling| received > ceiling) {
            return Err(ChunkError::failed(
                outcome.written,
                UploadError::with_message(
                    ErrorCode::RequestEntityTooLarge,
                    "upload exceeds the maximum size",
                ),
            ));
        }
        if limits.room.is_some_and(|room| received > room) {
            return Err(ChunkError::failed(
                outcome.written,
                UploadError::conflict("write exceeds the declared upload size"),
            ));
        }
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&chunk);
        }

        match prefix.as_mut() {
            Some(buf) => {
                buf.extend_from_slice(&chunk);
                if buf.len() >= SNIFF_LEN {
                    let buf = prefix.take().unwrap_or_default();
                    outcome.sniffed = sniff(&buf);
                    write_all(out, &buf, &mut outcome).await?;
                }
            }
            None => write_all(out, &chunk, &mut outcome).await?,
        }
    }

    if let Some(limit) = limits.content_length.filter(|&limit| received < limit) {
        debug!(received, limit, written = outcome.written, "request body shorter than declared");
        if let Some(buf) = prefix.take() {
            write_all(out, &buf, &mut outcome).await?;
        }
        let _ = out.flush().await;
        return Err(ChunkError::Aborted { written: outcome.written });
    }

    if let Some(buf) = prefix.take() {
        if !buf.is_empty() {
            outcome.sniffed = sniff(&buf);
            write_all(out, &buf, &mut outcome).await?;
        }
    }
    out.flush()
        .await
        .map_err(|err| ChunkError::failed(outcome.written, err.into()))?;

    if let (Some(checksum), Some(hasher)) = (limits.checksum, hasher) {
        let digest = hasher.finalize();
        if !checksum.matches(&digest) {
            return Err(ChunkError::failed(
                outcome.written,
                UploadError::with_message(
                    ErrorCode::ChecksumMismatch,
                    format!("{} checksum mismatch", checksum.algorithm),
                ),
            ));
        }
    }
    Ok(outcome)
}

async fn write_all<W>(out: &mut W, data: &[u8], outcome: &mut ChunkOutcome) -> Result<(), ChunkError>
where
    W: AsyncWrite + Unpin + Send,
{
    out.write_all(data)
        .await
        .map_err(|err| ChunkError::failed(outcome.written, err.into()))?;
    outcome.written += data.len() as u64;
    Ok(())
}

/// Detect a content type from leading bytes.
pub fn sniff(prefix: &[u8]) -> Option<String> {
    infer::get(prefix).map(|kind| kind.mime_type().to_string())
}
