//! HTTP Range header parsing and stream slicing.

use std::io;

use bytes::Bytes;
use futures::{Stream, StreamExt};

/// A validated byte range with an inclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a blob of `total` bytes.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Parse a `Range` header against a known total size.
///
/// Supports `bytes=start-end`, `bytes=start-`, and the suffix form
/// `bytes=-n` (last `n` bytes, clamped to the blob). Returns `None` for
/// anything unsatisfiable: the caller answers 416.
pub fn parse_range(header: &str, total: u64) -> Option<ByteRange> {
    let spec = header.trim().strip_prefix("bytes=")?.trim();

    if total == 0 {
        return None;
    }

    // Suffix range: last n bytes.
    if let Some(suffix) = spec.strip_prefix('-') {
        let n: u64 = suffix.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some(ByteRange {
            start: total.saturating_sub(n),
            end: total - 1,
        });
    }

    let (start_str, end_str) = spec.split_once('-')?;
    let start: u64 = start_str.parse().ok()?;
    if start >= total {
        return None;
    }

    let end = if end_str.is_empty() {
        total - 1
    } else {
        let end: u64 = end_str.parse().ok()?;
        if end >= total || start > end {
            return None;
        }
        end
    };

    Some(ByteRange { start, end })
}

/// Slice a chunk stream to `[range.start, range.end]`.
///
/// Bytes before the window are discarded, the window is emitted, and the
/// underlying stream is dropped as soon as the window is satisfied.
pub fn slice_stream<S>(stream: S, range: ByteRange) -> impl Stream<Item = io::Result<Bytes>>
where
    S: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
{
    futures::stream::unfold(
        (Some(stream), range.start, range.len()),
        |(mut stream, mut skip, mut remaining)| async move {
            if remaining == 0 {
                return None;
            }
            let s = stream.as_mut()?;
            loop {
                match s.next().await {
                    None => return None,
                    Some(Err(e)) => return Some((Err(e), (None, skip, 0))),
                    Some(Ok(chunk)) => {
                        let len = chunk.len() as u64;
                        if len <= skip {
                            skip -= len;
                            continue;
                        }

                        let mut piece = chunk.slice(skip as usize..);
                        skip = 0;
                        if piece.len() as u64 > remaining {
                            piece = piece.slice(..remaining as usize);
                        }
                        remaining -= piece.len() as u64;

                        // Cancel the source once satisfied.
                        let next_stream = if remaining == 0 { None } else { stream };
                        return Some((Ok(piece), (next_stream, skip, remaining)));
                    }
                }
            }
        },
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
