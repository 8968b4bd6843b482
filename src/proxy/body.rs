//! Bounded body capture with pass-through streaming.
//!
//! Capture must retain at most the configured limit while the peer still
//! receives the entire payload. Once a stream has been read it has no
//! resettable position, so the captured prefix is stitched back onto the
//! unread remainder of the stream.

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;

/// Result of a bounded capture.
pub(crate) struct CapturedBody {
    /// At most `limit` bytes of the payload.
    pub bytes: Bytes,
    /// Whether the source held more than `limit` bytes.
    pub truncated: bool,
    /// A body carrying the identical full payload, to be forwarded in
    /// place of the consumed original.
    pub replacement: Body,
}

/// Read up to `limit` bytes of `body`. The transport does not report total
/// length for chunked payloads, so truncation is detected by reading past
/// the limit: anything beyond it stays unread and is chained behind the
/// buffered prefix in the replacement body.
pub(crate) async fn capture(body: Body, limit: usize) -> Result<CapturedBody, axum::Error> {
    let mut stream = body.into_data_stream();
    let mut buffered = BytesMut::new();
    let mut truncated = false;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffered.extend_from_slice(&chunk);
        if buffered.len() > limit {
            truncated = true;
            break;
        }
    }

    let buffered = buffered.freeze();
    if truncated {
        let bytes = buffered.slice(..limit);
        let prefix = futures::stream::once(async move { Ok::<_, axum::Error>(buffered) });
        Ok(CapturedBody {
            bytes,
            truncated: true,
            replacement: Body::from_stream(prefix.chain(stream)),
        })
    } else {
        Ok(CapturedBody {
            bytes: buffered.clone(),
            truncated: false,
            replacement: Body::from(buffered),
        })
    }
}
