//! In-memory response sink.
//!
//! Replay dispatches through the normal proxy path, but the caller is an
//! operator rather than a socket; the upstream exchange is drained into
//! this minimal recorder and the operator reads the flow instead.

use axum::body::Body;
use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use http_body_util::BodyExt;

/// Recorded status, headers, and body of an internally dispatched response.
#[derive(Debug)]
pub struct ResponseRecorder {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseRecorder {
    /// Consume `response`, buffering its body to completion.
    pub async fn record(response: Response<Body>) -> Result<ResponseRecorder, axum::Error> {
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(ResponseRecorder {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_status_headers_and_body() {
        let mut response = Response::new(Body::from("payload"));
        *response.status_mut() = StatusCode::CREATED;
        response
            .headers_mut()
            .insert("x-test", "yes".parse().unwrap());

        let recorded = ResponseRecorder::record(response).await.unwrap();
        assert_eq!(recorded.status, StatusCode::CREATED);
        assert_eq!(recorded.headers["x-test"], "yes");
        assert_eq!(&recorded.body[..], b"payload");
    }
}
