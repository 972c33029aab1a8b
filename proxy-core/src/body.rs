//! Request body capture/replay and the counting response body.

use crate::error::BodyCaptureError;
use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use http_body::{Body as _, Frame, SizeHint};
use http_body_util::BodyExt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

/// Outcome of reading a request body for inspection.
#[derive(Debug)]
pub struct CapturedBody {
    /// Bytes recorded on the transaction; empty when capture was skipped
    pub captured: Bytes,
    /// Body to hand downstream, carrying the same bytes the client sent
    pub forward: Body,
    /// Why capture was skipped, if it was
    pub skipped: Option<BodyCaptureError>,
}

impl CapturedBody {
    /// Captured bytes as text, invalid UTF-8 rendered lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.captured).into_owned()
    }
}

/// Read the request body for capture while keeping it available downstream.
///
/// * declared length at or above `limit`: nothing is read, the original
///   stream is forwarded untouched
/// * otherwise the body is buffered up to `limit` bytes; if it turns out to be
///   larger, the buffered prefix is forwarded followed by the rest of the
///   original stream and nothing is captured
/// * a read error forwards the bytes read so far and captures nothing
pub async fn capture(body: Body, declared_len: Option<u64>, limit: usize) -> CapturedBody {
    if let Some(len) = declared_len {
        if len >= limit as u64 {
            return CapturedBody {
                captured: Bytes::new(),
                forward: body,
                skipped: Some(BodyCaptureError::DeclaredTooLarge(len)),
            };
        }
    }

    let mut body = body;
    let mut buf = BytesMut::new();
    loop {
        match body.frame().await {
            None => {
                let captured = buf.freeze();
                return CapturedBody {
                    forward: Body::from(captured.clone()),
                    captured,
                    skipped: None,
                };
            }
            Some(Ok(frame)) => {
                // trailers are not forwarded
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                if buf.len() + data.len() > limit {
                    let seen = buf.len() + data.len();
                    debug!("Request body passed capture limit after {} bytes", seen);
                    let prefix = stream::iter([Ok::<Bytes, axum::Error>(buf.freeze()), Ok(data)]);
                    return CapturedBody {
                        captured: Bytes::new(),
                        forward: Body::from_stream(prefix.chain(body.into_data_stream())),
                        skipped: Some(BodyCaptureError::SizeLimitExceeded(seen)),
                    };
                }
                buf.extend_from_slice(&data);
            }
            Some(Err(e)) => {
                return CapturedBody {
                    captured: Bytes::new(),
                    forward: Body::from(buf.freeze()),
                    skipped: Some(BodyCaptureError::StreamReadError(e.to_string())),
                };
            }
        }
    }
}

type Completion = Box<dyn FnOnce(u64, bool) + Send>;

/// Response body that counts the bytes handed to the connection and reports
/// once when it is done.
///
/// The completion callback receives the byte count and whether the body was
/// abandoned before the end (client disconnect or a body error). It runs at
/// end of stream, or from `Drop` if the connection lets go of the body first.
pub struct ObservedBody {
    inner: Body,
    written: u64,
    completion: Option<Completion>,
}

impl ObservedBody {
    pub fn new<F>(inner: Body, completion: F) -> Self
    where
        F: FnOnce(u64, bool) + Send + 'static,
    {
        Self {
            inner,
            written: 0,
            completion: Some(Box::new(completion)),
        }
    }

    pub fn into_body(self) -> Body {
        Body::new(self)
    }

    fn finish(&mut self, aborted: bool) {
        if let Some(completion) = self.completion.take() {
            completion(self.written, aborted);
        }
    }
}

impl http_body::Body for ObservedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.written += data.len() as u64;
                }
                if this.inner.is_end_stream() {
                    this.finish(false);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish(true);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(false);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ObservedBody {
    fn drop(&mut self) {
        let aborted = !self.inner.is_end_stream();
        self.finish(aborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn chunked(parts: Vec<&'static str>) -> Body {
        Body::from_stream(stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<Bytes, std::io::Error>(Bytes::from_static(p.as_bytes()))),
        ))
    }

    async fn read_all(body: Body) -> Bytes {
        body.collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_small_body_is_captured_and_replayed() {
        let out = capture(Body::from("hello world"), Some(11), 1024).await;
        assert_eq!(out.text(), "hello world");
        assert!(out.skipped.is_none());
        assert_eq!(read_all(out.forward).await, Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn test_declared_large_body_passes_through() {
        let out = capture(Body::from("0123456789"), Some(10), 10).await;
        assert!(out.captured.is_empty());
        assert_eq!(out.skipped, Some(BodyCaptureError::DeclaredTooLarge(10)));
        assert_eq!(read_all(out.forward).await, Bytes::from("0123456789"));
    }

    #[tokio::test]
    async fn test_unknown_length_over_limit_forwards_everything() {
        let out = capture(chunked(vec!["abcd", "efgh", "ijkl"]), None, 6).await;
        assert!(out.captured.is_empty());
        assert_eq!(out.skipped, Some(BodyCaptureError::SizeLimitExceeded(8)));
        assert_eq!(read_all(out.forward).await, Bytes::from("abcdefghijkl"));
    }

    #[tokio::test]
    async fn test_unknown_length_under_limit_is_captured() {
        let out = capture(chunked(vec!["ab", "cd"]), None, 6).await;
        assert_eq!(out.text(), "abcd");
        assert_eq!(read_all(out.forward).await, Bytes::from("abcd"));
    }

    #[tokio::test]
    async fn test_read_error_keeps_prefix() {
        let parts: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let out = capture(Body::from_stream(stream::iter(parts)), None, 1024).await;
        assert!(out.captured.is_empty());
        assert!(matches!(
            out.skipped,
            Some(BodyCaptureError::StreamReadError(_))
        ));
        assert_eq!(read_all(out.forward).await, Bytes::from("partial"));
    }

    #[tokio::test]
    async fn test_non_utf8_is_lossy() {
        let out = capture(Body::from(vec![0x66, 0x6f, 0xff]), Some(3), 1024).await;
        assert_eq!(out.text(), "fo\u{fffd}");
    }

    #[tokio::test]
    async fn test_observed_body_reports_once_at_end() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();
        let body = ObservedBody::new(chunked(vec!["abc", "de"]), move |n, aborted| {
            c.lock().push((n, aborted))
        })
        .into_body();
        assert_eq!(read_all(body).await, Bytes::from("abcde"));
        assert_eq!(*calls.lock(), vec![(5, false)]);
    }

    #[tokio::test]
    async fn test_observed_body_dropped_early_is_aborted() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();
        let mut body = ObservedBody::new(chunked(vec!["abc", "de"]), move |n, aborted| {
            c.lock().push((n, aborted))
        });
        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from("abc"));
        drop(body);
        assert_eq!(*calls.lock(), vec![(3, true)]);
    }
}
