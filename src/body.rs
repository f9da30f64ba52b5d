//! Served response body: always a single fully-buffered frame. The caching
//! transport buffers every upstream response (to decide cacheability and,
//! when storing, to serialize it) before it can hand anything back, so the
//! response body type it exposes is buffered too.

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame};
use std::pin::Pin;
use std::task::{Context, Poll};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Distinguishes a body served from cache from one just fetched upstream,
/// purely for callers that want to branch on it (e.g. access logging);
/// both poll identically.
#[derive(Debug)]
pub enum ResponseBody {
    Hit(Bytes),
    Fetched(Bytes),
}

impl HttpBody for ResponseBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let bytes = match &mut *self {
            ResponseBody::Hit(b) | ResponseBody::Fetched(b) => std::mem::take(b),
        };
        if bytes.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Ready(Some(Ok(Frame::data(bytes))))
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            ResponseBody::Hit(b) | ResponseBody::Fetched(b) => b.is_empty(),
        }
    }
}
