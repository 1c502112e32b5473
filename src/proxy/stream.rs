//! Response scrubbing: keeps the upstream secret out of relayed headers and
//! bodies without buffering the whole body.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::HeaderMap;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{ready, Stream, StreamExt};
use zeroize::Zeroizing;

use super::upstream::HOP_BY_HOP;

const MASK: &[u8] = b"****";

/// Copy of `headers` without hop-by-hop headers, `content-length` (the body
/// may shrink or grow when scrubbed) and any header whose value contains
/// `secret`.
pub fn scrub_headers(headers: &HeaderMap, secret: &str) -> HeaderMap {
    let needle = secret.as_bytes();
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let lower = name.as_str();
        if lower == "content-length" || HOP_BY_HOP.contains(&lower) {
            continue;
        }
        if !needle.is_empty() && contains(value.as_bytes(), needle) {
            tracing::warn!(header = %name, "dropped upstream header echoing the credential");
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Wrap `body` so every occurrence of `secret` is replaced with `****`,
/// including occurrences split across chunk boundaries.
pub fn scrub_body(body: Body, secret: &str) -> Body {
    if secret.is_empty() {
        return body;
    }
    Body::from_stream(ScrubSecret::new(body.into_data_stream().boxed(), secret))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

struct ScrubSecret<E> {
    inner: BoxStream<'static, Result<Bytes, E>>,
    needle: Zeroizing<Vec<u8>>,
    /// Unemitted tail, always shorter than the needle between polls.
    carry: Vec<u8>,
    done: bool,
}

impl<E> ScrubSecret<E> {
    fn new(inner: BoxStream<'static, Result<Bytes, E>>, secret: &str) -> Self {
        Self {
            inner,
            needle: Zeroizing::new(secret.as_bytes().to_vec()),
            carry: Vec::new(),
            done: false,
        }
    }

    /// Emit everything that can no longer be the start of a match.
    fn drain(&mut self, flush: bool) -> Bytes {
        let n = self.needle.len();
        let mut out = Vec::with_capacity(self.carry.len());
        let mut i = 0;
        while i + n <= self.carry.len() {
            if self.carry[i..i + n] == self.needle[..] {
                out.extend_from_slice(MASK);
                i += n;
            } else {
                out.push(self.carry[i]);
                i += 1;
            }
        }
        if flush {
            out.extend_from_slice(&self.carry[i..]);
            self.carry.clear();
        } else {
            self.carry.drain(..i);
        }
        Bytes::from(out)
    }
}

impl<E> Stream for ScrubSecret<E> {
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => {
                    this.carry.extend_from_slice(&chunk);
                    let out = this.drain(false);
                    if !out.is_empty() {
                        return Poll::Ready(Some(Ok(out)));
                    }
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => {
                    this.done = true;
                    let out = this.drain(true);
                    if out.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Ok(out)));
                }
            }
        }
    }
}
