//! Response body interception
//!
//! The client receives every chunk as soon as the provider sends it. A copy
//! of the decoded text is kept for the finalizer and the cache writer, which
//! wait for the stream to reach exactly one terminal state.

use crate::proxy::types::{BodyStream, BoxError, FORCE_FORMAT_MIN_CHUNK};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::Stream;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// How long a consumer waits for a stream before giving up
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Done,
    Cancel,
    Timeout,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Cancel => "cancel",
            Self::Timeout => "timeout",
        }
    }
}

/// Everything the client was sent, once the body reached a terminal state
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedStream {
    pub body: Vec<String>,
    pub reason: CompletionReason,
    pub end_time: DateTime<Utc>,
    /// Only tracked for streamed responses
    pub first_chunk_time: Option<DateTime<Utc>>,
}

impl CompletedStream {
    pub fn body_text(&self) -> String {
        self.body.concat()
    }
}

#[derive(Debug, Default)]
struct Capture {
    pending: Vec<u8>,
    body: Vec<String>,
    first_chunk_time: Option<DateTime<Utc>>,
}

impl Capture {
    /// Decodes as much of `pending` as forms complete UTF-8
    fn decode(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        let decoded = match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_owned();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                // Incomplete sequence at the end; keep it for the next chunk
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        };
        if !decoded.is_empty() {
            self.body.push(decoded);
        }
    }

    fn snapshot(&mut self, reason: CompletionReason) -> CompletedStream {
        if !self.pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.body.push(rest);
        }
        CompletedStream {
            body: self.body.clone(),
            reason,
            end_time: Utc::now(),
            first_chunk_time: self.first_chunk_time,
        }
    }
}

#[derive(Debug)]
struct Shared {
    capture: Mutex<Capture>,
    completion: watch::Sender<Option<CompletedStream>>,
    is_stream: bool,
}

impl Shared {
    fn push(&self, chunk: &[u8]) {
        let mut capture = self.capture.lock();
        if self.is_stream && capture.first_chunk_time.is_none() {
            capture.first_chunk_time = Some(Utc::now());
        }
        capture.decode(chunk);
    }

    /// Records the terminal state; the first caller wins
    fn complete(&self, reason: CompletionReason) -> CompletedStream {
        let mut capture = self.capture.lock();
        self.completion.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            debug!(reason = reason.as_str(), "Response stream completed");
            *slot = Some(capture.snapshot(reason));
            true
        });
        drop(capture);

        self.completion
            .borrow()
            .clone()
            .unwrap_or_else(|| CompletedStream {
                body: Vec::new(),
                reason,
                end_time: Utc::now(),
                first_chunk_time: None,
            })
    }
}

/// Marks the stream cancelled if the body is dropped before it finished
#[derive(Debug)]
struct CancelGuard(Arc<Shared>);

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.complete(CompletionReason::Cancel);
    }
}

pin_project! {
    /// Body handed to the client; mirrors chunks into the interceptor
    pub struct InterceptedBody {
        #[pin]
        inner: BodyStream,
        guard: CancelGuard,
    }
}

impl Stream for InterceptedBody {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.guard.0.push(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // The upstream reader is gone; the client sees a truncated body
                this.guard.0.complete(CompletionReason::Cancel);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.guard.0.complete(CompletionReason::Done);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Handle for consumers that need the full body once the client has it
#[derive(Debug, Clone)]
pub struct StreamInterceptor {
    shared: Arc<Shared>,
}

impl StreamInterceptor {
    /// Wraps `body`; the returned stream must be sent to the client
    pub fn wrap(body: BodyStream, is_stream: bool) -> (Self, InterceptedBody) {
        let (completion, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            capture: Mutex::new(Capture::default()),
            completion,
            is_stream,
        });

        let body = InterceptedBody {
            inner: body,
            guard: CancelGuard(shared.clone()),
        };
        (Self { shared }, body)
    }

    /// Interceptor that is already complete, for bodies the gateway made up
    pub fn completed(body: &str) -> Self {
        let empty: BodyStream = Box::pin(futures_util::stream::empty());
        let (interceptor, intercepted) = Self::wrap(empty, false);
        intercepted.guard.0.push(body.as_bytes());
        interceptor.shared.complete(CompletionReason::Done);
        interceptor
    }

    pub fn completion(&self) -> Option<CompletedStream> {
        self.shared.completion.borrow().clone()
    }

    pub async fn wait_for_stream(&self) -> CompletedStream {
        self.wait_for_stream_within(DEFAULT_STREAM_TIMEOUT).await
    }

    /// Waits for the terminal state; after `timeout` the stream is declared
    /// timed out with whatever was buffered so far
    pub async fn wait_for_stream_within(&self, timeout: Duration) -> CompletedStream {
        let mut receiver = self.shared.completion.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            receiver
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|completion| completion.clone())
        })
        .await;

        match waited {
            Ok(Some(completion)) => completion,
            _ => self.shared.complete(CompletionReason::Timeout),
        }
    }
}

pin_project! {
    /// Holds back short chunks and merges them into the next one
    pub struct ForceFormat {
        #[pin]
        inner: BodyStream,
        held: BytesMut,
        finished: bool,
    }
}

impl ForceFormat {
    pub fn new(inner: BodyStream) -> Self {
        Self {
            inner,
            held: BytesMut::new(),
            finished: false,
        }
    }
}

impl Stream for ForceFormat {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }

        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.held.extend_from_slice(&chunk);
                    if this.held.len() >= FORCE_FORMAT_MIN_CHUNK {
                        return Poll::Ready(Some(Ok(this.held.split().freeze())));
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    *this.finished = true;
                    if this.held.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Ok(this.held.split().freeze())));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
