//! Bounded, non-intrusive body capture.
//!
//! Capture is a side-channel tap: bytes flow to their real consumer untouched
//! and a copy (up to `max_bytes`) is kept for telemetry. Once the cap is hit
//! further bytes are still forwarded but no longer buffered, and the buffer is
//! flagged as truncated.
//!
//! Three taps share the same [`CaptureBuffer`]:
//!
//! - [`CaptureReader`] wraps a blocking `Read` (request bodies).
//! - [`CaptureWriter`] wraps a blocking `Write` (response bodies).
//! - [`CaptureBody`] wraps an `http_body::Body` for async hosts.
//!
//! Tap failures never change what the original consumer sees: an I/O error
//! from the wrapped stream is returned to the caller exactly as produced, and
//! capture simply stops with whatever it had so far.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::future::Future;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};

/// Default capture cap: 2 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Initial allocation for a capture buffer; grows on demand up to the cap.
const INITIAL_CAPACITY: usize = 1024;

/// Size-limited byte accumulator for one request or response body.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    bytes: Vec<u8>,
    max_bytes: usize,
    truncated: bool,
    failed: bool,
    total_bytes: u64,
}

impl CaptureBuffer {
    /// Create an empty buffer that keeps at most `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(max_bytes.min(INITIAL_CAPACITY)),
            max_bytes,
            truncated: false,
            failed: false,
            total_bytes: 0,
        }
    }

    /// Create a buffer holding an already-materialized body.
    ///
    /// The cap still applies: anything past `max_bytes` is dropped.
    pub fn from_slice(body: &[u8], max_bytes: usize) -> Self {
        let mut buffer = Self::new(max_bytes);
        buffer.write(body);
        buffer
    }

    /// Append a chunk, keeping only what fits under the cap.
    pub fn write(&mut self, chunk: &[u8]) {
        self.total_bytes += chunk.len() as u64;

        if self.failed || self.truncated || chunk.is_empty() {
            return;
        }

        let remaining = self.max_bytes - self.bytes.len();
        if chunk.len() > remaining {
            self.bytes.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
            // A cut JSON document no longer parses, so it cannot be masked.
            tracing::debug!(
                max_bytes = self.max_bytes,
                "Body exceeds capture limit, truncating; a truncated JSON body is sent as unmasked text"
            );
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }

    /// Stop capturing after a stream error. The bytes read so far are kept.
    pub fn fail(&mut self) {
        self.failed = true;
    }

    /// Captured bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of captured bytes (never more than [`max_bytes`](Self::max_bytes)).
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns `true` if bytes were dropped because of the cap.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Returns `true` if capture stopped because the stream failed.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Total number of bytes that went through the tap, captured or not.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// The configured cap.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Consume the buffer, returning the captured bytes.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.bytes)
    }
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_BYTES)
    }
}

/// Read tap: forwards every byte to the caller and keeps a bounded copy.
///
/// ```
/// use rustapi_telemetry::capture::CaptureReader;
/// use std::io::Read;
///
/// let mut reader = CaptureReader::new(&b"hello world"[..], 5);
/// let mut out = String::new();
/// reader.read_to_string(&mut out).unwrap();
///
/// assert_eq!(out, "hello world");
/// assert_eq!(reader.buffer().as_bytes(), b"hello");
/// assert!(reader.buffer().is_truncated());
/// ```
#[derive(Debug)]
pub struct CaptureReader<R> {
    inner: R,
    buffer: CaptureBuffer,
}

impl<R> CaptureReader<R> {
    /// Wrap `inner`, capturing at most `max_bytes`.
    pub fn new(inner: R, max_bytes: usize) -> Self {
        Self {
            inner,
            buffer: CaptureBuffer::new(max_bytes),
        }
    }

    /// The capture so far.
    pub fn buffer(&self) -> &CaptureBuffer {
        &self.buffer
    }

    /// Split into the wrapped reader and the capture.
    pub fn into_parts(self) -> (R, CaptureBuffer) {
        (self.inner, self.buffer)
    }
}

impl<R: Read> Read for CaptureReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(n) => {
                self.buffer.write(&buf[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "Request body read failed, capture stopped");
                self.buffer.fail();
                Err(e)
            }
        }
    }
}

/// Write tap: the wrapped writer receives every byte, unconditionally.
///
/// Only the bytes the inner writer actually accepted are captured, so a
/// short write never records data the client did not get.
#[derive(Debug)]
pub struct CaptureWriter<W> {
    inner: W,
    buffer: CaptureBuffer,
}

impl<W> CaptureWriter<W> {
    /// Wrap `inner`, capturing at most `max_bytes`.
    pub fn new(inner: W, max_bytes: usize) -> Self {
        Self {
            inner,
            buffer: CaptureBuffer::new(max_bytes),
        }
    }

    /// The capture so far.
    pub fn buffer(&self) -> &CaptureBuffer {
        &self.buffer
    }

    /// Split into the wrapped writer and the capture.
    pub fn into_parts(self) -> (W, CaptureBuffer) {
        (self.inner, self.buffer)
    }
}

impl<W: Write> Write for CaptureWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.write(buf) {
            Ok(n) => {
                self.buffer.write(&buf[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "Response body write failed, capture stopped");
                self.buffer.fail();
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A capture buffer shared between a body tap and the code that reads it
/// once the exchange is over.
#[derive(Debug, Clone)]
pub struct SharedCapture {
    inner: Arc<Mutex<CaptureBuffer>>,
}

impl SharedCapture {
    /// Create an empty shared buffer capped at `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CaptureBuffer::new(max_bytes))),
        }
    }

    /// Append a chunk.
    pub fn record(&self, chunk: &[u8]) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(chunk);
    }

    /// Mark the capture as failed.
    pub fn fail(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail();
    }

    /// Copy of the current capture.
    pub fn snapshot(&self) -> CaptureBuffer {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Take the capture out, leaving an empty buffer with the same cap.
    pub fn take(&self) -> CaptureBuffer {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let max_bytes = guard.max_bytes();
        std::mem::replace(&mut *guard, CaptureBuffer::new(max_bytes))
    }
}

/// Hook invoked once when a tapped body is finished.
///
/// The returned future is driven by the body itself when the stream ends
/// normally, so any work it does (e.g. a caller-runs dispatch) is absorbed by
/// the task that is serving the response. On error or early drop it is
/// detached onto the current runtime instead.
pub type CompletionHook = Box<dyn FnOnce(CaptureBuffer) -> BoxFuture<'static, ()> + Send>;

enum Completion {
    Idle,
    Armed(SharedCapture, CompletionHook),
    Running(BoxFuture<'static, ()>),
    Done,
}

impl Completion {
    fn is_pending(&self) -> bool {
        matches!(self, Completion::Armed(..) | Completion::Running(_))
    }

    /// Start the hook, if armed. Returns the future to drive.
    fn start(&mut self) -> Option<BoxFuture<'static, ()>> {
        match std::mem::replace(self, Completion::Done) {
            Completion::Armed(capture, hook) => Some(hook(capture.take())),
            Completion::Running(fut) => Some(fut),
            Completion::Idle => {
                *self = Completion::Idle;
                None
            }
            Completion::Done => None,
        }
    }

    /// Run the hook in the background; used when the body cannot drive it.
    fn detach(&mut self) {
        if let Some(fut) = self.start() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(fut);
                }
                Err(_) => {
                    tracing::debug!("No runtime available, dropping telemetry for aborted body");
                }
            }
        }
    }
}

pin_project! {
    /// An `http_body::Body` tap.
    ///
    /// Data frames are forwarded as-is and copied into a [`SharedCapture`];
    /// trailers and errors pass through untouched.
    pub struct CaptureBody<B> {
        #[pin]
        inner: B,
        capture: Option<SharedCapture>,
        completion: Completion,
    }

    impl<B> PinnedDrop for CaptureBody<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            this.completion.detach();
        }
    }
}

impl<B> CaptureBody<B> {
    /// Forward the body without capturing anything.
    pub fn passthrough(inner: B) -> Self {
        Self {
            inner,
            capture: None,
            completion: Completion::Idle,
        }
    }

    /// Forward the body and copy its data frames into `capture`.
    pub fn tap(inner: B, capture: SharedCapture) -> Self {
        Self {
            inner,
            capture: Some(capture),
            completion: Completion::Idle,
        }
    }

    /// Forward and capture the body, then run `hook` with the capture once
    /// the body is finished.
    pub fn tap_with_hook(inner: B, capture: SharedCapture, hook: CompletionHook) -> Self {
        Self {
            inner,
            capture: Some(capture.clone()),
            completion: Completion::Armed(capture, hook),
        }
    }

    /// Returns `true` if this body copies its data.
    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }
}

impl<B> Body for CaptureBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        if let Completion::Running(fut) = this.completion {
            ready!(fut.as_mut().poll(cx));
            *this.completion = Completion::Done;
            return Poll::Ready(None);
        }

        match ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let (Some(capture), Some(data)) = (this.capture.as_ref(), frame.data_ref()) {
                    capture.record(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => {
                if let Some(capture) = this.capture.as_ref() {
                    capture.fail();
                }
                this.completion.detach();
                Poll::Ready(Some(Err(err)))
            }
            None => match this.completion.start() {
                Some(mut fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready(()) => Poll::Ready(None),
                    Poll::Pending => {
                        *this.completion = Completion::Running(fut);
                        Poll::Pending
                    }
                },
                None => Poll::Ready(None),
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        // Keep the consumer polling until the completion hook has run.
        !self.completion.is_pending() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: std::fmt::Debug> std::fmt::Debug for CaptureBody<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureBody")
            .field("inner", &self.inner)
            .field("capturing", &self.capture.is_some())
            .field("completion_pending", &self.completion.is_pending())
            .finish()
    }
}
