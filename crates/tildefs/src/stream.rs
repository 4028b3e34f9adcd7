//! Streams and iterators that keep their lock for as long as they live.
//!
//! Opening a stream and draining it happen at different times, so the lock
//! taken to open it travels inside the stream object and is released by the
//! stream's terminal event (EOF, shutdown, error, close or drop), never by
//! the call that created it.

use std::fmt;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::Stream;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::watch;

use crate::error::{FilestoreError, FilestoreResult};
use crate::filepath::Filepath;
use crate::lock::HeldLock;
use crate::realfs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Finished,
    Broken,
}

/// Write stream into the store.
///
/// Holds a write lock on its path until [`finish`](Self::finish) (or
/// `shutdown`) completes, or until it is dropped. Dropping an unfinished
/// stream marks it broken.
pub struct HeadStream {
    path: Filepath,
    file: Option<fs::File>,
    lock: Option<HeldLock>,
    state: watch::Sender<StreamState>,
    written: u64,
}

impl fmt::Debug for HeadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadStream")
            .field("path", &self.path)
            .field("written", &self.written)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl HeadStream {
    pub(crate) fn new(path: Filepath, file: fs::File, lock: HeldLock) -> Self {
        tracing::debug!(path = %path, "head stream opened");
        let (state, _) = watch::channel(StreamState::Open);
        Self {
            path,
            file: Some(file),
            lock: Some(lock),
            state,
            written: 0,
        }
    }

    pub fn path(&self) -> &Filepath {
        &self.path
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// A handle resolving when this stream reaches its terminal state.
    pub fn completion(&self) -> StreamCompletion {
        StreamCompletion {
            rx: self.state.subscribe(),
        }
    }

    /// Flush, close, and release the lock. Returns the byte count.
    pub async fn finish(mut self) -> FilestoreResult<u64> {
        self.shutdown()
            .await
            .map_err(|e| FilestoreError::io("finish", self.path.resolve(), e))?;
        Ok(self.written)
    }

    fn terminate(&mut self, state: StreamState) {
        if *self.state.borrow() != StreamState::Open {
            return;
        }
        self.file = None;
        self.lock = None;
        self.state.send_replace(state);
        tracing::debug!(path = %self.path, written = self.written, ?state, "head stream closed");
    }

    fn closed_error(&self) -> io::Error {
        FilestoreError::broken_stream(format!("head stream for {} is closed", self.path)).into()
    }
}

impl AsyncWrite for HeadStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Err(this.closed_error()));
        };
        match ready!(Pin::new(file).poll_write(cx, buf)) {
            Ok(n) => {
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            Err(e) => {
                this.terminate(StreamState::Broken);
                Poll::Ready(Err(e))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(Pin::new(file).poll_flush(cx));
        if result.is_err() {
            this.terminate(StreamState::Broken);
        }
        Poll::Ready(result)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(Pin::new(file).poll_shutdown(cx));
        match result {
            Ok(()) => this.terminate(StreamState::Finished),
            Err(_) => this.terminate(StreamState::Broken),
        }
        Poll::Ready(result)
    }
}

impl Drop for HeadStream {
    fn drop(&mut self) {
        if *self.state.borrow() == StreamState::Open {
            tracing::warn!(path = %self.path, written = self.written, "head stream dropped before finish");
            self.terminate(StreamState::Broken);
        }
    }
}

/// Awaits a [`HeadStream`]'s terminal state from anywhere.
#[derive(Debug, Clone)]
pub struct StreamCompletion {
    rx: watch::Receiver<StreamState>,
}

impl StreamCompletion {
    /// Whether the stream has finished or broken.
    pub fn is_done(&self) -> bool {
        *self.rx.borrow() != StreamState::Open
    }

    /// Resolve once the stream's lock is released. Errors with
    /// [`FilestoreError::BrokenStream`] if the stream did not finish cleanly.
    pub async fn wait(mut self) -> FilestoreResult<()> {
        let _ = self.rx.wait_for(|state| *state != StreamState::Open).await;
        let state = *self.rx.borrow();
        match state {
            StreamState::Finished => Ok(()),
            StreamState::Open | StreamState::Broken => Err(FilestoreError::broken_stream(
                "stream closed before it finished",
            )),
        }
    }
}

enum TailSource {
    File(fs::File),
    Listing(Cursor<Vec<u8>>),
    Empty,
}

/// Read stream out of the store.
///
/// For a leaf this reads the stored bytes and holds a read lock until EOF,
/// [`close`](Self::close) or drop. For a node it yields the JSON array of
/// child names; for a missing path it is empty.
pub struct TailStream {
    path: Filepath,
    source: TailSource,
    lock: Option<HeldLock>,
}

impl fmt::Debug for TailStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.source {
            TailSource::File(_) => "file",
            TailSource::Listing(_) => "listing",
            TailSource::Empty => "empty",
        };
        f.debug_struct("TailStream")
            .field("path", &self.path)
            .field("source", &source)
            .field("locked", &self.lock.is_some())
            .finish()
    }
}

impl TailStream {
    pub(crate) fn file(path: Filepath, file: fs::File, lock: HeldLock) -> Self {
        tracing::debug!(path = %path, "tail stream opened");
        Self {
            path,
            source: TailSource::File(file),
            lock: Some(lock),
        }
    }

    pub(crate) fn listing(path: Filepath, json: Vec<u8>) -> Self {
        Self {
            path,
            source: TailSource::Listing(Cursor::new(json)),
            lock: None,
        }
    }

    pub(crate) fn empty(path: Filepath) -> Self {
        Self {
            path,
            source: TailSource::Empty,
            lock: None,
        }
    }

    pub fn path(&self) -> &Filepath {
        &self.path
    }

    /// Whether the stream still holds its read lock.
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Abandon the stream and release its lock.
    pub fn close(self) {}

    /// Drain the stream into memory.
    pub async fn read_all(mut self) -> FilestoreResult<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)
            .await
            .map_err(|e| FilestoreError::io("read", self.path.resolve(), e))?;
        Ok(out)
    }

    fn release(&mut self) {
        if self.lock.take().is_some() {
            tracing::debug!(path = %self.path, "tail stream closed");
        }
        self.source = TailSource::Empty;
    }
}

impl AsyncRead for TailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let wanted = buf.remaining() > 0;
        let before = buf.filled().len();

        let result = match &mut this.source {
            TailSource::File(file) => ready!(Pin::new(file).poll_read(cx, buf)),
            TailSource::Listing(cursor) => ready!(Pin::new(cursor).poll_read(cx, buf)),
            TailSource::Empty => Ok(()),
        };

        match &result {
            Ok(()) if wanted && buf.filled().len() == before => this.release(),
            Ok(()) => {}
            Err(_) => this.release(),
        }
        Poll::Ready(result)
    }
}

/// One-pass iterator over a node's child names.
///
/// Holds a read lock on the node for its whole life; the lock goes once the
/// listing is exhausted, on error, on [`close`](Self::close), or on drop.
pub struct NodeIter<T> {
    path: Filepath,
    dir: Option<fs::ReadDir>,
    map: Box<dyn FnMut(String) -> T + Send>,
    lock: Option<HeldLock>,
}

impl<T> fmt::Debug for NodeIter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIter")
            .field("path", &self.path)
            .field("locked", &self.lock.is_some())
            .finish()
    }
}

impl<T> NodeIter<T> {
    pub(crate) fn new(
        path: Filepath,
        dir: Option<fs::ReadDir>,
        map: Box<dyn FnMut(String) -> T + Send>,
        lock: HeldLock,
    ) -> Self {
        let lock = dir.is_some().then_some(lock);
        Self {
            path,
            dir,
            map,
            lock,
        }
    }

    pub fn path(&self) -> &Filepath {
        &self.path
    }

    /// Whether the iterator still holds its read lock.
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Next mapped child name, or `None` once exhausted.
    pub async fn next(&mut self) -> FilestoreResult<Option<T>> {
        loop {
            let Some(dir) = self.dir.as_mut() else {
                return Ok(None);
            };
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    let Ok(name) = entry.file_name().into_string() else {
                        continue;
                    };
                    if realfs::is_hidden(&name) {
                        continue;
                    }
                    return Ok(Some((self.map)(name)));
                }
                Ok(None) => {
                    self.finish();
                    return Ok(None);
                }
                Err(e) => {
                    self.finish();
                    return Err(FilestoreError::io("read_dir", self.path.resolve(), e));
                }
            }
        }
    }

    /// Stop early and release the lock.
    pub fn close(self) {}

    /// Drain the rest into a `Vec`.
    pub async fn collect(mut self) -> FilestoreResult<Vec<T>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await? {
            out.push(item);
        }
        Ok(out)
    }

    fn finish(&mut self) {
        self.dir = None;
        self.lock = None;
    }
}

impl<T: Send + 'static> NodeIter<T> {
    /// Adapt into a [`Stream`]. The lock lives as long as the stream.
    pub fn into_stream(self) -> impl Stream<Item = FilestoreResult<T>> + Send {
        futures::stream::unfold(self, |mut iter| async move {
            match iter.next().await {
                Ok(Some(item)) => Some((Ok(item), iter)),
                Ok(None) => None,
                Err(e) => Some((Err(e), iter)),
            }
        })
    }
}
