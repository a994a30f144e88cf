// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Bridging the engine's blocking NAR serializer to async consumers.
//!
//! The serializer runs on Tokio's blocking pool and writes into a
//! [`ChannelWriter`], which cuts the output into chunks and sends them over a
//! bounded channel. A full channel parks the producer thread, which is how
//! back-pressure reaches it. The producer always finishes with exactly one
//! terminal message, [`Message::Done`] or [`Message::Failed`], unless the
//! consumer has already gone away.

use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use futures::stream::FusedStream;
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, debug_span, error, warn};

use crate::base32;
use crate::engine::{EngineError, StoreEngine};
use crate::error::{Error, Result};
use crate::store_path::StorePath;

pub(crate) enum Message {
    Chunk(Bytes),
    Done,
    Failed(Error),
}

/// A blocking [`Write`] that sends fixed-size [`Bytes`] chunks through a
/// bounded channel.
///
/// Bytes still buffered when the producer fails are dropped; they are never
/// sent.
struct ChannelWriter {
    tx: mpsc::Sender<Message>,
    buffer: BytesMut,
    chunk_size: usize,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<Message>, chunk_size: usize) -> Self {
        Self {
            tx,
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
        }
    }

    /// Send the buffered bytes as one chunk, blocking while the channel is
    /// full.
    fn emit(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split().freeze();
        self.tx
            .blocking_send(Message::Chunk(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer went away"))
    }

    fn consumer_gone(&self) -> bool {
        self.tx.is_closed()
    }

    fn finish(self, message: Message) {
        if self.tx.blocking_send(message).is_err() {
            debug!("archive consumer went away before the terminal message");
        }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.buffer.len() >= self.chunk_size {
            self.emit()?;
        }
        let n = buf.len().min(self.chunk_size - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit()
    }
}

/// Start serializing `path` on the blocking pool of the current Tokio
/// runtime. Outside a runtime this fails with [`Error::StoreUnavailable`].
pub(crate) fn spawn_archive(
    engine: Arc<dyn StoreEngine>,
    path: StorePath,
    chunk_size: usize,
    channel_capacity: usize,
) -> Result<NarStream> {
    let runtime = Handle::try_current()
        .map_err(|e| Error::unavailable(format!("cannot stream {path}: {e}")))?;
    let (tx, rx) = mpsc::channel(channel_capacity);
    let span = debug_span!("nar_from_path", path = %path);
    let stream_path = path.clone();

    runtime.spawn_blocking(move || {
        let _entered = span.enter();
        let mut writer = ChannelWriter::new(tx, chunk_size);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            engine.nar_from_path(&path, &mut writer)?;
            writer
                .emit()
                .map_err(|e| EngineError::io("sending archive chunk", e))
        }));

        let message = match outcome {
            Ok(Ok(())) => {
                debug!("archive complete");
                Message::Done
            }
            Ok(Err(_)) if writer.consumer_gone() => {
                debug!("archive consumer went away, stopping");
                return;
            }
            Ok(Err(e)) => {
                warn!("archive failed: {e}");
                Message::Failed(Error::archive(&path, e))
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!("archive producer panicked: {reason}");
                Message::Failed(Error::ArchiveStream {
                    path: path.clone(),
                    reason: format!("producer panicked: {reason}"),
                })
            }
        };
        writer.finish(message);
    });

    Ok(NarStream {
        rx,
        path: stream_path,
        finished: false,
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The NAR of one store path as a [`Stream`] of [`Bytes`] chunks.
///
/// A successful archive ends with `None`. A failed one ends with exactly one
/// `Err` item followed by `None`; bytes already yielded before it are not a
/// complete archive and must be discarded. Dropping the stream stops the
/// producer at its next write.
#[must_use = "streams do nothing unless polled"]
pub struct NarStream {
    rx: mpsc::Receiver<Message>,
    path: StorePath,
    finished: bool,
}

impl NarStream {
    pub fn path(&self) -> &StorePath {
        &self.path
    }
}

impl Stream for NarStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let item = match ready!(self.rx.poll_recv(cx)) {
            Some(Message::Chunk(chunk)) => return Poll::Ready(Some(Ok(chunk))),
            Some(Message::Done) => None,
            Some(Message::Failed(e)) => Some(Err(e)),
            None => Some(Err(Error::ArchiveStream {
                path: self.path.clone(),
                reason: "producer exited without finishing the archive".to_string(),
            })),
        };
        self.finished = true;
        self.rx.close();
        Poll::Ready(item)
    }
}

impl FusedStream for NarStream {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}

impl std::fmt::Debug for NarStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NarStream")
            .field("path", &self.path)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Size and SHA-256 of a streamed archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NarDigest {
    pub size: u64,
    pub sha256: [u8; 32],
}

impl NarDigest {
    /// `sha256:<nix base32>`, as in narinfo files.
    pub fn to_nix_string(&self) -> String {
        format!("sha256:{}", base32::encode_string(&self.sha256))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.sha256)
    }

    /// Whether `recorded` (`sha256:` followed by base16 or nix base32)
    /// names this digest. Other algorithms never match.
    pub fn matches(&self, recorded: &str) -> bool {
        let Some(digest) = recorded.strip_prefix("sha256:") else {
            return false;
        };
        match digest.len() {
            64 => digest.eq_ignore_ascii_case(&self.to_hex()),
            52 => digest == base32::encode_string(&self.sha256),
            _ => false,
        }
    }
}

/// Running size and hash of the chunks seen so far.
#[derive(Default)]
pub(crate) struct NarHasher {
    size: u64,
    hasher: Sha256,
}

impl NarHasher {
    pub(crate) fn update(&mut self, chunk: &[u8]) {
        self.size += chunk.len() as u64;
        self.hasher.update(chunk);
    }

    pub(crate) fn finish(self) -> NarDigest {
        NarDigest {
            size: self.size,
            sha256: self.hasher.finalize().into(),
        }
    }
}

/// `stream` with errors as [`io::Error`], for
/// [`tokio_util::io::StreamReader`].
pub(crate) fn into_io_stream(
    stream: NarStream,
) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin {
    use futures::StreamExt as _;
    stream.map(|item| item.map_err(io::Error::other))
}
