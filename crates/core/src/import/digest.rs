//! SHA-256 computed while an image streams to the platform.

use flate2::write::MultiGzDecoder;
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

use crate::driver::ContentType;

/// `io::Write` sink feeding a SHA-256 hasher.
struct HashWriter(Sha256);

impl Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Hasher {
    Plain(HashWriter),
    /// Hashes the decompressed stream, across every gzip member.
    Gzip(MultiGzDecoder<HashWriter>),
}

impl Hasher {
    fn new(content_type: ContentType) -> Self {
        let sink = HashWriter(Sha256::new());
        match content_type {
            ContentType::OctetStream => Hasher::Plain(sink),
            ContentType::Gzip => Hasher::Gzip(MultiGzDecoder::new(sink)),
        }
    }

    fn update(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Hasher::Plain(sink) => sink.write_all(data),
            Hasher::Gzip(decoder) => decoder.write_all(data),
        }
    }

    fn finish(self) -> io::Result<String> {
        let sink = match self {
            Hasher::Plain(sink) => sink,
            Hasher::Gzip(decoder) => decoder.finish()?,
        };
        Ok(format!("{:x}", sink.0.finalize()))
    }
}

/// Hasher shared between the reader and its handle. A hashing error is
/// kept until `finish` so the stream itself never fails because of it.
struct Pending {
    hasher: Hasher,
    error: Option<io::Error>,
}

impl Pending {
    fn update(&mut self, data: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.hasher.update(data) {
            self.error = Some(e);
        }
    }

    fn finish(self) -> io::Result<String> {
        match self.error {
            Some(e) => Err(e),
            None => self.hasher.finish(),
        }
    }
}

/// Handle for reading the digest after the reader has been consumed.
#[derive(Clone)]
pub struct DigestHandle {
    hasher: Arc<Mutex<Option<Pending>>>,
}

impl DigestHandle {
    /// Finish hashing and return the lowercase hex digest. Fails if the
    /// gzip stream was corrupt or truncated, or the digest was already
    /// taken.
    pub fn finish(&self) -> io::Result<String> {
        let hasher = self
            .hasher
            .lock()
            .map_err(|_| io::Error::other("digest lock poisoned"))?
            .take()
            .ok_or_else(|| io::Error::other("digest already finished"))?;
        hasher.finish()
    }
}

/// Wraps a reader and hashes every byte that passes through it.
pub struct DigestingReader<R> {
    inner: R,
    hasher: Arc<Mutex<Option<Pending>>>,
}

impl<R> DigestingReader<R> {
    pub fn new(inner: R, content_type: ContentType) -> (Self, DigestHandle) {
        let hasher = Arc::new(Mutex::new(Some(Pending {
            hasher: Hasher::new(content_type),
            error: None,
        })));
        let handle = DigestHandle {
            hasher: hasher.clone(),
        };
        (Self { inner, hasher }, handle)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let chunk = &buf.filled()[before..];
                // `buf` is already filled, so this must not fail
                if !chunk.is_empty() {
                    let mut guard = this.hasher.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(pending) = guard.as_mut() {
                        pending.update(chunk);
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// SHA-256 of `data`, decompressing first for gzip content.
pub fn digest_bytes(data: &[u8], content_type: ContentType) -> io::Result<String> {
    let mut hasher = Hasher::new(content_type);
    hasher.update(data)?;
    hasher.finish()
}
