//! AES-256-CTR adapters over async byte streams.
//!
//! The counter block starts at zero for every wrapped stream and keeps
//! running for as long as the wrapper lives, so consecutive writes (and the
//! matching reads on the other side) form one continuous keystream.

use crate::keys::TransferKey;
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Initial counter block. Fixed for wire compatibility with protocol v1.
const IV: [u8; 16] = [0u8; 16];

fn keystream(key: &TransferKey) -> Aes256Ctr {
    Aes256Ctr::new(key.as_bytes().into(), &IV.into())
}

/// Encrypts everything written to it before passing it to `inner`.
///
/// Ciphertext the inner writer has not taken yet is queued, and the next
/// write, `flush` or `shutdown` pushes it out first. Flush before writing to
/// the inner stream directly.
pub struct EncryptingWriter<W> {
    inner: W,
    cipher: Aes256Ctr,
    pending: Vec<u8>,
    pos: usize,
}

impl<W> EncryptingWriter<W> {
    pub fn new(key: &TransferKey, inner: W) -> Self {
        Self {
            inner,
            cipher: keystream(key),
            pending: Vec::new(),
            pos: 0,
        }
    }

    /// True when encrypted bytes are still waiting for the inner writer.
    pub fn has_pending(&self) -> bool {
        self.pos < self.pending.len()
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> EncryptingWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pos < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pos += n;
        }
        self.pending.clear();
        self.pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for EncryptingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // The keystream only advances for bytes we accept here.
        this.pending.extend_from_slice(buf);
        this.cipher.apply_keystream(&mut this.pending);

        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Decrypts bytes as they are read from `inner`.
///
/// `inner` stays reachable through [`get_mut`](Self::get_mut) so plaintext
/// can be read from the same stream without disturbing the keystream.
pub struct DecryptingReader<R> {
    inner: R,
    cipher: Aes256Ctr,
}

impl<R> DecryptingReader<R> {
    pub fn new(key: &TransferKey, inner: R) -> Self {
        Self {
            inner,
            cipher: keystream(key),
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let start = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.cipher.apply_keystream(&mut buf.filled_mut()[start..]);
        Poll::Ready(Ok(()))
    }
}
