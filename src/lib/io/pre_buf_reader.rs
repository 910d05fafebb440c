use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A connection wrapper that serves reads from a prefix buffer before
/// reading the inner stream. Used to replay the bytes that arrived after a
/// websocket handshake response head into the relay pump.
#[pin_project]
pub struct PreBufReader<S> {
  prefix: Vec<u8>,
  pos: usize,
  #[pin]
  inner: S,
}

impl<S> PreBufReader<S> {
  pub fn new(inner: S, prefix: Vec<u8>) -> Self {
    Self {
      prefix,
      pos: 0,
      inner,
    }
  }
}

impl<S: AsyncRead> AsyncRead for PreBufReader<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.project();

    let remaining = &this.prefix[*this.pos..];
    if !remaining.is_empty() {
      let n = remaining.len().min(buf.remaining());
      buf.put_slice(&remaining[..n]);
      *this.pos += n;
      if *this.pos == this.prefix.len() {
        this.prefix.clear();
        *this.pos = 0;
      }
      return Poll::Ready(Ok(()));
    }

    this.inner.poll_read(cx, buf)
  }
}

impl<S: AsyncWrite> AsyncWrite for PreBufReader<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    self.project().inner.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }

  fn poll_write_vectored(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    bufs: &[std::io::IoSlice<'_>],
  ) -> Poll<std::io::Result<usize>> {
    self.project().inner.poll_write_vectored(cx, bufs)
  }

  fn is_write_vectored(&self) -> bool {
    self.inner.is_write_vectored()
  }
}
