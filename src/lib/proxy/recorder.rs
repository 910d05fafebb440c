use bytes::Bytes;
use http::StatusCode;
use http_body::{Frame, SizeHint};
use hyper::body::Body as HyperBody;
use pin_project::{pin_project, pinned_drop};
use std::pin::Pin;
use std::task::{Context, Poll};

use super::error::ForwardError;
use crate::body::Body;
use crate::buffer::PooledBuf;

/// Runs exactly once when the relay finishes, with the recorded status and
/// the number of body bytes that went out.
pub type Finalizer = Box<dyn FnOnce(StatusCode, u64) + Send + 'static>;

/// Relays an upstream response body while recording what actually happened:
/// the status it was committed with and the bytes copied, reported to the
/// finalizer on end-of-stream or drop, whichever comes first.
///
/// In buffered mode data is copied through a pooled 32 KiB window, emitting
/// a frame when the window fills or upstream has nothing more for now. In
/// stream mode every upstream frame is forwarded as it arrives.
#[pin_project(PinnedDrop)]
pub struct ResponseRecorder {
  #[pin]
  inner: Body,
  status: StatusCode,
  written: u64,
  stream: bool,
  window: PooledBuf,
  fill: usize,
  pending: Option<Bytes>,
  staged: Option<Frame<Bytes>>,
  ended: bool,
  finalizer: Option<Finalizer>,
}

impl ResponseRecorder {
  pub fn new(
    inner: Body,
    status: StatusCode,
    stream: bool,
    window: PooledBuf,
    finalizer: Finalizer,
  ) -> Self {
    Self {
      inner,
      status,
      written: 0,
      stream,
      window,
      fill: 0,
      pending: None,
      staged: None,
      ended: false,
      finalizer: Some(finalizer),
    }
  }

  pub fn status(&self) -> StatusCode {
    self.status
  }
}

impl HyperBody for ResponseRecorder {
  type Data = Bytes;
  type Error = ForwardError;

  fn poll_frame(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
    let mut this = self.project();

    if *this.stream {
      return match this.inner.as_mut().poll_frame(cx) {
        Poll::Pending => Poll::Pending,

        Poll::Ready(Some(Ok(frame))) => {
          if let Some(data) = frame.data_ref() {
            *this.written += data.len() as u64;
          }
          Poll::Ready(Some(Ok(frame)))
        }

        Poll::Ready(Some(Err(e))) => {
          log::error!("error copying upstream response body: {e}");
          finalize(this.finalizer, *this.status, *this.written);
          Poll::Ready(Some(Err(e)))
        }

        Poll::Ready(None) => {
          finalize(this.finalizer, *this.status, *this.written);
          Poll::Ready(None)
        }
      };
    }

    loop {
      // overflow from a frame larger than the window goes out first
      if let Some(data) = this.pending.take() {
        let n = (this.window.len() - *this.fill).min(data.len());
        this.window[*this.fill..*this.fill + n].copy_from_slice(&data[..n]);
        *this.fill += n;
        if n < data.len() {
          *this.pending = Some(data.slice(n..));
          return Poll::Ready(Some(Ok(flush(this.window, this.fill, this.written))));
        }
        continue;
      }

      if *this.ended {
        if *this.fill > 0 {
          return Poll::Ready(Some(Ok(flush(this.window, this.fill, this.written))));
        }
        if let Some(frame) = this.staged.take() {
          return Poll::Ready(Some(Ok(frame)));
        }
        finalize(this.finalizer, *this.status, *this.written);
        return Poll::Ready(None);
      }

      match this.inner.as_mut().poll_frame(cx) {
        Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
          Ok(data) => {
            *this.pending = Some(data);
          }

          // trailers wait behind whatever the window still holds
          Err(frame) => {
            if *this.fill > 0 {
              *this.staged = Some(frame);
              return Poll::Ready(Some(Ok(flush(this.window, this.fill, this.written))));
            }
            return Poll::Ready(Some(Ok(frame)));
          }
        },

        Poll::Ready(Some(Err(e))) => {
          log::error!("error copying upstream response body: {e}");
          finalize(this.finalizer, *this.status, *this.written);
          return Poll::Ready(Some(Err(e)));
        }

        Poll::Ready(None) => {
          *this.ended = true;
        }

        Poll::Pending => {
          // emit the partial window rather than stalling the client
          if *this.fill > 0 {
            return Poll::Ready(Some(Ok(flush(this.window, this.fill, this.written))));
          }
          return Poll::Pending;
        }
      }
    }
  }

  fn is_end_stream(&self) -> bool {
    self.ended && self.fill == 0 && self.pending.is_none() && self.staged.is_none()
  }

  fn size_hint(&self) -> SizeHint {
    HyperBody::size_hint(&self.inner)
  }
}

impl futures::Stream for ResponseRecorder {
  type Item = Result<Frame<Bytes>, ForwardError>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.poll_frame(cx)
  }
}

#[pinned_drop]
impl PinnedDrop for ResponseRecorder {
  fn drop(self: Pin<&mut Self>) {
    let this = self.project();
    finalize(this.finalizer, *this.status, *this.written);
  }
}

fn flush(window: &mut PooledBuf, fill: &mut usize, written: &mut u64) -> Frame<Bytes> {
  let out = Bytes::copy_from_slice(&window[..*fill]);
  *written += *fill as u64;
  *fill = 0;
  Frame::data(out)
}

fn finalize(finalizer: &mut Option<Finalizer>, status: StatusCode, written: u64) {
  if let Some(finalizer) = finalizer.take() {
    finalizer(status, written);
  }
}
