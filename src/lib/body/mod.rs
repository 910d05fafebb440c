use bytes::Bytes;
use futures::Stream;
use http_body::{Frame, SizeHint};
use hyper::body::Body as HyperBody;
use hyper::body::Incoming;
use pin_project::pin_project;
use std::fmt::Debug;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::proxy::error::ForwardError;

type FrameStream =
  Pin<Box<dyn Stream<Item = Result<Frame<Bytes>, ForwardError>> + Send + 'static>>;

/// The body type relayed through the forwarder, both for outbound requests
/// and for the responses handed back to hyper.
#[pin_project(project = BodyProjection)]
pub enum Body {
  Empty,
  Full(Option<Bytes>),
  Incoming(#[pin] Incoming),
  Stream(FrameStream),
}

impl Debug for Body {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Body::Empty => "Body::Empty",
      Body::Full(_) => "Body::Full",
      Body::Incoming(_) => "Body::Incoming",
      Body::Stream(_) => "Body::Stream",
    };

    f.debug_struct(name).finish()
  }
}

impl Body {
  pub fn empty() -> Self {
    Self::Empty
  }

  pub fn full<B: Into<Bytes>>(data: B) -> Self {
    Self::Full(Some(data.into()))
  }

  pub fn incoming(incoming: Incoming) -> Self {
    Self::Incoming(incoming)
  }

  pub fn stream<S: Stream<Item = Result<Frame<Bytes>, ForwardError>> + Send + 'static>(
    stream: S,
  ) -> Self {
    Self::Stream(Box::pin(stream))
  }
}

impl From<()> for Body {
  fn from(_: ()) -> Self {
    Body::empty()
  }
}

impl From<Bytes> for Body {
  fn from(data: Bytes) -> Self {
    Body::full(data)
  }
}

impl From<Incoming> for Body {
  fn from(incoming: Incoming) -> Self {
    Body::incoming(incoming)
  }
}

impl HyperBody for Body {
  type Data = Bytes;
  type Error = ForwardError;

  fn poll_frame(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
    match self.project() {
      BodyProjection::Empty => Poll::Ready(None),

      BodyProjection::Full(opt) => match opt.take() {
        None => Poll::Ready(None),
        Some(data) => Poll::Ready(Some(Ok(Frame::data(data)))),
      },

      BodyProjection::Incoming(incoming) => match incoming.poll_frame(cx) {
        Poll::Pending => Poll::Pending,
        Poll::Ready(None) => Poll::Ready(None),
        Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
        Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(ForwardError::IncomingBody(e)))),
      },

      BodyProjection::Stream(stream) => stream.as_mut().poll_next(cx),
    }
  }

  fn is_end_stream(&self) -> bool {
    match self {
      Body::Empty => true,
      Body::Full(opt) => opt.is_none(),
      Body::Incoming(incoming) => incoming.is_end_stream(),
      // a stream's own size hint cannot be trusted for end-of-stream
      Body::Stream(_) => false,
    }
  }

  fn size_hint(&self) -> SizeHint {
    match self {
      Body::Empty => SizeHint::with_exact(0),
      Body::Full(opt) => match opt {
        None => SizeHint::with_exact(0),
        Some(data) => SizeHint::with_exact(data.len() as u64),
      },
      Body::Incoming(incoming) => incoming.size_hint(),
      Body::Stream(_) => SizeHint::default(),
    }
  }
}

impl Stream for Body {
  type Item = Result<Frame<Bytes>, ForwardError>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.poll_frame(cx)
  }
}

pub fn map_request_body<S, T>(
  request: hyper::Request<S>,
  f: impl FnOnce(S) -> T,
) -> hyper::Request<T> {
  let (parts, source) = request.into_parts();
  hyper::Request::from_parts(parts, f(source))
}
