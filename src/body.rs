//! Body wrappers used while relaying to and from the backend
//!
//! [`ProgressBody`] reports upload progress so the response deadline only
//! starts once the request body has been handed over. [`IdleTimeoutBody`]
//! fails a download that stops producing data.

use hyper::body::{Body, Bytes, Frame, SizeHint};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Sleep};

/// Error type of streamed gateway bodies
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("backend body error: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("no body data received for {0:?}")]
    Stalled(Duration),
}

/// Snapshot of a request body being sent upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyProgress {
    /// Frames handed to the backend connection so far
    pub frames: u64,
    /// The last frame has been handed over
    pub finished: bool,
}

/// Request body that publishes a [`BodyProgress`] on every frame
pub struct ProgressBody<B> {
    inner: B,
    progress: watch::Sender<BodyProgress>,
}

impl<B: Body + Unpin> ProgressBody<B> {
    pub fn new(inner: B) -> (Self, watch::Receiver<BodyProgress>) {
        let (progress, rx) = watch::channel(BodyProgress {
            frames: 0,
            finished: inner.is_end_stream(),
        });
        (Self { inner, progress }, rx)
    }
}

impl<B: Body + Unpin> Body for ProgressBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                let finished = this.inner.is_end_stream();
                this.progress.send_modify(|p| {
                    p.frames += 1;
                    p.finished = finished;
                });
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                this.progress.send_modify(|p| p.finished = true);
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Response body that errors once the inner body has been pending for `idle`.
///
/// Only time spent waiting on the inner body counts; a slow reader on the
/// client side never trips the timer.
pub struct IdleTimeoutBody<B> {
    inner: B,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
    waiting: bool,
}

impl<B> IdleTimeoutBody<B> {
    pub fn new(inner: B, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            deadline: Box::pin(tokio::time::sleep(idle)),
            waiting: false,
        }
    }
}

impl<B> Body for IdleTimeoutBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BodyError>,
{
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BodyError>>> {
        let this = &mut *self;
        if !this.waiting {
            this.waiting = true;
            let deadline = Instant::now() + this.idle;
            this.deadline.as_mut().reset(deadline);
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(frame) => {
                this.waiting = false;
                Poll::Ready(frame.map(|r| r.map_err(Into::into)))
            }
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.waiting = false;
                    Poll::Ready(Some(Err(BodyError::Stalled(this.idle))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Empty, Full};
    use std::convert::Infallible;

    /// Yields one frame, then never completes
    struct HangingBody {
        sent: bool,
    }

    impl Body for HangingBody {
        type Data = Bytes;
        type Error = hyper::Error;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
            if self.sent {
                Poll::Pending
            } else {
                self.sent = true;
                Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(b"first")))))
            }
        }
    }

    #[tokio::test]
    async fn test_progress_body_reports_frames_and_end() {
        let (mut body, rx) = ProgressBody::new(Full::new(Bytes::from_static(b"run-metrics")));
        assert!(!rx.borrow().finished);

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"run-metrics"));
        assert_eq!(rx.borrow().frames, 1);
        assert!(rx.borrow().finished);
    }

    #[tokio::test]
    async fn test_progress_body_empty_starts_finished() {
        let (_body, rx) = ProgressBody::new(Empty::<Bytes>::new());
        assert_eq!(*rx.borrow(), BodyProgress { frames: 0, finished: true });
    }

    #[tokio::test]
    async fn test_idle_timeout_body_passes_data() {
        let inner = Full::new(Bytes::from_static(b"artifact")).map_err(|never: Infallible| match never {});
        let inner: http_body_util::combinators::BoxBody<Bytes, hyper::Error> = inner.boxed();
        let body = IdleTimeoutBody::new(inner, Duration::from_millis(50));

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"artifact"));
    }

    #[tokio::test]
    async fn test_idle_timeout_body_fails_stalled_stream() {
        let mut body = IdleTimeoutBody::new(HangingBody { sent: false }, Duration::from_millis(50));

        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from_static(b"first"));

        let err = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("stall detected before the outer timeout")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BodyError::Stalled(d) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_idle_timeout_ignores_time_between_polls() {
        let inner = Full::new(Bytes::from_static(b"late-reader")).map_err(|never: Infallible| match never {});
        let inner: http_body_util::combinators::BoxBody<Bytes, hyper::Error> = inner.boxed();
        let mut body = IdleTimeoutBody::new(inner, Duration::from_millis(20));

        // A slow client leaves the body unpolled past the idle window
        tokio::time::sleep(Duration::from_millis(80)).await;
        let frame = body.frame().await.unwrap().unwrap();
        assert!(frame.is_data());
    }
}
