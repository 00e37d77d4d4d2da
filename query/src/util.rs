use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    stream::{Fuse, FusedStream},
    Stream, StreamExt,
};
use pin_project_lite::pin_project;

pin_project! {
    /// Flattens a stream of streams, only ever following the newest inner stream.
    ///
    /// An inner stream is dropped as soon as a newer one arrives, even if it was never polled.
    #[must_use = "streams do nothing unless polled"]
    pub(crate) struct SwitchLatest<St: Stream> {
        #[pin]
        outer: Fuse<St>,
        inner: Option<St::Item>,
    }
}

impl<St: Stream> SwitchLatest<St> {
    pub(crate) fn new(outer: St) -> Self {
        Self {
            outer: outer.fuse(),
            inner: None,
        }
    }
}

impl<St> Stream for SwitchLatest<St>
where
    St: Stream,
    St::Item: Stream + Unpin,
{
    type Item = <St::Item as Stream>::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        while let Poll::Ready(Some(inner)) = this.outer.as_mut().poll_next(cx) {
            *this.inner = Some(inner);
        }

        if let Some(inner) = this.inner.as_mut() {
            match inner.poll_next_unpin(cx) {
                Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
                Poll::Ready(None) => *this.inner = None,
                Poll::Pending => return Poll::Pending,
            }
        }

        if this.outer.is_terminated() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}
