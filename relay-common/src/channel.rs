use std::task::{Context, Poll};

use futures::SinkExt;
use tokio::sync::mpsc::{
    self, Receiver,
    error::{TryRecvError, TrySendError},
};
use tokio_util::sync::{PollSendError, PollSender};

/// A bounded, bi-directional channel built on two Tokio [`mpsc`] channels.
///
/// One half sends `S` and receives `R`, the other half sends `R` and
/// receives `S`. The relay uses this between the coordination driver and the
/// group-control actor: requests flow one way, completion reports flow back,
/// both in strict order.
#[derive(Debug)]
pub struct Channel<S, R> {
    tx: PollSender<S>,
    rx: Receiver<R>,
}

/// Creates a connected pair of [`Channel`] halves with the given buffer
/// sizes. The first half sends `S` and receives `R`; the second is the
/// mirror image.
pub fn channel<S, R>(tx_buffer: usize, rx_buffer: usize) -> (Channel<S, R>, Channel<R, S>)
where
    S: Send,
    R: Send,
{
    let (tx1, rx1) = mpsc::channel(tx_buffer);
    let (tx2, rx2) = mpsc::channel(rx_buffer);

    let tx1 = PollSender::new(tx1);
    let tx2 = PollSender::new(tx2);

    (Channel { tx: tx1, rx: rx2 }, Channel { tx: tx2, rx: rx1 })
}

impl<S: Send + 'static, R> Channel<S, R> {
    /// Sends a value, waiting until there is capacity.
    ///
    /// An `Err` means the other half was dropped and the value will never be
    /// received.
    pub async fn send(&mut self, msg: S) -> Result<(), PollSendError<S>> {
        self.tx.send(msg).await
    }

    /// Attempts to send a value without waiting, failing if the buffer is
    /// full or the other half was dropped.
    pub fn try_send(&mut self, msg: S) -> Result<(), TrySendError<S>> {
        if let Some(tx) = self.tx.get_ref() {
            tx.try_send(msg)
        } else {
            Err(TrySendError::Closed(msg))
        }
    }

    /// Receives the next value, or `None` once the other half was dropped
    /// and the buffer is drained.
    pub async fn recv(&mut self) -> Option<R> {
        self.rx.recv().await
    }

    /// Attempts to receive the next value without waiting.
    pub fn try_recv(&mut self) -> Result<R, TryRecvError> {
        self.rx.try_recv()
    }

    /// Polls for the next value. `Poll::Ready(None)` means the other half
    /// was dropped and everything buffered has been received.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<R>> {
        self.rx.poll_recv(cx)
    }
}
