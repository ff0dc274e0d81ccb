//! Cancellable one-shot timers that deliver into a worker mailbox.
//!
//! A timer holds only a weak sender, so an armed timer never keeps a
//! stopped worker's mailbox alive. Dropping the handle cancels the timer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle to one scheduled message.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Send `message` to `target` after `after` unless cancelled first.
    pub fn schedule<M>(after: Duration, target: mpsc::WeakSender<M>, message: M) -> Self
    where
        M: Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let delivered = match target.upgrade() {
                Some(sender) => sender.send(message).await.is_ok(),
                None => false,
            };
            if !delivered {
                debug!(?after, "Timer fired after its mailbox closed");
            }
        });
        Self { task }
    }

    /// Cancel the timer. A no-op if it already fired.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Whether the timer fired or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (tx, mut rx) = mpsc::channel(4);
        let _timer = TimerHandle::schedule(Duration::from_millis(100), tx.downgrade(), 7_u32);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(rx.recv().await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::channel(4);
        let timer = TimerHandle::schedule(Duration::from_millis(100), tx.downgrade(), 7_u32);
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_mailbox_finishes_quietly() {
        let (tx, rx) = mpsc::channel::<u32>(4);
        let timer = TimerHandle::schedule(Duration::from_millis(10), tx.downgrade(), 1);
        drop(rx);
        drop(tx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(timer.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_cancels() {
        let (tx, mut rx) = mpsc::channel(4);
        drop(TimerHandle::schedule(
            Duration::from_millis(10),
            tx.downgrade(),
            1_u32,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
