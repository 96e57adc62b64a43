//! Single-shot delayed events with cancellable handles.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Handle to a scheduled event. Cancelling (or dropping) the handle aborts
/// the delivery; a timer that already fired cannot be unsent, so receivers
/// must treat stale events as no-ops.
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Send `event` on `tx` after `delay` unless the handle is cancelled first.
pub fn schedule<E: Send + 'static>(
    delay: Duration,
    tx: UnboundedSender<E>,
    event: E,
) -> TimerHandle {
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(event);
    });
    TimerHandle { task }
}
