use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;

use super::inbox::EventSender;
use crate::core::{Event, TimerId};

/// Cancellable timer service.
///
/// A fired timer delivers `MachineInput::Timer { id, event }` to the inbox it was
/// scheduled with. Cancelling an unknown or already-fired id is a no-op.
pub trait Clock: Send + 'static {
    fn now(&self) -> Instant;
    fn schedule(&mut self, id: TimerId, delay: Duration, event: Event, inbox: &EventSender);
    fn cancel(&mut self, id: TimerId);
}

/// Clock backed by tokio timers. Cancellation aborts the sleeping task.
#[derive(Debug, Default)]
pub struct TokioClock {
    timers: HashMap<TimerId, AbortHandle>,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.timers
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        // Follows tokio's clock so paused-time tests stay consistent.
        tokio::time::Instant::now().into_std()
    }

    fn schedule(&mut self, id: TimerId, delay: Duration, event: Event, inbox: &EventSender) {
        self.timers.retain(|_, handle| !handle.is_finished());
        let inbox = inbox.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inbox.timer(id, event);
        });
        if let Some(previous) = self.timers.insert(id, task.abort_handle()) {
            previous.abort();
        }
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for TokioClock {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineInput;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay_and_cancel_suppresses() {
        let (inbox, mut rx) = EventSender::channel();
        let mut clock = TokioClock::new();

        clock.schedule(TimerId(1), Duration::from_secs(5), Event::terminate(), &inbox);
        clock.schedule(TimerId(2), Duration::from_secs(1), Event::disconnect(), &inbox);
        clock.cancel(TimerId(2));
        clock.cancel(TimerId(2));

        tokio::time::sleep(Duration::from_secs(6)).await;
        match rx.try_recv() {
            Ok(MachineInput::Timer { id, .. }) => assert_eq!(id, TimerId(1)),
            other => panic!("unexpected input: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
