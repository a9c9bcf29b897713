//! The N-way time-ordered merge feeding a read model.
//!
//! Each ingested topic gets a [`Prefetch`]: a task holding exactly one
//! in-flight `consume` whose result lands in a single-slot mailbox. The
//! merge peeks every mailbox in parallel (bounded by a timeout so a
//! quiet stream cannot stall the rest), takes the earliest timestamp,
//! and hands the envelope to the caller.
//!
//! The resulting order is approximate, bounded by the peek timeout: if a
//! stream stays quiet longer than that, later events on other streams
//! may overtake it. Within one topic, order stays strict.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{join_all, select_all};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::error::ConsumeError;
use crate::event_type::{EventConsumer, EventEnvelope};

type Item = Result<Option<EventEnvelope>, ConsumeError>;

enum Slot {
    /// The consume is still in flight.
    Pending,
    /// The consume resolved; the item waits to be taken.
    Ready(Item),
    /// A terminal item was taken (or reclaimed); the stream is over.
    Finished,
}

struct Mailbox {
    slot: Mutex<Slot>,
    /// Signalled when the slot transitions to `Ready`.
    filled: Notify,
    /// Signalled when the slot transitions back to `Pending`.
    taken: Notify,
}

/// What a peek observed without consuming anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Peeked {
    /// An envelope is prefetched; its event timestamp in epoch millis.
    Event(i64),
    /// The prefetched consume failed; `take` yields the error.
    Failed,
    /// The stream ended (cancellation).
    Ended,
    /// The prefetch did not resolve within the timeout. It keeps
    /// running.
    Pending,
}

/// One always-in-flight consume over a consumer, with peek/take access
/// to the next envelope.
pub(crate) struct Prefetch {
    mailbox: Arc<Mailbox>,
    _task: JoinHandle<()>,
}

impl Prefetch {
    /// Spawn the prefetch loop over `consumer`.
    pub(crate) fn spawn(mut consumer: EventConsumer, cancel: CancelToken) -> Self {
        let mailbox = Arc::new(Mailbox {
            slot: Mutex::new(Slot::Pending),
            filled: Notify::new(),
            taken: Notify::new(),
        });
        let shared = Arc::clone(&mailbox);
        let task = tokio::spawn(async move {
            loop {
                let item = consumer.consume(&cancel).await;
                let terminal = !matches!(item, Ok(Some(_)));
                {
                    let mut slot = shared.slot.lock().expect("prefetch slot poisoned");
                    *slot = Slot::Ready(item);
                }
                shared.filled.notify_waiters();
                if terminal {
                    return;
                }
                // Park until the envelope is taken, or reclaim it on
                // cancellation so an un-ingested event is nacked rather
                // than silently acked by its drop.
                loop {
                    let taken = shared.taken.notified();
                    tokio::pin!(taken);
                    taken.as_mut().enable();
                    if matches!(
                        *shared.slot.lock().expect("prefetch slot poisoned"),
                        Slot::Pending
                    ) {
                        break;
                    }
                    tokio::select! {
                        _ = &mut taken => {}
                        _ = cancel.cancelled() => {
                            let mut slot =
                                shared.slot.lock().expect("prefetch slot poisoned");
                            match std::mem::replace(&mut *slot, Slot::Finished) {
                                Slot::Ready(item) => {
                                    drop(slot);
                                    if let Ok(Some(envelope)) = item {
                                        envelope.nack();
                                    }
                                    shared.filled.notify_waiters();
                                    return;
                                }
                                // A racing take() already emptied the
                                // slot; let the outer loop observe the
                                // cancellation through consume.
                                other => *slot = other,
                            }
                        }
                    }
                }
            }
        });
        Self {
            mailbox,
            _task: task,
        }
    }

    fn check(&self) -> Option<Peeked> {
        let slot = self.mailbox.slot.lock().expect("prefetch slot poisoned");
        match &*slot {
            Slot::Ready(Ok(Some(envelope))) => Some(Peeked::Event(envelope.timestamp_ms())),
            Slot::Ready(Ok(None)) => Some(Peeked::Ended),
            Slot::Ready(Err(_)) => Some(Peeked::Failed),
            Slot::Finished => Some(Peeked::Ended),
            Slot::Pending => None,
        }
    }

    /// Wait until the prefetch resolves and report what it holds.
    pub(crate) async fn peek_forever(&self) -> Peeked {
        loop {
            if let Some(peeked) = self.check() {
                return peeked;
            }
            let filled = self.mailbox.filled.notified();
            tokio::pin!(filled);
            filled.as_mut().enable();
            // Re-check after registering so a fill between the check and
            // the await cannot be missed.
            if let Some(peeked) = self.check() {
                return peeked;
            }
            filled.await;
        }
    }

    /// Observe the prefetched item, giving up (but leaving the prefetch
    /// running) after `timeout`.
    pub(crate) async fn peek(&self, timeout: Duration) -> Peeked {
        match tokio::time::timeout(timeout, self.peek_forever()).await {
            Ok(peeked) => peeked,
            Err(_) => Peeked::Pending,
        }
    }

    /// Wait for the prefetch, consume its item, and restart it.
    ///
    /// A terminal item (end of stream, error) is yielded once; the
    /// stream reports `Ok(None)` afterwards.
    pub(crate) async fn take(&self) -> Item {
        loop {
            {
                let mut slot = self.mailbox.slot.lock().expect("prefetch slot poisoned");
                match std::mem::replace(&mut *slot, Slot::Pending) {
                    Slot::Ready(item) => {
                        if !matches!(item, Ok(Some(_))) {
                            *slot = Slot::Finished;
                        }
                        drop(slot);
                        self.mailbox.taken.notify_waiters();
                        return item;
                    }
                    Slot::Finished => {
                        *slot = Slot::Finished;
                        return Ok(None);
                    }
                    Slot::Pending => {}
                }
            }
            let filled = self.mailbox.filled.notified();
            tokio::pin!(filled);
            filled.as_mut().enable();
            if !matches!(
                *self.mailbox.slot.lock().expect("prefetch slot poisoned"),
                Slot::Pending
            ) {
                continue;
            }
            filled.await;
        }
    }
}

/// Multiplexes N prefetched streams into one approximately
/// timestamp-ordered sequence.
pub(crate) struct MultiConsumerMerge {
    streams: Vec<Prefetch>,
    ended: Vec<bool>,
    peek_timeout: Duration,
}

impl MultiConsumerMerge {
    pub(crate) fn new(streams: Vec<Prefetch>, peek_timeout: Duration) -> Self {
        let ended = vec![false; streams.len()];
        Self {
            streams,
            ended,
            peek_timeout,
        }
    }

    /// Deliver the next envelope in merge order, tagged with its stream
    /// index. `Ok(None)` means every stream has ended.
    ///
    /// # Errors
    ///
    /// Propagates the first stream failure observed.
    pub(crate) async fn next(&mut self) -> Result<Option<(usize, EventEnvelope)>, ConsumeError> {
        loop {
            // Peek every live stream in parallel, bounded by the timeout.
            let peeks: Vec<(usize, Peeked)> = join_all(
                self.streams
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| !self.ended[*index])
                    .map(|(index, stream)| {
                        let timeout = self.peek_timeout;
                        async move { (index, stream.peek(timeout).await) }
                    }),
            )
            .await;

            let mut earliest: Option<(i64, usize)> = None;
            let mut failed: Option<usize> = None;
            for (index, peeked) in peeks {
                match peeked {
                    // Strict `<` keeps the smallest index on ties.
                    Peeked::Event(timestamp) => {
                        if earliest.map_or(true, |(best, _)| timestamp < best) {
                            earliest = Some((timestamp, index));
                        }
                    }
                    Peeked::Failed => failed = failed.or(Some(index)),
                    Peeked::Ended => self.ended[index] = true,
                    Peeked::Pending => {}
                }
            }

            if let Some(index) = failed {
                match self.streams[index].take().await {
                    Err(error) => {
                        self.ended[index] = true;
                        return Err(error);
                    }
                    Ok(Some(envelope)) => return Ok(Some((index, envelope))),
                    Ok(None) => {
                        self.ended[index] = true;
                        continue;
                    }
                }
            }

            if let Some((_, index)) = earliest {
                match self.streams[index].take().await? {
                    Some(envelope) => return Ok(Some((index, envelope))),
                    None => {
                        self.ended[index] = true;
                        continue;
                    }
                }
            }

            let live: Vec<&Prefetch> = self
                .streams
                .iter()
                .enumerate()
                .filter(|(index, _)| !self.ended[*index])
                .map(|(_, stream)| stream)
                .collect();
            if live.is_empty() {
                return Ok(None);
            }
            // Everything timed out: wait until any stream produces, then
            // re-run the ordered peek round.
            let races = live
                .into_iter()
                .map(|stream| Box::pin(stream.peek_forever()));
            let _ = select_all(races).await;
        }
    }
}
