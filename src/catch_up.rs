//! Catch-up detection: when has a replaying consumer reached the live
//! tail of its topic?
//!
//! A [`CatchUpConsumer`] wraps a raw substrate consumer and watches for
//! one of three signs that history is exhausted:
//!
//! 1. **Recency** — it delivered an event produced within the last
//!    `catch_up_idle` window.
//! 2. **Idle** — the inner consume sat for `catch_up_idle` without
//!    delivering anything.
//! 3. **Cancellation** — the scope was cancelled first; waiters must not
//!    block on a catch-up that will never come.
//!
//! Whichever fires first latches the consumer as caught up, invokes the
//! user callback exactly once, and flips the [`CatchUpSignal`]. The
//! at-least-once semantics of the wrapped consumer are untouched.

use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::cancel::CancelToken;
use crate::error::SubstrateError;
use crate::topic::{now_millis, Envelope, TopicConsumer};

/// Tuning for catch-up detection and replay telemetry.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use topicfold::CatchUpOptions;
///
/// let options = CatchUpOptions {
///     catch_up_idle: Duration::from_millis(250),
///     ..CatchUpOptions::default()
/// };
/// assert_eq!(options.progress_log_interval, Duration::from_secs(3));
/// ```
#[derive(Debug, Clone)]
pub struct CatchUpOptions {
    /// Minimum spacing between replay-progress log lines.
    ///
    /// Telemetry only; does not affect catch-up detection.
    ///
    /// Default: 3 seconds.
    pub progress_log_interval: Duration,

    /// The recency window and idle timeout for the catch-up latch. Also
    /// scales the ingestion merge's peek timeout (at 0.7×).
    ///
    /// Default: 1 second.
    pub catch_up_idle: Duration,
}

impl Default for CatchUpOptions {
    fn default() -> Self {
        Self {
            progress_log_interval: Duration::from_secs(3),
            catch_up_idle: Duration::from_secs(1),
        }
    }
}

impl CatchUpOptions {
    /// The merge peek timeout derived from `catch_up_idle`.
    pub(crate) fn peek_timeout(&self) -> Duration {
        self.catch_up_idle.mul_f64(0.7)
    }
}

/// Which predicate latched the catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpReason {
    /// A delivered event was recent enough to be considered live.
    Recent,
    /// The topic went quiet for the idle window.
    Idle,
    /// The scope was cancelled before either.
    Cancelled,
}

/// Callback invoked exactly once when the consumer latches.
pub type CatchUpCallback = Box<dyn FnOnce(CatchUpReason) + Send>;

/// Awaitable view of a consumer's catch-up latch.
#[derive(Debug, Clone)]
pub struct CatchUpSignal {
    rx: watch::Receiver<bool>,
}

impl CatchUpSignal {
    /// Whether the consumer has latched.
    pub fn is_caught_up(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the consumer latches.
    ///
    /// Also resolves if the consumer is dropped, so waiters never hang
    /// on a scope that has already been torn down.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Wraps a raw consumer with catch-up detection and replay telemetry.
pub struct CatchUpConsumer {
    inner: Box<dyn TopicConsumer>,
    options: CatchUpOptions,
    /// Topic name, for log context.
    topic: String,
    caught_up: bool,
    callback: Option<CatchUpCallback>,
    latch_tx: watch::Sender<bool>,
    /// Events delivered during replay.
    replayed: u64,
    /// Events delivered since the last progress log line.
    window: u64,
    last_progress_log: Option<Instant>,
}

impl CatchUpConsumer {
    /// Wrap `inner`, labelling logs with `topic`.
    pub fn new(
        topic: impl Into<String>,
        inner: Box<dyn TopicConsumer>,
        options: CatchUpOptions,
    ) -> Self {
        let (latch_tx, _) = watch::channel(false);
        Self {
            inner,
            options,
            topic: topic.into(),
            caught_up: false,
            callback: None,
            latch_tx,
            replayed: 0,
            window: 0,
            last_progress_log: None,
        }
    }

    /// Register the catch-up callback. Must be set before the first
    /// [`consume`](CatchUpConsumer::consume); it fires exactly once.
    pub fn set_on_catch_up(&mut self, callback: CatchUpCallback) {
        self.callback = Some(callback);
    }

    /// A signal that resolves when this consumer latches.
    pub fn signal(&self) -> CatchUpSignal {
        CatchUpSignal {
            rx: self.latch_tx.subscribe(),
        }
    }

    /// Whether the latch has fired.
    pub fn is_caught_up(&self) -> bool {
        self.caught_up
    }

    /// Consume the next envelope, running the catch-up predicates until
    /// the latch fires.
    ///
    /// # Errors
    ///
    /// Propagates the inner consumer's [`SubstrateError`] verbatim.
    pub async fn consume(
        &mut self,
        cancel: &CancelToken,
    ) -> Result<Option<Envelope>, SubstrateError> {
        loop {
            if self.caught_up {
                return self.inner.consume(cancel).await;
            }

            let idle = tokio::time::sleep(self.options.catch_up_idle);
            tokio::pin!(idle);
            tokio::select! {
                result = self.inner.consume(cancel) => {
                    match result? {
                        Some(envelope) => {
                            self.note_progress();
                            let age_ms = now_millis() - envelope.event().timestamp_ms;
                            if age_ms <= self.options.catch_up_idle.as_millis() as i64 {
                                self.latch(CatchUpReason::Recent);
                            }
                            return Ok(Some(envelope));
                        }
                        None => {
                            self.latch(CatchUpReason::Cancelled);
                            return Ok(None);
                        }
                    }
                }
                _ = &mut idle => {
                    self.latch(CatchUpReason::Idle);
                    // Loop back into the latched branch and keep waiting
                    // for the live tail.
                }
            }
        }
    }

    fn note_progress(&mut self) {
        self.replayed += 1;
        self.window += 1;
        let now = Instant::now();
        match self.last_progress_log {
            None => self.last_progress_log = Some(now),
            Some(last) if now.duration_since(last) >= self.options.progress_log_interval => {
                let elapsed = now.duration_since(last).as_secs_f64();
                tracing::info!(
                    topic = %self.topic,
                    replayed = self.replayed,
                    per_second = (self.window as f64 / elapsed).round(),
                    "replay in progress"
                );
                self.window = 0;
                self.last_progress_log = Some(now);
            }
            Some(_) => {}
        }
    }

    fn latch(&mut self, reason: CatchUpReason) {
        if self.caught_up {
            return;
        }
        self.caught_up = true;
        let _ = self.latch_tx.send(true);
        tracing::debug!(
            topic = %self.topic,
            replayed = self.replayed,
            reason = ?reason,
            "consumer caught up"
        );
        if let Some(callback) = self.callback.take() {
            callback(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::cancel::Canceller;
    use crate::memory::MemoryTopicFactory;
    use crate::topic::{ConsumerGroup, RawEvent, StartFrom, TopicFactory};

    fn short_options() -> CatchUpOptions {
        CatchUpOptions {
            progress_log_interval: Duration::from_secs(3),
            catch_up_idle: Duration::from_millis(50),
        }
    }

    async fn catch_up_consumer(
        factory: &MemoryTopicFactory,
        topic_name: &str,
    ) -> CatchUpConsumer {
        let topic = factory.make(topic_name).await.expect("make");
        let inner = topic
            .consumer(&ConsumerGroup::anonymous(StartFrom::Beginning))
            .await
            .expect("consumer");
        CatchUpConsumer::new(topic_name, inner, short_options())
    }

    async fn produce(factory: &MemoryTopicFactory, topic_name: &str, timestamp_ms: i64) {
        let topic = factory.make(topic_name).await.expect("make");
        let producer = topic.producer().await.expect("producer");
        producer
            .produce(
                RawEvent {
                    timestamp_ms,
                    payload: b"{}".to_vec(),
                },
                None,
            )
            .await
            .expect("produce");
    }

    #[tokio::test]
    async fn defaults_match_contract() {
        let options = CatchUpOptions::default();
        assert_eq!(options.progress_log_interval, Duration::from_secs(3));
        assert_eq!(options.catch_up_idle, Duration::from_secs(1));
        assert_eq!(options.peek_timeout(), Duration::from_millis(700));
    }

    #[tokio::test]
    async fn recent_event_latches() {
        let factory = MemoryTopicFactory::new();
        produce(&factory, "t", now_millis()).await;
        let mut consumer = catch_up_consumer(&factory, "t").await;

        let reasons: Arc<Mutex<Vec<CatchUpReason>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        consumer.set_on_catch_up(Box::new(move |reason| {
            sink.lock().expect("lock").push(reason);
        }));

        let envelope = consumer
            .consume(&CancelToken::never())
            .await
            .expect("consume")
            .expect("event");
        drop(envelope);

        assert!(consumer.is_caught_up());
        assert_eq!(*reasons.lock().expect("lock"), vec![CatchUpReason::Recent]);
    }

    #[tokio::test]
    async fn stale_event_does_not_latch() {
        let factory = MemoryTopicFactory::new();
        produce(&factory, "t", now_millis() - 60_000).await;
        let mut consumer = catch_up_consumer(&factory, "t").await;

        let envelope = consumer
            .consume(&CancelToken::never())
            .await
            .expect("consume")
            .expect("event");
        drop(envelope);

        assert!(!consumer.is_caught_up(), "a minute-old event is history");
    }

    #[tokio::test]
    async fn idle_topic_latches_and_consume_keeps_waiting() {
        let factory = MemoryTopicFactory::new();
        let mut consumer = catch_up_consumer(&factory, "t").await;
        let mut signal = consumer.signal();

        let factory = Arc::new(factory);
        let producer_factory = Arc::clone(&factory);
        let consume_task = tokio::spawn(async move {
            let envelope = consumer
                .consume(&CancelToken::never())
                .await
                .expect("consume")
                .expect("event after idle latch");
            envelope.event().timestamp_ms
        });

        // The latch fires on idleness even though no event ever arrived.
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("idle latch should fire");

        produce(&producer_factory, "t", 42).await;
        let delivered = tokio::time::timeout(Duration::from_secs(1), consume_task)
            .await
            .expect("late event should be delivered")
            .expect("task should not panic");
        assert_eq!(delivered, 42);
    }

    #[tokio::test]
    async fn cancellation_latches() {
        let factory = MemoryTopicFactory::new();
        let topic = factory.make("t").await.expect("make");
        let inner = topic
            .consumer(&ConsumerGroup::anonymous(StartFrom::Beginning))
            .await
            .expect("consumer");
        // An hour-long idle window: only cancellation can latch.
        let mut consumer = CatchUpConsumer::new(
            "t",
            inner,
            CatchUpOptions {
                catch_up_idle: Duration::from_secs(3600),
                ..CatchUpOptions::default()
            },
        );

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        consumer.set_on_catch_up(Box::new(move |reason| {
            assert_eq!(reason, CatchUpReason::Cancelled);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let canceller = Canceller::new();
        let token = canceller.token();
        let task = tokio::spawn(async move { consumer.consume(&token).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cancel should wake")
            .expect("no panic")
            .expect("no substrate error");
        assert!(outcome.is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_fires_exactly_once() {
        let factory = MemoryTopicFactory::new();
        for _ in 0..3 {
            produce(&factory, "t", now_millis()).await;
        }
        let mut consumer = catch_up_consumer(&factory, "t").await;

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        consumer.set_on_catch_up(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..3 {
            let envelope = consumer
                .consume(&CancelToken::never())
                .await
                .expect("consume")
                .expect("event");
            drop(envelope);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
