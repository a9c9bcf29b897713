//! Substrate contracts: append-only partitioned topics, producers,
//! consumer groups, and at-least-once delivery envelopes.
//!
//! Everything here is substrate-agnostic. An adapter (the in-memory one
//! in [`crate::memory`], or an external broker/file adapter) implements
//! these traits; the rest of the framework only ever talks to them.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::SubstrateError;

/// The producer's wall clock at produce time, as Unix epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A single entry of an append-only topic log.
///
/// Serializable so file- and broker-backed adapters can persist entries
/// directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// The producer's clock at produce time (Unix epoch milliseconds).
    pub timestamp_ms: i64,
    /// Encoded event payload.
    pub payload: Vec<u8>,
}

/// Where a consumer group starts reading when it first attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartFrom {
    /// Replay the full history.
    Beginning,
    /// Only observe events appended after attaching.
    End,
}

/// Substrate-level coordination object sharing offset state across
/// participating consumers.
///
/// Multiple consumers with the same group name on the same topic share
/// offsets; anonymous groups get a fresh unique name and therefore never
/// share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroup {
    /// Group name; identical names share offsets.
    pub name: String,
    /// Start position when the group has no committed offsets yet.
    pub start_from: StartFrom,
}

impl ConsumerGroup {
    /// A named group. Consumers sharing the name share offsets.
    pub fn named(name: impl Into<String>, start_from: StartFrom) -> Self {
        Self {
            name: name.into(),
            start_from,
        }
    }

    /// A group with a freshly generated unique name.
    pub fn anonymous(start_from: StartFrom) -> Self {
        Self {
            name: format!("anonymous-{}", uuid::Uuid::new_v4()),
            start_from,
        }
    }
}

/// Resolves topic names to topics.
///
/// `make` must be idempotent: repeated calls with the same name return
/// topics sharing storage and offsets. It must be safe to call for any
/// name the framework derives (§ topic-name format).
#[async_trait]
pub trait TopicFactory: Send + Sync {
    /// Resolve (creating if needed) the topic with the given name.
    async fn make(&self, name: &str) -> Result<Arc<dyn Topic>, SubstrateError>;
}

/// A named append-only partitioned log of [`RawEvent`]s.
#[async_trait]
pub trait Topic: Send + Sync {
    /// The topic's name.
    fn name(&self) -> &str;

    /// Open a producer onto this topic.
    async fn producer(&self) -> Result<Box<dyn TopicProducer>, SubstrateError>;

    /// Join a consumer group and open a consumer onto this topic.
    async fn consumer(&self, group: &ConsumerGroup)
        -> Result<Box<dyn TopicConsumer>, SubstrateError>;
}

/// Publishes events onto a topic.
#[async_trait]
pub trait TopicProducer: Send + Sync {
    /// Publish an event with an optional partition key.
    ///
    /// Returns after the substrate's durability guarantee holds (broker
    /// commit acknowledged, file bytes flushed, in-memory enqueued).
    /// Delivery downstream is at-least-once.
    async fn produce(&self, event: RawEvent, key: Option<Vec<u8>>)
        -> Result<(), SubstrateError>;
}

/// Receives events from a topic on behalf of a consumer group.
#[async_trait]
pub trait TopicConsumer: Send {
    /// Wait for the next event or cancellation.
    ///
    /// Returns `Ok(None)` on clean shutdown or cancellation; a consumer
    /// that returned `None` stays `None`.
    ///
    /// Implementations must be cancel-safe: callers race this future
    /// against timers, so it may be dropped before completion and
    /// re-issued without losing an event.
    async fn consume(&mut self, cancel: &CancelToken)
        -> Result<Option<Envelope>, SubstrateError>;
}

/// Substrate-side acknowledgement for one delivered envelope.
///
/// Implementations are fire-and-forget: both calls hand the decision
/// back to the substrate without waiting for it to act.
pub trait AckHandle: Send {
    /// Mark the delivery as processed.
    fn ack(self: Box<Self>);
    /// Return the delivery for redelivery.
    fn nack(self: Box<Self>);
}

/// An at-least-once delivery unit.
///
/// Dropping an envelope without an explicit [`nack`](Envelope::nack)
/// acknowledges it, so the happy path needs no extra call while a failed
/// handler can hand the event back for redelivery.
pub struct Envelope {
    event: RawEvent,
    key: Option<Vec<u8>>,
    ack: Option<Box<dyn AckHandle>>,
}

impl Envelope {
    /// Wrap a delivered event with its acknowledgement handle.
    pub fn new(event: RawEvent, key: Option<Vec<u8>>, ack: Box<dyn AckHandle>) -> Self {
        Self {
            event,
            key,
            ack: Some(ack),
        }
    }

    /// The delivered event.
    pub fn event(&self) -> &RawEvent {
        &self.event
    }

    /// The partition key the event was produced with, if any.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Explicitly acknowledge the delivery. Equivalent to dropping.
    pub fn ack(mut self) {
        if let Some(ack) = self.ack.take() {
            ack.ack();
        }
    }

    /// Negatively acknowledge: the substrate will redeliver.
    pub fn nack(mut self) {
        if let Some(ack) = self.ack.take() {
            ack.nack();
        }
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        if let Some(ack) = self.ack.take() {
            ack.ack();
        }
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("event", &self.event)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use std::sync::Mutex;

    /// Records ack/nack outcomes for assertions.
    #[derive(Default)]
    pub(crate) struct AckRecorder {
        pub outcomes: Mutex<Vec<&'static str>>,
    }

    pub(crate) struct RecordingAck(pub Arc<AckRecorder>);

    impl AckHandle for RecordingAck {
        fn ack(self: Box<Self>) {
            self.0.outcomes.lock().expect("lock").push("ack");
        }
        fn nack(self: Box<Self>) {
            self.0.outcomes.lock().expect("lock").push("nack");
        }
    }

    pub(crate) fn envelope_with(recorder: &Arc<AckRecorder>) -> Envelope {
        Envelope::new(
            RawEvent {
                timestamp_ms: 1,
                payload: b"{}".to_vec(),
            },
            None,
            Box::new(RecordingAck(Arc::clone(recorder))),
        )
    }
}
