//! In-memory topic substrate for testing and single-process scenarios.
//!
//! Topics share an append-only log guarded by a mutex; each consumer
//! group tracks its own cursor plus a redelivery queue fed by nacks.
//! Producer durability is "enqueued". Per-topic delivery is strict FIFO,
//! which satisfies the per-partition ordering contract trivially.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::cancel::CancelToken;
use crate::error::SubstrateError;
use crate::topic::{
    AckHandle, ConsumerGroup, Envelope, RawEvent, StartFrom, Topic, TopicConsumer, TopicFactory,
    TopicProducer,
};

/// An idempotent in-memory [`TopicFactory`].
///
/// Repeated [`make`](TopicFactory::make) calls with the same name return
/// handles onto the same log and group offsets.
#[derive(Default)]
pub struct MemoryTopicFactory {
    topics: Mutex<HashMap<String, Arc<MemoryTopic>>>,
}

impl MemoryTopicFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events appended to the named topic, if it exists.
    ///
    /// Test helper: lets assertions verify that replication did not
    /// duplicate events.
    pub fn log_len(&self, name: &str) -> Option<usize> {
        let topics = self.topics.lock().expect("topic registry poisoned");
        topics
            .get(name)
            .map(|t| t.state.entries.lock().expect("topic log poisoned").len())
    }

    /// Names of all topics that have been resolved so far.
    pub fn topic_names(&self) -> Vec<String> {
        let topics = self.topics.lock().expect("topic registry poisoned");
        topics.keys().cloned().collect()
    }
}

#[async_trait]
impl TopicFactory for MemoryTopicFactory {
    async fn make(&self, name: &str) -> Result<Arc<dyn Topic>, SubstrateError> {
        let mut topics = self.topics.lock().expect("topic registry poisoned");
        let topic = topics
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryTopic {
                    name: name.to_string(),
                    state: Arc::new(TopicState::default()),
                })
            })
            .clone();
        Ok(topic)
    }
}

/// One in-memory topic: a shared log plus per-group cursors.
pub struct MemoryTopic {
    name: String,
    state: Arc<TopicState>,
}

#[derive(Clone)]
struct LogEntry {
    event: RawEvent,
    key: Option<Vec<u8>>,
}

#[derive(Default)]
struct TopicState {
    entries: Mutex<Vec<LogEntry>>,
    /// Woken on append and on nack so parked consumers re-check.
    appended: Notify,
    groups: Mutex<HashMap<String, Arc<GroupState>>>,
}

struct GroupState {
    queue: Mutex<GroupQueue>,
}

struct GroupQueue {
    /// Next unread log index for this group.
    cursor: usize,
    /// Indexes handed back by nack, delivered before new reads.
    redeliver: VecDeque<usize>,
}

#[async_trait]
impl Topic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn producer(&self) -> Result<Box<dyn TopicProducer>, SubstrateError> {
        Ok(Box::new(MemoryProducer {
            state: Arc::clone(&self.state),
        }))
    }

    async fn consumer(
        &self,
        group: &ConsumerGroup,
    ) -> Result<Box<dyn TopicConsumer>, SubstrateError> {
        let group_state = {
            let mut groups = self.state.groups.lock().expect("group registry poisoned");
            groups
                .entry(group.name.clone())
                .or_insert_with(|| {
                    let cursor = match group.start_from {
                        StartFrom::Beginning => 0,
                        StartFrom::End => {
                            self.state.entries.lock().expect("topic log poisoned").len()
                        }
                    };
                    Arc::new(GroupState {
                        queue: Mutex::new(GroupQueue {
                            cursor,
                            redeliver: VecDeque::new(),
                        }),
                    })
                })
                .clone()
        };
        Ok(Box::new(MemoryConsumer {
            state: Arc::clone(&self.state),
            group: group_state,
        }))
    }
}

struct MemoryProducer {
    state: Arc<TopicState>,
}

#[async_trait]
impl TopicProducer for MemoryProducer {
    async fn produce(&self, event: RawEvent, key: Option<Vec<u8>>) -> Result<(), SubstrateError> {
        {
            let mut entries = self.state.entries.lock().expect("topic log poisoned");
            entries.push(LogEntry { event, key });
        }
        self.state.appended.notify_waiters();
        Ok(())
    }
}

struct MemoryConsumer {
    state: Arc<TopicState>,
    group: Arc<GroupState>,
}

impl MemoryConsumer {
    /// Pop the next deliverable log index: redeliveries first, then the
    /// group cursor.
    fn try_next(&self) -> Option<usize> {
        let len = self.state.entries.lock().expect("topic log poisoned").len();
        let mut queue = self.group.queue.lock().expect("group queue poisoned");
        if let Some(index) = queue.redeliver.pop_front() {
            return Some(index);
        }
        if queue.cursor < len {
            let index = queue.cursor;
            queue.cursor += 1;
            return Some(index);
        }
        None
    }

    fn deliver(&self, index: usize) -> Envelope {
        let entry = self.state.entries.lock().expect("topic log poisoned")[index].clone();
        Envelope::new(
            entry.event,
            entry.key,
            Box::new(MemoryAck {
                state: Arc::clone(&self.state),
                group: Arc::clone(&self.group),
                index,
            }),
        )
    }
}

#[async_trait]
impl TopicConsumer for MemoryConsumer {
    async fn consume(&mut self, cancel: &CancelToken) -> Result<Option<Envelope>, SubstrateError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(index) = self.try_next() {
                return Ok(Some(self.deliver(index)));
            }
            // Register the waiter, then re-check: an append landing
            // between the check and the await would otherwise be missed.
            let appended = self.state.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();
            if let Some(index) = self.try_next() {
                return Ok(Some(self.deliver(index)));
            }
            tokio::select! {
                _ = &mut appended => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }
}

struct MemoryAck {
    state: Arc<TopicState>,
    group: Arc<GroupState>,
    index: usize,
}

impl AckHandle for MemoryAck {
    fn ack(self: Box<Self>) {
        // The cursor already advanced past this index; nothing to commit.
    }

    fn nack(self: Box<Self>) {
        {
            let mut queue = self.group.queue.lock().expect("group queue poisoned");
            queue.redeliver.push_back(self.index);
        }
        self.state.appended.notify_waiters();
    }
}
