//! Forward replication between the topics of an evolution chain.
//!
//! Each evolution operator appends a [`Migrator`]: an idempotent,
//! once-per-process replicator from the previous event type's topic into
//! the derived one. Running a migrator opens a *named* consumer group
//! (`"{source}-{destination}"`, from the beginning) so replication is
//! resumable across restarts and cooperatively shared across processes:
//! the substrate's own offset tracking skips already-replicated events.
//!
//! Replication preserves the original event timestamp and partition key,
//! keeping downstream ordering and aggregation stable across the chain.
//! At-least-once in means at-least-once out; downstream consumers must
//! be idempotent.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{watch, Mutex, OnceCell};
use tokio::task::JoinHandle;

use crate::cancel::{CancelToken, Canceller};
use crate::catch_up::{CatchUpConsumer, CatchUpReason};
use crate::codec::Codec;
use crate::error::{BoxError, MigrateError};
use crate::event_type::{ProducerOptions, TypeIdentity};
use crate::topic::{ConsumerGroup, RawEvent, StartFrom, TopicFactory, TopicProducer};

/// A fallible event transformation yielding zero or more output events.
pub(crate) type TransformFn = Arc<dyn Fn(Value) -> Result<Vec<Value>, BoxError> + Send + Sync>;

/// Progress of a running migration, observed through a watch channel.
#[derive(Debug, Clone)]
enum MigrationState {
    /// Still replicating history.
    Replaying,
    /// Caught up with the source; the destination producer may publish.
    Live,
    /// The replication loop stopped on an error.
    Failed {
        message: String,
        /// Whether catch-up had completed before the failure; waiters on
        /// the ready signal only reject for pre-catch-up failures.
        was_live: bool,
    },
}

struct MigratorInner {
    source: TypeIdentity,
    destination: TypeIdentity,
    transform: TransformFn,
    /// Once-per-process run state; concurrent `run` calls land on the
    /// same cell and receive the same handle.
    run_state: OnceCell<Arc<RunningMigration>>,
}

/// One link of an evolution chain: a replicator from the source type's
/// topic to the destination type's topic under a forward transform.
#[derive(Clone)]
pub struct Migrator {
    inner: Arc<MigratorInner>,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("source", &self.inner.source)
            .field("destination", &self.inner.destination)
            .field("started", &self.inner.run_state.initialized())
            .finish_non_exhaustive()
    }
}

impl Migrator {
    pub(crate) fn new(
        source: TypeIdentity,
        destination: TypeIdentity,
        transform: TransformFn,
    ) -> Self {
        Self {
            inner: Arc::new(MigratorInner {
                source,
                destination,
                transform,
                run_state: OnceCell::new(),
            }),
        }
    }

    /// The same chain link with untouched identities but fresh run
    /// state. Used when a chain is rebound into an aggregate, where the
    /// scoped topics are distinct from the unscoped ones.
    pub(crate) fn with_fresh_run_state(&self) -> Self {
        Self {
            inner: Arc::new(MigratorInner {
                source: self.inner.source.clone(),
                destination: self.inner.destination.clone(),
                transform: Arc::clone(&self.inner.transform),
                run_state: OnceCell::new(),
            }),
        }
    }

    /// Start (or join) the replication for this link.
    ///
    /// Idempotent: the first call spawns the replication loop; every
    /// call, including concurrent ones, resolves to the same
    /// [`RunningMigration`]. Options from the first caller win.
    ///
    /// # Errors
    ///
    /// Returns a [`MigrateError`] if resolving topics or opening the
    /// consumer or producer fails. Failures inside the spawned loop are
    /// reported through [`RunningMigration::caught_up`].
    pub(crate) async fn run(
        &self,
        factory: &dyn TopicFactory,
        aggregate: Option<&str>,
        options: &ProducerOptions,
    ) -> Result<Arc<RunningMigration>, MigrateError> {
        self.inner
            .run_state
            .get_or_try_init(|| self.start(factory, aggregate, options))
            .await
            .cloned()
    }

    async fn start(
        &self,
        factory: &dyn TopicFactory,
        aggregate: Option<&str>,
        options: &ProducerOptions,
    ) -> Result<Arc<RunningMigration>, MigrateError> {
        let source_topic = factory.make(&self.inner.source.topic_name(aggregate)).await?;
        let destination_topic = factory
            .make(&self.inner.destination.topic_name(aggregate))
            .await?;

        // One group name per source/destination pair: at most one group
        // migrates the pair, so multiple processes cooperate instead of
        // duplicating work.
        let group = ConsumerGroup::named(
            format!("{}-{}", source_topic.name(), destination_topic.name()),
            StartFrom::Beginning,
        );
        let consumer = source_topic.consumer(&group).await?;
        let mut catch_up =
            CatchUpConsumer::new(source_topic.name(), consumer, options.catch_up.clone());
        let producer = destination_topic.producer().await?;

        let (state_tx, state_rx) = watch::channel(MigrationState::Replaying);
        let state_tx = Arc::new(state_tx);

        let latch_tx = Arc::clone(&state_tx);
        catch_up.set_on_catch_up(Box::new(move |_: CatchUpReason| {
            latch_tx.send_if_modified(|state| match state {
                MigrationState::Replaying => {
                    *state = MigrationState::Live;
                    true
                }
                _ => false,
            });
        }));

        let canceller = Canceller::new();
        let token = canceller.token();
        let codec = Arc::clone(&options.codec);
        let transform = Arc::clone(&self.inner.transform);
        let source_name = source_topic.name().to_string();
        let destination_name = destination_topic.name().to_string();

        tracing::info!(
            source = %source_name,
            destination = %destination_name,
            group = %group.name,
            "migration starting"
        );

        let task = tokio::spawn(async move {
            if let Err(error) = replicate(catch_up, producer, transform, codec, token).await {
                tracing::error!(
                    source = %source_name,
                    destination = %destination_name,
                    error = %error,
                    "migration failed"
                );
                state_tx.send_if_modified(|state| {
                    let was_live = matches!(state, MigrationState::Live);
                    *state = MigrationState::Failed {
                        message: error.to_string(),
                        was_live,
                    };
                    true
                });
            }
        });

        Ok(Arc::new(RunningMigration {
            state: state_rx,
            canceller,
            task: Mutex::new(Some(task)),
        }))
    }
}

/// The replication loop: consume, transform, re-produce with the
/// original timestamp and key, ack; nack and stop on any failure.
async fn replicate(
    mut consumer: CatchUpConsumer,
    producer: Box<dyn TopicProducer>,
    transform: TransformFn,
    codec: Arc<dyn Codec>,
    cancel: CancelToken,
) -> Result<(), MigrateError> {
    loop {
        let Some(envelope) = consumer.consume(&cancel).await? else {
            // Cancellation: the loop exits cleanly.
            return Ok(());
        };
        let value = match codec.deserialize(&envelope.event().payload) {
            Ok(value) => value,
            Err(error) => {
                envelope.nack();
                return Err(error.into());
            }
        };
        let outputs = match transform(value) {
            Ok(outputs) => outputs,
            Err(error) => {
                envelope.nack();
                return Err(MigrateError::Transform(error));
            }
        };
        for output in outputs {
            let payload = match codec.serialize(&output) {
                Ok(payload) => payload,
                Err(error) => {
                    envelope.nack();
                    return Err(error.into());
                }
            };
            let event = RawEvent {
                timestamp_ms: envelope.event().timestamp_ms,
                payload,
            };
            let key = envelope.key().map(<[u8]>::to_vec);
            if let Err(error) = producer.produce(event, key).await {
                envelope.nack();
                return Err(error.into());
            }
        }
        envelope.ack();
    }
}

/// A live replication: the source consumer and destination producer,
/// owned by the spawned loop, plus the ready signal and cancel scope.
///
/// Dropping the handle does not stop the loop; call
/// [`shutdown`](RunningMigration::shutdown) for graceful termination.
pub struct RunningMigration {
    state: watch::Receiver<MigrationState>,
    canceller: Canceller,
    /// Taken and awaited exactly once by `shutdown`.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RunningMigration {
    /// Whether the migration has caught up with its source.
    pub fn is_caught_up(&self) -> bool {
        matches!(
            &*self.state.borrow(),
            MigrationState::Live | MigrationState::Failed { was_live: true, .. }
        )
    }

    /// Wait until this migration has caught up with its source, so the
    /// destination topic holds the full migrated history.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Failed`] if the replication loop failed
    /// before catching up.
    pub async fn caught_up(&self) -> Result<(), MigrateError> {
        let mut state = self.state.clone();
        loop {
            match &*state.borrow_and_update() {
                MigrationState::Live => return Ok(()),
                MigrationState::Failed { was_live: true, .. } => return Ok(()),
                MigrationState::Failed { message, .. } => {
                    return Err(MigrateError::Failed(message.clone()));
                }
                MigrationState::Replaying => {}
            }
            if state.changed().await.is_err() {
                return Err(MigrateError::Failed(
                    "migration stopped before catch-up".to_string(),
                ));
            }
        }
    }

    /// Cancel the replication loop and wait for it to exit. Safe to call
    /// more than once.
    pub async fn shutdown(&self) {
        self.canceller.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                tracing::error!(error = %error, "migration task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    use crate::catch_up::CatchUpOptions;
    use crate::event_type::ProducerOptions;
    use crate::memory::MemoryTopicFactory;

    fn identity(name: &str, nonce: u32) -> TypeIdentity {
        TypeIdentity {
            name: name.to_string(),
            schema_string: "{\n  n: Number\n}".to_string(),
            nonce,
        }
    }

    fn options() -> ProducerOptions {
        ProducerOptions {
            catch_up: CatchUpOptions {
                catch_up_idle: Duration::from_millis(50),
                ..CatchUpOptions::default()
            },
            ..ProducerOptions::default()
        }
    }

    fn doubling_migrator() -> Migrator {
        Migrator::new(
            identity("Counted", 0),
            identity("Counted", 1),
            Arc::new(|value: Value| {
                let n = value["n"].as_i64().unwrap_or(0);
                Ok(vec![json!({ "n": n * 2 })])
            }),
        )
    }

    async fn seed_source(factory: &MemoryTopicFactory, migrator: &Migrator, values: &[i64]) {
        let topic = factory
            .make(&migrator.inner.source.topic_name(None))
            .await
            .expect("make");
        let producer = topic.producer().await.expect("producer");
        for (i, n) in values.iter().enumerate() {
            producer
                .produce(
                    RawEvent {
                        timestamp_ms: 100 + i as i64,
                        payload: serde_json::to_vec(&json!({ "n": n })).expect("encode"),
                    },
                    Some(n.to_string().into_bytes()),
                )
                .await
                .expect("produce");
        }
    }

    async fn drain_destination(
        factory: &MemoryTopicFactory,
        migrator: &Migrator,
        expected: usize,
    ) -> Vec<(i64, Value, Option<Vec<u8>>)> {
        let topic = factory
            .make(&migrator.inner.destination.topic_name(None))
            .await
            .expect("make");
        let mut consumer = topic
            .consumer(&ConsumerGroup::anonymous(StartFrom::Beginning))
            .await
            .expect("consumer");
        let mut drained = Vec::new();
        for _ in 0..expected {
            let envelope = tokio::time::timeout(
                Duration::from_secs(2),
                consumer.consume(&CancelToken::never()),
            )
            .await
            .expect("replicated event should arrive")
            .expect("consume")
            .expect("event");
            drained.push((
                envelope.event().timestamp_ms,
                serde_json::from_slice(&envelope.event().payload).expect("decode"),
                envelope.key().map(<[u8]>::to_vec),
            ));
        }
        drained
    }

    #[tokio::test]
    async fn replicates_history_preserving_timestamps_and_keys() {
        let factory = MemoryTopicFactory::new();
        let migrator = doubling_migrator();
        seed_source(&factory, &migrator, &[1, 2, 3]).await;

        let running = migrator
            .run(&factory, None, &options())
            .await
            .expect("run should start");
        running.caught_up().await.expect("should catch up");

        let drained = drain_destination(&factory, &migrator, 3).await;
        assert_eq!(drained[0], (100, json!({"n": 2}), Some(b"1".to_vec())));
        assert_eq!(drained[1], (101, json!({"n": 4}), Some(b"2".to_vec())));
        assert_eq!(drained[2], (102, json!({"n": 6}), Some(b"3".to_vec())));

        running.shutdown().await;
    }

    #[tokio::test]
    async fn keeps_tailing_after_catch_up() {
        let factory = MemoryTopicFactory::new();
        let migrator = doubling_migrator();
        let running = migrator
            .run(&factory, None, &options())
            .await
            .expect("run should start");
        running.caught_up().await.expect("empty source catches up");

        seed_source(&factory, &migrator, &[5]).await;
        let drained = drain_destination(&factory, &migrator, 1).await;
        assert_eq!(drained[0].1, json!({"n": 10}));

        running.shutdown().await;
    }

    #[tokio::test]
    async fn run_is_idempotent() {
        let factory = MemoryTopicFactory::new();
        let migrator = doubling_migrator();
        seed_source(&factory, &migrator, &[1]).await;

        let opts1 = options();
        let opts2 = options();
        let (first, second) = tokio::join!(
            migrator.run(&factory, None, &opts1),
            migrator.run(&factory, None, &opts2),
        );
        let first = first.expect("first run");
        let second = second.expect("second run");
        assert!(
            Arc::ptr_eq(&first, &second),
            "concurrent runs must share one RunningMigration"
        );

        first.caught_up().await.expect("catch up");
        // One replication, not two: the destination holds exactly one event.
        let destination_name = migrator.inner.destination.topic_name(None);
        assert_eq!(factory.log_len(&destination_name), Some(1));

        first.shutdown().await;
    }

    #[tokio::test]
    async fn flat_map_transforms_fan_out_in_order() {
        let factory = MemoryTopicFactory::new();
        let migrator = Migrator::new(
            identity("Counted", 0),
            identity("Counted", 9),
            Arc::new(|value: Value| {
                let n = value["n"].as_i64().unwrap_or(0);
                Ok(vec![json!({"n": n}), json!({"n": -n})])
            }),
        );
        seed_source(&factory, &migrator, &[7]).await;

        let running = migrator
            .run(&factory, None, &options())
            .await
            .expect("run");
        running.caught_up().await.expect("catch up");

        let drained = drain_destination(&factory, &migrator, 2).await;
        assert_eq!(drained[0].1, json!({"n": 7}));
        assert_eq!(drained[1].1, json!({"n": -7}));
        assert_eq!(drained[0].0, drained[1].0, "fan-out keeps the source timestamp");

        running.shutdown().await;
    }

    #[tokio::test]
    async fn transform_failure_rejects_the_ready_signal() {
        let factory = MemoryTopicFactory::new();
        let migrator = Migrator::new(
            identity("Counted", 0),
            identity("Counted", 2),
            Arc::new(|_| Err("boom".into())),
        );
        seed_source(&factory, &migrator, &[1]).await;

        let running = migrator
            .run(&factory, None, &options())
            .await
            .expect("run starts even though the loop will fail");
        let err = running
            .caught_up()
            .await
            .expect_err("failure before catch-up must surface");
        assert!(err.to_string().contains("boom"));

        running.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let factory = MemoryTopicFactory::new();
        let migrator = doubling_migrator();
        let running = migrator
            .run(&factory, None, &options())
            .await
            .expect("run");
        running.caught_up().await.expect("catch up");

        tokio::time::timeout(Duration::from_secs(1), running.shutdown())
            .await
            .expect("shutdown should not hang");
        // Idempotent second shutdown.
        running.shutdown().await;
    }
}
