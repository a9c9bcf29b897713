//! Event-sourced application framework over append-only log substrates.
//!
//! `topicfold` lets applications declare typed **event types** with
//! runtime schema validation, produce events into durable,
//! partition-keyed **topics**, and derive **read models** by
//! continuously projecting one or more topics into an external
//! datastore. Schema evolution is first-class: each evolution operator
//! derives a fresh content-addressed topic and a **migrator** that
//! forward-replicates the old topic into it on demand.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`Schema`] | Recursive structural schema with validation and a canonical string form |
//! | [`EventType`] | Immutable declaration whose identity determines a topic name; evolution operators |
//! | [`EventProducer`] / [`EventConsumer`] | Schema-checked publishing and catch-up consumption |
//! | [`RunningMigration`] | A live topic-to-topic replication with a ready signal |
//! | [`ReadModel`] | Ingestors + initializers projected into a client, with an N-way time-ordered merge |
//! | [`Aggregate`] | Partition boundary deriving keys from a record's `id` field |
//! | [`MemoryTopicFactory`] | In-memory substrate for tests and single-process apps |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use topicfold::{
//!     CasingPolicy, EventType, MemoryTopicFactory, OperatorOptions, ReadModel,
//!     ReadModelClientFactory, Schema, SubstrateError,
//! };
//!
//! // A list-backed read-model client.
//! #[derive(Default)]
//! struct Titles(std::sync::Mutex<Vec<String>>);
//!
//! struct TitlesFactory;
//!
//! #[async_trait::async_trait]
//! impl ReadModelClientFactory for TitlesFactory {
//!     type Client = Titles;
//!     fn naming_convention(&self) -> CasingPolicy { CasingPolicy::Snake }
//!     async fn make(&self, _namespace: &str) -> Result<Titles, SubstrateError> {
//!         Ok(Titles::default())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // 1. Declare an event type.
//! let registered = EventType::new(
//!     "Registered",
//!     Schema::record([("id", Schema::string()), ("title", Schema::string())]),
//! );
//!
//! // 2. Produce onto its content-addressed topic.
//! let topics = MemoryTopicFactory::new();
//! let producer = registered.producer(&topics, Default::default()).await?;
//! producer.produce(json!({"id": "a", "title": "A"}), None).await?;
//!
//! // 3. Project into a read model; `start` returns once caught up.
//! let model = ReadModel::new("titles").on(
//!     &registered,
//!     |event, client: Arc<Titles>, _key| async move {
//!         let title = event.message["title"].as_str().unwrap_or_default().to_string();
//!         client.0.lock().unwrap().push(title);
//!         Ok(())
//!     },
//!     OperatorOptions::default(),
//! );
//! let handle = model.start(&topics, &TitlesFactory, Default::default()).await?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod aggregate;
mod cancel;
mod casing;
mod catch_up;
mod codec;
mod error;
mod event_type;
mod memory;
mod merge;
mod migrator;
mod read_model;
mod schema;
mod topic;

pub mod logging;

pub use aggregate::{Aggregate, AggregateReadModels};
pub use cancel::{CancelToken, Canceller};
pub use casing::CasingPolicy;
pub use catch_up::{CatchUpCallback, CatchUpConsumer, CatchUpOptions, CatchUpReason, CatchUpSignal};
pub use codec::{Codec, JsonCodec};
pub use error::{
    AggregateError, BoxError, CodecError, ConsumeError, IngestError, MigrateError, ProduceError,
    StartError, SubstrateError,
};
pub use event_type::{
    AddedField, ConsumerOptions, Event, EventConsumer, EventEnvelope, EventProducer, EventType,
    OperatorOptions, ProducerOptions,
};
pub use memory::{MemoryTopic, MemoryTopicFactory};
pub use migrator::{Migrator, RunningMigration};
pub use read_model::{
    ReadModel, ReadModelClientFactory, ReadModelHandle, StartOptions,
};
pub use schema::{Schema, SchemaError};
pub use topic::{
    AckHandle, ConsumerGroup, Envelope, RawEvent, StartFrom, Topic, TopicConsumer, TopicFactory,
    TopicProducer,
};
