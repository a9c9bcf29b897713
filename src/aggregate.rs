//! Aggregates: named partition boundaries over sets of event types.
//!
//! An [`Aggregate`] scopes event types so that all events of one entity
//! land on the same partition: every bound type must be a record with an
//! `id` field, the partition key is derived from `id` (never supplied by
//! the caller), and the aggregate name prefixes every scoped topic name.

use std::sync::Arc;

use crate::error::AggregateError;
use crate::event_type::{EventProducer, EventType, ProducerOptions};
use crate::read_model::{ReadModel, ReadModelClientFactory, ReadModelHandle, StartOptions};
use crate::schema::SchemaError;
use crate::topic::TopicFactory;

/// A named aggregate bound to a topic substrate.
#[derive(Clone)]
pub struct Aggregate {
    name: String,
    topics: Arc<dyn TopicFactory>,
}

impl std::fmt::Debug for Aggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregate")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Aggregate {
    /// Declare an aggregate over a topic substrate.
    pub fn new(name: impl Into<String>, topics: Arc<dyn TopicFactory>) -> Self {
        Self {
            name: name.into(),
            topics,
        }
    }

    /// The aggregate's name, the first token of every scoped topic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rebind an event type into this aggregate.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] unless the type's schema is a record
    /// declaring an `id` field.
    pub fn bind(&self, event_type: &EventType) -> Result<EventType, SchemaError> {
        event_type.rebind_aggregate(&self.name)
    }

    /// Open a producer for an event type within this aggregate.
    ///
    /// The producer derives partition keys from each event's `id` and
    /// rejects caller-supplied keys.
    ///
    /// # Errors
    ///
    /// Binding failures and migration failures, as [`AggregateError`].
    pub async fn use_event_type(
        &self,
        event_type: &EventType,
        options: ProducerOptions,
    ) -> Result<EventProducer, AggregateError> {
        let bound = self.bind(event_type)?;
        Ok(bound.producer(self.topics.as_ref(), options).await?)
    }

    /// Pair this aggregate with a read-model client factory, for
    /// starting read models over aggregate-scoped topics.
    pub fn with_client_factory<'a, F>(&'a self, clients: &'a F) -> AggregateReadModels<'a, F>
    where
        F: ReadModelClientFactory,
    {
        AggregateReadModels {
            aggregate: self,
            clients,
        }
    }
}

/// An [`Aggregate`] paired with a client factory.
pub struct AggregateReadModels<'a, F> {
    aggregate: &'a Aggregate,
    clients: &'a F,
}

impl<F: ReadModelClientFactory> AggregateReadModels<'_, F> {
    /// Start a read model with every ingested event type rebound into
    /// the aggregate, so consumption targets the same scoped topics the
    /// aggregate's producers publish to.
    ///
    /// # Errors
    ///
    /// Binding and start failures, as [`AggregateError`].
    pub async fn use_read_model(
        &self,
        model: &ReadModel<F::Client>,
        options: StartOptions,
    ) -> Result<ReadModelHandle<F::Client>, AggregateError> {
        let bound = model.rebind_aggregate(self.aggregate.name())?;
        Ok(bound
            .start(self.aggregate.topics.as_ref(), self.clients, options)
            .await?)
    }
}
