//! Crate-level error types for producing, consuming, migrating, and ingesting.

use crate::schema::SchemaError;

/// Boxed error type used wherever user code (transforms, handlers,
/// initializers) reports failures of its own choosing.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A transport error reported by a topic substrate adapter.
///
/// The framework never hides substrate errors: whatever the adapter
/// reports is propagated verbatim to the caller. Retries, if any, are
/// the substrate's responsibility.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct SubstrateError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl SubstrateError {
    /// Build a substrate error from a plain message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Build a substrate error wrapping an underlying transport error.
    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Error produced by a [`Codec`](crate::codec::Codec) while encoding or
/// decoding an event payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The value could not be encoded to bytes.
    #[error("failed to encode event payload: {0}")]
    Encode(#[source] BoxError),

    /// The bytes could not be decoded back into a value.
    #[error("failed to decode event payload: {0}")]
    Decode(#[source] BoxError),
}

/// Error returned when producing an event through an
/// [`EventProducer`](crate::event_type::EventProducer) fails.
#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    /// The event does not match the event type's declared schema.
    ///
    /// Never retried; the event is rejected before it reaches the
    /// substrate.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The event type is bound to an aggregate but the event's `id`
    /// field is absent or null, so no partition key can be derived.
    #[error("event inside aggregate has no usable \"id\" field to derive a partition key from")]
    MissingAggregateKey,

    /// A caller-supplied partition key was passed while producing within
    /// an aggregate, which derives keys from the event's `id` field.
    #[error("explicit partition keys are not allowed inside an aggregate")]
    AggregateKeyConflict,

    /// The payload could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The substrate rejected or failed the publish.
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

/// Error returned while consuming events through an
/// [`EventConsumer`](crate::event_type::EventConsumer).
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// A delivered payload could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The substrate consumer reported a transport error.
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

/// Error raised by a [`Migrator`](crate::migrator::Migrator) run.
///
/// A migrator failure is fatal for the chain link: the replication loop
/// stops and, if the migration had not yet caught up, waiters on the
/// ready signal observe the failure.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Opening topics, consumers, or producers failed.
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    /// A replicated payload could not be decoded or re-encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The user-supplied transform rejected an event.
    #[error("migration transform failed: {0}")]
    Transform(#[source] BoxError),

    /// The replication loop reported a failure before catching up.
    #[error("migration failed before catch-up: {0}")]
    Failed(String),
}

/// Error raised while the ingestion scheduler feeds events to handlers.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// A user-supplied handler rejected an event. The envelope was
    /// nacked; the substrate will redeliver after the read model is
    /// restarted.
    #[error("ingestor handler failed: {0}")]
    Handler(#[source] BoxError),

    /// Consuming from one of the underlying topics failed.
    #[error(transparent)]
    Consume(#[from] ConsumeError),
}

/// Error returned by [`ReadModel::start`](crate::read_model::ReadModel::start).
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// Making the client, topics, or consumers failed.
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    /// An initializer rejected the freshly made client.
    #[error("read model initializer failed: {0}")]
    Initializer(#[source] BoxError),

    /// The ingestion loop failed before catch-up completed.
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// A migration feeding one of the ingested topics failed.
    #[error(transparent)]
    Migrate(#[from] MigrateError),

    /// The client factory's catch-up hook failed.
    #[error("client factory on_catch_up failed: {0}")]
    OnCatchUp(#[source] BoxError),
}

/// Error returned by the [`Aggregate`](crate::aggregate::Aggregate)
/// conveniences, which bind declarations before producing or starting.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// The event type cannot live inside an aggregate (not a record, or
    /// no `id` field).
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Running the bound type's migration chain failed.
    #[error(transparent)]
    Migrate(#[from] MigrateError),

    /// Starting the bound read model failed.
    #[error(transparent)]
    Start(#[from] StartError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substrate_error_displays_message() {
        let err = SubstrateError::new("broker unavailable");
        assert_eq!(err.to_string(), "broker unavailable");
    }

    #[test]
    fn substrate_error_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = SubstrateError::with_source("flush failed", io);
        assert_eq!(err.to_string(), "flush failed");
        let source = std::error::Error::source(&err).expect("source should be attached");
        assert!(source.to_string().contains("pipe closed"));
    }

    #[test]
    fn produce_error_aggregate_variants_display() {
        assert!(
            ProduceError::MissingAggregateKey
                .to_string()
                .contains("\"id\"")
        );
        assert!(
            ProduceError::AggregateKeyConflict
                .to_string()
                .contains("aggregate")
        );
    }

    #[test]
    fn ingest_error_wraps_handler_failure() {
        let inner: BoxError = "constraint violation".into();
        let err = IngestError::Handler(inner);
        assert!(err.to_string().contains("ingestor handler failed"));
    }

    // Errors cross task boundaries inside tokio, so they must be Send + Sync.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<SubstrateError>();
            assert_send_sync::<CodecError>();
            assert_send_sync::<ProduceError>();
            assert_send_sync::<ConsumeError>();
            assert_send_sync::<MigrateError>();
            assert_send_sync::<IngestError>();
            assert_send_sync::<StartError>();
        }
    };
}
