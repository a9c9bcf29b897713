//! Typed event declarations: schema-checked production, consumption, and
//! the algebraic evolution operators.
//!
//! An [`EventType`] is an immutable value `(name, schema, nonce,
//! migrators, aggregate?)`. Its identity determines a content-addressed
//! topic name, so any schema change or nonce bump yields a fresh topic
//! while the old declaration keeps working against its own topic. The
//! evolution operators ([`add_fields`](EventType::add_fields),
//! [`remove_fields`](EventType::remove_fields), [`map`](EventType::map),
//! [`flat_map`](EventType::flat_map), [`filter`](EventType::filter),
//! [`turn_fields_optional`](EventType::turn_fields_optional)) each append
//! a [`Migrator`] that forward-replicates the previous topic into the new
//! one on demand.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::cancel::CancelToken;
use crate::catch_up::{CatchUpCallback, CatchUpConsumer, CatchUpOptions, CatchUpSignal};
use crate::codec::{default_codec, Codec};
use crate::error::{ConsumeError, MigrateError, ProduceError, SubstrateError};
use crate::migrator::{Migrator, RunningMigration, TransformFn};
use crate::schema::{Schema, SchemaError};
use crate::topic::{now_millis, ConsumerGroup, Envelope, RawEvent, Topic, TopicFactory, TopicProducer};

/// Lowercase 40-character hex SHA-1, the content-addressing hash for
/// topic names and read-model namespaces.
pub(crate) fn sha1_hex(input: &str) -> String {
    hex::encode(Sha1::digest(input.as_bytes()))
}

/// The identity triple that determines an event type's topic name.
///
/// Captured by migrators at chain-construction time; a topic name is a
/// pure function of this identity plus the optional aggregate name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TypeIdentity {
    pub(crate) name: String,
    pub(crate) schema_string: String,
    pub(crate) nonce: u32,
}

impl TypeIdentity {
    /// The declaration string fed to the topic-name hash.
    pub(crate) fn decl_string(&self, in_aggregate: bool) -> String {
        if in_aggregate {
            format!("{} (agg) {}", self.name, self.schema_string)
        } else {
            format!("{} {}", self.name, self.schema_string)
        }
    }

    /// Derive the content-addressed topic name.
    pub(crate) fn topic_name(&self, aggregate: Option<&str>) -> String {
        let hash = sha1_hex(&format!(
            "{}{}",
            self.decl_string(aggregate.is_some()),
            self.nonce
        ));
        let mut tokens: Vec<&str> = Vec::new();
        if let Some(aggregate) = aggregate {
            if !aggregate.is_empty() {
                tokens.push(aggregate);
            }
        }
        if !self.name.is_empty() {
            tokens.push(&self.name);
        }
        tokens.push(&hash);
        tokens.join("-")
    }
}

struct EventTypeInner {
    name: String,
    schema: Schema,
    nonce: u32,
    aggregate: Option<String>,
    migrators: Vec<Migrator>,
}

/// An immutable, shareable event-type declaration.
///
/// Cloning is cheap (`Arc`); operators return new values sharing the
/// migrator-chain prefix.
#[derive(Clone)]
pub struct EventType {
    inner: Arc<EventTypeInner>,
}

impl std::fmt::Debug for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventType")
            .field("name", &self.inner.name)
            .field("nonce", &self.inner.nonce)
            .field("aggregate", &self.inner.aggregate)
            .field("topic", &self.topic_name())
            .field("chain_len", &self.inner.migrators.len())
            .finish()
    }
}

/// Optional nonce override for an evolution operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperatorOptions {
    /// The derived type's nonce. Defaults to 0, except for
    /// [`filter`](EventType::filter) with an unchanged schema, which
    /// bumps the source nonce to keep the topics distinct.
    pub nonce: Option<u32>,
}

impl OperatorOptions {
    /// Shorthand for an explicit nonce.
    pub fn nonce(nonce: u32) -> Self {
        Self { nonce: Some(nonce) }
    }
}

/// A field added by [`EventType::add_fields`]: its schema plus the pure
/// function computing its value from the historical event.
#[derive(Clone)]
pub struct AddedField {
    name: String,
    schema: Schema,
    compute: Arc<dyn Fn(&Value) -> Value + Send + Sync>,
}

impl AddedField {
    /// Declare a field named `name` of `schema`, backfilled by `compute`.
    pub fn new(
        name: impl Into<String>,
        schema: Schema,
        compute: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            compute: Arc::new(compute),
        }
    }
}

impl EventType {
    /// Declare an event type with nonce 0 and an empty migrator chain.
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self::with_nonce(name, schema, 0)
    }

    /// Declare an event type with an explicit nonce.
    ///
    /// Bumping the nonce is the way to force a fresh topic without
    /// changing the schema (e.g. to abandon a corrupted topic).
    pub fn with_nonce(name: impl Into<String>, schema: Schema, nonce: u32) -> Self {
        Self {
            inner: Arc::new(EventTypeInner {
                name: name.into(),
                schema,
                nonce,
                aggregate: None,
                migrators: Vec::new(),
            }),
        }
    }

    /// The declared name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The declared schema.
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// The declared nonce.
    pub fn nonce(&self) -> u32 {
        self.inner.nonce
    }

    /// The aggregate this type is bound to, if any.
    pub fn aggregate(&self) -> Option<&str> {
        self.inner.aggregate.as_deref()
    }

    pub(crate) fn identity(&self) -> TypeIdentity {
        TypeIdentity {
            name: self.inner.name.clone(),
            schema_string: self.inner.schema.render(),
            nonce: self.inner.nonce,
        }
    }

    /// The declaration string hashed into the topic name.
    pub fn decl_string(&self) -> String {
        self.identity().decl_string(self.inner.aggregate.is_some())
    }

    /// The content-addressed topic name:
    /// `[aggregate?, name, sha1(decl + nonce)]` joined by `-`.
    ///
    /// Equal declarations always derive equal names (same topic, same
    /// data); any schema or nonce change derives a fresh one.
    pub fn topic_name(&self) -> String {
        self.identity().topic_name(self.inner.aggregate.as_deref())
    }

    /// Resolve this type's topic through a substrate factory.
    pub async fn topic(
        &self,
        factory: &dyn TopicFactory,
    ) -> Result<Arc<dyn Topic>, SubstrateError> {
        factory.make(&self.topic_name()).await
    }

    // --- evolution operators -------------------------------------------

    /// Derive a type with extra record fields, backfilled for historical
    /// events by each field's `compute` function.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] if the current schema is not a record or
    /// a field name is already declared.
    pub fn add_fields(
        &self,
        fields: impl IntoIterator<Item = AddedField>,
        options: OperatorOptions,
    ) -> Result<EventType, SchemaError> {
        let added: Vec<AddedField> = fields.into_iter().collect();
        let mut merged = self
            .inner
            .schema
            .record_fields()
            .ok_or_else(|| SchemaError::new("add_fields requires a record schema"))?
            .to_vec();
        for field in &added {
            if merged.iter().any(|(name, _)| name == &field.name) {
                return Err(SchemaError::new(format!(
                    "field \"{}\" is already declared",
                    field.name
                )));
            }
            merged.push((field.name.clone(), field.schema.clone()));
        }

        let computes: Vec<(String, Arc<dyn Fn(&Value) -> Value + Send + Sync>)> = added
            .iter()
            .map(|f| (f.name.clone(), Arc::clone(&f.compute)))
            .collect();
        let transform: TransformFn = Arc::new(move |value: Value| {
            let Value::Object(mut object) = value.clone() else {
                return Err(format!("expected a record event, got {value}").into());
            };
            for (name, compute) in &computes {
                object.insert(name.clone(), compute(&value));
            }
            Ok(vec![Value::Object(object)])
        });

        Ok(self.chain(Schema::Record(merged), options.nonce.unwrap_or(0), transform))
    }

    /// Derive a type without the named record fields; historical events
    /// are replicated with those fields stripped.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] if the current schema is not a record or
    /// a name is not declared.
    pub fn remove_fields<N: Into<String>>(
        &self,
        names: impl IntoIterator<Item = N>,
        options: OperatorOptions,
    ) -> Result<EventType, SchemaError> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let fields = self
            .inner
            .schema
            .record_fields()
            .ok_or_else(|| SchemaError::new("remove_fields requires a record schema"))?;
        for name in &names {
            if !fields.iter().any(|(declared, _)| declared == name) {
                return Err(SchemaError::new(format!(
                    "cannot remove undeclared field \"{name}\""
                )));
            }
        }
        let remaining: Vec<(String, Schema)> = fields
            .iter()
            .filter(|(declared, _)| !names.contains(declared))
            .cloned()
            .collect();

        let stripped = names.clone();
        let transform: TransformFn = Arc::new(move |value: Value| {
            let Value::Object(mut object) = value else {
                return Err(format!("expected a record event, got {value}").into());
            };
            for name in &stripped {
                object.remove(name);
            }
            Ok(vec![Value::Object(object)])
        });

        Ok(self.chain(Schema::Record(remaining), options.nonce.unwrap_or(0), transform))
    }

    /// Derive a type where the named fields become optional. Historical
    /// events replicate unchanged (every present value already
    /// validates).
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] if the current schema is not a record or
    /// a name is not declared.
    pub fn turn_fields_optional<N: Into<String>>(
        &self,
        names: impl IntoIterator<Item = N>,
        options: OperatorOptions,
    ) -> Result<EventType, SchemaError> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let fields = self
            .inner
            .schema
            .record_fields()
            .ok_or_else(|| SchemaError::new("turn_fields_optional requires a record schema"))?;
        for name in &names {
            if !fields.iter().any(|(declared, _)| declared == name) {
                return Err(SchemaError::new(format!(
                    "cannot make undeclared field \"{name}\" optional"
                )));
            }
        }
        let relaxed: Vec<(String, Schema)> = fields
            .iter()
            .map(|(declared, schema)| {
                let schema = if names.contains(declared) && !matches!(schema, Schema::Optional(_))
                {
                    Schema::optional(schema.clone())
                } else {
                    schema.clone()
                };
                (declared.clone(), schema)
            })
            .collect();

        let transform: TransformFn = Arc::new(|value| Ok(vec![value]));
        Ok(self.chain(Schema::Record(relaxed), options.nonce.unwrap_or(0), transform))
    }

    /// Derive a type by transforming each event one-to-one.
    ///
    /// Sugar for [`flat_map`](EventType::flat_map) yielding a single
    /// event.
    pub fn map(
        &self,
        schema: Schema,
        f: impl Fn(Value) -> Result<Value, crate::error::BoxError> + Send + Sync + 'static,
        options: OperatorOptions,
    ) -> EventType {
        self.flat_map(schema, move |value| f(value).map(|v| vec![v]), options)
    }

    /// Derive a type by transforming each event into zero, one, or many
    /// events.
    pub fn flat_map(
        &self,
        schema: Schema,
        f: impl Fn(Value) -> Result<Vec<Value>, crate::error::BoxError> + Send + Sync + 'static,
        options: OperatorOptions,
    ) -> EventType {
        let nonce = options.nonce.unwrap_or(0);
        self.chain(schema, nonce, Arc::new(f))
    }

    /// Derive a type keeping only events matching `predicate`.
    ///
    /// The schema is unchanged, so without an explicit nonce the source
    /// nonce is bumped by one; otherwise the filtered and unfiltered
    /// streams would share a topic.
    pub fn filter(
        &self,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
        options: OperatorOptions,
    ) -> EventType {
        self.filter_with_schema(self.inner.schema.clone(), predicate, options)
    }

    /// Derive a filtered type under a narrowed schema (the type-guard
    /// form). The nonce auto-bumps only when the schema string is
    /// unchanged and no explicit nonce is given.
    pub fn filter_with_schema(
        &self,
        schema: Schema,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
        options: OperatorOptions,
    ) -> EventType {
        let nonce = options.nonce.unwrap_or_else(|| {
            if schema.render() == self.inner.schema.render() {
                self.inner.nonce + 1
            } else {
                0
            }
        });
        let transform: TransformFn = Arc::new(move |value: Value| {
            Ok(if predicate(&value) { vec![value] } else { Vec::new() })
        });
        self.chain(schema, nonce, transform)
    }

    /// Append a migrator from `self` to a derived type.
    fn chain(&self, schema: Schema, nonce: u32, transform: TransformFn) -> EventType {
        let destination = TypeIdentity {
            name: self.inner.name.clone(),
            schema_string: schema.render(),
            nonce,
        };
        let migrator = Migrator::new(self.identity(), destination, transform);
        let mut migrators = self.inner.migrators.clone();
        migrators.push(migrator);
        EventType {
            inner: Arc::new(EventTypeInner {
                name: self.inner.name.clone(),
                schema,
                nonce,
                aggregate: self.inner.aggregate.clone(),
                migrators,
            }),
        }
    }

    /// Rebind this declaration (and its whole chain) into an aggregate.
    ///
    /// Migrators get fresh run state: the aggregate-scoped topics are
    /// distinct from the unscoped ones, so any unscoped migration that
    /// already ran must not satisfy the scoped one.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] unless the schema is a record with an
    /// `id` field.
    pub(crate) fn rebind_aggregate(&self, aggregate: &str) -> Result<EventType, SchemaError> {
        let fields = self.inner.schema.record_fields().ok_or_else(|| {
            SchemaError::new("an event type inside an aggregate must be a record")
        })?;
        if !fields.iter().any(|(name, _)| name == "id") {
            return Err(SchemaError::new(
                "an event type inside an aggregate must declare an \"id\" field",
            ));
        }
        Ok(EventType {
            inner: Arc::new(EventTypeInner {
                name: self.inner.name.clone(),
                schema: self.inner.schema.clone(),
                nonce: self.inner.nonce,
                aggregate: Some(aggregate.to_string()),
                migrators: self
                    .inner
                    .migrators
                    .iter()
                    .map(Migrator::with_fresh_run_state)
                    .collect(),
            }),
        })
    }

    // --- producing and consuming ---------------------------------------

    /// Open a producer, first running every chain migrator and waiting
    /// for each to catch up with its source so the new topic holds the
    /// full migrated history before fresh events land on it.
    ///
    /// # Errors
    ///
    /// Returns a [`MigrateError`] if a migration fails to start or fails
    /// before catching up, or a substrate error opening the topic.
    pub async fn producer(
        &self,
        factory: &dyn TopicFactory,
        options: ProducerOptions,
    ) -> Result<EventProducer, MigrateError> {
        let mut migrations = Vec::with_capacity(self.inner.migrators.len());
        for migrator in &self.inner.migrators {
            let running = migrator
                .run(factory, self.inner.aggregate.as_deref(), &options)
                .await?;
            running.caught_up().await?;
            migrations.push(running);
        }

        let topic = self.topic(factory).await?;
        let inner = topic.producer().await?;
        tracing::debug!(topic = %topic.name(), "event producer ready");
        Ok(EventProducer {
            event_type: self.clone(),
            inner,
            codec: options.codec,
            migrations,
        })
    }

    /// Open a catch-up consumer mapping raw events to [`Event`]s.
    ///
    /// # Errors
    ///
    /// Returns the substrate error from resolving the topic or joining
    /// the group.
    pub async fn consumer(
        &self,
        factory: &dyn TopicFactory,
        group: ConsumerGroup,
        options: ConsumerOptions,
    ) -> Result<EventConsumer, SubstrateError> {
        let topic = self.topic(factory).await?;
        let raw = topic.consumer(&group).await?;
        let mut catch_up = CatchUpConsumer::new(topic.name(), raw, options.catch_up);
        if let Some(callback) = options.on_catch_up {
            catch_up.set_on_catch_up(callback);
        }
        Ok(EventConsumer {
            inner: catch_up,
            codec: options.codec,
        })
    }
}

/// Options for [`EventType::producer`]. Also passed through to the chain
/// migrations it runs.
#[derive(Clone)]
pub struct ProducerOptions {
    /// Catch-up tuning for the chain migrations.
    pub catch_up: CatchUpOptions,
    /// Payload codec; JSON text by default.
    pub codec: Arc<dyn Codec>,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            catch_up: CatchUpOptions::default(),
            codec: default_codec(),
        }
    }
}

impl std::fmt::Debug for ProducerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerOptions")
            .field("catch_up", &self.catch_up)
            .finish_non_exhaustive()
    }
}

/// Options for [`EventType::consumer`].
pub struct ConsumerOptions {
    /// Catch-up tuning.
    pub catch_up: CatchUpOptions,
    /// Payload codec; JSON text by default.
    pub codec: Arc<dyn Codec>,
    /// Invoked exactly once when the consumer catches up.
    pub on_catch_up: Option<CatchUpCallback>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            catch_up: CatchUpOptions::default(),
            codec: default_codec(),
            on_catch_up: None,
        }
    }
}

/// A schema-checked producer onto an event type's topic.
///
/// Owns the [`RunningMigration`] handles of the chain that fed the
/// topic. Dropping the producer does not stop the migrations' live
/// tails; call [`shutdown`](EventProducer::shutdown) to stop them.
pub struct EventProducer {
    event_type: EventType,
    inner: Box<dyn TopicProducer>,
    codec: Arc<dyn Codec>,
    migrations: Vec<Arc<RunningMigration>>,
}

impl EventProducer {
    /// The event type this producer publishes.
    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// The chain migrations kept alive by this producer.
    pub fn migrations(&self) -> &[Arc<RunningMigration>] {
        &self.migrations
    }

    /// Validate and publish an event.
    ///
    /// The partition key is the caller's, verbatim, outside an
    /// aggregate; otherwise it is derived from the event's `id` field
    /// (UTF-8 for strings, 8-byte little-endian f64 for numbers, raw
    /// bytes for byte arrays, unwrapping one optional layer).
    ///
    /// # Errors
    ///
    /// [`ProduceError::Schema`] on validation failure,
    /// [`ProduceError::AggregateKeyConflict`] for an explicit key inside
    /// an aggregate, [`ProduceError::MissingAggregateKey`] when an
    /// aggregate event has no usable `id`, plus codec and substrate
    /// failures.
    pub async fn produce(&self, event: Value, key: Option<Vec<u8>>) -> Result<(), ProduceError> {
        self.event_type.schema().validate(&event)?;

        let in_aggregate = self.event_type.aggregate().is_some();
        let key = match key {
            Some(_) if in_aggregate => return Err(ProduceError::AggregateKeyConflict),
            Some(key) => Some(key),
            None => {
                let derived = derive_partition_key(self.event_type.schema(), &event);
                if in_aggregate && derived.is_none() {
                    return Err(ProduceError::MissingAggregateKey);
                }
                derived
            }
        };

        let payload = self.codec.serialize(&event)?;
        self.inner
            .produce(
                RawEvent {
                    timestamp_ms: now_millis(),
                    payload,
                },
                key,
            )
            .await?;
        Ok(())
    }

    /// Stop the chain migrations' live tails and wait for them to wind
    /// down.
    pub async fn shutdown(&self) {
        for migration in &self.migrations {
            migration.shutdown().await;
        }
    }
}

/// Derive a partition key from an event's `id` field per the schema's
/// declared type for it. Returns `None` when no usable key exists.
fn derive_partition_key(schema: &Schema, event: &Value) -> Option<Vec<u8>> {
    let fields = schema.record_fields()?;
    let (_, id_schema) = fields.iter().find(|(name, _)| name == "id")?;
    let mut id_schema = id_schema;
    while let Schema::Optional(inner) = id_schema {
        id_schema = inner;
    }
    let id = event.get("id")?;
    if id.is_null() {
        return None;
    }
    match id_schema {
        Schema::String => id.as_str().map(|s| s.as_bytes().to_vec()),
        Schema::Number => id.as_f64().map(|n| n.to_le_bytes().to_vec()),
        Schema::Bytes => id.as_array().map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_u64())
                .map(|b| b as u8)
                .collect()
        }),
        _ => None,
    }
}

/// The ingestor-visible projection of a raw event: the payload decoded
/// and the producer timestamp as a wall-clock instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// The producer's clock at produce time.
    pub timestamp: SystemTime,
    /// The decoded event value.
    pub message: Value,
}

pub(crate) fn timestamp_from_millis(timestamp_ms: i64) -> SystemTime {
    if timestamp_ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(timestamp_ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(timestamp_ms.unsigned_abs())
    }
}

/// A decoded delivery with the underlying at-least-once envelope.
#[derive(Debug)]
pub struct EventEnvelope {
    /// The decoded event.
    pub event: Event,
    inner: Envelope,
}

impl EventEnvelope {
    /// The partition key the event was produced with, if any.
    pub fn key(&self) -> Option<&[u8]> {
        self.inner.key()
    }

    /// The raw producer timestamp in epoch milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        self.inner.event().timestamp_ms
    }

    /// Acknowledge the delivery. Equivalent to dropping.
    pub fn ack(self) {
        self.inner.ack();
    }

    /// Hand the delivery back for redelivery.
    pub fn nack(self) {
        self.inner.nack();
    }
}

/// A consumer of [`Event`]s with catch-up detection.
pub struct EventConsumer {
    inner: CatchUpConsumer,
    codec: Arc<dyn Codec>,
}

impl EventConsumer {
    /// A signal resolving when this consumer catches up to live.
    pub fn signal(&self) -> CatchUpSignal {
        self.inner.signal()
    }

    /// Whether the catch-up latch has fired.
    pub fn is_caught_up(&self) -> bool {
        self.inner.is_caught_up()
    }

    /// Consume the next event or return `None` on cancellation.
    ///
    /// # Errors
    ///
    /// Substrate errors propagate verbatim; an undecodable payload is a
    /// [`ConsumeError::Codec`].
    pub async fn consume(
        &mut self,
        cancel: &CancelToken,
    ) -> Result<Option<EventEnvelope>, ConsumeError> {
        let Some(envelope) = self.inner.consume(cancel).await? else {
            return Ok(None);
        };
        let message = self.codec.deserialize(&envelope.event().payload)?;
        Ok(Some(EventEnvelope {
            event: Event {
                timestamp: timestamp_from_millis(envelope.event().timestamp_ms),
                message,
            },
            inner: envelope,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::memory::MemoryTopicFactory;
    use crate::topic::StartFrom;

    fn registered() -> EventType {
        EventType::new(
            "Registered",
            Schema::record([("id", Schema::string()), ("title", Schema::string())]),
        )
    }

    #[test]
    fn decl_string_combines_name_and_schema() {
        let et = EventType::new("Ping", Schema::record([("id", Schema::string())]));
        assert_eq!(et.decl_string(), "Ping {\n  id: String\n}");
    }

    #[test]
    fn topic_name_is_stable_for_equal_declarations() {
        assert_eq!(registered().topic_name(), registered().topic_name());
    }

    #[test]
    fn topic_name_has_name_prefix_and_hex_hash() {
        let name = registered().topic_name();
        let (prefix, hash) = name
            .rsplit_once('-')
            .expect("topic name should contain a separator");
        assert_eq!(prefix, "Registered");
        assert_eq!(hash.len(), 40);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn schema_and_nonce_changes_rename_the_topic() {
        let base = registered();
        let other_schema = EventType::new(
            "Registered",
            Schema::record([("id", Schema::string()), ("title", Schema::optional(Schema::string()))]),
        );
        let other_nonce = EventType::with_nonce(
            "Registered",
            Schema::record([("id", Schema::string()), ("title", Schema::string())]),
            1,
        );
        assert_ne!(base.topic_name(), other_schema.topic_name());
        assert_ne!(base.topic_name(), other_nonce.topic_name());
    }

    #[test]
    fn add_fields_extends_the_schema() {
        let evolved = registered()
            .add_fields(
                [AddedField::new("title_len", Schema::number(), |event| {
                    json!(event["title"].as_str().map_or(0, str::len))
                })],
                OperatorOptions::default(),
            )
            .expect("add_fields should succeed");
        assert_eq!(
            evolved.schema().render(),
            "{\n  id: String\n  title: String\n  title_len: Number\n}"
        );
        assert_ne!(evolved.topic_name(), registered().topic_name());
    }

    #[test]
    fn add_fields_rejects_non_records_and_duplicates() {
        let scalar = EventType::new("N", Schema::number());
        let err = scalar
            .add_fields(
                [AddedField::new("x", Schema::number(), |_| json!(0))],
                OperatorOptions::default(),
            )
            .expect_err("non-record should fail");
        assert!(err.description().contains("record schema"));

        let err = registered()
            .add_fields(
                [AddedField::new("title", Schema::number(), |_| json!(0))],
                OperatorOptions::default(),
            )
            .expect_err("duplicate field should fail");
        assert!(err.description().contains("already declared"));
    }

    #[test]
    fn remove_fields_drops_declared_fields_only() {
        let trimmed = registered()
            .remove_fields(["title"], OperatorOptions::default())
            .expect("remove_fields should succeed");
        assert_eq!(trimmed.schema().render(), "{\n  id: String\n}");

        let err = registered()
            .remove_fields(["missing"], OperatorOptions::default())
            .expect_err("undeclared field should fail");
        assert!(err.description().contains("undeclared"));
    }

    #[test]
    fn turn_fields_optional_wraps_once() {
        let relaxed = registered()
            .turn_fields_optional(["title"], OperatorOptions::default())
            .expect("turn_fields_optional should succeed");
        assert_eq!(
            relaxed.schema().render(),
            "{\n  id: String\n  title: String?\n}"
        );
        let again = relaxed
            .turn_fields_optional(["title"], OperatorOptions::default())
            .expect("idempotent wrap should succeed");
        assert_eq!(again.schema().render(), relaxed.schema().render());
    }

    #[test]
    fn filter_bumps_nonce_when_schema_is_unchanged() {
        let base = registered();
        let filtered = base.filter(|_| true, OperatorOptions::default());
        assert_eq!(filtered.schema().render(), base.schema().render());
        assert_eq!(filtered.nonce(), base.nonce() + 1);
        assert_ne!(filtered.topic_name(), base.topic_name());

        let explicit = base.filter(|_| true, OperatorOptions::nonce(7));
        assert_eq!(explicit.nonce(), 7);
    }

    #[test]
    fn operators_share_the_chain_prefix() {
        let base = registered();
        let step1 = base
            .remove_fields(["title"], OperatorOptions::default())
            .expect("remove");
        let step2 = step1.filter(|_| true, OperatorOptions::default());
        assert_eq!(base.inner.migrators.len(), 0);
        assert_eq!(step1.inner.migrators.len(), 1);
        assert_eq!(step2.inner.migrators.len(), 2);
    }

    #[test]
    fn partition_key_derivation_follows_id_schema() {
        let string_id = Schema::record([("id", Schema::string())]);
        assert_eq!(
            derive_partition_key(&string_id, &json!({"id": "u1"})),
            Some(b"u1".to_vec())
        );

        let number_id = Schema::record([("id", Schema::number())]);
        assert_eq!(
            derive_partition_key(&number_id, &json!({"id": 2})),
            Some(2f64.to_le_bytes().to_vec())
        );

        let bytes_id = Schema::record([("id", Schema::bytes())]);
        assert_eq!(
            derive_partition_key(&bytes_id, &json!({"id": [1, 2, 255]})),
            Some(vec![1, 2, 255])
        );

        let optional_id = Schema::record([("id", Schema::optional(Schema::string()))]);
        assert_eq!(
            derive_partition_key(&optional_id, &json!({"id": "u1"})),
            Some(b"u1".to_vec())
        );
        assert_eq!(derive_partition_key(&optional_id, &json!({"id": null})), None);
        assert_eq!(derive_partition_key(&optional_id, &json!({})), None);

        let boolean_id = Schema::record([("id", Schema::boolean())]);
        assert_eq!(derive_partition_key(&boolean_id, &json!({"id": true})), None);
    }

    #[tokio::test]
    async fn produce_validates_against_the_schema() {
        let factory = MemoryTopicFactory::new();
        let producer = registered()
            .producer(&factory, ProducerOptions::default())
            .await
            .expect("producer should open");

        let err = producer
            .produce(json!({"id": "a"}), None)
            .await
            .expect_err("missing title should be rejected");
        assert!(matches!(err, ProduceError::Schema(_)));

        producer
            .produce(json!({"id": "a", "title": "A"}), None)
            .await
            .expect("valid event should publish");
    }

    #[tokio::test]
    async fn consume_round_trips_events_with_timestamps() {
        let factory = MemoryTopicFactory::new();
        let et = registered();
        let producer = et
            .producer(&factory, ProducerOptions::default())
            .await
            .expect("producer");
        producer
            .produce(json!({"id": "a", "title": "A"}), None)
            .await
            .expect("produce");

        let mut consumer = et
            .consumer(
                &factory,
                ConsumerGroup::anonymous(StartFrom::Beginning),
                ConsumerOptions::default(),
            )
            .await
            .expect("consumer");
        let envelope = consumer
            .consume(&CancelToken::never())
            .await
            .expect("consume")
            .expect("event");
        assert_eq!(envelope.event.message, json!({"id": "a", "title": "A"}));
        let age = SystemTime::now()
            .duration_since(envelope.event.timestamp)
            .expect("timestamp should be in the past");
        assert!(age < Duration::from_secs(60));
        // Derived partition key rides along even outside an aggregate.
        assert_eq!(envelope.key(), Some(&b"a"[..]));
    }
}
