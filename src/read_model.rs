//! Read models: declarative bindings of event types to ingestors,
//! projected into an application-owned client.
//!
//! A [`ReadModel`] is an immutable declaration of `(name, ingestors,
//! initializers)`. Starting it derives a content-addressed storage
//! namespace, makes a client, runs the initializers, opens one catch-up
//! consumer per ingestor, fans them into the time-ordered merge, and
//! resolves once every ingestor has caught up with history. The live
//! tail keeps running in the background until the handle is shut down.
//!
//! The namespace hash covers every ingestor and initializer declaration
//! with its nonce, so changing the projection forces a fresh namespace
//! and a re-projection from scratch.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cancel::{CancelToken, Canceller};
use crate::casing::CasingPolicy;
use crate::catch_up::{CatchUpOptions, CatchUpSignal};
use crate::codec::{default_codec, Codec};
use crate::error::{BoxError, IngestError, StartError, SubstrateError};
use crate::event_type::{sha1_hex, ConsumerOptions, Event, EventType, OperatorOptions};
use crate::merge::{MultiConsumerMerge, Prefetch};
use crate::schema::SchemaError;
use crate::topic::{ConsumerGroup, StartFrom, TopicFactory};

type HandlerFn<C> =
    Arc<dyn Fn(Event, Arc<C>, Option<Vec<u8>>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;
type InitFn<C> = Arc<dyn Fn(Arc<C>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Produces read-model clients for derived namespaces.
///
/// The framework treats the client as an opaque capability: it is handed
/// to initializers and handlers and never inspected.
#[async_trait::async_trait]
pub trait ReadModelClientFactory: Send + Sync {
    /// The client type handed to ingestors.
    type Client: Send + Sync + 'static;

    /// The casing the datastore expects for namespace names.
    fn naming_convention(&self) -> CasingPolicy;

    /// Separator between the cased name and the namespace hash.
    fn suffix_separator(&self) -> &str {
        "-"
    }

    /// Make (or open) the client for a namespace.
    async fn make(&self, namespace: &str) -> Result<Self::Client, SubstrateError>;

    /// Invoked once after the read model has caught up with history.
    async fn on_catch_up(&self, _client: &Self::Client) -> Result<(), BoxError> {
        Ok(())
    }
}

struct Ingestor<C> {
    event_type: EventType,
    handler: HandlerFn<C>,
    nonce: u32,
}

impl<C> Clone for Ingestor<C> {
    fn clone(&self) -> Self {
        Self {
            event_type: self.event_type.clone(),
            handler: Arc::clone(&self.handler),
            nonce: self.nonce,
        }
    }
}

struct Initializer<C> {
    init: InitFn<C>,
    nonce: u32,
}

impl<C> Clone for Initializer<C> {
    fn clone(&self) -> Self {
        Self {
            init: Arc::clone(&self.init),
            nonce: self.nonce,
        }
    }
}

/// An immutable read-model declaration over a client type `C`.
pub struct ReadModel<C> {
    name: String,
    ingestors: Vec<Ingestor<C>>,
    initializers: Vec<Initializer<C>>,
}

impl<C> Clone for ReadModel<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            ingestors: self.ingestors.clone(),
            initializers: self.initializers.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> ReadModel<C> {
    /// An empty read model named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ingestors: Vec::new(),
            initializers: Vec::new(),
        }
    }

    /// The declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A new read model with `handler` ingesting `event_type`.
    ///
    /// The handler receives the decoded event, the shared client, and
    /// the partition key; its failure nacks the envelope and stops the
    /// read model. Bump the nonce to force a fresh namespace when the
    /// handler's behavior changes.
    pub fn on<F, Fut>(
        &self,
        event_type: &EventType,
        handler: F,
        options: OperatorOptions,
    ) -> Self
    where
        F: Fn(Event, Arc<C>, Option<Vec<u8>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let boxed: HandlerFn<C> = Arc::new(move |event, client, key| {
            let fut: BoxFuture<'static, Result<(), BoxError>> =
                Box::pin(handler(event, client, key));
            fut
        });
        let mut model = self.clone();
        model.ingestors.push(Ingestor {
            event_type: event_type.clone(),
            handler: boxed,
            nonce: options.nonce.unwrap_or(0),
        });
        model
    }

    /// A new read model with `init` run against the freshly made client
    /// before any ingestion, in registration order.
    pub fn on_init<F, Fut>(&self, init: F, options: OperatorOptions) -> Self
    where
        F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let boxed: InitFn<C> = Arc::new(move |client| {
            let fut: BoxFuture<'static, Result<(), BoxError>> = Box::pin(init(client));
            fut
        });
        let mut model = self.clone();
        model.initializers.push(Initializer {
            init: boxed,
            nonce: options.nonce.unwrap_or(0),
        });
        model
    }

    /// This read model with every ingested event type rebound into an
    /// aggregate.
    pub(crate) fn rebind_aggregate(&self, aggregate: &str) -> Result<Self, SchemaError> {
        let mut model = self.clone();
        for ingestor in &mut model.ingestors {
            ingestor.event_type = ingestor.event_type.rebind_aggregate(aggregate)?;
        }
        Ok(model)
    }

    /// The storage namespace: the cased name, the separator, and the
    /// hash of every declaration with its nonce.
    ///
    /// Any added ingestor or initializer, and any nonce change, yields a
    /// fresh namespace and therefore a re-projection from scratch.
    pub fn namespace(&self, convention: CasingPolicy, separator: &str) -> String {
        let mut descriptor = String::new();
        for initializer in &self.initializers {
            descriptor.push_str(&format!("init:{};", initializer.nonce));
        }
        for ingestor in &self.ingestors {
            descriptor.push_str(&format!(
                "on:{}:{};",
                ingestor.event_type.decl_string(),
                ingestor.nonce
            ));
        }
        format!(
            "{}{}{}",
            convention.apply(&self.name),
            separator,
            sha1_hex(&descriptor)
        )
    }

    /// Start projecting: make the client, run initializers, replay every
    /// ingested topic in approximate timestamp order, and return once
    /// all ingestors have caught up. The live tail continues until the
    /// handle is [`shutdown`](ReadModelHandle::shutdown) (or the
    /// external cancel token fires).
    ///
    /// # Errors
    ///
    /// Substrate and initializer failures surface immediately; an
    /// ingestor failing before catch-up surfaces as
    /// [`StartError::Ingest`].
    pub async fn start<F>(
        &self,
        topics: &dyn TopicFactory,
        clients: &F,
        options: StartOptions,
    ) -> Result<ReadModelHandle<C>, StartError>
    where
        F: ReadModelClientFactory<Client = C>,
    {
        let namespace = self.namespace(clients.naming_convention(), clients.suffix_separator());
        tracing::info!(read_model = %self.name, namespace = %namespace, "starting read model");

        let client = Arc::new(clients.make(&namespace).await?);
        for initializer in &self.initializers {
            (initializer.init)(Arc::clone(&client))
                .await
                .map_err(StartError::Initializer)?;
        }

        let canceller = Arc::new(Canceller::new());
        let token = canceller.token();
        if let Some(external) = options.cancel {
            // Weak so the forwarder never keeps a dropped handle's scope
            // alive; a dropped canceller is already a cancellation.
            let forward = Arc::downgrade(&canceller);
            let internal = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = external.cancelled() => {
                        if let Some(canceller) = forward.upgrade() {
                            canceller.cancel();
                        }
                    }
                    _ = internal.cancelled() => {}
                }
            });
        }

        let mut signals: Vec<CatchUpSignal> = Vec::with_capacity(self.ingestors.len());
        let mut streams: Vec<Prefetch> = Vec::with_capacity(self.ingestors.len());
        let mut handlers: Vec<HandlerFn<C>> = Vec::with_capacity(self.ingestors.len());
        for ingestor in &self.ingestors {
            let topic_name = ingestor.event_type.topic_name();
            let group =
                ConsumerGroup::named(format!("{namespace}-{topic_name}"), StartFrom::Beginning);
            let consumer = ingestor
                .event_type
                .consumer(
                    topics,
                    group,
                    ConsumerOptions {
                        catch_up: options.catch_up.clone(),
                        codec: Arc::clone(&options.codec),
                        on_catch_up: None,
                    },
                )
                .await?;
            signals.push(consumer.signal());
            streams.push(Prefetch::spawn(consumer, token.clone()));
            handlers.push(Arc::clone(&ingestor.handler));
        }
        let mut merge = MultiConsumerMerge::new(streams, options.catch_up.peek_timeout());

        let failure: Arc<std::sync::Mutex<Option<IngestError>>> =
            Arc::new(std::sync::Mutex::new(None));
        let (failed_tx, mut failed_rx) = watch::channel(false);

        let loop_client = Arc::clone(&client);
        let loop_failure = Arc::clone(&failure);
        let loop_canceller = Arc::downgrade(&canceller);
        let loop_namespace = namespace.clone();
        let task = tokio::spawn(async move {
            let error = loop {
                match merge.next().await {
                    Ok(Some((index, envelope))) => {
                        let key = envelope.key().map(<[u8]>::to_vec);
                        let event = envelope.event.clone();
                        match (handlers[index])(event, Arc::clone(&loop_client), key).await {
                            Ok(()) => envelope.ack(),
                            Err(error) => {
                                envelope.nack();
                                break Some(IngestError::Handler(error));
                            }
                        }
                    }
                    Ok(None) => break None,
                    Err(error) => break Some(IngestError::Consume(error)),
                }
            };
            if let Some(error) = error {
                tracing::error!(
                    namespace = %loop_namespace,
                    error = %error,
                    "read model ingestion failed"
                );
                *loop_failure.lock().expect("failure slot poisoned") = Some(error);
                let _ = failed_tx.send(true);
                // Release the per-ingestor consumers; a restart resumes
                // from the substrate's committed offsets.
                if let Some(canceller) = loop_canceller.upgrade() {
                    canceller.cancel();
                }
            }
        });

        let handle = ReadModelHandle {
            client,
            namespace: namespace.clone(),
            canceller,
            task: tokio::sync::Mutex::new(Some(task)),
            failure,
            failed_rx: failed_rx.clone(),
        };

        // Wait for every ingestor's catch-up latch, bailing out early if
        // ingestion fails first.
        let wait_all = async {
            for signal in &mut signals {
                signal.wait().await;
            }
        };
        tokio::select! {
            () = wait_all => {}
            _ = failed_rx.changed() => {}
        }
        if let Some(error) = handle.take_failure() {
            return Err(error.into());
        }

        if let Err(error) = clients.on_catch_up(&handle.client).await {
            handle.shutdown().await;
            return Err(StartError::OnCatchUp(error));
        }
        tracing::info!(namespace = %namespace, "ingestor caught up");
        Ok(handle)
    }
}

/// Options for [`ReadModel::start`].
pub struct StartOptions {
    /// External cancellation; the handle's own shutdown works either
    /// way.
    pub cancel: Option<CancelToken>,
    /// Catch-up tuning for every ingestor; also scales the merge's peek
    /// timeout.
    pub catch_up: CatchUpOptions,
    /// Payload codec; JSON text by default.
    pub codec: Arc<dyn Codec>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            cancel: None,
            catch_up: CatchUpOptions::default(),
            codec: default_codec(),
        }
    }
}

/// A started read model: the shared client plus control of the live
/// tail.
///
/// Dropping the handle cancels the scope (the canceller is dropped);
/// call [`shutdown`](ReadModelHandle::shutdown) to also wait for the
/// ingestion loop to exit. The client is released last.
pub struct ReadModelHandle<C> {
    client: Arc<C>,
    namespace: String,
    canceller: Arc<Canceller>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    failure: Arc<std::sync::Mutex<Option<IngestError>>>,
    failed_rx: watch::Receiver<bool>,
}

impl<C> ReadModelHandle<C> {
    /// The client the projection writes into.
    pub fn client(&self) -> Arc<C> {
        Arc::clone(&self.client)
    }

    /// The derived storage namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether the background ingestion has failed since catch-up.
    pub fn has_failed(&self) -> bool {
        *self.failed_rx.borrow()
    }

    /// The ingestion failure, if any, taken at most once.
    pub fn take_failure(&self) -> Option<IngestError> {
        self.failure.lock().expect("failure slot poisoned").take()
    }

    /// Stop the live tail and wait for the ingestion loop to exit. Safe
    /// to call more than once.
    pub async fn shutdown(&self) {
        self.canceller.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                tracing::error!(error = %error, "read model task panicked");
            }
        }
    }
}
