//! Event Processor - Balanced Partition Consumption
//!
//! The processor is the orchestrator tying the pieces together: it runs
//! the balancing loop, spawns one task per owned partition, feeds events
//! to the user's [`EventHandler`], and tears partition tasks down when
//! ownership moves or the processor stops.
//!
//! ## Architecture
//!
//! ```text
//! EventProcessor::start()
//!    │  every polling_interval:
//!    │    1. list checkpoints (resume positions)
//!    │    2. OwnershipBalancer::claim_ownership()
//!    │    3. reconcile: cancel lost partitions, spawn new ones
//!    │
//!    ├──> PartitionWorker "0" ──> StreamConsumer ──> EventHandler
//!    ├──> PartitionWorker "1" ──> StreamConsumer ──> EventHandler
//!    └──> ...
//! ```
//!
//! ## Error Containment
//!
//! A failing handler callback never takes down the processor: `on_event`
//! errors are routed to `on_error`, and errors from `on_error`,
//! `on_partition_initialize`, and `on_partition_close` are logged and
//! dropped. Transient store failures skip the round and retry. The one
//! fatal error is a pinned partition id that does not exist.

use crate::balancer::OwnershipBalancer;
use crate::config::ProcessorConfig;
use crate::consumer::{
    ConsumerError, ConsumerOptions, Event, StartPosition, StreamClient, StreamConsumer,
};
use crate::context::PartitionContext;
use crate::error::{ProcessorError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use streamlease_store::{CheckpointRecord, CheckpointStore};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Why a partition task is closing, reported to
/// [`EventHandler::on_partition_close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The processor is stopping.
    Shutdown,
    /// Another processor claimed the partition, or the consumer was
    /// superseded by a higher owner level.
    OwnershipLost,
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// User-supplied event processing callbacks.
///
/// Only `on_event` is required. Callbacks for one partition run
/// sequentially on that partition's task; callbacks for different
/// partitions run concurrently, so shared handler state needs its own
/// synchronization.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Called once per received event, in partition order.
    async fn on_event(&self, context: &PartitionContext, event: Event) -> HandlerResult;

    /// Called when event processing or the underlying consumer fails.
    /// Errors returned from this callback are logged and dropped.
    async fn on_error(&self, _context: &PartitionContext, _error: &ProcessorError) -> HandlerResult {
        Ok(())
    }

    /// Called when a partition task starts, before the consumer opens.
    async fn on_partition_initialize(&self, _context: &PartitionContext) -> HandlerResult {
        Ok(())
    }

    /// Called when a partition task ends, after its consumer is closed.
    async fn on_partition_close(
        &self,
        _context: &PartitionContext,
        _reason: CloseReason,
    ) -> HandlerResult {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessorState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// A running partition task and the channel used to cancel it.
struct PartitionTask {
    handle: JoinHandle<()>,
    cancel: watch::Sender<Option<CloseReason>>,
}

/// Consumes a partitioned stream cooperatively with other processors
/// sharing the same namespace, stream, consumer group, and store.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use streamlease_processor::{
///     Event, EventHandler, EventProcessor, HandlerResult, InMemoryStreamClient,
///     PartitionContext,
/// };
/// use streamlease_store::SqliteCheckpointStore;
///
/// struct Printer;
///
/// #[async_trait::async_trait]
/// impl EventHandler for Printer {
///     async fn on_event(&self, context: &PartitionContext, event: Event) -> HandlerResult {
///         println!("partition {} seq {}", context.partition_id(), event.sequence_number);
///         context.update_checkpoint(&event).await?;
///         Ok(())
///     }
/// }
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(SqliteCheckpointStore::new("checkpoints.db").await?);
/// let client = Arc::new(InMemoryStreamClient::new(4));
///
/// let processor = EventProcessor::builder()
///     .namespace("ns1")
///     .stream("orders")
///     .consumer_group("$default")
///     .store(store)
///     .client(client)
///     .handler(Arc::new(Printer))
///     .build()?;
///
/// processor.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct EventProcessor {
    id: String,
    namespace: String,
    stream: String,
    consumer_group: String,
    store: Arc<dyn CheckpointStore>,
    client: Arc<dyn StreamClient>,
    handler: Arc<dyn EventHandler>,
    config: ProcessorConfig,
    state: watch::Sender<ProcessorState>,
    tasks: Arc<Mutex<HashMap<String, PartitionTask>>>,
    /// Handles of partition tasks cancelled mid-run, joined at shutdown.
    draining: Mutex<Vec<JoinHandle<()>>>,
}

impl EventProcessor {
    pub fn builder() -> EventProcessorBuilder {
        EventProcessorBuilder::new()
    }

    /// Unique identity of this processor instance, as written to
    /// ownership records.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Partition ids this processor currently runs tasks for, sorted.
    pub async fn owned_partitions(&self) -> Vec<String> {
        let tasks = self.tasks.lock().await;
        let mut ids: Vec<String> = tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run the processor until [`stop`](Self::stop) is called.
    ///
    /// Blocks for the processor's lifetime; callers normally spawn it.
    /// On return all partition tasks have closed and their
    /// `on_partition_close` callbacks have run.
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted`: the processor was started before
    /// - `InvalidPartition`: configured with a pinned partition id the
    ///   stream does not have
    pub async fn start(&self) -> Result<()> {
        let started = self.state.send_if_modified(|state| {
            if *state == ProcessorState::Created {
                *state = ProcessorState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ProcessorError::AlreadyStarted);
        }

        info!(
            processor_id = %self.id,
            namespace = %self.namespace,
            stream = %self.stream,
            consumer_group = %self.consumer_group,
            "Event processor started"
        );

        let mut balancer = OwnershipBalancer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.client),
            self.namespace.clone(),
            self.stream.clone(),
            self.consumer_group.clone(),
            self.id.clone(),
            self.config.ownership_timeout,
            self.config.partition_id.clone(),
        );
        let mut contexts: HashMap<String, Arc<PartitionContext>> = HashMap::new();
        let mut state_rx = self.state.subscribe();

        let result = loop {
            if *state_rx.borrow_and_update() != ProcessorState::Running {
                break Ok(());
            }

            match self.run_round(&mut balancer, &mut contexts).await {
                Ok(()) => {}
                // Fatal misconfiguration; everything else retries.
                Err(error @ ProcessorError::InvalidPartition { .. }) => break Err(error),
                Err(error) => {
                    warn!(
                        processor_id = %self.id,
                        error = %error,
                        "Balancing round failed, retrying next round"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.polling_interval) => {}
                _ = state_rx.changed() => {}
            }
        };

        self.shutdown_tasks().await;
        self.state.send_replace(ProcessorState::Stopped);
        info!(processor_id = %self.id, "Event processor stopped");

        result
    }

    /// Signal the processor to stop and wait until it has.
    ///
    /// Idempotent and safe to call from any task, including before
    /// `start` (a no-op) or concurrently with another `stop`.
    pub async fn stop(&self) {
        let mut state_rx = self.state.subscribe();
        self.state.send_if_modified(|state| {
            if *state == ProcessorState::Running {
                *state = ProcessorState::Stopping;
                true
            } else {
                false
            }
        });

        let current = *state_rx.borrow_and_update();
        if current == ProcessorState::Created || current == ProcessorState::Stopped {
            return;
        }

        let _ = state_rx
            .wait_for(|state| *state == ProcessorState::Stopped)
            .await;
    }

    /// One balancing round: fetch checkpoints, claim ownership, reconcile
    /// partition tasks with the claim result.
    async fn run_round(
        &self,
        balancer: &mut OwnershipBalancer,
        contexts: &mut HashMap<String, Arc<PartitionContext>>,
    ) -> Result<()> {
        let checkpoints: HashMap<String, CheckpointRecord> = self
            .store
            .list_checkpoints(&self.namespace, &self.stream, &self.consumer_group)
            .await?
            .into_iter()
            .map(|checkpoint| (checkpoint.partition_id.clone(), checkpoint))
            .collect();

        let owned = balancer.claim_ownership().await?;
        self.reconcile(owned, &checkpoints, contexts).await;
        Ok(())
    }

    async fn reconcile(
        &self,
        owned: Vec<String>,
        checkpoints: &HashMap<String, CheckpointRecord>,
        contexts: &mut HashMap<String, Arc<PartitionContext>>,
    ) {
        let owned_set: HashSet<&str> = owned.iter().map(String::as_str).collect();
        let mut tasks = self.tasks.lock().await;

        // Cancel tasks for partitions another processor now owns. The
        // worker closes its consumer and fires on_partition_close on its
        // own time; the handle is joined at shutdown.
        let lost: Vec<String> = tasks
            .keys()
            .filter(|partition_id| !owned_set.contains(partition_id.as_str()))
            .cloned()
            .collect();
        for partition_id in lost {
            if let Some(task) = tasks.remove(&partition_id) {
                info!(
                    processor_id = %self.id,
                    partition_id = %partition_id,
                    "Ownership lost, stopping partition task"
                );
                let _ = task.cancel.send(Some(CloseReason::OwnershipLost));
                self.draining.lock().await.push(task.handle);
            }
        }

        for partition_id in owned {
            if tasks.contains_key(&partition_id) {
                continue;
            }

            // One context per partition per processor lifetime, reused
            // when ownership bounces away and back.
            let context = contexts
                .entry(partition_id.clone())
                .or_insert_with(|| {
                    Arc::new(PartitionContext::new(
                        self.namespace.clone(),
                        self.stream.clone(),
                        self.consumer_group.clone(),
                        partition_id.clone(),
                        Some(Arc::clone(&self.store)),
                    ))
                })
                .clone();

            // Checkpoints win over configured start positions.
            let start = match checkpoints.get(&partition_id) {
                Some(checkpoint) => StartPosition::Offset(checkpoint.offset.clone()),
                None => self.config.initial_position_for(&partition_id),
            };

            let (cancel_tx, cancel_rx) = watch::channel(None);
            let worker = PartitionWorker {
                partition_id: partition_id.clone(),
                context,
                client: Arc::clone(&self.client),
                handler: Arc::clone(&self.handler),
                start,
                options: ConsumerOptions {
                    owner_level: self.config.owner_level,
                    track_last_enqueued: self.config.track_last_enqueued,
                },
                max_batch: self.config.max_batch_size,
                cancel: cancel_rx,
                tasks: Arc::clone(&self.tasks),
            };

            info!(
                processor_id = %self.id,
                partition_id = %partition_id,
                "Starting partition task"
            );
            let handle = tokio::spawn(worker.run());
            tasks.insert(
                partition_id,
                PartitionTask {
                    handle,
                    cancel: cancel_tx,
                },
            );
        }
        drop(tasks);

        // Reap drained handles that have since finished.
        self.draining.lock().await.retain(|handle| !handle.is_finished());
    }

    /// Cancel every partition task with `Shutdown` and wait for all of
    /// them, including tasks cancelled in earlier rounds, to finish.
    async fn shutdown_tasks(&self) {
        let drained: Vec<PartitionTask> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().map(|(_, task)| task).collect()
        };

        for task in &drained {
            let _ = task.cancel.send(Some(CloseReason::Shutdown));
        }
        for task in drained {
            if let Err(error) = task.handle.await {
                warn!(
                    processor_id = %self.id,
                    error = %error,
                    "Partition task panicked during shutdown"
                );
            }
        }

        let draining: Vec<JoinHandle<()>> = std::mem::take(&mut *self.draining.lock().await);
        for handle in draining {
            let _ = handle.await;
        }
    }
}

/// Builder for [`EventProcessor`].
pub struct EventProcessorBuilder {
    processor_id: Option<String>,
    namespace: Option<String>,
    stream: Option<String>,
    consumer_group: Option<String>,
    store: Option<Arc<dyn CheckpointStore>>,
    client: Option<Arc<dyn StreamClient>>,
    handler: Option<Arc<dyn EventHandler>>,
    config: ProcessorConfig,
    ownership_timeout_set: bool,
}

impl EventProcessorBuilder {
    fn new() -> Self {
        Self {
            processor_id: None,
            namespace: None,
            stream: None,
            consumer_group: None,
            store: None,
            client: None,
            handler: None,
            config: ProcessorConfig::default(),
            ownership_timeout_set: false,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn client(mut self, client: Arc<dyn StreamClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Override the generated processor identity. Useful in tests.
    pub fn processor_id(mut self, processor_id: impl Into<String>) -> Self {
        self.processor_id = Some(processor_id.into());
        self
    }

    /// Balancing cadence. Also rescales the ownership timeout to twice
    /// the interval unless one was set explicitly.
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.config.polling_interval = interval;
        if !self.ownership_timeout_set {
            self.config.ownership_timeout = interval * 2;
        }
        self
    }

    pub fn ownership_timeout(mut self, timeout: Duration) -> Self {
        self.config.ownership_timeout = timeout;
        self.ownership_timeout_set = true;
        self
    }

    /// Default start position for partitions without a checkpoint.
    pub fn initial_position(mut self, position: StartPosition) -> Self {
        self.config.initial_position = position;
        self
    }

    /// Per-partition start-position override.
    pub fn initial_position_for(
        mut self,
        partition_id: impl Into<String>,
        position: StartPosition,
    ) -> Self {
        self.config
            .initial_positions
            .insert(partition_id.into(), position);
        self
    }

    pub fn owner_level(mut self, level: i64) -> Self {
        self.config.owner_level = Some(level);
        self
    }

    /// Pin the processor to one partition and disable balancing.
    pub fn partition_id(mut self, partition_id: impl Into<String>) -> Self {
        self.config.partition_id = Some(partition_id.into());
        self
    }

    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.config.max_batch_size = max_batch_size;
        self
    }

    pub fn track_last_enqueued(mut self, enabled: bool) -> Self {
        self.config.track_last_enqueued = enabled;
        self
    }

    /// # Errors
    ///
    /// `Config` when a required field is missing or a value is out of
    /// range.
    pub fn build(self) -> Result<EventProcessor> {
        let namespace = self
            .namespace
            .ok_or_else(|| ProcessorError::Config("namespace is required".to_string()))?;
        let stream = self
            .stream
            .ok_or_else(|| ProcessorError::Config("stream is required".to_string()))?;
        let consumer_group = self
            .consumer_group
            .ok_or_else(|| ProcessorError::Config("consumer_group is required".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| ProcessorError::Config("checkpoint store is required".to_string()))?;
        let client = self
            .client
            .ok_or_else(|| ProcessorError::Config("stream client is required".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| ProcessorError::Config("event handler is required".to_string()))?;

        if self.config.max_batch_size == 0 {
            return Err(ProcessorError::Config(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.config.polling_interval.is_zero() {
            return Err(ProcessorError::Config(
                "polling_interval must be non-zero".to_string(),
            ));
        }

        let (state, _) = watch::channel(ProcessorState::Created);

        Ok(EventProcessor {
            id: self
                .processor_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            namespace,
            stream,
            consumer_group,
            store,
            client,
            handler,
            config: self.config,
            state,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            draining: Mutex::new(Vec::new()),
        })
    }
}

/// Owns one partition: opens the consumer, pumps events into the handler,
/// and runs the close protocol on the way out.
struct PartitionWorker {
    partition_id: String,
    context: Arc<PartitionContext>,
    client: Arc<dyn StreamClient>,
    handler: Arc<dyn EventHandler>,
    start: StartPosition,
    options: ConsumerOptions,
    max_batch: usize,
    cancel: watch::Receiver<Option<CloseReason>>,
    tasks: Arc<Mutex<HashMap<String, PartitionTask>>>,
}

impl PartitionWorker {
    async fn run(mut self) {
        if let Err(error) = self.handler.on_partition_initialize(&self.context).await {
            warn!(
                partition_id = %self.partition_id,
                error = %error,
                "Partition initialize callback failed"
            );
        }

        let consumer = match self
            .client
            .open_consumer(&self.partition_id, self.start.clone(), self.options.clone())
            .await
        {
            Ok(consumer) => consumer,
            Err(error) => {
                self.report_error(ProcessorError::Consumer(error)).await;
                self.finish(None, CloseReason::OwnershipLost).await;
                return;
            }
        };

        let (consumer, reason) = self.pump(consumer).await;
        self.finish(Some(consumer), reason).await;
    }

    /// Receive loop. Returns the consumer so `finish` can close it after
    /// the final handler invocation completes.
    async fn pump(
        &mut self,
        mut consumer: Box<dyn StreamConsumer>,
    ) -> (Box<dyn StreamConsumer>, CloseReason) {
        let reason = loop {
            let received = tokio::select! {
                changed = self.cancel.changed() => {
                    if changed.is_err() {
                        // Sender gone without a signal; treat as shutdown.
                        break CloseReason::Shutdown;
                    }
                    break (*self.cancel.borrow()).unwrap_or(CloseReason::Shutdown);
                }
                received = consumer.receive(self.max_batch) => received,
            };

            match received {
                Ok(events) => {
                    for event in events {
                        if self.options.track_last_enqueued {
                            self.context.record_last_enqueued(&event);
                        }

                        let span = tracing::debug_span!(
                            "on_event",
                            partition_id = %self.partition_id,
                            sequence_number = event.sequence_number,
                        );
                        if let Err(error) =
                            self.handler.on_event(&self.context, event).instrument(span).await
                        {
                            self.report_error(ProcessorError::Handler(error.to_string()))
                                .await;
                        }
                    }
                }
                Err(ConsumerError::Superseded(level)) => {
                    info!(
                        partition_id = %self.partition_id,
                        owner_level = level,
                        "Superseded by a higher owner level, releasing partition"
                    );
                    self.report_error(ProcessorError::Consumer(ConsumerError::Superseded(level)))
                        .await;
                    break CloseReason::OwnershipLost;
                }
                Err(error) => {
                    self.report_error(ProcessorError::Consumer(error)).await;
                    break CloseReason::OwnershipLost;
                }
            }
        };

        (consumer, reason)
    }

    async fn finish(&mut self, consumer: Option<Box<dyn StreamConsumer>>, reason: CloseReason) {
        if let Some(mut consumer) = consumer {
            consumer.close().await;
        }

        if let Err(error) = self.handler.on_partition_close(&self.context, reason).await {
            warn!(
                partition_id = %self.partition_id,
                error = %error,
                "Partition close callback failed"
            );
        }

        info!(
            partition_id = %self.partition_id,
            reason = ?reason,
            "Partition task closed"
        );

        // Exiting on our own (consumer failure rather than a cancel
        // signal): clear the registry entry so a later balancing round
        // can restart this partition.
        let cancelled = (*self.cancel.borrow()).is_some();
        if !cancelled {
            self.tasks.lock().await.remove(&self.partition_id);
        }
    }

    async fn report_error(&self, error: ProcessorError) {
        warn!(
            partition_id = %self.partition_id,
            error = %error,
            "Partition error"
        );
        if let Err(callback_error) = self.handler.on_error(&self.context, &error).await {
            warn!(
                partition_id = %self.partition_id,
                error = %callback_error,
                "Error callback failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStreamClient;
    use streamlease_store::InMemoryCheckpointStore;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl EventHandler for NoopHandler {
        async fn on_event(&self, _context: &PartitionContext, _event: Event) -> HandlerResult {
            Ok(())
        }
    }

    fn builder() -> EventProcessorBuilder {
        EventProcessor::builder()
            .namespace("ns1")
            .stream("orders")
            .consumer_group("$default")
            .store(Arc::new(InMemoryCheckpointStore::new()))
            .client(Arc::new(InMemoryStreamClient::new(2)))
            .handler(Arc::new(NoopHandler))
            .polling_interval(Duration::from_millis(20))
    }

    #[test]
    fn test_build_requires_handler() {
        let result = EventProcessor::builder()
            .namespace("ns1")
            .stream("orders")
            .consumer_group("$default")
            .store(Arc::new(InMemoryCheckpointStore::new()))
            .client(Arc::new(InMemoryStreamClient::new(2)))
            .build();
        assert!(matches!(result, Err(ProcessorError::Config(_))));
    }

    #[test]
    fn test_build_rejects_zero_batch_size() {
        let result = builder().max_batch_size(0).build();
        assert!(matches!(result, Err(ProcessorError::Config(_))));
    }

    #[test]
    fn test_polling_interval_rescales_ownership_timeout() {
        let processor = builder().build().unwrap();
        assert_eq!(processor.config.ownership_timeout, Duration::from_millis(40));

        let pinned = builder()
            .ownership_timeout(Duration::from_secs(60))
            .build()
            .unwrap();
        assert_eq!(pinned.config.ownership_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let processor = Arc::new(builder().build().unwrap());

        let runner = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.start().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            processor.start().await,
            Err(ProcessorError::AlreadyStarted)
        ));

        processor.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let processor = builder().build().unwrap();
        processor.stop().await;
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_start_claims_all_partitions_when_alone() {
        let processor = Arc::new(builder().processor_id("proc-a").build().unwrap());

        let runner = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.start().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(processor.owned_partitions().await, vec!["0", "1"]);

        processor.stop().await;
        runner.await.unwrap().unwrap();
        assert!(processor.owned_partitions().await.is_empty());
    }

    #[tokio::test]
    async fn test_pinned_invalid_partition_is_fatal() {
        let processor = builder().partition_id("9").build().unwrap();
        let result = processor.start().await;
        assert!(matches!(
            result,
            Err(ProcessorError::InvalidPartition { .. })
        ));
    }
}
