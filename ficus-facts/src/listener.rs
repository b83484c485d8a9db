//! Change Listener
//!
//! Keeps a [`DatasourceRegistry`] eventually consistent with the datasource
//! change topic. One background task per listener walks the state machine
//!
//! ```text
//! STOPPED -> CONNECTING -> SUBSCRIBED -> PROCESSING -> SUBSCRIBED -> ...
//!                 ^             |
//!                 +-- backoff --+  (transport failure)
//! ```
//!
//! and returns to `STOPPED` when cancelled. Each event is applied within a
//! time budget; poison payloads and events over budget are logged and skipped
//! so one bad event never stalls the stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::config::ListenerConfig;
use crate::error::{FactError, FactResult};
use crate::event::{ChangeAction, ChangeEvent};
use crate::registry::DatasourceRegistry;
use crate::transport::EventTransport;

/// Lifecycle state of a change listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// No background task
    Stopped,
    /// Connecting or reconnecting to the transport
    Connecting,
    /// Subscribed and waiting for events
    Subscribed,
    /// Applying one event
    Processing,
}

/// Counters describing what the listener did with received payloads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Events applied to the registry
    pub processed: u64,
    /// Events dropped because their version did not advance
    pub stale: u64,
    /// Payloads that could not be decoded
    pub skipped_poison: u64,
    /// Events abandoned after exceeding the per-event budget
    pub skipped_budget: u64,
    /// Events that failed for another reason
    pub failed: u64,
    /// Transport failures that forced a reconnect
    pub reconnects: u64,
}

#[derive(Default)]
struct StatsCounters {
    processed: AtomicU64,
    stale: AtomicU64,
    skipped_poison: AtomicU64,
    skipped_budget: AtomicU64,
    failed: AtomicU64,
    reconnects: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            processed: self.processed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            skipped_poison: self.skipped_poison.load(Ordering::Relaxed),
            skipped_budget: self.skipped_budget.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

struct RunningTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Consumer of datasource change events that reloads the registry
pub struct ChangeListener {
    id: Uuid,
    registry: DatasourceRegistry,
    config: ListenerConfig,
    transport: Arc<AsyncMutex<Box<dyn EventTransport>>>,
    running: Mutex<Option<RunningTask>>,
    state: Arc<watch::Sender<ListenerState>>,
    stats: Arc<StatsCounters>,
}

impl ChangeListener {
    /// Create a stopped listener
    pub fn new<T>(
        registry: DatasourceRegistry,
        transport: T,
        config: ListenerConfig,
    ) -> FactResult<Self>
    where
        T: EventTransport + 'static,
    {
        config.validate()?;
        let (state, _) = watch::channel(ListenerState::Stopped);
        let transport: Box<dyn EventTransport> = Box::new(transport);

        Ok(Self {
            id: Uuid::new_v4(),
            registry,
            config,
            transport: Arc::new(AsyncMutex::new(transport)),
            running: Mutex::new(None),
            state: Arc::new(state),
            stats: Arc::new(StatsCounters::default()),
        })
    }

    /// Listener instance id, used in log lines
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Counters since construction
    pub fn stats(&self) -> ListenerStats {
        self.stats.snapshot()
    }

    /// Whether the background task is running
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(false, |running| !running.task.is_finished())
    }

    /// Spawn the subscribe loop on the current tokio runtime
    ///
    /// Returns immediately. Calling it while the loop runs has no effect.
    pub fn start(&self) -> FactResult<()> {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                debug!("Change listener {} already running", self.id);
                return Ok(());
            }
        }

        let cancel = CancellationToken::new();
        let worker = Worker {
            id: self.id,
            registry: self.registry.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
            cancel: cancel.clone(),
        };
        let transport = Arc::clone(&self.transport);
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            FactError::Transport(format!("change listener {} needs a runtime: {}", self.id, e))
        })?;

        let task = runtime.spawn(async move {
            let mut transport = transport.lock().await;
            worker.run(transport.as_mut()).await;
        });

        *running = Some(RunningTask { cancel, task });
        Ok(())
    }

    /// Cancel the loop and wait up to `timeout` for it to finish
    ///
    /// The event being applied is allowed to complete. If the loop does not
    /// exit in time it is aborted and the transport is disconnected here. The
    /// listener can be started again afterwards. Never fails.
    pub async fn stop(&self, timeout: Duration) {
        let running = self.running.lock().take();
        let RunningTask { cancel, mut task } = match running {
            Some(running) => running,
            None => return,
        };

        cancel.cancel();
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => info!("Change listener {} stopped", self.id),
            Ok(Err(e)) => {
                warn!("Change listener {} task ended abnormally: {}", self.id, e);
                self.force_disconnect().await;
            }
            Err(_) => {
                warn!(
                    "Change listener {} did not stop within {:?}, disconnecting forcefully",
                    self.id, timeout
                );
                task.abort();
                if let Err(e) = task.await {
                    debug!("Change listener {} task aborted: {}", self.id, e);
                }
                self.force_disconnect().await;
            }
        }
    }

    /// Disconnect the transport left behind by a task that did not finish
    async fn force_disconnect(&self) {
        self.transport.lock().await.disconnect().await;
        self.state.send_replace(ListenerState::Stopped);
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

/// State owned by the background task
struct Worker {
    id: Uuid,
    registry: DatasourceRegistry,
    config: ListenerConfig,
    state: Arc<watch::Sender<ListenerState>>,
    stats: Arc<StatsCounters>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, transport: &mut dyn EventTransport) {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        info!("Change listener {} starting on topic {}", self.id, self.config.topic);

        'session: while !self.cancel.is_cancelled() {
            self.set_state(ListenerState::Connecting);
            let connected = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = transport.connect(&self.config.topic) => Some(result),
            };
            match connected {
                None => break 'session,
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "Change listener {} failed to connect (attempt {}): {}; retrying in {:?}",
                        self.id,
                        backoff.attempt(),
                        e,
                        delay
                    );
                    if !self.pause(delay).await {
                        break 'session;
                    }
                    continue 'session;
                }
            }

            backoff.reset();
            self.set_state(ListenerState::Subscribed);
            info!("Change listener {} subscribed to {}", self.id, self.config.topic);

            loop {
                let polled = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    result = transport.poll(self.config.poll_timeout) => Some(result),
                };
                match polled {
                    None => break 'session,
                    Some(Ok(Some(payload))) => {
                        self.set_state(ListenerState::Processing);
                        self.handle_payload(&payload).await;
                        self.set_state(ListenerState::Subscribed);
                    }
                    Some(Ok(None)) => {}
                    Some(Err(e)) => {
                        StatsCounters::bump(&self.stats.reconnects);
                        transport.disconnect().await;
                        let delay = backoff.next_delay();
                        warn!(
                            "Change listener {} lost its subscription: {}; reconnecting in {:?}",
                            self.id, e, delay
                        );
                        if !self.pause(delay).await {
                            break 'session;
                        }
                        continue 'session;
                    }
                }
            }
        }

        transport.disconnect().await;
        self.set_state(ListenerState::Stopped);
        info!("Change listener {} left topic {}", self.id, self.config.topic);
    }

    async fn handle_payload(&self, payload: &[u8]) {
        let event = match ChangeEvent::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Change listener {} skipping poison event: {}", self.id, e);
                StatsCounters::bump(&self.stats.skipped_poison);
                return;
            }
        };

        let budget = self.config.event_budget;
        match tokio::time::timeout(budget, self.apply(&event)).await {
            Ok(Ok(())) => {
                debug!(
                    "Change listener {} applied {} for {} version {}",
                    self.id,
                    event.action,
                    event.code(),
                    event.version()
                );
                StatsCounters::bump(&self.stats.processed);
            }
            Ok(Err(e)) if e.is_stale() => {
                debug!("Change listener {} ignoring stale {} event: {}", self.id, event.action, e);
                StatsCounters::bump(&self.stats.stale);
            }
            Ok(Err(e)) => {
                warn!(
                    "Change listener {} failed to apply {} for {}: {}",
                    self.id,
                    event.action,
                    event.code(),
                    e
                );
                StatsCounters::bump(&self.stats.failed);
            }
            Err(_) => {
                let e = FactError::EventBudgetExceeded {
                    code: event.code().to_string(),
                    budget,
                };
                warn!("Change listener {} skipping event: {}", self.id, e);
                StatsCounters::bump(&self.stats.skipped_budget);
            }
        }
    }

    /// Apply one event; transient connect failures are retried until the
    /// caller's budget runs out.
    async fn apply(&self, event: &ChangeEvent) -> FactResult<()> {
        match event.action {
            ChangeAction::Add | ChangeAction::Update => {
                let mut backoff = Backoff::new(self.config.backoff.clone());
                loop {
                    match self.registry.replace(event.datasource.clone()).await {
                        Err(e) if e.is_transient() => {
                            let delay = backoff.next_delay();
                            warn!(
                                "Change listener {} retrying {} for {} in {:?}: {}",
                                self.id,
                                event.action,
                                event.code(),
                                delay,
                                e
                            );
                            tokio::time::sleep(delay).await;
                        }
                        result => return result,
                    }
                }
            }
            // A DELETE without a version removes whatever is live.
            ChangeAction::Delete if event.version() == 0 => {
                match self.registry.remove(event.code()).await {
                    Err(FactError::UnknownDatasource(_)) => {
                        debug!(
                            "Change listener {} ignoring unversioned delete of unknown {}",
                            self.id,
                            event.code()
                        );
                        Ok(())
                    }
                    result => result,
                }
            }
            ChangeAction::Delete => {
                let removed = self
                    .registry
                    .remove_versioned(event.code(), event.version())
                    .await?;
                if !removed {
                    debug!(
                        "Change listener {} recorded delete of unknown datasource {}",
                        self.id,
                        event.code()
                    );
                }
                Ok(())
            }
        }
    }

    /// Sleep for `delay` unless cancelled first; false when cancelled
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn set_state(&self, state: ListenerState) {
        self.state.send_replace(state);
    }
}
