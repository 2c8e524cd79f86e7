//! MissionBusActor - organization-scoped broadcast of signals and alerts
//!
//! Dashboards subscribe per organization and receive `signal`, `alert` and
//! `crew-change` messages. Nothing is persisted; the actor caches only the
//! most recent `signal` per organization so a new subscriber can show the
//! crew's current availability straight away.
//!
//! # Delivery
//!
//! - Publishing is fire-and-forget (`cast`), fanned out in mailbox order.
//! - Every subscriber owns a bounded [`SignalQueue`]. When it is full the
//!   oldest message is dropped, so one slow dashboard never blocks others.
//! - A subscription that sees nothing for the idle window re-emits the last
//!   known signal as a heartbeat.
//!
//! # Example
//!
//! ```rust,ignore
//! let (bus, _handle) = MissionBus::spawn(MissionBusConfig::default()).await?;
//! let mut subscription = bus.subscribe("acme").await?;
//! bus.publish_signal("acme", SignalStatus::Busy, Some(crew_id));
//! let replay = subscription.next().await;
//! ```

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::{
    AlertPayload, AlertSeverity, CrewChangePayload, MissionMessage, SignalStatus,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

// ============================================================================
// Subscriber queue
// ============================================================================

/// Bounded drop-oldest queue owned by one subscriber
pub struct SignalQueue {
    buffer: Mutex<VecDeque<MissionMessage>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SignalQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<MissionMessage>> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, message: MissionMessage) {
        {
            let mut buffer = self.lock();
            while buffer.len() >= self.capacity {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(message);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<MissionMessage> {
        self.lock().pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Next buffered message; `None` once the bus has shut down and the
    /// buffer is drained.
    async fn recv(&self) -> Option<MissionMessage> {
        loop {
            if let Some(message) = self.pop() {
                return Some(message);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages discarded because this subscriber fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Subscription handle
// ============================================================================

/// One dashboard's view of an organization's mission stream.
///
/// Dropping it unsubscribes.
pub struct MissionSubscription {
    id: String,
    org_id: String,
    queue: Arc<SignalQueue>,
    bus: ActorRef<MissionBusMsg>,
    last_signal: MissionMessage,
    idle_window: Duration,
}

impl MissionSubscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    /// Most recent signal delivered (or replayed) to this subscriber
    pub fn last_signal(&self) -> &MissionMessage {
        &self.last_signal
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn idle_window(&self) -> Duration {
        self.idle_window
    }

    /// Wait for the next message, re-emitting the last signal after the idle
    /// window. Returns `None` when the bus has stopped.
    pub async fn next(&mut self) -> Option<MissionMessage> {
        match tokio::time::timeout(self.idle_window, self.recv()).await {
            Ok(message) => message,
            Err(_) => Some(self.heartbeat()),
        }
    }

    /// Wait for the next published message without any idle handling.
    /// Cancel-safe: a message is never lost when the future is dropped.
    pub async fn recv(&mut self) -> Option<MissionMessage> {
        let message = self.queue.recv().await?;
        if message.is_signal() {
            self.last_signal = message.clone();
        }
        Some(message)
    }

    /// The last signal again, for a stream that has been quiet.
    pub fn heartbeat(&self) -> MissionMessage {
        tracing::trace!(
            org_id = %self.org_id,
            subscriber_id = %self.id,
            "Mission stream idle, re-emitting last signal"
        );
        self.last_signal.clone()
    }
}

impl Drop for MissionSubscription {
    fn drop(&mut self) {
        let _ = self.bus.cast(MissionBusMsg::Unsubscribe {
            org_id: self.org_id.clone(),
            subscriber_id: self.id.clone(),
        });
    }
}

impl std::fmt::Debug for MissionSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MissionSubscription")
            .field("id", &self.id)
            .field("org_id", &self.org_id)
            .field("buffered", &self.queue.len())
            .finish()
    }
}

// ============================================================================
// MissionBusActor
// ============================================================================

/// Messages handled by MissionBusActor
#[derive(Debug)]
pub enum MissionBusMsg {
    /// Broadcast to every current subscriber of an organization
    Publish {
        org_id: String,
        message: MissionMessage,
    },

    /// Register a subscriber; the reply's queue already holds the replay
    Subscribe {
        org_id: String,
        reply: RpcReplyPort<MissionSubscription>,
    },

    Unsubscribe {
        org_id: String,
        subscriber_id: String,
    },

    /// Cached last signal for an organization (for debugging)
    LastSignal {
        org_id: String,
        reply: RpcReplyPort<Option<MissionMessage>>,
    },

    SubscriberCount {
        org_id: String,
        reply: RpcReplyPort<usize>,
    },
}

#[derive(Debug, Clone)]
pub struct MissionBusConfig {
    /// Per-subscriber buffer size
    pub buffer_capacity: usize,

    /// Quiet period after which the last signal is re-emitted
    pub idle_window: Duration,
}

impl Default for MissionBusConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 100,
            idle_window: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MissionBusArguments {
    pub config: MissionBusConfig,
}

pub struct MissionBusState {
    config: MissionBusConfig,
    subscribers: HashMap<String, HashMap<String, Arc<SignalQueue>>>,
    last_signals: HashMap<String, MissionMessage>,
}

#[derive(Debug, Default)]
pub struct MissionBusActor;

#[async_trait]
impl Actor for MissionBusActor {
    type Msg = MissionBusMsg;
    type State = MissionBusState;
    type Arguments = MissionBusArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            buffer_capacity = args.config.buffer_capacity,
            idle_window_secs = args.config.idle_window.as_secs_f64(),
            "MissionBusActor starting"
        );

        Ok(MissionBusState {
            config: args.config,
            subscribers: HashMap::new(),
            last_signals: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            MissionBusMsg::Publish { org_id, message } => {
                self.handle_publish(org_id, message, state);
            }
            MissionBusMsg::Subscribe { org_id, reply } => {
                self.handle_subscribe(myself, org_id, reply, state);
            }
            MissionBusMsg::Unsubscribe {
                org_id,
                subscriber_id,
            } => {
                self.handle_unsubscribe(&org_id, &subscriber_id, state);
            }
            MissionBusMsg::LastSignal { org_id, reply } => {
                let _ = reply.send(state.last_signals.get(&org_id).cloned());
            }
            MissionBusMsg::SubscriberCount { org_id, reply } => {
                let count = state.subscribers.get(&org_id).map_or(0, HashMap::len);
                let _ = reply.send(count);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for queue in state.subscribers.values().flat_map(HashMap::values) {
            queue.close();
        }
        tracing::info!(actor_id = %myself.get_id(), "MissionBusActor stopped");
        Ok(())
    }
}

impl MissionBusActor {
    fn handle_publish(&self, org_id: String, message: MissionMessage, state: &mut MissionBusState) {
        let subscribers = state.subscribers.get(&org_id);
        tracing::debug!(
            org_id = %org_id,
            subscribers = subscribers.map_or(0, HashMap::len),
            "Publishing mission message"
        );

        if let Some(subscribers) = subscribers {
            for queue in subscribers.values() {
                queue.push(message.clone());
            }
        }
        if message.is_signal() {
            state.last_signals.insert(org_id, message);
        }
    }

    fn handle_subscribe(
        &self,
        myself: ActorRef<MissionBusMsg>,
        org_id: String,
        reply: RpcReplyPort<MissionSubscription>,
        state: &mut MissionBusState,
    ) {
        let subscriber_id = ulid::Ulid::new().to_string();
        let replay = state
            .last_signals
            .get(&org_id)
            .cloned()
            .unwrap_or_else(MissionMessage::offline);

        let queue = Arc::new(SignalQueue::new(state.config.buffer_capacity));
        queue.push(replay.clone());
        state
            .subscribers
            .entry(org_id.clone())
            .or_default()
            .insert(subscriber_id.clone(), Arc::clone(&queue));

        tracing::info!(
            org_id = %org_id,
            subscriber_id = %subscriber_id,
            "Mission subscriber attached"
        );

        let subscription = MissionSubscription {
            id: subscriber_id,
            org_id,
            queue,
            bus: myself,
            last_signal: replay,
            idle_window: state.config.idle_window,
        };
        if reply.send(subscription).is_err() {
            tracing::debug!("Mission subscriber went away before attach completed");
        }
    }

    fn handle_unsubscribe(&self, org_id: &str, subscriber_id: &str, state: &mut MissionBusState) {
        let Some(subscribers) = state.subscribers.get_mut(org_id) else {
            return;
        };
        if subscribers.remove(subscriber_id).is_some() {
            tracing::info!(
                org_id = %org_id,
                subscriber_id = %subscriber_id,
                "Mission subscriber detached"
            );
        }
        if subscribers.is_empty() {
            state.subscribers.remove(org_id);
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MissionBusError {
    #[error("failed to spawn mission bus: {0}")]
    Spawn(String),

    #[error("mission bus unavailable: {0}")]
    Unavailable(String),
}

/// Cloneable handle used by the run driver and the WebSocket adapter
#[derive(Clone, Debug)]
pub struct MissionBus {
    actor: ActorRef<MissionBusMsg>,
}

impl MissionBus {
    pub async fn spawn(
        config: MissionBusConfig,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), MissionBusError> {
        let (actor, handle) = Actor::spawn(
            Some(format!("mission_bus:{}", ulid::Ulid::new())),
            MissionBusActor,
            MissionBusArguments { config },
        )
        .await
        .map_err(|e| MissionBusError::Spawn(e.to_string()))?;
        Ok((Self { actor }, handle))
    }

    pub fn actor(&self) -> &ActorRef<MissionBusMsg> {
        &self.actor
    }

    /// Fire-and-forget broadcast; failures are logged, never raised.
    pub fn publish(&self, org_id: &str, message: MissionMessage) {
        if let Err(e) = self.actor.cast(MissionBusMsg::Publish {
            org_id: org_id.to_string(),
            message,
        }) {
            tracing::warn!(org_id = %org_id, error = %e, "Failed to publish mission message");
        }
    }

    pub fn publish_signal(&self, org_id: &str, status: SignalStatus, crew_id: Option<Uuid>) {
        self.publish(org_id, MissionMessage::signal(status, crew_id));
    }

    pub fn publish_alert(
        &self,
        org_id: &str,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: Option<String>,
        crew_id: Option<Uuid>,
    ) {
        self.publish(
            org_id,
            MissionMessage::Alert(AlertPayload {
                severity,
                title: title.into(),
                message,
                crew_id,
            }),
        );
    }

    pub fn publish_crew_change(&self, org_id: &str, crew_id: Uuid) {
        self.publish(
            org_id,
            MissionMessage::CrewChange(CrewChangePayload { crew_id }),
        );
    }

    pub async fn subscribe(&self, org_id: &str) -> Result<MissionSubscription, MissionBusError> {
        let org_id = org_id.to_string();
        ractor::call!(self.actor, |reply| MissionBusMsg::Subscribe { org_id, reply })
            .map_err(|e| MissionBusError::Unavailable(e.to_string()))
    }

    pub async fn last_signal(&self, org_id: &str) -> Result<Option<MissionMessage>, MissionBusError> {
        let org_id = org_id.to_string();
        ractor::call!(self.actor, |reply| MissionBusMsg::LastSignal { org_id, reply })
            .map_err(|e| MissionBusError::Unavailable(e.to_string()))
    }

    pub async fn subscriber_count(&self, org_id: &str) -> Result<usize, MissionBusError> {
        let org_id = org_id.to_string();
        ractor::call!(self.actor, |reply| MissionBusMsg::SubscriberCount {
            org_id,
            reply
        })
        .map_err(|e| MissionBusError::Unavailable(e.to_string()))
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }
}
