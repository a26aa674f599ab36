//! Subscription registry.
//!
//! Owns at most one live backend subscription per reactive query hash and
//! fans every pushed value out to the sinks attached to it. Entries move
//! through `Subscribing -> Live -> Closing` and are removed once closed;
//! with a backoff resubscribe policy a failed subscription passes through
//! `Retrying` and back to `Subscribing` instead of closing.
//!
//! Neither sinks nor backend calls run under the registry lock, so a sink
//! may call back into the registry (directly or through the cache it writes
//! to). Each delivery carries a sequence number: a sink never sees an older
//! value after a newer one, and once `release` returns the released sink
//! gets no new deliveries.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use pushpull_core::{
    Args, BackendError, FunctionName, ResubscribePolicy, SubscriptionError, Value,
};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::backend::{Backend, BackendSubscription, SubscriptionUpdate, UpdateListener};

/// Receiver of one subscription's deliveries.
pub trait SubscriptionSink: Send + Sync {
    fn on_value(&self, value: &Value);

    /// The subscription failed and will deliver nothing more to this sink.
    fn on_error(&self, error: &SubscriptionError);
}

pub type SharedSink = Arc<dyn SubscriptionSink>;

/// Lifecycle state of a registry entry. Absent entries have no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Opened (or reopened) and waiting for the first value.
    Subscribing,
    Live,
    /// Waiting to reopen after a failure.
    Retrying { attempt: u32 },
    /// The last sink left; the backend subscription is being torn down.
    Closing,
}

/// Proof of one acquisition, consumed by [`SubscriptionRegistry::release`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryHandle {
    query_hash: String,
    generation: u64,
    sink_id: u64,
}

impl RegistryHandle {
    pub fn query_hash(&self) -> &str {
        &self.query_hash
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

enum Delivery {
    Value(Value),
    Error(SubscriptionError),
}

/// One attached sink.
struct SinkSlot {
    id: u64,
    sink: SharedSink,
    /// Cleared under the registry lock by `release`.
    active: AtomicBool,
    /// Sequence number of the newest delivery handed to the sink.
    seen: Mutex<u64>,
}

impl SinkSlot {
    fn new(id: u64, sink: SharedSink) -> Arc<Self> {
        Arc::new(Self {
            id,
            sink,
            active: AtomicBool::new(true),
            seen: Mutex::new(0),
        })
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn dispatch(&self, seq: u64, delivery: &Delivery) {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.active.load(Ordering::Acquire) || seq <= *seen {
            return;
        }
        *seen = seq;
        match delivery {
            Delivery::Value(value) => self.sink.on_value(value),
            Delivery::Error(error) => {
                self.deactivate();
                self.sink.on_error(error);
            }
        }
    }
}

/// Deliveries collected under the lock and dispatched after it is dropped.
struct Dispatch {
    seq: u64,
    delivery: Delivery,
    slots: Vec<Arc<SinkSlot>>,
}

impl Dispatch {
    fn run(self) {
        for slot in &self.slots {
            slot.dispatch(self.seq, &self.delivery);
        }
    }
}

struct RegistryEntry {
    function: FunctionName,
    args: Args,
    generation: u64,
    /// Identifies the backend subscription currently feeding the entry.
    epoch: u64,
    state: SubscriptionState,
    sinks: Vec<Arc<SinkSlot>>,
    /// Last delivered value with its sequence number.
    last_value: Option<(u64, Value)>,
    subscription: Option<BackendSubscription>,
    /// Consecutive failures since the last delivered value.
    failures: u32,
    next_seq: u64,
}

impl RegistryEntry {
    fn accepts(&self, generation: u64, epoch: u64) -> bool {
        self.generation == generation
            && self.epoch == epoch
            && self.state != SubscriptionState::Closing
    }

    fn dispatch(&mut self, delivery: Delivery) -> Dispatch {
        self.next_seq += 1;
        Dispatch {
            seq: self.next_seq,
            delivery,
            slots: self.sinks.clone(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, RegistryEntry>,
    next_generation: u64,
    next_sink_id: u64,
}

struct RegistryShared {
    backend: Arc<dyn Backend>,
    policy: ResubscribePolicy,
    state: Mutex<RegistryState>,
}

impl RegistryShared {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            error!("Subscription registry lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn listener(self: &Arc<Self>, query_hash: &str, generation: u64, epoch: u64) -> UpdateListener {
        let weak: Weak<Self> = Arc::downgrade(self);
        let query_hash = query_hash.to_string();
        Arc::new(move |update| {
            if let Some(shared) = weak.upgrade() {
                shared.deliver(&query_hash, generation, epoch, update);
            }
        })
    }

    /// Open a backend subscription for an entry that is already registered.
    fn open(
        self: &Arc<Self>,
        query_hash: &str,
        generation: u64,
        epoch: u64,
        function: &FunctionName,
        args: &Args,
    ) -> Result<(), SubscriptionError> {
        let listener = self.listener(query_hash, generation, epoch);
        let subscription = self.backend.subscribe(function, args, listener)?;

        let orphan = {
            let mut state = self.lock();
            match state.entries.get_mut(query_hash) {
                Some(entry) if entry.accepts(generation, epoch) => {
                    entry.subscription = Some(subscription);
                    if matches!(entry.state, SubscriptionState::Retrying { .. }) {
                        entry.state = SubscriptionState::Subscribing;
                    }
                    None
                }
                _ => Some(subscription),
            }
        };
        if let Some(subscription) = orphan {
            debug!(query_hash = %query_hash, "Subscription released while opening, closing it");
            subscription.unsubscribe();
        }
        Ok(())
    }

    fn deliver(self: &Arc<Self>, query_hash: &str, generation: u64, epoch: u64, update: SubscriptionUpdate) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(query_hash) else {
            return;
        };
        if !entry.accepts(generation, epoch) {
            debug!(query_hash = %query_hash, "Dropped update from a superseded subscription");
            return;
        }

        match update {
            SubscriptionUpdate::Value(value) => {
                entry.state = SubscriptionState::Live;
                entry.failures = 0;
                let dispatch = entry.dispatch(Delivery::Value(value.clone()));
                entry.last_value = Some((dispatch.seq, value));
                drop(state);
                dispatch.run();
            }
            SubscriptionUpdate::Error(source) => {
                entry.failures += 1;
                let attempt = entry.failures;
                let function = entry.function.clone();

                if let Some(delay) = self.policy.delay_for(attempt) {
                    entry.state = SubscriptionState::Retrying { attempt };
                    entry.epoch += 1;
                    let next_epoch = entry.epoch;
                    let previous = entry.subscription.take();
                    drop(state);

                    warn!(
                        query_hash = %query_hash,
                        function = %function,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %source,
                        "Subscription failed, resubscribing"
                    );
                    drop(previous);
                    self.schedule_resubscribe(query_hash, generation, next_epoch, delay);
                    return;
                }

                let error = match self.policy {
                    ResubscribePolicy::Never => SubscriptionError::Terminated {
                        function: function.to_string(),
                        source,
                    },
                    ResubscribePolicy::Backoff { .. } => SubscriptionError::RetriesExhausted {
                        function: function.to_string(),
                        attempts: attempt - 1,
                    },
                };
                warn!(query_hash = %query_hash, function = %function, error = %error, "Subscription closed by failure");
                let dispatch = entry.dispatch(Delivery::Error(error));
                let removed = state.entries.remove(query_hash);
                drop(state);
                dispatch.run();
                drop(removed);
            }
        }
    }

    fn schedule_resubscribe(self: &Arc<Self>, query_hash: &str, generation: u64, epoch: u64, delay: Duration) {
        let query_hash = query_hash.to_string();
        match Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(self);
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.resubscribe(&query_hash, generation, epoch);
                    }
                });
            }
            Err(_) => {
                error!(query_hash = %query_hash, "No tokio runtime to resubscribe on, closing subscription");
                self.deliver(
                    &query_hash,
                    generation,
                    epoch,
                    SubscriptionUpdate::Error(BackendError::new("resubscribe requires a tokio runtime")),
                );
            }
        }
    }

    fn resubscribe(self: &Arc<Self>, query_hash: &str, generation: u64, epoch: u64) {
        let target = {
            let state = self.lock();
            state.entries.get(query_hash).and_then(|entry| {
                let retrying = matches!(entry.state, SubscriptionState::Retrying { .. });
                (retrying && entry.accepts(generation, epoch))
                    .then(|| (entry.function.clone(), entry.args.clone()))
            })
        };
        let Some((function, args)) = target else {
            return;
        };

        debug!(query_hash = %query_hash, function = %function, "Resubscribing");
        if let Err(err) = self.open(query_hash, generation, epoch, &function, &args) {
            let source = match err {
                SubscriptionError::OpenFailed { source, .. }
                | SubscriptionError::Terminated { source, .. } => source,
                other => BackendError::new(other.to_string()),
            };
            self.deliver(query_hash, generation, epoch, SubscriptionUpdate::Error(source));
        }
    }

    /// Undo a registration whose backend subscription could not be opened.
    fn fail_open(&self, query_hash: &str, generation: u64, sink_id: u64, error: &SubscriptionError) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(query_hash) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        let mut dispatch = entry.dispatch(Delivery::Error(error.clone()));
        dispatch.slots.retain(|slot| slot.id != sink_id);
        let removed = state.entries.remove(query_hash);
        drop(state);
        dispatch.run();
        drop(removed);
    }
}

/// Reference-counted map of live backend subscriptions keyed by query hash.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    shared: Arc<RegistryShared>,
}

impl SubscriptionRegistry {
    pub fn new(backend: Arc<dyn Backend>, policy: ResubscribePolicy) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                backend,
                policy,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn policy(&self) -> &ResubscribePolicy {
        &self.shared.policy
    }

    /// Attach `sink` to the subscription for `query_hash`, opening it if needed.
    ///
    /// A sink joining a live subscription immediately receives the last
    /// delivered value. Open failures are returned to the caller; sinks that
    /// joined while the subscription was opening get them on their error
    /// channel.
    pub fn acquire(
        &self,
        query_hash: &str,
        function: &FunctionName,
        args: &Args,
        sink: SharedSink,
    ) -> Result<RegistryHandle, SubscriptionError> {
        let (handle, joined, replay) = {
            let mut state = self.shared.lock();
            state.next_sink_id += 1;
            let sink_id = state.next_sink_id;
            let slot = SinkSlot::new(sink_id, sink);

            if let Some(entry) = state
                .entries
                .get_mut(query_hash)
                .filter(|entry| entry.state != SubscriptionState::Closing)
            {
                entry.sinks.push(slot.clone());
                debug!(
                    query_hash = %query_hash,
                    ref_count = entry.sinks.len(),
                    "Joined live subscription"
                );
                let handle = RegistryHandle {
                    query_hash: query_hash.to_string(),
                    generation: entry.generation,
                    sink_id,
                };
                let replay = entry.last_value.clone().map(|(seq, value)| Dispatch {
                    seq,
                    delivery: Delivery::Value(value),
                    slots: vec![slot],
                });
                (handle, true, replay)
            } else {
                state.next_generation += 1;
                let generation = state.next_generation;
                state.entries.insert(
                    query_hash.to_string(),
                    RegistryEntry {
                        function: function.clone(),
                        args: args.clone(),
                        generation,
                        epoch: 1,
                        state: SubscriptionState::Subscribing,
                        sinks: vec![slot],
                        last_value: None,
                        subscription: None,
                        failures: 0,
                        next_seq: 0,
                    },
                );
                let handle = RegistryHandle {
                    query_hash: query_hash.to_string(),
                    generation,
                    sink_id,
                };
                (handle, false, None)
            }
        };

        if let Some(replay) = replay {
            replay.run();
        }
        if joined {
            return Ok(handle);
        }

        debug!(query_hash = %query_hash, function = %function, "Opening backend subscription");
        match self
            .shared
            .open(query_hash, handle.generation, 1, function, args)
        {
            Ok(()) => Ok(handle),
            Err(error) => {
                warn!(query_hash = %query_hash, function = %function, error = %error, "Failed to open subscription");
                self.shared
                    .fail_open(query_hash, handle.generation, handle.sink_id, &error);
                Err(error)
            }
        }
    }

    /// Detach a sink. The last release closes the backend subscription.
    ///
    /// Returns `false` for handles that are stale or already released.
    pub fn release(&self, handle: RegistryHandle) -> bool {
        let subscription = {
            let mut state = self.shared.lock();
            let Some(entry) = state.entries.get_mut(&handle.query_hash) else {
                return false;
            };
            if entry.generation != handle.generation || entry.state == SubscriptionState::Closing {
                debug!(query_hash = %handle.query_hash, "Ignoring release of a stale handle");
                return false;
            }
            let Some(position) = entry.sinks.iter().position(|slot| slot.id == handle.sink_id) else {
                return false;
            };
            entry.sinks.remove(position).deactivate();
            if !entry.sinks.is_empty() {
                debug!(
                    query_hash = %handle.query_hash,
                    ref_count = entry.sinks.len(),
                    "Released subscription reference"
                );
                return true;
            }
            entry.state = SubscriptionState::Closing;
            entry.last_value = None;
            entry.subscription.take()
        };

        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }

        let mut state = self.shared.lock();
        let closed = state.entries.get(&handle.query_hash).is_some_and(|entry| {
            entry.generation == handle.generation && entry.state == SubscriptionState::Closing
        });
        if closed {
            state.entries.remove(&handle.query_hash);
        }
        debug!(query_hash = %handle.query_hash, "Closed backend subscription");
        true
    }

    /// Whether `handle` still refers to a live acquisition.
    pub fn is_current(&self, handle: &RegistryHandle) -> bool {
        self.shared
            .lock()
            .entries
            .get(&handle.query_hash)
            .is_some_and(|entry| {
                entry.generation == handle.generation
                    && entry.state != SubscriptionState::Closing
                    && entry.sinks.iter().any(|slot| slot.id == handle.sink_id)
            })
    }

    /// Number of subscriptions that are not closing.
    pub fn active_count(&self) -> usize {
        self.shared
            .lock()
            .entries
            .values()
            .filter(|entry| entry.state != SubscriptionState::Closing)
            .count()
    }

    pub fn state(&self, query_hash: &str) -> Option<SubscriptionState> {
        self.shared
            .lock()
            .entries
            .get(query_hash)
            .map(|entry| entry.state)
    }

    pub fn ref_count(&self, query_hash: &str) -> usize {
        self.shared
            .lock()
            .entries
            .get(query_hash)
            .map_or(0, |entry| entry.sinks.len())
    }

    pub fn last_value(&self, query_hash: &str) -> Option<Value> {
        self.shared
            .lock()
            .entries
            .get(query_hash)
            .and_then(|entry| entry.last_value.as_ref().map(|(_, value)| value.clone()))
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("policy", &self.shared.policy)
            .field("active", &self.active_count())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
