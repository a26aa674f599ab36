//! PUSHPULL Test Utilities
//!
//! Shared test infrastructure for the PUSHPULL workspace:
//! - A scriptable mock backend with manual push control
//! - A small reactive in-memory backend for demos and scenario tests
//! - Proptest generators for function names, arguments and JSON values
//! - Fixtures for bridge and cache configuration

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::Notify;

pub use pushpull_bridge::{Backend, BackendSubscription, SubscriptionUpdate, UpdateListener};
pub use pushpull_core::{
    Args, BackendError, FunctionName, QueryKey, SubscriptionError, Value,
};

mod demo;

pub use demo::{DemoBackend, Message};

fn function_name(raw: &str) -> FunctionName {
    match FunctionName::parse(raw) {
        Ok(name) => name,
        Err(err) => panic!("test backend given an invalid function name: {err}"),
    }
}

// ============================================================================
// MOCK BACKEND
// ============================================================================

/// How a recorded one-shot call reached the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Action,
    Mutation,
}

/// One `invoke_once` / `invoke_write` call seen by [`MockBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub function: FunctionName,
    pub args: Args,
}

struct MockSubscription {
    id: u64,
    function: FunctionName,
    args: Args,
    listener: UpdateListener,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    open: Vec<MockSubscription>,
    subscribe_calls: usize,
    unsubscribe_calls: usize,
    open_failures: VecDeque<BackendError>,
    initial_values: HashMap<FunctionName, Value>,
    scripted: HashMap<FunctionName, VecDeque<Result<Value, BackendError>>>,
    responses: HashMap<FunctionName, Result<Value, BackendError>>,
    calls: Vec<RecordedCall>,
}

/// Backend whose subscriptions only deliver what the test pushes.
///
/// Listeners are always invoked without the mock's lock held, so they may
/// call back into the bridge freely.
#[derive(Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    opened: Notify,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `value` synchronously from inside `subscribe` for every new
    /// subscription to `function`.
    pub fn set_initial_value(&self, function: &str, value: Value) {
        self.lock().initial_values.insert(function_name(function), value);
    }

    /// Make the next `subscribe` call fail with `error`.
    pub fn fail_next_subscribe(&self, error: BackendError) {
        self.lock().open_failures.push_back(error);
    }

    fn listeners_for(&self, function: &str, args: Option<&Args>) -> Vec<UpdateListener> {
        let function = function_name(function);
        self.lock()
            .open
            .iter()
            .filter(|sub| sub.function == function)
            .filter(|sub| args.map_or(true, |args| &sub.args == args))
            .map(|sub| sub.listener.clone())
            .collect()
    }

    /// Push `value` to every open subscription of `function`.
    /// Returns the number of subscriptions reached.
    pub fn push(&self, function: &str, value: Value) -> usize {
        let listeners = self.listeners_for(function, None);
        for listener in &listeners {
            listener(SubscriptionUpdate::Value(value.clone()));
        }
        listeners.len()
    }

    /// Push `value` only to subscriptions of `function` opened with `args`.
    pub fn push_to(&self, function: &str, args: &Args, value: Value) -> usize {
        let listeners = self.listeners_for(function, Some(args));
        for listener in &listeners {
            listener(SubscriptionUpdate::Value(value.clone()));
        }
        listeners.len()
    }

    /// Fail every open subscription of `function`. Failed subscriptions are
    /// closed and receive nothing further.
    pub fn fail(&self, function: &str, error: BackendError) -> usize {
        let name = function_name(function);
        let listeners: Vec<UpdateListener> = {
            let mut state = self.lock();
            let (failed, open): (Vec<_>, Vec<_>) = std::mem::take(&mut state.open)
                .into_iter()
                .partition(|sub| sub.function == name);
            state.open = open;
            failed.into_iter().map(|sub| sub.listener).collect()
        };
        for listener in &listeners {
            listener(SubscriptionUpdate::Error(error.clone()));
        }
        listeners.len()
    }

    /// Queue a one-time response for the next call to `function`.
    pub fn respond_once(&self, function: &str, result: Result<Value, BackendError>) {
        self.lock()
            .scripted
            .entry(function_name(function))
            .or_default()
            .push_back(result);
    }

    /// Answer every call to `function` with `result` once queued responses
    /// run out.
    pub fn respond(&self, function: &str, result: Result<Value, BackendError>) {
        self.lock().responses.insert(function_name(function), result);
    }

    /// Total `subscribe` calls, failed ones included.
    pub fn subscribe_count(&self) -> usize {
        self.lock().subscribe_calls
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.lock().unsubscribe_calls
    }

    /// Subscriptions currently open across all functions.
    pub fn open_count(&self) -> usize {
        self.lock().open.len()
    }

    pub fn open_count_for(&self, function: &str) -> usize {
        let function = function_name(function);
        self.lock()
            .open
            .iter()
            .filter(|sub| sub.function == function)
            .count()
    }

    /// Wait until at least `count` subscriptions to `function` are open.
    pub async fn wait_for_open(&self, function: &str, count: usize) {
        loop {
            let opened = self.opened.notified();
            if self.open_count_for(function) >= count {
                return;
            }
            opened.await;
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, function: &str) -> usize {
        let function = function_name(function);
        self.lock()
            .calls
            .iter()
            .filter(|call| call.function == function)
            .count()
    }

    fn answer(&self, kind: CallKind, function: &FunctionName, args: &Args) -> Result<Value, BackendError> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            kind,
            function: function.clone(),
            args: args.clone(),
        });
        if let Some(result) = state
            .scripted
            .get_mut(function)
            .and_then(|queue| queue.pop_front())
        {
            return result;
        }
        state
            .responses
            .get(function)
            .cloned()
            .unwrap_or_else(|| Err(BackendError::new(format!("No response scripted for {function}"))))
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn subscribe(
        &self,
        function: &FunctionName,
        args: &Args,
        listener: UpdateListener,
    ) -> Result<BackendSubscription, SubscriptionError> {
        let (id, initial) = {
            let mut state = self.lock();
            state.subscribe_calls += 1;
            if let Some(source) = state.open_failures.pop_front() {
                return Err(SubscriptionError::OpenFailed {
                    function: function.to_string(),
                    source,
                });
            }
            state.next_id += 1;
            let id = state.next_id;
            state.open.push(MockSubscription {
                id,
                function: function.clone(),
                args: args.clone(),
                listener: listener.clone(),
            });
            (id, state.initial_values.get(function).cloned())
        };
        self.opened.notify_waiters();

        if let Some(value) = initial {
            listener(SubscriptionUpdate::Value(value));
        }

        let weak: Weak<Mutex<MockState>> = Arc::downgrade(&self.state);
        Ok(BackendSubscription::new(move || {
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                let before = state.open.len();
                state.open.retain(|sub| sub.id != id);
                if state.open.len() != before {
                    state.unsubscribe_calls += 1;
                }
            }
        }))
    }

    async fn invoke_once(&self, function: &FunctionName, args: &Args) -> Result<Value, BackendError> {
        self.answer(CallKind::Action, function, args)
    }

    async fn invoke_write(&self, function: &FunctionName, args: &Args) -> Result<Value, BackendError> {
        self.answer(CallKind::Mutation, function, args)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for bridge inputs.

    use super::*;
    use proptest::prelude::*;
    use pushpull_core::Skippable;

    /// Generate a valid, already-normalized function name.
    pub fn arb_function_name() -> impl Strategy<Value = FunctionName> {
        ("[a-z]{1,8}(/[a-z]{1,8}){0,2}", "[a-z][a-zA-Z0-9_]{0,10}")
            .prop_filter_map("function name must parse", |(module, export)| {
                FunctionName::parse(&format!("{module}:{export}")).ok()
            })
    }

    /// Generate a JSON scalar.
    pub fn arb_json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
        ]
    }

    /// Generate a nested JSON value.
    pub fn arb_json() -> impl Strategy<Value = Value> {
        arb_json_leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    /// Generate an argument record.
    pub fn arb_args() -> impl Strategy<Value = Args> {
        prop::collection::btree_map("[a-z]{1,6}", arb_json(), 0..5)
            .prop_map(|m| Args::from(m.into_iter().collect::<serde_json::Map<String, Value>>()))
    }

    /// Generate arguments that are skipped about a third of the time.
    pub fn arb_skippable_args() -> impl Strategy<Value = Skippable<Value>> {
        prop_oneof![
            2 => arb_args().prop_map(|args| Skippable::Run(args.into_value())),
            1 => Just(Skippable::Skip),
        ]
    }

    /// Generate a backend error, with or without attached data.
    pub fn arb_backend_error() -> impl Strategy<Value = BackendError> {
        ("[a-zA-Z ]{1,24}", proptest::option::of(arb_json())).prop_map(|(message, data)| {
            match data {
                Some(data) => BackendError::with_data(message, data),
                None => BackendError::new(message),
            }
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Common configurations for bridge tests.

    use std::time::Duration;

    use pushpull_cache::{CacheConfig, QueryClient};
    use pushpull_core::{BridgeConfig, ResubscribePolicy};

    /// Bridge config whose reactive entries are dropped as soon as their
    /// last observer goes away.
    pub fn eager_release_config() -> BridgeConfig {
        BridgeConfig {
            reactive_gc_time: Some(Duration::ZERO),
            ..BridgeConfig::default()
        }
    }

    /// Bridge config that resubscribes quickly and gives up after `attempts`.
    pub fn fast_backoff_config(attempts: u32) -> BridgeConfig {
        BridgeConfig {
            resubscribe: ResubscribePolicy::backoff(
                Duration::from_millis(10),
                Duration::from_millis(40),
                attempts,
            ),
            ..BridgeConfig::default()
        }
    }

    /// Cache config with retries disabled so failures surface immediately.
    pub fn no_retry_cache_config() -> CacheConfig {
        CacheConfig::default().with_retry(0)
    }

    pub fn no_retry_client() -> std::sync::Arc<QueryClient> {
        std::sync::Arc::new(QueryClient::new(no_retry_cache_config()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn name(raw: &str) -> FunctionName {
        FunctionName::parse(raw).unwrap()
    }

    fn counting_listener() -> (Arc<Mutex<Vec<SubscriptionUpdate>>>, UpdateListener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: UpdateListener = Arc::new(move |update: SubscriptionUpdate| {
            sink.lock().unwrap().push(update)
        });
        (seen, listener)
    }

    #[test]
    fn test_mock_push_reaches_open_subscriptions() {
        let backend = MockBackend::new();
        let (seen, listener) = counting_listener();
        let subscription = backend
            .subscribe(&name("repos:get"), &Args::empty(), listener)
            .unwrap();

        assert_eq!(backend.push("repos:get", json!({"stars": 1})), 1);
        assert_eq!(backend.push("repos:list", json!([])), 0);
        assert_eq!(seen.lock().unwrap().len(), 1);

        subscription.unsubscribe();
        assert_eq!(backend.open_count(), 0);
        assert_eq!(backend.unsubscribe_count(), 1);
        assert_eq!(backend.push("repos:get", json!({"stars": 2})), 0);
    }

    #[test]
    fn test_mock_initial_value_is_delivered_during_subscribe() {
        let backend = MockBackend::new();
        backend.set_initial_value("repos:get", json!({"stars": 7}));
        let (seen, listener) = counting_listener();
        let _subscription = backend
            .subscribe(&name("repos:get"), &Args::empty(), listener)
            .unwrap();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[SubscriptionUpdate::Value(json!({"stars": 7}))]
        );
    }

    #[test]
    fn test_mock_fail_next_subscribe() {
        let backend = MockBackend::new();
        backend.fail_next_subscribe(BackendError::new("offline"));
        let (_, listener) = counting_listener();
        let err = backend
            .subscribe(&name("repos:get"), &Args::empty(), listener)
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::OpenFailed { .. }));
        assert_eq!(backend.subscribe_count(), 1);
        assert_eq!(backend.open_count(), 0);
    }

    #[test]
    fn test_mock_fail_closes_subscription() {
        let backend = MockBackend::new();
        let (seen, listener) = counting_listener();
        let subscription = backend
            .subscribe(&name("repos:get"), &Args::empty(), listener)
            .unwrap();
        assert_eq!(backend.fail("repos:get", BackendError::new("gone")), 1);
        assert_eq!(backend.open_count(), 0);
        drop(subscription);
        assert_eq!(backend.unsubscribe_count(), 0);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[SubscriptionUpdate::Error(BackendError::new("gone"))]
        );
    }

    #[tokio::test]
    async fn test_mock_scripted_responses() {
        let backend = MockBackend::new();
        backend.respond("weather:get", Ok(json!({"temp": 20})));
        backend.respond_once("weather:get", Err(BackendError::new("rate limited")));

        let function = name("weather:get");
        let first = backend.invoke_once(&function, &Args::empty()).await;
        let second = backend.invoke_once(&function, &Args::empty()).await;
        assert_eq!(first, Err(BackendError::new("rate limited")));
        assert_eq!(second, Ok(json!({"temp": 20})));
        assert_eq!(backend.call_count("weather:get"), 2);

        let unknown = backend.invoke_write(&name("messages:send"), &Args::empty()).await;
        assert!(unknown.is_err());
        assert_eq!(backend.calls()[2].kind, CallKind::Mutation);
    }

    #[tokio::test]
    async fn test_mock_wait_for_open() {
        let backend = MockBackend::new();
        let opener = backend.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let task = tokio::spawn(async move {
            let listener: UpdateListener = Arc::new(move |_: SubscriptionUpdate| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            opener
                .subscribe(&name("repos:get"), &Args::empty(), listener)
                .unwrap()
        });
        backend.wait_for_open("repos:get", 1).await;
        let _subscription = task.await.unwrap();
        assert_eq!(backend.push("repos:get", json!(1)), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: generated function names are already normalized.
        #[test]
        fn prop_generated_names_round_trip(function in generators::arb_function_name()) {
            let reparsed = FunctionName::parse(function.as_str()).unwrap();
            prop_assert_eq!(reparsed, function);
        }

        /// Property: generated arguments are always records.
        #[test]
        fn prop_generated_args_are_records(args in generators::arb_args()) {
            prop_assert!(args.into_value().is_object());
        }
    }
}
