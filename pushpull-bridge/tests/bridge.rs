//! Bridge controller, query adapter and mutation adapter against a mock backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use proptest::prelude::*;
use pushpull_bridge::{QueryBridge, QueryClientExt, SubscriptionState};
use pushpull_cache::{
    CacheConfig, CacheEvent, PullCache, QueryClient, QueryFnContext, QueryOptions, QueryStatus, StaleTime,
};
use pushpull_core::{
    ActionRef, Args, BackendError, BridgeConfig, BridgeError, FetchError, FunctionName,
    InvocationError, MutationRef, NotConnectedError, QueryKey, QueryRef, Skippable,
    SubscriptionError, Value,
};
use pushpull_test_utils::{fixtures, generators, MockBackend};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize)]
struct RepoArgs {
    repo: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Repo {
    stars: u64,
}

#[derive(Debug, Clone, Serialize)]
struct CityArgs {
    city: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Weather {
    temperature_c: i64,
}

fn repo_args(repo: &str) -> RepoArgs {
    RepoArgs {
        repo: repo.to_string(),
    }
}

fn get_repo() -> QueryRef<RepoArgs, Repo> {
    QueryRef::parse("repos:get").unwrap()
}

fn get_weather() -> ActionRef<CityArgs, Weather> {
    ActionRef::parse("weather:get").unwrap()
}

fn star_repo() -> MutationRef<RepoArgs, u64> {
    MutationRef::parse("repos:star").unwrap()
}

fn connected(
    config: BridgeConfig,
    client: Arc<QueryClient>,
) -> (Arc<MockBackend>, Arc<QueryClient>, QueryBridge) {
    let backend = MockBackend::new();
    let bridge = QueryBridge::new(backend.clone(), config).unwrap();
    bridge.connect(&client).unwrap();
    (backend, client, bridge)
}

fn setup() -> (Arc<MockBackend>, Arc<QueryClient>, QueryBridge) {
    connected(BridgeConfig::default(), fixtures::no_retry_client())
}

fn reactive_prefix() -> QueryKey {
    QueryKey::new(vec![json!("reactiveQuery")])
}

/// Push from another thread so a deadlocked delivery fails instead of hanging.
fn push_within_deadline(backend: &Arc<MockBackend>, function: &'static str, value: Value) -> usize {
    let backend = backend.clone();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(backend.push(function, value));
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("push did not complete")
}

// ============================================================================
// CONNECTION
// ============================================================================

#[test]
fn test_helpers_before_connect_fail_with_not_connected() {
    let bridge = QueryBridge::new(MockBackend::new(), BridgeConfig::default()).unwrap();
    assert!(!bridge.is_connected());

    let err = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap_err();
    assert_eq!(err, BridgeError::NotConnected(NotConnectedError));

    let err = bridge
        .action_query_skippable(&get_weather(), Skippable::Skip)
        .unwrap_err();
    assert_eq!(err, BridgeError::NotConnected(NotConnectedError));
}

#[test]
fn test_connect_is_idempotent_for_same_cache() {
    let (_, client, bridge) = setup();
    assert!(bridge.connect(&client).is_ok());
    assert!(bridge.is_connected());
    assert_eq!(client.stats().listeners, 1);
}

#[test]
fn test_connect_to_second_cache_is_rejected() {
    let (_, _, bridge) = setup();
    let other = Arc::new(QueryClient::default());
    assert_eq!(bridge.connect(&other), Err(BridgeError::AlreadyConnected));

    bridge.disconnect().unwrap();
    assert!(bridge.connect(&other).is_ok());
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = BridgeConfig::default().with_resubscribe(pushpull_core::ResubscribePolicy::Backoff {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(100),
        multiplier: 0.5,
        max_attempts: 3,
    });
    let err = QueryBridge::new(MockBackend::new(), config).unwrap_err();
    assert!(matches!(err, BridgeError::Config(_)));
}

#[test]
fn test_installed_hash_fn_keeps_foreign_keys_apart() {
    let (_, client, bridge) = setup();
    let foreign = QueryKey::new(vec![json!("todos"), json!({"page": 1})]);
    assert!(client.hash_key(&foreign).starts_with("q:"));

    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();
    assert_eq!(client.hash_key(descriptor.query_key()), descriptor.query_hash());
    assert!(descriptor.query_hash().starts_with("reactiveQuery:"));
}

// ============================================================================
// DEFAULT FETCH FUNCTION
// ============================================================================

#[tokio::test]
async fn test_foreign_key_reaching_bridge_fetch_is_rejected() {
    let (_, client, _bridge) = setup();
    let key = QueryKey::new(vec![json!("todos")]);
    let err = client.fetch_query(QueryOptions::new(key)).await.unwrap_err();
    assert!(matches!(err, FetchError::ForeignKey { .. }));
}

#[tokio::test]
async fn test_fetching_skipped_key_is_rejected() {
    let (backend, client, bridge) = setup();
    let descriptor = bridge
        .reactive_query_skippable(&get_repo(), Skippable::Skip)
        .unwrap();
    assert!(!descriptor.is_enabled());

    let err = client.fetch_data(descriptor).await.unwrap_err();
    assert!(matches!(err, FetchError::Skipped { .. }));
    assert_eq!(backend.subscribe_count(), 0);
}

#[tokio::test]
async fn test_query_fn_after_bridge_dropped_reports_disconnected() {
    let (_, _, bridge) = setup();
    let query_fn = bridge.query_fn();
    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();
    let context = QueryFnContext {
        query_key: descriptor.query_key().clone(),
        query_hash: descriptor.query_hash(),
    };
    drop(descriptor);
    drop(bridge);
    assert_eq!(query_fn(context).await, Err(FetchError::Disconnected));
}

// ============================================================================
// REACTIVE QUERIES
// ============================================================================

#[tokio::test]
async fn test_reactive_fetch_resolves_with_first_value() {
    let (backend, client, bridge) = setup();
    backend.set_initial_value("repos:get", json!({"stars": 3}));

    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();
    let repo = client.ensure_data(descriptor.clone()).await.unwrap();
    assert_eq!(repo, Repo { stars: 3 });
    assert_eq!(bridge.held_queries(), 1);
    assert_eq!(bridge.active_subscriptions(), 1);

    // Served from the cache: reactive entries are never stale.
    let again = client.fetch_data(descriptor).await.unwrap();
    assert_eq!(again, Repo { stars: 3 });
    assert_eq!(backend.subscribe_count(), 1);
}

#[tokio::test]
async fn test_reactive_descriptor_defaults() {
    let config = BridgeConfig::default().with_reactive_gc_time(Duration::from_secs(5));
    let (_, _, bridge) = connected(config, fixtures::no_retry_client());
    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();
    assert!(descriptor.is_enabled());
    assert_eq!(descriptor.options().stale_time, Some(StaleTime::Never));
    assert_eq!(descriptor.options().gc_time, Some(Duration::from_secs(5)));
    assert!(descriptor.into_options().query_fn.is_some());
}

#[tokio::test]
async fn test_pushes_replace_cached_value() {
    let (backend, client, bridge) = setup();
    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();
    let key = descriptor.query_key().clone();
    let mut observer = client.observe(descriptor);

    backend.wait_for_open("repos:get", 1).await;
    for stars in 1..=3u64 {
        assert_eq!(backend.push("repos:get", json!({ "stars": stars })), 1);
        let state = observer
            .observer_mut()
            .wait_for(|state| state.data == Some(json!({ "stars": stars })))
            .await
            .unwrap();
        assert_eq!(state.status, QueryStatus::Success);
    }
    assert_eq!(client.query_data(&key), Some(json!({"stars": 3})));
    assert_eq!(observer.data(), Some(Ok(Repo { stars: 3 })));
}

#[tokio::test]
async fn test_different_args_open_separate_subscriptions() {
    let (backend, client, bridge) = setup();
    let first = client.observe(bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap());
    let second = client.observe(bridge.reactive_query(&get_repo(), repo_args("c/d")).unwrap());

    backend.wait_for_open("repos:get", 2).await;
    assert_eq!(bridge.active_subscriptions(), 2);

    let args = Args::from_serialize(&repo_args("c/d")).unwrap();
    assert_eq!(backend.push_to("repos:get", &args, json!({"stars": 8})), 1);
    assert_eq!(second.observer().data(), Some(json!({"stars": 8})));
    assert_eq!(first.observer().data(), None);
}

#[tokio::test]
async fn test_entry_removal_releases_subscription() {
    let (backend, client, bridge) =
        connected(fixtures::eager_release_config(), fixtures::no_retry_client());
    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();
    let key = descriptor.query_key().clone();
    let mut observer = client.observe(descriptor.clone());

    backend.wait_for_open("repos:get", 1).await;
    backend.push("repos:get", json!({"stars": 1}));
    observer
        .observer_mut()
        .wait_for(|state| state.is_success() && !state.is_fetching())
        .await
        .unwrap();

    drop(observer);
    assert!(client.query_state(&key).is_none());
    assert_eq!(backend.open_count(), 0);
    assert_eq!(backend.unsubscribe_count(), 1);
    assert_eq!(bridge.held_queries(), 0);
    assert_eq!(bridge.active_subscriptions(), 0);
    assert_eq!(backend.push("repos:get", json!({"stars": 2})), 0);

    // A fresh observer opens a fresh subscription.
    let _observer = client.observe(descriptor);
    backend.wait_for_open("repos:get", 1).await;
    assert_eq!(backend.subscribe_count(), 2);
}

#[tokio::test]
async fn test_remove_queries_releases_subscription() {
    let (backend, client, bridge) = setup();
    backend.set_initial_value("repos:get", json!({"stars": 1}));
    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();
    client.fetch_data(descriptor).await.unwrap();
    assert_eq!(backend.open_count(), 1);

    assert_eq!(client.remove_queries(&reactive_prefix()), 1);
    assert_eq!(backend.open_count(), 0);
    assert_eq!(bridge.held_queries(), 0);
}

#[tokio::test]
async fn test_cache_listener_may_call_bridge_during_push() {
    let (backend, client, bridge) = setup();
    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();
    let query_hash = descriptor.query_hash();
    let observer = client.observe(descriptor);
    backend.wait_for_open("repos:get", 1).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let listener_id = client.subscribe_events(Arc::new({
        let bridge = bridge.clone();
        let seen = seen.clone();
        let query_hash = query_hash.clone();
        move |event: &CacheEvent| {
            if matches!(event, CacheEvent::Updated { .. }) {
                seen.lock().unwrap().push((
                    bridge.active_subscriptions(),
                    bridge.registry().state(&query_hash),
                ));
            }
        }
    }));

    assert_eq!(push_within_deadline(&backend, "repos:get", json!({"stars": 1})), 1);
    client.unsubscribe_events(listener_id);

    assert!(seen
        .lock()
        .unwrap()
        .contains(&(1, Some(SubscriptionState::Live))));
    assert_eq!(observer.observer().data(), Some(json!({"stars": 1})));
}

#[tokio::test]
async fn test_cache_listener_may_remove_entry_during_push() {
    let (backend, client, bridge) = setup();
    backend.set_initial_value("repos:get", json!({"stars": 1}));
    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();
    client.fetch_data(descriptor).await.unwrap();
    assert_eq!(bridge.held_queries(), 1);

    let removed = Arc::new(AtomicBool::new(false));
    let listener_id = client.subscribe_events(Arc::new({
        let client = Arc::downgrade(&client);
        let removed = removed.clone();
        move |event: &CacheEvent| {
            if !matches!(event, CacheEvent::Updated { .. }) || removed.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(client) = client.upgrade() {
                client.remove_queries(&reactive_prefix());
            }
        }
    }));

    assert_eq!(push_within_deadline(&backend, "repos:get", json!({"stars": 2})), 1);
    client.unsubscribe_events(listener_id);

    assert!(removed.load(Ordering::SeqCst));
    assert_eq!(bridge.held_queries(), 0);
    assert_eq!(bridge.active_subscriptions(), 0);
    assert_eq!(backend.open_count(), 0);
    assert_eq!(backend.push("repos:get", json!({"stars": 3})), 0);
}

#[tokio::test]
async fn test_refetch_reuses_live_subscription() {
    let (backend, client, bridge) = setup();
    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();
    let query_hash = descriptor.query_hash();
    let mut observer = client.observe(descriptor);

    backend.wait_for_open("repos:get", 1).await;
    backend.push("repos:get", json!({"stars": 4}));
    observer
        .observer_mut()
        .wait_for(|state| state.is_success() && !state.is_fetching())
        .await
        .unwrap();

    assert_eq!(client.invalidate_queries(&reactive_prefix()), 1);
    assert_eq!(client.refetch_queries(&reactive_prefix()).await, 1);
    let value = observer.observer().refetch().await.unwrap();

    assert_eq!(value, json!({"stars": 4}));
    assert_eq!(backend.subscribe_count(), 1);
    assert_eq!(bridge.registry().ref_count(&query_hash), 1);
    assert!(!observer.state().is_invalidated);
}

#[tokio::test]
async fn test_subscription_error_sets_entry_error() {
    let (backend, client, bridge) = setup();
    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();
    let mut observer = client.observe(descriptor);

    backend.wait_for_open("repos:get", 1).await;
    backend.push("repos:get", json!({"stars": 1}));
    observer
        .observer_mut()
        .wait_for(|state| state.is_success() && !state.is_fetching())
        .await
        .unwrap();

    backend.fail("repos:get", BackendError::new("server gone"));
    let state = observer
        .observer_mut()
        .wait_for(|state| state.is_error())
        .await
        .unwrap();
    assert_eq!(
        state.error,
        Some(FetchError::Subscription(SubscriptionError::Terminated {
            function: "repos:get".to_string(),
            source: BackendError::new("server gone"),
        }))
    );
    assert_eq!(state.error_update_count, 1);
    assert!(!state.is_fetching());
    assert_eq!(bridge.active_subscriptions(), 0);

    // A manual refetch opens a new subscription and clears the error.
    let (refetched, _) = tokio::join!(observer.observer().refetch(), async {
        backend.wait_for_open("repos:get", 1).await;
        backend.push("repos:get", json!({"stars": 5}));
    });
    assert_eq!(refetched.unwrap(), json!({"stars": 5}));
    assert_eq!(backend.subscribe_count(), 2);
    assert!(observer.error().is_none());
}

#[tokio::test]
async fn test_open_failure_rejects_fetch() {
    let (backend, client, bridge) = setup();
    backend.fail_next_subscribe(BackendError::new("offline"));
    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();

    let err = client.fetch_data(descriptor).await.unwrap_err();
    assert_eq!(
        err,
        FetchError::Subscription(SubscriptionError::OpenFailed {
            function: "repos:get".to_string(),
            source: BackendError::new("offline"),
        })
    );
    assert_eq!(bridge.held_queries(), 0);
    assert_eq!(bridge.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_cache_retry_recovers_from_open_failure() {
    let client = Arc::new(QueryClient::new(
        CacheConfig::default()
            .with_retry(1)
            .with_retry_delay(Duration::from_millis(1), Duration::from_millis(1)),
    ));
    let (backend, client, bridge) = connected(BridgeConfig::default(), client);
    backend.fail_next_subscribe(BackendError::new("offline"));
    backend.set_initial_value("repos:get", json!({"stars": 2}));

    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();
    assert_eq!(client.fetch_data(descriptor).await.unwrap(), Repo { stars: 2 });
    assert_eq!(backend.subscribe_count(), 2);
    assert_eq!(backend.open_count(), 1);
}

#[tokio::test]
async fn test_backoff_policy_resubscribes_without_error_state() {
    let (backend, client, bridge) =
        connected(fixtures::fast_backoff_config(3), fixtures::no_retry_client());
    let descriptor = bridge.reactive_query(&get_repo(), repo_args("a/b")).unwrap();
    let mut observer = client.observe(descriptor);

    backend.wait_for_open("repos:get", 1).await;
    backend.push("repos:get", json!({"stars": 1}));
    observer
        .observer_mut()
        .wait_for(|state| state.is_success() && !state.is_fetching())
        .await
        .unwrap();

    backend.fail("repos:get", BackendError::new("connection reset"));
    backend.wait_for_open("repos:get", 1).await;
    backend.push("repos:get", json!({"stars": 9}));

    let state = observer
        .observer_mut()
        .wait_for(|state| state.data == Some(json!({"stars": 9})))
        .await
        .unwrap();
    assert!(state.error.is_none());
    assert_eq!(backend.subscribe_count(), 2);
    assert_eq!(bridge.held_queries(), 1);
}

#[tokio::test]
async fn test_disconnect_releases_every_held_subscription() {
    let (backend, client, bridge) = setup();
    backend.set_initial_value("repos:get", json!({"stars": 0}));
    for repo in ["a/b", "c/d", "e/f"] {
        let descriptor = bridge.reactive_query(&get_repo(), repo_args(repo)).unwrap();
        client.fetch_data(descriptor).await.unwrap();
    }
    assert_eq!(backend.open_count(), 3);

    bridge.disconnect().unwrap();
    assert!(!bridge.is_connected());
    assert_eq!(backend.open_count(), 0);
    assert_eq!(bridge.held_queries(), 0);
    assert_eq!(client.stats().listeners, 0);
    assert!(bridge.disconnect().is_ok());
    assert!(matches!(
        bridge.reactive_query(&get_repo(), repo_args("a/b")),
        Err(BridgeError::NotConnected(_))
    ));
}

// ============================================================================
// ACTIONS
// ============================================================================

#[tokio::test]
async fn test_action_query_invokes_once_per_fetch() {
    let (backend, client, bridge) = setup();
    backend.respond("weather:get", Ok(json!({"temperature_c": 21})));
    let descriptor = bridge
        .action_query(&get_weather(), CityArgs { city: "Oslo".to_string() })
        .unwrap();
    assert!(descriptor.query_hash().starts_with("action:"));

    let weather = client.fetch_data(descriptor.clone()).await.unwrap();
    assert_eq!(weather, Weather { temperature_c: 21 });
    // Actions are stale immediately by default.
    client.fetch_data(descriptor).await.unwrap();
    assert_eq!(backend.call_count("weather:get"), 2);
    assert_eq!(backend.subscribe_count(), 0);
}

#[tokio::test]
async fn test_action_stale_time_serves_from_cache() {
    let config = BridgeConfig::default().with_action_stale_time(Duration::from_secs(60));
    let (backend, client, bridge) = connected(config, fixtures::no_retry_client());
    backend.respond("weather:get", Ok(json!({"temperature_c": 21})));
    let descriptor = bridge
        .action_query(&get_weather(), CityArgs { city: "Oslo".to_string() })
        .unwrap();

    client.fetch_data(descriptor.clone()).await.unwrap();
    client.fetch_data(descriptor).await.unwrap();
    assert_eq!(backend.call_count("weather:get"), 1);
}

#[tokio::test]
async fn test_action_query_error_is_passed_through() {
    let (backend, client, bridge) = setup();
    let rejection = BackendError::with_data("city unknown", json!({"city": "Atlantis"}));
    backend.respond("weather:get", Err(rejection.clone()));
    let descriptor = bridge
        .action_query(&get_weather(), CityArgs { city: "Atlantis".to_string() })
        .unwrap();

    let err = client.fetch_data(descriptor).await.unwrap_err();
    assert_eq!(err, FetchError::Invocation(InvocationError::Backend(rejection)));
}

#[tokio::test]
async fn test_action_handle_calls_backend_each_time() {
    let (backend, _, bridge) = setup();
    backend.respond("weather:get", Ok(json!({"temperature_c": 3})));
    let action = bridge.action(&get_weather());
    let args = CityArgs {
        city: "Tromso".to_string(),
    };
    assert_eq!(action.call(&args).await.unwrap(), Weather { temperature_c: 3 });
    assert_eq!(action.call(&args).await.unwrap(), Weather { temperature_c: 3 });
    assert_eq!(backend.call_count("weather:get"), 2);
    assert_eq!(
        backend.calls()[0].args,
        Args::from_value(json!({"city": "Tromso"})).unwrap()
    );
}

// ============================================================================
// MUTATIONS
// ============================================================================

#[tokio::test]
async fn test_mutation_returns_decoded_result() {
    let (backend, _, bridge) = setup();
    backend.respond("repos:star", Ok(json!(12)));
    let star = bridge.mutation(&star_repo());
    assert_eq!(star.call(&repo_args("a/b")).await.unwrap(), 12);
    assert_eq!(backend.call_count("repos:star"), 1);
}

#[tokio::test]
async fn test_mutation_decode_failure() {
    let (backend, _, bridge) = setup();
    backend.respond("repos:star", Ok(json!("twelve")));
    let err = bridge
        .mutation(&star_repo())
        .call(&repo_args("a/b"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Invocation(InvocationError::Decode { .. })
    ));
}

#[tokio::test]
async fn test_mutation_through_cache_runner() {
    let (backend, client, bridge) = setup();
    let rejection = BackendError::new("not allowed");
    backend.respond_once("repos:star", Err(rejection.clone()));
    backend.respond("repos:star", Ok(json!(1)));

    let runner = client.mutation(bridge.mutation(&star_repo()).into_options());
    let err = runner.mutate(json!({"repo": "a/b"})).await.unwrap_err();
    assert_eq!(err, FetchError::Invocation(InvocationError::Backend(rejection)));

    let value = runner.mutate(json!({"repo": "a/b"})).await.unwrap();
    assert_eq!(value, json!(1));
    assert_eq!(runner.state().submit_count, 2);
}

#[tokio::test]
async fn test_mutation_with_non_record_arguments_fails_fast() {
    let (backend, _, bridge) = setup();
    let echo: MutationRef<Vec<u32>, Value> = MutationRef::parse("debug:echo").unwrap();
    let err = bridge.mutation(&echo).call(&vec![1, 2]).await.unwrap_err();
    assert!(matches!(err, BridgeError::ArgumentShape(_)));
    assert!(backend.calls().is_empty());
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: a descriptor is enabled exactly when its arguments are not Skip.
    #[test]
    fn prop_enabled_iff_not_skip(
        function in generators::arb_function_name(),
        args in generators::arb_skippable_args(),
    ) {
        let (_, _, bridge) = setup();
        let skipped = args.is_skip();

        let query: QueryRef<Value, Value> = QueryRef::new(function.clone());
        let reactive = bridge.reactive_query_skippable(&query, args.clone()).unwrap();
        prop_assert_eq!(reactive.is_enabled(), !skipped);
        prop_assert_eq!(reactive.bridge_key().is_skipped(), skipped);

        let action: ActionRef<Value, Value> = ActionRef::new(function);
        let action = bridge.action_query_skippable(&action, args).unwrap();
        prop_assert_eq!(action.is_enabled(), !skipped);
        prop_assert_eq!(action.into_resolvable().is_none(), skipped);
    }

    /// Property: reactive and action descriptors for the same call never share a hash.
    #[test]
    fn prop_kinds_never_share_hash(
        function in generators::arb_function_name(),
        args in generators::arb_args(),
    ) {
        let (_, _, bridge) = setup();
        let query: QueryRef<Value, Value> = QueryRef::new(function.clone());
        let action: ActionRef<Value, Value> = ActionRef::new(function);
        let reactive = bridge.reactive_query(&query, args.clone().into_value()).unwrap();
        let one_shot = bridge.action_query(&action, args.into_value()).unwrap();
        prop_assert_ne!(reactive.query_hash(), one_shot.query_hash());
    }
}

#[test]
fn test_function_name_spellings_share_cache_entry() {
    let (_, _, bridge) = setup();
    let plain: QueryRef<RepoArgs, Repo> = QueryRef::parse("repos:get").unwrap();
    let with_ext: QueryRef<RepoArgs, Repo> = QueryRef::parse("repos.ts:get").unwrap();
    assert_eq!(plain.name(), &FunctionName::parse("repos.js:get").unwrap());

    let a = bridge.reactive_query(&plain, repo_args("a/b")).unwrap();
    let b = bridge.reactive_query(&with_ext, repo_args("a/b")).unwrap();
    assert_eq!(a.query_hash(), b.query_hash());
}
