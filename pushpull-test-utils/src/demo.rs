//! A tiny reactive backend kept entirely in memory.
//!
//! Queries are re-evaluated after every mutation and subscribers receive the
//! new result only when it differs from what they last saw.
//!
//! | function          | kind     | arguments                        |
//! |-------------------|----------|----------------------------------|
//! | `messages:list`   | query    | `{channel?}`                     |
//! | `messages:count`  | query    | `{channel?}`                     |
//! | `messages:send`   | mutation | `{channel?, author, body}`       |
//! | `repos:get`       | query    | `{repo}`                         |
//! | `repos:star`      | mutation | `{repo}`                         |
//! | `weather:get`     | action   | `{city}`                         |

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::{Args, Backend, BackendError, BackendSubscription, FunctionName, SubscriptionError};
use crate::{SubscriptionUpdate, UpdateListener, Value};

const DEFAULT_CHANNEL: &str = "general";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub channel: String,
    pub author: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
struct ChannelArgs {
    channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendArgs {
    channel: Option<String>,
    author: String,
    body: String,
}

#[derive(Debug, Deserialize)]
struct RepoArgs {
    repo: String,
}

#[derive(Debug, Deserialize)]
struct CityArgs {
    city: String,
}

struct DemoSubscription {
    id: u64,
    function: FunctionName,
    args: Args,
    listener: UpdateListener,
    last_sent: Value,
}

#[derive(Default)]
struct DemoState {
    next_subscription: u64,
    next_message: u64,
    messages: Vec<Message>,
    stars: BTreeMap<String, u64>,
    subscriptions: Vec<DemoSubscription>,
    actions_run: usize,
}

fn parse_args<T: serde::de::DeserializeOwned>(function: &FunctionName, args: &Args) -> Result<T, BackendError> {
    args.parse()
        .map_err(|e| BackendError::new(format!("Invalid arguments for {function}: {e}")))
}

impl DemoState {
    fn evaluate(&self, function: &FunctionName, args: &Args) -> Result<Value, BackendError> {
        match function.as_str() {
            "messages:list" => {
                let ChannelArgs { channel } = parse_args(function, args)?;
                let listed: Vec<&Message> = self
                    .messages
                    .iter()
                    .filter(|m| channel.as_deref().map_or(true, |c| m.channel == c))
                    .collect();
                serde_json::to_value(listed).map_err(|e| BackendError::new(e.to_string()))
            }
            "messages:count" => {
                let ChannelArgs { channel } = parse_args(function, args)?;
                let count = self
                    .messages
                    .iter()
                    .filter(|m| channel.as_deref().map_or(true, |c| m.channel == c))
                    .count();
                Ok(json!(count))
            }
            "repos:get" => {
                let RepoArgs { repo } = parse_args(function, args)?;
                let stars = self.stars.get(&repo).copied().unwrap_or(0);
                Ok(json!({ "repo": repo, "stars": stars }))
            }
            other => Err(BackendError::new(format!("Unknown query {other}"))),
        }
    }

    fn write(&mut self, function: &FunctionName, args: &Args) -> Result<Value, BackendError> {
        match function.as_str() {
            "messages:send" => {
                let SendArgs {
                    channel,
                    author,
                    body,
                } = parse_args(function, args)?;
                if body.trim().is_empty() {
                    return Err(BackendError::with_data(
                        "Message body must not be empty",
                        json!({ "field": "body" }),
                    ));
                }
                self.next_message += 1;
                let message = Message {
                    id: self.next_message,
                    channel: channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
                    author,
                    body,
                };
                let id = message.id;
                self.messages.push(message);
                Ok(json!(id))
            }
            "repos:star" => {
                let RepoArgs { repo } = parse_args(function, args)?;
                let stars = self.stars.entry(repo).or_insert(0);
                *stars += 1;
                Ok(json!(*stars))
            }
            other => Err(BackendError::new(format!("Unknown mutation {other}"))),
        }
    }

    /// Re-run every subscribed query and collect the results that changed.
    fn changed_results(&mut self) -> Vec<(UpdateListener, Value)> {
        let mut changed = Vec::new();
        for index in 0..self.subscriptions.len() {
            let (function, args) = {
                let sub = &self.subscriptions[index];
                (sub.function.clone(), sub.args.clone())
            };
            let Ok(value) = self.evaluate(&function, &args) else {
                continue;
            };
            let sub = &mut self.subscriptions[index];
            if sub.last_sent != value {
                sub.last_sent = value.clone();
                changed.push((sub.listener.clone(), value));
            }
        }
        changed
    }
}

/// In-memory chat and repository backend with live queries.
#[derive(Default)]
pub struct DemoBackend {
    state: Arc<Mutex<DemoState>>,
    /// Serializes deliveries so each subscriber sees results in write order.
    delivery: Mutex<()>,
}

impl DemoBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Backend with some repositories already starred.
    pub fn with_stars(stars: impl IntoIterator<Item = (String, u64)>) -> Arc<Self> {
        let backend = Self::default();
        backend.lock().stars.extend(stars);
        Arc::new(backend)
    }

    fn lock(&self) -> MutexGuard<'_, DemoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliveries(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open_subscriptions(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn actions_run(&self) -> usize {
        self.lock().actions_run
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }
}

#[async_trait]
impl Backend for DemoBackend {
    fn subscribe(
        &self,
        function: &FunctionName,
        args: &Args,
        listener: UpdateListener,
    ) -> Result<BackendSubscription, SubscriptionError> {
        let _delivering = self.deliveries();
        let (id, initial) = {
            let mut state = self.lock();
            let initial = state
                .evaluate(function, args)
                .map_err(|source| SubscriptionError::OpenFailed {
                    function: function.to_string(),
                    source,
                })?;
            state.next_subscription += 1;
            let id = state.next_subscription;
            state.subscriptions.push(DemoSubscription {
                id,
                function: function.clone(),
                args: args.clone(),
                listener: listener.clone(),
                last_sent: initial.clone(),
            });
            (id, initial)
        };
        debug!(function = %function, subscription = id, "Demo subscription opened");
        listener(SubscriptionUpdate::Value(initial));

        let weak: Weak<Mutex<DemoState>> = Arc::downgrade(&self.state);
        Ok(BackendSubscription::new(move || {
            if let Some(state) = weak.upgrade() {
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .subscriptions
                    .retain(|sub| sub.id != id);
                debug!(subscription = id, "Demo subscription closed");
            }
        }))
    }

    async fn invoke_once(&self, function: &FunctionName, args: &Args) -> Result<Value, BackendError> {
        match function.as_str() {
            "weather:get" => {
                let CityArgs { city } = parse_args(function, args)?;
                self.lock().actions_run += 1;
                let temperature = city.bytes().map(u64::from).sum::<u64>() % 35;
                Ok(json!({ "city": city, "temperature_c": temperature }))
            }
            other => Err(BackendError::new(format!("Unknown action {other}"))),
        }
    }

    async fn invoke_write(&self, function: &FunctionName, args: &Args) -> Result<Value, BackendError> {
        let _delivering = self.deliveries();
        let (result, changed) = {
            let mut state = self.lock();
            let result = state.write(function, args)?;
            (result, state.changed_results())
        };
        debug!(function = %function, pushes = changed.len(), "Demo mutation applied");
        for (listener, value) in changed {
            listener(SubscriptionUpdate::Value(value));
        }
        Ok(result)
    }
}
