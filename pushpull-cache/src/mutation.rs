//! Mutation observers.
//!
//! Mutations are never cached or deduplicated: every `mutate` call runs the
//! mutation function once.

use chrono::{DateTime, Utc};
use pushpull_core::{FetchError, Value};
use tokio::sync::watch;

use crate::options::MutationOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Pending,
    Success,
    Error,
}

/// State of the most recent mutation run.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationState {
    pub status: MutationStatus,
    pub variables: Option<Value>,
    pub data: Option<Value>,
    pub error: Option<FetchError>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// Total `mutate` calls since creation or the last reset.
    pub submit_count: u64,
}

impl Default for MutationState {
    fn default() -> Self {
        Self {
            status: MutationStatus::Idle,
            variables: None,
            data: None,
            error: None,
            submitted_at: None,
            submit_count: 0,
        }
    }
}

/// Runs a mutation function and tracks its latest state.
pub struct MutationObserver {
    options: MutationOptions,
    state_tx: watch::Sender<MutationState>,
}

impl MutationObserver {
    pub fn new(options: MutationOptions) -> Self {
        let (state_tx, _) = watch::channel(MutationState::default());
        Self { options, state_tx }
    }

    /// Run the mutation once with `variables`.
    pub async fn mutate(&self, variables: Value) -> Result<Value, FetchError> {
        self.state_tx.send_modify(|state| {
            state.status = MutationStatus::Pending;
            state.variables = Some(variables.clone());
            state.error = None;
            state.submitted_at = Some(Utc::now());
            state.submit_count += 1;
        });

        let result = (self.options.mutation_fn)(variables).await;

        self.state_tx.send_modify(|state| match &result {
            Ok(data) => {
                state.status = MutationStatus::Success;
                state.data = Some(data.clone());
            }
            Err(error) => {
                state.status = MutationStatus::Error;
                state.error = Some(error.clone());
            }
        });
        result
    }

    pub fn state(&self) -> MutationState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MutationState> {
        self.state_tx.subscribe()
    }

    pub fn reset(&self) {
        self.state_tx.send_replace(MutationState::default());
    }
}

impl std::fmt::Debug for MutationObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationObserver")
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}
