//! Per-entry query state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use pushpull_core::{FetchError, Value};

use crate::options::StaleTime;

/// Whether an entry has resolved yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// No data and no error yet.
    Pending,
    Success,
    Error,
}

/// Whether a query function is currently running for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    Fetching,
}

/// Snapshot of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub data: Option<Value>,
    pub error: Option<FetchError>,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub data_updated_at: Option<DateTime<Utc>>,
    pub error_updated_at: Option<DateTime<Utc>>,
    /// Incremented on every data write, fetched or pushed.
    pub data_update_count: u64,
    pub error_update_count: u64,
    /// Consecutive failed fetch attempts, reset on success.
    pub fetch_failure_count: u32,
    /// Set by invalidation; forces the next observer or fetch to refetch.
    pub is_invalidated: bool,
}

impl QueryState {
    pub fn pending() -> Self {
        Self {
            data: None,
            error: None,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            data_updated_at: None,
            error_updated_at: None,
            data_update_count: 0,
            error_update_count: 0,
            fetch_failure_count: 0,
            is_invalidated: false,
        }
    }

    /// State seeded with initial data.
    pub fn with_data(data: Value) -> Self {
        let mut state = Self::pending();
        state.write_data(data);
        state
    }

    /// Replace the value and clear any error.
    pub(crate) fn write_data(&mut self, data: Value) {
        self.data = Some(data);
        self.error = None;
        self.status = QueryStatus::Success;
        self.data_updated_at = Some(Utc::now());
        self.data_update_count += 1;
        self.fetch_failure_count = 0;
        self.is_invalidated = false;
    }

    pub(crate) fn write_error(&mut self, error: FetchError) {
        self.error = Some(error);
        self.status = QueryStatus::Error;
        self.error_updated_at = Some(Utc::now());
        self.error_update_count += 1;
        self.fetch_status = FetchStatus::Idle;
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// Whether a fetch should run for this entry under `stale_time`.
    pub fn is_stale(&self, stale_time: StaleTime) -> bool {
        if self.is_invalidated {
            return true;
        }
        match (&self.data, self.data_updated_at) {
            (Some(_), Some(updated_at)) => {
                let age = Utc::now()
                    .signed_duration_since(updated_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                stale_time.is_stale(age)
            }
            _ => true,
        }
    }
}

impl Default for QueryState {
    fn default() -> Self {
        Self::pending()
    }
}
