pub mod aggregator;
pub mod config;
pub mod context;
pub mod dashboard;
pub mod evaluator;
pub mod events;
pub mod logstats;
pub mod monitor;
pub mod node_client;
pub mod prom_metrics;
pub mod registry;
pub mod scheduler;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering from poisoning.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
