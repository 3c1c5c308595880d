pub mod builder;
pub mod display;
pub mod executor;
pub mod handle;
pub mod root;
pub mod strategy;
pub mod tracker;
pub mod types;
pub mod variants;

mod unit;

#[cfg(test)]
mod tests;

pub use builder::*;
pub use display::*;
pub use executor::*;
pub use handle::*;
pub use root::*;
pub use strategy::*;
pub use tracker::*;
pub use types::*;
pub use variants::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a panicking body poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
