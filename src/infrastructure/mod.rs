pub mod bluetooth;
pub mod logging;
pub mod stack;
pub mod transport;
pub mod wiimote;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a callback panicked while
/// holding it. State behind these locks stays consistent between statements,
/// so continuing is preferable to wedging the stack.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
