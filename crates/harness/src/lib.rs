mod desk;
mod instrumented;
mod memory;
mod office;

pub use desk::{DSCR, TestDesk, caller, user};
pub use instrumented::{Failure, InstrumentedStore};
pub use memory::MemoryStore;
pub use office::TestOffice;

use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
