pub mod spinlock;
pub mod semaphore;

pub use spinlock::{SpinGuard, Spinlock};
