//! Synchronization primitives the scheduling core is built on.

mod atomic_time;
pub mod wait_event;

pub(crate) use atomic_time::AtomicTime;
pub use wait_event::WaitEvent;
