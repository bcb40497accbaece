//! Locking primitives used by the virtual-memory subsystem.
//!
//! Lock hierarchy, outermost first:
//!
//! 1. the frame table's clock lock, held only for the non-blocking victim scan;
//! 2. frame pins ([`FrameLock`]), only ever acquired *blocking* while no other
//!    lock is held. A waiter gives the CPU back through [`Scheduler`];
//! 3. leaf [`Mutex`]es (address-space registry, supplemental page table,
//!    page descriptor state, page directory, swap bitmap, swap device), held
//!    for bounded metadata work and never while acquiring a pin.

pub mod frame_lock;
pub mod mutex;
pub mod scheduler;

pub use frame_lock::FrameLock;
pub use mutex::{Mutex, MutexGuard};
pub use scheduler::Scheduler;
#[cfg(not(target_os = "none"))]
pub use scheduler::ThreadYield;
