//! Synchronization primitives for the protocol stack.
//!
//! This module wraps the `std` primitives the stack actually needs —
//! a mutex and a counting semaphore — behind the same shape the rest of
//! the codebase expects, so call sites read the same whether the lock is
//! a spinlock (as in a bare-metal build) or an OS mutex (here).

pub mod mutex;
pub mod semaphore;

pub use mutex::Mutex;
pub use semaphore::Semaphore;
