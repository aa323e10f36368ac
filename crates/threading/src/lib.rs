//! Threading and synchronization shim
//!
//! Maps an interpreter-style threading API (create thread, mark started and
//! finished, scan other threads' roots for the garbage collector, thread-local
//! state, binary-semaphore mutex) onto a preemptive kernel reached through the
//! [`Kernel`] trait. [`StdKernel`] backs it with `std::thread`.
//!
//! Threads run on stack regions taken from a pool pre-allocated at
//! [`ThreadPort::init`]; when the pool is exhausted, thread creation fails with
//! [`ThreadError::MaxThreads`].

pub mod config;
pub mod error;
pub mod kernel;
pub mod mutex;
pub mod port;
pub mod stack;
pub mod state;

pub use config::ThreadConfig;
pub use error::{Result, ThreadError};
pub use kernel::{Kernel, KernelThreadId, SpawnRequest, StdKernel};
pub use mutex::{Gil, ThreadMutex};
pub use port::{ThreadContext, ThreadHandle, ThreadPort, ThreadStatus};
pub use stack::{RootScanner, StackPool, StackRegion};
