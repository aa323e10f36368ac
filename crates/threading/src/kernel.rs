//! Kernel seam
//!
//! The few preemptive-kernel primitives the thread port needs. A port to a
//! real RTOS implements [`Kernel`] over its native thread API; [`StdKernel`]
//! runs threads on `std::thread` for hosted builds and tests.

use crate::{Result, ThreadError};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{trace, warn};

/// Kernel-assigned thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelThreadId(pub u64);

/// Parameters for a kernel thread
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub name: &'a str,
    /// Size of the stack region reserved for the thread, in bytes
    pub stack_size: usize,
    pub priority: i32,
}

pub trait Kernel: Send + Sync + 'static {
    /// Start a thread running `entry`
    fn spawn(
        &self,
        request: SpawnRequest<'_>,
        entry: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<KernelThreadId>;

    /// Identifier of the calling thread
    fn current(&self) -> KernelThreadId;

    /// Call `f` for every thread the kernel still knows about
    fn for_each_alive(&self, f: &mut dyn FnMut(KernelThreadId));

    /// Terminate a thread; returns `false` when the kernel cannot
    fn abort(&self, id: KernelThreadId) -> bool;

    fn yield_now(&self);
}

// Process-wide so identifiers stay unique across kernel instances.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_ID: Cell<Option<KernelThreadId>> = const { Cell::new(None) };
}

fn allocate_id() -> KernelThreadId {
    KernelThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
}

/// `std::thread` backed kernel
///
/// Threads that were not spawned through this kernel (such as the main
/// thread) get an identifier the first time they ask for one.
pub struct StdKernel {
    threads: Mutex<HashMap<KernelThreadId, JoinHandle<()>>>,
}

impl StdKernel {
    /// OS threads need far more stack than an interpreter stack slot provides
    pub const MIN_HOST_STACK: usize = 256 * 1024;

    pub fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Number of spawned threads whose OS thread has not exited yet
    pub fn running(&self) -> usize {
        let threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads.values().filter(|h| !h.is_finished()).count()
    }
}

impl Default for StdKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for StdKernel {
    fn spawn(
        &self,
        request: SpawnRequest<'_>,
        entry: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<KernelThreadId> {
        let id = allocate_id();

        let handle = std::thread::Builder::new()
            .name(request.name.to_string())
            .stack_size(request.stack_size.max(Self::MIN_HOST_STACK))
            .spawn(move || {
                CURRENT_ID.with(|current| current.set(Some(id)));
                entry();
            })
            .map_err(|e| ThreadError::Spawn(e.to_string()))?;

        trace!("Spawned {} as {:?}", request.name, id);

        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handle);
        Ok(id)
    }

    fn current(&self) -> KernelThreadId {
        CURRENT_ID.with(|current| match current.get() {
            Some(id) => id,
            None => {
                let id = allocate_id();
                current.set(Some(id));
                id
            }
        })
    }

    fn for_each_alive(&self, f: &mut dyn FnMut(KernelThreadId)) {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());

        // Exited threads are joined here so their handles do not pile up.
        let exited: Vec<KernelThreadId> = threads
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in exited {
            if let Some(handle) = threads.remove(&id)
                && handle.join().is_err()
            {
                warn!("Thread {:?} exited with a panic", id);
            }
        }

        for id in threads.keys() {
            f(*id);
        }
    }

    fn abort(&self, id: KernelThreadId) -> bool {
        // std threads cannot be killed; the handle is dropped, detaching the thread.
        let removed = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if removed.is_some() {
            warn!("Cannot abort {:?} on the std kernel, detaching it", id);
        }
        false
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}
