//! Thread registry: creation, status tracking, GC root scanning and teardown

use crate::config::ThreadConfig;
use crate::kernel::{Kernel, KernelThreadId, SpawnRequest};
use crate::stack::{RootScanner, StackPool, StackRegion};
use crate::{Result, ThreadError};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

/// Lifecycle of a registered thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Created but not yet running interpreter code
    Created = 0,
    /// Running; its stack holds live roots
    Ready = 1,
    Finished = 2,
}

impl ThreadStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ThreadStatus::Created,
            1 => ThreadStatus::Ready,
            _ => ThreadStatus::Finished,
        }
    }
}

#[derive(Debug, Clone)]
struct SharedStatus(Arc<AtomicU8>);

impl SharedStatus {
    fn new(status: ThreadStatus) -> Self {
        Self(Arc::new(AtomicU8::new(status as u8)))
    }

    fn get(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, status: ThreadStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

struct ThreadNode {
    id: KernelThreadId,
    name: String,
    status: SharedStatus,
    alive: AtomicBool,
    /// `None` for the main thread, which does not use the pool
    slot: Option<usize>,
    /// Opaque argument word, always treated as a root
    arg: usize,
    stack: Option<StackRegion>,
}

/// What a new thread's entry function receives
pub struct ThreadContext {
    name: String,
    status: SharedStatus,
    arg: usize,
    stack: StackRegion,
}

impl ThreadContext {
    /// Mark this thread ready; from now on GC scans its stack
    pub fn start(&self) {
        self.status.set(ThreadStatus::Ready);
    }

    /// Mark this thread finished ahead of returning from the entry function
    pub fn finish(&self) {
        self.status.set(ThreadStatus::Finished);
    }

    pub fn arg(&self) -> usize {
        self.arg
    }

    /// The thread's stack region, scanned conservatively while it is ready
    pub fn stack(&self) -> &StackRegion {
        &self.stack
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// Marks the thread finished however the entry function exits.
struct FinishGuard(SharedStatus);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.set(ThreadStatus::Finished);
    }
}

/// Returned by thread creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadHandle {
    pub id: KernelThreadId,
    pub name: String,
    /// Usable stack size in bytes, after the safety margin
    pub stack_size: usize,
}

struct Registry {
    threads: Vec<Arc<ThreadNode>>,
    pool: StackPool,
    counter: u32,
}

/// Thread port over a [`Kernel`]
pub struct ThreadPort<K: Kernel> {
    kernel: Arc<K>,
    config: ThreadConfig,
    registry: Mutex<Registry>,
    initialized: AtomicBool,
}

impl<K: Kernel> ThreadPort<K> {
    /// Initialize threading and register the calling thread as the main thread
    ///
    /// `main_stack` is scanned when another thread runs a collection.
    pub fn init(kernel: Arc<K>, config: ThreadConfig, main_stack: Option<StackRegion>) -> Result<Self> {
        config.validate()?;

        let main = ThreadNode {
            id: kernel.current(),
            name: "main".to_string(),
            status: SharedStatus::new(ThreadStatus::Ready),
            alive: AtomicBool::new(true),
            slot: None,
            arg: 0,
            stack: main_stack,
        };

        let registry = Registry {
            threads: vec![Arc::new(main)],
            pool: StackPool::new(config.max_threads, config.default_stack_size),
            counter: 0,
        };

        info!(
            "Threading initialized ({} slots of {} bytes)",
            config.max_threads, config.default_stack_size
        );

        Ok(Self {
            kernel,
            config,
            registry: Mutex::new(registry),
            initialized: AtomicBool::new(true),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ThreadError::NotInitialized)
        }
    }

    /// Create a thread with the default name and priority
    pub fn create_thread<F>(&self, entry: F, arg: usize, stack_size: usize) -> Result<ThreadHandle>
    where
        F: FnOnce(ThreadContext) + Send + 'static,
    {
        let name = format!("thread-{}", self.lock().counter);
        self.create_thread_ex(entry, arg, stack_size, self.config.priority, &name)
    }

    /// Create a thread on the first free stack slot
    ///
    /// Fails with [`ThreadError::MaxThreads`] when every slot is taken by a
    /// thread that is still running or has not been reaped yet.
    pub fn create_thread_ex<F>(
        &self,
        entry: F,
        arg: usize,
        stack_size: usize,
        priority: i32,
        name: &str,
    ) -> Result<ThreadHandle>
    where
        F: FnOnce(ThreadContext) + Send + 'static,
    {
        self.ensure_initialized()?;

        let requested = self.config.normalize_stack_size(stack_size);

        let mut registry = self.lock();
        self.reap(&mut registry);

        let (slot, stack) = registry.pool.acquire().ok_or(ThreadError::MaxThreads)?;
        let slot_bytes = registry.pool.slot_bytes();
        if requested > slot_bytes {
            debug!(
                "Requested stack of {} bytes exceeds slot size, using {}",
                requested, slot_bytes
            );
        }

        let status = SharedStatus::new(ThreadStatus::Created);
        let context = ThreadContext {
            name: name.to_string(),
            status: status.clone(),
            arg,
            stack: stack.clone(),
        };
        let guard_status = status.clone();
        let body = Box::new(move || {
            let _finish = FinishGuard(guard_status);
            entry(context);
        });

        let request = SpawnRequest {
            name,
            stack_size: slot_bytes,
            priority,
        };
        let id = match self.kernel.spawn(request, body) {
            Ok(id) => id,
            Err(e) => {
                registry.pool.release(slot);
                return Err(e);
            }
        };

        // Fully built before it becomes visible to collections.
        let node = ThreadNode {
            id,
            name: name.to_string(),
            status,
            alive: AtomicBool::new(false),
            slot: Some(slot),
            arg,
            stack: Some(stack),
        };
        registry.threads.push(Arc::new(node));
        registry.counter += 1;

        debug!("Created thread {} ({:?}) on slot {}", name, id, slot);

        Ok(ThreadHandle {
            id,
            name: name.to_string(),
            stack_size: slot_bytes.saturating_sub(self.config.stack_margin),
        })
    }

    /// Mark the calling thread ready
    pub fn thread_start(&self) {
        self.set_current_status(ThreadStatus::Ready);
    }

    /// Mark the calling thread finished
    pub fn thread_finish(&self) {
        self.set_current_status(ThreadStatus::Finished);
    }

    fn set_current_status(&self, status: ThreadStatus) {
        let current = self.kernel.current();
        let registry = self.lock();
        if let Some(node) = registry.threads.iter().find(|n| n.id == current) {
            trace!("Thread {} -> {:?}", node.name, status);
            node.status.set(status);
        }
    }

    /// Status of a registered thread, `None` once it has been reaped
    pub fn status(&self, id: KernelThreadId) -> Option<ThreadStatus> {
        self.lock()
            .threads
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.status.get())
    }

    pub fn current_id(&self) -> KernelThreadId {
        self.kernel.current()
    }

    /// Registered threads, main thread included
    pub fn thread_count(&self) -> usize {
        self.lock().threads.len()
    }

    /// Stack slots currently held by user threads
    pub fn slots_in_use(&self) -> usize {
        self.lock().pool.in_use()
    }

    /// Drop finished threads the kernel no longer reports, freeing their slots
    fn reap(&self, registry: &mut Registry) {
        for node in &registry.threads {
            node.alive.store(false, Ordering::Relaxed);
        }
        let threads = &registry.threads;
        self.kernel.for_each_alive(&mut |id| {
            if let Some(node) = threads.iter().find(|n| n.id == id) {
                node.alive.store(true, Ordering::Relaxed);
            }
        });

        let current = self.kernel.current();
        let Registry {
            threads,
            pool,
            counter,
        } = registry;
        threads.retain(|node| {
            // The calling thread is alive by definition.
            let alive = node.id == current || node.alive.load(Ordering::Relaxed);
            if node.status.get() == ThreadStatus::Finished && !alive {
                if let Some(slot) = node.slot {
                    pool.release(slot);
                }
                *counter = counter.saturating_sub(1);
                debug!("Collected thread {}", node.name);
                false
            } else {
                true
            }
        });
    }

    /// Reap finished threads and report the roots held by the others
    ///
    /// Every registered thread's argument word is scanned. Stacks are scanned
    /// in full, except the calling thread's own (its caller scans that) and
    /// those of threads that have not reached [`ThreadStatus::Ready`].
    pub fn gc_others(&self, scanner: &mut dyn RootScanner) {
        if !self.initialized.load(Ordering::Acquire) {
            return;
        }

        let mut registry = self.lock();
        self.reap(&mut registry);

        let current = self.kernel.current();
        trace!("GC: scanning {} threads", registry.threads.len());

        for node in &registry.threads {
            scanner.scan_word(node.arg);

            if node.id == current || node.status.get() != ThreadStatus::Ready {
                continue;
            }

            if let Some(stack) = &node.stack {
                scanner.scan_region(stack);
            }
        }
    }

    /// Abort every other unfinished thread and refuse further creation
    pub fn deinit(&self) {
        let current = self.kernel.current();
        let registry = self.lock();

        for node in &registry.threads {
            if node.id != current && node.status.get() != ThreadStatus::Finished {
                node.status.set(ThreadStatus::Finished);
                if !self.kernel.abort(node.id) {
                    warn!("Thread {} could not be aborted", node.name);
                }
            }
        }

        self.initialized.store(false, Ordering::Release);
        info!("Threading deinitialized");
    }

    pub fn kernel(&self) -> &Arc<K> {
        &self.kernel
    }

    pub fn config(&self) -> &ThreadConfig {
        &self.config
    }
}
