//! Thread Port Integration Tests
//!
//! # Test Scenarios
//! - Slot exhaustion and reuse after reaping
//! - GC root scanning rules (arguments, ready stacks, own stack, created threads)
//! - Teardown
//!
//! Run with: `cargo test -p threading --test thread_port_tests`

use common::logging::init_test_logging;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, wait_until};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use threading::{
    Kernel, KernelThreadId, SpawnRequest, StackRegion, StdKernel, ThreadConfig, ThreadError,
    ThreadPort, ThreadStatus,
};

fn std_port(max_threads: usize) -> ThreadPort<StdKernel> {
    init_test_logging();
    let config = ThreadConfig {
        max_threads,
        ..ThreadConfig::default()
    };
    ThreadPort::init(Arc::new(StdKernel::new()), config, None).unwrap()
}

fn collect_roots<K: Kernel>(port: &ThreadPort<K>) -> Vec<usize> {
    let mut roots = Vec::new();
    let mut scanner = |w: usize| roots.push(w);
    port.gc_others(&mut scanner);
    roots
}

/// Kernel that records entries without running them until asked
#[derive(Default)]
struct ManualKernel {
    next: AtomicU64,
    pending: Mutex<HashMap<KernelThreadId, Box<dyn FnOnce() + Send>>>,
}

impl ManualKernel {
    fn run(&self, id: KernelThreadId) {
        let entry = self.pending.lock().unwrap().remove(&id);
        if let Some(entry) = entry {
            entry();
        }
    }
}

impl Kernel for ManualKernel {
    fn spawn(
        &self,
        _request: SpawnRequest<'_>,
        entry: Box<dyn FnOnce() + Send + 'static>,
    ) -> threading::Result<KernelThreadId> {
        let id = KernelThreadId(1000 + self.next.fetch_add(1, Ordering::SeqCst));
        self.pending.lock().unwrap().insert(id, entry);
        Ok(id)
    }

    fn current(&self) -> KernelThreadId {
        KernelThreadId(0)
    }

    fn for_each_alive(&self, f: &mut dyn FnMut(KernelThreadId)) {
        let ids: Vec<_> = self.pending.lock().unwrap().keys().copied().collect();
        for id in ids {
            f(id);
        }
    }

    fn abort(&self, id: KernelThreadId) -> bool {
        self.pending.lock().unwrap().remove(&id).is_some()
    }

    fn yield_now(&self) {}
}

// ============================================================================
// Slot Pool Tests
// ============================================================================

#[test]
fn test_ninth_thread_fails_with_max_threads() {
    let port = std_port(8);
    let (tx, rx) = mpsc::channel::<()>();
    let rx = Arc::new(Mutex::new(rx));

    for _ in 0..8 {
        let rx = Arc::clone(&rx);
        port.create_thread(
            move |ctx| {
                ctx.start();
                let _ = rx.lock().unwrap().recv();
            },
            0,
            0,
        )
        .unwrap();
    }
    assert_eq!(port.slots_in_use(), 8);

    let err = port.create_thread(|_| {}, 0, 0).unwrap_err();
    assert_eq!(err, ThreadError::MaxThreads);
    assert_eq!(err.to_string(), "maximum number of threads reached");

    drop(tx);
}

#[test]
fn test_finished_thread_slot_is_reused() {
    let port = std_port(1);
    let first = port.create_thread(|ctx| ctx.start(), 0, 0).unwrap();

    // The slot frees up once the kernel stops reporting the thread.
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        let _ = collect_roots(&port);
        port.status(first.id).is_none()
    }));
    assert_eq!(port.slots_in_use(), 0);

    let second = port.create_thread(|ctx| ctx.start(), 0, 0);
    assert!(second.is_ok());
}

// ============================================================================
// GC Scanning Tests
// ============================================================================

#[test]
fn test_gc_scans_ready_thread_stack_and_arg() {
    let port = std_port(2);
    let (ready_tx, ready_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    port.create_thread(
        move |ctx| {
            ctx.stack().store(0, 0xDEAD_BEEF);
            ctx.start();
            ready_tx.send(()).unwrap();
            let _ = done_rx.recv();
        },
        0x1234,
        0,
    )
    .unwrap();

    ready_rx.recv().unwrap();
    let roots = collect_roots(&port);
    assert!(roots.contains(&0x1234));
    assert!(roots.contains(&0xDEAD_BEEF));

    drop(done_tx);
}

#[test]
fn test_gc_skips_threads_not_yet_ready() {
    let kernel = Arc::new(ManualKernel::default());
    let port = ThreadPort::init(Arc::clone(&kernel), ThreadConfig::default(), None).unwrap();

    let handle = port
        .create_thread(
            |ctx| {
                ctx.start();
            },
            0x5555,
            0,
        )
        .unwrap();
    assert_eq!(port.status(handle.id), Some(ThreadStatus::Created));

    let roots = collect_roots(&port);
    // Argument scanned, stack skipped entirely.
    assert_eq!(roots.iter().filter(|&&w| w == 0x5555).count(), 1);
    assert_eq!(roots.len(), 2, "main arg plus the new thread's arg");

    kernel.run(handle.id);
    // The entry ran to completion, so the thread is finished and reaped.
    let _ = collect_roots(&port);
    assert_eq!(port.status(handle.id), None);
}

#[test]
fn test_gc_skips_calling_threads_own_stack() {
    let port = Arc::new(std_port(2));
    let (b_ready_tx, b_ready_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    port.create_thread(
        move |ctx| {
            ctx.stack().store(0, 0xB0B0);
            ctx.start();
            b_ready_tx.send(()).unwrap();
            let _ = release_rx.recv();
        },
        0,
        0,
    )
    .unwrap();
    b_ready_rx.recv().unwrap();

    let (roots_tx, roots_rx) = mpsc::channel();
    let scanning_port = Arc::clone(&port);
    port.create_thread(
        move |ctx| {
            ctx.stack().store(0, 0xA0A0);
            ctx.start();
            roots_tx.send(collect_roots(&scanning_port)).unwrap();
        },
        0,
        0,
    )
    .unwrap();

    let roots = roots_rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
    assert!(roots.contains(&0xB0B0));
    assert!(!roots.contains(&0xA0A0));

    drop(release_tx);
}

#[test]
fn test_main_stack_scanned_from_other_thread() {
    let main_stack = StackRegion::with_bytes(64);
    main_stack.store(2, 0xFACE);
    let config = ThreadConfig::default();
    let port = Arc::new(
        ThreadPort::init(Arc::new(StdKernel::new()), config, Some(main_stack)).unwrap(),
    );

    // Scanning from main skips main's own stack.
    assert!(!collect_roots(&port).contains(&0xFACE));

    let (tx, rx) = mpsc::channel();
    let worker_port = Arc::clone(&port);
    port.create_thread(
        move |ctx| {
            ctx.start();
            tx.send(collect_roots(&worker_port)).unwrap();
        },
        0,
        0,
    )
    .unwrap();

    let roots = rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
    assert!(roots.contains(&0xFACE));
}

// ============================================================================
// Status and Teardown Tests
// ============================================================================

#[test]
fn test_thread_start_and_finish_by_lookup() {
    let port = Arc::new(std_port(1));
    let (tx, rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let inner = Arc::clone(&port);

    let handle = port
        .create_thread(
            move |_ctx| {
                inner.thread_start();
                tx.send(()).unwrap();
                let _ = go_rx.recv();
                inner.thread_finish();
                tx.send(()).unwrap();
                let _ = go_rx.recv();
            },
            0,
            0,
        )
        .unwrap();

    rx.recv().unwrap();
    assert_eq!(port.status(handle.id), Some(ThreadStatus::Ready));
    go_tx.send(()).unwrap();
    rx.recv().unwrap();
    assert_eq!(port.status(handle.id), Some(ThreadStatus::Finished));
    drop(go_tx);
}

#[test]
fn test_deinit_marks_other_threads_finished() {
    let kernel = Arc::new(ManualKernel::default());
    let port = ThreadPort::init(Arc::clone(&kernel), ThreadConfig::default(), None).unwrap();
    let a = port.create_thread(|_| {}, 0, 0).unwrap();
    let b = port.create_thread(|_| {}, 0, 0).unwrap();

    port.deinit();

    assert_eq!(port.status(a.id), Some(ThreadStatus::Finished));
    assert_eq!(port.status(b.id), Some(ThreadStatus::Finished));
    assert_eq!(port.status(port.current_id()), Some(ThreadStatus::Ready));
    assert!(kernel.pending.lock().unwrap().is_empty());
}
