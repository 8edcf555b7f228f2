extern crate std;

use self::std::boxed::Box;
use self::std::cell::Cell;
use self::std::sync::atomic::AtomicBool;
use self::std::sync::{Mutex as StdMutex, MutexGuard, OnceLock};
use self::std::thread;
use self::std::vec::Vec;

use super::*;
use kernel_config::memory::PAGE_SIZE;
use memory_structs::VirtualAddress;

std::thread_local! {
    static CURRENT_CPU: Cell<u32> = const { Cell::new(0) };
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
    static USER_PROCESS: Cell<Option<u32>> = const { Cell::new(None) };
}

static IPI_PENDING: [AtomicBool; 4] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];

struct FlushLog {
    entries: StdMutex<Vec<(u32, usize, usize)>>,
}

impl FlushLog {
    fn record(&self, range: PageRange) {
        let cpu = CURRENT_CPU.with(|current| current.get());
        self.entries.lock().unwrap().push((
            cpu,
            range.start_address().value(),
            range.size_in_bytes(),
        ));
    }

    fn take(&self) -> Vec<(u32, usize, usize)> {
        core::mem::take(&mut *self.entries.lock().unwrap())
    }
}

struct TestExecutors;

impl ExecutorOps for TestExecutors {
    fn current(&self) -> CpuId {
        cpu::register_cpu(CURRENT_CPU.with(|current| current.get()))
    }

    fn interrupts_enabled(&self) -> bool {
        INTERRUPTS_ENABLED.with(|flag| flag.get())
    }

    fn disable_interrupts(&self) -> bool {
        INTERRUPTS_ENABLED.with(|flag| flag.replace(false))
    }

    fn restore_interrupts(&self, was_enabled: bool) {
        INTERRUPTS_ENABLED.with(|flag| flag.set(was_enabled));
    }

    fn send_flush_ipi(&self, target: CpuId) {
        IPI_PENDING[target.value() as usize].store(true, core::sync::atomic::Ordering::SeqCst);
    }

    fn current_user_process(&self) -> Option<ProcessId> {
        USER_PROCESS.with(|process| process.get()).map(ProcessId)
    }
}

struct TestFlush;

impl FlushOps for TestFlush {
    fn flush_cache(&self, range: PageRange) {
        flush_log().record(range);
    }
}

fn flush_log() -> &'static FlushLog {
    static LOG: OnceLock<&'static FlushLog> = OnceLock::new();
    LOG.get_or_init(|| {
        Box::leak(Box::new(FlushLog {
            entries: StdMutex::new(Vec::new()),
        }))
    })
}

/// Installs the mocks once and serializes tests, since the inboxes and the
/// flush log are process-global.
fn setup() -> MutexGuard<'static, ()> {
    static GATE: StdMutex<()> = StdMutex::new(());
    cpu::register_cpu(0);
    cpu::register_cpu(1);
    init_executor_ops(&TestExecutors);
    init_flush_ops(&TestFlush);
    let guard = GATE.lock().unwrap();
    flush_log().take();
    guard
}

fn kernel_page_batch(addr: usize, pages: usize) -> VirtualRangeBatch {
    VirtualRangeBatch::with_range(PageRange::from_virt_addr(
        VirtualAddress::new(addr),
        pages * PAGE_SIZE,
    ))
}

/// Runs `body` on a thread acting as `cpu`, servicing flush IPIs before,
/// between, and after, until the main thread's shootdown completes.
fn with_polling_executor<T: Send + 'static>(
    cpu: u32,
    stop: &'static AtomicBool,
    body: impl FnOnce() -> T + Send + 'static,
) -> thread::JoinHandle<T> {
    thread::spawn(move || {
        CURRENT_CPU.with(|current| current.set(cpu));
        let result = body();
        while !stop.load(core::sync::atomic::Ordering::SeqCst) {
            if IPI_PENDING[cpu as usize].swap(false, core::sync::atomic::Ordering::SeqCst) {
                INTERRUPTS_ENABLED.with(|flag| flag.set(false));
                handle_flush_ipi();
                INTERRUPTS_ENABLED.with(|flag| flag.set(true));
            }
            thread::yield_now();
        }
        // Drain anything that raced with the stop flag.
        if IPI_PENDING[cpu as usize].swap(false, core::sync::atomic::Ordering::SeqCst) {
            handle_flush_ipi();
        }
        result
    })
}

#[test]
fn kernel_target_reaches_every_executor_exactly_once() {
    let _guard = setup();
    static STOP: AtomicBool = AtomicBool::new(false);
    STOP.store(false, core::sync::atomic::Ordering::SeqCst);

    let remote = with_polling_executor(1, &STOP, || ());

    CURRENT_CPU.with(|current| current.set(0));
    let addr = 0xFFFF_8000_0000_0000usize;
    submit_and_wait(&kernel_page_batch(addr, 1), FlushTarget::Kernel);

    STOP.store(true, core::sync::atomic::Ordering::SeqCst);
    remote.join().unwrap();

    let mut entries = flush_log().take();
    entries.sort_unstable();
    // Exactly one flush of the range per executor: the originator and the
    // remote, each exactly once.
    assert_eq!(entries, [(0, addr, PAGE_SIZE), (1, addr, PAGE_SIZE)]);
    // Interrupts were restored on the originator.
    assert!(INTERRUPTS_ENABLED.with(|flag| flag.get()));
}

#[test]
fn user_target_skips_non_matching_executors() {
    let _guard = setup();
    static STOP: AtomicBool = AtomicBool::new(false);
    STOP.store(false, core::sync::atomic::Ordering::SeqCst);

    // The remote executor runs no user process, so it must acknowledge
    // without flushing.
    let remote = with_polling_executor(1, &STOP, || ());

    CURRENT_CPU.with(|current| current.set(0));
    USER_PROCESS.with(|process| process.set(Some(7)));
    let addr = 0x40_0000usize;
    submit_and_wait(&kernel_page_batch(addr, 2), FlushTarget::User(ProcessId(7)));
    USER_PROCESS.with(|process| process.set(None));

    STOP.store(true, core::sync::atomic::Ordering::SeqCst);
    remote.join().unwrap();

    let entries = flush_log().take();
    assert_eq!(entries, [(0, addr, 2 * PAGE_SIZE)]);
}

#[test]
fn nested_originators_drain_their_own_inboxes() {
    let _guard = setup();

    // Both executors originate with interrupts already disabled; each must
    // service the other's request from its own wait loop. The remote keeps
    // polling for IPIs afterwards in case the originators did not overlap.
    static STOP: AtomicBool = AtomicBool::new(false);
    static REMOTE_DONE: AtomicBool = AtomicBool::new(false);
    STOP.store(false, core::sync::atomic::Ordering::SeqCst);
    REMOTE_DONE.store(false, core::sync::atomic::Ordering::SeqCst);
    let remote = with_polling_executor(1, &STOP, || {
        INTERRUPTS_ENABLED.with(|flag| flag.set(false));
        submit_and_wait(&kernel_page_batch(0x51_0000, 1), FlushTarget::Kernel);
        INTERRUPTS_ENABLED.with(|flag| flag.set(true));
        REMOTE_DONE.store(true, core::sync::atomic::Ordering::SeqCst);
    });

    CURRENT_CPU.with(|current| current.set(0));
    INTERRUPTS_ENABLED.with(|flag| flag.set(false));
    submit_and_wait(&kernel_page_batch(0x52_0000, 1), FlushTarget::Kernel);
    INTERRUPTS_ENABLED.with(|flag| flag.set(true));

    // Keep servicing flush IPIs (as the interrupt handler would) until the
    // remote originator has finished its own shootdown.
    while !REMOTE_DONE.load(core::sync::atomic::Ordering::SeqCst) {
        if IPI_PENDING[0].swap(false, core::sync::atomic::Ordering::SeqCst) {
            handle_flush_ipi();
        }
        thread::yield_now();
    }
    STOP.store(true, core::sync::atomic::Ordering::SeqCst);
    remote.join().unwrap();

    let entries = flush_log().take();
    // Each of the two ranges was flushed on each of the two executors.
    assert_eq!(entries.len(), 4);
    for addr in [0x51_0000usize, 0x52_0000] {
        let count = entries.iter().filter(|entry| entry.1 == addr).count();
        assert_eq!(count, 2, "range {addr:#X} flushed {count} times");
    }
}

#[test]
fn empty_batches_are_ignored() {
    let _guard = setup();
    submit_and_wait(&VirtualRangeBatch::new(), FlushTarget::Kernel);
    assert!(flush_log().take().is_empty());
}
