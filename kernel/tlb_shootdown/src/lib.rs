//! The TLB shootdown protocol: propagates batched mapping changes to every
//! other executor's translation caches and waits for their acknowledgment.
//!
//! Each executor owns a lock-free inbox (a singly-linked stack) of
//! [`FlushRequestNode`]s. An originator enqueues one node per remote
//! executor, sends each a flush IPI, flushes locally, and spins until the
//! request's `outstanding` counter drops to zero. Node storage lives inside
//! the stack-allocated request; because `submit_and_wait` blocks until
//! every executor has acknowledged, that storage outlives all readers.
//!
//! Interrupt discipline: the originator disables interrupts around node
//! enqueue and IPI dispatch. If interrupts were enabled on entry they are
//! re-enabled for the wait, so concurrent originators' IPIs still get
//! serviced through the interrupt handler. If the caller entered with
//! interrupts disabled, the waiter drains its own inbox between spins;
//! two such originators targeting each other both make progress.
//!
//! There is no cancellation: every issued IPI is honored.
//!
//! IPIs currently go to all executors except the originator.
//! TODO: track which executors actually have the mapping resident and
//! target only those.

#![no_std]

#[cfg(test)]
mod test;

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use cpu::CpuId;
use kernel_config::memory::MAX_CPUS;
use memory_structs::{FlushTarget, PageRange, ProcessId, VirtualRangeBatch};
use spin::Once;

/// What the shootdown protocol needs to know about executors and
/// interrupts. Implemented by the architecture/executor layer.
pub trait ExecutorOps: Send + Sync {
    fn current(&self) -> CpuId;
    fn interrupts_enabled(&self) -> bool;
    /// Disables interrupts, returning whether they were enabled before.
    fn disable_interrupts(&self) -> bool;
    fn restore_interrupts(&self, was_enabled: bool);
    fn send_flush_ipi(&self, target: CpuId);
    /// The user process currently running on this executor, if any.
    fn current_user_process(&self) -> Option<ProcessId>;
}

/// The architecture's translation-cache flush primitive.
pub trait FlushOps: Send + Sync {
    fn flush_cache(&self, range: PageRange);
}

static EXECUTOR_OPS: Once<&'static dyn ExecutorOps> = Once::new();
static FLUSH_OPS: Once<&'static dyn FlushOps> = Once::new();

/// Installs the executor contract. Before this is called the protocol
/// degrades to local-only flushing (valid while only one executor runs).
pub fn init_executor_ops(ops: &'static dyn ExecutorOps) {
    EXECUTOR_OPS.call_once(|| ops);
}

/// Installs the architecture flush primitive.
pub fn init_flush_ops(ops: &'static dyn FlushOps) {
    FLUSH_OPS.call_once(|| ops);
}

/// One per-executor entry in a request's node array.
struct FlushRequestNode {
    request: AtomicPtr<FlushRequest>,
    next: AtomicPtr<FlushRequestNode>,
}

const EMPTY_NODE: FlushRequestNode = FlushRequestNode {
    request: AtomicPtr::new(ptr::null_mut()),
    next: AtomicPtr::new(ptr::null_mut()),
};

/// A single shootdown, alive for exactly one `submit_and_wait` call.
struct FlushRequest {
    batch: VirtualRangeBatch,
    target: FlushTarget,
    /// One for the originator plus one per enqueued remote executor.
    outstanding: AtomicUsize,
    nodes: [FlushRequestNode; MAX_CPUS],
}

const EMPTY_INBOX: AtomicPtr<FlushRequestNode> = AtomicPtr::new(ptr::null_mut());
static INBOXES: [AtomicPtr<FlushRequestNode>; MAX_CPUS] = [EMPTY_INBOX; MAX_CPUS];

/// Ships `batch` to every executor whose environment matches `target` and
/// returns once all of them have flushed.
pub fn submit_and_wait(batch: &VirtualRangeBatch, target: FlushTarget) {
    if batch.is_empty() {
        return;
    }
    let executors = match EXECUTOR_OPS.get() {
        Some(ops) => *ops,
        None => {
            // Single-executor boot: nothing to notify, flush locally.
            log::trace!("tlb shootdown: no executors registered, flushing locally");
            local_flush(batch);
            return;
        }
    };

    let request = FlushRequest {
        batch: batch.clone(),
        target,
        outstanding: AtomicUsize::new(1),
        nodes: [EMPTY_NODE; MAX_CPUS],
    };

    let was_enabled = executors.disable_interrupts();
    let me = executors.current();

    for other in cpu::cpus().iter() {
        if other == me {
            continue;
        }
        let node = &request.nodes[other.value() as usize];
        node.request.store(
            &request as *const FlushRequest as *mut FlushRequest,
            Ordering::Relaxed,
        );
        request.outstanding.fetch_add(1, Ordering::AcqRel);
        push_inbox(other, node);
        executors.send_flush_ipi(other);
    }

    flush(&request, executors);

    if was_enabled {
        // Re-enable so other originators' flush IPIs keep being serviced
        // while we spin.
        executors.restore_interrupts(true);
        while request.outstanding.load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
    } else {
        // Nested case: nobody will interrupt us, so drain our own inbox
        // while waiting to avoid a circular wait between originators.
        while request.outstanding.load(Ordering::Acquire) != 0 {
            service_local_inbox(executors);
            core::hint::spin_loop();
        }
    }
}

/// The flush-IPI interrupt handler body. Must be entered with interrupts
/// disabled; never blocks.
pub fn handle_flush_ipi() {
    if let Some(executors) = EXECUTOR_OPS.get() {
        service_local_inbox(*executors);
    }
}

fn push_inbox(target: CpuId, node: &FlushRequestNode) {
    let inbox = &INBOXES[target.value() as usize];
    let node_ptr = node as *const FlushRequestNode as *mut FlushRequestNode;
    let mut head = inbox.load(Ordering::Relaxed);
    loop {
        node.next.store(head, Ordering::Relaxed);
        match inbox.compare_exchange_weak(head, node_ptr, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => return,
            Err(current) => head = current,
        }
    }
}

fn service_local_inbox(executors: &'static dyn ExecutorOps) {
    let me = executors.current();
    let inbox = &INBOXES[me.value() as usize];
    let mut node_ptr = inbox.swap(ptr::null_mut(), Ordering::Acquire);
    while !node_ptr.is_null() {
        // Read the chain link before flushing: the final decrement lets
        // the originator return and take the node storage with it.
        let (next, request) = unsafe {
            let node = &*node_ptr;
            (
                node.next.load(Ordering::Relaxed),
                node.request.load(Ordering::Relaxed),
            )
        };
        flush(unsafe { &*request }, executors);
        node_ptr = next;
    }
}

/// Flushes the request's ranges iff this executor's current environment
/// matches the flush target, then acknowledges. Called exactly once per
/// executor per request.
fn flush(request: &FlushRequest, executors: &'static dyn ExecutorOps) {
    let matches = match request.target {
        FlushTarget::Kernel => true,
        FlushTarget::User(process) => executors.current_user_process() == Some(process),
    };
    if matches {
        if let Some(flush_ops) = FLUSH_OPS.get() {
            for range in request.batch.as_slice() {
                flush_ops.flush_cache(*range);
            }
        }
    }
    request.outstanding.fetch_sub(1, Ordering::Release);
}

fn local_flush(batch: &VirtualRangeBatch) {
    if let Some(flush_ops) = FLUSH_OPS.get() {
        for range in batch.as_slice() {
            flush_ops.flush_cache(*range);
        }
    }
}
