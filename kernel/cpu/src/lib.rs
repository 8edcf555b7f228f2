//! An abstraction for querying about executors (CPU cores) in an SMP system.
//!
//! Executors register themselves here as they come online; the TLB
//! shootdown protocol uses the registry to enumerate flush targets.

#![no_std]

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_config::memory::MAX_CPUS;
use spin::Mutex;

/// A unique identifier for an executor (one logical CPU).
///
/// A `CpuId` is a known-valid value: it is only handed out by
/// [`register_cpu`], so it always names an executor that actually exists.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// Returns the inner raw value of this `CpuId`.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Returns `true` if this is the bootstrap executor, the first to boot.
    pub fn is_bootstrap_cpu(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl From<CpuId> for u32 {
    fn from(value: CpuId) -> u32 {
        value.0
    }
}

static ONLINE_COUNT: AtomicU32 = AtomicU32::new(0);
static ONLINE_CPUS: Mutex<[Option<CpuId>; MAX_CPUS]> = Mutex::new([None; MAX_CPUS]);

/// Registers the calling executor with the given hardware id and returns
/// its `CpuId`.
///
/// Panics if more than [`MAX_CPUS`] executors register.
pub fn register_cpu(raw_id: u32) -> CpuId {
    assert!(
        (raw_id as usize) < MAX_CPUS,
        "executor id {} exceeds the supported maximum of {}",
        raw_id,
        MAX_CPUS,
    );
    let id = CpuId(raw_id);
    let mut cpus = ONLINE_CPUS.lock();
    let slot = &mut cpus[raw_id as usize];
    if slot.is_none() {
        *slot = Some(id);
        ONLINE_COUNT.fetch_add(1, Ordering::Release);
    }
    id
}

/// The number of executors currently online.
pub fn cpu_count() -> u32 {
    ONLINE_COUNT.load(Ordering::Acquire)
}

/// A snapshot of the online executors, taken at one instant.
#[derive(Clone, Copy)]
pub struct CpuList {
    ids: [Option<CpuId>; MAX_CPUS],
}

impl CpuList {
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.ids.iter().filter_map(|id| *id)
    }
}

/// Returns a snapshot of all online executors.
pub fn cpus() -> CpuList {
    CpuList {
        ids: *ONLINE_CPUS.lock(),
    }
}
