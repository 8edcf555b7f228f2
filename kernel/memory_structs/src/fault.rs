//! Details of a page fault, as reported by the architecture's fault handler.

use crate::{Environment, VirtualAddress};
use core::fmt;

/// The kind of access that faulted.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}

/// Why the access faulted.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultType {
    /// No mapping was present at the faulting address.
    Invalid,
    /// A mapping was present but its protection forbade the access.
    Protection,
}

/// Everything the memory core needs to know about a page fault.
#[derive(Clone, Copy, Debug)]
pub struct PageFaultDetails {
    pub faulting_address: VirtualAddress,
    pub access: FaultAccess,
    pub fault_type: FaultType,
    pub environment: Environment,
}

impl fmt::Display for PageFaultDetails {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "page fault at {} ({:?} access, {:?}, from {:?} mode)",
            self.faulting_address, self.access, self.fault_type, self.environment
        )
    }
}
