//! Attributes of a single virtual-to-physical mapping.

use core::fmt;

/// Which privilege environment a mapping belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Environment {
    Kernel,
    User,
}

/// The access rights of a mapping.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protection {
    None,
    Read,
    Execute,
    ReadWrite,
}

impl Protection {
    pub const fn allows_write(&self) -> bool {
        matches!(self, Protection::ReadWrite)
    }

    pub const fn allows_execute(&self) -> bool {
        matches!(self, Protection::Execute)
    }

    /// Whether switching from `self` to `new` removes any access right.
    pub const fn is_tightened_by(&self, new: Protection) -> bool {
        match (self, new) {
            (Protection::None, _) => false,
            (_, Protection::None) => true,
            (Protection::ReadWrite, Protection::Read | Protection::Execute) => true,
            (Protection::Execute, Protection::Read | Protection::ReadWrite) => true,
            (Protection::Read, Protection::Execute) => true,
            _ => false,
        }
    }
}

/// The cacheability of a mapping.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CachePolicy {
    WriteBack,
    WriteCombining,
    Uncached,
}

/// The full attribute set of a mapping. Two `MapType`s are equal iff
/// all three fields are equal.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MapType {
    pub environment: Environment,
    pub protection: Protection,
    pub cache: CachePolicy,
}

impl MapType {
    pub const fn new(
        environment: Environment,
        protection: Protection,
        cache: CachePolicy,
    ) -> MapType {
        MapType {
            environment,
            protection,
            cache,
        }
    }

    /// Kernel read/write write-back memory, the attribute set of almost
    /// all kernel-internal mappings.
    pub const fn kernel_read_write() -> MapType {
        MapType::new(Environment::Kernel, Protection::ReadWrite, CachePolicy::WriteBack)
    }

    pub const fn kernel_read_only() -> MapType {
        MapType::new(Environment::Kernel, Protection::Read, CachePolicy::WriteBack)
    }

    pub const fn kernel_executable() -> MapType {
        MapType::new(Environment::Kernel, Protection::Execute, CachePolicy::WriteBack)
    }

    pub const fn kernel_uncached() -> MapType {
        MapType::new(Environment::Kernel, Protection::ReadWrite, CachePolicy::Uncached)
    }

    /// Whether replacing `self` with `new` requires notifying other
    /// translation caches: true when access tightens or cacheability changes.
    pub fn change_requires_flush(&self, new: &MapType) -> bool {
        self.protection.is_tightened_by(new.protection) || self.cache != new.cache
    }
}

impl fmt::Debug for MapType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "MapType({:?}, {:?}, {:?})",
            self.environment, self.protection, self.cache
        )
    }
}
