//! Common identifier types used across Kestrel
//!
//! Shared newtypes live here to avoid circular dependencies between
//! the scheduler, IPC, and memory subsystems.

/// Task identifier
///
/// Monotonically increasing within a boot; never reused. Issued by the
/// scheduler's task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Sentinel for "no task" (e.g. messages sent before the scheduler runs)
    pub const NONE: Self = Self(0);
}

/// Message queue identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct QueueId(pub u64);

/// Address space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SpaceId(pub u64);

impl SpaceId {
    /// The kernel address space
    pub const KERNEL: Self = Self(1);
}

/// Logical CPU identifier (index into the CPU table, not the APIC id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CpuId(pub u8);

/// Physical address
pub type PhysAddr = u64;

/// Virtual address
pub type VirtAddr = u64;
