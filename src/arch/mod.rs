//! Architecture-specific code for Kestrel
//!
//! The scheduler, page-table engine, and SMP layer depend only on the
//! narrow set of primitives declared here; everything touching inline
//! assembly lives behind this seam.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

/// Primitives every supported platform must provide
pub trait Architecture {
    /// Enable interrupts on the current CPU
    fn enable_interrupts();

    /// Disable interrupts on the current CPU
    fn disable_interrupts();

    /// Check whether interrupts are enabled
    fn interrupts_enabled() -> bool;

    /// Halt the current CPU until the next interrupt
    fn wait_for_interrupt();

    /// Flush the TLB entry for a single virtual address
    fn flush_tlb(vaddr: u64);

    /// Load a new page-table root
    ///
    /// # Safety
    /// The root must point at a valid top-level page table mapping the
    /// currently executing code.
    unsafe fn load_page_table_root(root: u64);

    /// Read the current page-table root
    fn page_table_root() -> u64;

    /// Cycle-granularity timestamp for accounting
    fn timestamp() -> u64;

    /// Full memory fence
    fn memory_barrier();

    /// Load fence
    fn read_barrier();

    /// Store fence
    fn write_barrier();
}

/// Run a closure with interrupts disabled, restoring the previous state
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let was_enabled = ArchImpl::interrupts_enabled();
    if was_enabled {
        ArchImpl::disable_interrupts();
    }
    let result = f();
    if was_enabled {
        ArchImpl::enable_interrupts();
    }
    result
}
