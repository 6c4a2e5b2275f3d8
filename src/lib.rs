//! Kestrel - a small x86-64 microkernel core in Rust
//!
//! The core is five cooperating pieces: a buddy physical frame
//! allocator, a four-level virtual memory manager, a preemptive
//! round-robin scheduler, message-passing IPC with a named-service
//! registry, and SMP/APIC bring-up that ties the scheduler to the
//! per-CPU timer. The monolithic layer (drivers, VFS, terminal)
//! consumes the surface in `kernel`.

#![no_std]
#![allow(dead_code)]
// Kernel types often have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Hardware register code uses explicit shifts for documentation
#![allow(clippy::identity_op)]

extern crate alloc;

pub mod console;
pub mod logger;

pub mod arch;
pub mod boot;
pub mod error;
pub mod heap;
pub mod ipc;
pub mod kernel;
pub mod paging;
pub mod panic;
pub mod pmm;
pub mod sched;
pub mod smp;
pub mod types;
pub mod vmm;

/// Kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kernel name
pub const NAME: &str = "Kestrel";

/// Shared fixtures for the host-side unit tests
///
/// The frame allocator is pure bookkeeping, but the page-table engine
/// and message frames dereference the frame addresses through the
/// kernel's identity-map assumption. Seeding the global allocator
/// with a leaked, page-aligned host allocation makes that assumption
/// hold under the test harness too.
#[cfg(test)]
pub(crate) mod test_support {
    use crate::boot::{MemoryRegion, RegionKind};
    use crate::{paging, pmm, vmm};
    use alloc::alloc::Layout;
    use spin::Once;

    /// Size of the shared physical-memory arena
    const ARENA_BYTES: usize = 32 * 1024 * 1024;

    static ARENA: Once<()> = Once::new();

    /// Seed the global frame allocator and kernel address space once
    /// per test process
    pub fn init_global_memory() {
        ARENA.call_once(|| {
            let layout = Layout::from_size_align(ARENA_BYTES, pmm::PAGE_SIZE).unwrap();
            let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
            assert!(!base.is_null());

            let map: &'static [MemoryRegion] = alloc::vec![MemoryRegion {
                base: base as u64,
                length: ARENA_BYTES as u64,
                kind: RegionKind::Available,
            }]
            .leak();

            pmm::set_memory_map(map);
            vmm::init().unwrap();
        });
    }

    /// Free a test-built page-table tree (interior tables and root,
    /// not the leaf target frames)
    pub fn release_root(root: u64) {
        unsafe {
            let entries = root as *const u64;
            for l4 in 0..512 {
                let l4e = *entries.add(l4);
                if !paging::entry_present(l4e) {
                    continue;
                }
                let pdpt = paging::entry_addr(l4e) as *const u64;
                for l3 in 0..512 {
                    let l3e = *pdpt.add(l3);
                    if !paging::entry_present(l3e) {
                        continue;
                    }
                    let pd = paging::entry_addr(l3e) as *const u64;
                    for l2 in 0..512 {
                        let l2e = *pd.add(l2);
                        if paging::entry_present(l2e) {
                            paging::free_table(paging::entry_addr(l2e));
                        }
                    }
                    paging::free_table(paging::entry_addr(l3e));
                }
                paging::free_table(paging::entry_addr(l4e));
            }
        }
        paging::free_table(root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        assert_eq!(NAME, "Kestrel");
        assert!(!VERSION.is_empty());
    }
}
