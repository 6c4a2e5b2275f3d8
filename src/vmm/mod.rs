//! Virtual memory manager
//!
//! Owns address-space handles and the virtual range allocator layered
//! on the frame allocator and the page-table engine. Each space keeps
//! a first-fit list of free virtual ranges (kernel and user spaces
//! start from different bases), so every allocation hands out a
//! distinct base and `free` returns ranges with coalescing.
//!
//! Backing frames are allocated page-by-page; `free` walks the page
//! table per page to recover each frame, so nothing leaks even though
//! the allocator keeps no shadow mapping table.
//!
//! The kernel half of the address space is shared: the kernel root's
//! upper 256 PML4 slots are pre-populated at init and copied into
//! every user root, so later kernel mappings never touch a user
//! root's top level.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernError, KernResult};
use crate::paging::{self, EntryFlags};
use crate::{log_debug, log_info, log_warn};
use crate::pmm::{self, PAGE_SIZE};
use crate::types::{PhysAddr, SpaceId, VirtAddr};

/// First virtual address the kernel range allocator hands out
const KERNEL_RANGE_BASE: VirtAddr = 0xFFFF_8000_0100_0000;

/// Exclusive ceiling of the kernel allocation window (1 GiB)
const KERNEL_RANGE_CEIL: VirtAddr = 0xFFFF_8000_4000_0000;

/// First virtual address the user range allocator hands out
const USER_RANGE_BASE: VirtAddr = 0x0000_0000_0040_0000;

/// Exclusive ceiling of the user half
const USER_RANGE_CEIL: VirtAddr = 0x0000_7FFF_FFFF_F000;

/// Cap on any single allocation
const MAX_SINGLE_ALLOC: u64 = 100 * 1024 * 1024;

/// Memory permission flags on the public allocation surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFlags(u32);

impl MemFlags {
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const EXEC: Self = Self(4);
    pub const USER: Self = Self(8);

    /// Empty flag set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & 0xF)
    }

    /// Whether all of `other` is set
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union of two flag sets
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for MemFlags {
    type Output = Self;
    fn bitor(self, other: Self) -> Self {
        self.union(other)
    }
}

/// Address space kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    User,
}

/// Translate permission flags into page-table entry flags
///
/// Kernel mappings are implicitly writable and never user-accessible.
fn entry_flags_for(flags: MemFlags, kind: SpaceKind) -> EntryFlags {
    let mut entry = EntryFlags::empty();
    if flags.contains(MemFlags::READ) {
        entry = entry | EntryFlags::PRESENT;
    }
    if flags.contains(MemFlags::WRITE) {
        entry = entry | EntryFlags::WRITABLE;
    }
    if !flags.contains(MemFlags::EXEC) {
        entry = entry | EntryFlags::NO_EXECUTE;
    }
    match kind {
        SpaceKind::Kernel => entry | EntryFlags::WRITABLE,
        SpaceKind::User => {
            if flags.contains(MemFlags::USER) {
                entry | EntryFlags::USER
            } else {
                entry
            }
        }
    }
}

/// An address-space handle
pub struct AddressSpace {
    id: SpaceId,
    root: PhysAddr,
    kind: SpaceKind,
    /// Free virtual ranges, address-ordered, half-open
    free_ranges: Vec<(VirtAddr, VirtAddr)>,
}

impl AddressSpace {
    fn new(id: SpaceId, root: PhysAddr, kind: SpaceKind) -> Self {
        let window = match kind {
            SpaceKind::Kernel => (KERNEL_RANGE_BASE, KERNEL_RANGE_CEIL),
            SpaceKind::User => (USER_RANGE_BASE, USER_RANGE_CEIL),
        };
        Self {
            id,
            root,
            kind,
            free_ranges: alloc::vec![window],
        }
    }

    /// Page-table root frame
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Space kind
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Carve a range of `bytes` out of the first fitting free range
    fn take_range(&mut self, bytes: u64) -> KernResult<VirtAddr> {
        for i in 0..self.free_ranges.len() {
            let (start, end) = self.free_ranges[i];
            if end - start >= bytes {
                if end - start == bytes {
                    self.free_ranges.remove(i);
                } else {
                    self.free_ranges[i].0 = start + bytes;
                }
                return Ok(start);
            }
        }
        Err(KernError::OutOfMemory)
    }

    /// Return a range, merging with adjacent free neighbors
    fn give_range(&mut self, start: VirtAddr, bytes: u64) {
        let end = start + bytes;
        let pos = self
            .free_ranges
            .iter()
            .position(|&(s, _)| s > start)
            .unwrap_or(self.free_ranges.len());

        let merge_prev = pos > 0 && self.free_ranges[pos - 1].1 == start;
        let merge_next = pos < self.free_ranges.len() && self.free_ranges[pos].0 == end;

        match (merge_prev, merge_next) {
            (true, true) => {
                self.free_ranges[pos - 1].1 = self.free_ranges[pos].1;
                self.free_ranges.remove(pos);
            }
            (true, false) => self.free_ranges[pos - 1].1 = end,
            (false, true) => self.free_ranges[pos].0 = start,
            (false, false) => self.free_ranges.insert(pos, (start, end)),
        }
    }
}

/// Global manager state
struct VmManager {
    spaces: BTreeMap<SpaceId, Arc<Mutex<AddressSpace>>>,
    next_id: u64,
}

impl VmManager {
    fn find(&self, id: SpaceId) -> KernResult<Arc<Mutex<AddressSpace>>> {
        self.spaces.get(&id).cloned().ok_or(KernError::NotFound)
    }
}

static VM_MANAGER: Mutex<Option<VmManager>> = Mutex::new(None);

/// Initialize the manager and the kernel address space
pub fn init() -> KernResult<()> {
    let mut guard = VM_MANAGER.lock();
    if guard.is_some() {
        return Ok(());
    }

    let root = paging::alloc_table()?;

    // Pre-populate the kernel half so every later user root shares
    // exactly these interior tables.
    for slot in 256..512 {
        let table = paging::alloc_table()?;
        unsafe {
            let entries = root as *mut u64;
            *entries.add(slot) = paging::make_entry(
                table,
                EntryFlags::PRESENT | EntryFlags::WRITABLE,
            );
        }
    }

    let kernel = AddressSpace::new(SpaceId::KERNEL, root, SpaceKind::Kernel);
    let mut spaces = BTreeMap::new();
    spaces.insert(SpaceId::KERNEL, Arc::new(Mutex::new(kernel)));

    *guard = Some(VmManager { spaces, next_id: 2 });
    log_info!("vmm", "kernel address space ready, root {:#x}", root);
    Ok(())
}

/// Look up a space handle
fn find_space(id: SpaceId) -> KernResult<Arc<Mutex<AddressSpace>>> {
    VM_MANAGER
        .lock()
        .as_ref()
        .ok_or(KernError::NotInitialized)?
        .find(id)
}

/// Admission rules shared with `can_alloc`
fn admit(bytes: u64) -> KernResult<()> {
    if bytes == 0 {
        return Err(KernError::InvalidArgument);
    }

    let stats = pmm::stats();
    let free_bytes = stats.free_frames * PAGE_SIZE as u64;
    let total_bytes = stats.total_frames * PAGE_SIZE as u64;

    if bytes > free_bytes {
        log_warn!("vmm", "rejected allocation: {} bytes, {} free", bytes, free_bytes);
        return Err(KernError::OutOfRange);
    }
    if bytes * 2 >= total_bytes {
        log_warn!(
            "vmm",
            "rejected large allocation: {} of {} bytes",
            bytes,
            total_bytes
        );
        return Err(KernError::OutOfRange);
    }
    if bytes > MAX_SINGLE_ALLOC {
        log_warn!("vmm", "rejected massive allocation: {} bytes", bytes);
        return Err(KernError::OutOfRange);
    }

    Ok(())
}

/// Whether an allocation of `bytes` would pass admission
pub fn can_alloc(bytes: u64) -> bool {
    admit(bytes).is_ok()
}

/// Create a new (user) address space
pub fn create_address_space() -> KernResult<SpaceId> {
    let kernel_root = find_space(SpaceId::KERNEL)?.lock().root;

    let root = paging::alloc_table()?;
    unsafe {
        // Share the kernel half: copy the upper 256 PML4 slots
        let src = kernel_root as *const u64;
        let dst = root as *mut u64;
        for slot in 256..512 {
            *dst.add(slot) = *src.add(slot);
        }
    }

    let mut guard = VM_MANAGER.lock();
    let manager = guard.as_mut().ok_or(KernError::NotInitialized)?;
    let id = SpaceId(manager.next_id);
    manager.next_id += 1;
    manager
        .spaces
        .insert(id, Arc::new(Mutex::new(AddressSpace::new(id, root, SpaceKind::User))));

    log_debug!("vmm", "created address space {:?}", id);
    Ok(id)
}

/// Destroy an address space, returning every frame it owned
///
/// Walks the user half only: leaf frames and interior tables are
/// freed bottom-up; the shared kernel tables are left alone. The
/// kernel space cannot be destroyed.
pub fn destroy(id: SpaceId) -> KernResult<()> {
    if id == SpaceId::KERNEL {
        return Err(KernError::InvalidArgument);
    }

    let space = {
        let mut guard = VM_MANAGER.lock();
        let manager = guard.as_mut().ok_or(KernError::NotInitialized)?;
        manager.spaces.remove(&id).ok_or(KernError::NotFound)?
    };

    let space = space.lock();
    unsafe {
        let root_entries = space.root as *const u64;
        for l4 in 0..256 {
            let l4e = *root_entries.add(l4);
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
                    if !paging::entry_present(l2e) {
                        continue;
                    }
                    let pt = paging::entry_addr(l2e) as *const u64;
                    for l1 in 0..512 {
                        let l1e = *pt.add(l1);
                        if paging::entry_present(l1e) {
                            pmm::free(paging::entry_addr(l1e), 0);
                        }
                    }
                    paging::free_table(paging::entry_addr(l2e));
                }
                paging::free_table(paging::entry_addr(l3e));
            }
            paging::free_table(paging::entry_addr(l4e));
        }
    }
    paging::free_table(space.root);

    log_debug!("vmm", "destroyed address space {:?}", id);
    Ok(())
}

/// Allocate and map `bytes` of memory in the given space
///
/// Backing frames come from the frame allocator one page at a time;
/// on any failure every page installed so far is unmapped and freed
/// before the error is reported.
pub fn alloc(id: SpaceId, bytes: u64, flags: MemFlags) -> KernResult<VirtAddr> {
    admit(bytes)?;

    let space = find_space(id)?;
    let mut space = space.lock();

    let pages = (bytes + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;
    let aligned = pages * PAGE_SIZE as u64;
    let base = space.take_range(aligned)?;
    let entry_flags = entry_flags_for(flags, space.kind);

    for i in 0..pages {
        let vaddr = base + i * PAGE_SIZE as u64;
        let frame = match pmm::alloc(0) {
            Ok(f) => f,
            Err(e) => {
                unwind_partial(&mut space, base, i);
                space.give_range(base, aligned);
                return Err(e);
            }
        };
        unsafe {
            core::ptr::write_bytes(frame as *mut u8, 0, PAGE_SIZE);
        }
        if let Err(e) = paging::map(space.root, vaddr, frame, entry_flags) {
            pmm::free(frame, 0);
            unwind_partial(&mut space, base, i);
            space.give_range(base, aligned);
            return Err(e);
        }
    }

    Ok(base)
}

/// Unmap and free the first `pages` pages of a partial allocation
fn unwind_partial(space: &mut AddressSpace, base: VirtAddr, pages: u64) {
    for j in 0..pages {
        let vaddr = base + j * PAGE_SIZE as u64;
        if let Some(phys) = paging::translate(space.root, vaddr) {
            paging::unmap(space.root, vaddr);
            pmm::free(phys & !(PAGE_SIZE as u64 - 1), 0);
        }
    }
}

/// Unmap `bytes` starting at `vaddr` and return the frames
pub fn free(id: SpaceId, vaddr: VirtAddr, bytes: u64) -> KernResult<()> {
    if vaddr == 0 || bytes == 0 {
        return Ok(());
    }

    let space = find_space(id)?;
    let mut space = space.lock();

    let pages = (bytes + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;
    unwind_partial(&mut space, vaddr, pages);
    space.give_range(vaddr, pages * PAGE_SIZE as u64);
    Ok(())
}

/// Map a single explicit page; thin wrapper over the table engine
pub fn map_page(id: SpaceId, vaddr: VirtAddr, paddr: PhysAddr, flags: MemFlags) -> KernResult<()> {
    let space = find_space(id)?;
    let space = space.lock();
    paging::map(space.root, vaddr, paddr, entry_flags_for(flags, space.kind))
}

/// Unmap a single explicit page
pub fn unmap_page(id: SpaceId, vaddr: VirtAddr) -> KernResult<()> {
    let space = find_space(id)?;
    let space = space.lock();
    paging::unmap(space.root, vaddr);
    Ok(())
}

/// Translate a virtual address in the given space
pub fn translate(id: SpaceId, vaddr: VirtAddr) -> KernResult<Option<PhysAddr>> {
    let space = find_space(id)?;
    let space = space.lock();
    Ok(paging::translate(space.root, vaddr))
}

/// Switch the CPU to the given address space
pub fn switch_to(id: SpaceId) -> KernResult<()> {
    let space = find_space(id)?;
    let root = space.lock().root;
    unsafe {
        paging::switch_to(root);
    }
    Ok(())
}

/// Allocate kernel memory (writable, supervisor-only)
pub fn alloc_kernel(bytes: u64) -> KernResult<VirtAddr> {
    alloc(SpaceId::KERNEL, bytes, MemFlags::READ | MemFlags::WRITE)
}

/// Free kernel memory from `alloc_kernel`
pub fn free_kernel(vaddr: VirtAddr, bytes: u64) {
    let _ = free(SpaceId::KERNEL, vaddr, bytes);
}
