//! Kernel heap
//!
//! First-fit free-list allocator behind the global allocator hook.
//! The heap region comes from one frame-allocator block carved out
//! during kernel init; alloc collections (VecDeque, BTreeMap, Box)
//! throughout the kernel draw from it. Free blocks are kept in
//! address order and coalesced on free. Test builds use the host
//! allocator instead.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{null_mut, NonNull};
use spin::Mutex;

/// Minimum block size and alignment; also the free-node footprint
const MIN_BLOCK: usize = 16;

/// A free block header, stored inside the free block itself
struct FreeNode {
    size: usize,
    next: Option<NonNull<FreeNode>>,
}

/// First-fit free-list heap
pub struct FreeListHeap {
    head: Option<NonNull<FreeNode>>,
    heap_start: usize,
    heap_end: usize,
    used: usize,
}

unsafe impl Send for FreeListHeap {}

impl FreeListHeap {
    /// Create an empty heap
    pub const fn new() -> Self {
        Self {
            head: None,
            heap_start: 0,
            heap_end: 0,
            used: 0,
        }
    }

    /// Initialize with the backing region
    ///
    /// # Safety
    /// The region must be writable, unused, and at least MIN_BLOCK
    /// aligned.
    pub unsafe fn init(&mut self, heap_start: usize, heap_size: usize) {
        debug_assert_eq!(heap_start % MIN_BLOCK, 0);
        let node = heap_start as *mut FreeNode;
        node.write(FreeNode {
            size: heap_size,
            next: None,
        });
        self.head = NonNull::new(node);
        self.heap_start = heap_start;
        self.heap_end = heap_start + heap_size;
        self.used = 0;
    }

    /// Bytes currently handed out
    pub fn used(&self) -> usize {
        self.used
    }

    /// Round a layout up to the allocator's granularity
    fn effective_size(layout: Layout) -> usize {
        let size = layout.size().max(MIN_BLOCK);
        (size + MIN_BLOCK - 1) & !(MIN_BLOCK - 1)
    }

    /// Allocate memory for the layout, or null on exhaustion
    pub fn allocate(&mut self, layout: Layout) -> *mut u8 {
        let size = Self::effective_size(layout);
        let align = layout.align().max(MIN_BLOCK);

        // Walk the list through a cursor over the link being examined
        let mut link: *mut Option<NonNull<FreeNode>> = &mut self.head;
        unsafe {
            while let Some(node) = *link {
                let node_addr = node.as_ptr() as usize;
                let node_size = node.as_ref().size;
                let alloc_start = (node_addr + align - 1) & !(align - 1);
                let front_pad = alloc_start - node_addr;

                // A front pad too small to hold a node cannot be kept free
                let usable = front_pad == 0 || front_pad >= MIN_BLOCK;
                if usable && front_pad + size <= node_size {
                    let tail = node_size - front_pad - size;
                    let next = node.as_ref().next;

                    // Unlink, then give back the front and tail leftovers
                    *link = next;
                    if front_pad >= MIN_BLOCK {
                        self.insert_free(node_addr, front_pad);
                    }
                    if tail >= MIN_BLOCK {
                        self.insert_free(alloc_start + size, tail);
                    } else if tail > 0 {
                        // Sub-node tail rides along with the allocation
                        self.used += tail;
                    }

                    self.used += size;
                    return alloc_start as *mut u8;
                }

                link = &mut (*node.as_ptr()).next;
            }
        }

        null_mut()
    }

    /// Return memory to the heap
    ///
    /// # Safety
    /// The pointer must come from `allocate` with the same layout.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8, layout: Layout) {
        let size = Self::effective_size(layout);
        self.used = self.used.saturating_sub(size);
        self.insert_free(ptr as usize, size);
    }

    /// Insert a free block in address order, coalescing neighbors
    fn insert_free(&mut self, addr: usize, size: usize) {
        unsafe {
            let mut link: *mut Option<NonNull<FreeNode>> = &mut self.head;
            while let Some(node) = *link {
                if node.as_ptr() as usize > addr {
                    break;
                }
                link = &mut (*node.as_ptr()).next;
            }

            let mut new_size = size;
            let mut next = *link;

            // Coalesce forward
            if let Some(n) = next {
                if addr + size == n.as_ptr() as usize {
                    new_size += n.as_ref().size;
                    next = n.as_ref().next;
                }
            }

            let node_ptr = addr as *mut FreeNode;
            node_ptr.write(FreeNode {
                size: new_size,
                next,
            });
            *link = NonNull::new(node_ptr);

            // Coalesce backward: rescan from head for the predecessor
            let mut prev_link: *mut Option<NonNull<FreeNode>> = &mut self.head;
            while let Some(node) = *prev_link {
                let node_addr = node.as_ptr() as usize;
                if node_addr + node.as_ref().size == addr {
                    (*node.as_ptr()).size += new_size;
                    (*node.as_ptr()).next = next;
                    break;
                }
                if node_addr >= addr {
                    break;
                }
                prev_link = &mut (*node.as_ptr()).next;
            }
        }
    }
}

/// Lock wrapper implementing the global allocator hook
pub struct LockedHeap(Mutex<FreeListHeap>);

impl LockedHeap {
    /// Create an uninitialized locked heap
    pub const fn new() -> Self {
        Self(Mutex::new(FreeListHeap::new()))
    }

    /// Initialize with the backing region
    ///
    /// # Safety
    /// See [`FreeListHeap::init`].
    pub unsafe fn init(&self, heap_start: usize, heap_size: usize) {
        self.0.lock().init(heap_start, heap_size);
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0.lock().allocate(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.0.lock().deallocate(ptr, layout)
    }
}

/// The kernel global allocator
#[cfg(not(test))]
#[global_allocator]
static KERNEL_HEAP: LockedHeap = LockedHeap::new();

/// Seed the global heap from a physical region
///
/// # Safety
/// The region must be identity-mapped, writable, and owned by the
/// caller (taken from the frame allocator during init).
#[cfg(not(test))]
pub unsafe fn init(heap_start: usize, heap_size: usize) {
    use crate::log_info;
    KERNEL_HEAP.init(heap_start, heap_size);
    log_info!("heap", "kernel heap at {:#x}, {} KiB", heap_start, heap_size / 1024);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn test_heap(size: usize) -> FreeListHeap {
        // u128 backing keeps the region MIN_BLOCK aligned
        let backing: &'static mut [u128] = Vec::leak(vec![0u128; size / 16]);
        let mut heap = FreeListHeap::new();
        unsafe {
            heap.init(backing.as_mut_ptr() as usize, size);
        }
        heap
    }

    #[test]
    fn test_alloc_and_free() {
        let mut heap = test_heap(4096);
        let layout = Layout::from_size_align(64, 8).unwrap();

        let a = heap.allocate(layout);
        let b = heap.allocate(layout);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_ne!(a, b);
        assert_eq!(heap.used(), 128);

        unsafe {
            heap.deallocate(a, layout);
            heap.deallocate(b, layout);
        }
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let mut heap = test_heap(256);
        let layout = Layout::from_size_align(512, 16).unwrap();
        assert!(heap.allocate(layout).is_null());
    }

    #[test]
    fn test_coalesce_allows_full_realloc() {
        let mut heap = test_heap(1024);
        let small = Layout::from_size_align(256, 16).unwrap();

        let a = heap.allocate(small);
        let b = heap.allocate(small);
        let c = heap.allocate(small);
        assert!(!c.is_null());

        unsafe {
            heap.deallocate(b, small);
            heap.deallocate(a, small);
            heap.deallocate(c, small);
        }

        // After coalescing, the whole region must be allocatable again
        let big = Layout::from_size_align(1024, 16).unwrap();
        assert!(!heap.allocate(big).is_null());
    }

    #[test]
    fn test_alignment_honored() {
        let mut heap = test_heap(4096);
        let layout = Layout::from_size_align(32, 64).unwrap();
        let p = heap.allocate(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
    }
}
