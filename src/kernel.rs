//! Kernel public interface
//!
//! The surface the monolithic layer (drivers, VFS, terminal) consumes:
//! memory and task primitives, message passing, driver capability
//! registration, and introspection. Everything here delegates to the
//! owning subsystem; the only state this module holds is the
//! initialized flag and the registered terminal capabilities.

use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::boot::{BootInfo, MemoryMapManager};
use crate::error::{KernError, KernResult};
use crate::ipc::{self, Dest, MessageType, MsgFlags};
use crate::pmm::{self, PAGE_SIZE};
use crate::sched::{self, TaskEntry, TaskPriority};
use crate::types::{PhysAddr, TaskId, VirtAddr};
use crate::vmm::{self, MemFlags};
use crate::{log_error, log_info};

/// Default receive timeout for the convenience receive path
const RECV_TIMEOUT_MS: u64 = 1000;

/// Heap carved out of physical memory at init
#[cfg(not(test))]
const KERNEL_HEAP_SIZE: u64 = 1024 * 1024;

/// Whether `init` has completed
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Terminal write capability: consumes a byte slice
pub type TerminalWrite = fn(&[u8]);

/// Terminal read capability: next input byte, if any
pub type TerminalRead = fn() -> Option<u8>;

struct TerminalDriver {
    write: Option<TerminalWrite>,
    read: Option<TerminalRead>,
}

static TERMINAL: Mutex<TerminalDriver> = Mutex::new(TerminalDriver {
    write: None,
    read: None,
});

/// System information snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub cpu_count: u32,
    pub initialized: bool,
}

/// Bring the kernel core up in dependency order
///
/// Console and logging first, then physical memory, the kernel heap,
/// virtual memory, SMP, the scheduler, and IPC. Callers invoke
/// `sched::start()` separately once initial tasks exist.
pub fn init(boot_info: &BootInfo) -> KernResult<()> {
    if INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    crate::console::init();
    log_info!("kernel", "kestrel starting");

    let map = MemoryMapManager::new(boot_info.memory_map);
    if let Err(reason) = map.validate() {
        log_error!("kernel", "bad memory map: {}", reason);
        return Err(KernError::InvalidArgument);
    }
    map.log_map();

    pmm::set_memory_map(boot_info.memory_map);

    #[cfg(not(test))]
    {
        let heap_base = pmm::alloc_bytes(KERNEL_HEAP_SIZE)?;
        unsafe {
            crate::heap::init(heap_base as usize, KERNEL_HEAP_SIZE as usize);
        }
    }

    vmm::init()?;

    #[cfg(not(test))]
    crate::smp::init()?;

    sched::init();
    ipc::init();

    INITIALIZED.store(true, Ordering::SeqCst);
    log_info!("kernel", "kernel core initialized");
    Ok(())
}

/// Whether the kernel core is up
pub fn initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

// ============================================================================
// Memory
// ============================================================================

/// Allocate one mapped kernel page
pub fn alloc_page() -> KernResult<VirtAddr> {
    vmm::alloc_kernel(PAGE_SIZE as u64)
}

/// Free a page from `alloc_page`
pub fn free_page(page: VirtAddr) {
    vmm::free_kernel(page, PAGE_SIZE as u64);
}

/// Allocate `count` mapped kernel pages
pub fn alloc_pages(count: usize) -> KernResult<VirtAddr> {
    if count == 0 {
        return Err(KernError::InvalidArgument);
    }
    vmm::alloc_kernel((count * PAGE_SIZE) as u64)
}

/// Free pages from `alloc_pages`
pub fn free_pages(pages: VirtAddr, count: usize) {
    vmm::free_kernel(pages, (count * PAGE_SIZE) as u64);
}

/// Allocate at least `bytes` of mapped kernel memory
pub fn alloc_bytes(bytes: u64) -> KernResult<VirtAddr> {
    vmm::alloc_kernel(bytes)
}

/// Free memory from `alloc_bytes`
pub fn free_bytes(addr: VirtAddr, bytes: u64) {
    vmm::free_kernel(addr, bytes);
}

/// Map a physical page into the kernel address space
pub fn map_memory(vaddr: VirtAddr, paddr: PhysAddr, flags: MemFlags) -> KernResult<()> {
    vmm::map_page(crate::types::SpaceId::KERNEL, vaddr, paddr, flags)
}

/// Unmap a kernel page
pub fn unmap_memory(vaddr: VirtAddr) {
    let _ = vmm::unmap_page(crate::types::SpaceId::KERNEL, vaddr);
}

// ============================================================================
// Tasks
// ============================================================================

/// Create a task at Normal priority
pub fn create_task(entry: TaskEntry, name: &str) -> KernResult<TaskId> {
    sched::create(entry, name, TaskPriority::Normal)
}

/// Create a task on a caller-provided stack
pub fn create_thread(stack_base: VirtAddr, stack_size: usize, entry: TaskEntry) -> KernResult<TaskId> {
    sched::create_thread(stack_base, stack_size, entry)
}

/// Yield the CPU
pub fn yield_now() {
    sched::yield_now();
}

/// Set a task's priority
pub fn set_priority(id: TaskId, priority: TaskPriority) {
    sched::set_priority(id, priority);
}

/// Get a task's priority (Low for unknown ids)
pub fn get_priority(id: TaskId) -> TaskPriority {
    sched::get_priority(id)
}

// ============================================================================
// IPC
// ============================================================================

/// Send a data message, non-blocking
pub fn send_message(dest: Dest, payload: &[u8]) -> KernResult<()> {
    ipc::send(dest, payload, MessageType::Data, MsgFlags::NONBLOCKING)
}

/// Receive a message with the default timeout
pub fn receive_message(src: Dest, buf: &mut [u8]) -> KernResult<usize> {
    ipc::recv(src, buf, RECV_TIMEOUT_MS).map(|(len, _)| len)
}

/// Register a named message handler (service)
pub fn register_message_handler(name: &str, handler: TaskId) -> KernResult<()> {
    ipc::register_service(name, handler).map(|_| ())
}

/// Look up a registered service's handler
pub fn lookup_service(name: &str) -> KernResult<TaskId> {
    ipc::lookup_service(name)
}

// ============================================================================
// Driver hooks
// ============================================================================

/// Register the terminal driver capabilities; write is mandatory
pub fn register_terminal_driver(
    write: TerminalWrite,
    read: Option<TerminalRead>,
) -> KernResult<()> {
    let mut terminal = TERMINAL.lock();
    terminal.write = Some(write);
    terminal.read = read;
    log_info!("kernel", "terminal driver registered");
    Ok(())
}

/// The registered terminal write capability
pub fn terminal_write() -> Option<TerminalWrite> {
    TERMINAL.lock().write
}

/// The registered terminal read capability
pub fn terminal_read() -> Option<TerminalRead> {
    TERMINAL.lock().read
}

// ============================================================================
// Introspection
// ============================================================================

/// System information snapshot
pub fn system_info() -> SystemInfo {
    let frames = pmm::stats();
    SystemInfo {
        mem_total: frames.total_frames * PAGE_SIZE as u64,
        mem_free: frames.free_frames * PAGE_SIZE as u64,
        cpu_count: crate::smp::cpu_count() as u32,
        initialized: initialized(),
    }
}

/// Milliseconds since the scheduler tick began; monotone
pub fn uptime_ms() -> u64 {
    sched::uptime_ms()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn fake_write(_bytes: &[u8]) {}

    fn fake_read() -> Option<u8> {
        Some(b'k')
    }

    #[test]
    fn test_page_allocation_surface() {
        test_support::init_global_memory();
        let page = alloc_page().unwrap();
        assert_ne!(page, 0);
        free_page(page);

        let run = alloc_pages(3).unwrap();
        free_pages(run, 3);

        assert_eq!(alloc_pages(0).unwrap_err(), KernError::InvalidArgument);
    }

    #[test]
    fn test_map_unmap_surface() {
        test_support::init_global_memory();
        let frame = pmm::alloc(0).unwrap();
        let vaddr = 0xFFFF_8000_3F00_0000;

        map_memory(vaddr, frame, MemFlags::READ | MemFlags::WRITE).unwrap();
        assert_eq!(
            vmm::translate(crate::types::SpaceId::KERNEL, vaddr).unwrap(),
            Some(frame)
        );
        unmap_memory(vaddr);
        assert_eq!(
            vmm::translate(crate::types::SpaceId::KERNEL, vaddr).unwrap(),
            None
        );
        pmm::free(frame, 0);
    }

    #[test]
    fn test_terminal_driver_hooks() {
        register_terminal_driver(fake_write, Some(fake_read)).unwrap();
        assert!(terminal_write().is_some());
        let read = terminal_read().unwrap();
        assert_eq!(read(), Some(b'k'));
    }

    #[test]
    fn test_system_info_reflects_memory() {
        test_support::init_global_memory();
        crate::smp::init_for_tests();
        let info = system_info();
        assert!(info.mem_total > 0);
        assert!(info.mem_free <= info.mem_total);
        assert_eq!(info.cpu_count, 1);
    }

    #[test]
    fn test_uptime_is_monotone() {
        let a = uptime_ms();
        let b = uptime_ms();
        assert!(b >= a);
    }

    #[test]
    fn test_priority_sentinel() {
        sched::init();
        assert_eq!(get_priority(TaskId(0xDEAD)), TaskPriority::Low);
    }
}
