//! Inter-task message passing
//!
//! Bounded per-destination message queues plus a named-service
//! registry. Every message occupies exactly one frame from the
//! physical allocator: the frame is allocated at send, owned by the
//! destination queue while linked, and freed at receive. Payloads are
//! capped at 1 KiB so a message always fits its frame.
//!
//! Destinations are tagged: `Dest::System` is the kernel-wide queue
//! (capacity 1024); `Dest::Queue` addresses a created queue or a
//! service queue. Within one destination, dequeue order equals
//! enqueue order; across destinations there is no ordering.
//!
//! Blocking paths integrate with the scheduler instead of spinning: a
//! blocked receiver parks on the queue's waiter list and sleeps until
//! the next send wakes it or its deadline passes; a blocking sender
//! parks likewise until a receive makes room. Locking is one lock per
//! queue plus one for the registry, never held across a suspension.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use spin::Mutex;

use crate::error::{KernError, KernResult};
use crate::pmm::{self, PAGE_SIZE};
use crate::{log_debug, log_info, log_warn};
use crate::sched;
use crate::types::{QueueId, TaskId};

/// Maximum message payload in bytes
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Default capacity of created and service queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Capacity of the system queue
pub const SYSTEM_QUEUE_CAPACITY: usize = 1024;

/// Maximum number of registered services
pub const MAX_SERVICES: usize = 64;

/// Maximum service name length
pub const SERVICE_NAME_LEN: usize = 64;

/// Message type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Data = 0x01,
    System = 0x02,
    Terminal = 0x03,
    Service = 0x04,
}

/// Message flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgFlags(u32);

impl MsgFlags {
    pub const BLOCKING: Self = Self(0x01);
    pub const NONBLOCKING: Self = Self(0x02);
    pub const URGENT: Self = Self(0x04);

    /// Empty flag set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Whether all of `other` is set
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// A message destination (or receive source)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    /// The kernel-wide system queue
    System,
    /// A created or service queue
    Queue(QueueId),
}

/// A message, laid out to fit one frame
#[repr(C)]
pub struct Message {
    pub payload: [u8; MAX_MESSAGE_SIZE],
    pub len: u32,
    pub mtype: MessageType,
    pub flags: MsgFlags,
    pub sender: TaskId,
    pub timestamp: u64,
}

const _: () = assert!(core::mem::size_of::<Message>() <= PAGE_SIZE);

/// Owner tag of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOwner {
    System,
    Task(TaskId),
    Service,
}

/// A message frame owned by a queue
struct MessageFrame(NonNull<Message>);

unsafe impl Send for MessageFrame {}

impl MessageFrame {
    /// Allocate a frame and construct the message in place
    fn create(
        payload: &[u8],
        mtype: MessageType,
        flags: MsgFlags,
        sender: TaskId,
        timestamp: u64,
    ) -> KernResult<Self> {
        let frame = pmm::alloc(0)?;
        let ptr = frame as *mut Message;
        unsafe {
            core::ptr::write_bytes(ptr as *mut u8, 0, core::mem::size_of::<Message>());
            let msg = &mut *ptr;
            msg.payload[..payload.len()].copy_from_slice(payload);
            msg.len = payload.len() as u32;
            msg.mtype = mtype;
            msg.flags = flags;
            msg.sender = sender;
            msg.timestamp = timestamp;
        }
        Ok(Self(unsafe { NonNull::new_unchecked(ptr) }))
    }

    fn message(&self) -> &Message {
        unsafe { self.0.as_ref() }
    }

    /// Return the frame to the physical allocator
    fn release(self) {
        pmm::free(self.0.as_ptr() as u64, 0);
    }
}

/// A bounded FIFO of message frames
pub struct MessageQueue {
    owner: QueueOwner,
    capacity: usize,
    messages: VecDeque<MessageFrame>,
    recv_waiters: VecDeque<TaskId>,
    send_waiters: VecDeque<TaskId>,
}

impl MessageQueue {
    fn new(owner: QueueOwner, capacity: usize) -> Self {
        Self {
            owner,
            capacity,
            messages: VecDeque::new(),
            recv_waiters: VecDeque::new(),
            send_waiters: VecDeque::new(),
        }
    }

    /// Owner tag
    pub fn owner(&self) -> QueueOwner {
        self.owner
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether the queue is at capacity
    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.capacity
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a frame; on success returns the receiver to wake, if any
    fn push(&mut self, frame: MessageFrame) -> Result<Option<TaskId>, MessageFrame> {
        if self.is_full() {
            return Err(frame);
        }
        self.messages.push_back(frame);
        Ok(self.recv_waiters.pop_front())
    }

    /// Dequeue the head if it fits `buf_len`; on success also returns
    /// the sender to wake, if any
    fn pop(&mut self, buf_len: usize) -> KernResult<(MessageFrame, Option<TaskId>)> {
        let head = self.messages.front().ok_or(KernError::WouldBlock)?;
        if head.message().len as usize > buf_len {
            return Err(KernError::BufferTooSmall);
        }
        let frame = self.messages.pop_front().ok_or(KernError::WouldBlock)?;
        Ok((frame, self.send_waiters.pop_front()))
    }

    /// Drop every queued message, freeing the frames; waiters to wake
    /// are returned to the caller
    fn drain(&mut self) -> Vec<TaskId> {
        for frame in self.messages.drain(..) {
            frame.release();
        }
        let mut waiters: Vec<TaskId> = self.recv_waiters.drain(..).collect();
        waiters.extend(self.send_waiters.drain(..));
        waiters
    }

    fn remove_recv_waiter(&mut self, id: TaskId) {
        self.recv_waiters.retain(|&w| w != id);
    }

    fn remove_send_waiter(&mut self, id: TaskId) {
        self.send_waiters.retain(|&w| w != id);
    }
}

/// One entry of the service registry
pub struct ServiceEntry {
    name: heapless::String<SERVICE_NAME_LEN>,
    handler: TaskId,
    queue: QueueId,
}

impl ServiceEntry {
    /// Registered handler task
    pub fn handler(&self) -> TaskId {
        self.handler
    }

    /// Dedicated queue id
    pub fn queue(&self) -> QueueId {
        self.queue
    }
}

/// IPC registry: queue slab plus the named-service table
pub struct Ipc {
    system: Arc<Mutex<MessageQueue>>,
    queues: BTreeMap<QueueId, Arc<Mutex<MessageQueue>>>,
    services: Vec<ServiceEntry>,
    next_queue_id: u64,
}

impl Ipc {
    /// Create a registry with an empty system queue
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(MessageQueue::new(
                QueueOwner::System,
                SYSTEM_QUEUE_CAPACITY,
            ))),
            queues: BTreeMap::new(),
            services: Vec::new(),
            next_queue_id: 1,
        }
    }

    /// Resolve a destination to its queue
    pub fn resolve(&self, dest: Dest) -> KernResult<Arc<Mutex<MessageQueue>>> {
        match dest {
            Dest::System => Ok(Arc::clone(&self.system)),
            Dest::Queue(id) => self.queues.get(&id).cloned().ok_or(KernError::NotFound),
        }
    }

    /// Create a bounded queue for the given owner
    pub fn create_queue(&mut self, owner: QueueOwner, capacity: usize) -> QueueId {
        let id = QueueId(self.next_queue_id);
        self.next_queue_id += 1;
        self.queues.insert(
            id,
            Arc::new(Mutex::new(MessageQueue::new(
                owner,
                capacity.max(1).min(SYSTEM_QUEUE_CAPACITY),
            ))),
        );
        log_debug!("ipc", "created queue {:?} (capacity {})", id, capacity);
        id
    }

    /// Destroy a queue, dropping queued messages
    ///
    /// Returns the tasks that were waiting on it so the caller can
    /// wake them outside the registry lock.
    pub fn destroy_queue(&mut self, id: QueueId) -> KernResult<Vec<TaskId>> {
        let queue = self.queues.remove(&id).ok_or(KernError::NotFound)?;
        let waiters = queue.lock().drain();
        log_debug!("ipc", "destroyed queue {:?}", id);
        Ok(waiters)
    }

    /// Register a named service with a dedicated queue
    pub fn register_service(
        &mut self,
        name: &str,
        handler: TaskId,
        capacity: usize,
    ) -> KernResult<QueueId> {
        if name.is_empty() || name.len() > SERVICE_NAME_LEN {
            return Err(KernError::InvalidArgument);
        }
        if self.services.iter().any(|s| s.name.as_str() == name) {
            log_warn!("ipc", "service '{}' already registered", name);
            return Err(KernError::AlreadyExists);
        }
        if self.services.len() >= MAX_SERVICES {
            log_warn!("ipc", "service registry full");
            return Err(KernError::OutOfMemory);
        }

        let queue = self.create_queue(QueueOwner::Service, capacity);
        let mut entry_name = heapless::String::new();
        let _ = entry_name.push_str(name);
        self.services.push(ServiceEntry {
            name: entry_name,
            handler,
            queue,
        });

        log_info!("ipc", "registered service '{}'", name);
        Ok(queue)
    }

    /// Find a registered service
    pub fn lookup_service(&self, name: &str) -> KernResult<&ServiceEntry> {
        self.services
            .iter()
            .find(|s| s.name.as_str() == name)
            .ok_or(KernError::NotFound)
    }

    /// Remove a service and destroy its queue
    pub fn unregister_service(&mut self, name: &str) -> KernResult<Vec<TaskId>> {
        let pos = self
            .services
            .iter()
            .position(|s| s.name.as_str() == name)
            .ok_or(KernError::NotFound)?;
        let entry = self.services.remove(pos);
        let waiters = self.destroy_queue(entry.queue)?;
        log_info!("ipc", "unregistered service '{}'", name);
        Ok(waiters)
    }

    /// Number of registered services
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Non-blocking send to a destination
    pub fn try_send(
        &self,
        dest: Dest,
        payload: &[u8],
        mtype: MessageType,
        flags: MsgFlags,
    ) -> KernResult<()> {
        if payload.len() > MAX_MESSAGE_SIZE {
            log_warn!("ipc", "message too large: {} bytes", payload.len());
            return Err(KernError::OutOfRange);
        }
        if payload.is_empty() {
            return Err(KernError::InvalidArgument);
        }

        let queue = self.resolve(dest)?;
        let sender = sched::current().unwrap_or(TaskId::NONE);
        let frame = MessageFrame::create(payload, mtype, flags, sender, sched::uptime_ms())?;

        let woke = {
            let mut q = queue.lock();
            match q.push(frame) {
                Ok(waiter) => waiter,
                Err(frame) => {
                    frame.release();
                    return Err(KernError::QueueFull);
                }
            }
        };
        if let Some(waiter) = woke {
            sched::wake(waiter);
        }
        Ok(())
    }

    /// Non-blocking receive from a source
    pub fn try_recv(&self, src: Dest, buf: &mut [u8]) -> KernResult<(usize, MessageType)> {
        let queue = self.resolve(src)?;

        let (frame, woke) = {
            let mut q = queue.lock();
            q.pop(buf.len())?
        };
        if let Some(waiter) = woke {
            sched::wake(waiter);
        }

        let msg = frame.message();
        let len = msg.len as usize;
        buf[..len].copy_from_slice(&msg.payload[..len]);
        let mtype = msg.mtype;
        frame.release();
        Ok((len, mtype))
    }

    /// Broadcast non-blocking to the system queue and every service
    /// queue; full queues are skipped. Returns the delivery count.
    pub fn broadcast(&self, payload: &[u8], mtype: MessageType) -> usize {
        let mut delivered = 0;

        if self
            .try_send(Dest::System, payload, mtype, MsgFlags::NONBLOCKING)
            .is_ok()
        {
            delivered += 1;
        }

        for entry in &self.services {
            if self
                .try_send(Dest::Queue(entry.queue), payload, mtype, MsgFlags::NONBLOCKING)
                .is_ok()
            {
                delivered += 1;
            }
        }

        delivered
    }

    /// Number of messages pending at a destination
    pub fn queue_len(&self, dest: Dest) -> usize {
        self.resolve(dest).map(|q| q.lock().len()).unwrap_or(0)
    }
}

impl Default for Ipc {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Global registry and blocking paths
// ============================================================================

static IPC: Mutex<Option<Ipc>> = Mutex::new(None);

/// Run a closure against the global registry
fn with_ipc<R>(f: impl FnOnce(&mut Ipc) -> R) -> KernResult<R> {
    let mut guard = IPC.lock();
    guard.as_mut().map(f).ok_or(KernError::NotInitialized)
}

/// Initialize the IPC subsystem
pub fn init() {
    let mut guard = IPC.lock();
    if guard.is_none() {
        *guard = Some(Ipc::new());
        log_info!("ipc", "ipc initialized (system queue capacity {})", SYSTEM_QUEUE_CAPACITY);
    }
}

/// Create a queue
pub fn create_queue(owner: QueueOwner, capacity: usize) -> KernResult<QueueId> {
    with_ipc(|ipc| ipc.create_queue(owner, capacity))
}

/// Destroy a queue and wake anyone parked on it
pub fn destroy_queue(id: QueueId) -> KernResult<()> {
    let waiters = with_ipc(|ipc| ipc.destroy_queue(id))??;
    for waiter in waiters {
        sched::wake(waiter);
    }
    Ok(())
}

/// Send a message
///
/// With `MsgFlags::BLOCKING` and a running scheduler, a full queue
/// parks the sender until a receive makes room; otherwise a full
/// queue reports QueueFull.
pub fn send(dest: Dest, payload: &[u8], mtype: MessageType, flags: MsgFlags) -> KernResult<()> {
    loop {
        let queue = with_ipc(|ipc| ipc.resolve(dest))??;
        let result = with_ipc(|ipc| ipc.try_send(dest, payload, mtype, flags))?;

        match result {
            Err(KernError::QueueFull)
                if flags.contains(MsgFlags::BLOCKING) && sched::is_running() =>
            {
                let me = match sched::current() {
                    Some(id) => id,
                    None => return Err(KernError::QueueFull),
                };
                queue.lock().send_waiters.push_back(me);
                sched::block("ipc send: queue full");
                // Woken by a receive or queue destruction; clear any
                // stale registration and retry.
                queue.lock().remove_send_waiter(me);
            }
            other => return other,
        }
    }
}

/// Receive a message
///
/// A zero timeout polls: an empty queue reports WouldBlock
/// immediately. A non-zero timeout parks the caller on the queue's
/// waiter list; it is woken by the next send or by the timer at the
/// deadline, whichever comes first.
pub fn recv(src: Dest, buf: &mut [u8], timeout_ms: u64) -> KernResult<(usize, MessageType)> {
    let deadline = sched::uptime_ms().saturating_add(timeout_ms);

    loop {
        let queue = with_ipc(|ipc| ipc.resolve(src))??;
        let result = with_ipc(|ipc| ipc.try_recv(src, buf))?;

        match result {
            Err(KernError::WouldBlock) if timeout_ms > 0 => {
                if !sched::is_running() {
                    return Err(KernError::Timeout);
                }
                let now = sched::uptime_ms();
                if now >= deadline {
                    return Err(KernError::Timeout);
                }
                let me = match sched::current() {
                    Some(id) => id,
                    None => return Err(KernError::Timeout),
                };
                queue.lock().recv_waiters.push_back(me);
                sched::sleep_ms(deadline - now);
                queue.lock().remove_recv_waiter(me);
            }
            other => return other,
        }
    }
}

/// Register a named service with the default queue capacity
pub fn register_service(name: &str, handler: TaskId) -> KernResult<QueueId> {
    register_service_with_capacity(name, handler, DEFAULT_QUEUE_CAPACITY)
}

/// Register a named service with an explicit queue capacity
pub fn register_service_with_capacity(
    name: &str,
    handler: TaskId,
    capacity: usize,
) -> KernResult<QueueId> {
    with_ipc(|ipc| ipc.register_service(name, handler, capacity))?
}

/// Look up a service's handler task
pub fn lookup_service(name: &str) -> KernResult<TaskId> {
    with_ipc(|ipc| ipc.lookup_service(name).map(|s| s.handler()))?
}

/// Look up a service's queue
pub fn lookup_service_queue(name: &str) -> KernResult<QueueId> {
    with_ipc(|ipc| ipc.lookup_service(name).map(|s| s.queue()))?
}

/// Unregister a service, dropping its queued messages
pub fn unregister_service(name: &str) -> KernResult<()> {
    let waiters = with_ipc(|ipc| ipc.unregister_service(name))??;
    for waiter in waiters {
        sched::wake(waiter);
    }
    Ok(())
}

/// Broadcast to the system queue and every service queue
pub fn broadcast(payload: &[u8], mtype: MessageType) -> usize {
    with_ipc(|ipc| ipc.broadcast(payload, mtype)).unwrap_or(0)
}

/// Messages pending at a destination
pub fn queue_len(dest: Dest) -> usize {
    with_ipc(|ipc| ipc.queue_len(dest)).unwrap_or(0)
}
