//! Task records
//!
//! The task table is a fixed array of these records; the scheduler
//! threads its queues through the embedded link pairs. Saved machine
//! state lives on the task's kernel stack, so the record only parks
//! the stack pointer between runs.

use heapless::String;

use super::queue::QueueLink;
use crate::types::TaskId;

/// Maximum length of a task name
pub const TASK_NAME_LEN: usize = 32;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Sleeping,
    Terminated,
}

/// Task priorities, lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Scheduling policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    Fifo,
    RoundRobin,
}

/// Task entry function
pub type TaskEntry = fn();

/// One slot of the task table
#[derive(Debug)]
pub struct Task {
    /// Whether this slot holds a live task
    pub occupied: bool,
    pub id: TaskId,
    pub name: String<TASK_NAME_LEN>,
    pub state: TaskState,
    pub priority: TaskPriority,
    pub policy: SchedPolicy,

    /// Nominal budget granted on each dispatch, in ticks
    pub time_slice: u64,
    /// Budget remaining in the current dispatch
    pub time_remaining: u64,

    /// Kernel stack base (virtual) and size; base of 0 means none
    pub stack_base: u64,
    pub stack_size: usize,
    /// Whether the scheduler allocated (and must free) the stack
    pub stack_owned: bool,
    /// Parked stack pointer while not running
    pub saved_rsp: u64,

    /// Entry function, consumed by the first dispatch
    pub entry: Option<TaskEntry>,

    /// Tick timestamps and accounting
    pub created_at: u64,
    pub last_scheduled: u64,
    pub cpu_time: u64,
    /// Absolute tick at which a Sleeping task wakes
    pub wake_at: u64,

    /// Link pairs for the ready, blocked, and sleeping queues
    pub links: [QueueLink; 3],
}

impl Task {
    /// An unoccupied slot
    pub const fn vacant() -> Self {
        Self {
            occupied: false,
            id: TaskId(0),
            name: String::new(),
            state: TaskState::Terminated,
            priority: TaskPriority::Normal,
            policy: SchedPolicy::RoundRobin,
            time_slice: 0,
            time_remaining: 0,
            stack_base: 0,
            stack_size: 0,
            stack_owned: false,
            saved_rsp: 0,
            entry: None,
            created_at: 0,
            last_scheduled: 0,
            cpu_time: 0,
            wake_at: 0,
            links: [QueueLink::new(); 3],
        }
    }

    /// Reset a slot to vacant, dropping all task identity
    pub fn clear(&mut self) {
        *self = Self::vacant();
    }

    /// Number of queues this task is currently linked on
    pub fn queue_memberships(&self) -> usize {
        self.links.iter().filter(|l| l.linked).count()
    }
}
