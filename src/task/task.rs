//!Implementation of [`TaskControlBlock`]
//!
//! The thread layer proper (contexts, scheduling, wait queues) lives
//! outside this subsystem; what the memory code needs from it is the
//! pid-indexed table of control blocks and, per block, the owned address
//! space the frame table's back-pointers resolve into.

use crate::mm::MemorySet;

use super::Pid;

/// The slice of a task control block the memory subsystem consumes.
pub struct TaskControlBlock {
    pub pid: Pid,
    pub space: MemorySet,
}

impl TaskControlBlock {
    pub fn new(pid: Pid, space: MemorySet) -> Self {
        Self { pid, space }
    }

    pub fn space(&self) -> &MemorySet {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut MemorySet {
        &mut self.space
    }
}
