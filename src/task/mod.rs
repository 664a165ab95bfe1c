//!Task management implementation
//!
//! Only the parts of the thread layer the memory subsystem consumes: the
//! process identifier space and the control block carrying each process's
//! address space. Scheduling itself is an external collaborator.

mod pid;
mod task;

pub use pid::{Pid, PidAllocator};
pub use task::TaskControlBlock;
