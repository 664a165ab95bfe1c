//! Virtual-memory subsystem of a pedagogical OS kernel running user
//! programs on a simulated MIPS-like machine.
//!
//! The crate loads NOFF executables into per-process address spaces,
//! maintains page tables over the simulator's physical frames, forks with
//! copy semantics and shared regions, services page faults by demand
//! paging from the image or a per-process backup buffer, and picks victim
//! frames under a pluggable replacement policy.
//!
//! All global mutable state (frame table, statistics, policy, process
//! table, the machine itself) lives in a [`kernel::Kernel`] context
//! threaded through the operations; the simulator runs single-threaded
//! and cooperative, so the only synchronization is the interrupt-disable
//! scope around multi-step frame-table updates.

pub mod config;
pub mod kernel;
pub mod loader;
pub mod machine;
pub mod mm;
pub mod stats;
pub mod sync;
pub mod task;

pub use kernel::Kernel;
pub use loader::{Executable, LoadError, NoffHeader, Segment, NOFF_MAGIC};
pub use machine::{Machine, NEXT_PC_REG, NUM_TOTAL_REGS, PC_REG, STACK_REG};
pub use mm::{MemorySet, PTEFlags, PageTable, PageTableEntry, ReplacePolicy};
