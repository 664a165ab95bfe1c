//! Implementation of [`PidAllocator`]
//!
//! Stack-style recycling allocator for process identifiers, owned by the
//! kernel context rather than a global.

/// Process identifier; also the process's slot in the process table.
pub type Pid = usize;

///Pid Allocator struct
pub struct PidAllocator {
    current: usize,
    recycled: Vec<usize>,
}

impl PidAllocator {
    ///Create an empty `PidAllocator`
    pub fn new() -> Self {
        PidAllocator {
            current: 0,
            recycled: Vec::new(),
        }
    }
    ///Allocate a pid
    pub fn alloc(&mut self) -> Pid {
        if let Some(pid) = self.recycled.pop() {
            pid
        } else {
            self.current += 1;
            self.current - 1
        }
    }
    ///Recycle a pid
    pub fn dealloc(&mut self, pid: Pid) {
        assert!(pid < self.current);
        assert!(
            !self.recycled.iter().any(|ppid| *ppid == pid),
            "pid {} has been deallocated!",
            pid
        );
        self.recycled.push(pid);
    }
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_in_order_and_recycles() {
        let mut pids = PidAllocator::new();
        assert_eq!(pids.alloc(), 0);
        assert_eq!(pids.alloc(), 1);
        assert_eq!(pids.alloc(), 2);
        pids.dealloc(1);
        assert_eq!(pids.alloc(), 1);
        assert_eq!(pids.alloc(), 3);
    }

    #[test]
    #[should_panic(expected = "has been deallocated")]
    fn double_free_is_fatal() {
        let mut pids = PidAllocator::new();
        pids.alloc();
        pids.dealloc(0);
        pids.dealloc(0);
    }
}
