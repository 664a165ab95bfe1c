//! Implementation of [`Kernel`], the context threaded through every
//! memory-management operation.
//!
//! Frame ownership, paging statistics and the replacement policy are
//! global, mutable state. Instead of ambient singletons they live in one
//! explicit context: the simulated machine, the frame table, the process
//! table, the virtual clock and the policy RNG. Cooperative scheduling
//! makes locks unnecessary, but multi-step frame-table updates still run
//! under the interrupt-disable guard so any other process observes them
//! as one atomic step.
//!
//! 页表项和帧表互相指：PTE 里存物理页号，帧表里存 (pid, vpn) 反向指针，
//! 两边都是按下标回查、不相互持有所有权，所以放在同一个内核上下文里
//! 顺序借用即可，不需要引用计数。

use std::path::Path;

use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{div_round_up, NUM_PHYS_FRAMES, PAGE_SIZE, RANDOM_SEED};
use crate::loader::{Executable, LoadError};
use crate::machine::Machine;
use crate::mm::{FrameTable, MemorySet, PTEFlags, PageTableEntry, ReplacePolicy};
use crate::stats::Statistics;
use crate::sync::Interrupt;
use crate::task::{Pid, PidAllocator, TaskControlBlock};

/// Kernel context owning the memory subsystem's shared structures.
pub struct Kernel {
    machine: Machine,
    frame_table: FrameTable,
    policy: ReplacePolicy,
    rng: StdRng,
    pub stats: Statistics,
    pub interrupt: Interrupt,
    /// Process table indexed by pid; the frame table's owner records
    /// resolve through this.
    threads: Vec<Option<TaskControlBlock>>,
    pids: PidAllocator,
    current: Option<Pid>,
}

impl Kernel {
    pub fn new(policy: ReplacePolicy) -> Self {
        Self::with_frames(policy, NUM_PHYS_FRAMES)
    }

    /// A kernel over a machine with `num_frames` physical frames.
    pub fn with_frames(policy: ReplacePolicy, num_frames: usize) -> Self {
        Self {
            machine: Machine::new(num_frames),
            frame_table: FrameTable::new(num_frames),
            policy,
            rng: StdRng::seed_from_u64(RANDOM_SEED),
            stats: Statistics::new(),
            interrupt: Interrupt::new(),
            threads: Vec::new(),
            pids: PidAllocator::new(),
            current: None,
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn frame_table(&self) -> &FrameTable {
        &self.frame_table
    }

    pub fn policy(&self) -> ReplacePolicy {
        self.policy
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current
    }

    /// The address space of a live process; panics on a dead pid.
    pub fn space(&self, pid: Pid) -> &MemorySet {
        self.threads
            .get(pid)
            .and_then(|t| t.as_ref())
            .unwrap_or_else(|| panic!("no process with pid {}", pid))
            .space()
    }

    pub fn is_live(&self, pid: Pid) -> bool {
        matches!(self.threads.get(pid), Some(Some(_)))
    }

    /// Pids of all live processes, ascending.
    pub fn live_pids(&self) -> Vec<Pid> {
        self.threads
            .iter()
            .filter_map(|t| t.as_ref().map(|tcb| tcb.pid))
            .collect()
    }

    fn install_thread(&mut self, tcb: TaskControlBlock) {
        let pid = tcb.pid;
        if self.threads.len() <= pid {
            self.threads.resize_with(pid + 1, || None);
        }
        assert!(self.threads[pid].is_none(), "pid {} already live", pid);
        self.threads[pid] = Some(tcb);
    }

    /// Create a process from a NOFF image.
    ///
    /// With replacement disabled the space is populated eagerly: one frame
    /// per page, zeroed, with the code and initData segments copied in.
    /// Under a replacement policy nothing is resident; the space keeps the
    /// opened image and faults populate it on demand.
    pub fn spawn<P: AsRef<Path>>(&mut self, path: P) -> Result<Pid, LoadError> {
        let pid = if self.policy.demand_paging() {
            let space = MemorySet::from_path(path)?;
            let pid = self.pids.alloc();
            self.install_thread(TaskControlBlock::new(pid, space));
            pid
        } else {
            self.spawn_eager(path.as_ref())?
        };
        info!("created process {}", pid);
        Ok(pid)
    }

    fn spawn_eager(&mut self, path: &Path) -> Result<Pid, LoadError> {
        let mut exe = Executable::open(path)?;
        let header = exe.read_header()?;
        let num_pages = MemorySet::pages_for(header.user_memory_size());
        // without replacement there is no way to run anything too big
        assert!(
            num_pages + self.frame_table.allocated() <= self.frame_table.num_frames(),
            "image needs {} pages but only {} frames remain",
            num_pages,
            self.frame_table.num_frames() - self.frame_table.allocated()
        );
        debug!(
            "initializing address space, num pages {}, size {}",
            num_pages,
            num_pages * PAGE_SIZE
        );
        let mut space = MemorySet::new_sized(num_pages);
        space.exec_path = Some(path.to_path_buf());
        let pid = self.pids.alloc();
        {
            let _guard = self.interrupt.disable();
            for vpn in 0..num_pages {
                let frame = self.acquire_frame(None);
                let now = self.stats.total_ticks;
                self.frame_table.claim(frame, pid, vpn, false, now);
                // zero the whole space so uninitialised data and the
                // stack segment start clean
                self.machine.zero_frame(frame);
                space.pte_mut(vpn).map(frame);
            }
        }
        space.copy_segment(header.code, &mut exe, &mut self.machine)?;
        space.copy_segment(header.init_data, &mut exe, &mut self.machine)?;
        self.install_thread(TaskControlBlock::new(pid, space));
        Ok(pid)
    }

    /// Duplicate `parent_pid`'s address space into a new process.
    ///
    /// Shared pages are aliased, resident pages are copied into freshly
    /// acquired frames (each acquisition may evict, from this or any other
    /// process), and non-resident pages are left to demand paging. Each
    /// copied page counts as a page fault.
    pub fn fork(&mut self, parent_pid: Pid) -> Result<Pid, LoadError> {
        let demand = self.policy.demand_paging();
        let child_space = MemorySet::fork_shell(self.space(parent_pid), demand)?;
        let num_pages = child_space.num_pages();
        debug!(
            "initializing address space, num pages {}, size {}",
            num_pages,
            num_pages * PAGE_SIZE
        );
        let child_pid = self.pids.alloc();
        // the child must be visible in the process table before the first
        // frame acquisition: an eviction may pick one of its frames
        self.install_thread(TaskControlBlock::new(child_pid, child_space));
        for vpn in 0..num_pages {
            let parent_pte = self.space(parent_pid).pte(vpn);
            if parent_pte.is_shared() {
                // alias the shared frame; no new frame, no copy
                let child_pte = self.pte_mut(child_pid, vpn);
                child_pte.ppn = parent_pte.ppn;
                child_pte.flags = parent_pte.flags;
            } else if parent_pte.is_valid() {
                let parent_frame = parent_pte.ppn.unwrap();
                let _guard = self.interrupt.disable();
                let frame = self.acquire_frame(Some(parent_frame));
                let now = self.stats.total_ticks;
                self.frame_table.claim(frame, child_pid, vpn, false, now);
                // freshen the source frame too, so the next eviction does
                // not prefer the page we just forked from
                self.frame_table.refresh(parent_frame, now + 1);
                if frame != parent_frame {
                    self.machine.copy_frame(parent_frame, frame);
                }
                let child_pte = self.pte_mut(child_pid, vpn);
                child_pte.flags = parent_pte.flags;
                child_pte.ppn = Some(frame);
                self.stats.total_page_faults += 1;
            } else {
                let child_pte = self.pte_mut(child_pid, vpn);
                child_pte.flags = parent_pte.flags;
                child_pte.ppn = None;
            }
        }
        // the backup is copied last, after any fork-driven evictions have
        // finished writing the parent's buffer
        let parent_backup = self.space(parent_pid).backup.clone();
        self.threads[child_pid]
            .as_mut()
            .unwrap()
            .space_mut()
            .backup
            .copy_from_slice(&parent_backup);
        info!("forked process {} from {}", child_pid, parent_pid);
        Ok(child_pid)
    }

    /// Grow the current process by a shared region of at least `bytes`
    /// bytes and return the region's base virtual address.
    pub fn allocate_shared(&mut self, bytes: usize) -> usize {
        let pid = self.current.expect("no current process");
        let pages = div_round_up(bytes, PAGE_SIZE);
        let base_vpn = self.threads[pid].as_mut().unwrap().space_mut().grow(pages);
        {
            let _guard = self.interrupt.disable();
            for vpn in base_vpn..base_vpn + pages {
                let frame = self.acquire_frame(None);
                let now = self.stats.total_ticks;
                self.frame_table.claim(frame, pid, vpn, true, now);
                let pte = self.pte_mut(pid, vpn);
                pte.map(frame);
                pte.flags.insert(PTEFlags::S);
                pte.flags.remove(PTEFlags::R);
            }
        }
        self.stats.shared_page_faults += pages;
        self.stats.total_page_faults += pages;
        // the table moved and grew: reinstall it in the simulator
        let space = self.threads[pid].as_ref().unwrap().space();
        space.restore_on_switch(pid, &mut self.machine);
        debug!(
            "allocated {} shared pages for pid {} at {:#x}",
            pages,
            pid,
            base_vpn * PAGE_SIZE
        );
        base_vpn * PAGE_SIZE
    }

    /// Service a page fault of the current process at `bad_vaddr`: pick a
    /// frame (evicting if memory is full), refill it from the backup
    /// buffer or the executable image, and patch the page-table entry.
    /// The simulator retries the faulting instruction on `true`.
    pub fn demand_page(&mut self, bad_vaddr: usize) -> bool {
        let pid = self.current.expect("page fault with no current process");
        let vpn = bad_vaddr / PAGE_SIZE;
        assert!(
            vpn < self.space(pid).num_pages(),
            "fault outside the address space: {:#x}",
            bad_vaddr
        );
        trace!("demand paging vpn {} for pid {}", vpn, pid);
        let _guard = self.interrupt.disable();
        let frame = self.acquire_frame(None);
        self.machine.zero_frame(frame);
        if self.space(pid).pte(vpn).is_backed_up() {
            // the page was dirtied and evicted before: its authoritative
            // bytes are in the backup buffer
            let space = self.threads[pid].as_ref().unwrap().space();
            let src = space.backup_slice(vpn);
            self.machine.frame_bytes_mut(frame).copy_from_slice(src);
        } else {
            // Clean page: reload from the image, re-reading the header so
            // the endian fixup is repeated. The file offset is always
            // taken from the code segment; this only lines up because the
            // image lays out all initialised content contiguously after
            // code.inFileAddr.
            let space = self.threads[pid].as_mut().unwrap().space_mut();
            let exe = space
                .executable
                .as_mut()
                .expect("page fault with no executable to reload from");
            let header = exe
                .read_header()
                .expect("executable header no longer parses");
            let offset = header.code.in_file_addr as usize + vpn * PAGE_SIZE;
            let dst = self.machine.frame_bytes_mut(frame);
            exe.read_at(dst, offset as u64)
                .expect("executable read failed");
        }
        let now = self.stats.total_ticks;
        self.frame_table.claim(frame, pid, vpn, false, now);
        // valid again, clean, mapped; backed_up is left alone so the next
        // eviction still knows where to reload from
        self.pte_mut(pid, vpn).map(frame);
        self.stats.total_page_faults += 1;
        true
    }

    /// Tear down a process: release every resident non-shared frame and
    /// drop the space (closing its executable). Shared frames stay owned
    /// for as long as the frame table records them.
    pub fn exit(&mut self, pid: Pid) {
        let tcb = self.threads[pid].take().expect("exiting a dead pid");
        {
            let _guard = self.interrupt.disable();
            for pte in tcb.space().page_table().iter() {
                if pte.is_valid() && !pte.is_shared() {
                    self.frame_table.release(pte.ppn.unwrap());
                }
            }
        }
        if self.current == Some(pid) {
            self.current = None;
        }
        self.pids.dealloc(pid);
        info!("released address space of process {}", pid);
    }

    /// Dispatch to `pid`: run the switch hooks and install its page table.
    pub fn switch_to(&mut self, pid: Pid) {
        if let Some(old) = self.current {
            if self.is_live(old) {
                self.space(old).save_on_switch();
            }
        }
        assert!(self.is_live(pid), "switching to a dead pid {}", pid);
        self.current = Some(pid);
        let space = self.threads[pid].as_ref().unwrap().space();
        space.restore_on_switch(pid, &mut self.machine);
    }

    /// Bootstrap the current process's user registers for initial entry.
    pub fn init_cpu_registers(&mut self) {
        let pid = self.current.expect("no current process");
        let space = self.threads[pid].as_ref().unwrap().space();
        space.init_cpu_registers(&mut self.machine);
    }

    /// Simulated user store through the current page table. Crosses page
    /// boundaries, faults missing pages in and retries like the machine
    /// would, and maintains the use/dirty bits and LRU bookkeeping.
    pub fn write_virt(&mut self, vaddr: usize, data: &[u8]) {
        let mut addr = vaddr;
        let mut start = 0;
        while start < data.len() {
            let (vpn, offset) = (addr / PAGE_SIZE, addr % PAGE_SIZE);
            let chunk = (PAGE_SIZE - offset).min(data.len() - start);
            let ppn = self.ensure_resident(vpn);
            self.machine.frame_bytes_mut(ppn)[offset..offset + chunk]
                .copy_from_slice(&data[start..start + chunk]);
            self.mark_access(vpn, ppn, true);
            addr += chunk;
            start += chunk;
        }
    }

    /// Simulated user load through the current page table.
    pub fn read_virt(&mut self, vaddr: usize, buf: &mut [u8]) {
        let mut addr = vaddr;
        let mut start = 0;
        while start < buf.len() {
            let (vpn, offset) = (addr / PAGE_SIZE, addr % PAGE_SIZE);
            let chunk = (PAGE_SIZE - offset).min(buf.len() - start);
            let ppn = self.ensure_resident(vpn);
            buf[start..start + chunk]
                .copy_from_slice(&self.machine.frame_bytes(ppn)[offset..offset + chunk]);
            self.mark_access(vpn, ppn, false);
            addr += chunk;
            start += chunk;
        }
    }

    /// Translate `vpn` for the current process, faulting the page in if it
    /// is not resident.
    fn ensure_resident(&mut self, vpn: usize) -> usize {
        let pid = self.current.expect("no current process");
        let pte = self
            .space(pid)
            .page_table()
            .translate(vpn)
            .unwrap_or_else(|| panic!("virtual page {} out of range", vpn));
        if !pte.is_valid() {
            assert!(
                self.policy.demand_paging(),
                "page fault with replacement disabled"
            );
            let ok = self.demand_page(vpn * PAGE_SIZE);
            assert!(ok, "demand paging failed for vpn {}", vpn);
        }
        self.space(pid)
            .page_table()
            .translate(vpn)
            .unwrap()
            .ppn
            .unwrap()
    }

    /// The machine's side of a memory access: use/dirty bits on the PTE,
    /// LRU stamp and reference bit on the frame, one tick of virtual time.
    fn mark_access(&mut self, vpn: usize, ppn: usize, write: bool) {
        let pid = self.current.unwrap();
        let pte = self.pte_mut(pid, vpn);
        pte.flags.insert(PTEFlags::U);
        if write {
            pte.flags.insert(PTEFlags::D);
        }
        self.stats.advance(1);
        let now = self.stats.total_ticks;
        self.frame_table.touch(ppn, now);
    }

    /// Pick a physical frame for a new mapping; the caller claims and
    /// fills it. With replacement disabled this is the bump allocator;
    /// otherwise a free frame if any exists, else the policy's victim
    /// after eviction. Interrupts must already be off.
    fn acquire_frame(&mut self, hint: Option<usize>) -> usize {
        if !self.policy.demand_paging() {
            return self.frame_table.bump();
        }
        if let Some(frame) = self.frame_table.find_free() {
            return frame;
        }
        let victim = self
            .policy
            .select_victim(&mut self.frame_table, &mut self.rng, hint);
        self.evict_frame(victim);
        victim
    }

    /// Push `victim` out: write a dirty page back to its owner's backup
    /// buffer, invalidate the owning PTE, and free the frame. The bytes in
    /// main memory are left in place for the caller to overwrite.
    fn evict_frame(&mut self, victim: usize) {
        let entry = *self.frame_table.entry(victim);
        assert!(!entry.shared, "evicting shared frame {}", victim);
        let owner = entry.owner.expect("evicting a free frame");
        trace!(
            "evicting frame {} (pid {}, vpn {})",
            victim,
            owner.pid,
            owner.vpn
        );
        let space = self.threads[owner.pid]
            .as_mut()
            .expect("frame owned by a dead process")
            .space_mut();
        let pte = *space.pte_mut(owner.vpn);
        debug_assert_eq!(pte.ppn, Some(victim));
        if pte.is_dirty() && !pte.is_shared() {
            let bytes = &self.machine.main_memory[victim * PAGE_SIZE..(victim + 1) * PAGE_SIZE];
            space.backup_slice_mut(owner.vpn).copy_from_slice(bytes);
            space.pte_mut(owner.vpn).flags.insert(PTEFlags::B);
        }
        space.pte_mut(owner.vpn).invalidate();
        self.frame_table.release(victim);
    }

    fn pte_mut(&mut self, pid: Pid, vpn: usize) -> &mut PageTableEntry {
        self.threads[pid]
            .as_mut()
            .unwrap()
            .space_mut()
            .pte_mut(vpn)
    }
}
