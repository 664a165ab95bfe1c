//! Implementation of [`MemorySet`], the per-process address space.
//!
//! A memory set is a flat page table plus the backup buffer holding the
//! authoritative bytes of pages that were dirtied and later evicted, and
//! (in demand-paging mode) the opened executable the space reloads clean
//! pages from. Frame allocation, fork copying and fault service need the
//! frame table and the machine, so they live on the kernel context; this
//! module owns the per-space state and the pure parts of its lifecycle.

use std::path::{Path, PathBuf};

use log::debug;

use super::page_table::{PageTable, PageTableEntry};
use crate::config::{div_round_up, PAGE_SIZE, USER_STACK_SIZE};
use crate::loader::{Executable, LoadError, Segment};
use crate::machine::{Machine, PageTableToken, NEXT_PC_REG, NUM_TOTAL_REGS, PC_REG, STACK_REG};
use crate::task::Pid;

/// memory set structure, controls the virtual-memory space of one process
pub struct MemorySet {
    pub(crate) page_table: PageTable,
    /// `num_pages * PAGE_SIZE` bytes; slice `vpn` holds the last dirty
    /// content of that page whenever its PTE says `backed_up`.
    pub(crate) backup: Vec<u8>,
    /// Where the image came from, kept so fork can re-open it.
    pub(crate) exec_path: Option<PathBuf>,
    /// Open image for demand reloads; `None` when the space was populated
    /// eagerly and will never fault.
    pub(crate) executable: Option<Executable>,
}

impl MemorySet {
    /// An empty space of `num_pages` unmapped pages with a zeroed backup.
    pub(crate) fn new_sized(num_pages: usize) -> Self {
        Self {
            page_table: PageTable::new(num_pages),
            backup: vec![0; num_pages * PAGE_SIZE],
            exec_path: None,
            executable: None,
        }
    }

    /// Pages needed for an image: segments plus the user stack, rounded up.
    pub(crate) fn pages_for(user_memory_size: usize) -> usize {
        div_round_up(user_memory_size + USER_STACK_SIZE, PAGE_SIZE)
    }

    /// Late-bind construction: open the image, decode the header (with the
    /// endian fixup), size the table and backup, and leave every page
    /// unmapped. No frames are claimed; faults populate the space later.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let mut executable = Executable::open(path.as_ref())?;
        let header = executable.read_header()?;
        let num_pages = Self::pages_for(header.user_memory_size());
        debug!(
            "initializing address space, num pages {}, size {}",
            num_pages,
            num_pages * PAGE_SIZE
        );
        let mut space = Self::new_sized(num_pages);
        space.exec_path = Some(path.as_ref().to_path_buf());
        space.executable = Some(executable);
        Ok(space)
    }

    /// Shell of a forked child: the parent's geometry with every page
    /// unmapped. In demand-paging mode the child re-opens the parent's
    /// executable so it can reload clean pages itself. The kernel fills
    /// the page table afterwards, one page at a time through the frame
    /// table, and copies the parent's backup buffer once that is done.
    pub(crate) fn fork_shell(parent: &Self, reopen_executable: bool) -> Result<Self, LoadError> {
        let mut space = Self::new_sized(parent.num_pages());
        space.exec_path = parent.exec_path.clone();
        if reopen_executable {
            let path = parent
                .exec_path
                .as_ref()
                .expect("forking a demand-paged space with no executable path");
            space.executable = Some(Executable::open(path)?);
        }
        Ok(space)
    }

    pub fn num_pages(&self) -> usize {
        self.page_table.len()
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// Copy out the entry for `vpn`.
    pub fn pte(&self, vpn: usize) -> PageTableEntry {
        *self.page_table.entry(vpn)
    }

    pub(crate) fn pte_mut(&mut self, vpn: usize) -> &mut PageTableEntry {
        self.page_table.entry_mut(vpn)
    }

    pub fn exec_path(&self) -> Option<&Path> {
        self.exec_path.as_deref()
    }

    /// The backup bytes for `vpn`.
    pub fn backup_slice(&self, vpn: usize) -> &[u8] {
        &self.backup[vpn * PAGE_SIZE..(vpn + 1) * PAGE_SIZE]
    }

    pub(crate) fn backup_slice_mut(&mut self, vpn: usize) -> &mut [u8] {
        &mut self.backup[vpn * PAGE_SIZE..(vpn + 1) * PAGE_SIZE]
    }

    /// Grow the space by `pages` unmapped pages for a new shared region,
    /// preserving existing entries; the backup grows zero-filled alongside.
    /// Returns the first new vpn.
    pub(crate) fn grow(&mut self, pages: usize) -> usize {
        let base = self.num_pages();
        for _ in 0..pages {
            self.page_table.push_page();
        }
        self.backup.resize(self.num_pages() * PAGE_SIZE, 0);
        base
    }

    /// Copy one segment of the image into the frames this table maps,
    /// page by page through the virtual-to-physical translation.
    pub(crate) fn copy_segment(
        &self,
        seg: Segment,
        exe: &mut Executable,
        machine: &mut Machine,
    ) -> Result<(), LoadError> {
        if seg.size == 0 {
            return Ok(());
        }
        debug!(
            "initializing segment at {:#x}, size {}",
            seg.virtual_addr, seg.size
        );
        let size = seg.size as usize;
        let mut copied = 0;
        // 按页循环：查页表找到该虚拟页被映射到的物理页帧，再把文件里的
        // 这一段字节拷贝进去，段不要求按页对齐
        while copied < size {
            let vaddr = seg.virtual_addr as usize + copied;
            let (vpn, offset) = (vaddr / PAGE_SIZE, vaddr % PAGE_SIZE);
            let chunk = (PAGE_SIZE - offset).min(size - copied);
            let ppn = self
                .page_table
                .translate(vpn)
                .and_then(|pte| pte.ppn)
                .expect("segment copy into an unmapped page");
            let dst = &mut machine.frame_bytes_mut(ppn)[offset..offset + chunk];
            exe.read_at(dst, (seg.in_file_addr as usize + copied) as u64)?;
            copied += chunk;
        }
        Ok(())
    }

    /// Set the initial values for the user-level register set: everything
    /// zeroed, PC at the image entry, NextPC one instruction later for the
    /// branch delay slot, and the stack pointer just under the top of the
    /// space (minus a little so the first push cannot run off the end).
    pub fn init_cpu_registers(&self, machine: &mut Machine) {
        for reg in 0..NUM_TOTAL_REGS {
            machine.write_register(reg, 0);
        }
        machine.write_register(PC_REG, 0);
        machine.write_register(NEXT_PC_REG, 4);
        let sp = self.num_pages() * PAGE_SIZE - 16;
        machine.write_register(STACK_REG, sp as i32);
        debug!("initializing stack register to {}", sp);
    }

    /// On a context switch out, nothing: the space keeps no private
    /// machine state.
    pub fn save_on_switch(&self) {}

    /// On a context switch in, tell the machine where this space's page
    /// table is and how long it is.
    pub fn restore_on_switch(&self, pid: Pid, machine: &mut Machine) {
        machine.install_page_table(PageTableToken {
            pid,
            num_pages: self.num_pages(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;

    #[test]
    fn sizing_rounds_up_to_pages() {
        // 100 + 50 + 30 bytes of segments + 256 of stack = 436 -> 4 pages
        assert_eq!(MemorySet::pages_for(180), 4);
        assert_eq!(MemorySet::pages_for(0), 2);
    }

    #[test]
    fn register_bootstrap() {
        let space = MemorySet::new_sized(4);
        let mut machine = Machine::new(4);
        machine.write_register(3, 77);
        space.init_cpu_registers(&mut machine);
        assert_eq!(machine.read_register(3), 0);
        assert_eq!(machine.read_register(PC_REG), 0);
        assert_eq!(machine.read_register(NEXT_PC_REG), 4);
        assert_eq!(machine.read_register(STACK_REG), (4 * PAGE_SIZE - 16) as i32);
    }

    #[test]
    fn grow_appends_unmapped_pages() {
        let mut space = MemorySet::new_sized(2);
        space.backup_slice_mut(1)[0] = 0x5a;
        let base = space.grow(3);
        assert_eq!(base, 2);
        assert_eq!(space.num_pages(), 5);
        assert_eq!(space.backup.len(), 5 * PAGE_SIZE);
        assert_eq!(space.backup_slice(1)[0], 0x5a);
        assert!(!space.pte(4).is_valid());
    }

    #[test]
    fn restore_installs_table() {
        let space = MemorySet::new_sized(3);
        let mut machine = Machine::new(4);
        space.save_on_switch();
        space.restore_on_switch(9, &mut machine);
        let token = machine.installed_page_table().unwrap();
        assert_eq!(token.pid, 9);
        assert_eq!(token.num_pages, 3);
    }
}
