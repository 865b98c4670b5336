//! Processes: the schedulable unit of execution
//!
//! A `Process` owns its register file, its address space and, for
//! file-backed processes, the path it was loaded from. The three ways of
//! creating one differ only in where the entry point comes from:
//!
//! - `create`: blank memory, entry at the first user page
//! - `create_from_file`: an ELF image read through a `FileSystem`
//! - `create_with_entry`: a caller-supplied address (kernel-resident code)
//!
//! Every constructor either returns a complete process or has already
//! released everything it claimed.

pub mod address_space;
pub mod error;
pub mod image;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::arm::{Mmu, ProcessorMode, RegisterFile};
use crate::fs::FileSystem;
use crate::memory::{FrameAllocator, PhysicalMemory, VirtAddr};

pub use address_space::{AddressSpace, Placement, TableWindow};
pub use error::{ProcessError, Result};
pub use image::{ElfLoader, ExecutableLoader, FunctionSymbol, LoadError, LoadedImage};

/// Next process id; ids are never reused within a boot
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_PID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// Scheduling priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Waiting in the ready queue
    Ready,
    /// On the CPU
    Running,
    /// Removed from scheduling, awaiting deletion
    Terminated,
}

/// How the process's code got into memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Blank,
    File { path: String },
    Entry,
}

/// Collaborators needed to claim and release memory
pub struct MemoryContext<'a> {
    pub frames: &'a mut dyn FrameAllocator,
    pub memory: &'a mut dyn PhysicalMemory,
    pub mmu: &'a mut dyn Mmu,
}

/// Collaborators needed to load an executable
pub struct LoadContext<'a> {
    pub fs: &'a mut dyn FileSystem,
    pub loader: &'a dyn ExecutableLoader,
}

/// Copy `s` into the heap, failing cleanly if the heap is exhausted
fn owned_str(s: &str) -> Result<String> {
    let mut owned = String::new();
    if owned.try_reserve_exact(s.len()).is_err() {
        log::warn!("[process] no heap for {} byte string", s.len());
        return Err(ProcessError::OutOfMemory);
    }
    owned.push_str(s);
    Ok(owned)
}

/// Process descriptor
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    name: String,
    origin: Origin,
    priority: Priority,
    state: ProcessState,
    /// Total time on the CPU
    elapsed_ms: u32,
    /// Time on the CPU since the last activation
    slice_ms: u32,
    started: bool,
    entry: VirtAddr,
    registers: RegisterFile,
    space: AddressSpace,
    functions: Vec<FunctionSymbol>,
}

impl Process {
    fn build(
        name: &str,
        origin: Origin,
        mode: ProcessorMode,
        placement: &Placement,
        ctx: &mut MemoryContext<'_>,
    ) -> Result<Self> {
        let name = owned_str(name)?;
        let pid = Pid::next();
        let space = AddressSpace::build(pid, placement, ctx)?;

        let mut registers = RegisterFile::new();
        registers.set_stack_top(space.stack_top().as_u32());
        registers.set_mode(mode);
        registers.pc = space.user_base().as_u32();

        Ok(Self {
            pid,
            name,
            origin,
            priority: Priority::default(),
            state: ProcessState::Ready,
            elapsed_ms: 0,
            slice_ms: 0,
            started: false,
            entry: space.user_base(),
            registers,
            space,
            functions: Vec::new(),
        })
    }

    /// Process with blank memory, entry at its first user page
    pub fn create(name: &str, placement: &Placement, ctx: &mut MemoryContext<'_>) -> Result<Self> {
        let process = Self::build(name, Origin::Blank, ProcessorMode::User, placement, ctx)?;
        log::info!("[process] created '{}' ({})", process.name, process.pid);
        Ok(process)
    }

    /// Process running the executable at `filename`
    pub fn create_from_file(
        filename: &str,
        name: &str,
        placement: &Placement,
        ctx: &mut MemoryContext<'_>,
        load: &mut LoadContext<'_>,
    ) -> Result<Self> {
        let origin = Origin::File {
            path: owned_str(filename)?,
        };
        let mut process = Self::build(name, origin, ProcessorMode::User, placement, ctx)?;

        match process.load(filename, ctx.memory, load) {
            Ok(loaded) => {
                let entry = process.space.user_base().offset(loaded.entry_offset);
                process.entry = entry;
                process.registers.pc = entry.as_u32();
                process.functions = loaded.functions;
                log::info!(
                    "[process] loaded '{}' from {} ({}), entry {:#x}, {} functions",
                    process.name,
                    filename,
                    process.pid,
                    entry,
                    process.functions.len()
                );
                Ok(process)
            }
            Err(err) => {
                log::warn!("[process] cannot load {}: {}", filename, err);
                process.delete(ctx);
                Err(err)
            }
        }
    }

    /// Process starting at `entry`, an address already mapped for it
    pub fn create_with_entry(
        entry: VirtAddr,
        name: &str,
        placement: &Placement,
        ctx: &mut MemoryContext<'_>,
    ) -> Result<Self> {
        let mut process = Self::build(name, Origin::Entry, ProcessorMode::System, placement, ctx)?;
        process.entry = entry;
        process.registers.pc = entry.as_u32();
        log::info!("[process] created '{}' ({}) at {:#x}", process.name, process.pid, entry);
        Ok(process)
    }

    fn load(
        &self,
        filename: &str,
        memory: &mut dyn PhysicalMemory,
        load: &mut LoadContext<'_>,
    ) -> Result<LoadedImage> {
        let image = image::read_image(load.fs, filename)?;
        let mut target = self.space.user_pages(memory);
        Ok(load.loader.load(image.as_bytes(), &mut target)?)
    }

    /// Release every frame and allocation the process owns
    pub fn delete(self, ctx: &mut MemoryContext<'_>) {
        log::debug!("[process] deleting '{}' ({})", self.name, self.pid);
        self.space.release(ctx);
    }

    /// Put this process on the CPU
    ///
    /// Writes its registers into the frame the IRQ stub will restore and
    /// switches TTB0 to its table. The first activation starts at the entry
    /// point. Returns whether this was the first activation.
    pub fn activate(&mut self, frame: &mut RegisterFile, mmu: &mut dyn Mmu) -> bool {
        let first_run = !self.started;
        if first_run {
            self.registers.pc = self.entry.as_u32();
            self.started = true;
        }
        *frame = self.registers;
        self.state = ProcessState::Running;
        self.slice_ms = 0;
        mmu.switch_user_table(self.space.table_base(), self.space.table_size());
        first_run
    }

    /// Take this process off the CPU, saving the interrupted registers
    pub fn suspend(&mut self, frame: &RegisterFile) {
        self.registers = *frame;
        self.state = ProcessState::Ready;
    }

    /// Charge `ms` of CPU time
    pub fn account(&mut self, ms: u32) {
        self.elapsed_ms = self.elapsed_ms.saturating_add(ms);
        self.slice_ms = self.slice_ms.saturating_add(ms);
    }

    /// Start a new slice without leaving the CPU
    pub fn renew_slice(&mut self) {
        self.slice_ms = 0;
    }

    pub fn terminate(&mut self) {
        self.state = ProcessState::Terminated;
    }

    /// Whether the id word at the base of the first user page still holds
    /// this process's id
    ///
    /// File-backed images own that word, so this is only meaningful for
    /// blank and entry processes.
    pub fn marker_intact(&self, memory: &dyn PhysicalMemory) -> bool {
        self.space.marker(memory) == Some(self.pid.as_u32())
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Path of the originating executable
    pub fn path(&self) -> Option<&str> {
        match &self.origin {
            Origin::File { path } => Some(path),
            _ => None,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn elapsed_ms(&self) -> u32 {
        self.elapsed_ms
    }

    pub fn slice_ms(&self) -> u32 {
        self.slice_ms
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    pub fn entry(&self) -> VirtAddr {
        self.entry
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.registers
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn functions(&self) -> &[FunctionSymbol] {
        &self.functions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::IoError;
    use crate::memory::layout::USER_VA_START;
    use crate::memory::PAGE_SIZE;
    use crate::testing::{tiny_elf32, Machine, MemFs, ELF_LOAD_VADDR};
    use std::collections::BTreeSet;
    use std::vec;

    const START_PAGES: usize = 8;

    fn placement() -> Placement {
        Placement::linear(START_PAGES)
    }

    #[test]
    fn test_create_initial_state() {
        let mut machine = Machine::new(256);
        let process = Process::create("idle", &placement(), &mut machine.context()).unwrap();

        assert_eq!(process.name(), "idle");
        assert_eq!(process.state(), ProcessState::Ready);
        assert_eq!(process.priority(), Priority::Medium);
        assert_eq!(process.elapsed_ms(), 0);
        assert!(!process.has_started());
        assert_eq!(process.origin(), &Origin::Blank);
        assert_eq!(process.path(), None);

        let top = USER_VA_START + (START_PAGES * PAGE_SIZE) as u32;
        let regs = process.registers();
        assert_eq!(regs.sp, top);
        assert_eq!(regs.r7, top);
        assert_eq!(regs.r11, top);
        assert_eq!(regs.mode(), Some(ProcessorMode::User));
        assert_eq!(process.address_space().num_mem_pages(), START_PAGES);
        assert!(process.marker_intact(&machine.memory));
    }

    #[test]
    fn test_consecutive_processes_are_disjoint() {
        let mut machine = Machine::new(256);
        let a = Process::create("a", &placement(), &mut machine.context()).unwrap();
        let b = Process::create("b", &placement(), &mut machine.context()).unwrap();

        assert_ne!(a.pid(), b.pid());
        assert!(b.pid() > a.pid());

        let frames_of = |p: &Process| -> BTreeSet<_> {
            p.address_space()
                .user_frames()
                .iter()
                .copied()
                .chain(p.address_space().table_frames())
                .collect()
        };
        assert!(frames_of(&a).is_disjoint(&frames_of(&b)));
    }

    #[test]
    fn test_delete_then_create_reuses_frames() {
        let mut machine = Machine::new(256);
        let before = machine.frames.usage();

        let first = Process::create("a", &placement(), &mut machine.context()).unwrap();
        let frames: BTreeSet<_> = first.address_space().user_frames().iter().copied().collect();
        first.delete(&mut machine.context());
        assert_eq!(machine.frames.usage(), before);

        let second = Process::create("b", &placement(), &mut machine.context()).unwrap();
        let again: BTreeSet<_> = second.address_space().user_frames().iter().copied().collect();
        assert_eq!(frames, again);
    }

    #[test]
    fn test_create_from_file_sets_entry() {
        let mut machine = Machine::new(256);
        let mut fs = MemFs::new();
        fs.insert("/bin/spin", tiny_elf32(&[0xFE, 0xFF, 0xFF, 0xEA], ELF_LOAD_VADDR));
        let loader = ElfLoader;
        let mut load = LoadContext { fs: &mut fs, loader: &loader };

        let process =
            Process::create_from_file("/bin/spin", "spin", &placement(), &mut machine.context(), &mut load).unwrap();

        assert_eq!(process.entry(), VirtAddr::new(USER_VA_START));
        assert_eq!(process.registers().pc, USER_VA_START);
        assert_eq!(process.path(), Some("/bin/spin"));

        let first = process.address_space().user_frames()[0];
        assert_eq!(machine.memory.words(first.start_address(), 1)[0], 0xEAFF_FFFE);
    }

    #[test]
    fn test_create_from_missing_file_releases_memory() {
        let mut machine = Machine::new(256);
        let before = machine.frames.usage();
        let mut fs = MemFs::new();
        let loader = ElfLoader;
        let mut load = LoadContext { fs: &mut fs, loader: &loader };

        let err = Process::create_from_file("/bin/none", "none", &placement(), &mut machine.context(), &mut load)
            .unwrap_err();
        assert_eq!(err, ProcessError::Io(IoError::NotFound));
        assert_eq!(machine.frames.usage(), before);
    }

    #[test]
    fn test_create_from_bad_image_releases_memory() {
        let mut machine = Machine::new(256);
        let before = machine.frames.usage();
        let mut fs = MemFs::new();
        fs.insert("/bin/junk", vec![0x7f, b'E', b'L', b'X', 0, 0, 0, 0]);
        let loader = ElfLoader;
        let mut load = LoadContext { fs: &mut fs, loader: &loader };

        let err = Process::create_from_file("/bin/junk", "junk", &placement(), &mut machine.context(), &mut load)
            .unwrap_err();
        assert!(matches!(err, ProcessError::BadExecutable(_)));
        assert_eq!(machine.frames.usage(), before);
    }

    #[test]
    fn test_create_with_entry_runs_in_system_mode() {
        let mut machine = Machine::new(256);
        let entry = VirtAddr::new(0x8000_8000);
        let process = Process::create_with_entry(entry, "kworker", &placement(), &mut machine.context()).unwrap();

        assert_eq!(process.entry(), entry);
        assert_eq!(process.registers().pc, 0x8000_8000);
        assert_eq!(process.registers().mode(), Some(ProcessorMode::System));
        assert_eq!(process.origin(), &Origin::Entry);
    }

    #[test]
    fn test_activate_first_run_uses_entry() {
        let mut machine = Machine::new(256);
        let entry = VirtAddr::new(0x8000_8000);
        let mut process = Process::create_with_entry(entry, "k", &placement(), &mut machine.context()).unwrap();

        let mut frame = RegisterFile::new();
        process.registers_mut().pc = 0xDEAD_0000;
        assert!(process.activate(&mut frame, &mut machine.mmu));
        assert_eq!(frame.pc, 0x8000_8000);
        assert_eq!(process.state(), ProcessState::Running);
        assert_eq!(
            machine.mmu.switches.last(),
            Some(&(process.address_space().table_base(), process.address_space().table_size()))
        );

        // Second activation resumes from the saved registers
        frame.pc = 0x8000_8040;
        frame.r0 = 42;
        process.suspend(&frame);
        let mut next = RegisterFile::new();
        assert!(!process.activate(&mut next, &mut machine.mmu));
        assert_eq!(next.pc, 0x8000_8040);
        assert_eq!(next.r0, 42);
    }

    #[test]
    fn test_owned_str_copies_exactly() {
        let owned = owned_str("/bin/shell").unwrap();
        assert_eq!(owned, "/bin/shell");
        assert_eq!(owned.capacity(), owned.len());
        assert_eq!(owned_str("").unwrap(), "");
    }

    #[test]
    fn test_file_process_keeps_name_and_path() {
        let mut machine = Machine::new(256);
        let mut fs = MemFs::new();
        fs.insert("/bin/spin", tiny_elf32(&[0xEA, 0xFF, 0xFF, 0xFE], ELF_LOAD_VADDR));
        let loader = ElfLoader;
        let mut load = LoadContext { fs: &mut fs, loader: &loader };

        let process = Process::create_from_file("/bin/spin", "spin", &placement(), &mut machine.context(), &mut load)
            .unwrap();
        assert_eq!(process.name(), "spin");
        assert_eq!(process.path(), Some("/bin/spin"));
    }

    #[test]
    fn test_account_tracks_total_and_slice() {
        let mut machine = Machine::new(256);
        let mut process = Process::create("p", &placement(), &mut machine.context()).unwrap();
        process.account(10);
        process.account(10);
        assert_eq!(process.slice_ms(), 20);
        process.renew_slice();
        process.account(10);
        assert_eq!(process.slice_ms(), 10);
        assert_eq!(process.elapsed_ms(), 30);
    }
}
