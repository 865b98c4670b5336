//! Boot sequence and early initialization
//!
//! Brings the process core up on top of the environment the assembly
//! start-up code leaves behind (MMU on, RAM linearly mapped at
//! `KERNEL_VA_START`, peripherals at `PERIPHERAL_VA_START`):
//! 1. Console and logger
//! 2. Kernel heap and the physical frame pool
//! 3. Interrupt controller, everything masked
//! 4. Coarse tables backing the slot table windows
//! 5. The scheduler, idle until `Kernel::start`

use log::LevelFilter;
use thiserror::Error;

use crate::arch::arm::interrupts;
use crate::arch::arm::page_table::{L2_TABLE_SIZE, SECTION_SIZE};
use crate::arch::arm::{ArmMmu, InterruptController, MapError, RegisterFile};
use crate::config::{self, SchedulerConfig};
use crate::memory::{self, heap, FrameAllocator, GlobalFrames, LinearWindow, PhysAddr, PAGE_SIZE};
use crate::process::MemoryContext;
use crate::scheduler::{self, SchedulerError, SystemTimer, TickOutcome};
use crate::{debug, irq};

/// What the start-up code knows about the board
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub ram_start: PhysAddr,
    pub ram_size: usize,
    /// First byte after the kernel image, boot stacks and heap
    pub kernel_end: PhysAddr,
    /// The kernel's 16KB TTB1 table
    pub kernel_l1: PhysAddr,
    pub log_level: LevelFilter,
}

/// Boot failures
#[derive(Debug, Error)]
pub enum BootError {
    #[error("a logger is already installed")]
    Logger,

    #[error("no frames for the table window")]
    WindowTables,

    #[error("table window: {0}")]
    Window(#[from] MapError),

    #[error("scheduler: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// The hardware the process core drives once booted
pub struct Kernel {
    frames: GlobalFrames,
    memory: LinearWindow,
    mmu: ArmMmu<LinearWindow>,
    timer: SystemTimer,
    irq: &'static InterruptController,
}

impl Kernel {
    /// Collaborators for creating and deleting processes
    pub fn memory_context(&mut self) -> MemoryContext<'_> {
        MemoryContext {
            frames: &mut self.frames,
            memory: &mut self.memory,
            mmu: &mut self.mmu,
        }
    }

    /// Arm the tick; the first tick activates the head of the queue
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        let (timer, irq) = (&mut self.timer, self.irq);
        scheduler::with(|s| s.start(timer, irq))
    }

    /// Called by the IRQ vector stub with the saved frame
    pub fn handle_irq(&mut self, frame: &mut RegisterFile) -> Option<TickOutcome> {
        irq::dispatch(frame, &mut self.timer, &mut self.mmu)
    }
}

/// Bring up the process core
///
/// # Safety
/// - Must be called exactly once, with IRQs masked
/// - `info` must describe the running system: RAM linearly mapped at
///   `KERNEL_VA_START`, peripherals mapped, `kernel_l1` the live TTB1 table
pub unsafe fn init(info: &BootInfo, config: SchedulerConfig) -> Result<Kernel, BootError> {
    config::init_console();
    debug::init_logger(info.log_level).map_err(|_| BootError::Logger)?;

    crate::kprintln!("PiOS process core");
    crate::kprintln!("  RAM:        {:#x} + {:#x}", info.ram_start, info.ram_size);
    crate::kprintln!("  Kernel end: {:#x}", info.kernel_end);

    heap::init();
    memory::init(info.kernel_end, info.ram_start, info.ram_size);
    let irq = interrupts::initialize();

    let mut frames = GlobalFrames;
    let window_bytes = config.max_tasks * config.table_size.region_pages() * PAGE_SIZE;
    let sections = window_bytes.div_ceil(SECTION_SIZE);
    let table_pages = (sections * L2_TABLE_SIZE).div_ceil(PAGE_SIZE);
    let tables = frames
        .alloc_contiguous(table_pages)
        .ok_or(BootError::WindowTables)?;

    // The MMU only touches the window tables and the kernel L1; processes
    // go through the second window.
    let mmu = ArmMmu::new(
        LinearWindow::new(),
        info.kernel_l1,
        config.table_windows_start,
        tables,
        sections,
    )?;

    scheduler::initialize(config)?;
    memory::print_usage(&frames);

    Ok(Kernel {
        frames,
        memory: LinearWindow::new(),
        mmu,
        timer: SystemTimer::new(),
        irq,
    })
}
