//! Scheduler - Task Queueing & Time Slicing
//!
//! This module implements the PiOS scheduler which manages:
//! - A fixed pool of memory slots, one per resident task
//! - A FIFO ready queue
//! - Preemption on the system timer tick
//!
//! ## Architecture
//!
//! The scheduler is **round-robin** with a fixed quantum. The tick rearms
//! the timer first, charges the tick to the running task and, once the
//! task's slice exceeds the quantum and someone else is waiting, swaps it
//! for the head of the queue.
//!
//! ## Task States
//!
//! - **Ready**: in the queue
//! - **Running**: on the CPU
//! - **Terminated**: removed and deleted
//!
//! ## Usage
//!
//! ```rust,ignore
//! scheduler::initialize(SchedulerConfig::default())?;
//! scheduler::with(|s| s.enqueue_by_file("shell", "/bin/shell", &mut ctx, &mut load))??;
//! scheduler::with(|s| s.start(&mut timer, irq))?;
//! ```
//!
//! The global instance is shared between task-creation code and the IRQ
//! handler; every access masks IRQs for its duration.

use spin::Mutex;

use crate::arch::arm::InterruptGuard;
use crate::config::SchedulerConfig;
use crate::process::{MemoryContext, Pid};

mod types;
pub mod timer;


pub use timer::{SystemTimer, TickTimer};
pub use types::{MemorySlot, Scheduler, SchedulerError, TickOutcome};

/// Global scheduler instance
static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);

/// Initialize the global scheduler
///
/// Fails if the configuration is rejected. Re-initializing replaces an
/// empty scheduler; one that still holds tasks must be torn down first.
pub fn initialize(config: SchedulerConfig) -> Result<(), SchedulerError> {
    let scheduler = Scheduler::new(config)?;

    let _guard = InterruptGuard::new();
    let mut global = SCHEDULER.lock();
    if let Some(old) = global.as_ref() {
        let resident = old.task_count() + usize::from(old.has_exiting());
        if resident > 0 {
            log::error!("[sched] initialize with {} task(s) resident", resident);
            return Err(SchedulerError::Occupied(resident));
        }
    }
    *global = Some(scheduler);
    log::info!("[sched] initialized, {} slots", config.max_tasks);
    Ok(())
}

/// Delete every task and drop the global scheduler
pub fn teardown(ctx: &mut MemoryContext<'_>) {
    let _guard = InterruptGuard::new();
    if let Some(mut scheduler) = SCHEDULER.lock().take() {
        scheduler.clear(ctx);
        log::info!("[sched] torn down");
    }
}

/// Run `f` on the global scheduler with IRQs masked
pub fn with<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Result<R, SchedulerError> {
    let _guard = InterruptGuard::new();
    let mut global = SCHEDULER.lock();
    let scheduler = global.as_mut().ok_or(SchedulerError::NotInitialized)?;
    Ok(f(scheduler))
}

/// Whether `initialize` has run
pub fn is_initialized() -> bool {
    let _guard = InterruptGuard::new();
    SCHEDULER.lock().is_some()
}

/// Next task id; never reused within a boot
pub fn next_tid() -> Pid {
    Pid::next()
}
