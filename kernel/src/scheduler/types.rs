//! Scheduler Types
//!
//! Core data structures for the PiOS scheduler.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use thiserror::Error;

use crate::arch::arm::{InterruptController, InterruptSource, Mmu, RegisterFile};
use crate::config::{ConfigError, SchedulerConfig};
use crate::memory::VirtAddr;
use crate::process::{
    LoadContext, MemoryContext, Pid, Placement, Process, ProcessError, TableWindow,
};

use super::timer::TickTimer;

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Every memory slot is occupied
    #[error("no free task slot")]
    CapacityExhausted,

    /// The task could not be created
    #[error("cannot load task: {0}")]
    Load(ProcessError),

    /// The task is already queued or running
    #[error("{0} is already scheduled")]
    AlreadyQueued(Pid),

    /// No such task in the queue or on the CPU
    #[error("{0} is not scheduled")]
    UnknownTask(Pid),

    /// The task does not own a slot
    #[error("task owns no slot")]
    SlotNotOwned,

    /// Scheduler not initialized
    #[error("scheduler not initialized")]
    NotInitialized,

    /// Re-initialization while tasks are resident
    #[error("scheduler still holds {0} task(s)")]
    Occupied(usize),

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// A pre-reserved (virtual base, table window) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySlot {
    virtual_base: VirtAddr,
    table_window: VirtAddr,
    owner: Option<Pid>,
}

impl MemorySlot {
    pub fn virtual_base(&self) -> VirtAddr {
        self.virtual_base
    }

    pub fn table_window(&self) -> VirtAddr {
        self.table_window
    }

    pub fn owner(&self) -> Option<Pid> {
        self.owner
    }

    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }
}

/// What a tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to run
    Idle,
    /// The running task keeps the CPU
    Continue,
    /// `to` now owns the CPU; `from` went back to the queue
    Switched {
        from: Option<Pid>,
        to: Pid,
        first_run: bool,
    },
}

/// A terminated task whose memory is not yet released
///
/// While `on_cpu` is set the interrupted frame and TTB0 still belong to it.
struct Exiting {
    task: Process,
    on_cpu: bool,
}

/// Scheduler - round-robin over resident tasks
///
/// The running task is held apart from the ready queue. A task leaves the
/// CPU when its slice exceeds the quantum and another task is waiting.
pub struct Scheduler {
    config: SchedulerConfig,

    /// Tasks waiting for the CPU, head runs next
    ready: VecDeque<Process>,

    /// Task on the CPU
    current: Option<Process>,

    /// Fixed pool of task memory windows
    slots: Box<[MemorySlot]>,

    /// Kernel context a task was last switched in from; resumed when the
    /// running task exits with nothing else to run
    idle: RegisterFile,

    /// Terminated running task, released by `reap` once off the CPU
    exiting: Option<Exiting>,
}

impl Scheduler {
    /// Create a scheduler with every slot free
    ///
    /// Slot addresses are computed here once, so neither enqueueing nor the
    /// tick does any layout arithmetic.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let slots: Vec<MemorySlot> = (0..config.max_tasks)
            .map(|i| MemorySlot {
                virtual_base: config.slot_virtual_base(i),
                table_window: config.slot_table_window(i),
                owner: None,
            })
            .collect();

        log::debug!(
            "[sched] {} slots, tick {}ms, quantum {}ms",
            slots.len(),
            config.tick_ms,
            config.quantum_ms
        );

        Ok(Self {
            config,
            ready: VecDeque::with_capacity(config.max_tasks),
            current: None,
            slots: slots.into_boxed_slice(),
            idle: RegisterFile::new(),
            exiting: None,
        })
    }

    /// Arm the tick and unmask the timer interrupt
    ///
    /// No task is activated here; the first tick picks the head of the queue.
    pub fn start(&self, timer: &mut dyn TickTimer, irq: &InterruptController) {
        timer.clear();
        timer.set_interval(self.config.tick_ms);
        irq.enable(InterruptSource::SystemTimer);
        log::info!("[sched] started with {} task(s) queued", self.ready.len());
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Index of the first free slot
    pub fn get_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(MemorySlot::is_free)
    }

    pub fn slot(&self, index: usize) -> Option<&MemorySlot> {
        self.slots.get(index)
    }

    fn slot_placement(&self, index: usize) -> Placement {
        let slot = &self.slots[index];
        Placement {
            user_base: slot.virtual_base,
            table_window: TableWindow::Fixed(slot.table_window),
            pages: self.config.task_pages,
            table_size: self.config.table_size,
        }
    }

    /// Load `filename` into a free slot and queue it
    pub fn enqueue_by_file(
        &mut self,
        name: &str,
        filename: &str,
        ctx: &mut MemoryContext<'_>,
        load: &mut LoadContext<'_>,
    ) -> Result<Pid, SchedulerError> {
        self.reap(ctx);
        let free = match self.get_free_slot() {
            Some(index) if self.task_count() < self.config.max_tasks => Some(index),
            _ => None,
        };
        let Some(index) = free else {
            if self.task_count() >= self.config.max_tasks {
                log::warn!("[sched] no slot for '{}', close a task and try again", name);
            } else {
                log::warn!("[sched] no slot for '{}', not sure why", name);
            }
            return Err(SchedulerError::CapacityExhausted);
        };

        let placement = self.slot_placement(index);
        let mut task = Process::create_from_file(filename, name, &placement, ctx, load)
            .map_err(|err| {
                log::warn!("[sched] failed to load '{}': {}", filename, err);
                SchedulerError::Load(err)
            })?;
        task.registers_mut().set_mode(self.config.task_mode);

        let pid = task.pid();
        self.slots[index].owner = Some(pid);
        self.push_ready(task);
        Ok(pid)
    }

    /// Queue an already created task
    ///
    /// The task keeps whatever memory it was built with; no slot is claimed.
    /// A refused task is deleted so its frames are not lost.
    pub fn enqueue_task(
        &mut self,
        task: Process,
        ctx: &mut MemoryContext<'_>,
    ) -> Result<Pid, SchedulerError> {
        self.reap(ctx);
        let pid = task.pid();
        let error = if self.contains(pid) {
            Some(SchedulerError::AlreadyQueued(pid))
        } else if self.task_count() >= self.config.max_tasks {
            Some(SchedulerError::CapacityExhausted)
        } else {
            None
        };

        if let Some(error) = error {
            log::warn!("[sched] refusing '{}' ({}): {}", task.name(), pid, error);
            task.delete(ctx);
            return Err(error);
        }

        self.push_ready(task);
        Ok(pid)
    }

    fn push_ready(&mut self, task: Process) {
        log::info!(
            "[sched] enqueueing '{}' ({}), ttb0 {:#x}, priority {:?}",
            task.name(),
            task.pid(),
            task.address_space().table_base(),
            task.priority()
        );
        self.ready.push_back(task);
    }

    fn contains(&self, pid: Pid) -> bool {
        self.current.as_ref().is_some_and(|t| t.pid() == pid)
            || self.ready.iter().any(|t| t.pid() == pid)
    }

    /// Timer interrupt
    ///
    /// `frame` holds the interrupted registers and is what the IRQ return
    /// path restores, so a switch rewrites it with the next task's state.
    ///
    /// # Panics
    /// If a switch is required and the ready queue is empty.
    pub fn tick(
        &mut self,
        frame: &mut RegisterFile,
        timer: &mut dyn TickTimer,
        mmu: &mut dyn Mmu,
    ) -> TickOutcome {
        timer.clear();
        timer.set_interval(self.config.tick_ms);

        if self.current.is_none() && self.ready.is_empty() {
            self.park(frame, mmu);
            return TickOutcome::Idle;
        }

        if let Some(task) = self.current.as_mut() {
            task.account(self.config.tick_ms);
            if task.slice_ms() <= self.config.quantum_ms {
                return TickOutcome::Continue;
            }
            if self.ready.is_empty() {
                task.renew_slice();
                return TickOutcome::Continue;
            }
        }

        self.switch(frame, mmu)
    }

    fn switch(&mut self, frame: &mut RegisterFile, mmu: &mut dyn Mmu) -> TickOutcome {
        let Some(mut next) = self.ready.pop_front() else {
            panic!("[sched] no schedulable task");
        };

        let from = match self.current.take() {
            Some(mut prev) => {
                prev.suspend(frame);
                let pid = prev.pid();
                self.ready.push_back(prev);
                Some(pid)
            }
            None => {
                // the frame is either an exited task's or the kernel's own
                match self.exiting.as_mut() {
                    Some(exiting) if exiting.on_cpu => exiting.on_cpu = false,
                    _ => self.idle = *frame,
                }
                None
            }
        };

        let first_run = next.activate(frame, mmu);
        let to = next.pid();
        log::trace!("[sched] switch {:?} -> {} (first run: {})", from, to, first_run);
        self.current = Some(next);

        TickOutcome::Switched { from, to, first_run }
    }

    /// Hand the CPU back to the idle context if an exited task still holds it
    fn park(&mut self, frame: &mut RegisterFile, mmu: &mut dyn Mmu) {
        if let Some(exiting) = self.exiting.as_mut().filter(|e| e.on_cpu) {
            *frame = self.idle;
            mmu.disable_user_table();
            exiting.on_cpu = false;
            log::debug!("[sched] idle after '{}' exited", exiting.task.name());
        }
    }

    /// Remove a task and release its memory and slot
    ///
    /// A task on the CPU is only taken off it here: its frames and slot stay
    /// claimed until a tick has moved the CPU and TTB0 elsewhere, after which
    /// `reap` releases them.
    pub fn terminate(&mut self, pid: Pid, ctx: &mut MemoryContext<'_>) -> Result<(), SchedulerError> {
        self.reap(ctx);

        let running = self.current.as_ref().is_some_and(|t| t.pid() == pid);
        let mut task = if running {
            self.current.take()
        } else {
            self.ready
                .iter()
                .position(|t| t.pid() == pid)
                .and_then(|i| self.ready.remove(i))
        }
        .ok_or(SchedulerError::UnknownTask(pid))?;

        task.terminate();
        log::info!("[sched] terminated '{}' ({})", task.name(), pid);
        if running {
            self.exiting = Some(Exiting { task, on_cpu: true });
        } else {
            self.retire(task, ctx);
        }
        Ok(())
    }

    /// Release a terminated task that has left the CPU
    ///
    /// Returns whether anything was released.
    pub fn reap(&mut self, ctx: &mut MemoryContext<'_>) -> bool {
        match self.exiting.take() {
            Some(exiting) if !exiting.on_cpu => {
                self.retire(exiting.task, ctx);
                true
            }
            pending => {
                self.exiting = pending;
                false
            }
        }
    }

    /// Whether a terminated task still holds the CPU or its memory
    pub fn has_exiting(&self) -> bool {
        self.exiting.is_some()
    }

    fn retire(&mut self, task: Process, ctx: &mut MemoryContext<'_>) {
        let pid = task.pid();
        task.delete(ctx);
        if self.release_slot(pid).is_err() {
            log::debug!("[sched] {} had no slot", pid);
        }
    }

    /// Mark the slot owned by `pid` free
    pub fn release_slot(&mut self, pid: Pid) -> Result<(), SchedulerError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.owner == Some(pid))
            .ok_or(SchedulerError::SlotNotOwned)?;
        slot.owner = None;
        Ok(())
    }

    /// Delete every task and free every slot
    ///
    /// TTB0 walks are switched off first; nothing may return to a task
    /// afterwards.
    pub fn clear(&mut self, ctx: &mut MemoryContext<'_>) {
        ctx.mmu.disable_user_table();
        let exiting = self.exiting.take().map(|e| e.task);
        let tasks = self
            .current
            .take()
            .into_iter()
            .chain(exiting)
            .chain(self.ready.drain(..));
        for task in tasks.collect::<Vec<_>>() {
            task.delete(ctx);
        }
        for slot in self.slots.iter_mut() {
            slot.owner = None;
        }
    }

    /// Task on the CPU
    pub fn current(&self) -> Option<&Process> {
        self.current.as_ref()
    }

    /// Number of tasks waiting for the CPU
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Tasks resident in the scheduler, running or waiting
    pub fn task_count(&self) -> usize {
        self.ready.len() + usize::from(self.current.is_some())
    }

    /// Pids in queue order
    pub fn ready_pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.ready.iter().map(Process::pid)
    }
}
