//! IRQ dispatch
//!
//! The IRQ vector stub saves the interrupted registers into a
//! `RegisterFile` on the IRQ stack and calls `dispatch` with it. Whatever
//! the frame holds on return is what the CPU resumes.

use crate::arch::arm::interrupts;
use crate::arch::arm::{InterruptSource, Mmu, PendingIrq, RegisterFile};
use crate::scheduler::{self, Scheduler, TickOutcome, TickTimer};

/// Handle the highest-priority pending IRQ
///
/// # Panics
/// On an IRQ nobody enabled, or before the interrupt controller exists.
pub fn dispatch(
    frame: &mut RegisterFile,
    timer: &mut dyn TickTimer,
    mmu: &mut dyn Mmu,
) -> Option<TickOutcome> {
    let Some(controller) = interrupts::controller() else {
        panic!("[irq] interrupt before controller initialization");
    };
    let pending = controller.get_pending();

    match scheduler::with(|s| route(pending, s, frame, timer, mmu)) {
        Ok(outcome) => outcome,
        Err(err) => {
            log::warn!("[irq] {:?} with no scheduler: {}", pending, err);
            if pending == PendingIrq::Source(InterruptSource::SystemTimer) {
                timer.clear();
            }
            None
        }
    }
}

/// Send `pending` to its handler
pub fn route(
    pending: PendingIrq,
    scheduler: &mut Scheduler,
    frame: &mut RegisterFile,
    timer: &mut dyn TickTimer,
    mmu: &mut dyn Mmu,
) -> Option<TickOutcome> {
    match pending {
        PendingIrq::Source(InterruptSource::SystemTimer) => Some(scheduler.tick(frame, timer, mmu)),
        PendingIrq::Source(InterruptSource::Uart) => {
            log::debug!("[irq] uart");
            None
        }
        PendingIrq::Source(InterruptSource::Other(line)) => {
            panic!("[irq] no handler for line {}", line.get())
        }
        PendingIrq::Unknown(raw) => {
            panic!("[irq] unknown interrupt source, pending {:#010x}", raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::testing::{MockTimer, RecordingMmu};

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig::default()).unwrap()
    }

    #[test]
    fn test_timer_irq_ticks() {
        let mut sched = scheduler();
        let mut timer = MockTimer::default();
        let mut mmu = RecordingMmu::default();
        let mut frame = RegisterFile::new();

        let outcome = route(
            PendingIrq::Source(InterruptSource::SystemTimer),
            &mut sched,
            &mut frame,
            &mut timer,
            &mut mmu,
        );
        assert_eq!(outcome, Some(TickOutcome::Idle));
        assert_eq!(timer.clears, 1);
    }

    #[test]
    fn test_uart_irq_leaves_timer_alone() {
        let mut sched = scheduler();
        let mut timer = MockTimer::default();
        let mut mmu = RecordingMmu::default();
        let mut frame = RegisterFile::new();

        let outcome = route(
            PendingIrq::Source(InterruptSource::Uart),
            &mut sched,
            &mut frame,
            &mut timer,
            &mut mmu,
        );
        assert_eq!(outcome, None);
        assert_eq!(timer.clears, 0);
    }

    #[test]
    #[should_panic(expected = "unknown interrupt source")]
    fn test_unknown_irq_is_fatal() {
        let mut sched = scheduler();
        let mut timer = MockTimer::default();
        let mut mmu = RecordingMmu::default();
        let mut frame = RegisterFile::new();

        route(PendingIrq::Unknown(1 << 9), &mut sched, &mut frame, &mut timer, &mut mmu);
    }
}
