//! Interrupt subsystem: external IRQ routing, timer ticks, per-task
//! timeouts, and quantum accounting.
//!
//! The kernel contains no device drivers beyond the console UART; every
//! other interrupt line is claimed by exactly one user task through
//! `irq_listen` and surfaced to it as a `NOTIFY_IRQ` notification.

use abi::{Error, Notifications, Tid, NUM_TASKS_MAX};

use crate::arch;
use crate::config::{IRQ_MAX, UART0_IRQ};
use crate::ipc;
use crate::mp::Cpus;
use crate::startup::Kernel;
use crate::task;

/// Who hears about each external interrupt line. One listener per line.
pub struct IrqTable {
    listeners: [Option<Tid>; IRQ_MAX],
}

impl IrqTable {
    pub fn new() -> Self {
        Self {
            listeners: [None; IRQ_MAX],
        }
    }

    /// Claims `irq` for `task` and unmasks it at the interrupt controller.
    pub fn listen(&mut self, task: Tid, irq: usize) -> Result<(), Error> {
        if irq >= IRQ_MAX {
            return Err(Error::InvalidArg);
        }
        if self.listeners[irq].is_some() {
            return Err(Error::AlreadyUsed);
        }

        arch::irq_enable(irq);
        self.listeners[irq] = Some(task);
        Ok(())
    }

    /// Releases `irq`; only its current listener may do so.
    pub fn unlisten(&mut self, task: Tid, irq: usize) -> Result<(), Error> {
        if irq >= IRQ_MAX {
            return Err(Error::InvalidArg);
        }
        if self.listeners[irq] != Some(task) {
            return Err(Error::NotAllowed);
        }

        arch::irq_disable(irq);
        self.listeners[irq] = None;
        Ok(())
    }

    /// Releases every line held by `task`. Runs during task destruction so
    /// a recycled slot can't inherit a dead task's interrupts.
    pub(crate) fn unlisten_all(&mut self, task: Tid) {
        for (irq, l) in self.listeners.iter_mut().enumerate() {
            if *l == Some(task) {
                arch::irq_disable(irq);
                *l = None;
            }
        }
    }

    pub fn listener(&self, irq: usize) -> Option<Tid> {
        if irq < IRQ_MAX {
            self.listeners[irq]
        } else {
            None
        }
    }
}

/// Routes an external interrupt to its listener.
pub fn handle_interrupt(k: &mut Kernel, irq: usize) {
    if irq >= IRQ_MAX {
        klog!("invalid IRQ: {}", irq);
        return;
    }

    match k.irqs.listener(irq) {
        Some(task) => ipc::notify(&mut k.tasks, task, Notifications::IRQ),
        None => klog!("unhandled IRQ {}", irq),
    }
}

/// Timer tick handler. `ticks` may exceed 1 if interrupts were held off.
///
/// Uptime is global; the per-task timeout scan runs on CPU 0 only so each
/// countdown is aged exactly once per tick. Quantum accounting is per-CPU:
/// whatever is running here pays, and hitting zero enters the scheduler.
pub fn handle_timer_interrupt(k: &mut Kernel, cpus: &Cpus, ticks: u32) {
    k.uptime_ticks += u64::from(ticks);

    let cpu = arch::cpu_id();
    if cpu == 0 {
        for i in 0..NUM_TASKS_MAX {
            let tid = Tid::from_index(i);
            let fired = {
                let t = k.tasks.get_mut(tid);
                if t.state() == task::TaskState::Unused || t.timeout == 0 {
                    false
                } else {
                    t.timeout -= t.timeout.min(ticks);
                    t.timeout == 0
                }
            };
            if fired {
                ipc::notify(&mut k.tasks, tid, Notifications::TIMER);
            }
        }
    }

    let current = cpus.get(cpu).current();
    let t = k.tasks.current_mut(current, cpu);
    t.quantum -= t.quantum.min(ticks);
    if t.quantum == 0 {
        task::switch(k, cpus);
    }
}

/// Console receive path, fed by the UART interrupt. Bytes are buffered for
/// `serial_read`; Ctrl-P is a debug hotkey that dumps the task table.
pub fn handle_serial_input(k: &mut Kernel, ch: u8) {
    const CTRL_P: u8 = 0x10;

    if ch == CTRL_P {
        task::dump(k);
        return;
    }

    if k.console_rx.push_back(ch).is_err() {
        klog!("console: rx overrun, dropping input");
    }

    // A console server may be listening on the UART line; poke it the same
    // way a device IRQ would.
    if let Some(task) = k.irqs.listener(UART0_IRQ) {
        ipc::notify(&mut k.tasks, task, Notifications::IRQ);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp::Current;
    use crate::startup::test_kernel;
    use crate::task::create_for_test;
    use abi::NOTIFY_MSG;

    #[test]
    fn one_listener_per_line() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "drv-a", None);
        let b = create_for_test(&mut k, "drv-b", Some(a));

        k.irqs.listen(a, 5).unwrap();
        assert_eq!(k.irqs.listen(b, 5), Err(Error::AlreadyUsed));
        assert_eq!(k.irqs.listen(a, IRQ_MAX), Err(Error::InvalidArg));

        // Only the holder may release.
        assert_eq!(k.irqs.unlisten(b, 5), Err(Error::NotAllowed));
        k.irqs.unlisten(a, 5).unwrap();
        k.irqs.listen(b, 5).unwrap();
    }

    #[test]
    fn interrupts_notify_the_listener() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "drv", None);
        k.irqs.listen(a, 7).unwrap();

        handle_interrupt(&mut k, 7);
        assert!(k
            .tasks
            .task(a)
            .unwrap()
            .notifications()
            .contains(Notifications::IRQ));

        // A line nobody listens to is logged and dropped, not delivered.
        handle_interrupt(&mut k, 8);
    }

    #[test]
    fn destroy_releases_irq_lines() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let a = create_for_test(&mut k, "pager", None);
        let b = create_for_test(&mut k, "drv", Some(a));

        k.irqs.listen(b, 9).unwrap();
        task::destroy(&mut k, &cpus, b).unwrap();
        assert_eq!(k.irqs.listener(9), None);
    }

    #[test]
    fn timeout_fires_notify_timer_once() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let a = create_for_test(&mut k, "alpha", None);

        k.tasks.get_mut(a).timeout = 3;
        handle_timer_interrupt(&mut k, &cpus, 2);
        assert!(k.tasks.task(a).unwrap().notifications().is_empty());

        handle_timer_interrupt(&mut k, &cpus, 2);
        assert!(k
            .tasks
            .task(a)
            .unwrap()
            .notifications()
            .contains(Notifications::TIMER));

        // Disarmed now: further ticks add nothing.
        k.tasks.get_mut(a).notifications = Notifications::empty();
        handle_timer_interrupt(&mut k, &cpus, 5);
        assert!(k.tasks.task(a).unwrap().notifications().is_empty());
    }

    #[test]
    fn timeout_delivers_immediately_to_open_receive() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let a = create_for_test(&mut k, "alpha", None);

        // A is parked in an open receive with a one-tick timeout.
        k.tasks.get_mut(a).timeout = 1;
        crate::ipc::begin_recv(&mut k, a, crate::ipc::RecvFilter::Any, abi::IpcFlags::RECV)
            .unwrap();
        k.tasks.runq_remove(a);

        handle_timer_interrupt(&mut k, &cpus, 1);
        let t = k.tasks.task(a).unwrap();
        assert_eq!(t.state(), task::TaskState::Runnable);
        assert_eq!(t.message().ty, NOTIFY_MSG);
    }

    #[test]
    fn quantum_expiry_enters_the_scheduler() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let a = create_for_test(&mut k, "alpha", None);
        let b = create_for_test(&mut k, "beta", Some(a));

        task::switch(&mut k, &cpus);
        assert_eq!(cpus.get(0).current(), Current::Task(a));

        // Burn most of the quantum: still running.
        let q = k.tasks.get(a).quantum;
        handle_timer_interrupt(&mut k, &cpus, q - 1);
        assert_eq!(cpus.get(0).current(), Current::Task(a));

        // The last tick forces the switch; b takes over.
        handle_timer_interrupt(&mut k, &cpus, 1);
        assert_eq!(cpus.get(0).current(), Current::Task(b));
        let _ = b;
    }

    #[test]
    fn console_input_is_buffered_for_serial_read() {
        let mut k = test_kernel();
        for b in b"hi" {
            handle_serial_input(&mut k, *b);
        }
        assert_eq!(k.console_rx.pop_front(), Some(b'h'));
        assert_eq!(k.console_rx.pop_front(), Some(b'i'));
        assert_eq!(k.console_rx.pop_front(), None);
    }
}
