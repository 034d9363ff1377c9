//! Synchronous message passing with notifications.
//!
//! Send and receive are rendezvous operations over the task table: whichever
//! side arrives second completes the transfer. A sender that finds its
//! receiver ready delivers on the spot; otherwise it parks in the
//! receiver's FIFO sender queue and finishes the delivery when the receiver
//! pulls it out. Notifications are a lossy bitfield side channel folded
//! into open receives as a kernel-composed message.
//!
//! The state transitions live in small step functions (`try_send`,
//! `begin_recv`, `deliver`, ...) and the blocking shells glue them together
//! around `task::switch`. The tests drive the steps directly, in exactly
//! the interleavings the scheduler would produce.

use abi::{Error, IpcFlags, Message, Notifications, Tid};
use zerocopy::IntoBytes;

use crate::arch;
use crate::err::UserError;
use crate::mp::{Cpus, Current};
use crate::startup::Kernel;
use crate::task::{self, TaskState, TaskTable, WaitFor};
use crate::umem::{self, UAddr};

/// Receive filter: everyone, or one specific peer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecvFilter {
    Any,
    From(Tid),
}

/// Where the caller's message lives. Syscalls pass a user address; kernel
/// paths (exit, page faults, the bytecode interpreter) pass a kernel
/// buffer.
pub enum MsgRef<'a> {
    User(UAddr),
    Kernel(&'a mut Message),
}

fn caller_tid(cpus: &Cpus) -> Tid {
    match cpus.get(arch::cpu_id()).current() {
        Current::Task(tid) => tid,
        Current::Idle => panic!("IPC from the idle task"),
    }
}

/// The combined send/receive primitive behind the `ipc` syscall.
pub fn ipc(
    k: &mut Kernel,
    cpus: &Cpus,
    dst: Option<Tid>,
    filter: RecvFilter,
    mut m: MsgRef<'_>,
    flags: IpcFlags,
) -> Result<(), UserError> {
    if flags.contains(IpcFlags::SEND) {
        let Some(dst) = dst else {
            return Err(Error::InvalidArg.into());
        };
        send_message(k, cpus, dst, &mut m, flags)?;
    }

    if flags.contains(IpcFlags::RECV) {
        recv_message(k, cpus, filter, &mut m, flags)?;
    }

    Ok(())
}

/// Blocking send shell.
fn send_message(
    k: &mut Kernel,
    cpus: &Cpus,
    dst: Tid,
    m: &mut MsgRef<'_>,
    flags: IpcFlags,
) -> Result<(), UserError> {
    let caller = caller_tid(cpus);

    if dst == caller {
        klog!("#{}: tried to send a message to itself", caller.as_i32());
        return Err(Error::InvalidArg.into());
    }

    // Copy the outbound message before touching any state: the user copy
    // may fault and run the pager protocol, which blocks.
    let copied = match m {
        MsgRef::Kernel(r) => **r,
        MsgRef::User(ua) => {
            let mut buf = Message::default();
            umem::copy_from_user(k, cpus, caller, buf.as_mut_bytes(), *ua)?;
            buf
        }
    };

    // The destination may have died while the copy paged.
    k.tasks.task(dst)?;

    if !try_send(k, caller, dst, flags)? {
        // Parked in dst's sender queue. Give up the CPU; we come back when
        // the receiver pulls us out, or when dst dies.
        task::switch(k, cpus);
        if take_abort(k, caller) {
            return Err(Error::Aborted.into());
        }
    }

    if !deliver(k, caller, dst, &copied, flags.contains(IpcFlags::KERNEL)) {
        // The receiver vanished between waking us and this point.
        return Err(Error::Aborted.into());
    }
    Ok(())
}

/// First half of a send: if `dst` is blocked in a receive that accepts
/// `caller`, returns `Ok(true)` and the caller delivers immediately.
/// Otherwise parks the caller in `dst`'s sender queue (`Ok(false)`), or
/// refuses with `WouldBlock`/`DeadLock`.
pub(crate) fn try_send(
    k: &mut Kernel,
    caller: Tid,
    dst: Tid,
    flags: IpcFlags,
) -> Result<bool, UserError> {
    let d = k.tasks.get(dst);
    let ready = d.state == TaskState::Blocked
        && (matches!(d.wait_for, WaitFor::Any) || matches!(d.wait_for, WaitFor::Task(t) if t == caller));
    if ready {
        return Ok(true);
    }

    if flags.contains(IpcFlags::NOBLOCK) {
        return Err(Error::WouldBlock.into());
    }

    // If dst is itself parked waiting to send to us, parking here would
    // close a cycle nobody could ever unwind. Refuse instead.
    if k.tasks.get(caller).senders.iter().any(|s| *s == dst) {
        klog!(
            "deadlock detected: #{} and #{} are trying to send to each other",
            caller.as_i32(),
            dst.as_i32()
        );
        return Err(Error::DeadLock.into());
    }

    let _ = k.tasks.get_mut(dst).senders.push_back(caller);
    task::block(k.tasks.get_mut(caller));
    Ok(false)
}

/// Consumes a pending abort notification after a parked send wakes up.
/// Returns true if the send was cancelled by the receiver's destruction.
pub(crate) fn take_abort(k: &mut Kernel, caller: Tid) -> bool {
    let me = k.tasks.get_mut(caller);
    if me.notifications.contains(Notifications::ABORTED) {
        me.notifications.remove(Notifications::ABORTED);
        true
    } else {
        false
    }
}

/// Second half of a send: moves the message into the receiver's slot and
/// wakes it. Returns false if the receiver is no longer in a matching
/// receive (it died while the sender was waking up).
pub(crate) fn deliver(
    k: &mut Kernel,
    src: Tid,
    dst: Tid,
    msg: &Message,
    from_kernel: bool,
) -> bool {
    let d = k.tasks.get_mut(dst);
    let expecting = d.state == TaskState::Blocked
        && !d.destroyed
        && (matches!(d.wait_for, WaitFor::Any) || matches!(d.wait_for, WaitFor::Task(t) if t == src));
    if !expecting {
        return false;
    }

    d.m = *msg;
    d.m.src = if from_kernel {
        Tid::FROM_KERNEL
    } else {
        src.as_i32()
    };
    task::resume(&mut k.tasks, dst);
    true
}

/// Blocking receive shell.
fn recv_message(
    k: &mut Kernel,
    cpus: &Cpus,
    filter: RecvFilter,
    m: &mut MsgRef<'_>,
    flags: IpcFlags,
) -> Result<(), UserError> {
    let caller = caller_tid(cpus);

    let copied = match take_pending_notifications(k, caller, filter) {
        Some(msg) => msg,
        None => {
            begin_recv(k, caller, filter, flags)?;
            task::switch(k, cpus);
            finish_recv(k, caller)
        }
    };

    match m {
        MsgRef::Kernel(r) => **r = copied,
        MsgRef::User(ua) => {
            umem::copy_to_user(k, cpus, caller, *ua, copied.as_bytes())?
        }
    }
    Ok(())
}

/// An open receive drains the notification bits first, as a message from
/// the kernel. Closed receives leave them pending.
pub(crate) fn take_pending_notifications(
    k: &mut Kernel,
    caller: Tid,
    filter: RecvFilter,
) -> Option<Message> {
    let me = k.tasks.get_mut(caller);
    if filter == RecvFilter::Any && !me.notifications.is_empty() {
        let msg = Message::notify(me.notifications.bits());
        me.notifications = Notifications::empty();
        Some(msg)
    } else {
        None
    }
}

/// Commits the caller to waiting for a message: picks the oldest parked
/// sender that matches the filter (waking it so it can deliver), then
/// blocks the caller with its receive filter exposed.
pub(crate) fn begin_recv(
    k: &mut Kernel,
    caller: Tid,
    filter: RecvFilter,
    flags: IpcFlags,
) -> Result<(), UserError> {
    let me = k.tasks.get_mut(caller);

    let matched = me.senders.iter().position(|s| match filter {
        RecvFilter::Any => true,
        RecvFilter::From(t) => *s == t,
    });

    let mut wait_for = match filter {
        RecvFilter::Any => WaitFor::Any,
        RecvFilter::From(t) => WaitFor::Task(t),
    };

    match matched {
        Some(pos) => {
            let sender = remove_sender_at(me, pos);
            let s = k.tasks.get(sender);
            uassert!(s.state == TaskState::Blocked);
            uassert!(s.wait_for == WaitFor::Deny);
            task::resume(&mut k.tasks, sender);
            // Close the receive down to this sender so nobody else slips a
            // message in between its wakeup and its delivery.
            wait_for = WaitFor::Task(sender);
        }
        None => {
            if flags.contains(IpcFlags::NOBLOCK) {
                return Err(Error::WouldBlock.into());
            }
        }
    }

    let me = k.tasks.get_mut(caller);
    me.wait_for = wait_for;
    task::block(me);
    Ok(())
}

/// After the wakeup: the message is in our slot. Close the filter again
/// and hand it out.
pub(crate) fn finish_recv(k: &mut Kernel, caller: Tid) -> Message {
    let me = k.tasks.get_mut(caller);
    me.wait_for = WaitFor::Deny;
    me.m
}

fn remove_sender_at(task: &mut task::Task, pos: usize) -> Tid {
    let mut keep: heapless::Deque<Tid, { abi::NUM_TASKS_MAX }> = heapless::Deque::new();
    let mut removed = None;
    let mut i = 0;
    while let Some(t) = task.senders.pop_front() {
        if i == pos {
            removed = Some(t);
        } else {
            let _ = keep.push_back(t);
        }
        i += 1;
    }
    task.senders = keep;
    removed.unwrap()
}

/// Posts notification bits to a task. A task blocked in an open receive
/// gets them immediately, folded together with anything already pending,
/// as a kernel message; otherwise they accumulate for its next open
/// receive.
pub fn notify(tasks: &mut TaskTable, dst: Tid, notifications: Notifications) {
    let d = tasks.get_mut(dst);
    uassert!(d.state != TaskState::Unused);

    if d.state == TaskState::Blocked && d.wait_for == WaitFor::Any {
        d.m = Message::notify((d.notifications | notifications).bits());
        d.notifications = Notifications::empty();
        task::resume(tasks, dst);
    } else {
        d.notifications |= notifications;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::test_kernel;
    use crate::task::create_for_test;
    use abi::NotifyPayload;

    const SEND: IpcFlags = IpcFlags::SEND;

    fn msg(ty: i32) -> Message {
        Message {
            ty,
            ..Message::default()
        }
    }

    /// Parks `tid` in an open receive, as if it had called `recv(Any)` and
    /// found nothing.
    fn park_in_recv(k: &mut Kernel, tid: Tid) {
        begin_recv(k, tid, RecvFilter::Any, IpcFlags::RECV).unwrap();
        k.tasks.runq_remove(tid);
    }

    #[test]
    fn direct_hand_off() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let a = create_for_test(&mut k, "alpha", None);
        let b = create_for_test(&mut k, "beta", Some(a));

        park_in_recv(&mut k, b);

        // A's whole send completes on the ready path.
        cpus.get(0).set_current(Current::Task(a));
        let mut m = msg(7);
        ipc(&mut k, &cpus, Some(b), RecvFilter::Any, MsgRef::Kernel(&mut m), SEND | IpcFlags::KERNEL)
            .unwrap();

        // B wakes with the message and an untouched notification set.
        let bt = k.tasks.task(b).unwrap();
        assert_eq!(bt.state(), TaskState::Runnable);
        let got = finish_recv(&mut k, b);
        assert_eq!(got.ty, 7);
        assert_eq!(got.src, Tid::FROM_KERNEL);
        assert!(k.tasks.task(b).unwrap().notifications().is_empty());
    }

    #[test]
    fn user_src_is_recorded_on_delivery() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "alpha", None);
        let b = create_for_test(&mut k, "beta", Some(a));

        park_in_recv(&mut k, b);
        assert!(deliver(&mut k, a, b, &msg(9), false));
        let got = finish_recv(&mut k, b);
        assert_eq!(got.src, a.as_i32());
        assert_eq!(got.ty, 9);
    }

    #[test]
    fn park_then_deliver() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "alpha", None);
        let b = create_for_test(&mut k, "beta", Some(a));

        // B is busy; A parks.
        assert_eq!(try_send(&mut k, a, b, SEND), Ok(false));
        assert_eq!(k.tasks.task(a).unwrap().state(), TaskState::Blocked);
        assert!(k.tasks.get(b).senders.iter().any(|s| *s == a));
        k.tasks.runq_remove(a);

        // B finally receives: A is pulled out of the queue and woken, B
        // commits to hearing from exactly A.
        begin_recv(&mut k, b, RecvFilter::Any, IpcFlags::RECV).unwrap();
        k.tasks.runq_remove(b);
        assert_eq!(k.tasks.task(a).unwrap().state(), TaskState::Runnable);
        assert!(k.tasks.get(b).senders.is_empty());
        assert_eq!(k.tasks.get(b).wait_for, WaitFor::Task(a));

        // A runs again: no abort, so it completes the delivery.
        assert!(!take_abort(&mut k, a));
        assert!(deliver(&mut k, a, b, &msg(42), false));

        assert_eq!(k.tasks.task(b).unwrap().state(), TaskState::Runnable);
        let got = finish_recv(&mut k, b);
        assert_eq!(got.ty, 42);
        assert_eq!(got.src, a.as_i32());
    }

    #[test]
    fn sender_queue_is_fifo() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "alpha", None);
        let b = create_for_test(&mut k, "beta", Some(a));
        let c = create_for_test(&mut k, "gamma", Some(a));

        assert_eq!(try_send(&mut k, b, a, SEND), Ok(false));
        assert_eq!(try_send(&mut k, c, a, SEND), Ok(false));
        k.tasks.runq_remove(b);
        k.tasks.runq_remove(c);

        begin_recv(&mut k, a, RecvFilter::Any, IpcFlags::RECV).unwrap();
        // The earlier sender wins.
        assert_eq!(k.tasks.get(a).wait_for, WaitFor::Task(b));
        // The later one stays parked.
        assert!(k.tasks.get(a).senders.iter().any(|s| *s == c));
    }

    #[test]
    fn closed_receive_skips_other_senders() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "alpha", None);
        let b = create_for_test(&mut k, "beta", Some(a));
        let c = create_for_test(&mut k, "gamma", Some(a));

        assert_eq!(try_send(&mut k, b, a, SEND), Ok(false));

        // A receives from c specifically; b stays parked.
        begin_recv(&mut k, a, RecvFilter::From(c), IpcFlags::RECV).unwrap();
        assert_eq!(k.tasks.get(a).wait_for, WaitFor::Task(c));
        assert!(k.tasks.get(a).senders.iter().any(|s| *s == b));
        // And b's delivery is refused while the receive is closed to c.
        assert!(!deliver(&mut k, b, a, &msg(1), false));
    }

    #[test]
    fn send_to_self_is_rejected() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let a = create_for_test(&mut k, "alpha", None);

        cpus.get(0).set_current(Current::Task(a));
        let mut m = msg(1);
        let r = ipc(
            &mut k,
            &cpus,
            Some(a),
            RecvFilter::Any,
            MsgRef::Kernel(&mut m),
            SEND | IpcFlags::KERNEL,
        );
        assert_eq!(r, Err(UserError::Recoverable(Error::InvalidArg)));
        // No side effects: still runnable, no senders.
        assert_eq!(k.tasks.task(a).unwrap().state(), TaskState::Runnable);
        assert!(k.tasks.get(a).senders.is_empty());
    }

    #[test]
    fn noblock_send_refuses_to_park() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "alpha", None);
        let b = create_for_test(&mut k, "beta", Some(a));

        assert_eq!(
            try_send(&mut k, a, b, SEND | IpcFlags::NOBLOCK),
            Err(UserError::Recoverable(Error::WouldBlock))
        );
        assert_eq!(k.tasks.task(a).unwrap().state(), TaskState::Runnable);
    }

    #[test]
    fn noblock_recv_without_sender_refuses() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "alpha", None);
        let b = create_for_test(&mut k, "beta", Some(a));

        assert_eq!(
            begin_recv(&mut k, a, RecvFilter::Any, IpcFlags::RECV | IpcFlags::NOBLOCK),
            Err(UserError::Recoverable(Error::WouldBlock))
        );

        // With a matching sender parked, the noblock receive proceeds.
        assert_eq!(try_send(&mut k, b, a, SEND), Ok(false));
        k.tasks.runq_remove(b);
        assert!(begin_recv(&mut k, a, RecvFilter::Any, IpcFlags::RECV | IpcFlags::NOBLOCK).is_ok());
    }

    #[test]
    fn deadlock_is_detected() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "alpha", None);
        let b = create_for_test(&mut k, "beta", Some(a));

        // A is parked sending to B.
        assert_eq!(try_send(&mut k, a, b, SEND), Ok(false));

        // B tries to send to A: it would park while A is parked on it.
        assert_eq!(
            try_send(&mut k, b, a, SEND),
            Err(UserError::Recoverable(Error::DeadLock))
        );
        // B was not parked.
        assert_eq!(k.tasks.task(b).unwrap().state(), TaskState::Runnable);
    }

    #[test]
    fn abort_on_destroy() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let a = create_for_test(&mut k, "alpha", None);
        let b = create_for_test(&mut k, "beta", Some(a));
        let c = create_for_test(&mut k, "gamma", Some(a));

        // C parks sending to B; then B's pager destroys B.
        assert_eq!(try_send(&mut k, c, b, SEND), Ok(false));
        k.tasks.runq_remove(c);
        task::destroy(&mut k, &cpus, b).unwrap();

        // C is runnable again and its send unwinds with Aborted.
        assert_eq!(k.tasks.task(c).unwrap().state(), TaskState::Runnable);
        assert!(take_abort(&mut k, c));
        // The bit was consumed by the unwind.
        assert!(k.tasks.task(c).unwrap().notifications().is_empty());
        // And a late delivery attempt against the dead slot is refused.
        assert!(!deliver(&mut k, c, b, &msg(1), false));
    }

    #[test]
    fn notification_fold_into_open_receive() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "alpha", None);

        // Two notifications arrive while A is runnable; they OR together.
        notify(&mut k.tasks, a, Notifications::TIMER);
        notify(&mut k.tasks, a, Notifications::IRQ);

        let m = take_pending_notifications(&mut k, a, RecvFilter::Any).unwrap();
        assert_eq!(m.ty, abi::NOTIFY_MSG);
        assert_eq!(m.src, Tid::FROM_KERNEL);
        let p: NotifyPayload = m.payload();
        assert_eq!(
            p.notifications,
            (Notifications::TIMER | Notifications::IRQ).bits()
        );
        // Bits were cleared by the fold.
        assert!(k.tasks.task(a).unwrap().notifications().is_empty());
    }

    #[test]
    fn notification_beats_parked_sender() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "alpha", None);
        let b = create_for_test(&mut k, "beta", Some(a));

        assert_eq!(try_send(&mut k, b, a, SEND), Ok(false));
        notify(&mut k.tasks, a, Notifications::TIMER);

        // The open receive sees the notification first; b stays parked.
        let m = take_pending_notifications(&mut k, a, RecvFilter::Any).unwrap();
        assert_eq!(m.ty, abi::NOTIFY_MSG);
        assert!(k.tasks.get(a).senders.iter().any(|s| *s == b));
    }

    #[test]
    fn closed_receive_leaves_notifications_pending() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "alpha", None);
        let b = create_for_test(&mut k, "beta", Some(a));

        notify(&mut k.tasks, a, Notifications::TIMER);
        assert!(take_pending_notifications(&mut k, a, RecvFilter::From(b)).is_none());
        assert!(k.tasks.task(a).unwrap().notifications().contains(Notifications::TIMER));
    }

    #[test]
    fn notify_wakes_open_receiver_immediately() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "alpha", None);

        park_in_recv(&mut k, a);
        notify(&mut k.tasks, a, Notifications::IRQ);

        assert_eq!(k.tasks.task(a).unwrap().state(), TaskState::Runnable);
        let m = finish_recv(&mut k, a);
        assert_eq!(m.ty, abi::NOTIFY_MSG);
        let p: NotifyPayload = m.payload();
        assert_eq!(p.notifications, Notifications::IRQ.bits());
    }

    #[test]
    fn notify_does_not_wake_closed_receiver() {
        let mut k = test_kernel();
        let a = create_for_test(&mut k, "alpha", None);
        let b = create_for_test(&mut k, "beta", Some(a));

        begin_recv(&mut k, a, RecvFilter::From(b), IpcFlags::RECV).unwrap();
        k.tasks.runq_remove(a);
        notify(&mut k.tasks, a, Notifications::TIMER);

        assert_eq!(k.tasks.task(a).unwrap().state(), TaskState::Blocked);
        assert!(k.tasks.task(a).unwrap().notifications().contains(Notifications::TIMER));
    }

    #[test]
    fn page_fault_upcall_protocol() {
        // The demand-paging message flow, driven step by step:
        // T faults; its pager P gets the upcall; P replies; T resumes.
        let mut k = test_kernel();
        let p = create_for_test(&mut k, "pager", None);
        let t = create_for_test(&mut k, "task", Some(p));

        park_in_recv(&mut k, p);

        // The kernel composes the upcall on T's behalf and delivers it to
        // P, then T waits for P's reply (a closed receive).
        let upcall = Message::page_fault(
            t,
            0x2000_0000,
            0x100_0040,
            abi::PageFault::READ | abi::PageFault::USER,
        );
        assert!(deliver(&mut k, t, p, &upcall, true));
        let got = finish_recv(&mut k, p);
        assert_eq!(got.ty, abi::PAGE_FAULT_MSG);
        assert_eq!(got.src, Tid::FROM_KERNEL);
        let pf: abi::PageFaultPayload = got.payload();
        assert_eq!(pf.task, t.as_i32());
        assert_eq!(pf.uaddr, 0x2000_0000);

        // T blocks waiting for exactly its pager.
        begin_recv(&mut k, t, RecvFilter::From(p), IpcFlags::RECV).unwrap();
        k.tasks.runq_remove(t);

        // P replies; T wakes with the reply in its slot.
        assert_eq!(try_send(&mut k, p, t, SEND), Ok(true));
        assert!(deliver(&mut k, p, t, &msg(abi::PAGE_FAULT_REPLY_MSG), false));
        assert_eq!(k.tasks.task(t).unwrap().state(), TaskState::Runnable);
        assert_eq!(finish_recv(&mut k, t).ty, abi::PAGE_FAULT_REPLY_MSG);
    }
}
