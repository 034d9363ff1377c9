//! Implementation of tasks: the task table, lifecycle transitions, and the
//! scheduler.
//!
//! Tasks live in a fixed table of `NUM_TASKS_MAX` slots; task ids are the
//! slot index plus one. Each CPU additionally owns an idle task outside the
//! table (diagnostic id 0) that soaks up time when the run queue is empty.
//!
//! A task suspends only at well-defined points -- blocking IPC, the
//! page-fault upcall, quantum expiry, `exit` -- and always via `block` +
//! `switch` while holding the big kernel lock. The context switch is
//! stackful: the suspended task's kernel continuation lives on its own
//! kernel stack until something resumes it.

use abi::{
    Error, ExceptionReason, IpcFlags, Message, Notifications, Tid, NUM_TASKS_MAX,
    TASK_NAME_LEN,
};
use heapless::{Deque, String};

use crate::arch;
use crate::config::{KERNEL_STACK_SIZE, NUM_CPUS_MAX, TASK_QUANTUM};
use crate::ipc::{self, MsgRef, RecvFilter};
use crate::mp::{Cpus, Current, IpiReason};
use crate::pm::PhysMemory;
use crate::startup::Kernel;
use crate::vm::{self, AddrSpace};
use crate::{mp, Paddr};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Unused,
    Runnable,
    Blocked,
}

/// A blocked task's receive filter. `Deny` means the task is not receiving
/// at all (it is parked in a send, waiting on a timer, or exited).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitFor {
    Deny,
    Any,
    Task(Tid),
}

/// Where a freshly created task starts executing.
pub enum TaskEntry {
    /// Enter user mode at `ip`.
    User { ip: u32 },
    /// Stay in kernel mode and call `func(arg)`. Used by the idle tasks and
    /// the bytecode interpreter.
    Kernel {
        func: extern "C" fn(usize) -> !,
        arg: usize,
    },
}

/// Saved kernel-side execution context for the stackful switch.
#[derive(Copy, Clone, Debug, Default)]
pub struct Context {
    /// Kernel stack pointer to resume from.
    pub sp: u32,
    /// Top of the kernel stack, installed for trap entry while the task
    /// runs.
    pub sp_top: u32,
}

pub struct Task {
    /// Slot id, or 0 for a per-CPU idle task.
    pub(crate) id: i32,
    pub(crate) name: String<TASK_NAME_LEN>,
    pub(crate) state: TaskState,
    /// Set at the start of destruction so no scheduler picks the task up
    /// again while we wait for it to stop running elsewhere.
    pub(crate) destroyed: bool,
    /// The task servicing this task's page faults and exceptions. A weak
    /// reference: liveness is enforced through `ref_count`, not the type.
    pub pager: Option<Tid>,
    /// Number of other tasks naming this task as their pager.
    pub(crate) ref_count: u32,
    /// Remaining CPU time, in ticks.
    pub(crate) quantum: u32,
    /// Remaining `time` syscall countdown, in ticks. 0 = disarmed.
    pub(crate) timeout: u32,
    pub(crate) wait_for: WaitFor,
    /// Tasks parked waiting to send to this task, oldest first.
    pub(crate) senders: Deque<Tid, NUM_TASKS_MAX>,
    pub(crate) notifications: Notifications,
    /// The embedded message slot. Written by a sender delivering to this
    /// task; read back out when this task completes a receive.
    pub(crate) m: Message,
    pub vm: AddrSpace,
    /// Bottom of the task's kernel stack (exclusively owned).
    pub(crate) kstack: Paddr,
    pub(crate) ctx: Context,
}

impl Task {
    fn unused() -> Self {
        Task {
            id: 0,
            name: String::new(),
            state: TaskState::Unused,
            destroyed: false,
            pager: None,
            ref_count: 0,
            quantum: 0,
            timeout: 0,
            wait_for: WaitFor::Deny,
            senders: Deque::new(),
            notifications: Notifications::empty(),
            m: Message::default(),
            vm: AddrSpace { root: 0 },
            kstack: 0,
            ctx: Context::default(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn notifications(&self) -> Notifications {
        self.notifications
    }

    pub fn message(&self) -> &Message {
        &self.m
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct TaskTable {
    slots: [Task; NUM_TASKS_MAX],
    idles: [Task; NUM_CPUS_MAX],
    /// Runnable tasks not currently running on any CPU, oldest first.
    runq: Deque<Tid, NUM_TASKS_MAX>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Task::unused()),
            idles: core::array::from_fn(|_| Task::unused()),
            runq: Deque::new(),
        }
    }

    /// Looks up a live task by id.
    pub fn task(&self, tid: Tid) -> Result<&Task, Error> {
        let t = &self.slots[tid.index()];
        if t.state == TaskState::Unused {
            return Err(Error::InvalidTask);
        }
        Ok(t)
    }

    pub fn task_mut(&mut self, tid: Tid) -> Result<&mut Task, Error> {
        let t = &mut self.slots[tid.index()];
        if t.state == TaskState::Unused {
            return Err(Error::InvalidTask);
        }
        Ok(t)
    }

    /// Unchecked slot access for code that has already validated `tid`.
    pub(crate) fn get_mut(&mut self, tid: Tid) -> &mut Task {
        &mut self.slots[tid.index()]
    }

    pub(crate) fn get(&self, tid: Tid) -> &Task {
        &self.slots[tid.index()]
    }

    /// Resolves what a CPU is running to the actual task record.
    pub(crate) fn current_mut(&mut self, c: Current, cpu: usize) -> &mut Task {
        match c {
            Current::Idle => &mut self.idles[cpu],
            Current::Task(tid) => &mut self.slots[tid.index()],
        }
    }

    fn alloc_tid(&self) -> Option<Tid> {
        self.slots
            .iter()
            .position(|t| t.state == TaskState::Unused)
            .map(Tid::from_index)
    }

    /// Ids of every in-use slot.
    pub fn active_tids(&self) -> impl Iterator<Item = Tid> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state != TaskState::Unused)
            .map(|(i, _)| Tid::from_index(i))
    }

    pub(crate) fn runq_push(&mut self, tid: Tid) {
        uassert!(self.runq.iter().all(|t| *t != tid));
        if self.runq.push_back(tid).is_err() {
            // Capacity equals the task count, so this can't happen unless
            // the queue invariant above is already broken.
            panic!("run queue overflow");
        }
    }

    pub(crate) fn runq_pop(&mut self) -> Option<Tid> {
        self.runq.pop_front()
    }

    pub(crate) fn runq_contains(&self, tid: Tid) -> bool {
        self.runq.iter().any(|t| *t == tid)
    }

    pub(crate) fn runq_remove(&mut self, tid: Tid) {
        let mut keep: Deque<Tid, NUM_TASKS_MAX> = Deque::new();
        while let Some(t) = self.runq.pop_front() {
            if t != tid {
                let _ = keep.push_back(t);
            }
        }
        self.runq = keep;
    }
}

/// Puts a runnable task to sleep. The caller follows up with `switch` if
/// the task is the one it is running on.
pub fn block(task: &mut Task) {
    uassert!(task.state == TaskState::Runnable);
    task.state = TaskState::Blocked;
}

/// Wakes a blocked task and queues it for execution.
pub fn resume(tasks: &mut TaskTable, tid: Tid) {
    let t = tasks.get_mut(tid);
    uassert!(t.state == TaskState::Blocked);
    t.state = TaskState::Runnable;
    tasks.runq_push(tid);
}

/// Picks the next task for this CPU: the head of the run queue, else the
/// current task if it can keep going, else the idle task.
fn scheduler(k: &mut Kernel, cpus: &Cpus, cpu: usize) -> Current {
    // Tasks flagged for destruction stay queued (their destroyer is
    // waiting to observe them there) but are never selected again.
    for _ in 0..k.tasks.runq.len() {
        let next = k.tasks.runq_pop().unwrap();
        if k.tasks.get(next).destroyed {
            let _ = k.tasks.runq.push_back(next);
            continue;
        }
        return Current::Task(next);
    }

    if let Current::Task(tid) = cpus.get(cpu).current() {
        let t = k.tasks.get(tid);
        if t.state == TaskState::Runnable && !t.destroyed {
            return Current::Task(tid);
        }
    }

    Current::Idle
}

/// Voluntary task switch. Returns immediately if nothing else is runnable;
/// otherwise hands the CPU over and returns whenever this task is next
/// scheduled (possibly on another CPU).
pub fn switch(k: &mut Kernel, cpus: &Cpus) {
    let cpu = arch::cpu_id();
    let cv = cpus.get(cpu);
    let prev = cv.current();
    let next = scheduler(k, cpus, cpu);

    if next == prev {
        return;
    }

    // The incoming task gets a fresh slice of CPU time.
    if let Current::Task(tid) = next {
        k.tasks.get_mut(tid).quantum = TASK_QUANTUM;
    }

    // A preempted (still runnable) task goes to the back of the queue.
    if let Current::Task(tid) = prev {
        if k.tasks.get(tid).state == TaskState::Runnable {
            k.tasks.runq_push(tid);
        }
    }

    cv.set_current(next);

    let prev_sp = &mut k.tasks.current_mut(prev, cpu).ctx.sp as *mut u32;
    let next_task = k.tasks.current_mut(next, cpu);
    let (next_sp, next_sp_top, next_root) =
        (next_task.ctx.sp, next_task.ctx.sp_top, next_task.vm.root);

    // Hand the trap-entry path the incoming task's kernel stack and address
    // space, then swap execution contexts. When this call returns, the
    // *previous* task has been rescheduled -- possibly much later and on a
    // different CPU.
    arch::set_kernel_sp(next_sp_top);
    arch::activate_vm(next_root);
    unsafe {
        arch::switch_context(prev_sp, next_sp);
    }
}

/// Common task-slot initialization: address space, kernel stack, initial
/// switch context. The slot is left `Blocked`; the caller resumes it.
fn init_task_struct(
    pm: &mut PhysMemory,
    kvm_root: Paddr,
    task: &mut Task,
    id: i32,
    name: &str,
    entry: TaskEntry,
    pager: Option<Tid>,
) -> Result<(), Error> {
    let vm = vm::init(pm, kvm_root)?;

    let kstack = match pm.alloc(
        KERNEL_STACK_SIZE,
        None,
        // Size-aligned so the canary slot can be found by masking the
        // stack pointer.
        abi::PmFlags::ALIGNED,
    ) {
        Ok(p) => p,
        Err(e) => {
            vm::destroy(pm, kvm_root, vm);
            return Err(e);
        }
    };

    let sp_top = kstack + KERNEL_STACK_SIZE as u32;
    let sp = arch::init_task_context(sp_top, &entry);

    task.id = id;
    task.name = String::new();
    let _ = task.name.push_str(name);
    task.destroyed = false;
    task.pager = pager;
    task.ref_count = 0;
    task.quantum = 0;
    task.timeout = 0;
    task.wait_for = WaitFor::Deny;
    task.senders = Deque::new();
    task.notifications = Notifications::empty();
    task.m = Message::default();
    task.vm = vm;
    task.kstack = kstack;
    task.ctx = Context { sp, sp_top };
    task.state = TaskState::Blocked;
    Ok(())
}

/// Creates a user task. `ip` is its user-mode entry point; `pager` services
/// its page faults (only the bootstrap task runs without one).
pub fn create(
    k: &mut Kernel,
    name: &str,
    ip: u32,
    pager: Option<Tid>,
) -> Result<Tid, Error> {
    let tid = k.tasks.alloc_tid().ok_or(Error::TooManyTasks)?;

    let kvm_root = k.kvm.root;
    let slot = &mut k.tasks.slots[tid.index()];
    init_task_struct(
        &mut k.pm,
        kvm_root,
        slot,
        tid.as_i32(),
        name,
        TaskEntry::User { ip },
        pager,
    )?;

    if let Some(p) = pager {
        k.tasks.get_mut(p).ref_count += 1;
    }

    resume(&mut k.tasks, tid);
    klog!("created a task \"{}\" (tid={})", name, tid.as_i32());
    Ok(tid)
}

/// Creates a bytecode task: a kernel-mode task running the interpreter over
/// a validated program copied into a kernel-owned page.
pub fn create_hinavm(
    k: &mut Kernel,
    name: &str,
    insts: &[u32],
    pager: Tid,
) -> Result<Tid, Error> {
    let tid = k.tasks.alloc_tid().ok_or(Error::TooManyTasks)?;

    let (prog_paddr, prog_size) = crate::hinavm::stage_program(&mut k.pm, insts)?;

    let kvm_root = k.kvm.root;
    let slot = &mut k.tasks.slots[tid.index()];
    if let Err(e) = init_task_struct(
        &mut k.pm,
        kvm_root,
        slot,
        tid.as_i32(),
        name,
        TaskEntry::Kernel {
            func: crate::hinavm::task_entry,
            arg: arch::paddr_to_vaddr(prog_paddr) as usize,
        },
        Some(pager),
    ) {
        k.pm.free(prog_paddr, prog_size);
        return Err(e);
    }

    // The program page was allocated before its owner existed; adopt it so
    // destruction releases it.
    k.pm.set_owner(prog_paddr, tid);
    k.tasks.get_mut(pager).ref_count += 1;

    resume(&mut k.tasks, tid);
    klog!("created a bytecode task \"{}\" (tid={})", name, tid.as_i32());
    Ok(tid)
}

/// Destroys a task. The caller must not be the victim (a task ends itself
/// with `exit` instead).
pub fn destroy(k: &mut Kernel, cpus: &Cpus, tid: Tid) -> Result<(), Error> {
    {
        let victim = k.tasks.task(tid)?;

        if tid == Tid::VM_SERVER {
            // The bootstrap task backs everyone else; it never dies.
            klog!("tried to destroy task #1");
            return Err(Error::InvalidArg);
        }

        if victim.ref_count > 0 {
            klog!(
                "\"{}\" (tid={}) is still referenced by {} tasks",
                victim.name,
                tid.as_i32(),
                victim.ref_count
            );
            return Err(Error::StillUsed);
        }
    }

    klog!(
        "destroying task \"{}\" (tid={})",
        k.tasks.get(tid).name,
        tid.as_i32()
    );

    // From here on no scheduler may pick the task up again; without this,
    // the wait below could chase it from CPU to CPU forever.
    k.tasks.get_mut(tid).destroyed = true;

    // Wait until no other CPU is in the middle of running the victim. A
    // runnable task that is *in the run queue* is, by the queue invariant,
    // not running anywhere.
    loop {
        if k.tasks.get(tid).state != TaskState::Runnable {
            break;
        }
        if k.tasks.runq_contains(tid) {
            break;
        }
        // Note: this drops and retakes the big lock while the peers drain
        // the IPI, which is what lets them reschedule at all.
        mp::send_ipi(cpus, IpiReason::RESCHEDULE);
    }
    uassert!(!cpus.running_somewhere(tid));

    // Anyone parked waiting to send to the victim learns the hard way.
    while let Some(sender) = k.tasks.get_mut(tid).senders.pop_front() {
        let s = k.tasks.get_mut(sender);
        s.notifications |= Notifications::ABORTED;
        resume(&mut k.tasks, sender);
    }

    // The victim itself may be queued to run, or parked in somebody else's
    // sender queue; unlink it from both.
    k.tasks.runq_remove(tid);
    for i in 0..NUM_TASKS_MAX {
        let other = &mut k.tasks.slots[i];
        if other.state != TaskState::Unused {
            let mut keep: Deque<Tid, NUM_TASKS_MAX> = Deque::new();
            while let Some(t) = other.senders.pop_front() {
                if t != tid {
                    let _ = keep.push_back(t);
                }
            }
            other.senders = keep;
        }
    }

    // Tear the resources down: address space, kernel stack, owned frames,
    // IRQ lines, and the pager reference.
    let (space, kstack, pager) = {
        let victim = k.tasks.get(tid);
        (victim.vm, victim.kstack, victim.pager)
    };
    vm::destroy(&mut k.pm, k.kvm.root, space);
    k.pm.free(kstack, KERNEL_STACK_SIZE);
    k.pm.free_all_owned(tid);
    k.irqs.unlisten_all(tid);

    let pager = pager.expect("destroyable task had no pager");
    k.tasks.get_mut(pager).ref_count -= 1;

    *k.tasks.get_mut(tid) = Task::unused();
    Ok(())
}

/// Terminates the calling task: reports the reason to its pager and blocks
/// forever. The pager is responsible for calling `destroy` to reap the
/// slot.
pub fn exit(k: &mut Kernel, cpus: &Cpus, reason: ExceptionReason) -> ! {
    let me = match cpus.get(arch::cpu_id()).current() {
        Current::Task(tid) => tid,
        Current::Idle => panic!("idle task tried to exit"),
    };

    let pager = k
        .tasks
        .get(me)
        .pager
        .expect("exiting task has no pager");

    klog!(
        "exiting task \"{}\" (tid={})",
        k.tasks.get(me).name,
        me.as_i32()
    );

    // Tell the pager why. It calls task_destroy once it has cleaned up.
    let mut m = Message::exception(me, reason);
    let err = ipc::ipc(
        k,
        cpus,
        Some(pager),
        RecvFilter::Any,
        MsgRef::Kernel(&mut m),
        IpcFlags::SEND | IpcFlags::KERNEL,
    );
    if let Err(e) = err {
        klog!(
            "#{}: failed to send the exit message: {:?}",
            me.as_i32(),
            e
        );
    }

    let t = k.tasks.get_mut(me);
    block(t);
    switch(k, cpus);

    // This task is blocked with no receive filter; nothing can legally
    // resume it before `destroy` recycles the slot.
    panic!("exited task resumed");
}

/// Prints every active task's state to the console. Wired to the console's
/// Ctrl-P hotkey; the output format is meant for deadlock archaeology.
pub fn dump(k: &Kernel) {
    klog!("active tasks:");
    for tid in k.tasks.active_tids() {
        let t = k.tasks.get(tid);
        match t.state {
            TaskState::Runnable => {
                klog!("  #{}: {}: RUNNABLE", t.id, t.name);
                for s in t.senders.iter() {
                    klog!("    blocked sender: #{}", s.as_i32());
                }
            }
            TaskState::Blocked => match t.wait_for {
                WaitFor::Deny => {
                    klog!("  #{}: {}: BLOCKED (send, timer wait, or exited)", t.id, t.name)
                }
                WaitFor::Any => klog!("  #{}: {}: BLOCKED (open receive)", t.id, t.name),
                WaitFor::Task(src) => klog!(
                    "  #{}: {}: BLOCKED (closed receive from #{})",
                    t.id,
                    t.name,
                    src.as_i32()
                ),
            },
            TaskState::Unused => unreachable!(),
        }
    }
}

/// Creates this CPU's idle task and installs it as the running task. The
/// boot path *becomes* the idle task: the context saved here on the first
/// switch is the boot stack's.
pub fn init_percpu(k: &mut Kernel, cpus: &Cpus, cpu: usize) {
    let kvm_root = k.kvm.root;
    let idle = &mut k.tasks.idles[cpu];
    init_task_struct(
        &mut k.pm,
        kvm_root,
        idle,
        0,
        "(idle)",
        TaskEntry::Kernel {
            func: crate::startup::idle_entry,
            arg: cpu,
        },
        None,
    )
    .expect("failed to set up the idle task");

    // Until the first dispatch, traps land on the idle task's kernel
    // stack. (The boot path itself keeps running on the boot stack.)
    arch::set_kernel_sp(k.tasks.idles[cpu].ctx.sp_top);
    cpus.get(cpu).set_current(Current::Idle);
}

#[cfg(test)]
pub(crate) fn create_for_test(k: &mut Kernel, name: &str, pager: Option<Tid>) -> Tid {
    create(k, name, 0x0100_0000, pager).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::test_kernel;

    #[test]
    fn create_fills_lowest_slot_and_resumes() {
        let mut k = test_kernel();
        let a = create(&mut k, "alpha", 0x100_0000, None).unwrap();
        let b = create(&mut k, "beta", 0x100_0000, Some(a)).unwrap();

        assert_eq!(a.as_i32(), 1);
        assert_eq!(b.as_i32(), 2);
        assert_eq!(k.tasks.task(a).unwrap().state(), TaskState::Runnable);
        assert!(k.tasks.runq_contains(a));
        assert!(k.tasks.runq_contains(b));
        // b names a as pager, so a is pinned.
        assert_eq!(k.tasks.task(a).unwrap().ref_count, 1);
    }

    #[test]
    fn capacity_is_enforced_and_recovered() {
        let mut k = test_kernel();
        let first = create(&mut k, "t", 0x100_0000, None).unwrap();
        let mut last = first;
        for _ in 1..NUM_TASKS_MAX {
            last = create(&mut k, "t", 0x100_0000, Some(first)).unwrap();
        }
        assert_eq!(
            create(&mut k, "overflow", 0x100_0000, Some(first)),
            Err(Error::TooManyTasks)
        );

        let cpus = Cpus::new();
        destroy(&mut k, &cpus, last).unwrap();
        assert!(create(&mut k, "again", 0x100_0000, Some(first)).is_ok());
    }

    #[test]
    fn destroy_preconditions() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let a = create(&mut k, "alpha", 0x100_0000, None).unwrap();
        let b = create(&mut k, "beta", 0x100_0000, Some(a)).unwrap();

        // Task #1 is indestructible.
        assert_eq!(destroy(&mut k, &cpus, a), Err(Error::InvalidArg));

        // A pager with live clients is pinned.
        let c = create(&mut k, "gamma", 0x100_0000, Some(b)).unwrap();
        assert_eq!(destroy(&mut k, &cpus, b), Err(Error::StillUsed));

        destroy(&mut k, &cpus, c).unwrap();
        destroy(&mut k, &cpus, b).unwrap();
        assert_eq!(k.tasks.task(b).err(), Some(Error::InvalidTask));
    }

    #[test]
    fn destroy_releases_owned_frames() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let a = create(&mut k, "alpha", 0x100_0000, None).unwrap();
        let b = create(&mut k, "beta", 0x100_0000, Some(a)).unwrap();

        let p = k
            .pm
            .alloc(abi::PAGE_SIZE, Some(b), abi::PmFlags::ZEROED)
            .unwrap();
        vm::map(
            &mut k,
            &cpus,
            b,
            0x2000_0000,
            p,
            abi::PageAttrs::READABLE | abi::PageAttrs::WRITABLE | abi::PageAttrs::USER,
        )
        .unwrap();
        assert_eq!(k.pm.info(p).unwrap().0.ref_count, 2);

        destroy(&mut k, &cpus, b).unwrap();
        // Both the mapping and the allocation reference are gone.
        assert_eq!(k.pm.info(p).unwrap().0.ref_count, 0);
    }

    #[test]
    fn scheduler_prefers_queue_then_current_then_idle() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let a = create(&mut k, "alpha", 0x100_0000, None).unwrap();
        let b = create(&mut k, "beta", 0x100_0000, Some(a)).unwrap();

        // Queue is [a, b]; idle CPU takes a first.
        switch(&mut k, &cpus);
        assert_eq!(cpus.get(0).current(), Current::Task(a));
        assert_eq!(k.tasks.get(a).quantum, TASK_QUANTUM);
        assert!(!k.tasks.runq_contains(a));

        // a is still runnable: a switch puts it at the back and takes b.
        switch(&mut k, &cpus);
        assert_eq!(cpus.get(0).current(), Current::Task(b));
        assert!(k.tasks.runq_contains(a));

        // Block b with an empty queue -> back to a.
        k.tasks.runq_remove(a);
        block(k.tasks.get_mut(b));
        switch(&mut k, &cpus);
        assert_eq!(cpus.get(0).current(), Current::Task(a));

        // Nothing else runnable and current blocked -> idle.
        block(k.tasks.get_mut(a));
        switch(&mut k, &cpus);
        assert_eq!(cpus.get(0).current(), Current::Idle);
    }

    #[test]
    fn runnable_task_is_running_xor_queued() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let a = create(&mut k, "alpha", 0x100_0000, None).unwrap();

        // Created: queued, not running.
        assert!(k.tasks.runq_contains(a));
        switch(&mut k, &cpus);
        // Running: not queued.
        assert_eq!(cpus.get(0).current(), Current::Task(a));
        assert!(!k.tasks.runq_contains(a));
    }

    #[test]
    fn destroyed_flag_keeps_scheduler_away() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let a = create(&mut k, "alpha", 0x100_0000, None).unwrap();
        switch(&mut k, &cpus);
        assert_eq!(cpus.get(0).current(), Current::Task(a));

        // With the flag set and nothing queued, the CPU falls to idle even
        // though the task is still technically runnable.
        k.tasks.get_mut(a).destroyed = true;
        switch(&mut k, &cpus);
        assert_eq!(cpus.get(0).current(), Current::Idle);

        // A flagged task sitting in the run queue is passed over (but
        // stays queued, where its destroyer expects to find it).
        let b = create(&mut k, "beta", 0x100_0000, Some(a)).unwrap();
        k.tasks.get_mut(b).destroyed = true;
        switch(&mut k, &cpus);
        assert_eq!(cpus.get(0).current(), Current::Idle);
        assert!(k.tasks.runq_contains(b));
    }

    #[test]
    fn destroy_aborts_parked_senders() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let a = create(&mut k, "alpha", 0x100_0000, None).unwrap();
        let b = create(&mut k, "beta", 0x100_0000, Some(a)).unwrap();
        let c = create(&mut k, "gamma", 0x100_0000, Some(a)).unwrap();

        // Park c in b's sender queue by hand (the IPC tests drive the real
        // path; this one watches destroy's side of the contract).
        k.tasks.get_mut(b).senders.push_back(c).unwrap();
        block(k.tasks.get_mut(c));
        k.tasks.runq_remove(c);

        destroy(&mut k, &cpus, b).unwrap();
        let ct = k.tasks.task(c).unwrap();
        assert_eq!(ct.state(), TaskState::Runnable);
        assert!(ct.notifications().contains(Notifications::ABORTED));
    }
}
