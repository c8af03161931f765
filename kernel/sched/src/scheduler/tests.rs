use super::*;
use std::collections::HashMap;

fn dummy_ctx() -> TrapFrame {
    TrapFrame::default()
}

const FAKE_DIR: PhysAddr = PhysAddr::new(0x0010_0000);
const FAKE_DIR_2: PhysAddr = PhysAddr::new(0x0020_0000);
const USER_ENTRY: u32 = 0x0804_8000;

fn init_scheduler() -> (Scheduler, Pid) {
    let mut sched = Scheduler::new();
    let init_pid = sched.init().unwrap();
    (sched, init_pid)
}

/// Replaces the init process with `n` kernel threads so rotation involves
/// exactly those threads: exit init, then tick once to reap it.
fn scheduler_with_kernel_threads(n: usize) -> (Scheduler, Vec<Pid>) {
    let (mut sched, init_pid) = init_scheduler();
    let pids: Vec<Pid> = (0..n)
        .map(|i| sched.spawn_kernel(&format!("worker{i}"), 0xC010_0000 + i as u32).unwrap())
        .collect();
    assert!(sched.exit(init_pid, 0).unwrap());
    let mut ctx = dummy_ctx();
    match sched.tick(&mut ctx) {
        TickAction::Switch { .. } => {}
        other => panic!("expected switch away from dead init, got {other:?}"),
    }
    (sched, pids)
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

#[test]
fn init_builds_current_running_thread() {
    let (sched, init_pid) = init_scheduler();

    let cur = sched.current().expect("current thread");
    assert_eq!(sched.thread_state(cur), Some(ThreadState::Running));
    assert_eq!(sched.current_pid(), Some(init_pid));

    let proc = sched.find_by_pid(init_pid).unwrap();
    assert_eq!(proc.name, "init");
    assert!(proc.page_dir.is_none(), "init borrows the kernel directory");
    assert_eq!(proc.main_thread, Some(cur));
    assert!(sched.current_kstack_top().is_some());
}

#[test]
fn tick_without_current_continues() {
    let mut sched = Scheduler::new();
    let mut ctx = dummy_ctx();
    assert!(matches!(sched.tick(&mut ctx), TickAction::Continue));
}

// ---------------------------------------------------------------------------
// Tick: timeslice and rotation
// ---------------------------------------------------------------------------

#[test]
fn lone_thread_keeps_running_with_refill() {
    let (mut sched, _) = init_scheduler();
    let mut ctx = dummy_ctx();

    // Far beyond one timeslice: with an empty ready queue the current
    // thread is refilled and keeps the CPU.
    for _ in 0..35 {
        assert!(matches!(sched.tick(&mut ctx), TickAction::Continue));
    }
    assert_eq!(sched.ticks(), 35);
}

#[test]
fn tick_snapshots_running_frame_pointer() {
    let (mut sched, _) = init_scheduler();
    let cur = sched.current().unwrap();

    let mut ctx = dummy_ctx();
    ctx.eax = 0x1234;
    sched.tick(&mut ctx);

    let saved = sched.thread_frame(cur).expect("snapshot taken");
    assert_eq!(saved.eax, 0x1234);
}

#[test]
fn preemption_after_full_timeslice() {
    let (mut sched, init_pid) = init_scheduler();
    let worker = sched.spawn_kernel("worker", 0xC010_0000).unwrap();
    let worker_tid = sched.find_by_pid(worker).unwrap().main_thread.unwrap();
    let init_tid = sched.current().unwrap();

    let mut ctx = dummy_ctx();
    // Nine ticks: timeslice 10 → 1, no switch.
    for _ in 0..DEFAULT_TIMESLICE - 1 {
        assert!(matches!(sched.tick(&mut ctx), TickAction::Continue));
    }

    // Tenth tick expires the slice: init is demoted and worker promoted.
    match sched.tick(&mut ctx) {
        TickAction::Switch { kstack_top, switch_dir, .. } => {
            assert_eq!(sched.current(), Some(worker_tid));
            assert_eq!(kstack_top, sched.current_kstack_top().unwrap());
            // Different process, kernel directory target.
            assert_eq!(switch_dir, Some(DirTarget::Kernel));
        }
        other => panic!("expected a switch, got {other:?}"),
    }

    assert_eq!(sched.thread_state(init_tid), Some(ThreadState::Ready));
    assert_eq!(sched.thread_state(worker_tid), Some(ThreadState::Running));
    assert_eq!(sched.current_pid(), Some(worker));
    assert_ne!(sched.current_pid(), Some(init_pid));
}

#[test]
fn rotation_is_fifo() {
    let (mut sched, pids) = scheduler_with_kernel_threads(3);
    let tids: Vec<Tid> = pids
        .iter()
        .map(|p| sched.find_by_pid(*p).unwrap().main_thread.unwrap())
        .collect();

    // The reap tick already promoted the first worker.
    assert_eq!(sched.current(), Some(tids[0]));

    let mut ctx = dummy_ctx();
    let mut order = Vec::new();
    for _ in 0..3 {
        for _ in 0..DEFAULT_TIMESLICE {
            sched.tick(&mut ctx);
        }
        order.push(sched.current().unwrap());
    }
    assert_eq!(order, [tids[1], tids[2], tids[0]], "strict FIFO rotation");
}

#[test]
fn no_dir_switch_between_threads_of_one_process() {
    let (mut sched, init_pid) = init_scheduler();
    let second = sched.create_thread(init_pid, 0xC010_0000).unwrap();

    let mut ctx = dummy_ctx();
    for _ in 0..DEFAULT_TIMESLICE - 1 {
        sched.tick(&mut ctx);
    }
    match sched.tick(&mut ctx) {
        TickAction::Switch { switch_dir, .. } => {
            assert_eq!(sched.current(), Some(second));
            assert_eq!(switch_dir, None, "same process keeps its directory");
        }
        other => panic!("expected a switch, got {other:?}"),
    }
}

#[test]
fn fairness_over_300_ticks() {
    let (mut sched, pids) = scheduler_with_kernel_threads(3);
    let tids: Vec<Tid> = pids
        .iter()
        .map(|p| sched.find_by_pid(*p).unwrap().main_thread.unwrap())
        .collect();

    let mut ctx = dummy_ctx();
    let mut running_ticks: HashMap<Tid, u32> = HashMap::new();
    for _ in 0..300 {
        let charged = sched.current().unwrap();
        sched.tick(&mut ctx);
        *running_ticks.entry(charged).or_default() += 1;
    }

    for tid in &tids {
        let ticks = running_ticks.get(tid).copied().unwrap_or(0);
        assert!(
            (99..=101).contains(&ticks),
            "thread {tid:?} got {ticks} of 300 ticks"
        );
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

#[test]
fn spawn_posts_user_main_thread() {
    let (mut sched, _) = init_scheduler();
    let pid = sched.spawn("/bin/demo", FAKE_DIR, USER_ENTRY, 0).unwrap();

    let proc = sched.find_by_pid(pid).unwrap();
    assert_eq!(proc.name, "/bin/demo");
    assert_eq!(proc.page_dir, Some(FAKE_DIR));
    let tid = proc.main_thread.unwrap();

    assert_eq!(sched.thread_state(tid), Some(ThreadState::Ready));
    assert_eq!(sched.ready_len(), 1);

    let frame = sched.thread_frame(tid).unwrap();
    assert_eq!(frame.eip, USER_ENTRY);
    assert!(frame.from_user_mode());
    assert_eq!(frame.useresp, crate::USER_STACK_TOP);
}

#[test]
fn switch_to_user_process_loads_its_directory() {
    let (mut sched, _) = init_scheduler();
    sched.spawn("/bin/demo", FAKE_DIR, USER_ENTRY, 0).unwrap();

    let mut ctx = dummy_ctx();
    for _ in 0..DEFAULT_TIMESLICE - 1 {
        sched.tick(&mut ctx);
    }
    match sched.tick(&mut ctx) {
        TickAction::Switch { switch_dir, .. } => {
            assert_eq!(switch_dir, Some(DirTarget::User(FAKE_DIR)));
        }
        other => panic!("expected a switch, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Fork
// ---------------------------------------------------------------------------

/// Makes the freshly spawned user process current by retiring init.
fn current_user_process(sched: &mut Scheduler, init_pid: Pid) -> Pid {
    let pid = sched.spawn("/bin/app", FAKE_DIR, USER_ENTRY, 2).unwrap();
    assert!(sched.exit(init_pid, 0).unwrap());
    let mut ctx = dummy_ctx();
    assert!(matches!(sched.tick(&mut ctx), TickAction::Switch { .. }));
    assert_eq!(sched.current_pid(), Some(pid));
    pid
}

#[test]
fn fork_returns_child_pid_to_parent_and_zero_to_child() {
    let (mut sched, init_pid) = init_scheduler();
    let parent_pid = current_user_process(&mut sched, init_pid);

    let parent_tid = sched.current().unwrap();
    let mut ctx = sched.thread_frame(parent_tid).unwrap();
    ctx.eax = 57; // syscall number, about to be overwritten
    ctx.ebx = 0xBEEF;
    ctx.eip = 0x0804_9123;

    let child_pid = sched.fork(&mut ctx, FAKE_DIR_2).unwrap();
    assert_ne!(child_pid, parent_pid);
    assert_eq!(ctx.eax, child_pid.as_u32(), "parent observes the child PID");

    let child = sched.find_by_pid(child_pid).unwrap();
    assert_eq!(child.name, "/bin/app_child");
    assert_eq!(child.priority, 2);
    assert_eq!(child.page_dir, Some(FAKE_DIR_2));

    let child_tid = child.main_thread.unwrap();
    let child_frame = sched.thread_frame(child_tid).unwrap();
    assert_eq!(child_frame.eax, 0, "child observes 0");
    assert_eq!(child_frame.ebx, 0xBEEF);
    assert_eq!(child_frame.eip, 0x0804_9123);

    assert_eq!(sched.thread_state(child_tid), Some(ThreadState::Ready));
    assert_eq!(sched.ready_len(), 1);
}

#[test]
fn forked_child_is_scheduled_with_its_own_directory() {
    let (mut sched, init_pid) = init_scheduler();
    current_user_process(&mut sched, init_pid);

    let parent_tid = sched.current().unwrap();
    let mut ctx = sched.thread_frame(parent_tid).unwrap();
    let child_pid = sched.fork(&mut ctx, FAKE_DIR_2).unwrap();

    let mut tick_ctx = dummy_ctx();
    for _ in 0..DEFAULT_TIMESLICE - 1 {
        sched.tick(&mut tick_ctx);
    }
    match sched.tick(&mut tick_ctx) {
        TickAction::Switch { switch_dir, .. } => {
            assert_eq!(sched.current_pid(), Some(child_pid));
            assert_eq!(switch_dir, Some(DirTarget::User(FAKE_DIR_2)));
        }
        other => panic!("expected a switch, got {other:?}"),
    }
}

#[test]
fn fork_from_kernel_process_is_refused() {
    let (mut sched, _) = init_scheduler();
    let mut ctx = dummy_ctx();
    assert_eq!(sched.fork(&mut ctx, FAKE_DIR).err(), Some(SchedError::NotUserProcess));
}

#[test]
fn fork_without_current_is_refused() {
    let mut sched = Scheduler::new();
    let mut ctx = dummy_ctx();
    assert_eq!(sched.fork(&mut ctx, FAKE_DIR).err(), Some(SchedError::NoCurrentThread));
}

// ---------------------------------------------------------------------------
// Exit and reaping
// ---------------------------------------------------------------------------

#[test]
fn exit_current_defers_to_tick() {
    let (mut sched, init_pid) = init_scheduler();
    let tid = sched.current().unwrap();

    assert!(sched.exit(init_pid, 3).unwrap(), "current exit must be deferred");
    assert_eq!(sched.thread_state(tid), Some(ThreadState::Terminated));
    // The process still exists until the tick path reaps it.
    assert_eq!(sched.find_by_pid(init_pid).unwrap().exit_code, 3);

    // Nothing else runnable: the tick halts forever.
    let mut ctx = dummy_ctx();
    assert!(matches!(sched.tick(&mut ctx), TickAction::Halt));
}

#[test]
fn exit_other_process_reaps_synchronously() {
    let (mut sched, _) = init_scheduler();
    let pid = sched.spawn("/bin/app", FAKE_DIR, USER_ENTRY, 0).unwrap();
    let tid = sched.find_by_pid(pid).unwrap().main_thread.unwrap();

    assert!(!sched.exit(pid, 9).unwrap(), "non-current exit reaps in place");
    assert!(sched.find_by_pid(pid).is_none());
    assert_eq!(sched.thread_state(tid), None);
    assert_eq!(sched.ready_len(), 0);

    // The orphaned address space is handed back for the VMM to free.
    assert_eq!(sched.take_orphaned_dirs(), [FAKE_DIR]);
    assert!(sched.take_orphaned_dirs().is_empty());
}

#[test]
fn terminated_current_is_reaped_on_next_tick() {
    let (mut sched, init_pid) = init_scheduler();
    let worker = sched.spawn_kernel("worker", 0xC010_0000).unwrap();

    assert!(sched.exit(init_pid, 0).unwrap());
    let mut ctx = dummy_ctx();
    match sched.tick(&mut ctx) {
        TickAction::Switch { .. } => {}
        other => panic!("expected a switch, got {other:?}"),
    }

    assert!(sched.find_by_pid(init_pid).is_none(), "init reaped");
    assert_eq!(sched.current_pid(), Some(worker));
    // init borrowed the kernel directory, so nothing is orphaned.
    assert!(sched.take_orphaned_dirs().is_empty());
}

#[test]
fn terminated_thread_in_ready_queue_is_never_scheduled() {
    // A multi-threaded process exits while its second thread is still
    // queued: that thread must be reaped when its turn comes, not handed
    // the CPU.
    let (mut sched, init_pid) = init_scheduler();
    let second = sched.create_thread(init_pid, 0xC010_0000).unwrap();
    let worker = sched.spawn_kernel("worker", 0xC011_0000).unwrap();
    let worker_tid = sched.find_by_pid(worker).unwrap().main_thread.unwrap();

    assert!(sched.exit(init_pid, 0).unwrap());
    assert_eq!(sched.thread_state(second), Some(ThreadState::Terminated));

    // The tick skips the dead queued thread and lands on the worker.
    let mut ctx = dummy_ctx();
    match sched.tick(&mut ctx) {
        TickAction::Switch { .. } => {}
        other => panic!("expected a switch, got {other:?}"),
    }
    assert_eq!(sched.current(), Some(worker_tid));
    assert_eq!(sched.thread_state(second), None, "queued dead thread reaped");
    assert!(sched.find_by_pid(init_pid).is_none(), "whole process reaped");
}

#[test]
fn exit_unknown_pid_fails() {
    let (mut sched, _) = init_scheduler();
    assert_eq!(sched.exit(Pid(99), 0).err(), Some(SchedError::NotFound));
}

#[test]
fn dead_process_directory_is_orphaned_via_tick_reap() {
    let (mut sched, init_pid) = init_scheduler();
    let pid = current_user_process(&mut sched, init_pid);

    assert!(sched.exit(pid, 0).unwrap());
    let mut ctx = dummy_ctx();
    // No other thread: halt, but the thread was not yet reaped (it would
    // be on the next successful switch). Spawn a worker so the reap can
    // complete.
    assert!(matches!(sched.tick(&mut ctx), TickAction::Halt));
    sched.spawn_kernel("idle", 0xC010_0000).unwrap();
    assert!(matches!(sched.tick(&mut ctx), TickAction::Switch { .. }));

    assert!(sched.find_by_pid(pid).is_none());
    assert_eq!(sched.take_orphaned_dirs(), [FAKE_DIR]);
}
