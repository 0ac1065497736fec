use bfq_core::*;

mod common;
use common::SimDevice;

/// Inserting a request and releasing it unserved leaves every counter
/// where it started.
#[test]
fn test_insert_then_release_is_idempotent() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());

    assert_eq!(dev.sched.nr_queued(), 0);
    let rq = dev.insert(1, 4096, 8, true);
    assert_eq!(dev.sched.nr_queued(), 1);
    assert_eq!(dev.sched.busy_queues(), 1);

    dev.sched.put_request(rq);

    assert_eq!(dev.sched.nr_queued(), 0);
    assert_eq!(dev.sched.busy_queues(), 0);
    assert_eq!(dev.sched.rq_in_driver(), 0);
    dev.sched.check_invariants();
}

/// Forced dispatch drains every class and queue; when the completions
/// arrive, all in-flight accounting returns to zero together.
#[test]
fn test_forced_dispatch_drains_everything() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());

    let mut inserted = Vec::new();
    for pid in 1..=3 {
        for i in 0..4u64 {
            inserted.push(dev.insert(pid, ((pid as u64) << 24) + i * 64, 64, true));
        }
    }
    // One async writer too.
    inserted.push(dev.insert(9, 1 << 30, 64, false));
    assert_eq!(dev.sched.nr_queued(), inserted.len() as u32);

    let mut drained = Vec::new();
    while let Some(rq) = dev.sched.dispatch(dev.now, true) {
        dev.sched.activate_request(rq);
        drained.push(rq);
        dev.sched.check_invariants();
    }

    assert_eq!(drained.len(), inserted.len(), "forced dispatch left requests behind");
    assert_eq!(dev.sched.nr_queued(), 0);
    assert_eq!(dev.sched.busy_queues(), 0);
    assert_eq!(dev.sched.rq_in_driver(), drained.len() as u32);

    for rq in drained {
        dev.now += 64_000;
        dev.sched.completed_request(dev.now, rq);
        dev.sched.check_invariants();
    }
    assert_eq!(dev.sched.rq_in_driver(), 0);
}

/// Exiting a process releases its queues once the outstanding requests
/// complete.
#[test]
fn test_process_exit_releases_queues() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());

    dev.insert(1, 4096, 64, true);
    dev.insert(1, 1 << 20, 64, false);
    assert!(dev.sched.sync_queue(Pid(1)).is_some());
    assert!(dev.sched.async_queue(Pid(1)).is_some());

    dev.drain(1_000_000_000);

    dev.sched.exit_process(dev.now, Pid(1));
    assert!(dev.sched.sync_queue(Pid(1)).is_none());
    assert!(dev.sched.async_queue(Pid(1)).is_none());
    dev.sched.check_invariants();
}

/// While the in-service queue idles for a request of its process, that
/// process's allocations are privileged.
#[test]
fn test_may_queue_while_idling() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());

    // Everyone may queue before anything interesting happens.
    assert_eq!(dev.sched.may_queue(Pid(1), true), MayQueue::May);

    dev.insert(1, 4096, 8, true);
    dev.drain_to_idle_window();

    // The queue is now waiting with the idle timer armed.
    assert!(dev.sched.idle_timer_deadline().is_some());
    assert_eq!(dev.sched.may_queue(Pid(1), true), MayQueue::Must);
    // The privilege is consumed by the check.
    assert_eq!(dev.sched.may_queue(Pid(1), true), MayQueue::May);

    dev.drain(2_000_000_000);
}

/// Tearing down an empty group is allowed; tearing down a group with busy
/// children is refused.
#[test]
fn test_group_lifecycle() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());

    let g = dev.sched.add_group(None, 100).unwrap();
    dev.sched.set_process_group(Pid(1), g).unwrap();

    dev.insert(1, 4096, 64, true);
    assert!(
        dev.sched.remove_group(dev.now, g).is_err(),
        "a group with a busy queue must not be removable"
    );

    dev.drain(1_000_000_000);
    dev.sched.exit_process(dev.now, Pid(1));
    dev.sched.remove_group(dev.now, g).unwrap();
    dev.sched.check_invariants();
}
