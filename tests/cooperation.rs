use bfq_core::*;

mod common;
use common::SimDevice;

/// Two sync queues with next requests four sectors apart: the second
/// insert from the later process triggers a merge, and from then on its
/// requests route to the shared queue.
#[test]
fn test_close_cooperators_merge() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());

    dev.insert(2, 1004, 8, true);
    let q2 = dev.sched.sync_queue(Pid(2)).unwrap();

    // With a single busy queue no cooperator lookup happens yet.
    dev.now = 1_000_000;
    dev.insert(1, 1000, 8, true);
    let q1 = dev.sched.sync_queue(Pid(1)).unwrap();
    assert_ne!(q1, q2);

    // The next insert finds the close queue through the position tree.
    dev.now = 2_000_000;
    dev.insert(1, 1008, 8, true);

    assert_eq!(
        dev.sched.sync_queue(Pid(1)),
        Some(q2),
        "process 1 was not redirected to the shared queue"
    );
    let stats = dev.sched.queue_stats(q2).unwrap();
    assert!(stats.coop, "merge target not flagged as shared");
    assert_eq!(stats.queued, 2, "redirected request not on the shared queue");

    // Follow-up requests land on the shared queue directly.
    dev.now = 3_000_000;
    dev.insert(1, 1016, 8, true);
    assert_eq!(dev.sched.queue_stats(q2).unwrap().queued, 3);

    dev.drain(1_000_000_000);
}

/// Once the shared queue turns seeky it is marked for splitting at
/// expiration, and the next request allocation breaks it apart again,
/// restoring a private queue.
#[test]
fn test_drifted_cooperators_split() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());

    dev.insert(2, 1004, 8, true);
    let q2 = dev.sched.sync_queue(Pid(2)).unwrap();
    dev.now = 1_000_000;
    dev.insert(1, 1000, 8, true);
    dev.now = 2_000_000;
    dev.insert(1, 1008, 8, true);
    assert_eq!(dev.sched.sync_queue(Pid(1)), Some(q2));

    dev.drain(1_000_000_000);

    // The cooperators drift apart: requests now scatter across the disk.
    for i in 1..=6u64 {
        dev.now += 1_000_000;
        dev.insert(1, i * 10_000_000, 8, true);
    }
    assert!(dev.sched.queue_stats(q2).unwrap().seeky);

    dev.drain(3_000_000_000);
    assert!(
        dev.sched.queue_stats(q2).unwrap().split_coop,
        "a seeky shared queue must be marked for splitting at expiration"
    );

    // The next allocation from process 1 splits it back out.
    dev.now += 1_000_000;
    dev.insert(1, 2048, 8, true);
    let q_new = dev.sched.sync_queue(Pid(1)).unwrap();
    assert_ne!(q_new, q2, "process 1 still glued to the shared queue");
    let stats = dev.sched.queue_stats(q_new).unwrap();
    assert!(!stats.coop && !stats.split_coop);
    assert!(stats.idle_window, "idle window saved at merge must be restored");

    dev.drain(5_000_000_000);
}
