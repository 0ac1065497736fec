use bfq_core::*;

mod common;
use common::{GreedyProc, SimDevice};

/// Nine queues created 10ms apart: reaching the large-burst threshold of 8
/// flags every listed queue plus the newcomer, later arrivals get flagged
/// on creation, and none of them keeps (or gets) weight raising.
#[test]
fn test_large_burst_denies_weight_raising() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());

    let mut procs: Vec<GreedyProc> = (0..9)
        .map(|i| {
            GreedyProc::new(i + 1, (i as u64) << 24, 64)
                .window(2)
                .starting_at(i as u64 * 10_000_000)
        })
        .collect();

    // Past the ninth creation (80ms), but well inside the burst.
    dev.run_greedy(&mut procs, 100_000_000);

    for pid in 1..=9 {
        let q = dev
            .sched
            .sync_queue(Pid(pid))
            .unwrap_or_else(|| panic!("pid {pid} has no queue"));
        let stats = dev.sched.queue_stats(q).unwrap();
        assert!(
            stats.in_large_burst,
            "queue of pid {pid} missing the large-burst flag"
        );
    }

    // The two queues created after the threshold was reached were flagged
    // before their first busy transition and never saw raising at all.
    for pid in [8, 9] {
        let q = dev.sched.sync_queue(Pid(pid)).unwrap();
        assert_eq!(
            dev.sched.queue_stats(q).unwrap().wr_coeff,
            1,
            "pid {pid} was raised despite joining a large burst at creation"
        );
    }

    // Once each earlier queue gets served, the dispatch path notices the
    // flag and tears its raising down too.
    dev.run_greedy(&mut procs, 500_000_000);
    for pid in 1..=9 {
        let q = dev.sched.sync_queue(Pid(pid)).unwrap();
        assert_eq!(
            dev.sched.queue_stats(q).unwrap().wr_coeff,
            1,
            "pid {pid} still raised inside a large burst"
        );
    }
}

/// A late-arriving queue resets the burst list instead of joining it.
#[test]
fn test_late_arrival_starts_new_burst() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());

    // Three creations close together, far below the threshold.
    for i in 0..3u64 {
        dev.now = i * 10_000_000;
        dev.insert(i as i32 + 1, i << 24, 64, true);
    }
    // A fourth, one second later: new burst of one.
    dev.now = 1_200_000_000;
    dev.insert(100, 1 << 30, 64, true);

    for pid in [1, 2, 3, 100] {
        let q = dev.sched.sync_queue(Pid(pid)).unwrap();
        let stats = dev.sched.queue_stats(q).unwrap();
        assert!(!stats.in_large_burst, "pid {pid} wrongly in a large burst");
    }
    // Only the newcomer is on the (restarted) burst list.
    let q = dev.sched.sync_queue(Pid(100)).unwrap();
    assert!(dev.sched.queue_stats(q).unwrap().in_burst_list);
    for pid in [1, 2, 3] {
        let q = dev.sched.sync_queue(Pid(pid)).unwrap();
        assert!(!dev.sched.queue_stats(q).unwrap().in_burst_list);
    }

    dev.drain(3_000_000_000);
}
