use bfq_core::*;

mod common;
use common::SimDevice;

/// Front and back bio merges against the submitter's own queued request.
#[test]
fn test_bio_merge_lookup_and_fold() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());

    let rq = dev.insert(1, 1000, 8, true);

    // A bio ending right where the request starts grows its front.
    let front_bio = BioSpec {
        sector: 992,
        nr_sectors: 8,
        sync: true,
    };
    assert_eq!(dev.sched.find_merge(Pid(1), front_bio), MergeDecision::Front(rq));
    assert!(dev.sched.allow_merge(dev.now, Pid(1), rq, front_bio));
    dev.sched.merged_request(dev.now, rq, MergeKind::Front, front_bio);
    dev.sched.check_invariants();

    // A bio starting right where the request now ends grows its back.
    let back_bio = BioSpec {
        sector: 1008,
        nr_sectors: 8,
        sync: true,
    };
    assert_eq!(dev.sched.find_merge(Pid(1), back_bio), MergeDecision::Back(rq));
    dev.sched.merged_request(dev.now, rq, MergeKind::Back, back_bio);
    dev.sched.check_invariants();

    // No match for a distant bio.
    let far_bio = BioSpec {
        sector: 1 << 30,
        nr_sectors: 8,
        sync: true,
    };
    assert_eq!(dev.sched.find_merge(Pid(1), far_bio), MergeDecision::None);

    dev.drain(1_000_000_000);
}

/// Folding two adjacent requests keeps one request with the earlier FIFO
/// deadline and releases the other.
#[test]
fn test_request_merge_inherits_deadline() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());

    let first = dev.insert(1, 1000, 8, true);
    dev.now = 50_000_000;
    let second = dev.insert(1, 1008, 8, true);
    assert_eq!(dev.sched.nr_queued(), 2);

    // The elevator decided `second` extends `first`.
    dev.sched.merged_requests(dev.now, first, second);
    dev.sched.check_invariants();
    assert_eq!(dev.sched.nr_queued(), 1);

    dev.drain(1_000_000_000);
    assert_eq!(dev.sched.nr_queued(), 0);
    assert_eq!(dev.sched.rq_in_driver(), 0);
}

/// A sync bio never merges into an async request.
#[test]
fn test_sync_bio_does_not_join_async_request() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());

    let rq = dev.insert(1, 1000, 8, false);
    let bio = BioSpec {
        sector: 1008,
        nr_sectors: 8,
        sync: true,
    };
    assert!(!dev.sched.allow_merge(dev.now, Pid(1), rq, bio));

    dev.drain(1_000_000_000);
}
