use bfq_core::*;

mod common;
use common::{GreedyProc, SimDevice};

/// A sustained sequential stream of 256 KiB requests updates the peak-rate
/// estimate after the one-second observation window, keeps the device in
/// the FAST class, and re-derives the budget cap as peak rate times the
/// slice timeout.
#[test]
fn test_sequential_stream_updates_peak_rate_and_budget() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());
    let initial_peak = dev.sched.peak_rate();

    let mut procs = [GreedyProc::new(1, 0, 512)];
    dev.run_greedy(&mut procs, 1_300_000_000);

    let peak = dev.sched.peak_rate();
    assert_ne!(peak, initial_peak, "no peak-rate update happened");

    // The device serves one sector per microsecond; the blended estimate
    // lands between the optimistic initial guess and the true rate.
    let true_rate = 1 << 16; // 1 sector/us in fixed point
    assert!(
        peak > initial_peak && peak <= true_rate,
        "peak {peak} outside ({initial_peak}, {true_rate}]"
    );

    assert_eq!(dev.sched.device_speed(), DeviceSpeed::Fast);

    // max_budget = peak rate x timeout, in sectors.
    let timeout_us = 125 * 1_000;
    assert_eq!(dev.sched.max_budget(), (peak * timeout_us) >> 16);
}

/// An isochronous trickle (long gaps, device idle in between) must not
/// update the estimate: its windows never accumulate enough samples.
#[test]
fn test_sparse_stream_leaves_peak_rate_alone() {
    common::setup_test();
    let mut dev = SimDevice::new(SchedulerConfig::default());
    let initial_peak = dev.sched.peak_rate();

    for i in 0..12u64 {
        dev.now = i * 200_000_000;
        dev.insert(1, 4096 + i * 8, 8, true);
        dev.drain(dev.now + 150_000_000);
    }

    assert_eq!(
        dev.sched.peak_rate(),
        initial_peak,
        "sparse I/O must not move the peak estimate"
    );
}
