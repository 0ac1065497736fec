//! Simulated block device driving the scheduler in tests.
//!
//! The device serves one request at a time at 1 sector per microsecond.
//! Time is fully simulated: the harness advances the clock to the next
//! completion, idle-timer deadline or process start, fires the due events,
//! and re-runs dispatch, checking the scheduler invariants after every
//! event.

#![allow(dead_code)]

use std::collections::HashMap;

use bfq_core::*;

/// Nanoseconds the device needs per sector.
pub const SECTOR_SERVICE_NS: u64 = 1_000;

/// Initialize logging once per process; level comes from `RUST_LOG`-style
/// verbosity of the test run (warnings only by default).
pub fn setup_test() {
    let _ = simplelog::SimpleLogger::init(
        simplelog::LevelFilter::Warn,
        simplelog::Config::default(),
    );
}

/// A process that keeps `window` sequential requests outstanding.
pub struct GreedyProc {
    pub pid: Pid,
    pub next_sector: Sector,
    pub req_sectors: u64,
    pub window: u32,
    pub sync: bool,
    pub prio: IoPrio,
    pub started_at: TimeNs,
    pub pending: u32,
}

impl GreedyProc {
    pub fn new(pid: i32, start_sector: Sector, req_sectors: u64) -> Self {
        GreedyProc {
            pid: Pid(pid),
            next_sector: start_sector,
            req_sectors,
            window: 1,
            sync: true,
            prio: IoPrio::None,
            started_at: 0,
            pending: 0,
        }
    }

    pub fn window(mut self, n: u32) -> Self {
        self.window = n;
        self
    }

    pub fn prio(mut self, prio: IoPrio) -> Self {
        self.prio = prio;
        self
    }

    pub fn starting_at(mut self, t: TimeNs) -> Self {
        self.started_at = t;
        self
    }
}

pub struct SimDevice {
    pub sched: Scheduler,
    pub now: TimeNs,
    /// How many requests the driver accepts at once (the device still
    /// serves them serially).
    pub depth: usize,
    /// Requests the driver holds, with their completion times.
    inflight: Vec<(TimeNs, RequestId)>,
    /// The serial device finishes its current request at this instant.
    device_free_at: TimeNs,
    rq_owner: HashMap<RequestId, (Pid, u64)>,
    pub dispatched_sectors: HashMap<i32, u64>,
    pub dispatch_log: Vec<(TimeNs, i32)>,
    pub max_in_driver: u32,
}

impl SimDevice {
    pub fn new(config: SchedulerConfig) -> Self {
        SimDevice {
            sched: Scheduler::new(config).unwrap(),
            now: 0,
            depth: 1,
            inflight: Vec::new(),
            device_free_at: 0,
            rq_owner: HashMap::new(),
            dispatched_sectors: HashMap::new(),
            dispatch_log: Vec::new(),
            max_in_driver: 0,
        }
    }

    pub fn insert(&mut self, pid: i32, sector: Sector, nr_sectors: u64, sync: bool) -> RequestId {
        self.insert_prio(pid, sector, nr_sectors, sync, IoPrio::None)
    }

    pub fn insert_prio(
        &mut self,
        pid: i32,
        sector: Sector,
        nr_sectors: u64,
        sync: bool,
        prio: IoPrio,
    ) -> RequestId {
        let rq = self.sched.insert_request(
            self.now,
            RequestSpec {
                pid: Pid(pid),
                sector,
                nr_sectors,
                sync,
                meta: false,
                prio,
            },
        );
        self.rq_owner.insert(rq, (Pid(pid), nr_sectors));
        self.sched.check_invariants();
        rq
    }

    /// Hand at most one request to the (serial) device. A dispatch that
    /// only expired the in-service queue is retried a few times.
    fn try_dispatch(&mut self) -> bool {
        for _ in 0..4 {
            if let Some(rq) = self.sched.dispatch(self.now, false) {
                self.sched.activate_request(rq);
                self.max_in_driver = self.max_in_driver.max(self.sched.rq_in_driver());
                let (pid, sectors) = self.rq_owner[&rq];
                *self.dispatched_sectors.entry(pid.0).or_insert(0) += sectors;
                self.dispatch_log.push((self.now, pid.0));
                let start = self.now.max(self.device_free_at);
                let done = start + sectors * SECTOR_SERVICE_NS;
                self.device_free_at = done;
                self.inflight.push((done, rq));
                self.sched.check_invariants();
                return true;
            }
        }
        false
    }

    fn fire_due_events(&mut self) {
        // Completions first, oldest first.
        let now = self.now;
        let mut due: Vec<(TimeNs, RequestId)> = self
            .inflight
            .iter()
            .copied()
            .filter(|&(t, _)| t <= now)
            .collect();
        due.sort_unstable();
        self.inflight.retain(|&(t, _)| t > now);
        for (_, rq) in due {
            self.sched.completed_request(self.now, rq);
            self.sched.check_invariants();
        }

        if let Some(deadline) = self.sched.idle_timer_deadline() {
            if deadline <= self.now {
                self.sched.on_idle_timer(self.now);
                self.sched.check_invariants();
            }
        }
    }

    fn next_event(&self, t_end: TimeNs) -> TimeNs {
        let mut next = t_end;
        if let Some(&(t, _)) = self.inflight.iter().min_by_key(|&&(t, _)| t) {
            next = next.min(t);
        }
        if let Some(t) = self.sched.idle_timer_deadline() {
            next = next.min(t);
        }
        next
    }

    /// Run processes that keep their request windows full until `t_end`.
    /// Completions immediately refill the windows, so the device only
    /// idles when the scheduler decides to.
    pub fn run_greedy(&mut self, procs: &mut [GreedyProc], t_end: TimeNs) {
        while self.now < t_end {
            for p in procs.iter_mut() {
                if self.now >= p.started_at {
                    while p.pending < p.window {
                        let rq = self.sched.insert_request(
                            self.now,
                            RequestSpec {
                                pid: p.pid,
                                sector: p.next_sector,
                                nr_sectors: p.req_sectors,
                                sync: p.sync,
                                meta: false,
                                prio: p.prio,
                            },
                        );
                        self.rq_owner.insert(rq, (p.pid, p.req_sectors));
                        p.next_sector += p.req_sectors;
                        p.pending += 1;
                    }
                }
            }
            self.sched.check_invariants();

            while self.inflight.len() < self.driver_depth() && self.try_dispatch() {}

            let mut next = self.next_event(t_end);
            for p in procs.iter() {
                if p.started_at > self.now {
                    next = next.min(p.started_at);
                }
            }
            if next <= self.now {
                next = self.now + SECTOR_SERVICE_NS;
            }
            self.now = next;

            let completed: Vec<Pid> = {
                let now = self.now;
                self.inflight
                    .iter()
                    .filter(|&&(t, _)| t <= now)
                    .map(|&(_, rq)| self.rq_owner[&rq].0)
                    .collect()
            };
            self.fire_due_events();
            for pid in completed {
                if let Some(p) = procs.iter_mut().find(|p| p.pid == pid) {
                    p.pending -= 1;
                }
            }
        }
    }

    /// Serve whatever is queued without issuing anything new, letting idle
    /// timers run out, until the scheduler goes quiet or `t_end` passes.
    pub fn drain(&mut self, t_end: TimeNs) {
        loop {
            while self.inflight.len() < self.driver_depth() && self.try_dispatch() {}

            if self.inflight.is_empty() && self.sched.idle_timer_deadline().is_none() {
                return;
            }
            let next = self.next_event(t_end);
            if next >= t_end {
                self.now = t_end;
                self.fire_due_events();
                return;
            }
            self.now = next.max(self.now + 1);
            self.fire_due_events();
        }
    }

    /// Serve everything queued but stop as soon as the device would idle,
    /// leaving an armed idle window observable.
    pub fn drain_to_idle_window(&mut self) {
        loop {
            while self.inflight.len() < self.driver_depth() && self.try_dispatch() {}
            if self.inflight.is_empty() {
                return;
            }
            let t = self.inflight.iter().map(|&(t, _)| t).min().unwrap();
            self.now = self.now.max(t);
            let now = self.now;
            let mut due: Vec<(TimeNs, RequestId)> = self
                .inflight
                .iter()
                .copied()
                .filter(|&(tt, _)| tt <= now)
                .collect();
            due.sort_unstable();
            self.inflight.retain(|&(tt, _)| tt > now);
            for (_, rq) in due {
                self.sched.completed_request(self.now, rq);
                self.sched.check_invariants();
            }
        }
    }

    fn driver_depth(&self) -> usize {
        self.depth
    }

    pub fn sectors_of(&self, pid: i32) -> u64 {
        self.dispatched_sectors.get(&pid).copied().unwrap_or(0)
    }
}
