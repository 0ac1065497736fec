//! Per-process I/O context: the queue back-pointers, the think-time
//! estimator, and the state saved across cooperator merges.

use crate::types::{IoPrio, Pid, QueueId, TimeNs};

/// Think-time samples become statistically meaningful past this count.
pub(crate) fn sample_valid(samples: u64) -> bool {
    samples > 80
}

/// EWMA of the gap between a request completion and the next submission.
#[derive(Debug, Clone)]
pub(crate) struct ThinkTime {
    pub last_end_request: TimeNs,
    pub samples: u64,
    pub total: u64,
    pub mean: u64,
}

impl ThinkTime {
    pub fn new(now: TimeNs) -> Self {
        ThinkTime {
            // Far enough back that the first request does not look
            // immediate.
            last_end_request: now.saturating_sub(1 << 32),
            samples: 0,
            total: 0,
            mean: 0,
        }
    }

    /// Fold the gap since the last completion into the estimate, capped at
    /// twice the idling window so one long pause does not dominate.
    pub fn update(&mut self, now: TimeNs, slice_idle: TimeNs) {
        let elapsed = now
            .saturating_sub(self.last_end_request)
            .min(2 * slice_idle);
        self.samples = (7 * self.samples + 256) / 8;
        self.total = (7 * self.total + 256 * elapsed) / 8;
        self.mean = (self.total + 128) / self.samples.max(1);
    }
}

/// The control block tied to one process on one device.
#[derive(Debug)]
pub(crate) struct IoContext {
    pub pid: Pid,
    pub sync_queue: Option<QueueId>,
    pub async_queue: Option<QueueId>,
    pub ioprio: IoPrio,
    pub ttime: ThinkTime,

    // Queue state captured when this process's queue is merged into a
    // cooperator, restored if the queue is later split back out.
    pub saved_idle_window: bool,
    pub saved_io_bound: bool,
    pub saved_in_large_burst: bool,
    pub was_in_burst_list: bool,
}

impl IoContext {
    pub fn new(pid: Pid, prio: IoPrio, now: TimeNs) -> Self {
        IoContext {
            pid,
            sync_queue: None,
            async_queue: None,
            ioprio: prio,
            ttime: ThinkTime::new(now),
            saved_idle_window: false,
            saved_io_bound: false,
            saved_in_large_burst: false,
            was_in_burst_list: false,
        }
    }

    pub fn queue(&self, sync: bool) -> Option<QueueId> {
        if sync {
            self.sync_queue
        } else {
            self.async_queue
        }
    }

    pub fn set_queue(&mut self, sync: bool, q: Option<QueueId>) {
        if sync {
            self.sync_queue = q;
        } else {
            self.async_queue = q;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_think_time_converges_to_gap() {
        let slice_idle = 8_000_000;
        let mut tt = ThinkTime::new(0);
        let mut now = 1_000_000_000;
        for _ in 0..200 {
            tt.update(now, slice_idle);
            tt.last_end_request = now;
            now += 1_000_000; // steady 1 ms think time
        }
        assert!(sample_valid(tt.samples));
        let err = tt.mean.abs_diff(1_000_000);
        assert!(err < 200_000, "mean {} not near 1ms", tt.mean);
    }

    #[test]
    fn test_think_time_cap() {
        let slice_idle = 8_000_000;
        let mut tt = ThinkTime::new(0);
        tt.last_end_request = 0;
        tt.update(3_600_000_000_000, slice_idle);
        assert!(tt.mean <= 2 * slice_idle);
    }
}
