//! Burst detection.
//!
//! Queues created shortly after each other under the same node usually
//! belong to one parallel job (a boot sequence, a multi-threaded scan).
//! Past a size threshold such a burst is "large": its queues gain nothing
//! from low-latency treatment, so they are denied weight raising and may be
//! denied idling, trading their individual latency for aggregate
//! throughput.

use log::debug;

use crate::scheduler::Scheduler;
use crate::types::{QueueId, TimeNs, NSEC_PER_MSEC};

/// A freshly split queue re-enters burst accounting only after this grace.
const SPLIT_GRACE: TimeNs = 10 * NSEC_PER_MSEC;

impl Scheduler {
    /// Empty the burst list and restart it with just `q`, which may be the
    /// first queue of a new burst.
    pub(crate) fn reset_burst_list(&mut self, q: QueueId) {
        let old = std::mem::take(&mut self.burst_list);
        for item in old {
            if let Some(queue) = self.queues.get_mut(&item) {
                queue.in_burst_list = false;
            }
        }
        self.queues.get_mut(&q).unwrap().in_burst_list = true;
        self.burst_list.push(q);
        self.burst_size = 1;
        self.burst_parent = Some(self.queues[&q].entity.parent);
    }

    fn add_to_burst(&mut self, q: QueueId) {
        self.burst_size += 1;

        if self.burst_size == self.tunables.large_burst_thresh {
            // The burst became large: flag everything collected so far plus
            // the newcomer, then drop the list, which has served its
            // purpose. Later arrivals get flagged directly on creation.
            self.large_burst = true;
            debug!("burst: large burst of {} queues", self.burst_size);
            let listed = std::mem::take(&mut self.burst_list);
            for item in listed {
                if let Some(queue) = self.queues.get_mut(&item) {
                    queue.in_large_burst = true;
                    queue.in_burst_list = false;
                }
            }
            self.queues.get_mut(&q).unwrap().in_large_burst = true;
        } else {
            self.queues.get_mut(&q).unwrap().in_burst_list = true;
            self.burst_list.push(q);
        }
    }

    /// Run the burst detector for a just-created queue.
    pub(crate) fn handle_burst(&mut self, now: TimeNs, q: QueueId) {
        {
            let queue = &self.queues[&q];
            if queue.in_burst_list
                || queue.in_large_burst
                || now <= queue.split_time.saturating_add(SPLIT_GRACE)
            {
                return;
            }
        }

        let parent = Some(self.queues[&q].entity.parent);
        let interval = self.tunables.burst_interval * NSEC_PER_MSEC;

        if now > self.last_ins_in_burst.saturating_add(interval) || parent != self.burst_parent {
            // Late arrival or different node: the current burst is over.
            self.large_burst = false;
            self.reset_burst_list(q);
        } else if self.large_burst {
            self.queues.get_mut(&q).unwrap().in_large_burst = true;
        } else {
            self.add_to_burst(q);
        }

        self.last_ins_in_burst = now;
    }
}
