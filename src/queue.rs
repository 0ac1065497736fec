//! Per-process queue state.

use std::collections::{BTreeSet, VecDeque};

use crate::types::{
    distant_future, distant_past, ioprio_to_weight, GroupId, IoClass, Pid, QueueId, RequestId,
    Sector, TimeNs,
};
use crate::wf2q::Entity;

/// Bits of seek history kept per queue.
pub(crate) const SEEK_HISTORY_BITS: u32 = 32;

/// A queue is seeky once more than an eighth of its recent request pairs
/// were non-sequential.
const SEEKY_THRESH: u32 = SEEK_HISTORY_BITS / 8;

/// Leaf scheduling unit: the FIFO plus sector-sorted index of the pending
/// requests of one process (or of the cooperating processes merged into it),
/// together with its weight-raising, burst and service state.
#[derive(Debug)]
pub(crate) struct Queue {
    pub id: QueueId,
    /// Pid of the creating process; shared queues keep the first owner's.
    pub pid: Pid,
    pub entity: Entity,

    /// Process references plus one per allocated request plus one while the
    /// entity is on a service tree.
    pub refs: u32,
    /// Outstanding request allocations, `[async, sync]`.
    pub allocated: [u32; 2],

    /// Pending requests ordered by sector.
    pub sort_list: BTreeSet<(Sector, RequestId)>,
    /// Pending requests in arrival order, carrying the expiry deadlines.
    pub fifo: VecDeque<RequestId>,
    /// Pending request counts, `[async, sync]`.
    pub queued: [u32; 2],
    /// Next request to serve, per head-proximity selection.
    pub next_rq: Option<RequestId>,
    /// Requests handed to the driver and not yet completed.
    pub dispatched: u32,

    /// Budget granted on the next activation, in sectors.
    pub max_budget: u64,
    /// Deadline of the current slice. Once the queue goes quiet with no
    /// request outstanding this field is reused to record the instant the
    /// backlog vanished, which the weight-raising heuristics read back.
    pub budget_timeout: TimeNs,

    pub ioprio: u8,
    pub new_ioprio: u8,

    pub busy: bool,
    pub sync: bool,
    pub io_bound: bool,
    pub idle_window: bool,
    pub wait_request: bool,
    pub non_blocking_wait_rq: bool,
    pub must_alloc: bool,
    pub fifo_checked: bool,
    pub in_large_burst: bool,
    pub in_burst_list: bool,
    pub coop: bool,
    pub split_coop: bool,
    pub just_created: bool,
    pub softrt_update: bool,

    /// 1 when not raised; otherwise the active raising coefficient.
    pub wr_coeff: u32,
    pub wr_cur_max_time: TimeNs,
    /// Start of the current raising period; for non-raised queues, arrival
    /// time of the last request (used by async raising).
    pub last_wr_start_finish: TimeNs,
    pub soft_rt_next_start: TimeNs,
    /// Last time the queue went from idle to backlogged.
    pub last_idle_bklogged: TimeNs,
    /// Real service received since the last idle-to-busy transition.
    pub service_from_backlogged: u64,

    /// Sliding window of seek outcomes, newest in bit 0.
    pub seek_history: u32,
    pub last_request_pos: Sector,
    /// Requests that arrived within the think-time bound; promotes the
    /// queue to IO-bound past a threshold.
    pub requests_within_timer: u32,
    pub split_time: TimeNs,

    /// Sector this queue is keyed under in its group's position tree, if any.
    pub pos_key: Option<Sector>,
    /// Target of a scheduled cooperator merge.
    pub new_queue: Option<QueueId>,
    /// Owning io-context while the queue serves exactly one process.
    pub bic: Option<Pid>,
    pub meta_pending: u32,
}

impl Queue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: QueueId,
        pid: Pid,
        parent: GroupId,
        class: IoClass,
        ioprio: u8,
        sync: bool,
        now: TimeNs,
        initial_max_budget: u64,
    ) -> Self {
        let weight = ioprio_to_weight(ioprio);
        Queue {
            id,
            pid,
            entity: Entity::new(parent, class, weight),
            refs: 0,
            allocated: [0, 0],
            sort_list: BTreeSet::new(),
            fifo: VecDeque::new(),
            queued: [0, 0],
            next_rq: None,
            dispatched: 0,
            max_budget: initial_max_budget,
            budget_timeout: distant_past(now),
            ioprio,
            new_ioprio: ioprio,
            busy: false,
            sync,
            io_bound: true,
            idle_window: sync && class != IoClass::Idle,
            wait_request: false,
            non_blocking_wait_rq: false,
            must_alloc: false,
            fifo_checked: false,
            in_large_burst: false,
            in_burst_list: false,
            coop: false,
            split_coop: false,
            just_created: sync,
            softrt_update: false,
            wr_coeff: 1,
            wr_cur_max_time: 0,
            last_wr_start_finish: distant_past(now),
            soft_rt_next_start: distant_future(now),
            last_idle_bklogged: now,
            service_from_backlogged: 0,
            // The first request is almost certainly a seek.
            seek_history: 1,
            last_request_pos: 0,
            requests_within_timer: 0,
            split_time: distant_past(now),
            pos_key: None,
            new_queue: None,
            bic: None,
            meta_pending: 0,
        }
    }

    pub fn seeky(&self) -> bool {
        self.seek_history.count_ones() > SEEKY_THRESH
    }

    pub fn push_seek_sample(&mut self, was_seek: bool) {
        self.seek_history <<= 1;
        self.seek_history |= was_seek as u32;
    }

    pub fn budget_left(&self) -> u64 {
        self.entity.budget.saturating_sub(self.entity.service)
    }

    pub fn class_idle(&self) -> bool {
        self.entity.ioprio_class == IoClass::Idle
    }

    pub fn has_requests(&self) -> bool {
        !self.sort_list.is_empty()
    }

    /// References held by processes, as opposed to in-flight requests and
    /// the service-tree linkage.
    pub fn process_refs(&self) -> u32 {
        let io_refs = self.allocated[0] + self.allocated[1];
        self.refs
            .saturating_sub(io_refs)
            .saturating_sub(self.entity.on_st as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_queue() -> Queue {
        Queue::new(
            QueueId(1),
            Pid(42),
            GroupId(0),
            IoClass::Be,
            4,
            true,
            1_000_000_000,
            16_384,
        )
    }

    #[test]
    fn test_new_queue_starts_seeky() {
        let q = mk_queue();
        assert_eq!(q.seek_history, 1);
        assert!(!q.seeky(), "a single seek sample is below the threshold");
    }

    #[test]
    fn test_seek_history_window() {
        let mut q = mk_queue();
        for _ in 0..5 {
            q.push_seek_sample(true);
        }
        assert!(q.seeky());
        // A long sequential run flushes the window.
        for _ in 0..32 {
            q.push_seek_sample(false);
        }
        assert!(!q.seeky());
    }

    #[test]
    fn test_process_refs_excludes_io_and_tree_refs() {
        let mut q = mk_queue();
        q.refs = 4;
        q.allocated[1] = 2;
        q.entity.on_st = true;
        assert_eq!(q.process_refs(), 1);
    }
}
