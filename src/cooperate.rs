//! Cooperating-queue detection, merging and splitting.
//!
//! Processes doing interleaved sequential I/O over one region are detected
//! through a per-node position tree keyed by next-request sector. Their
//! queues are merged (requests of one process redirected to the other's
//! queue) to keep the stream sequential, and split back apart when the
//! merged queue turns seeky again.

use std::collections::HashSet;

use log::debug;

use crate::request::IoPos;
use crate::scheduler::Scheduler;
use crate::types::{Pid, QueueId, Sector, TimeNs, NSEC_PER_MSEC};

/// Two positions within this many sectors are "close".
pub(crate) const CLOSE_THR: u64 = 8 * 1024;

fn close_to(a: Sector, b: Sector) -> bool {
    a.abs_diff(b) <= CLOSE_THR
}

impl Scheduler {
    /// Re-key a queue in its node's position tree after its next request
    /// changed. Idle-class and empty queues stay out; so does a queue whose
    /// next-request sector collides with an already keyed one.
    pub(crate) fn pos_tree_add_move(&mut self, q: QueueId) {
        let parent = self.queues[&q].entity.parent;
        if let Some(old_key) = self.queues.get_mut(&q).unwrap().pos_key.take() {
            let tree = &mut self.groups.get_mut(&parent).unwrap().pos_tree;
            if tree.get(&old_key) == Some(&q) {
                tree.remove(&old_key);
            }
        }

        if self.queues[&q].class_idle() {
            return;
        }
        let Some(next_rq) = self.queues[&q].next_rq else {
            return;
        };
        let sector = self.requests[&next_rq].sector;

        let tree = &mut self.groups.get_mut(&parent).unwrap().pos_tree;
        if tree.contains_key(&sector) {
            return;
        }
        tree.insert(sector, q);
        self.queues.get_mut(&q).unwrap().pos_key = Some(sector);
    }

    /// Find a queue of the same node whose next request lies close to
    /// `sector`: an exact match, or the nearest keyed neighbor on either
    /// side within the closeness threshold.
    fn find_close(&self, q: QueueId, sector: Sector) -> Option<QueueId> {
        let parent = self.queues[&q].entity.parent;
        let tree = &self.groups[&parent].pos_tree;
        if tree.is_empty() {
            return None;
        }

        if let Some(&hit) = tree.get(&sector) {
            return Some(hit);
        }

        let below = tree.range(..sector).next_back();
        if let Some((&key, &cand)) = below {
            if close_to(key, sector) {
                return Some(cand);
            }
        }
        let above = tree.range(sector..).next();
        if let Some((&key, &cand)) = above {
            if close_to(key, sector) {
                return Some(cand);
            }
        }
        None
    }

    fn find_close_cooperator(&self, cur: QueueId, sector: Sector) -> Option<QueueId> {
        let cand = self.find_close(cur, sector)?;
        if cand == cur {
            return None;
        }
        Some(cand)
    }

    /// Queues can only cooperate when both are synchronous, in the same
    /// non-idle class, and neither has turned seeky.
    fn may_be_close_cooperator(&self, a: QueueId, b: QueueId) -> bool {
        let qa = &self.queues[&a];
        let qb = &self.queues[&b];
        if qa.class_idle() || qb.class_idle() {
            return false;
        }
        if qa.entity.ioprio_class != qb.entity.ioprio_class {
            return false;
        }
        if qa.seeky() || qb.seeky() {
            return false;
        }
        qa.sync && qb.sync
    }

    /// True cooperation starts right after the processes do; a queue whose
    /// raising period is already old is past that point, and merging it
    /// would only trade its latency guarantees for a false positive.
    fn wr_from_too_long(&self, now: TimeNs, q: QueueId) -> bool {
        let queue = &self.queues[&q];
        queue.wr_coeff > 1
            && now
                > queue
                    .last_wr_start_finish
                    .saturating_add(self.tunables.wr_too_long_grace * NSEC_PER_MSEC)
    }

    /// Record that `q`'s requests shall be redirected to `new_q` (or to the
    /// end of `new_q`'s own redirection chain). The chain walk carries a
    /// visited set so a corrupted chain cannot loop forever.
    fn setup_merge(&mut self, q: QueueId, new_q: QueueId) -> Option<QueueId> {
        if self.queues[&new_q].process_refs() == 0 {
            // Without a process reference the chain beyond new_q may
            // already be dropping its queues.
            return None;
        }

        let mut target = new_q;
        let mut visited: HashSet<QueueId> = HashSet::new();
        while let Some(next) = self.queues[&target].new_queue {
            if next == q || !visited.insert(next) {
                return None;
            }
            target = next;
        }

        let process_refs = self.queues[&q].process_refs();
        if process_refs == 0 || self.queues[&target].process_refs() == 0 {
            return None;
        }

        debug!(
            "coop: scheduling merge of queue {:?} into {:?}",
            q, target
        );
        self.queues.get_mut(&q).unwrap().new_queue = Some(target);
        self.queues.get_mut(&target).unwrap().refs += process_refs;
        Some(target)
    }

    /// Try to schedule a merge of `q` with the in-service queue or with a
    /// close queue among the scheduled ones. The OOM queue never
    /// cooperates, and neither does a queue deep into weight raising.
    pub(crate) fn setup_cooperator(
        &mut self,
        now: TimeNs,
        q: QueueId,
        io: Option<IoPos>,
    ) -> Option<QueueId> {
        if let Some(target) = self.queues[&q].new_queue {
            return Some(target);
        }

        let io = io?;
        if self.wr_from_too_long(now, q) || q == self.oom_queue {
            return None;
        }
        if self.busy_queues == 1 {
            return None;
        }

        if let Some(in_serv) = self.in_service_queue {
            if in_serv != q
                && self.in_service_bic.is_some()
                && in_serv != self.oom_queue
                && !self.wr_from_too_long(now, in_serv)
                && close_to(io.sector(), self.rate.last_position())
                && self.queues[&q].entity.parent == self.queues[&in_serv].entity.parent
                && self.may_be_close_cooperator(q, in_serv)
            {
                if let Some(target) = self.setup_merge(q, in_serv) {
                    return Some(target);
                }
            }
        }

        let cand = self.find_close_cooperator(q, io.sector())?;
        if cand != self.oom_queue
            && !self.wr_from_too_long(now, cand)
            && self.may_be_close_cooperator(q, cand)
        {
            return self.setup_merge(q, cand);
        }
        None
    }

    /// Capture the state a queue would need back if it is later split out
    /// of the shared queue. Nothing to save once the queue is already
    /// shared (its owners saved theirs when they joined).
    pub(crate) fn save_queue_state(&mut self, q: QueueId) {
        let Some(pid) = self.queues[&q].bic else {
            return;
        };
        let (idle_window, io_bound, in_large_burst, in_burst_list) = {
            let queue = &self.queues[&q];
            (
                queue.idle_window,
                queue.io_bound,
                queue.in_large_burst,
                queue.in_burst_list,
            )
        };
        if let Some(ctx) = self.ioctxs.get_mut(&pid) {
            ctx.saved_idle_window = idle_window;
            ctx.saved_io_bound = io_bound;
            ctx.saved_in_large_burst = in_large_burst;
            ctx.was_in_burst_list = in_burst_list;
        }
    }

    /// Restore the per-process state saved at merge time onto a queue that
    /// was just split back out.
    pub(crate) fn resume_queue_state(&mut self, q: QueueId, pid: Pid) {
        let Some(ctx) = self.ioctxs.get(&pid) else {
            return;
        };
        let (idle_window, io_bound) = (ctx.saved_idle_window, ctx.saved_io_bound);
        let queue = self.queues.get_mut(&q).unwrap();
        queue.idle_window = idle_window;
        queue.io_bound = io_bound;
    }

    /// Merge `q` into `new_q`: redirect the owning process, inherit weight
    /// raising, and flag the target as shared.
    pub(crate) fn merge_queues(&mut self, pid: Pid, q: QueueId, new_q: QueueId) {
        debug!("coop: merging queue {:?} into {:?}", q, new_q);
        self.save_queue_state(q);
        self.save_queue_state(new_q);

        if self.queues[&q].io_bound {
            self.queues.get_mut(&new_q).unwrap().io_bound = true;
        }
        self.queues.get_mut(&q).unwrap().io_bound = false;

        // The source hands its weight raising over, unless the target is
        // raised already.
        let (src_wr, src_max_time, src_start) = {
            let queue = &self.queues[&q];
            (
                queue.wr_coeff,
                queue.wr_cur_max_time,
                queue.last_wr_start_finish,
            )
        };
        if self.queues[&new_q].wr_coeff == 1 && src_wr > 1 {
            let target = self.queues.get_mut(&new_q).unwrap();
            target.wr_coeff = src_wr;
            target.wr_cur_max_time = src_max_time;
            target.last_wr_start_finish = src_start;
            target.entity.prio_changed = true;
            if target.busy {
                self.wr_busy_queues += 1;
            }
        }
        if src_wr > 1 {
            let source = self.queues.get_mut(&q).unwrap();
            source.wr_coeff = 1;
            source.entity.prio_changed = true;
            if source.busy {
                self.wr_busy_queues -= 1;
            }
        }

        if let Some(ctx) = self.ioctxs.get_mut(&pid) {
            ctx.sync_queue = Some(new_q);
        }
        self.queues.get_mut(&new_q).unwrap().coop = true;

        // The target now belongs to more than one process, the source to
        // none (or to processes already redirected away from it).
        self.queues.get_mut(&new_q).unwrap().bic = None;
        self.queues.get_mut(&q).unwrap().bic = None;
        self.put_queue(q);
    }

    /// Undo a merge for one process: take back a private queue. Returns the
    /// queue to keep using if it turned out to be private already, `None`
    /// when the caller must allocate a fresh one.
    pub(crate) fn split_queue(&mut self, pid: Pid, q: QueueId) -> Option<QueueId> {
        debug!("coop: splitting queue {:?} for pid {:?}", q, pid);

        if self.queues[&q].process_refs() == 1 {
            let queue = self.queues.get_mut(&q).unwrap();
            queue.pid = pid;
            queue.coop = false;
            queue.split_coop = false;
            return Some(q);
        }

        if let Some(ctx) = self.ioctxs.get_mut(&pid) {
            ctx.sync_queue = None;
        }
        self.put_cooperator(q);
        self.put_queue(q);
        None
    }

    /// Drop the references taken on the redirection chain hanging off `q`.
    pub(crate) fn put_cooperator(&mut self, q: QueueId) {
        let mut visited: HashSet<QueueId> = HashSet::new();
        let mut cur = self.queues[&q].new_queue;
        while let Some(next) = cur {
            if next == q || !visited.insert(next) {
                break;
            }
            cur = self.queues[&next].new_queue;
            self.put_queue(next);
        }
        self.queues.get_mut(&q).unwrap().new_queue = None;
    }
}
