//! Request descriptors and head-proximity request selection.

use crate::types::{Pid, QueueId, RequestId, Sector, TimeNs};

/// Parameters of an incoming request, as seen at the scheduler boundary.
#[derive(Debug, Clone, Copy)]
pub struct RequestSpec {
    pub pid: Pid,
    pub sector: Sector,
    pub nr_sectors: u64,
    pub sync: bool,
    /// Metadata I/O gets preferential head-proximity treatment.
    pub meta: bool,
    pub prio: crate::types::IoPrio,
}

/// A bio that has not become a request yet, used by the merge hooks.
#[derive(Debug, Clone, Copy)]
pub struct BioSpec {
    pub sector: Sector,
    pub nr_sectors: u64,
    pub sync: bool,
}

impl BioSpec {
    pub fn end_sector(&self) -> Sector {
        self.sector + self.nr_sectors
    }
}

/// Either side of the cooperator lookup: a bio that is still being merged,
/// or a request already queued. Both expose the sector the lookup keys on.
#[derive(Debug, Clone, Copy)]
pub enum IoPos {
    Bio(Sector),
    Request(Sector),
}

impl IoPos {
    pub fn sector(self) -> Sector {
        match self {
            IoPos::Bio(s) | IoPos::Request(s) => s,
        }
    }
}

/// A request owned by the scheduler, from insertion until completion.
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub id: RequestId,
    pub queue: QueueId,
    pub pid: Pid,
    pub sector: Sector,
    pub nr_sectors: u64,
    pub sync: bool,
    pub meta: bool,
    pub fifo_deadline: TimeNs,
    /// Set once the request has been handed to the driver dispatch list.
    pub dispatched: bool,
}

impl IoRequest {
    pub fn end_sector(&self) -> Sector {
        self.sector + self.nr_sectors
    }
}

/// Absolute seek distance from `last_pos` to the start of `rq`.
pub(crate) fn sdist(last_pos: Sector, rq_sector: Sector) -> u64 {
    if last_pos == 0 {
        return 0;
    }
    last_pos.abs_diff(rq_sector)
}

/// Choose which of two requests is best served next, given the current head
/// position. A strict one-way elevator, except that short backward seeks are
/// tolerated at `back_penalty` times the cost of an equivalent forward seek.
/// Sync requests beat async ones and metadata beats regular data, since
/// processes usually block on both.
pub(crate) fn choose_req<'a>(
    rq1: Option<&'a IoRequest>,
    rq2: Option<&'a IoRequest>,
    last: Sector,
    back_max: u64,
    back_penalty: u64,
) -> Option<&'a IoRequest> {
    const RQ1_WRAP: u8 = 0x01;
    const RQ2_WRAP: u8 = 0x02;

    let (rq1, rq2) = match (rq1, rq2) {
        (None, r2) => return r2,
        (r1, None) => return r1,
        (Some(r1), Some(r2)) if r1.id == r2.id => return Some(r2),
        (Some(r1), Some(r2)) => (r1, r2),
    };

    if rq1.sync && !rq2.sync {
        return Some(rq1);
    } else if rq2.sync && !rq1.sync {
        return Some(rq2);
    }
    if rq1.meta && !rq2.meta {
        return Some(rq1);
    } else if rq2.meta && !rq1.meta {
        return Some(rq2);
    }

    let s1 = rq1.sector;
    let s2 = rq2.sector;

    let mut d1 = 0u64;
    let mut d2 = 0u64;
    let mut wrap = 0u8;

    if s1 >= last {
        d1 = s1 - last;
    } else if s1 + back_max >= last {
        d1 = (last - s1) * back_penalty;
    } else {
        wrap |= RQ1_WRAP;
    }

    if s2 >= last {
        d2 = s2 - last;
    } else if s2 + back_max >= last {
        d2 = (last - s2) * back_penalty;
    } else {
        wrap |= RQ2_WRAP;
    }

    match wrap {
        0 => {
            if d1 < d2 {
                Some(rq1)
            } else if d2 < d1 {
                Some(rq2)
            } else if s1 >= s2 {
                Some(rq1)
            } else {
                Some(rq2)
            }
        }
        RQ2_WRAP => Some(rq1),
        RQ1_WRAP => Some(rq2),
        _ => {
            // Both behind the head and out of backward range: start with the
            // one further behind, so only a single back seek is needed.
            if s1 <= s2 {
                Some(rq1)
            } else {
                Some(rq2)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Pid, QueueId, RequestId};

    fn rq(id: u64, sector: Sector, sync: bool, meta: bool) -> IoRequest {
        IoRequest {
            id: RequestId(id),
            queue: QueueId(0),
            pid: Pid(1),
            sector,
            nr_sectors: 8,
            sync,
            meta,
            fifo_deadline: 0,
            dispatched: false,
        }
    }

    #[test]
    fn test_forward_closest_wins() {
        let a = rq(1, 1000, true, false);
        let b = rq(2, 5000, true, false);
        let best = choose_req(Some(&a), Some(&b), 900, 32768, 2).unwrap();
        assert_eq!(best.id, RequestId(1));
    }

    #[test]
    fn test_sync_beats_async() {
        let a = rq(1, 100_000, true, false);
        let b = rq(2, 1000, false, false);
        let best = choose_req(Some(&a), Some(&b), 900, 32768, 2).unwrap();
        assert_eq!(best.id, RequestId(1));
    }

    #[test]
    fn test_short_backward_seek_penalized_not_rejected() {
        // 100 sectors behind at penalty 2 == 200 forward; a request 300
        // ahead loses to it.
        let behind = rq(1, 900, true, false);
        let ahead = rq(2, 1300, true, false);
        let best = choose_req(Some(&behind), Some(&ahead), 1000, 32768, 2).unwrap();
        assert_eq!(best.id, RequestId(1));
    }

    #[test]
    fn test_far_backward_request_wraps() {
        let far_behind = rq(1, 10, true, false);
        let ahead = rq(2, 2_000_000, true, false);
        let best = choose_req(Some(&far_behind), Some(&ahead), 1_000_000, 100, 2).unwrap();
        assert_eq!(best.id, RequestId(2));
    }

    #[test]
    fn test_both_wrapped_takes_furthest_behind() {
        let a = rq(1, 10, true, false);
        let b = rq(2, 500, true, false);
        let best = choose_req(Some(&a), Some(&b), 1_000_000, 100, 2).unwrap();
        assert_eq!(best.id, RequestId(1));
    }
}
