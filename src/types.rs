//! Newtype wrappers and type aliases for domain concepts.
//!
//! Newtypes for identifiers (queues, groups, requests, processes) prevent
//! silent type confusion between the many id-keyed collections an entity can
//! live in at once. Type aliases for quantities (timestamps, sectors,
//! virtual times, weights) provide self-documenting code without the
//! boilerplate of implementing arithmetic traits.

/// Time in nanoseconds. The scheduler never reads a clock; callers pass
/// `now` into every time-dependent entry point.
pub type TimeNs = u64;

/// Device sector (512 bytes).
pub type Sector = u64;

/// Scheduler weight (higher = larger share of device service).
pub type Weight = u32;

/// Virtual time for fair queueing (opaque fixed-point u64, not nanoseconds).
pub type VirtTime = u64;

pub const NSEC_PER_USEC: u64 = 1_000;
pub const NSEC_PER_MSEC: u64 = 1_000_000;
pub const NSEC_PER_SEC: u64 = 1_000_000_000;
pub const USEC_PER_MSEC: u64 = 1_000;
pub const USEC_PER_SEC: u64 = 1_000_000;

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub i32);

/// Per-process queue identifier (stable arena id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u64);

/// Scheduling-node (group) identifier (stable arena id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

/// Request identifier (stable arena id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// A schedulable entity: a leaf queue or an inner group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityId {
    Queue(QueueId),
    Group(GroupId),
}

/// I/O priority class. Classes are served through separate service trees,
/// RT first, then BE, then IDLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IoClass {
    Rt = 0,
    Be = 1,
    Idle = 2,
}

pub const NR_IO_CLASSES: usize = 3;

/// Priority levels within the RT and BE classes.
pub const NR_IOPRIO_LEVELS: usize = 8;

impl IoClass {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> IoClass {
        match i {
            0 => IoClass::Rt,
            1 => IoClass::Be,
            _ => IoClass::Idle,
        }
    }
}

/// Requested I/O priority, as carried by the submitting process.
/// `None` inherits the default best-effort priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPrio {
    None,
    Rt(u8),
    Be(u8),
    Idle,
}

pub const DEFAULT_IOPRIO_LEVEL: u8 = 4;

impl IoPrio {
    /// Resolve to a concrete (class, level) pair.
    pub fn resolve(self) -> (IoClass, u8) {
        match self {
            IoPrio::None => (IoClass::Be, DEFAULT_IOPRIO_LEVEL),
            IoPrio::Rt(l) => (IoClass::Rt, l.min(NR_IOPRIO_LEVELS as u8 - 1)),
            IoPrio::Be(l) => (IoClass::Be, l.min(NR_IOPRIO_LEVELS as u8 - 1)),
            IoPrio::Idle => (IoClass::Idle, 7),
        }
    }
}

/// Weight conversion coefficient from priority levels, matching the legacy
/// scheduler scale: level 0 maps to weight 80, level 7 to weight 10.
pub const WEIGHT_CONVERSION_COEFF: u32 = 10;

pub fn ioprio_to_weight(level: u8) -> Weight {
    (NR_IOPRIO_LEVELS as u32 - level as u32) * WEIGHT_CONVERSION_COEFF
}

pub const MIN_WEIGHT: Weight = 1;
pub const MAX_WEIGHT: Weight = 1000;

/// Estimated device speed class, re-detected on every peak-rate update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    Fast,
    Slow,
}

/// Why the in-service queue was expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationReason {
    /// The queue consumed its whole time slice.
    BudgetTimeout,
    /// The budget was exhausted by served sectors.
    BudgetExhausted,
    /// The idling window elapsed without a new request.
    TooIdle,
    /// The queue emptied and idling was not allowed.
    NoMoreRequests,
    /// A newly busy queue asked for immediate service.
    Preempted,
}

/// Outcome of a merge lookup against the sort list of the submitter's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    None,
    /// The bio extends the matched request at its front.
    Front(RequestId),
    /// The bio extends the matched request at its back.
    Back(RequestId),
}

/// Direction of a request merge, as decided by [`MergeDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Front,
    Back,
}

/// Whether the block layer may (or must) allocate a request right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MayQueue {
    May,
    /// The in-service queue is idling for exactly this allocation.
    Must,
}

/// A timestamp far enough in the past that every "has enough time elapsed"
/// test passes.
pub fn distant_past(now: TimeNs) -> TimeNs {
    now.saturating_sub(u64::MAX / 2)
}

/// A timestamp far enough in the future that no simulated horizon reaches it.
pub fn distant_future(now: TimeNs) -> TimeNs {
    now.saturating_add(u64::MAX / 2)
}
