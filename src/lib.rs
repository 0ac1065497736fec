//! bfq_core - Budget Fair Queueing block I/O scheduler core.
//!
//! A proportional-share scheduler for a single block device: it divides
//! device service, measured in sectors, among processes in proportion to
//! their I/O priority weights, keeps latency low for interactive and soft
//! real-time workloads by transiently raising their weights, and preserves
//! throughput on internally queueing hardware through controlled idling.
//!
//! # Architecture
//!
//! - **Service trees**: per-class ordered sets scheduling entities by
//!   virtual finish time (B-WF2Q+)
//! - **Queues**: per-process request FIFOs with a sector-sorted index,
//!   weight-raising and cooperation state
//! - **Groups**: inner scheduling nodes composing queues into a hierarchy
//! - **Dispatcher**: in-service queue selection, device idling, expiration
//!   with budget feedback
//! - **Estimators**: device peak rate, think time, seek history, burst and
//!   cooperator detection
//!
//! The crate is deliberately free of clocks, locks and I/O: callers pass
//! `now` into every time-dependent entry point and serialize calls per
//! device, which makes whole scheduling histories deterministic and
//! testable.
//!
//! # Usage
//!
//! ```rust,no_run
//! use bfq_core::{RequestSpec, Scheduler, SchedulerConfig, IoPrio, Pid};
//!
//! let mut sched = Scheduler::new(SchedulerConfig::default()).unwrap();
//! let rq = sched.insert_request(0, RequestSpec {
//!     pid: Pid(100),
//!     sector: 2048,
//!     nr_sectors: 8,
//!     sync: true,
//!     meta: false,
//!     prio: IoPrio::None,
//! });
//! if let Some(dispatched) = sched.dispatch(1_000, false) {
//!     sched.activate_request(dispatched);
//!     // ... device serves it ...
//!     sched.completed_request(9_000, dispatched);
//! }
//! # let _ = rq;
//! ```

mod burst;
mod cooperate;
mod group;
mod ioctx;
mod queue;
mod rate;
mod request;
mod scheduler;
mod service_tree;
mod tunables;
mod types;
mod wf2q;

// Re-export the public surface.
pub use request::{BioSpec, RequestSpec};
pub use scheduler::{QueueStats, Scheduler, SchedulerConfig};
pub use tunables::Tunables;
pub use types::{
    DeviceSpeed, ExpirationReason, GroupId, IoClass, IoPrio, MayQueue, MergeDecision, MergeKind,
    Pid, QueueId, RequestId, Sector, TimeNs, Weight,
};
