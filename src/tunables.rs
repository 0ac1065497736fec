//! Scheduler tunables.
//!
//! Attribute names match the user-visible knobs of the original scheduler.
//! Out-of-range values are clamped, never rejected.

use serde::{Deserialize, Serialize};

use crate::types::TimeNs;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Deadline for sync requests, in milliseconds.
    pub fifo_expire_sync: u64,
    /// Deadline for async requests, in milliseconds.
    pub fifo_expire_async: u64,
    /// Maximum backwards seek tolerated, in KiB.
    pub back_seek_max: u64,
    /// Multiplier on backward seek distance.
    pub back_seek_penalty: u64,
    /// Idling window, in nanoseconds.
    pub slice_idle: u64,
    /// Per-activation budget cap in sectors; 0 selects auto-tuning.
    pub max_budget: u64,
    /// Per-slice time budget, in milliseconds.
    pub timeout_sync: u64,
    /// Serialize at the device: at most one request in the driver.
    pub strict_guarantees: bool,
    /// Enable weight raising.
    pub low_latency: bool,
    /// Weight-raising multiplier.
    pub wr_coeff: u32,
    /// Fixed weight-raising duration in milliseconds; 0 selects auto-tuning.
    pub wr_max_time: u64,
    /// Soft real-time raising window, in milliseconds.
    pub wr_rt_max_time: u64,
    /// Idle threshold for interactivity, in milliseconds.
    pub wr_min_idle_time: u64,
    /// Async raising inter-arrival threshold, in milliseconds.
    pub wr_min_inter_arr_async: u64,
    /// Soft real-time rate ceiling, in sectors per second.
    pub wr_max_softrt_rate: u64,
    /// Grace period after weight raising starts during which cooperator
    /// merging is still allowed, in milliseconds.
    pub wr_too_long_grace: u64,
    /// Maximum gap between queue creations considered part of one burst,
    /// in milliseconds.
    pub burst_interval: u64,
    /// Number of clustered queue creations that makes a burst large.
    pub large_burst_thresh: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            fifo_expire_sync: 250,
            fifo_expire_async: 125,
            back_seek_max: 16 * 1024,
            back_seek_penalty: 2,
            slice_idle: 8_000_000,
            max_budget: 0,
            timeout_sync: 125,
            strict_guarantees: false,
            low_latency: true,
            wr_coeff: 30,
            wr_max_time: 0,
            wr_rt_max_time: 300,
            wr_min_idle_time: 2_000,
            wr_min_inter_arr_async: 500,
            wr_max_softrt_rate: 7_000,
            wr_too_long_grace: 100,
            burst_interval: 180,
            large_burst_thresh: 8,
        }
    }
}

impl Tunables {
    /// Clamp every attribute to its declared range.
    pub fn clamp(mut self) -> Self {
        self.fifo_expire_sync = self.fifo_expire_sync.clamp(1, 60_000);
        self.fifo_expire_async = self.fifo_expire_async.clamp(1, 60_000);
        self.back_seek_max = self.back_seek_max.min(1 << 30);
        self.back_seek_penalty = self.back_seek_penalty.clamp(1, 1 << 10);
        self.slice_idle = self.slice_idle.min(1_000_000_000);
        self.timeout_sync = self.timeout_sync.clamp(1, 60_000);
        self.wr_coeff = self.wr_coeff.clamp(1, 10_000);
        self.wr_rt_max_time = self.wr_rt_max_time.clamp(1, 60_000);
        self.large_burst_thresh = self.large_burst_thresh.clamp(2, 1024);
        self
    }

    pub fn fifo_expire_ns(&self, sync: bool) -> TimeNs {
        let ms = if sync {
            self.fifo_expire_sync
        } else {
            self.fifo_expire_async
        };
        ms * crate::types::NSEC_PER_MSEC
    }

    pub fn timeout_ns(&self) -> TimeNs {
        self.timeout_sync * crate::types::NSEC_PER_MSEC
    }

    /// Maximum backwards seek in sectors (1 KiB is two sectors).
    pub fn back_seek_max_sectors(&self) -> u64 {
        self.back_seek_max * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference() {
        let t = Tunables::default();
        assert_eq!(t.fifo_expire_sync, 250);
        assert_eq!(t.fifo_expire_async, 125);
        assert_eq!(t.slice_idle, 8_000_000);
        assert_eq!(t.wr_coeff, 30);
        assert_eq!(t.wr_max_softrt_rate, 7_000);
        assert!(t.low_latency);
        assert!(!t.strict_guarantees);
    }

    #[test]
    fn test_clamping() {
        let t = Tunables {
            fifo_expire_sync: 0,
            back_seek_penalty: 0,
            wr_coeff: 1_000_000,
            large_burst_thresh: 0,
            ..Default::default()
        }
        .clamp();
        assert_eq!(t.fifo_expire_sync, 1);
        assert_eq!(t.back_seek_penalty, 1);
        assert_eq!(t.wr_coeff, 10_000);
        assert_eq!(t.large_burst_thresh, 2);
    }

    #[test]
    fn test_serde_round_trip() {
        let t = Tunables {
            timeout_sync: 100,
            strict_guarantees: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&t).unwrap();
        let back: Tunables = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timeout_sync, 100);
        assert!(back.strict_guarantees);
    }
}
