//! Peak-rate estimation and throughput/responsiveness auto-tuning.
//!
//! The device's service rate cannot be observed directly once requests sit
//! in internal queues, but the dispatch rate converges to it over a long
//! enough window because no request is dropped. The estimator therefore
//! samples every dispatch, closes an observation window after about a
//! second, and folds the measured bandwidth into a low-pass filtered peak
//! estimate, weighting mostly-sequential and long windows more. Every
//! update re-derives the maximum budget and re-classifies the device speed,
//! which picks the reference pair driving weight-raising duration.

use log::{debug, trace};

use crate::types::{
    DeviceSpeed, Sector, TimeNs, NSEC_PER_MSEC, NSEC_PER_USEC, USEC_PER_MSEC, USEC_PER_SEC,
};

/// Fixed-point shift of all rates: sectors/usec << RATE_SHIFT.
pub(crate) const RATE_SHIFT: u32 = 16;

/// Minimum number of dispatch samples for a window to produce an update.
const RATE_MIN_SAMPLES: u32 = 32;
/// Minimum observation window length (us).
const RATE_MIN_INTERVAL_US: u64 = 300 * USEC_PER_MSEC;
/// Target observation window length (us).
const RATE_REF_INTERVAL_US: u64 = USEC_PER_SEC;

/// Below this gap (ns) a completion counts as immediate for the purpose of
/// classifying the next dispatch as sequential.
pub(crate) const MIN_TT_NS: TimeNs = 2 * NSEC_PER_MSEC;

/// Consecutive requests closer than this are sequential (sectors).
pub(crate) const SEEK_THR: u64 = 8 * 100;

/// Default budget cap used until the estimator has produced enough data.
pub(crate) const DEFAULT_MAX_BUDGET: u64 = 16 * 1024;

// Reference rates (sectors/usec << RATE_SHIFT) and responsiveness times
// (ms), indexed by [rotational, non-rotational]. The rates sit slightly
// below the actual peaks of the reference devices because the estimator
// itself tends to undershoot. Frozen at compile time.
const R_SLOW: [u64; 2] = [1_000, 10_700];
const R_FAST: [u64; 2] = [14_000, 33_000];
const T_SLOW_MS: [u64; 2] = [3_500, 1_000];
const T_FAST_MS: [u64; 2] = [7_000, 2_500];

fn speed_thresh(nonrot: bool) -> u64 {
    // Biased towards the fast class: a wrong "fast" verdict merely lengthens
    // weight raising, a wrong "slow" verdict truncates it.
    4 * R_SLOW[nonrot as usize] / 3
}

#[derive(Debug)]
pub(crate) struct PeakRateEstimator {
    nonrot: bool,
    timeout_ms: u64,
    /// User-pinned max budget; 0 keeps auto-tuning active.
    user_max_budget: u64,

    /// Estimated device peak rate, sectors/usec << RATE_SHIFT.
    pub peak_rate: u64,
    pub device_speed: DeviceSpeed,
    /// Product of the active reference rate and reference time.
    rt_prod: u64,
    /// Auto-tuned budget cap in sectors.
    pub dyn_max_budget: u64,

    samples: u32,
    sequential_samples: u32,
    tot_sectors: u64,
    first_dispatch: TimeNs,
    pub last_dispatch: TimeNs,
    pub last_completion: TimeNs,
    last_rq_max_size: u64,
    delta_from_first_us: u64,
    last_position: Sector,
}

impl PeakRateEstimator {
    pub fn new(nonrot: bool, timeout_ms: u64, user_max_budget: u64) -> Self {
        let d = nonrot as usize;
        PeakRateEstimator {
            nonrot,
            timeout_ms,
            user_max_budget,
            // Optimistic start: a fast device running at 2/3 of the
            // reference peak.
            peak_rate: R_FAST[d] * 2 / 3,
            device_speed: DeviceSpeed::Fast,
            rt_prod: R_FAST[d] * T_FAST_MS[d],
            dyn_max_budget: DEFAULT_MAX_BUDGET,
            samples: 0,
            sequential_samples: 0,
            tot_sectors: 0,
            first_dispatch: 0,
            last_dispatch: 0,
            last_completion: 0,
            last_rq_max_size: 0,
            delta_from_first_us: 0,
            last_position: 0,
        }
    }

    /// Head position after the most recently dispatched request.
    pub fn last_position(&self) -> Sector {
        self.last_position
    }

    /// Auto-tuned duration of an interactive weight-raising period.
    pub fn wr_duration(&self, wr_max_time_ms: u64) -> TimeNs {
        if wr_max_time_ms > 0 {
            return wr_max_time_ms * NSEC_PER_MSEC;
        }
        let dur_ms = (self.rt_prod / self.peak_rate.max(1)).clamp(3_000, 13_000);
        dur_ms * NSEC_PER_MSEC
    }

    /// Account one dispatch. `rq_in_driver` is the driver depth before this
    /// request reaches it.
    pub fn on_dispatch(&mut self, now: TimeNs, sector: Sector, nr_sectors: u64, rq_in_driver: u32) {
        if self.samples == 0 {
            self.reset_window(Some(nr_sectors), now);
            self.update_last_values(now, sector, nr_sectors);
            return;
        }

        // A long dispatch gap with an empty driver invalidates the window:
        // close it at the previous dispatch and start over.
        if now.saturating_sub(self.last_dispatch) > 100 * NSEC_PER_MSEC && rq_in_driver == 0 {
            trace!(
                "peak-rate: {}us dispatch gap, closing window early",
                now.saturating_sub(self.last_dispatch) / NSEC_PER_USEC
            );
            self.update_rate_and_reset(Some(nr_sectors), now);
            self.update_last_values(now, sector, nr_sectors);
            return;
        }

        self.samples += 1;

        let seq_dist = crate::request::sdist(self.last_position, sector);
        if (rq_in_driver > 0 || now.saturating_sub(self.last_completion) < MIN_TT_NS)
            && seq_dist < SEEK_THR
        {
            self.sequential_samples += 1;
        }

        self.tot_sectors += nr_sectors;

        // Track the largest request seen, restarting every 32 dispatches.
        if self.samples % 32 != 0 {
            self.last_rq_max_size = self.last_rq_max_size.max(nr_sectors);
        } else {
            self.last_rq_max_size = nr_sectors;
        }

        self.delta_from_first_us = now.saturating_sub(self.first_dispatch) / NSEC_PER_USEC;

        if self.delta_from_first_us >= RATE_REF_INTERVAL_US {
            self.update_rate_and_reset(Some(nr_sectors), now);
        }

        self.update_last_values(now, sector, nr_sectors);
    }

    /// Account one completion. A completion so late that the implied rate
    /// falls below roughly one million sectors per second discards the
    /// current window.
    pub fn on_completion(&mut self, now: TimeNs) {
        let delta_us = now.saturating_sub(self.last_completion) / NSEC_PER_USEC;
        if delta_us > MIN_TT_NS / NSEC_PER_USEC
            && (self.last_rq_max_size << RATE_SHIFT) / delta_us.max(1) < 1 << (RATE_SHIFT - 10)
        {
            trace!("peak-rate: late completion ({delta_us}us), discarding window");
            self.update_rate_and_reset(None, now);
        }
        self.last_completion = now;
    }

    fn update_last_values(&mut self, now: TimeNs, sector: Sector, nr_sectors: u64) {
        self.last_position = sector + nr_sectors;
        self.last_dispatch = now;
    }

    fn reset_window(&mut self, rq_sectors: Option<u64>, now: TimeNs) {
        match rq_sectors {
            Some(sectors) => {
                self.first_dispatch = now;
                self.last_dispatch = now;
                self.samples = 1;
                self.sequential_samples = 0;
                self.tot_sectors = sectors;
                self.last_rq_max_size = sectors;
            }
            // Full re-initialization on the next dispatch.
            None => self.samples = 0,
        }
        self.delta_from_first_us = 0;
    }

    fn update_rate_and_reset(&mut self, rq_sectors: Option<u64>, now: TimeNs) {
        if self.samples < RATE_MIN_SAMPLES || self.delta_from_first_us < RATE_MIN_INTERVAL_US {
            self.reset_window(rq_sectors, now);
            return;
        }

        // If a completion arrived after the last dispatch, extending the
        // window to it approximates the in-device service time better.
        self.delta_from_first_us = self.delta_from_first_us.max(
            self.last_completion
                .saturating_sub(self.first_dispatch)
                / NSEC_PER_USEC,
        );

        let bw = (self.tot_sectors << RATE_SHIFT) / self.delta_from_first_us.max(1);

        // Reject the window if it was mostly random and did not beat the
        // current peak, or if the measured rate is implausible.
        let mostly_sequential = self.sequential_samples >= (3 * self.samples) / 4;
        if (!mostly_sequential && bw <= self.peak_rate) || bw > 20 << RATE_SHIFT {
            trace!(
                "peak-rate: window rejected, samples {}/{} bw {}",
                self.sequential_samples,
                self.samples,
                bw
            );
            self.reset_window(rq_sectors, now);
            return;
        }

        // Low-pass blend. The weight of the new measurement grows with how
        // sequential the window was and how long it lasted, from 1/10th of
        // the new estimate up to one half.
        let mut weight = (9 * self.sequential_samples as u64) / self.samples as u64;
        weight = (weight * self.delta_from_first_us / RATE_REF_INTERVAL_US).min(8);
        let divisor = 10 - weight;

        self.peak_rate = self.peak_rate * (divisor - 1) / divisor + bw / divisor;

        debug!(
            "peak-rate: updated to {} sectors/s (weight {weight})",
            self.peak_rate * USEC_PER_SEC >> RATE_SHIFT
        );

        self.retune();
        self.reset_window(rq_sectors, now);
    }

    /// Re-derive the budget cap and the device speed class from the peak.
    fn retune(&mut self) {
        if self.user_max_budget == 0 {
            self.dyn_max_budget = self.calc_max_budget();
        }

        let d = self.nonrot as usize;
        let thresh = speed_thresh(self.nonrot);
        if self.device_speed == DeviceSpeed::Fast && self.peak_rate < thresh {
            self.device_speed = DeviceSpeed::Slow;
            self.rt_prod = R_SLOW[d] * T_SLOW_MS[d];
            debug!("peak-rate: device reclassified SLOW");
        } else if self.device_speed == DeviceSpeed::Slow && self.peak_rate > thresh {
            self.device_speed = DeviceSpeed::Fast;
            self.rt_prod = R_FAST[d] * T_FAST_MS[d];
            debug!("peak-rate: device reclassified FAST");
        }
    }

    /// Sectors the device transfers in one full time slice at peak rate.
    pub fn calc_max_budget(&self) -> u64 {
        (self.peak_rate * USEC_PER_MSEC * self.timeout_ms) >> RATE_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq_dispatches(est: &mut PeakRateEstimator, n: u32, gap_ns: u64, sectors: u64) -> TimeNs {
        let mut now = NSEC_PER_MSEC;
        let mut sector = est.last_position().max(4096);
        for _ in 0..n {
            est.on_dispatch(now, sector, sectors, 1);
            sector += sectors;
            now += gap_ns;
        }
        now
    }

    #[test]
    fn test_short_window_produces_no_update() {
        let mut est = PeakRateEstimator::new(false, 125, 0);
        let initial = est.peak_rate;
        // Only 10 samples; window closes on the long-gap path and must be
        // discarded.
        let now = seq_dispatches(&mut est, 10, NSEC_PER_MSEC, 8);
        est.on_dispatch(now + 200 * NSEC_PER_MSEC, 1 << 30, 8, 0);
        assert_eq!(est.peak_rate, initial);
    }

    #[test]
    fn test_sequential_window_blends_into_peak() {
        let mut est = PeakRateEstimator::new(false, 125, 0);
        let initial = est.peak_rate;
        // 64 dispatches of 512 sectors, ~16ms apart: window exceeds one
        // second with plenty of samples.
        seq_dispatches(&mut est, 70, 16 * NSEC_PER_MSEC, 512);
        assert_ne!(est.peak_rate, initial, "peak should have been updated");
        assert_eq!(est.dyn_max_budget, est.calc_max_budget());
    }

    #[test]
    fn test_slow_sequential_device_reclassified() {
        let mut est = PeakRateEstimator::new(false, 125, 0);
        // Serve ~16 sectors/ms sequentially: below the rotational speed
        // threshold, repeated until the blend drags the estimate down.
        for round in 0..20 {
            let mut now = (1 + round) * 2_100_000_000;
            let mut sector = 8_192;
            for _ in 0..64 {
                est.on_dispatch(now, sector, 512, 1);
                sector += 512;
                now += 31 * NSEC_PER_MSEC;
            }
        }
        assert_eq!(est.device_speed, DeviceSpeed::Slow);
    }

    #[test]
    fn test_late_completion_discards_window() {
        let mut est = PeakRateEstimator::new(false, 125, 0);
        let initial = est.peak_rate;
        // A window too short to be trusted (under 300ms)...
        seq_dispatches(&mut est, 40, 5 * NSEC_PER_MSEC, 512);
        // ...closed by a completion implying a rate far below a million
        // sectors per second: the window is discarded without an update.
        est.on_completion(10 * crate::types::NSEC_PER_SEC);
        assert_eq!(est.peak_rate, initial);
        assert_eq!(est.last_completion, 10 * crate::types::NSEC_PER_SEC);
    }

    #[test]
    fn test_wr_duration_clamped() {
        let est = PeakRateEstimator::new(false, 125, 0);
        let dur = est.wr_duration(0);
        assert!(dur >= 3_000 * NSEC_PER_MSEC && dur <= 13_000 * NSEC_PER_MSEC);
        assert_eq!(est.wr_duration(500), 500 * NSEC_PER_MSEC);
    }
}
