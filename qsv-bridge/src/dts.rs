//! Decode timestamp reconstruction.
//!
//! Helpers from protocol 1.6 on report usable decode timestamps in constant
//! frame rate mode; they are passed through. Otherwise decode order is rebuilt
//! from the submitted presentation timestamps: the first `delay + 1` frames are
//! placed relative to the reorder window, every later frame takes the next
//! submitted timestamp in order.

use std::collections::VecDeque;

use crate::platform::CpuPlatform;
use crate::protocol::Version;

#[derive(Debug, Clone)]
pub struct DtsGenerator {
    version_1_6: bool,
    pyramid: bool,
    use_reported: bool,
    delay: usize,
    frame_ticks: i64,
    frames_out: u64,
    init_pts: Vec<i64>,
    dts: VecDeque<i64>,
}

impl DtsGenerator {
    pub fn new(
        bframe_delay: u32,
        version: Version,
        use_cfr: bool,
        frame_ticks: u64,
        platform: CpuPlatform,
    ) -> Self {
        let version_1_6 = version.at_least(1, 6);
        Self {
            version_1_6,
            pyramid: platform.has_pyramid_bframes(),
            use_reported: version_1_6 && use_cfr,
            delay: bframe_delay as usize,
            frame_ticks: frame_ticks as i64,
            frames_out: 0,
            init_pts: Vec::new(),
            dts: VecDeque::new(),
        }
    }

    pub fn uses_reported(&self) -> bool {
        self.use_reported
    }

    pub fn delay(&self) -> usize {
        self.delay
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out
    }

    /// Registers the timestamp of a submitted frame.
    pub fn add(&mut self, ts: i64) {
        if self.use_reported {
            return;
        }
        if !self.init_pts.is_empty() || self.frames_out == 0 {
            self.init_pts.push(ts);
        }
        self.dts.push_back(ts);
    }

    /// Decode timestamp of the next completed frame, in completion order.
    pub fn resolve(&mut self, reported_pts: i64, reported_dts: i64) -> i64 {
        if self.use_reported {
            return reported_dts;
        }

        if self.frames_out == 0 && self.version_1_6 && self.pyramid && self.frame_ticks > 0 {
            let delay = (reported_pts - reported_dts + self.frame_ticks / 2) / self.frame_ticks;
            if delay > 0 {
                self.delay = delay as usize;
            }
            log::info!(
                "recalculated bframe delay: {}, pending timestamps: {}",
                self.delay,
                self.init_pts.len()
            );
        }

        let result = if self.frames_out <= self.delay as u64 {
            if self.delay >= self.init_pts.len() {
                log::warn!(
                    "bframe delay {} >= pending timestamps {}",
                    self.delay,
                    self.init_pts.len()
                );
                self.delay = self.init_pts.len().saturating_sub(1);
            }
            match (
                self.init_pts.get(self.frames_out as usize),
                self.init_pts.get(self.delay),
            ) {
                (Some(pts), Some(anchor)) => pts - anchor,
                _ => {
                    log::warn!("no submitted timestamp for output {}", self.frames_out);
                    reported_dts
                }
            }
        } else {
            self.init_pts.clear();
            match self.dts.pop_front() {
                Some(dts) => dts,
                None => {
                    log::warn!("no submitted timestamp for output {}", self.frames_out);
                    reported_dts
                }
            }
        };

        self.frames_out += 1;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(delay: u32, version: Version, cfr: bool, platform: CpuPlatform) -> DtsGenerator {
        DtsGenerator::new(delay, version, cfr, 3000, platform)
    }

    #[test]
    fn test_reorder_window_then_fifo() {
        let mut g = generator(2, Version::new(1, 6), false, CpuPlatform::IvyBridge);
        for ts in [100, 200, 300, 400] {
            g.add(ts);
        }
        let out: Vec<i64> = [(100, 0), (200, 0), (300, 0), (400, 200)]
            .into_iter()
            .map(|(pts, dts)| g.resolve(pts, dts))
            .collect();
        // ring[i] - ring[delay] for the first three, then the oldest submission
        assert_eq!(out, vec![-200, -100, 0, 100]);
        assert!(out.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(g.frames_out(), 4);
    }

    #[test]
    fn test_later_submissions_skip_ring() {
        let mut g = generator(1, Version::new(1, 3), false, CpuPlatform::Unknown);
        g.add(0);
        g.add(3000);
        assert_eq!(g.resolve(0, 0), -3000);
        g.add(6000);
        assert_eq!(g.resolve(3000, 0), 0);
        g.add(9000);
        assert_eq!(g.resolve(6000, 0), 0);
        assert_eq!(g.resolve(9000, 0), 3000);
        assert_eq!(g.resolve(12000, 0), 6000);
    }

    #[test]
    fn test_pass_through_in_cfr() {
        let mut g = generator(2, Version::new(1, 6), true, CpuPlatform::Haswell);
        assert!(g.uses_reported());
        g.add(100);
        assert_eq!(g.resolve(100, -42), -42);
        assert_eq!(g.resolve(200, 17), 17);

        let g = generator(2, Version::new(1, 5), true, CpuPlatform::Haswell);
        assert!(!g.uses_reported());
    }

    #[test]
    fn test_pyramid_recalibration() {
        let mut g = generator(1, Version::new(1, 7), false, CpuPlatform::Haswell);
        for ts in [0, 3000, 6000, 9000, 12000] {
            g.add(ts);
        }
        // pts - dts of 2.4 frames rounds to 2
        assert_eq!(g.resolve(7200, 0), -6000);
        assert_eq!(g.delay(), 2);

        let mut g = generator(1, Version::new(1, 7), false, CpuPlatform::IvyBridge);
        g.add(0);
        g.add(3000);
        g.resolve(9000, 0);
        assert_eq!(g.delay(), 1);
    }

    #[test]
    fn test_delay_clamped_to_window() {
        let mut g = generator(4, Version::new(1, 0), false, CpuPlatform::Unknown);
        g.add(0);
        g.add(3000);
        assert_eq!(g.resolve(0, 0), -3000);
        assert_eq!(g.delay(), 1);
    }
}
