//! Write-rate governor.
//!
//! A token-bucket style limiter over one scalar input: the memory tier's
//! fill percentage ("demand"). The configured rate spreads a byte allowance
//! over a number of operations per window; demand scales the polling
//! interval, so a filling memory tier drains to disk faster and an idle one
//! barely touches it.

use crate::config::{DemandBands, WriteRate};
use std::time::{Duration, Instant};

/// Maximum operations per active window before it closes.
const MAX_OPS_PER_WINDOW: u32 = 4;

/// A grant from the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// Bytes that may be written now.
    Allowance(u32),
    /// Nothing to do yet; check back after this long.
    Wait(Duration),
}

/// What ending an allowance means for the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEnd {
    /// The window stays open; poll again after this long.
    Open(Duration),
    /// The op cap was reached: the window closed and the caller should
    /// commit (flush) before waiting this long.
    Closed(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Waiting,
    Rolling,
}

/// Converts memory-tier demand into byte allowances and wait intervals.
#[derive(Debug)]
pub struct Governor {
    op_interval: Duration,
    prev: Instant,
    run_off: u32,
    op_count: u32,
    op_allowance: u32,
    bands: DemandBands,
    state: State,
}

impl Governor {
    /// Creates a governor with an effectively idle default rate.
    #[must_use]
    pub fn new() -> Self {
        let mut governor = Self {
            op_interval: Duration::ZERO,
            prev: Instant::now(),
            run_off: 0,
            op_count: 0,
            op_allowance: 0,
            bands: DemandBands::default(),
            state: State::Waiting,
        };
        governor.set_rate(WriteRate {
            allowance: 1,
            ops: 1,
            seconds: 86_400,
        });
        governor
    }

    /// Configures the write rate: `allowance` bytes across `ops` operations
    /// every `seconds` seconds.
    pub fn set_rate(&mut self, rate: WriteRate) {
        let ops = rate.ops.max(1);
        self.op_allowance = rate.allowance / ops;
        self.op_interval = Duration::from_secs(u64::from(rate.seconds.max(1))) / ops;
    }

    /// Configures the demand bands that scale the polling interval.
    pub fn set_demand_bands(&mut self, bands: DemandBands) {
        self.bands = bands;
    }

    /// Requests an allowance for the given demand percentage.
    pub fn begin_allowance(&mut self, demand: u32) -> Grant {
        self.begin_at(demand, Instant::now())
    }

    /// Reports how much of the last grant went unused; it carries over into
    /// the next grant. Returns whether the window closed.
    pub fn end_allowance(&mut self, unused: u32) -> WindowEnd {
        self.run_off = unused;

        if self.op_count >= MAX_OPS_PER_WINDOW {
            self.state = State::Waiting;
            return WindowEnd::Closed(self.max_wait());
        }

        WindowEnd::Open(self.max_wait())
    }

    fn begin_at(&mut self, demand: u32, now: Instant) -> Grant {
        if self.state == State::Rolling {
            return self.begin_rolling(demand, now);
        }

        if demand < u32::from(self.bands.threshold) {
            return Grant::Wait(self.max_wait());
        }

        self.state = State::Rolling;
        self.prev = now;
        self.op_count = 1;
        self.run_off = 0;
        Grant::Allowance(self.op_allowance)
    }

    fn begin_rolling(&mut self, demand: u32, now: Instant) -> Grant {
        // Demand scales the interval: boost halves it, super-boost quarters
        // it, idle demand doubles it.
        let mut interval_ns = self.op_interval.as_nanos() as u64;
        interval_ns >>= u32::from(demand >= u32::from(self.bands.boost));
        interval_ns >>= u32::from(demand >= u32::from(self.bands.super_boost));
        interval_ns <<= u32::from(demand <= u32::from(self.bands.threshold));

        let delta_ns = now.saturating_duration_since(self.prev).as_nanos() as u64;
        let not_yet = delta_ns < interval_ns;

        // How far we are into the shortest poll interval; leftover time is
        // kept so slow polling does not starve the rate.
        let max_wait_ns = self.max_wait().as_nanos() as u64;
        let remainder_ns = if max_wait_ns == 0 {
            0
        } else {
            delta_ns % max_wait_ns
        };

        if not_yet {
            // Not at the current interval yet, but rising demand may pull
            // the schedule in; wait only to the next poll point.
            return Grant::Wait(Duration::from_nanos(max_wait_ns - remainder_ns));
        }

        self.prev = now - Duration::from_nanos(remainder_ns);
        self.op_count += 1;
        Grant::Allowance(self.op_allowance + self.run_off)
    }

    /// The shortest poll interval: a quarter of the configured one, so a
    /// demand change to super-boost is noticed without waiting a full
    /// interval.
    fn max_wait(&self) -> Duration {
        self.op_interval / 4
    }
}

impl Default for Governor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(allowance: u32, ops: u32, seconds: u32) -> Governor {
        let mut g = Governor::new();
        g.set_rate(WriteRate {
            allowance,
            ops,
            seconds,
        });
        g.set_demand_bands(DemandBands {
            threshold: 30,
            boost: 60,
            super_boost: 87,
        });
        g
    }

    #[test]
    fn idle_below_threshold() {
        let mut g = governor(1024, 4, 1);
        let now = Instant::now();
        match g.begin_at(10, now) {
            Grant::Wait(wait) => assert_eq!(wait, Duration::from_millis(250) / 4),
            Grant::Allowance(_) => panic!("expected wait while idle"),
        }
    }

    #[test]
    fn first_grant_starts_the_window() {
        let mut g = governor(1024, 4, 1);
        let now = Instant::now();
        assert_eq!(g.begin_at(50, now), Grant::Allowance(256));
    }

    #[test]
    fn grants_are_interval_paced() {
        let mut g = governor(1024, 4, 1);
        let start = Instant::now();
        assert_eq!(g.begin_at(50, start), Grant::Allowance(256));
        g.end_allowance(0);

        // Too soon: the interval is 250ms.
        match g.begin_at(50, start + Duration::from_millis(10)) {
            Grant::Wait(wait) => assert!(wait <= Duration::from_millis(250) / 4),
            Grant::Allowance(_) => panic!("granted before the interval elapsed"),
        }

        // After the interval the next grant arrives.
        assert_eq!(
            g.begin_at(50, start + Duration::from_millis(260)),
            Grant::Allowance(256)
        );
    }

    #[test]
    fn unused_allowance_carries_over() {
        let mut g = governor(1024, 4, 1);
        let start = Instant::now();
        assert_eq!(g.begin_at(50, start), Grant::Allowance(256));
        g.end_allowance(100);

        assert_eq!(
            g.begin_at(50, start + Duration::from_millis(300)),
            Grant::Allowance(356)
        );
    }

    #[test]
    fn window_closes_at_op_cap() {
        let mut g = governor(1024, 4, 1);
        let mut now = Instant::now();

        assert!(matches!(g.begin_at(50, now), Grant::Allowance(_)));
        for _ in 0..2 {
            assert!(matches!(g.end_allowance(0), WindowEnd::Open(_)));
            now += Duration::from_millis(260);
            assert!(matches!(g.begin_at(50, now), Grant::Allowance(_)));
        }

        now += Duration::from_millis(260);
        assert!(matches!(g.begin_at(50, now), Grant::Allowance(_)));
        // Fourth op reaches the cap: the window closes.
        assert!(matches!(g.end_allowance(0), WindowEnd::Closed(_)));

        // Low demand keeps the next window from opening.
        assert!(matches!(g.begin_at(10, now), Grant::Wait(_)));
        // High demand reopens it.
        assert!(matches!(g.begin_at(50, now), Grant::Allowance(_)));
    }

    #[test]
    fn boost_halves_the_interval() {
        let mut g = governor(1024, 4, 1);
        let start = Instant::now();
        assert!(matches!(g.begin_at(65, start), Grant::Allowance(_)));
        g.end_allowance(0);

        // 130ms is past the halved (125ms) interval but short of the full one.
        let at = start + Duration::from_millis(130);
        assert!(matches!(g.begin_at(65, at), Grant::Allowance(_)));

        // At the same point a non-boosted demand would still be waiting.
        let mut g = governor(1024, 4, 1);
        assert!(matches!(g.begin_at(50, start), Grant::Allowance(_)));
        g.end_allowance(0);
        assert!(matches!(g.begin_at(50, at), Grant::Wait(_)));
    }

    #[test]
    fn super_boost_quarters_the_interval() {
        let mut g = governor(1024, 4, 1);
        let start = Instant::now();
        assert!(matches!(g.begin_at(90, start), Grant::Allowance(_)));
        g.end_allowance(0);

        // 70ms is past the quartered (62.5ms) interval.
        assert!(matches!(
            g.begin_at(90, start + Duration::from_millis(70)),
            Grant::Allowance(_)
        ));
    }

    #[test]
    fn idle_demand_doubles_the_interval_mid_window() {
        let mut g = governor(1024, 4, 1);
        let start = Instant::now();
        assert!(matches!(g.begin_at(50, start), Grant::Allowance(_)));
        g.end_allowance(0);

        // 300ms is past the base interval but short of the doubled one.
        assert!(matches!(
            g.begin_at(10, start + Duration::from_millis(300)),
            Grant::Wait(_)
        ));
        assert!(matches!(
            g.begin_at(10, start + Duration::from_millis(510)),
            Grant::Allowance(_)
        ));
    }

    #[test]
    fn default_rate_is_effectively_idle() {
        let mut g = Governor::new();
        match g.begin_at(0, Instant::now()) {
            Grant::Wait(wait) => assert!(wait >= Duration::from_secs(3600)),
            Grant::Allowance(_) => panic!("default governor should idle"),
        }
    }
}
