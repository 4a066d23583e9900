//! Delay-based congestion control for uTP senders.
//!
//! Two controllers run side by side, both driven by the one-way delay
//! the peer reports in its `timestamp_difference` field:
//!
//! - A LEDBAT-style congestion window (BEP 29): keep the measured queuing
//!   delay near a small target so background transfers yield to
//!   interactive traffic. Below target the window grows additively, above
//!   target it shrinks multiplicatively.
//! - An AIMD byte-rate estimator used as a secondary pacing signal.
//!
//! The controllers are pure state machines over injected timestamps, so
//! tests drive them with a stopped clock and exact delays.
use std::time::Duration;

use torrkit_clock::MonotonicTimestamp;

/// One maximum-segment-size step, in bytes. Window arithmetic grows and
/// floors in units of this.
pub const MSS: u32 = 1500;

/// The LEDBAT queuing-delay ceiling. The effective target is
/// `min(TARGET_DELAY, SRTT)`.
pub const TARGET_DELAY: Duration = Duration::from_millis(100);

/// Multiplicative decrease factor applied on congestion.
const DECREASE_FACTOR: f64 = 0.8;

/// Additive increase applied to the rate estimator, bytes/second per update.
const RATE_INCREASE_STEP: f64 = 150.0;

/// Minimum interval between rate estimator updates.
const RATE_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// LEDBAT congestion window plus AIMD rate estimator.
#[derive(Debug)]
pub struct CongestionController {
    /// Congestion window in bytes (not yet clamped by the peer window).
    window: u32,
    /// Configured window ceiling before scaling.
    max_window: u32,
    /// Negotiated window-scale shift; raises the ceiling.
    window_shift: u8,
    /// Estimated fair send rate, bytes per second.
    rate: f64,
    max_rate: f64,
    min_rate: f64,
    last_rate_update: Option<MonotonicTimestamp>,
    /// Set after a window reduction; echoed to the peer as CWR once.
    cwr_pending: bool,
}

impl CongestionController {
    #[must_use]
    pub fn new(max_window: u32, max_rate: u32, min_rate: u32) -> CongestionController {
        CongestionController {
            window: max_window.min(u32::from(u16::MAX)),
            max_window,
            window_shift: 0,
            rate: f64::from(min_rate).max(1500.0),
            max_rate: f64::from(max_rate),
            min_rate: f64::from(min_rate),
            last_rate_update: None,
            cwr_pending: false,
        }
    }

    /// Applies the negotiated window-scale shift to the window ceiling.
    pub fn set_window_shift(&mut self, shift: u8) {
        self.window_shift = shift;
    }

    /// Congestion window in bytes. Callers clamp this against the peer's
    /// advertised window to get the effective send window.
    #[must_use]
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Current rate estimate in bytes per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Takes the pending congestion-window-reduced flag, clearing it.
    pub fn take_cwr(&mut self) -> bool {
        std::mem::take(&mut self.cwr_pending)
    }

    fn scaled_max_window(&self) -> u32 {
        self.max_window.checked_shl(u32::from(self.window_shift)).unwrap_or(u32::MAX)
    }

    /// The LEDBAT delay target: `min(100 ms, SRTT)`.
    fn target_delay(srtt: Option<Duration>) -> Duration {
        srtt.map_or(TARGET_DELAY, |srtt| srtt.min(TARGET_DELAY))
    }

    /// One LEDBAT window update from a fresh delay sample.
    ///
    /// Below target: grow by one MSS. Above target: shrink to 0.8x,
    /// floored at two MSS. On target: hold. The result is clamped to the
    /// scaled configured ceiling.
    pub fn on_delay_sample(&mut self, delay: Duration, srtt: Option<Duration>) {
        let target = Self::target_delay(srtt);

        let window = if delay < target {
            self.window.saturating_add(MSS)
        } else if delay > target {
            self.decreased_window()
        } else {
            self.window
        };

        self.window = window.min(self.scaled_max_window());
    }

    /// Responds to a congestion signal (an IP-layer CE mark or an
    /// ECN-Echo from the peer): multiplicative decrease and remember to
    /// signal CWR on the next outgoing state packet.
    pub fn on_congestion_event(&mut self) {
        self.window = self.decreased_window();
        self.cwr_pending = true;
    }

    fn decreased_window(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let decreased = (f64::from(self.window) * DECREASE_FACTOR) as u32;
        decreased.max(2 * MSS)
    }

    /// One AIMD rate update, throttled to one per 100 ms.
    ///
    /// Below `1.2x` the delay target the rate grows by a fixed step;
    /// above `1.5x` it decays multiplicatively. In between it holds.
    pub fn update_rate(&mut self, delay: Duration, srtt: Option<Duration>, now: MonotonicTimestamp) -> f64 {
        if let Some(last) = self.last_rate_update {
            if now.saturating_sub(last) < RATE_UPDATE_INTERVAL {
                return self.rate;
            }
        }

        let target = Self::target_delay(srtt);

        if delay < target.mul_f64(1.2) {
            self.rate = (self.rate + RATE_INCREASE_STEP).min(self.max_rate);
        } else if delay > target.mul_f64(1.5) {
            self.rate = (self.rate * DECREASE_FACTOR).max(self.min_rate);
        }

        self.last_rate_update = Some(now);
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CongestionController, MSS};

    fn controller() -> CongestionController {
        CongestionController::new(65_535, 1_000_000, 512)
    }

    #[test]
    fn it_should_grow_the_window_additively_below_the_delay_target() {
        let mut congestion = controller();
        let before = congestion.window();

        congestion.on_delay_sample(Duration::from_millis(10), None);

        assert_eq!(congestion.window(), before + MSS);
    }

    #[test]
    fn it_should_shrink_the_window_multiplicatively_above_the_delay_target() {
        let mut congestion = controller();
        let before = congestion.window();

        congestion.on_delay_sample(Duration::from_millis(200), None);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let expected = (f64::from(before) * 0.8) as u32;
        assert_eq!(congestion.window(), expected);
    }

    #[test]
    fn it_should_hold_the_window_at_the_delay_target() {
        let mut congestion = controller();
        let before = congestion.window();

        congestion.on_delay_sample(Duration::from_millis(100), None);

        assert_eq!(congestion.window(), before);
    }

    #[test]
    fn it_should_use_srtt_as_the_target_when_it_is_below_100ms() {
        let mut congestion = controller();
        let before = congestion.window();

        // 40 ms delay is below the 100 ms ceiling but above a 20 ms SRTT.
        congestion.on_delay_sample(Duration::from_millis(40), Some(Duration::from_millis(20)));

        assert!(congestion.window() < before);
    }

    #[test]
    fn it_should_floor_the_window_at_two_segments() {
        let mut congestion = controller();

        for _ in 0..64 {
            congestion.on_delay_sample(Duration::from_secs(1), None);
        }

        assert_eq!(congestion.window(), 2 * MSS);
    }

    #[test]
    fn it_should_clamp_the_window_to_the_scaled_maximum() {
        let mut congestion = CongestionController::new(4096, 1_000_000, 512);
        congestion.set_window_shift(1);

        for _ in 0..16 {
            congestion.on_delay_sample(Duration::ZERO, None);
        }

        assert_eq!(congestion.window(), 4096 << 1);
    }

    #[test]
    fn it_should_reduce_the_window_and_flag_cwr_on_a_congestion_event() {
        let mut congestion = controller();
        let before = congestion.window();

        congestion.on_congestion_event();

        assert!(congestion.window() < before);
        assert!(congestion.take_cwr());
        // The flag is consumed.
        assert!(!congestion.take_cwr());
    }

    #[test]
    fn it_should_increase_the_rate_additively_under_low_delay() {
        let mut congestion = controller();
        let before = congestion.rate();

        let rate = congestion.update_rate(Duration::from_millis(10), None, Duration::ZERO);

        assert!((rate - (before + 150.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn it_should_decrease_the_rate_multiplicatively_under_high_delay() {
        let mut congestion = controller();
        let before = congestion.rate();

        let rate = congestion.update_rate(Duration::from_millis(200), None, Duration::ZERO);

        assert!((rate - before * 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn it_should_throttle_rate_updates_to_one_per_100ms() {
        let mut congestion = controller();

        let first = congestion.update_rate(Duration::from_millis(10), None, Duration::ZERO);
        // 50 ms later: ignored.
        let second = congestion.update_rate(Duration::from_millis(10), None, Duration::from_millis(50));
        // 150 ms after the first: applied.
        let third = congestion.update_rate(Duration::from_millis(10), None, Duration::from_millis(150));

        assert!((second - first).abs() < f64::EPSILON);
        assert!(third > second);
    }

    #[test]
    fn it_should_respect_the_configured_rate_bounds() {
        let mut congestion = CongestionController::new(65_535, 2000, 512);

        for i in 0..100u64 {
            congestion.update_rate(Duration::from_millis(10), None, Duration::from_millis(i * 200));
        }
        assert!((congestion.rate() - 2000.0).abs() < f64::EPSILON);

        for i in 100..300u64 {
            congestion.update_rate(Duration::from_secs(1), None, Duration::from_millis(i * 200));
        }
        assert!((congestion.rate() - 512.0).abs() < f64::EPSILON);
    }
}
