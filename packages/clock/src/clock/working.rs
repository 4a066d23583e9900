//! The working clock, for production.
use std::time::Instant;

use super::Time;
use crate::{clock, MonotonicTimestamp};

#[allow(clippy::module_name_repetitions)]
pub struct WorkingClock;

lazy_static! {
    /// The process-wide epoch every working timestamp is measured from.
    static ref CLOCK_EPOCH: Instant = Instant::now();
}

impl Time for clock::Working {
    fn now() -> MonotonicTimestamp {
        CLOCK_EPOCH.elapsed()
    }

    fn dbg_clock_type() -> String {
        "Working".to_owned()
    }
}
