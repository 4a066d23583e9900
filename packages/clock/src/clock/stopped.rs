//! The stopped clock, for deterministic tests.
use std::num::IntErrorKind;
use std::time::Duration;

use super::Time;
use crate::{clock, MonotonicTimestamp};

#[allow(clippy::module_name_repetitions)]
pub struct StoppedClock {}

#[allow(clippy::module_name_repetitions)]
pub trait Stopped: Time {
    /// It sets the clock to a given timestamp.
    fn local_set(timestamp: &MonotonicTimestamp);

    /// It sets the clock back to the epoch.
    fn local_set_to_epoch() {
        Self::local_set(&MonotonicTimestamp::ZERO);
    }

    /// It adds a `Duration` to the clock.
    ///
    /// # Errors
    ///
    /// Will return `IntErrorKind` if `duration` would overflow the internal `Duration`.
    fn local_add(duration: &Duration) -> Result<(), IntErrorKind>;

    /// It resets the clock to the epoch.
    fn local_reset();
}

impl Time for clock::Stopped {
    fn now() -> MonotonicTimestamp {
        detail::FIXED_TIME.with(|time| {
            return *time.borrow();
        })
    }

    fn dbg_clock_type() -> String {
        "Stopped".to_owned()
    }
}

impl Stopped for clock::Stopped {
    fn local_set(timestamp: &MonotonicTimestamp) {
        detail::FIXED_TIME.with(|time| {
            *time.borrow_mut() = *timestamp;
        });
    }

    fn local_add(duration: &Duration) -> Result<(), IntErrorKind> {
        detail::FIXED_TIME.with(|time| {
            let time_borrowed = *time.borrow();
            *time.borrow_mut() = match time_borrowed.checked_add(*duration) {
                Some(time) => time,
                None => {
                    return Err(IntErrorKind::PosOverflow);
                }
            };
            Ok(())
        })
    }

    fn local_reset() {
        Self::local_set(&MonotonicTimestamp::ZERO);
    }
}


mod detail {
    use std::cell::RefCell;

    use crate::MonotonicTimestamp;

    thread_local!(pub static FIXED_TIME: RefCell<MonotonicTimestamp> = const { RefCell::new(MonotonicTimestamp::ZERO) });
}
