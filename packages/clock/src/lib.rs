//! Time related functions and types.
//!
//! It's usually a good idea to control where the time comes from
//! in an application so that it can be mocked for testing and it can be
//! controlled in production so we get the intended behavior without
//! relying on the specific time zone for the underlying system.
//!
//! Clocks use the type [`MonotonicTimestamp`], a `std::time::Duration`
//! measured from an arbitrary fixed epoch (the instant the process
//! started for the working clock). The timestamp never goes backwards,
//! which is what round-trip-time estimation and retransmission timers
//! need. It is not related to the wall clock or any time zone.

pub mod clock;
pub mod conv;

#[macro_use]
extern crate lazy_static;

use std::time::Duration;

/// A point in time measured from the clock's fixed epoch.
pub type MonotonicTimestamp = Duration;

/// This code needs to be copied into each crate.
/// Working version, for production.
#[cfg(not(test))]
#[allow(dead_code)]
pub(crate) type CurrentClock = clock::Working;

/// Stopped version, for testing.
#[cfg(test)]
#[allow(dead_code)]
pub(crate) type CurrentClock = clock::Stopped;
