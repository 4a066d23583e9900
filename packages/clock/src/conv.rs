//! Conversions between monotonic timestamps and the 32-bit microsecond
//! values the uTP wire format carries.
use std::time::Duration;

use crate::MonotonicTimestamp;

/// Truncates a timestamp to the 32-bit microsecond counter used on the
/// wire. The counter wraps roughly every 71 minutes, which is fine for
/// one-way-delay arithmetic as long as both sides wrap the same way.
#[must_use]
pub fn timestamp_to_wire_micros(timestamp: MonotonicTimestamp) -> u32 {
    u32::try_from(timestamp.as_micros() & u128::from(u32::MAX)).expect("masked to 32 bits")
}

/// Interprets a wire microsecond value as a duration.
#[must_use]
pub fn wire_micros_to_duration(micros: u32) -> Duration {
    Duration::from_micros(u64::from(micros))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{timestamp_to_wire_micros, wire_micros_to_duration};

    #[test]
    fn it_should_truncate_timestamps_to_32_bits() {
        assert_eq!(timestamp_to_wire_micros(Duration::from_micros(1)), 1);
        assert_eq!(
            timestamp_to_wire_micros(Duration::from_micros(u64::from(u32::MAX) + 7)),
            6
        );
    }

    #[test]
    fn it_should_round_trip_wire_values_below_the_wrap_point() {
        let micros = 123_456_789;
        assert_eq!(
            timestamp_to_wire_micros(wire_micros_to_duration(micros)),
            micros
        );
    }
}
