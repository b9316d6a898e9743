//! Hardware counters that wrap around.

use crate::error::{AcqError, AcqResult};

/// Largest value a counter of `bits` bits can hold. `bits` must be 2..=30.
pub fn max_counter_value(bits: u8) -> AcqResult<u32> {
    check_bits(bits)?;
    Ok((1u32 << bits) - 1)
}

/// Extend a raw reading of a `bits`-wide rolling counter into a monotonic value.
///
/// `previous` is the last unwrapped value and may exceed the counter range;
/// `raw` is the new reading. Assumes the counter advanced by less than one
/// full range between reads.
pub fn unwrap_rolled_counter(bits: u8, previous: u64, raw: u32) -> AcqResult<u64> {
    check_bits(bits)?;
    let range = 1u64 << bits;
    let raw = u64::from(raw);
    if raw >= range {
        return Err(AcqError::InvalidArgument(format!(
            "counter reading {raw} outside range {range}"
        )));
    }
    let base = previous - previous % range;
    let previous_raw = previous % range;
    if raw >= previous_raw {
        Ok(base + raw)
    } else {
        Ok(base + range + raw)
    }
}

fn check_bits(bits: u8) -> AcqResult<()> {
    if (2..=30).contains(&bits) {
        Ok(())
    } else {
        Err(AcqError::InvalidArgument(format!(
            "counter width must be 2..=30 bits, got {bits}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_counter_value() {
        assert_eq!(max_counter_value(8).unwrap(), 255);
        assert!(max_counter_value(1).is_err());
        assert!(max_counter_value(31).is_err());
    }

    #[test]
    fn test_no_rollover() {
        assert_eq!(unwrap_rolled_counter(8, 10, 20).unwrap(), 20);
    }

    #[test]
    fn test_rollover_extends() {
        assert_eq!(unwrap_rolled_counter(8, 250, 3).unwrap(), 259);
    }

    #[test]
    fn test_already_unwrapped_previous() {
        assert_eq!(unwrap_rolled_counter(8, 300, 50).unwrap(), 306);
        assert_eq!(unwrap_rolled_counter(8, 300, 10).unwrap(), 522);
    }

    #[test]
    fn test_reading_out_of_range() {
        assert!(unwrap_rolled_counter(4, 0, 16).is_err());
    }
}
