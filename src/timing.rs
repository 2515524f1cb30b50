//! Bit timing validation and bitrate calculation
//!
//! Timings are checked against the limits a channel reports in BT_CONST
//! (nominal phase) or BT_CONST_EXT (data phase) before anything is sent to
//! the device.

use log::trace;

use crate::error::{CandleError, Result};
use crate::structures::{BitTiming, TimingLimits};

/// Default nominal sample point in percent
pub const DEFAULT_SAMPLE_POINT: f32 = 87.5;
/// Default data phase sample point in percent
pub const DEFAULT_DATA_SAMPLE_POINT: f32 = 75.0;

/// Largest accepted deviation from the requested bitrate
const MAX_BITRATE_ERROR: f64 = 0.005;

fn brp_inc(limits: &TimingLimits) -> u32 {
    limits.brp_inc.max(1)
}

/// Check a timing against device limits
pub fn validate(timing: &BitTiming, limits: &TimingLimits) -> Result<()> {
    if timing.brp < limits.brp_min || timing.brp > limits.brp_max {
        return Err(CandleError::invalid_parameter(
            "brp",
            timing.brp,
            format!("must be in {}..={}", limits.brp_min, limits.brp_max),
        ));
    }
    if timing.brp % brp_inc(limits) != 0 {
        return Err(CandleError::invalid_parameter(
            "brp",
            timing.brp,
            format!("must be a multiple of {}", limits.brp_inc),
        ));
    }

    if timing.phase_seg1 < 1 {
        return Err(CandleError::invalid_parameter(
            "phase_seg1",
            timing.phase_seg1,
            "must be at least 1",
        ));
    }
    let tseg1 = u64::from(timing.prop_seg) + u64::from(timing.phase_seg1);
    if tseg1 < u64::from(limits.tseg1_min) || tseg1 > u64::from(limits.tseg1_max) {
        return Err(CandleError::invalid_parameter(
            "tseg1",
            tseg1,
            format!(
                "prop_seg + phase_seg1 must be in {}..={}",
                limits.tseg1_min, limits.tseg1_max
            ),
        ));
    }

    if timing.phase_seg2 < limits.tseg2_min || timing.phase_seg2 > limits.tseg2_max {
        return Err(CandleError::invalid_parameter(
            "phase_seg2",
            timing.phase_seg2,
            format!("must be in {}..={}", limits.tseg2_min, limits.tseg2_max),
        ));
    }

    let sjw_max = limits.sjw_max.min(timing.phase_seg2);
    if timing.sjw < 1 || timing.sjw > sjw_max {
        return Err(CandleError::invalid_parameter(
            "sjw",
            timing.sjw,
            format!("must be in 1..={}", sjw_max),
        ));
    }

    Ok(())
}

/// Search for a timing producing `bitrate` at `sample_point` percent
///
/// Candidates follow the `prop_seg = 1`, `sjw = 1` convention. An exact
/// bitrate wins over a closer sample point, which wins over more time
/// quanta per bit. Fails with `InvalidParameter` when no candidate is
/// within 0.5% of the requested bitrate.
pub fn calc_bit_timing(
    bitrate: u32,
    sample_point: f32,
    clock_hz: u32,
    limits: &TimingLimits,
) -> Result<BitTiming> {
    if bitrate == 0 {
        return Err(CandleError::invalid_parameter(
            "bitrate",
            0u32,
            "must be greater than zero",
        ));
    }
    if !(sample_point > 0.0 && sample_point < 100.0) {
        return Err(CandleError::invalid_parameter(
            "sample_point",
            sample_point as u64,
            "must be between 0 and 100 percent",
        ));
    }

    // prop_seg = 1 and phase_seg1 >= 1
    let tseg1_min = limits.tseg1_min.max(2);
    let tseg2_min = limits.tseg2_min.max(1);
    if tseg1_min > limits.tseg1_max || tseg2_min > limits.tseg2_max {
        return Err(no_match(bitrate, clock_hz));
    }
    let tq_min = 1 + tseg1_min + tseg2_min;
    let tq_max = 1 + limits.tseg1_max + limits.tseg2_max;
    let sp = f64::from(sample_point) / 100.0;
    let inc = brp_inc(limits);

    // (bitrate error in Hz, sample point error, timing)
    let mut best: Option<(u64, f64, BitTiming)> = None;

    for tq in (tq_min..=tq_max).rev() {
        let bit_clock = u64::from(bitrate) * u64::from(tq);
        let raw_brp = (u64::from(clock_hz) + bit_clock / 2) / bit_clock;
        let brp = (raw_brp + u64::from(inc) / 2) / u64::from(inc) * u64::from(inc);
        if brp < u64::from(limits.brp_min) || brp > u64::from(limits.brp_max) || brp == 0 {
            continue;
        }

        let mut tseg2 = tq - (f64::from(tq) * sp).round() as u32;
        tseg2 = tseg2.clamp(tseg2_min, limits.tseg2_max);
        // tseg2 can swallow the whole bit at very low sample points
        let Some(mut tseg1) = tq.checked_sub(1 + tseg2) else {
            continue;
        };
        if tseg1 > limits.tseg1_max {
            tseg1 = limits.tseg1_max;
            tseg2 = tq - 1 - tseg1;
        } else if tseg1 < tseg1_min {
            tseg1 = tseg1_min;
            tseg2 = tq - 1 - tseg1;
        }
        if tseg2 < tseg2_min || tseg2 > limits.tseg2_max {
            continue;
        }

        let actual = u64::from(clock_hz) / (brp * u64::from(tq));
        let rate_err = actual.abs_diff(u64::from(bitrate));
        if rate_err as f64 > f64::from(bitrate) * MAX_BITRATE_ERROR {
            continue;
        }
        let sp_err = ((f64::from(tq - tseg2) / f64::from(tq)) - sp).abs();

        let timing = BitTiming::new(1, tseg1 - 1, tseg2, 1, brp as u32);
        let better = match &best {
            None => true,
            Some((best_rate, best_sp, _)) => {
                rate_err < *best_rate || (rate_err == *best_rate && sp_err < *best_sp)
            }
        };
        if better {
            best = Some((rate_err, sp_err, timing));
        }
    }

    match best {
        Some((_, _, timing)) => {
            trace!(
                "{} bit/s @ {} Hz -> brp {} tq {} sp {:.1}%",
                bitrate,
                clock_hz,
                timing.brp,
                timing.time_quanta(),
                timing.sample_point()
            );
            Ok(timing)
        }
        None => Err(no_match(bitrate, clock_hz)),
    }
}

fn no_match(bitrate: u32, clock_hz: u32) -> CandleError {
    CandleError::invalid_parameter(
        "bitrate",
        bitrate,
        format!("no bit timing within 0.5% at {} Hz", clock_hz),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// candleLight (STM32F072) limits
    fn stm32_limits() -> TimingLimits {
        TimingLimits {
            tseg1_min: 1,
            tseg1_max: 16,
            tseg2_min: 1,
            tseg2_max: 8,
            sjw_max: 4,
            brp_min: 1,
            brp_max: 1024,
            brp_inc: 1,
        }
    }

    #[test]
    fn test_validate_accepts_in_range() {
        let timing = BitTiming::new(1, 12, 2, 1, 6);
        assert!(validate(&timing, &stm32_limits()).is_ok());
    }

    #[test]
    fn test_validate_rejects_each_field() {
        let limits = stm32_limits();
        let cases = [
            (BitTiming::new(1, 12, 2, 1, 0), "brp"),
            (BitTiming::new(1, 12, 2, 1, 2000), "brp"),
            (BitTiming::new(1, 0, 2, 1, 6), "phase_seg1"),
            (BitTiming::new(10, 12, 2, 1, 6), "tseg1"),
            (BitTiming::new(1, 12, 9, 1, 6), "phase_seg2"),
            (BitTiming::new(1, 12, 2, 0, 6), "sjw"),
            (BitTiming::new(1, 12, 2, 3, 6), "sjw"),
        ];
        for (timing, field) in cases {
            match validate(&timing, &limits) {
                Err(CandleError::InvalidParameter { name, .. }) => assert_eq!(name, field),
                other => panic!("{:?} -> {:?}", timing, other),
            }
        }
    }

    #[test]
    fn test_validate_brp_increment() {
        let limits = TimingLimits {
            brp_inc: 2,
            ..stm32_limits()
        };
        assert!(validate(&BitTiming::new(1, 12, 2, 1, 5), &limits).is_err());
        assert!(validate(&BitTiming::new(1, 12, 2, 1, 6), &limits).is_ok());
    }

    #[test]
    fn test_calc_48mhz_500k() {
        let timing = calc_bit_timing(500_000, 87.5, 48_000_000, &stm32_limits()).unwrap();
        assert_eq!(timing, BitTiming::new(1, 12, 2, 1, 6));
        assert_eq!(timing.bitrate(48_000_000), 500_000);
    }

    #[test]
    fn test_calc_common_bitrates_are_valid() {
        let limits = stm32_limits();
        for bitrate in [
            10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 1_000_000,
        ] {
            let timing = calc_bit_timing(bitrate, 87.5, 48_000_000, &limits).unwrap();
            assert!(validate(&timing, &limits).is_ok(), "{}", bitrate);
            assert_eq!(timing.bitrate(48_000_000), bitrate);
        }
    }

    #[test]
    fn test_calc_low_sample_point_clamps_tseg2() {
        let limits = stm32_limits();
        for sample_point in [1.0, 5.0, 10.0] {
            let timing = calc_bit_timing(1_000_000, sample_point, 48_000_000, &limits).unwrap();
            assert!(validate(&timing, &limits).is_ok());
            assert_eq!(timing.phase_seg2, limits.tseg2_max);
            assert_eq!(timing.bitrate(48_000_000), 1_000_000);
        }
    }

    #[test]
    fn test_calc_rejects_unreachable() {
        let limits = TimingLimits {
            brp_max: 4,
            ..stm32_limits()
        };
        assert!(matches!(
            calc_bit_timing(10_000, 87.5, 48_000_000, &limits),
            Err(CandleError::InvalidParameter { name: "bitrate", .. })
        ));
        assert!(calc_bit_timing(0, 87.5, 48_000_000, &limits).is_err());
    }
}
