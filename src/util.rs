const FLOAT_TO_INT_MAX: f64 = 9007199254740991_f64;

/// Converting float to int has undefined behaviour for huge floats: https://stackoverflow.com/a/41139453.
/// To avoid this, refuse to convert floats with magnitude greater than 2**53 - 1, after which 64-bit floats no longer
/// retain integer precision.
pub(crate) fn f64_to_i64_safe(f: f64) -> Option<i64> {
    if f.abs() <= FLOAT_TO_INT_MAX {
        Some(f as i64)
    } else {
        None
    }
}

/// Renders a number the way the settings payload and every other SDK render it: integral values
/// have no fractional part (`5.0` becomes `"5"`).
#[allow(clippy::float_cmp)]
pub(crate) fn format_number(f: f64) -> String {
    match f64_to_i64_safe(f) {
        Some(i) if i as f64 == f => i.to_string(),
        _ => f.to_string(),
    }
}

/// Ceiling of `weight * 100`, the number of bucket units a percentage weight occupies.
pub(crate) fn weight_to_units(weight: f64) -> u32 {
    if !weight.is_finite() || weight <= 0.0 {
        return 0;
    }
    (weight * 100.0).ceil().min(u32::MAX as f64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(5.0, "5")]
    #[test_case(-3.0, "-3")]
    #[test_case(5.5, "5.5")]
    #[test_case(0.25, "0.25")]
    fn numbers_format_without_trailing_zero(f: f64, expected: &str) {
        assert_eq!(format_number(f), expected);
    }

    #[test]
    fn weights_round_up_to_units() {
        assert_eq!(weight_to_units(0.0), 0);
        assert_eq!(weight_to_units(-1.0), 0);
        assert_eq!(weight_to_units(33.333), 3334);
        assert_eq!(weight_to_units(50.0), 5000);
        assert_eq!(weight_to_units(f64::NAN), 0);
    }
}
