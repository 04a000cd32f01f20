//! Centralized nodata mask helper.
//!
//! Every fill and coverage computation goes through [`is_nodata`]; nothing
//! else compares raster values against a nodata sentinel. NaN sentinels
//! require `is_nan`, not equality, which is exactly the comparison this
//! helper exists to get right once.

/// True when `value` matches the nodata sentinel.
///
/// With no sentinel nothing is masked. A NaN sentinel masks NaN cells; any
/// other sentinel masks by f32 equality after narrowing.
#[inline]
pub fn is_nodata(value: f32, nodata: Option<f64>) -> bool {
    match nodata {
        None => false,
        Some(sentinel) if sentinel.is_nan() => value.is_nan(),
        Some(sentinel) => value == sentinel as f32,
    }
}

/// Count masked cells in a band.
pub fn count_nodata(data: &[f32], nodata: Option<f64>) -> usize {
    match nodata {
        None => 0,
        Some(sentinel) if sentinel.is_nan() => data.iter().filter(|v| v.is_nan()).count(),
        Some(sentinel) => {
            let sentinel = sentinel as f32;
            data.iter().filter(|&&v| v == sentinel).count()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_sentinel_masks_nothing() {
        assert!(!is_nodata(0.0, None));
        assert!(!is_nodata(f32::NAN, None));
        assert_eq!(count_nodata(&[1.0, f32::NAN, 3.0], None), 0);
    }

    #[test]
    fn test_nan_sentinel_uses_nan_test() {
        assert!(is_nodata(f32::NAN, Some(f64::NAN)));
        assert!(!is_nodata(0.0, Some(f64::NAN)));
        assert_eq!(count_nodata(&[1.0, f32::NAN, f32::NAN], Some(f64::NAN)), 2);
    }

    #[test]
    fn test_value_sentinel_uses_equality() {
        assert!(is_nodata(-32768.0, Some(-32768.0)));
        assert!(!is_nodata(-32767.0, Some(-32768.0)));
        assert_eq!(count_nodata(&[-32768.0, 1.0, -32768.0], Some(-32768.0)), 2);
    }
}
