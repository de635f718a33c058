// check.rs — CPU reference consistency check and shared input validation.
//
// The GPU kernel is validated against this path pixel-for-pixel: for small
// fixed inputs the two must produce byte-identical outputs. The semantics,
// shared with src/shaders/consistency_check.wgsl:
//
//   For a left pixel (x, y) with disparity d = L(x, y), the matching sample
//   in the right map sits d columns to the left: R(x - d, y). The lookup
//   column is clamped to the row, so a disparity pointing outside the image
//   compares against the edge sample instead of reading out of bounds. If
//   |L - R| exceeds the tolerance, the pixel is written as the configured
//   invalid-disparity sentinel; otherwise the input value is copied through.
//   The right map is checked symmetrically with lookup column x + d.

use crate::error::Error;
use crate::image::DisparityImage;

/// Sentinel written for inconsistent pixels unless overridden.
pub const DEFAULT_INVALID_DISPARITY: u16 = 0;

/// Check that all four maps agree on geometry.
///
/// Each map is compared against `left_in`; the first disagreement fails with
/// [`Error::DimensionMismatch`] naming both operands. The element type is
/// fixed to u16 by construction, so only width and height are checked. Both
/// the CPU path and the GPU engine call this before touching any pixel or
/// device buffer.
pub fn validate_dimensions(
    left_in: &DisparityImage,
    right_in: &DisparityImage,
    left_out: &DisparityImage,
    right_out: &DisparityImage,
) -> Result<(), Error> {
    let reference = (left_in.width(), left_in.height());
    let others = [
        ("right_in", right_in),
        ("left_out", left_out),
        ("right_out", right_out),
    ];
    for (name, img) in others {
        if (img.width(), img.height()) != reference {
            return Err(Error::DimensionMismatch {
                first: "left_in",
                first_width: reference.0,
                first_height: reference.1,
                second: name,
                second_width: img.width(),
                second_height: img.height(),
            });
        }
    }
    Ok(())
}

/// Sequential, pixel-accurate implementation of the consistency check.
///
/// No device interaction; used to prove device/host parity in tests and as
/// a fallback when no compute device is available.
#[derive(Debug, Clone, Copy)]
pub struct CpuConsistencyCheck {
    tolerance: u16,
    invalid_value: u16,
}

impl CpuConsistencyCheck {
    pub fn new(tolerance: u16) -> Self {
        CpuConsistencyCheck {
            tolerance,
            invalid_value: DEFAULT_INVALID_DISPARITY,
        }
    }

    /// Override the sentinel written for inconsistent pixels.
    pub fn with_invalid_value(mut self, invalid_value: u16) -> Self {
        self.invalid_value = invalid_value;
        self
    }

    pub fn tolerance(&self) -> u16 {
        self.tolerance
    }

    pub fn set_tolerance(&mut self, tolerance: u16) {
        self.tolerance = tolerance;
    }

    /// Run the check over the full pixel range.
    ///
    /// Fails with [`Error::DimensionMismatch`] before writing anything if
    /// the four maps disagree on geometry.
    pub fn run(
        &self,
        left_in: &DisparityImage,
        right_in: &DisparityImage,
        left_out: &mut DisparityImage,
        right_out: &mut DisparityImage,
    ) -> Result<(), Error> {
        validate_dimensions(left_in, right_in, left_out, right_out)?;

        let width = left_in.width();
        let height = left_in.height();
        if width == 0 || height == 0 {
            return Ok(());
        }

        for y in 0..height {
            for x in 0..width {
                let d_left = left_in.get(x, y);
                let lookup = clamp_column(x as i64 - d_left as i64, width);
                let matched = right_in.get(lookup, y);
                left_out.set(x, y, self.resolve(d_left, matched));

                let d_right = right_in.get(x, y);
                let lookup = clamp_column(x as i64 + d_right as i64, width);
                let matched = left_in.get(lookup, y);
                right_out.set(x, y, self.resolve(d_right, matched));
            }
        }
        Ok(())
    }

    #[inline]
    fn resolve(&self, disparity: u16, matched: u16) -> u16 {
        if disparity.abs_diff(matched) > self.tolerance {
            self.invalid_value
        } else {
            disparity
        }
    }
}

#[inline]
fn clamp_column(x: i64, width: usize) -> usize {
    x.clamp(0, width as i64 - 1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(
        check: &CpuConsistencyCheck,
        left_in: &DisparityImage,
        right_in: &DisparityImage,
    ) -> (DisparityImage, DisparityImage) {
        let mut left_out = DisparityImage::new(left_in.width(), left_in.height());
        let mut right_out = DisparityImage::new(left_in.width(), left_in.height());
        check
            .run(left_in, right_in, &mut left_out, &mut right_out)
            .expect("valid inputs");
        (left_out, right_out)
    }

    #[test]
    fn test_dimension_mismatch_names_offender() {
        let left_in = DisparityImage::new(4, 4);
        let right_in = DisparityImage::new(4, 4);
        let mut left_out = DisparityImage::new(4, 4);
        let mut right_out = DisparityImage::new(4, 3);
        let err = CpuConsistencyCheck::new(0)
            .run(&left_in, &right_in, &mut left_out, &mut right_out)
            .unwrap_err();
        match err {
            Error::DimensionMismatch { first, second, .. } => {
                assert_eq!(first, "left_in");
                assert_eq!(second, "right_out");
            }
            other => panic!("expected DimensionMismatch, got {other}"),
        }
    }

    #[test]
    fn test_mismatch_leaves_outputs_untouched() {
        let left_in = DisparityImage::filled(3, 3, 7);
        let right_in = DisparityImage::filled(3, 2, 7);
        let mut left_out = DisparityImage::filled(3, 3, 999);
        let mut right_out = DisparityImage::filled(3, 3, 999);
        let result = CpuConsistencyCheck::new(0).run(
            &left_in,
            &right_in,
            &mut left_out,
            &mut right_out,
        );
        assert!(result.is_err());
        assert!(left_out.pixels().all(|(_, _, v)| v == 999));
        assert!(right_out.pixels().all(|(_, _, v)| v == 999));
    }

    #[test]
    fn test_constant_maps_flagged_when_over_tolerance() {
        // left = 10, right = 12: every lookup lands on a constant sample, so
        // the per-pixel difference is 2 regardless of the clamped column.
        let left_in = DisparityImage::filled(2, 2, 10);
        let right_in = DisparityImage::filled(2, 2, 12);
        let check = CpuConsistencyCheck::new(1);
        let (left_out, right_out) = run(&check, &left_in, &right_in);
        assert!(left_out.pixels().all(|(_, _, v)| v == DEFAULT_INVALID_DISPARITY));
        assert!(right_out.pixels().all(|(_, _, v)| v == DEFAULT_INVALID_DISPARITY));
    }

    #[test]
    fn test_constant_maps_pass_within_tolerance() {
        let left_in = DisparityImage::filled(2, 2, 10);
        let right_in = DisparityImage::filled(2, 2, 12);
        let check = CpuConsistencyCheck::new(5);
        let (left_out, right_out) = run(&check, &left_in, &right_in);
        // Consistent pixels copy the input value through.
        assert!(left_out.pixels().all(|(_, _, v)| v == 10));
        assert!(right_out.pixels().all(|(_, _, v)| v == 12));
    }

    #[test]
    fn test_custom_invalid_value() {
        let left_in = DisparityImage::filled(2, 1, 100);
        let right_in = DisparityImage::filled(2, 1, 0);
        let check = CpuConsistencyCheck::new(0).with_invalid_value(0xFFFF);
        let (left_out, _) = run(&check, &left_in, &right_in);
        assert!(left_out.pixels().all(|(_, _, v)| v == 0xFFFF));
    }

    #[test]
    fn test_lookup_column_is_clamped() {
        // Width 4, left disparity 2 at x = 1: the lookup column 1 - 2 = -1
        // clamps to 0, so the pixel compares against right(0, 0).
        let left_in = DisparityImage::from_vec(4, 1, vec![0, 2, 0, 0]);
        let right_in = DisparityImage::from_vec(4, 1, vec![2, 9, 9, 9]);
        let check = CpuConsistencyCheck::new(0);
        let (left_out, _) = run(&check, &left_in, &right_in);
        // |2 - right(0)| = |2 - 2| = 0 <= 0: consistent.
        assert_eq!(left_out.get(1, 0), 2);
    }

    #[test]
    fn test_exact_lookup_position() {
        // Left pixel (3, 0) with disparity 2 must compare against right
        // column 1, not its own column.
        let left_in = DisparityImage::from_vec(4, 1, vec![0, 0, 0, 2]);
        let right_in = DisparityImage::from_vec(4, 1, vec![7, 2, 7, 7]);
        let check = CpuConsistencyCheck::new(0);
        let (left_out, _) = run(&check, &left_in, &right_in);
        assert_eq!(left_out.get(3, 0), 2);
    }

    #[test]
    fn test_right_map_looks_up_to_the_right() {
        // Right pixel (0, 0) with disparity 2 compares against left column 2.
        let left_in = DisparityImage::from_vec(4, 1, vec![9, 9, 2, 9]);
        let right_in = DisparityImage::from_vec(4, 1, vec![2, 0, 0, 0]);
        let check = CpuConsistencyCheck::new(0);
        let (_, right_out) = run(&check, &left_in, &right_in);
        assert_eq!(right_out.get(0, 0), 2);
    }

    #[test]
    fn test_empty_image_is_a_no_op() {
        let left_in = DisparityImage::new(0, 0);
        let right_in = DisparityImage::new(0, 0);
        let mut left_out = DisparityImage::new(0, 0);
        let mut right_out = DisparityImage::new(0, 0);
        CpuConsistencyCheck::new(3)
            .run(&left_in, &right_in, &mut left_out, &mut right_out)
            .expect("empty geometry is valid");
    }

    #[test]
    fn test_tolerance_is_inclusive() {
        // Difference exactly equal to the tolerance is consistent.
        let left_in = DisparityImage::filled(1, 1, 10);
        let right_in = DisparityImage::filled(1, 1, 13);
        let check = CpuConsistencyCheck::new(3);
        let (left_out, _) = run(&check, &left_in, &right_in);
        assert_eq!(left_out.get(0, 0), 10);
    }
}
