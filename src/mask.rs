// mask.rs — Trimap and alpha plane operations.
//
// Label conventions shared by the CPU reference and the GPU kernels:
//
//   Trimap:  0 = definite background, 1 = unknown, 2 = definite foreground.
//   Alpha:   0 = background, 1 = foreground (after thresholding).
//
// The alpha plane is seeded by copying the trimap verbatim, so between
// seeding and the first threshold it may still carry raw trimap values.
// Every consumer that reads alpha before thresholding (the appearance
// model) therefore treats any nonzero value as foreground. After the first
// min-cut solve the plane is normalized to exactly {0, 1}.
//
// The min-cut solver's raw output uses arbitrary nonzero magnitudes for the
// source side (the bundled solver writes 255, matching the NPP graph-cut
// convention the reference engine consumed). `threshold_in_place` maps the
// raw plane to {0, 1} with a strictly-greater-than-1 test; the convergence
// comparison only ever sees thresholded planes.

use crate::image::Image;

/// Trimap label: pixel is definitely background.
pub const TRIMAP_BACKGROUND: u8 = 0;
/// Trimap label: pixel label is unknown, to be decided by the solver.
pub const TRIMAP_UNKNOWN: u8 = 1;
/// Trimap label: pixel is definitely foreground.
pub const TRIMAP_FOREGROUND: u8 = 2;

/// Alpha label after thresholding.
pub const ALPHA_BACKGROUND: u8 = 0;
/// Alpha label after thresholding.
pub const ALPHA_FOREGROUND: u8 = 1;

/// Raw solver output magnitude for the source (foreground) side.
pub const RAW_FOREGROUND: u8 = 255;

/// Normalize a raw solver output plane to {0, 1} in place.
///
/// The label is foreground iff the raw value is strictly greater than 1;
/// anything else (including a raw 1) is background. This single rule is the
/// crate-wide thresholding law; the convergence check depends on both
/// compared planes having passed through it.
pub fn threshold_in_place(plane: &mut Image<u8>) {
    for y in 0..plane.height() {
        for v in plane.row_mut(y) {
            *v = if *v > 1 { ALPHA_FOREGROUND } else { ALPHA_BACKGROUND };
        }
    }
}

/// Seed an alpha plane by copying the trimap verbatim.
///
/// Unknown (1) and foreground (2) both read as nonzero, which is exactly
/// the initial GrabCut labeling: everything not definitely background
/// starts as foreground for the first model fit.
pub fn seed_alpha_from_trimap(alpha: &mut Image<u8>, trimap: &Image<u8>) {
    alpha.copy_from(trimap);
}

/// Pixel-exact comparison of two planes of identical dimensions.
///
/// Used for the convergence check; both inputs must already be
/// thresholded. Strides may differ, padding is ignored.
pub fn planes_equal(a: &Image<u8>, b: &Image<u8>) -> bool {
    assert_eq!(a.width(), b.width(), "planes_equal: width mismatch");
    assert_eq!(a.height(), b.height(), "planes_equal: height mismatch");
    (0..a.height()).all(|y| a.row(y) == b.row(y))
}

/// Nearest-neighbor upsample of a coarse plane into a pre-allocated
/// full-resolution plane. Used to promote the pyramid-seeded alpha to the
/// full working resolution.
pub fn upsample_nearest(coarse: &Image<u8>, full: &mut Image<u8>) {
    let (cw, ch) = (coarse.width(), coarse.height());
    let (fw, fh) = (full.width(), full.height());
    assert!(cw > 0 && ch > 0, "upsample_nearest: empty coarse plane");
    for y in 0..fh {
        let sy = (y * ch / fh).min(ch - 1);
        for x in 0..fw {
            let sx = (x * cw / fw).min(cw - 1);
            full.set(x, y, coarse.get(sx, sy));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_law() {
        // Foreground iff raw value > 1, background otherwise.
        let mut plane = Image::<u8>::from_vec(5, 1, vec![0, 1, 2, 128, 255]);
        threshold_in_place(&mut plane);
        assert_eq!(plane.row(0), &[0, 0, 1, 1, 1]);
    }

    #[test]
    fn test_threshold_skips_padding() {
        let mut plane =
            Image::<u8>::from_vec_with_stride(2, 2, 3, vec![255, 0, 9, 2, 1, 9]);
        threshold_in_place(&mut plane);
        assert_eq!(plane.row(0), &[1, 0]);
        assert_eq!(plane.row(1), &[1, 0]);
        // Padding bytes untouched.
        assert_eq!(plane.as_slice()[2], 9);
        assert_eq!(plane.as_slice()[5], 9);
    }

    #[test]
    fn test_seed_copies_trimap_verbatim() {
        let trimap = Image::<u8>::from_vec(
            3,
            1,
            vec![TRIMAP_BACKGROUND, TRIMAP_UNKNOWN, TRIMAP_FOREGROUND],
        );
        let mut alpha = Image::<u8>::new(3, 1);
        seed_alpha_from_trimap(&mut alpha, &trimap);
        assert_eq!(alpha.row(0), &[0, 1, 2]);
    }

    #[test]
    fn test_planes_equal() {
        let a = Image::<u8>::from_vec(2, 2, vec![0, 1, 1, 0]);
        let b = Image::<u8>::from_vec_with_stride(2, 2, 3, vec![0, 1, 7, 1, 0, 8]);
        assert!(planes_equal(&a, &b));

        let c = Image::<u8>::from_vec(2, 2, vec![0, 1, 1, 1]);
        assert!(!planes_equal(&a, &c));
    }

    #[test]
    fn test_upsample_nearest_preserves_blocks() {
        // 2x2 coarse plane upsampled to 4x4: each coarse pixel covers a
        // 2x2 block.
        let coarse = Image::<u8>::from_vec(2, 2, vec![1, 0, 0, 1]);
        let mut full = Image::<u8>::new(4, 4);
        upsample_nearest(&coarse, &mut full);
        assert_eq!(full.row(0), &[1, 1, 0, 0]);
        assert_eq!(full.row(1), &[1, 1, 0, 0]);
        assert_eq!(full.row(2), &[0, 0, 1, 1]);
        assert_eq!(full.row(3), &[0, 0, 1, 1]);
    }

    #[test]
    fn test_upsample_nearest_non_multiple() {
        // Odd target size: index mapping must stay in bounds.
        let coarse = Image::<u8>::from_vec(2, 1, vec![3, 5]);
        let mut full = Image::<u8>::new(5, 3);
        upsample_nearest(&coarse, &mut full);
        for y in 0..3 {
            for x in 0..5 {
                let expect = if x * 2 / 5 == 0 { 3 } else { 5 };
                assert_eq!(full.get(x, y), expect, "at ({x},{y})");
            }
        }
    }
}
