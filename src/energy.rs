// energy.rs — Terminal capacities and pairwise edge cues.
//
// The min-cut solver sees the segmentation energy as two inputs:
//
//   data term   per-pixel terminal capacity, positive pulls the pixel to
//               the source (foreground) side, negative to the sink.
//   edge cues   per-neighbor-pair capacities discouraging cuts across
//               similar colors.
//
// All capacities are quantized to i32 with a shared scale so the CPU and
// GPU builders produce identical planes. Trimap-definite pixels are locked
// with a terminal magnitude no pairwise sum can overcome.
//
// Edge-cue layout matches what the solver consumes: the vertical and
// diagonal planes are row-major at image dimensions; the horizontal
// (left/right) planes are stored transposed, height x width, so a column
// walk on the original image is a row walk on the plane. Each directional
// plane holds the capacity from a pixel toward that neighbor, zero where
// the neighbor falls outside the frame; opposing planes mirror each other
// since the weights are symmetric.

use crate::image::{Image, Rgba8};
use crate::mask::{TRIMAP_BACKGROUND, TRIMAP_FOREGROUND};
use crate::model::AppearanceModel;

/// Pairwise weight multiplier (the GrabCut gamma).
pub const EDGE_STRENGTH: f32 = 50.0;

/// Fixed-point scale applied to both terminal and pairwise capacities
/// before rounding to i32.
pub const CAPACITY_SCALE: f32 = 64.0;

/// Terminal magnitude for trimap-definite pixels. Large enough that no
/// pairwise sum can flip a locked pixel, small enough that summing a few
/// of them cannot overflow i32.
pub const TERMINAL_LOCK: i32 = i32::MAX / 8;

/// Unknown-pixel terminal capacities are clamped here, well below the lock.
pub const DATA_TERM_CLAMP: i32 = 1 << 20;

const FRAC_1_SQRT_2: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Grid connectivity for the pairwise term.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Neighborhood {
    Four,
    Eight,
}

/// Contrast sensitivity: beta = 1 / (2 <||dc||^2>) over all neighbor pairs
/// of the chosen connectivity. A flat image has zero mean difference; beta
/// is zero then and every pairwise weight collapses to the full strength.
pub fn compute_beta(image: &Image<Rgba8>, neighborhood: Neighborhood) -> f32 {
    let (w, h) = (image.width(), image.height());
    let mut sum = 0.0f64;
    let mut pairs = 0u64;
    for y in 0..h {
        for x in 0..w {
            let c = image.get(x, y);
            if x + 1 < w {
                sum += c.dist_sq(image.get(x + 1, y)) as f64;
                pairs += 1;
            }
            if y + 1 < h {
                sum += c.dist_sq(image.get(x, y + 1)) as f64;
                pairs += 1;
            }
            if neighborhood == Neighborhood::Eight && y + 1 < h {
                if x + 1 < w {
                    sum += c.dist_sq(image.get(x + 1, y + 1)) as f64;
                    pairs += 1;
                }
                if x > 0 {
                    sum += c.dist_sq(image.get(x - 1, y + 1)) as f64;
                    pairs += 1;
                }
            }
        }
    }
    if pairs == 0 || sum <= 0.0 {
        return 0.0;
    }
    (1.0 / (2.0 * sum / pairs as f64)) as f32
}

/// Terminal capacity plane: +lock / -lock for trimap-definite pixels, the
/// scaled log-likelihood ratio (foreground minus background) for unknowns.
pub fn data_term(
    model: &dyn AppearanceModel,
    image: &Image<Rgba8>,
    trimap: &Image<u8>,
) -> Image<i32> {
    assert_eq!(image.width(), trimap.width());
    assert_eq!(image.height(), trimap.height());
    let mut terminals = Image::<i32>::new(image.width(), image.height());
    for (x, y, px) in image.pixels() {
        let cap = match trimap.get(x, y) {
            TRIMAP_FOREGROUND => TERMINAL_LOCK,
            TRIMAP_BACKGROUND => -TERMINAL_LOCK,
            _ => {
                let (fg, bg) = model.log_likelihoods(px);
                let scaled = ((fg - bg) * CAPACITY_SCALE).round();
                (scaled as i32).clamp(-DATA_TERM_CLAMP, DATA_TERM_CLAMP)
            }
        };
        terminals.set(x, y, cap);
    }
    terminals
}

/// The eight directional capacity planes consumed by the solver.
///
/// Vertical and diagonal planes are width x height; `left_t` / `right_t`
/// are transposed (height x width), indexed as `(y, x)`.
pub struct EdgeCues {
    pub top: Image<i32>,
    pub bottom: Image<i32>,
    pub topleft: Image<i32>,
    pub topright: Image<i32>,
    pub bottomleft: Image<i32>,
    pub bottomright: Image<i32>,
    pub left_t: Image<i32>,
    pub right_t: Image<i32>,
    pub neighborhood: Neighborhood,
}

/// Build every directional plane from the image contrast. Pure function of
/// (image, strength, connectivity); the controller recomputes it per
/// iteration rather than caching.
pub fn edge_cues(
    image: &Image<Rgba8>,
    edge_strength: f32,
    neighborhood: Neighborhood,
) -> EdgeCues {
    let (w, h) = (image.width(), image.height());
    let beta = compute_beta(image, neighborhood);
    let weight = |a: Rgba8, b: Rgba8, diag: bool| -> i32 {
        let mut v = edge_strength * (-beta * a.dist_sq(b)).exp();
        if diag {
            v *= FRAC_1_SQRT_2;
        }
        (v * CAPACITY_SCALE).round() as i32
    };

    let mut cues = EdgeCues {
        top: Image::new(w, h),
        bottom: Image::new(w, h),
        topleft: Image::new(w, h),
        topright: Image::new(w, h),
        bottomleft: Image::new(w, h),
        bottomright: Image::new(w, h),
        left_t: Image::new(h, w),
        right_t: Image::new(h, w),
        neighborhood,
    };

    for y in 0..h {
        for x in 0..w {
            let c = image.get(x, y);
            if x + 1 < w {
                let v = weight(c, image.get(x + 1, y), false);
                cues.right_t.set(y, x, v);
                cues.left_t.set(y, x + 1, v);
            }
            if y + 1 < h {
                let v = weight(c, image.get(x, y + 1), false);
                cues.bottom.set(x, y, v);
                cues.top.set(x, y + 1, v);
            }
            if neighborhood == Neighborhood::Eight && y + 1 < h {
                if x + 1 < w {
                    let v = weight(c, image.get(x + 1, y + 1), true);
                    cues.bottomright.set(x, y, v);
                    cues.topleft.set(x + 1, y + 1, v);
                }
                if x > 0 {
                    let v = weight(c, image.get(x - 1, y + 1), true);
                    cues.bottomleft.set(x, y, v);
                    cues.topright.set(x - 1, y + 1, v);
                }
            }
        }
    }
    cues
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
