// pyramid.rs — Coarse-to-fine resolution chain.
//
// The refinement controller solves GrabCut at a reduced resolution first:
// the min-cut and model-fit cost scale with pixel count, so a coarse solve
// reaches a structurally similar labeling far cheaper, and the
// full-resolution phase then starts near its fixed point.
//
// The chain repeatedly halves width and height (ceiling division) until
// both are at or below a target maximum dimension. Only the coarsest level
// is kept: intermediate levels ping-pong between two buffers and the stale
// one is dropped at every step, so the full chain is never materialized.
//
// The coarse *image* is built once (at construction and after each
// update_image). The coarse *trimap* is regenerated from the current
// full-resolution trimap on every seeded solve, reapplying the identical
// halving schedule, because the trimap may change between calls while the
// image does not.

use crate::image::{Image, Rgba8};
use crate::mask::TRIMAP_UNKNOWN;

/// Default divisor for the coarse target dimension: the chain stops once
/// both dimensions are at or below `max(width, height) / 4`.
pub const COARSE_DIM_DIVISOR: usize = 4;

/// The halving schedule for a full-resolution size: the (width, height) of
/// every level produced on the way down, finest first, ending at the first
/// level with both dimensions <= `max_dim`.
///
/// At least one halving step is always taken (the reference engine seeds
/// from a reduced image even when the input is already small).
pub fn halving_schedule(width: usize, height: usize, max_dim: usize) -> Vec<(usize, usize)> {
    assert!(width > 0 && height > 0, "halving_schedule: empty input");
    assert!(max_dim > 0, "halving_schedule: max_dim must be positive");
    let mut levels = Vec::new();
    let (mut w, mut h) = (width.div_ceil(2), height.div_ceil(2));
    levels.push((w, h));
    while w > max_dim || h > max_dim {
        w = w.div_ceil(2);
        h = h.div_ceil(2);
        levels.push((w, h));
    }
    levels
}

/// Downscale a color frame by 2x (ceiling dimensions): each output pixel is
/// the average of the up-to-2x2 source block it covers, channel-wise.
pub fn downscale_rgba(src: &Image<Rgba8>, dst_w: usize, dst_h: usize) -> Image<Rgba8> {
    debug_assert_eq!(dst_w, src.width().div_ceil(2));
    debug_assert_eq!(dst_h, src.height().div_ceil(2));
    let mut dst = Image::new(dst_w, dst_h);
    for y in 0..dst_h {
        for x in 0..dst_w {
            let mut acc = [0u32; 4];
            let mut n = 0u32;
            for dy in 0..2 {
                for dx in 0..2 {
                    let sx = 2 * x + dx;
                    let sy = 2 * y + dy;
                    if sx < src.width() && sy < src.height() {
                        let px = src.get(sx, sy);
                        for c in 0..4 {
                            acc[c] += px.0[c] as u32;
                        }
                        n += 1;
                    }
                }
            }
            let mut out = [0u8; 4];
            for c in 0..4 {
                out[c] = ((acc[c] + n / 2) / n) as u8;
            }
            dst.set(x, y, Rgba8(out));
        }
    }
    dst
}

/// Downscale a trimap by 2x (ceiling dimensions).
///
/// A coarse pixel keeps a definite label only when every contributing
/// source pixel carries that same definite label; any disagreement, or any
/// unknown contributor, yields unknown. This never invents a definite hint
/// the caller did not supply, so the coarse solve cannot lock a pixel the
/// full-resolution trimap left open.
pub fn downscale_trimap(src: &Image<u8>, dst_w: usize, dst_h: usize) -> Image<u8> {
    debug_assert_eq!(dst_w, src.width().div_ceil(2));
    debug_assert_eq!(dst_h, src.height().div_ceil(2));
    let mut dst = Image::new(dst_w, dst_h);
    for y in 0..dst_h {
        for x in 0..dst_w {
            let mut label = None;
            let mut agree = true;
            for dy in 0..2 {
                for dx in 0..2 {
                    let sx = 2 * x + dx;
                    let sy = 2 * y + dy;
                    if sx < src.width() && sy < src.height() {
                        let v = src.get(sx, sy);
                        match label {
                            None => label = Some(v),
                            Some(prev) if prev != v => agree = false,
                            _ => {}
                        }
                    }
                }
            }
            let out = match label {
                Some(v) if agree => v,
                _ => TRIMAP_UNKNOWN,
            };
            dst.set(x, y, out);
        }
    }
    dst
}

// ---------------------------------------------------------------------------
// CoarseChain
// ---------------------------------------------------------------------------

/// The surviving coarsest level of the image chain, plus the halving
/// schedule needed to regenerate a matching coarse trimap on demand.
pub struct CoarseChain {
    schedule: Vec<(usize, usize)>,
    image: Image<Rgba8>,
}

impl CoarseChain {
    /// Build the chain for a full-resolution frame.
    ///
    /// Intermediate levels alternate between two slots; at every step the
    /// stale slot is replaced, so at most two levels are live at a time and
    /// only the coarsest survives in the returned chain.
    pub fn build(image: &Image<Rgba8>, max_dim: usize) -> Self {
        let schedule = halving_schedule(image.width(), image.height(), max_dim);
        let (w0, h0) = schedule[0];
        let mut current = downscale_rgba(image, w0, h0);
        for &(w, h) in &schedule[1..] {
            // The previous level is moved out and dropped after the step,
            // mirroring the device-side ping-pong free.
            let prev = std::mem::replace(&mut current, Image::new(1, 1));
            current = downscale_rgba(&prev, w, h);
        }
        CoarseChain {
            schedule,
            image: current,
        }
    }

    /// Regenerate the coarse trimap from the current full-resolution
    /// trimap, reapplying the image chain's halving schedule so both coarse
    /// planes land at identical dimensions.
    pub fn coarse_trimap(&self, trimap: &Image<u8>) -> Image<u8> {
        let (w0, h0) = self.schedule[0];
        let mut current = downscale_trimap(trimap, w0, h0);
        for &(w, h) in &self.schedule[1..] {
            let prev = std::mem::replace(&mut current, Image::new(1, 1));
            current = downscale_trimap(&prev, w, h);
        }
        debug_assert_eq!(current.width(), self.image.width());
        debug_assert_eq!(current.height(), self.image.height());
        current
    }

    /// The surviving coarsest image level.
    pub fn image(&self) -> &Image<Rgba8> {
        &self.image
    }

    pub fn width(&self) -> usize {
        self.image.width()
    }

    pub fn height(&self) -> usize {
        self.image.height()
    }

    /// The level dimensions of the halving schedule, finest first.
    pub fn schedule(&self) -> &[(usize, usize)] {
        &self.schedule
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
