// model.rs — Appearance models for the data term.
//
// Two interchangeable color models, selected at engine construction:
//
//   GmmModel       k full-covariance Gaussians per class (GrabCut proper).
//   HistogramModel 16x16x16 color histogram per class, Laplace-smoothed.
//
// Both are fit against the current alpha plane. Foreground membership
// during a fit is `alpha != 0`: the freshly seeded alpha still carries raw
// trimap values (unknown = 1, foreground = 2) and both must count as
// foreground for the initial fit.
//
// Model state is private to the engine. The only outputs are per-pixel
// class log-likelihoods, consumed by the data-term builder.

use crate::image::{Image, Rgba8};

/// Gaussian components per class.
pub const COLOR_CLUSTERS: usize = 2;

/// Floats per serialized GMM component: weight, mean rgb, upper-triangular
/// 3x3 covariance, sample count. This is also the per-component stride of
/// the GPU accumulation scratch.
pub const GMM_COMPONENT_FLOATS: usize = 11;

/// Histogram bins per class (16 levels per channel).
pub const HISTOGRAM_BINS: usize = 16 * 16 * 16;

/// Fixed k-means refinement rounds after seeding; the GPU fit runs the
/// same number of nearest-mean passes.
pub const KMEANS_ROUNDS: usize = 4;

/// Added to covariance diagonals (squared gray levels) so near-degenerate
/// clusters stay invertible.
const COV_REGULARIZATION: f64 = 1.0;

/// Log-likelihood assigned when a class has no samples at all.
const LOG_UNSEEN: f32 = -70.0;

/// Sentinel in the GPU evaluation block marking an empty component; f32
/// cannot round-trip -inf through a storage buffer portably.
pub const EVAL_LOG_EMPTY: f32 = -1.0e30;

/// How a refit treats the previous component assignment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClusterPolicy {
    /// Discard assignments and recluster from scratch (the default; the
    /// reference engine reclusters on every iteration).
    Recluster,
    /// Keep each pixel's component assignment and only refresh the
    /// component statistics.
    Reassign,
}

/// Which appearance model the engine fits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModelKind {
    Gmm,
    Histogram,
}

/// A fitted color model: refit against an alpha plane, query per-class
/// log-likelihoods per pixel.
pub trait AppearanceModel {
    fn update(&mut self, image: &Image<Rgba8>, alpha: &Image<u8>, policy: ClusterPolicy);

    /// (foreground, background) log-likelihood of a color.
    fn log_likelihoods(&self, pixel: Rgba8) -> (f32, f32);
}

pub fn make_model(kind: ModelKind) -> Box<dyn AppearanceModel> {
    match kind {
        ModelKind::Gmm => Box::new(GmmModel::new(COLOR_CLUSTERS)),
        ModelKind::Histogram => Box::new(HistogramModel::new()),
    }
}

// ---------------------------------------------------------------------------
// GMM
// ---------------------------------------------------------------------------

/// One Gaussian component over rgb, plus the cached inverse and
/// log-normalizer derived at fit time.
#[derive(Clone, Default)]
struct Component {
    weight: f64,
    mean: [f64; 3],
    // Upper triangle of the 3x3 covariance: [xx, xy, xz, yy, yz, zz].
    cov: [f64; 6],
    count: f64,
    inv: [f64; 6],
    // ln(weight) - 0.5 ln((2 pi)^3 det), so a density evaluation is one
    // Mahalanobis form plus an add.
    log_norm: f64,
}

impl Component {
    fn finalize(&mut self) {
        if self.count <= 0.0 || self.weight <= 0.0 {
            self.log_norm = f64::NEG_INFINITY;
            return;
        }
        let [a, b, c, d, e, f] = self.cov;
        let det = a * (d * f - e * e) - b * (b * f - c * e) + c * (b * e - c * d);
        if det <= 0.0 {
            self.log_norm = f64::NEG_INFINITY;
            return;
        }
        self.inv = [
            (d * f - e * e) / det,
            (c * e - b * f) / det,
            (b * e - c * d) / det,
            (a * f - c * c) / det,
            (b * c - a * e) / det,
            (a * d - b * b) / det,
        ];
        let log_2pi_cubed = 3.0 * (2.0 * std::f64::consts::PI).ln();
        self.log_norm = self.weight.ln() - 0.5 * (log_2pi_cubed + det.ln());
    }

    /// ln(weight * N(x; mean, cov)), or -inf for an empty component.
    fn log_weighted_density(&self, x: [f64; 3]) -> f64 {
        if self.log_norm == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
        let d = [x[0] - self.mean[0], x[1] - self.mean[1], x[2] - self.mean[2]];
        let [i00, i01, i02, i11, i12, i22] = self.inv;
        let q = i00 * d[0] * d[0]
            + i11 * d[1] * d[1]
            + i22 * d[2] * d[2]
            + 2.0 * (i01 * d[0] * d[1] + i02 * d[0] * d[2] + i12 * d[1] * d[2]);
        self.log_norm - 0.5 * q
    }
}

/// Full-covariance Gaussian mixture per class, fit by deterministic
/// luminance-quantile seeding plus a fixed number of k-means rounds.
pub struct GmmModel {
    k: usize,
    fg: Vec<Component>,
    bg: Vec<Component>,
    // Component index per pixel, kept across fits for ClusterPolicy::Reassign.
    assignment: Option<Image<u8>>,
}

impl GmmModel {
    pub fn new(k: usize) -> Self {
        assert!(k > 0, "GmmModel: k must be positive");
        GmmModel {
            k,
            fg: vec![Component::default(); k],
            bg: vec![Component::default(); k],
            assignment: None,
        }
    }

    /// Seed assignments for one class by luminance quantiles: pixel ranks
    /// within the class luma distribution map evenly onto components.
    /// Deterministic, no RNG.
    fn seed_by_luma(
        &self,
        image: &Image<Rgba8>,
        alpha: &Image<u8>,
        foreground: bool,
        assignment: &mut Image<u8>,
    ) {
        let mut luma_hist = [0usize; 256];
        let mut total = 0usize;
        for (x, y, px) in image.pixels() {
            if (alpha.get(x, y) != 0) == foreground {
                luma_hist[px.luma() as usize] += 1;
                total += 1;
            }
        }
        if total == 0 {
            return;
        }
        // Quantile split: component i covers luma ranks
        // [i*total/k, (i+1)*total/k).
        let mut seen = 0usize;
        let mut luma_to_component = [0u8; 256];
        for (luma, &n) in luma_hist.iter().enumerate() {
            let rank = seen + n / 2;
            luma_to_component[luma] = ((rank * self.k) / total).min(self.k - 1) as u8;
            seen += n;
        }
        for (x, y, px) in image.pixels() {
            if (alpha.get(x, y) != 0) == foreground {
                assignment.set(x, y, luma_to_component[px.luma() as usize]);
            }
        }
    }

    /// One k-means round for one class: recompute component rgb means from
    /// the current assignment, then reassign each pixel to the nearest mean.
    fn kmeans_round(
        &self,
        image: &Image<Rgba8>,
        alpha: &Image<u8>,
        foreground: bool,
        assignment: &mut Image<u8>,
    ) {
        let mut sums = vec![[0.0f64; 3]; self.k];
        let mut counts = vec![0.0f64; self.k];
        for (x, y, px) in image.pixels() {
            if (alpha.get(x, y) != 0) == foreground {
                let c = assignment.get(x, y) as usize;
                sums[c][0] += px.r() as f64;
                sums[c][1] += px.g() as f64;
                sums[c][2] += px.b() as f64;
                counts[c] += 1.0;
            }
        }
        let means: Vec<[f64; 3]> = (0..self.k)
            .map(|c| {
                if counts[c] > 0.0 {
                    [sums[c][0] / counts[c], sums[c][1] / counts[c], sums[c][2] / counts[c]]
                } else {
                    [f64::INFINITY; 3]
                }
            })
            .collect();
        for (x, y, px) in image.pixels() {
            if (alpha.get(x, y) != 0) == foreground {
                let p = [px.r() as f64, px.g() as f64, px.b() as f64];
                let mut best = 0usize;
                let mut best_d = f64::INFINITY;
                for (c, m) in means.iter().enumerate() {
                    let d = (p[0] - m[0]).powi(2) + (p[1] - m[1]).powi(2) + (p[2] - m[2]).powi(2);
                    if d < best_d {
                        best_d = d;
                        best = c;
                    }
                }
                assignment.set(x, y, best as u8);
            }
        }
    }

    /// Refresh component statistics for one class from the assignment.
    fn fit_stats(
        image: &Image<Rgba8>,
        alpha: &Image<u8>,
        foreground: bool,
        assignment: &Image<u8>,
        components: &mut [Component],
    ) {
        let k = components.len();
        let mut counts = vec![0.0f64; k];
        let mut sums = vec![[0.0f64; 3]; k];
        let mut prods = vec![[0.0f64; 6]; k];
        let mut class_total = 0.0f64;
        for (x, y, px) in image.pixels() {
            if (alpha.get(x, y) != 0) == foreground {
                let c = (assignment.get(x, y) as usize).min(k - 1);
                let p = [px.r() as f64, px.g() as f64, px.b() as f64];
                counts[c] += 1.0;
                class_total += 1.0;
                for i in 0..3 {
                    sums[c][i] += p[i];
                }
                prods[c][0] += p[0] * p[0];
                prods[c][1] += p[0] * p[1];
                prods[c][2] += p[0] * p[2];
                prods[c][3] += p[1] * p[1];
                prods[c][4] += p[1] * p[2];
                prods[c][5] += p[2] * p[2];
            }
        }
        for (c, comp) in components.iter_mut().enumerate() {
            let n = counts[c];
            comp.count = n;
            if n <= 0.0 || class_total <= 0.0 {
                *comp = Component::default();
                comp.finalize();
                continue;
            }
            comp.weight = n / class_total;
            for i in 0..3 {
                comp.mean[i] = sums[c][i] / n;
            }
            let m = comp.mean;
            comp.cov = [
                prods[c][0] / n - m[0] * m[0] + COV_REGULARIZATION,
                prods[c][1] / n - m[0] * m[1],
                prods[c][2] / n - m[0] * m[2],
                prods[c][3] / n - m[1] * m[1] + COV_REGULARIZATION,
                prods[c][4] / n - m[1] * m[2],
                prods[c][5] / n - m[2] * m[2] + COV_REGULARIZATION,
            ];
            comp.finalize();
        }
    }

    fn class_log_likelihood(components: &[Component], p: [f64; 3]) -> f32 {
        // Log-sum-exp over the weighted component densities.
        let logs: Vec<f64> = components.iter().map(|c| c.log_weighted_density(p)).collect();
        let max = logs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max == f64::NEG_INFINITY {
            return LOG_UNSEEN;
        }
        let sum: f64 = logs.iter().map(|&l| (l - max).exp()).sum();
        (max + sum.ln()) as f32
    }

    /// Serialize both classes into the 11-float-per-component layout used
    /// by the GPU accumulation scratch (foreground components first).
    pub fn serialize(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(2 * self.k * GMM_COMPONENT_FLOATS);
        for comp in self.fg.iter().chain(self.bg.iter()) {
            out.push(comp.weight as f32);
            out.extend(comp.mean.iter().map(|&v| v as f32));
            out.extend(comp.cov.iter().map(|&v| v as f32));
            out.push(comp.count as f32);
        }
        out
    }

    /// Rebuild both classes from externally accumulated raw moments
    /// (count, rgb sums, rgb products, luma sum per component, foreground
    /// class first). This is the host half of the GPU fit: the device
    /// scatter-sums per block, the reduced moments land here.
    pub fn set_from_moments(&mut self, moments: &[[f64; GMM_COMPONENT_FLOATS]]) {
        assert_eq!(moments.len(), 2 * self.k);
        let (fg, bg) = moments.split_at(self.k);
        Self::class_from_moments(fg, &mut self.fg);
        Self::class_from_moments(bg, &mut self.bg);
        // Any stored per-pixel assignment no longer matches the components.
        self.assignment = None;
    }

    fn class_from_moments(moments: &[[f64; GMM_COMPONENT_FLOATS]], components: &mut [Component]) {
        let class_total: f64 = moments.iter().map(|m| m[0]).sum();
        for (m, comp) in moments.iter().zip(components.iter_mut()) {
            let n = m[0];
            if n <= 0.0 || class_total <= 0.0 {
                *comp = Component::default();
                comp.finalize();
                continue;
            }
            comp.count = n;
            comp.weight = n / class_total;
            for i in 0..3 {
                comp.mean[i] = m[1 + i] / n;
            }
            let mu = comp.mean;
            comp.cov = [
                m[4] / n - mu[0] * mu[0] + COV_REGULARIZATION,
                m[5] / n - mu[0] * mu[1],
                m[6] / n - mu[0] * mu[2],
                m[7] / n - mu[1] * mu[1] + COV_REGULARIZATION,
                m[8] / n - mu[1] * mu[2],
                m[9] / n - mu[2] * mu[2] + COV_REGULARIZATION,
            ];
            comp.finalize();
        }
    }

    /// Per-component evaluation block for the GPU data-term kernel: 12
    /// floats per component (log-normalizer, mean rgb, inverse covariance
    /// upper triangle, two pads), foreground class first. Empty components
    /// carry `EVAL_LOG_EMPTY` in the log-normalizer slot.
    pub fn eval_block(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(2 * self.k * 12);
        for comp in self.fg.iter().chain(self.bg.iter()) {
            if comp.log_norm == f64::NEG_INFINITY {
                out.push(EVAL_LOG_EMPTY);
            } else {
                out.push(comp.log_norm as f32);
            }
            out.extend(comp.mean.iter().map(|&v| v as f32));
            out.extend(comp.inv.iter().map(|&v| v as f32));
            out.push(0.0);
            out.push(0.0);
        }
        out
    }

    /// Component rgb means, foreground class first, for the GPU
    /// nearest-mean assignment. Empty components report a far-away
    /// sentinel so no pixel reassigns to them.
    pub fn component_means(&self) -> Vec<[f32; 3]> {
        self.fg
            .iter()
            .chain(self.bg.iter())
            .map(|comp| {
                if comp.count <= 0.0 {
                    [1.0e9; 3]
                } else {
                    [comp.mean[0] as f32, comp.mean[1] as f32, comp.mean[2] as f32]
                }
            })
            .collect()
    }
}

impl AppearanceModel for GmmModel {
    fn update(&mut self, image: &Image<Rgba8>, alpha: &Image<u8>, policy: ClusterPolicy) {
        assert_eq!(image.width(), alpha.width());
        assert_eq!(image.height(), alpha.height());
        let recluster = policy == ClusterPolicy::Recluster || self.assignment.is_none();
        if recluster {
            let mut assignment = Image::<u8>::new(image.width(), image.height());
            self.seed_by_luma(image, alpha, true, &mut assignment);
            self.seed_by_luma(image, alpha, false, &mut assignment);
            for _ in 0..KMEANS_ROUNDS {
                self.kmeans_round(image, alpha, true, &mut assignment);
                self.kmeans_round(image, alpha, false, &mut assignment);
            }
            self.assignment = Some(assignment);
        }
        if let Some(assignment) = &self.assignment {
            Self::fit_stats(image, alpha, true, assignment, &mut self.fg);
            Self::fit_stats(image, alpha, false, assignment, &mut self.bg);
        }
    }

    fn log_likelihoods(&self, pixel: Rgba8) -> (f32, f32) {
        let p = [pixel.r() as f64, pixel.g() as f64, pixel.b() as f64];
        (
            Self::class_log_likelihood(&self.fg, p),
            Self::class_log_likelihood(&self.bg, p),
        )
    }
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// 16x16x16 color histogram per class. Cheaper than the GMM and fully
/// scatter-parallel on the GPU side; likelihoods are Laplace-smoothed so
/// unseen bins stay finite.
pub struct HistogramModel {
    fg: Vec<u32>,
    bg: Vec<u32>,
    fg_total: u64,
    bg_total: u64,
}

#[inline]
pub fn histogram_bin(pixel: Rgba8) -> usize {
    let r = (pixel.0[0] >> 4) as usize;
    let g = (pixel.0[1] >> 4) as usize;
    let b = (pixel.0[2] >> 4) as usize;
    (r << 8) | (g << 4) | b
}

impl HistogramModel {
    pub fn new() -> Self {
        HistogramModel {
            fg: vec![0; HISTOGRAM_BINS],
            bg: vec![0; HISTOGRAM_BINS],
            fg_total: 0,
            bg_total: 0,
        }
    }

    fn log_prob(counts: &[u32], total: u64, bin: usize) -> f32 {
        // Laplace smoothing: one pseudo-count per bin.
        let p = (counts[bin] as f64 + 1.0) / (total as f64 + HISTOGRAM_BINS as f64);
        p.ln() as f32
    }

    /// Replace both classes' counts wholesale (GPU accumulation readback).
    pub fn set_counts(&mut self, fg: Vec<u32>, bg: Vec<u32>) {
        assert_eq!(fg.len(), HISTOGRAM_BINS);
        assert_eq!(bg.len(), HISTOGRAM_BINS);
        self.fg_total = fg.iter().map(|&c| c as u64).sum();
        self.bg_total = bg.iter().map(|&c| c as u64).sum();
        self.fg = fg;
        self.bg = bg;
    }

    /// (foreground, background) sample totals.
    pub fn totals(&self) -> (u64, u64) {
        (self.fg_total, self.bg_total)
    }

    /// (foreground, background) bin counts.
    pub fn counts(&self) -> (&[u32], &[u32]) {
        (&self.fg, &self.bg)
    }
}

impl Default for HistogramModel {
    fn default() -> Self {
        Self::new()
    }
}

impl AppearanceModel for HistogramModel {
    fn update(&mut self, image: &Image<Rgba8>, alpha: &Image<u8>, _policy: ClusterPolicy) {
        assert_eq!(image.width(), alpha.width());
        assert_eq!(image.height(), alpha.height());
        self.fg.iter_mut().for_each(|c| *c = 0);
        self.bg.iter_mut().for_each(|c| *c = 0);
        self.fg_total = 0;
        self.bg_total = 0;
        for (x, y, px) in image.pixels() {
            let bin = histogram_bin(px);
            if alpha.get(x, y) != 0 {
                self.fg[bin] += 1;
                self.fg_total += 1;
            } else {
                self.bg[bin] += 1;
                self.bg_total += 1;
            }
        }
    }

    fn log_likelihoods(&self, pixel: Rgba8) -> (f32, f32) {
        let bin = histogram_bin(pixel);
        (
            Self::log_prob(&self.fg, self.fg_total, bin),
            Self::log_prob(&self.bg, self.bg_total, bin),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
