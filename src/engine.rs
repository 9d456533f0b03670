// engine.rs — CPU reference refinement controller.
//
// The controller owns the frame, the trimap, the appearance model, and a
// double-buffered alpha plane addressed through a flip index. One solve
// alternates model estimation with a global min-cut until the thresholded
// labeling stops changing or the pass cap is reached. A fresh solve is
// optionally seeded coarse-to-fine: two quick iterations at pyramid
// resolution, upsampled into the full plane, so the full-resolution loop
// starts near its fixed point.
//
// The gpu module mirrors this controller step for step; this one is the
// behavioral reference the GPU results are validated against.

use std::fmt;
use std::time::{Duration, Instant};

use crate::energy::{data_term, edge_cues, Neighborhood, EDGE_STRENGTH};
use crate::graphcut::{GridDinic, MinCutSolver};
use crate::image::{Image, Rgba8};
use crate::mask::{planes_equal, seed_alpha_from_trimap, threshold_in_place, upsample_nearest};
use crate::model::{make_model, AppearanceModel, ClusterPolicy, ModelKind};
use crate::pyramid::{CoarseChain, COARSE_DIM_DIVISOR};

/// Coarse outer iterations of a seeded solve.
pub(crate) const COARSE_PASSES: usize = 2;

/// Errors surfaced by the engine. Non-convergence is never an error; it is
/// reported through `SolveState` and a diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegError {
    /// Zero-dimension image or trimap at construction.
    EmptyInput,
    /// Planes or crop rectangles that do not agree with the frame.
    DimensionMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },
    /// A warm-start operation was called before any full solve.
    NotReady,
}

impl fmt::Display for SegError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegError::EmptyInput => write!(f, "image and trimap must be non-empty"),
            SegError::DimensionMismatch { expected, got } => write!(
                f,
                "dimension mismatch: expected {}x{}, got {}x{}",
                expected.0, expected.1, got.0, got.1
            ),
            SegError::NotReady => write!(f, "no prior segmentation to refine"),
        }
    }
}

impl std::error::Error for SegError {}

/// How a solve terminated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SolveState {
    /// Two consecutive thresholded planes were identical.
    Converged,
    /// The pass cap was reached first. The last-written plane is still
    /// authoritative.
    IterationLimit,
}

/// Per-solve statistics, returned rather than logged.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SolveReport {
    pub state: SolveState,
    pub coarse_iterations: usize,
    pub iterations: usize,
    pub elapsed: Duration,
}

/// Engine configuration. The defaults reproduce the reference pipeline:
/// eight-connected cuts, two-component GMMs reclustered every iteration,
/// pyramid seeding down to a quarter of the larger frame dimension.
#[derive(Copy, Clone, Debug)]
pub struct SegConfig {
    pub neighborhood: Neighborhood,
    pub model: ModelKind,
    pub cluster_policy: ClusterPolicy,
    pub edge_strength: f32,
    pub seed_from_pyramid: bool,
    /// Full-resolution refinement passes per solve.
    pub refine_passes: usize,
    /// Diagnostic threshold: reaching it emits a warning line. Never an
    /// error.
    pub max_iterations: usize,
}

impl Default for SegConfig {
    fn default() -> Self {
        SegConfig {
            neighborhood: Neighborhood::Eight,
            model: ModelKind::Gmm,
            cluster_policy: ClusterPolicy::Recluster,
            edge_strength: EDGE_STRENGTH,
            seed_from_pyramid: true,
            refine_passes: 2,
            max_iterations: 10,
        }
    }
}

/// Interactive foreground segmentation over one frame.
pub struct Segmentation {
    config: SegConfig,
    image: Image<Rgba8>,
    trimap: Image<u8>,
    // Double-buffered alpha; `current` is the flip index of the
    // authoritative plane.
    alpha: [Image<u8>; 2],
    current: usize,
    chain: CoarseChain,
    model: Box<dyn AppearanceModel>,
    solver: GridDinic,
    solved: bool,
    staged_crop_image: Option<(Image<Rgba8>, usize, usize)>,
    staged_crop_trimap: Option<(Image<u8>, usize, usize)>,
}

impl Segmentation {
    pub fn new(
        image: &Image<Rgba8>,
        trimap: &Image<u8>,
        config: SegConfig,
    ) -> Result<Self, SegError> {
        if image.is_empty() || trimap.is_empty() {
            return Err(SegError::EmptyInput);
        }
        if image.width() != trimap.width() || image.height() != trimap.height() {
            return Err(SegError::DimensionMismatch {
                expected: (image.width(), image.height()),
                got: (trimap.width(), trimap.height()),
            });
        }
        let (w, h) = (image.width(), image.height());
        let chain = CoarseChain::build(image, Self::coarse_max_dim(w, h));
        Ok(Segmentation {
            config,
            image: image.clone(),
            trimap: trimap.clone(),
            alpha: [Image::new(w, h), Image::new(w, h)],
            current: 0,
            chain,
            model: make_model(config.model),
            solver: GridDinic,
            solved: false,
            staged_crop_image: None,
            staged_crop_trimap: None,
        })
    }

    fn coarse_max_dim(w: usize, h: usize) -> usize {
        (w.max(h) / COARSE_DIM_DIVISOR).max(1)
    }

    pub fn width(&self) -> usize {
        self.image.width()
    }

    pub fn height(&self) -> usize {
        self.image.height()
    }

    /// The authoritative alpha plane (thresholded after any solve).
    pub fn alpha(&self) -> &Image<u8> {
        &self.alpha[self.current]
    }

    /// Replace the frame in place. Dimensions are fixed at construction.
    /// The coarse chain is rebuilt so the next seeded solve sees the new
    /// content.
    pub fn update_image(&mut self, image: &Image<Rgba8>) {
        assert_eq!(image.width(), self.image.width(), "update_image: width changed");
        assert_eq!(image.height(), self.image.height(), "update_image: height changed");
        self.image.copy_from(image);
        self.chain = CoarseChain::build(&self.image, Self::coarse_max_dim(self.width(), self.height()));
    }

    /// Replace the trimap in place. Dimensions are fixed at construction.
    pub fn update_trimap(&mut self, trimap: &Image<u8>) {
        assert_eq!(trimap.width(), self.trimap.width(), "update_trimap: width changed");
        assert_eq!(trimap.height(), self.trimap.height(), "update_trimap: height changed");
        self.trimap.copy_from(trimap);
    }

    /// Full solve from the current trimap: optional coarse seeding, then
    /// the model/min-cut refinement loop at frame resolution.
    pub fn compute_segmentation_from_trimap(&mut self) -> Result<SolveReport, SegError> {
        let start = Instant::now();
        let mut coarse_iterations = 0;

        if self.config.seed_from_pyramid {
            coarse_iterations = self.seed_coarse();
        } else {
            let next = self.current ^ 1;
            seed_alpha_from_trimap(&mut self.alpha[next], &self.trimap);
            self.current = next;
        }

        // Initial fit on the seeded plane; nonzero alpha counts as
        // foreground, so raw trimap values work unthresholded.
        self.model
            .update(&self.image, &self.alpha[self.current], ClusterPolicy::Recluster);

        let mut state = SolveState::IterationLimit;
        let mut iterations = 0;
        while iterations < self.config.refine_passes {
            iterations += 1;
            let terminals = data_term(self.model.as_ref(), &self.image, &self.trimap);
            let cues = edge_cues(&self.image, self.config.edge_strength, self.config.neighborhood);
            let next = self.current ^ 1;
            self.alpha[next] = self.solver.solve(&terminals, &cues);
            threshold_in_place(&mut self.alpha[next]);

            // Both planes are thresholded from the second iteration on;
            // the first compare would see the raw seed.
            let converged = iterations >= 2 && planes_equal(&self.alpha[next], &self.alpha[self.current]);
            self.current = next;
            if converged {
                state = SolveState::Converged;
                break;
            }
            if iterations >= self.config.max_iterations {
                eprintln!(
                    "[segcut] no convergence after {} iterations ({}x{})",
                    iterations,
                    self.width(),
                    self.height()
                );
                break;
            }
            self.model
                .update(&self.image, &self.alpha[self.current], self.config.cluster_policy);
        }

        self.solved = true;
        Ok(SolveReport {
            state,
            coarse_iterations,
            iterations,
            elapsed: start.elapsed(),
        })
    }

    /// Coarse seeding: a short solve at pyramid resolution, four-connected,
    /// upsampled into the full-resolution plane with a final index flip.
    fn seed_coarse(&mut self) -> usize {
        let coarse_trimap = self.chain.coarse_trimap(&self.trimap);
        let (cw, ch) = (self.chain.width(), self.chain.height());
        let mut coarse_alpha = [Image::<u8>::new(cw, ch), Image::<u8>::new(cw, ch)];
        let mut cur = 0;
        seed_alpha_from_trimap(&mut coarse_alpha[cur], &coarse_trimap);

        for _ in 0..COARSE_PASSES {
            self.model
                .update(self.chain.image(), &coarse_alpha[cur], ClusterPolicy::Recluster);
            let terminals = data_term(self.model.as_ref(), self.chain.image(), &coarse_trimap);
            let cues = edge_cues(self.chain.image(), self.config.edge_strength, Neighborhood::Four);
            let next = cur ^ 1;
            coarse_alpha[next] = self.solver.solve(&terminals, &cues);
            threshold_in_place(&mut coarse_alpha[next]);
            cur = next;
        }

        let next = self.current ^ 1;
        upsample_nearest(&coarse_alpha[cur], &mut self.alpha[next]);
        self.current = next;
        COARSE_PASSES
    }

    /// Warm-start refinement: one min-cut pass against the existing model,
    /// written into the current plane without flipping. Requires a prior
    /// full solve.
    pub fn update_segmentation(&mut self) -> Result<SolveReport, SegError> {
        if !self.solved {
            return Err(SegError::NotReady);
        }
        let start = Instant::now();
        let terminals = data_term(self.model.as_ref(), &self.image, &self.trimap);
        let cues = edge_cues(&self.image, self.config.edge_strength, self.config.neighborhood);
        let mut raw = self.solver.solve(&terminals, &cues);
        threshold_in_place(&mut raw);
        let state = if planes_equal(&raw, &self.alpha[self.current]) {
            SolveState::Converged
        } else {
            SolveState::IterationLimit
        };
        self.alpha[self.current] = raw;
        Ok(SolveReport {
            state,
            coarse_iterations: 0,
            iterations: 1,
            elapsed: start.elapsed(),
        })
    }

    /// Stage a sub-rectangle of image content for the crop solver. The
    /// rectangle must lie within the frame.
    pub fn update_image_crop(
        &mut self,
        crop: &Image<Rgba8>,
        x: usize,
        y: usize,
    ) -> Result<(), SegError> {
        self.check_crop_rect(crop.width(), crop.height(), x, y)?;
        self.staged_crop_image = Some((crop.clone(), x, y));
        Ok(())
    }

    /// Stage a sub-rectangle of trimap hints for the crop solver.
    pub fn update_trimap_crop(
        &mut self,
        crop: &Image<u8>,
        x: usize,
        y: usize,
    ) -> Result<(), SegError> {
        self.check_crop_rect(crop.width(), crop.height(), x, y)?;
        self.staged_crop_trimap = Some((crop.clone(), x, y));
        Ok(())
    }

    fn check_crop_rect(&self, w: usize, h: usize, x: usize, y: usize) -> Result<(), SegError> {
        if w == 0 || h == 0 {
            return Err(SegError::EmptyInput);
        }
        if x + w > self.width() || y + h > self.height() {
            return Err(SegError::DimensionMismatch {
                expected: (self.width(), self.height()),
                got: (x + w, y + h),
            });
        }
        Ok(())
    }

    /// One-pass solve over the staged crop, using the engine's current
    /// appearance model. Returns the crop-sized mask; the full-resolution
    /// alpha planes are untouched. All crop-local state is dropped before
    /// returning. `Ok(None)` until both crop planes are staged and a full
    /// solve has fit the model.
    pub fn compute_segmentation_crop(&mut self) -> Result<Option<Image<u8>>, SegError> {
        let (crop_image, ix, iy) = match &self.staged_crop_image {
            Some(staged) => staged,
            None => return Ok(None),
        };
        let (crop_trimap, tx, ty) = match &self.staged_crop_trimap {
            Some(staged) => staged,
            None => return Ok(None),
        };
        if !self.solved {
            return Ok(None);
        }
        if crop_image.width() != crop_trimap.width()
            || crop_image.height() != crop_trimap.height()
            || (ix, iy) != (tx, ty)
        {
            return Err(SegError::DimensionMismatch {
                expected: (crop_image.width(), crop_image.height()),
                got: (crop_trimap.width(), crop_trimap.height()),
            });
        }

        // No alpha seeding for the crop: the solver reads only the terminal
        // and capacity planes, so a crop-local seed would never be consumed.
        let terminals = data_term(self.model.as_ref(), crop_image, crop_trimap);
        let cues = edge_cues(crop_image, self.config.edge_strength, self.config.neighborhood);
        let mut mask = self.solver.solve(&terminals, &cues);
        threshold_in_place(&mut mask);
        Ok(Some(mask))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
