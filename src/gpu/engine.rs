// gpu/engine.rs — device-resident refinement controller.
//
// Mirrors `crate::engine::Segmentation` step for step: same seeding, same
// pass structure, same convergence rule, same report. The frame, trimap,
// alpha planes, and capacity planes live on the device; the host touches
// pixels only for model finalization, the beta reduction, convergence
// compares, and the min-cut seam.
//
// The downscale chain ping-pongs through the terminal and top-cue planes:
// both are derived data, rebuilt from scratch at the start of every pass,
// so borrowing them between solves clobbers nothing.

use std::fmt;
use std::time::Instant;

use crate::energy::{EdgeCues, Neighborhood, CAPACITY_SCALE, DATA_TERM_CLAMP, TERMINAL_LOCK};
use crate::engine::{SegConfig, SegError, SolveReport, SolveState, COARSE_PASSES};
use crate::graphcut::{GridDinic, MinCutSolver};
use crate::gpu::buffers::{
    readback_i32_plane, readback_mask_plane, readback_scratch_f32, readback_scratch_u32,
    upload_image_plane, upload_mask_plane, BufferSet, Plane, BLOCK_DIM,
};
use crate::gpu::device::{GpuDevice, GpuError};
use crate::gpu::kernels::{
    block_dispatch, uniform_buffer, BetaParams, CopyParams, DownscaleParams, EdgeParams,
    GmmAccumParams, GmmTermParams, HistAccumParams, HistTermParams, Kernel, KernelSet,
    ThresholdParams, UpsampleParams,
};
use crate::image::{Image, Rgba8};
use crate::mask::planes_equal;
use crate::model::{
    ClusterPolicy, GmmModel, HistogramModel, ModelKind, COLOR_CLUSTERS, GMM_COMPONENT_FLOATS,
    HISTOGRAM_BINS, KMEANS_ROUNDS,
};
use crate::pyramid::{halving_schedule, COARSE_DIM_DIVISOR};

/// Initial luma split between a class's two components before the
/// nearest-mean rounds take over.
const SEED_LUMA_SPLIT: f32 = 128.0;

/// Errors from the device engine: input validation shared with the CPU
/// reference, plus device-side allocation failures.
#[derive(Debug)]
pub enum GpuSegError {
    Seg(SegError),
    Gpu(GpuError),
}

impl fmt::Display for GpuSegError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuSegError::Seg(e) => write!(f, "{e}"),
            GpuSegError::Gpu(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for GpuSegError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuSegError::Seg(e) => Some(e),
            GpuSegError::Gpu(e) => Some(e),
        }
    }
}

impl From<SegError> for GpuSegError {
    fn from(e: SegError) -> Self {
        GpuSegError::Seg(e)
    }
}

impl From<GpuError> for GpuSegError {
    fn from(e: GpuError) -> Self {
        GpuSegError::Gpu(e)
    }
}

// ---------------------------------------------------------------------------
// Min-cut seam
// ---------------------------------------------------------------------------

/// The solver seam: everything upstream (terminals, capacity planes) is
/// already device-resident when `solve` runs, and the labels land back in
/// a device plane, so a device-resident solver drops in without touching
/// the controller.
pub trait DeviceMinCut {
    /// Solve over the set's terminal and capacity planes; write raw labels
    /// (255 source-side, 0 sink-side) into `dst`.
    fn solve(&self, gpu: &GpuDevice, set: &BufferSet, dst: &Plane, neighborhood: Neighborhood);
}

/// Bundled solver: reads the capacity planes back, runs the reference
/// grid solver, uploads the labels.
pub struct HostGridCut;

impl DeviceMinCut for HostGridCut {
    fn solve(&self, gpu: &GpuDevice, set: &BufferSet, dst: &Plane, neighborhood: Neighborhood) {
        let terminals = readback_i32_plane(gpu, &set.terminals);
        let cues = EdgeCues {
            top: readback_i32_plane(gpu, &set.top),
            bottom: readback_i32_plane(gpu, &set.bottom),
            topleft: readback_i32_plane(gpu, &set.topleft),
            topright: readback_i32_plane(gpu, &set.topright),
            bottomleft: readback_i32_plane(gpu, &set.bottomleft),
            bottomright: readback_i32_plane(gpu, &set.bottomright),
            left_t: readback_i32_plane(gpu, &set.left_t),
            right_t: readback_i32_plane(gpu, &set.right_t),
            neighborhood,
        };
        let raw = GridDinic.solve(&terminals, &cues);
        upload_mask_plane(gpu, dst, &raw);
    }
}

// ---------------------------------------------------------------------------
// Dispatch plumbing
// ---------------------------------------------------------------------------

fn run<T: bytemuck::Pod>(
    gpu: &GpuDevice,
    kernel: &Kernel,
    buffers: &[&wgpu::Buffer],
    params: &T,
    groups: (u32, u32),
) {
    let uniform = uniform_buffer(gpu, "segcut params", params);
    let bind = kernel.bind(gpu, buffers, &uniform);
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("segcut"),
        });
    kernel.dispatch(&mut encoder, &bind, groups);
    gpu.queue.submit(std::iter::once(encoder.finish()));
}

/// A buffer region treated as a plane of explicit logical dimensions; the
/// chain reuses full-size planes for smaller intermediate levels.
struct LevelRef<'a> {
    buffer: &'a wgpu::Buffer,
    w: u32,
    h: u32,
    pitch: u32,
}

impl<'a> LevelRef<'a> {
    fn of(plane: &'a Plane) -> Self {
        LevelRef {
            buffer: &plane.buffer,
            w: plane.width,
            h: plane.height,
            pitch: plane.pitch,
        }
    }
}

/// Run the full halving schedule on the device, `src` down to `dst`,
/// ping-ponging intermediates through the two temp planes.
fn run_chain(
    gpu: &GpuDevice,
    kernel: &Kernel,
    src: LevelRef<'_>,
    temp: [&Plane; 2],
    dst: &Plane,
    schedule: &[(usize, usize)],
) {
    debug_assert_eq!(
        *schedule.last().unwrap(),
        (dst.width as usize, dst.height as usize)
    );
    let mut cur = src;
    for (i, &(lw, lh)) in schedule.iter().enumerate() {
        let (lw, lh) = (lw as u32, lh as u32);
        let target = if i + 1 == schedule.len() {
            LevelRef::of(dst)
        } else {
            let t = temp[i % 2];
            LevelRef {
                buffer: &t.buffer,
                w: lw,
                h: lh,
                pitch: t.pitch,
            }
        };
        let params = DownscaleParams {
            src_w: cur.w,
            src_h: cur.h,
            src_pitch: cur.pitch,
            dst_w: lw,
            dst_h: lh,
            dst_pitch: target.pitch,
            _pad0: 0,
            _pad1: 0,
        };
        run(
            gpu,
            kernel,
            &[cur.buffer, target.buffer],
            &params,
            gpu.dispatch_size(lw, lh),
        );
        cur = target;
    }
}

fn copy_mask(gpu: &GpuDevice, kernels: &KernelSet, src: &Plane, dst: &Plane) {
    debug_assert_eq!((src.width, src.height), (dst.width, dst.height));
    let params = CopyParams {
        width: dst.width,
        height: dst.height,
        src_pitch: src.pitch,
        dst_pitch: dst.pitch,
    };
    run(
        gpu,
        &kernels.copy_plane,
        &[&src.buffer, &dst.buffer],
        &params,
        gpu.dispatch_size(dst.width, dst.height),
    );
}

fn threshold_plane(gpu: &GpuDevice, kernels: &KernelSet, plane: &Plane) {
    let params = ThresholdParams {
        width: plane.width,
        height: plane.height,
        pitch: plane.pitch,
        _pad: 0,
    };
    run(
        gpu,
        &kernels.threshold_raw,
        &[&plane.buffer],
        &params,
        gpu.dispatch_size(plane.width, plane.height),
    );
}

// ---------------------------------------------------------------------------
// Model fits
// ---------------------------------------------------------------------------

/// Host mirror of the device-accumulated appearance model: finalized GMM
/// parameters or histogram counts, reused by the crop path without a
/// refit.
enum HostModel {
    Gmm(GmmModel),
    Histogram(HistogramModel),
}

fn blocks_of(set: &BufferSet) -> (u32, u32) {
    (
        (set.width + BLOCK_DIM - 1) / BLOCK_DIM,
        (set.height + BLOCK_DIM - 1) / BLOCK_DIM,
    )
}

fn reduce_moments(
    raw: &[f32],
    blocks: usize,
    slots: usize,
) -> Vec<[f64; GMM_COMPONENT_FLOATS]> {
    let mut out = vec![[0.0f64; GMM_COMPONENT_FLOATS]; slots];
    for b in 0..blocks {
        for (s, slot) in out.iter_mut().enumerate() {
            let base = (b * slots + s) * GMM_COMPONENT_FLOATS;
            for (j, v) in slot.iter_mut().enumerate() {
                *v += raw[base + j] as f64;
            }
        }
    }
    out
}

fn means_into_params(
    params: &mut GmmAccumParams,
    means: impl Iterator<Item = [f32; 3]>,
) {
    for (slot, m) in params.means.iter_mut().zip(means) {
        slot[0] = m[0];
        slot[1] = m[1];
        slot[2] = m[2];
    }
}

/// Device GMM fit: a luma-split seed pass, the reference's number of
/// nearest-mean rounds, then host finalization of the reduced moments.
/// With `reseed` false (Reassign policy after a prior fit) a single
/// nearest-mean pass against the current means refreshes the statistics.
fn fit_gmm(
    gpu: &GpuDevice,
    kernels: &KernelSet,
    set: &BufferSet,
    alpha: &Plane,
    gmm: &mut GmmModel,
    reseed: bool,
) {
    let (bx, by) = blocks_of(set);
    let blocks = (bx * by) as usize;
    let slots = 2 * COLOR_CLUSTERS;
    let mut params = GmmAccumParams {
        width: set.width,
        height: set.height,
        img_pitch: set.image.pitch,
        alpha_pitch: alpha.pitch,
        blocks_x: bx,
        blocks_y: by,
        k: COLOR_CLUSTERS as u32,
        mode: 0,
        means: [[0.0; 4]; 8],
    };

    let accumulate = |params: &GmmAccumParams| {
        run(
            gpu,
            &kernels.gmm_accumulate,
            &[&set.image.buffer, &alpha.buffer, &set.scratch],
            params,
            block_dispatch(bx, by),
        );
        let raw = readback_scratch_f32(gpu, set, blocks * slots * GMM_COMPONENT_FLOATS);
        reduce_moments(&raw, blocks, slots)
    };

    let moments = if reseed {
        params.means[0][3] = SEED_LUMA_SPLIT;
        params.means[COLOR_CLUSTERS][3] = SEED_LUMA_SPLIT;
        let mut moments = accumulate(&params);
        params.mode = 1;
        for _ in 0..KMEANS_ROUNDS {
            means_into_params(
                &mut params,
                moments.iter().map(|m| {
                    if m[0] > 0.0 {
                        [
                            (m[1] / m[0]) as f32,
                            (m[2] / m[0]) as f32,
                            (m[3] / m[0]) as f32,
                        ]
                    } else {
                        // Empty component: park the mean far away so no
                        // pixel reassigns to it.
                        [1.0e9; 3]
                    }
                }),
            );
            moments = accumulate(&params);
        }
        moments
    } else {
        params.mode = 1;
        means_into_params(&mut params, gmm.component_means().into_iter());
        accumulate(&params)
    };
    gmm.set_from_moments(&moments);
}

/// Device histogram fit: zeroed bins, one atomic scatter pass, counts
/// read back into the host mirror.
fn fit_hist(
    gpu: &GpuDevice,
    kernels: &KernelSet,
    set: &BufferSet,
    alpha: &Plane,
    hist: &mut HistogramModel,
) {
    let zeros = vec![0u8; 2 * HISTOGRAM_BINS * 4];
    gpu.queue.write_buffer(&set.scratch, 0, &zeros);
    let params = HistAccumParams {
        width: set.width,
        height: set.height,
        img_pitch: set.image.pitch,
        alpha_pitch: alpha.pitch,
    };
    run(
        gpu,
        &kernels.hist_accumulate,
        &[&set.image.buffer, &alpha.buffer, &set.scratch],
        &params,
        gpu.dispatch_size(set.width, set.height),
    );
    let counts = readback_scratch_u32(gpu, set, 2 * HISTOGRAM_BINS);
    hist.set_counts(
        counts[..HISTOGRAM_BINS].to_vec(),
        counts[HISTOGRAM_BINS..].to_vec(),
    );
}

// ---------------------------------------------------------------------------
// Per-pass stages
// ---------------------------------------------------------------------------

/// Terminal plane from the trimap and the host-mirrored model. Model data
/// is (re)written into the set's scratch first, so the stage is valid on
/// any set, including a freshly allocated crop set.
fn build_data_term(gpu: &GpuDevice, kernels: &KernelSet, set: &BufferSet, model: &HostModel) {
    match model {
        HostModel::Gmm(gmm) => {
            let eval = gmm.eval_block();
            gpu.queue
                .write_buffer(&set.scratch, 0, bytemuck::cast_slice(&eval));
            let params = GmmTermParams {
                width: set.width,
                height: set.height,
                img_pitch: set.image.pitch,
                trimap_pitch: set.trimap.pitch,
                term_pitch: set.terminals.pitch,
                k: COLOR_CLUSTERS as u32,
                scale: CAPACITY_SCALE,
                lock: TERMINAL_LOCK,
                clamp_at: DATA_TERM_CLAMP,
                _pad0: 0,
                _pad1: 0,
                _pad2: 0,
            };
            run(
                gpu,
                &kernels.data_term_gmm,
                &[
                    &set.image.buffer,
                    &set.trimap.buffer,
                    &set.terminals.buffer,
                    &set.scratch,
                ],
                &params,
                gpu.dispatch_size(set.width, set.height),
            );
        }
        HostModel::Histogram(hist) => {
            let (fg, bg) = hist.counts();
            gpu.queue
                .write_buffer(&set.scratch, 0, bytemuck::cast_slice(fg));
            gpu.queue.write_buffer(
                &set.scratch,
                (HISTOGRAM_BINS * 4) as u64,
                bytemuck::cast_slice(bg),
            );
            let (fg_total, bg_total) = hist.totals();
            let params = HistTermParams {
                width: set.width,
                height: set.height,
                img_pitch: set.image.pitch,
                trimap_pitch: set.trimap.pitch,
                term_pitch: set.terminals.pitch,
                _pad0: 0,
                fg_total: fg_total as f32,
                bg_total: bg_total as f32,
                scale: CAPACITY_SCALE,
                lock: TERMINAL_LOCK,
                clamp_at: DATA_TERM_CLAMP,
                _pad1: 0,
            };
            run(
                gpu,
                &kernels.data_term_hist,
                &[
                    &set.image.buffer,
                    &set.trimap.buffer,
                    &set.terminals.buffer,
                    &set.scratch,
                ],
                &params,
                gpu.dispatch_size(set.width, set.height),
            );
        }
    }
}

/// All eight directional planes: device block partials reduced to beta on
/// the host, then the row-major and transposed weight passes.
fn build_cues(
    gpu: &GpuDevice,
    kernels: &KernelSet,
    set: &BufferSet,
    neighborhood: Neighborhood,
    edge_strength: f32,
) {
    let (bx, by) = blocks_of(set);
    let blocks = (bx * by) as usize;
    let eight = (neighborhood == Neighborhood::Eight) as u32;

    let beta_params = BetaParams {
        width: set.width,
        height: set.height,
        img_pitch: set.image.pitch,
        blocks_x: bx,
        blocks_y: by,
        eight,
        _pad0: 0,
        _pad1: 0,
    };
    run(
        gpu,
        &kernels.beta_partials,
        &[&set.image.buffer, &set.scratch],
        &beta_params,
        block_dispatch(bx, by),
    );
    let partials = readback_scratch_f32(gpu, set, blocks * 2);
    let mut sum = 0.0f64;
    let mut pairs = 0.0f64;
    for b in 0..blocks {
        sum += partials[b * 2] as f64;
        pairs += partials[b * 2 + 1] as f64;
    }
    let beta = if pairs == 0.0 || sum <= 0.0 {
        0.0
    } else {
        (1.0 / (2.0 * sum / pairs)) as f32
    };

    let params = EdgeParams {
        width: set.width,
        height: set.height,
        img_pitch: set.image.pitch,
        plane_pitch: set.top.pitch,
        t_pitch: set.left_t.pitch,
        eight,
        beta,
        strength: edge_strength,
    };
    run(
        gpu,
        &kernels.edge_planes,
        &[
            &set.image.buffer,
            &set.top.buffer,
            &set.bottom.buffer,
            &set.topleft.buffer,
            &set.topright.buffer,
            &set.bottomleft.buffer,
            &set.bottomright.buffer,
        ],
        &params,
        gpu.dispatch_size(set.width, set.height),
    );
    run(
        gpu,
        &kernels.edge_horizontal,
        &[&set.image.buffer, &set.left_t.buffer, &set.right_t.buffer],
        &params,
        gpu.dispatch_size(set.width, set.height),
    );
}

// ---------------------------------------------------------------------------
// GpuSegmentation
// ---------------------------------------------------------------------------

/// Device mirror of `Segmentation`: same operations, same pass structure,
/// planes resident on the GPU. Methods take the `GpuDevice` explicitly;
/// one device context serves any number of engines.
pub struct GpuSegmentation {
    config: SegConfig,
    set: BufferSet,
    coarse: BufferSet,
    schedule: Vec<(usize, usize)>,
    kernels: KernelSet,
    solver: Box<dyn DeviceMinCut>,
    model: HostModel,
    current: usize,
    solved: bool,
    staged_crop_image: Option<(Image<Rgba8>, usize, usize)>,
    staged_crop_trimap: Option<(Image<u8>, usize, usize)>,
}

impl GpuSegmentation {
    pub fn new(
        gpu: &GpuDevice,
        image: &Image<Rgba8>,
        trimap: &Image<u8>,
        config: SegConfig,
    ) -> Result<Self, GpuSegError> {
        if image.is_empty() || trimap.is_empty() {
            return Err(SegError::EmptyInput.into());
        }
        if image.width() != trimap.width() || image.height() != trimap.height() {
            return Err(SegError::DimensionMismatch {
                expected: (image.width(), image.height()),
                got: (trimap.width(), trimap.height()),
            }
            .into());
        }
        let (w, h) = (image.width(), image.height());
        let max_dim = (w.max(h) / COARSE_DIM_DIVISOR).max(1);
        let schedule = halving_schedule(w, h, max_dim);
        let (cw, ch) = *schedule.last().unwrap();

        let set = BufferSet::allocate(gpu, w as u32, h as u32)?;
        let coarse = BufferSet::allocate(gpu, cw as u32, ch as u32)?;
        let kernels = KernelSet::create(gpu);
        upload_image_plane(gpu, &set.image, image);
        upload_mask_plane(gpu, &set.trimap, trimap);

        let engine = GpuSegmentation {
            config,
            set,
            coarse,
            schedule,
            kernels,
            solver: Box::new(HostGridCut),
            model: match config.model {
                ModelKind::Gmm => HostModel::Gmm(GmmModel::new(COLOR_CLUSTERS)),
                ModelKind::Histogram => HostModel::Histogram(HistogramModel::new()),
            },
            current: 0,
            solved: false,
            staged_crop_image: None,
            staged_crop_trimap: None,
        };
        engine.rebuild_coarse_image(gpu);
        Ok(engine)
    }

    /// Swap the min-cut implementation.
    pub fn set_solver(&mut self, solver: Box<dyn DeviceMinCut>) {
        self.solver = solver;
    }

    pub fn width(&self) -> usize {
        self.set.width as usize
    }

    pub fn height(&self) -> usize {
        self.set.height as usize
    }

    fn rebuild_coarse_image(&self, gpu: &GpuDevice) {
        run_chain(
            gpu,
            &self.kernels.downscale_rgba,
            LevelRef::of(&self.set.image),
            [&self.set.terminals, &self.set.top],
            &self.coarse.image,
            &self.schedule,
        );
    }

    /// Replace the frame in place. Dimensions are fixed at construction.
    pub fn update_image(&mut self, gpu: &GpuDevice, image: &Image<Rgba8>) {
        assert_eq!(image.width(), self.width(), "update_image: width changed");
        assert_eq!(image.height(), self.height(), "update_image: height changed");
        upload_image_plane(gpu, &self.set.image, image);
        self.rebuild_coarse_image(gpu);
    }

    /// Replace the trimap in place. Dimensions are fixed at construction.
    pub fn update_trimap(&mut self, gpu: &GpuDevice, trimap: &Image<u8>) {
        assert_eq!(trimap.width(), self.width(), "update_trimap: width changed");
        assert_eq!(trimap.height(), self.height(), "update_trimap: height changed");
        upload_mask_plane(gpu, &self.set.trimap, trimap);
    }

    fn fit(&mut self, gpu: &GpuDevice, coarse: bool, alpha_index: usize, reseed: bool) {
        let set = if coarse { &self.coarse } else { &self.set };
        let alpha = &set.alpha[alpha_index];
        match &mut self.model {
            HostModel::Gmm(gmm) => fit_gmm(gpu, &self.kernels, set, alpha, gmm, reseed),
            HostModel::Histogram(hist) => fit_hist(gpu, &self.kernels, set, alpha, hist),
        }
    }

    /// Full solve from the current trimap; see the CPU reference for the
    /// pass structure this mirrors.
    pub fn compute_segmentation_from_trimap(
        &mut self,
        gpu: &GpuDevice,
    ) -> Result<SolveReport, GpuSegError> {
        let start = Instant::now();
        let mut coarse_iterations = 0;

        if self.config.seed_from_pyramid {
            coarse_iterations = self.seed_coarse(gpu);
        } else {
            let next = self.current ^ 1;
            copy_mask(gpu, &self.kernels, &self.set.trimap, &self.set.alpha[next]);
            self.current = next;
        }

        self.fit(gpu, false, self.current, true);

        let mut state = SolveState::IterationLimit;
        let mut iterations = 0;
        while iterations < self.config.refine_passes {
            iterations += 1;
            build_data_term(gpu, &self.kernels, &self.set, &self.model);
            build_cues(
                gpu,
                &self.kernels,
                &self.set,
                self.config.neighborhood,
                self.config.edge_strength,
            );
            let next = self.current ^ 1;
            self.solver
                .solve(gpu, &self.set, &self.set.alpha[next], self.config.neighborhood);
            threshold_plane(gpu, &self.kernels, &self.set.alpha[next]);

            let converged = iterations >= 2 && {
                let a = readback_mask_plane(gpu, &self.set.alpha[next]);
                let b = readback_mask_plane(gpu, &self.set.alpha[self.current]);
                planes_equal(&a, &b)
            };
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
            let reseed = self.config.cluster_policy == ClusterPolicy::Recluster;
            self.fit(gpu, false, self.current, reseed);
        }

        self.solved = true;
        Ok(SolveReport {
            state,
            coarse_iterations,
            iterations,
            elapsed: start.elapsed(),
        })
    }

    fn seed_coarse(&mut self, gpu: &GpuDevice) -> usize {
        run_chain(
            gpu,
            &self.kernels.downscale_trimap,
            LevelRef::of(&self.set.trimap),
            [&self.set.terminals, &self.set.top],
            &self.coarse.trimap,
            &self.schedule,
        );
        let mut cur = 0;
        copy_mask(gpu, &self.kernels, &self.coarse.trimap, &self.coarse.alpha[cur]);

        for _ in 0..COARSE_PASSES {
            self.fit(gpu, true, cur, true);
            build_data_term(gpu, &self.kernels, &self.coarse, &self.model);
            build_cues(
                gpu,
                &self.kernels,
                &self.coarse,
                Neighborhood::Four,
                self.config.edge_strength,
            );
            let next = cur ^ 1;
            self.solver
                .solve(gpu, &self.coarse, &self.coarse.alpha[next], Neighborhood::Four);
            threshold_plane(gpu, &self.kernels, &self.coarse.alpha[next]);
            cur = next;
        }

        let next = self.current ^ 1;
        let coarse_plane = &self.coarse.alpha[cur];
        let full_plane = &self.set.alpha[next];
        let params = UpsampleParams {
            coarse_w: coarse_plane.width,
            coarse_h: coarse_plane.height,
            coarse_pitch: coarse_plane.pitch,
            full_w: full_plane.width,
            full_h: full_plane.height,
            full_pitch: full_plane.pitch,
            _pad0: 0,
            _pad1: 0,
        };
        run(
            gpu,
            &self.kernels.upsample_nearest,
            &[&coarse_plane.buffer, &full_plane.buffer],
            &params,
            gpu.dispatch_size(full_plane.width, full_plane.height),
        );
        self.current = next;
        COARSE_PASSES
    }

    /// Warm-start refinement: one min-cut pass against the existing model.
    pub fn update_segmentation(&mut self, gpu: &GpuDevice) -> Result<SolveReport, GpuSegError> {
        if !self.solved {
            return Err(SegError::NotReady.into());
        }
        let start = Instant::now();
        build_data_term(gpu, &self.kernels, &self.set, &self.model);
        build_cues(
            gpu,
            &self.kernels,
            &self.set,
            self.config.neighborhood,
            self.config.edge_strength,
        );
        // The spare plane is only a scratch target here; like the CPU warm
        // pass, the result lands in the current plane and the flip index
        // moves only during full solves.
        let scratch = self.current ^ 1;
        self.solver
            .solve(gpu, &self.set, &self.set.alpha[scratch], self.config.neighborhood);
        threshold_plane(gpu, &self.kernels, &self.set.alpha[scratch]);

        let a = readback_mask_plane(gpu, &self.set.alpha[scratch]);
        let b = readback_mask_plane(gpu, &self.set.alpha[self.current]);
        let state = if planes_equal(&a, &b) {
            SolveState::Converged
        } else {
            SolveState::IterationLimit
        };
        copy_mask(
            gpu,
            &self.kernels,
            &self.set.alpha[scratch],
            &self.set.alpha[self.current],
        );
        Ok(SolveReport {
            state,
            coarse_iterations: 0,
            iterations: 1,
            elapsed: start.elapsed(),
        })
    }

    /// Stage a sub-rectangle of image content for the crop solver.
    pub fn update_image_crop(
        &mut self,
        crop: &Image<Rgba8>,
        x: usize,
        y: usize,
    ) -> Result<(), GpuSegError> {
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
    ) -> Result<(), GpuSegError> {
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

    /// One-pass solve over the staged crop with the current model, in a
    /// plane set allocated and released inside the call. The full planes
    /// are untouched. `Ok(None)` until both crop planes are staged and a
    /// full solve has fit the model.
    pub fn compute_segmentation_crop(
        &mut self,
        gpu: &GpuDevice,
    ) -> Result<Option<Image<u8>>, GpuSegError> {
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
            }
            .into());
        }

        let mut crop_set =
            BufferSet::allocate(gpu, crop_image.width() as u32, crop_image.height() as u32)?;
        upload_image_plane(gpu, &crop_set.image, crop_image);
        upload_mask_plane(gpu, &crop_set.trimap, crop_trimap);

        // No alpha seeding for the crop: the solver reads only the terminal
        // and capacity planes, so a crop-local seed would never be consumed.
        build_data_term(gpu, &self.kernels, &crop_set, &self.model);
        build_cues(
            gpu,
            &self.kernels,
            &crop_set,
            self.config.neighborhood,
            self.config.edge_strength,
        );
        self.solver.solve(
            gpu,
            &crop_set,
            &crop_set.alpha[0],
            self.config.neighborhood,
        );
        threshold_plane(gpu, &self.kernels, &crop_set.alpha[0]);
        let mask = readback_mask_plane(gpu, &crop_set.alpha[0]);
        crop_set.release();
        Ok(Some(mask))
    }

    /// The authoritative alpha plane, read back to host memory.
    pub fn alpha_readback(&self, gpu: &GpuDevice) -> Image<u8> {
        readback_mask_plane(gpu, &self.set.alpha[self.current])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
