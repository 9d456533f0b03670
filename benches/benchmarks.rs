// benches/benchmarks.rs -- Per-stage and full-pipeline benchmarks.
//
// All benchmarks run on synthetic frames:
//   cargo bench
//
// The per-stage groups isolate the dominant costs of one refinement pass
// (edge cues, data term, min-cut); the pipeline group times a cold solve
// and a warm restart end to end.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use segcut::energy::{data_term, edge_cues, Neighborhood, EDGE_STRENGTH};
use segcut::engine::{SegConfig, Segmentation};
use segcut::graphcut::{GridDinic, MinCutSolver};
use segcut::image::{Image, Rgba8};
use segcut::mask::{TRIMAP_BACKGROUND, TRIMAP_FOREGROUND, TRIMAP_UNKNOWN};
use segcut::model::{make_model, ClusterPolicy, ModelKind};
use segcut::pyramid::{downscale_rgba, CoarseChain};

// ============================================================
// Helpers
// ============================================================

/// Two-tone frame with texture: a warm elliptical blob over a cool
/// gradient background, plus per-pixel dither so the edge cues vary.
fn make_scene(w: usize, h: usize) -> (Image<Rgba8>, Image<u8>) {
    let mut image = Image::<Rgba8>::new(w, h);
    let mut trimap = Image::<u8>::new(w, h);
    trimap.fill(TRIMAP_UNKNOWN);
    let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
    for y in 0..h {
        for x in 0..w {
            let nx = (x as f32 - cx) / (w as f32 * 0.28);
            let ny = (y as f32 - cy) / (h as f32 * 0.28);
            let dither = ((x * 7 + y * 13) % 17) as u8;
            if nx * nx + ny * ny < 1.0 {
                image.set(x, y, Rgba8::new(200 + dither / 2, 60 + dither, 50));
            } else {
                let base = (x * 90 / w + y * 40 / h) as u8;
                image.set(x, y, Rgba8::new(40 + dither, 60 + base / 2, 160 + base / 3));
            }
        }
    }
    for y in (h / 2 - h / 16)..(h / 2 + h / 16) {
        for x in (w / 2 - w / 16)..(w / 2 + w / 16) {
            trimap.set(x, y, TRIMAP_FOREGROUND);
        }
    }
    for x in 0..w {
        trimap.set(x, 0, TRIMAP_BACKGROUND);
        trimap.set(x, h - 1, TRIMAP_BACKGROUND);
    }
    (image, trimap)
}

/// Alpha plane for model fitting: blob interior marked foreground.
fn make_alpha(w: usize, h: usize) -> Image<u8> {
    let mut alpha = Image::<u8>::new(w, h);
    let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
    for y in 0..h {
        for x in 0..w {
            let nx = (x as f32 - cx) / (w as f32 * 0.28);
            let ny = (y as f32 - cy) / (h as f32 * 0.28);
            if nx * nx + ny * ny < 1.0 {
                alpha.set(x, y, 1);
            }
        }
    }
    alpha
}

// ============================================================
// Per-stage benchmarks
// ============================================================

fn bench_pyramid(c: &mut Criterion) {
    let (image, _) = make_scene(640, 480);

    let mut group = c.benchmark_group("pyramid");
    group.bench_function("downscale_2x_640x480", |b| {
        b.iter(|| downscale_rgba(&image, 320, 240))
    });
    group.bench_function("chain_to_160_640x480", |b| {
        b.iter(|| CoarseChain::build(&image, 160))
    });
    group.finish();
}

fn bench_model(c: &mut Criterion) {
    let (image, _) = make_scene(640, 480);
    let alpha = make_alpha(640, 480);

    let mut group = c.benchmark_group("model");
    for kind in [ModelKind::Gmm, ModelKind::Histogram] {
        group.bench_function(BenchmarkId::new("fit_640x480", format!("{kind:?}")), |b| {
            let mut model = make_model(kind);
            b.iter(|| model.update(&image, &alpha, ClusterPolicy::Recluster))
        });
    }
    group.finish();
}

fn bench_energy(c: &mut Criterion) {
    let (image, trimap) = make_scene(640, 480);
    let alpha = make_alpha(640, 480);
    let mut model = make_model(ModelKind::Gmm);
    model.update(&image, &alpha, ClusterPolicy::Recluster);

    let mut group = c.benchmark_group("energy");
    group.bench_function("data_term_640x480", |b| {
        b.iter(|| data_term(model.as_ref(), &image, &trimap))
    });
    for neighborhood in [Neighborhood::Four, Neighborhood::Eight] {
        group.bench_function(
            BenchmarkId::new("edge_cues_640x480", format!("{neighborhood:?}")),
            |b| b.iter(|| edge_cues(&image, EDGE_STRENGTH, neighborhood)),
        );
    }
    group.finish();
}

fn bench_graphcut(c: &mut Criterion) {
    let (image, trimap) = make_scene(320, 240);
    let alpha = make_alpha(320, 240);
    let mut model = make_model(ModelKind::Gmm);
    model.update(&image, &alpha, ClusterPolicy::Recluster);
    let terminals = data_term(model.as_ref(), &image, &trimap);

    let mut group = c.benchmark_group("graphcut");
    group.sample_size(20);
    for neighborhood in [Neighborhood::Four, Neighborhood::Eight] {
        let cues = edge_cues(&image, EDGE_STRENGTH, neighborhood);
        group.bench_function(
            BenchmarkId::new("dinic_320x240", format!("{neighborhood:?}")),
            |b| b.iter(|| GridDinic.solve(&terminals, &cues)),
        );
    }
    group.finish();
}

// ============================================================
// Full pipeline
// ============================================================

fn bench_pipeline(c: &mut Criterion) {
    let (image, trimap) = make_scene(320, 240);

    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);
    group.bench_function("cold_solve_320x240", |b| {
        b.iter(|| {
            let mut seg = Segmentation::new(&image, &trimap, SegConfig::default()).unwrap();
            seg.compute_segmentation_from_trimap().unwrap()
        })
    });
    group.bench_function("warm_pass_320x240", |b| {
        let mut seg = Segmentation::new(&image, &trimap, SegConfig::default()).unwrap();
        seg.compute_segmentation_from_trimap().unwrap();
        b.iter(|| seg.update_segmentation().unwrap())
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_pyramid,
    bench_model,
    bench_energy,
    bench_graphcut,
    bench_pipeline
);
criterion_main!(benches);
