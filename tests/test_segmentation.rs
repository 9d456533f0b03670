// tests/test_segmentation.rs — Integration tests for the full segmentation
// pipeline: seeding, refinement, warm restarts, and the crop solver.
//
// The scenes here are synthetic two-tone frames: the color statistics are
// extreme enough that the GMM separates foreground from background in one
// or two passes, so the structural claims (convergence, idempotence, crop
// isolation) hold regardless of the cut's exact boundary pixels.

use segcut::energy::Neighborhood;
use segcut::engine::{SegConfig, SegError, Segmentation, SolveState};
use segcut::image::{Image, Rgba8};
use segcut::mask::{
    planes_equal, TRIMAP_BACKGROUND, TRIMAP_FOREGROUND, TRIMAP_UNKNOWN,
};
use segcut::pyramid::halving_schedule;

/// Red disk on blue ground with foreground/background hints.
fn disk_scene(w: usize, h: usize, radius: i32) -> (Image<Rgba8>, Image<u8>) {
    let (cx, cy) = (w as i32 / 2, h as i32 / 2);
    let mut image = Image::<Rgba8>::new(w, h);
    let mut trimap = Image::<u8>::new(w, h);
    trimap.fill(TRIMAP_UNKNOWN);
    for y in 0..h {
        for x in 0..w {
            let dx = x as i32 - cx;
            let dy = y as i32 - cy;
            if dx * dx + dy * dy < radius * radius {
                image.set(x, y, Rgba8::new(210, 40, 40));
            } else {
                image.set(x, y, Rgba8::new(40, 40, 210));
            }
        }
    }
    // A small hint square at the disk center, hard background at the top
    // and bottom rows.
    for y in (cy as usize - 2)..(cy as usize + 2) {
        for x in (cx as usize - 2)..(cx as usize + 2) {
            trimap.set(x, y, TRIMAP_FOREGROUND);
        }
    }
    for x in 0..w {
        trimap.set(x, 0, TRIMAP_BACKGROUND);
        trimap.set(x, h - 1, TRIMAP_BACKGROUND);
    }
    (image, trimap)
}

/// Flood fill over nonzero alpha pixels, eight-connected. Returns the
/// number of pixels reached from the start point.
fn connected_count(alpha: &Image<u8>, start: (usize, usize)) -> usize {
    let (w, h) = (alpha.width(), alpha.height());
    let mut seen = vec![false; w * h];
    let mut stack = vec![start];
    let mut count = 0;
    while let Some((x, y)) = stack.pop() {
        if seen[y * w + x] || alpha.get(x, y) == 0 {
            continue;
        }
        seen[y * w + x] = true;
        count += 1;
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                let nx = x as i32 + dx;
                let ny = y as i32 + dy;
                if nx >= 0 && ny >= 0 && (nx as usize) < w && (ny as usize) < h {
                    stack.push((nx as usize, ny as usize));
                }
            }
        }
    }
    count
}

// ===== Pyramid schedule law =====

#[test]
fn schedule_halves_down_to_target() {
    let schedule = halving_schedule(640, 480, 160);
    assert!(!schedule.is_empty());

    // Each level is the ceil-half of its predecessor, starting from the
    // full frame.
    let (mut pw, mut ph) = (640usize, 480usize);
    for &(w, h) in &schedule {
        assert_eq!(w, pw.div_ceil(2));
        assert_eq!(h, ph.div_ceil(2));
        pw = w;
        ph = h;
    }

    // Only the last level fits under the target dimension.
    let (lw, lh) = *schedule.last().unwrap();
    assert!(lw.max(lh) <= 160);
    if schedule.len() > 1 {
        let (sw, sh) = schedule[schedule.len() - 2];
        assert!(sw.max(sh) > 160);
    }
}

#[test]
fn schedule_never_empty_for_tiny_frames() {
    // Frames already under the target still get one halving; the seeded
    // solve always runs at a strictly coarser level.
    let schedule = halving_schedule(8, 6, 16);
    assert_eq!(schedule, vec![(4, 3)]);

    let schedule = halving_schedule(1, 1, 1);
    assert_eq!(schedule, vec![(1, 1)]);
}

// ===== Full solve =====

#[test]
fn solve_terminates_within_pass_cap() {
    let (image, trimap) = disk_scene(48, 36, 10);
    let config = SegConfig {
        refine_passes: 10,
        max_iterations: 10,
        ..SegConfig::default()
    };
    let mut seg = Segmentation::new(&image, &trimap, config).unwrap();
    let report = seg.compute_segmentation_from_trimap().unwrap();

    assert!(report.iterations >= 1 && report.iterations <= 10);
    assert!(matches!(
        report.state,
        SolveState::Converged | SolveState::IterationLimit
    ));
    // This scene separates cleanly; the loop should stop early.
    assert_eq!(report.state, SolveState::Converged);
}

#[test]
fn alpha_holds_only_binary_labels() {
    let (image, trimap) = disk_scene(48, 36, 10);
    let mut seg = Segmentation::new(&image, &trimap, SegConfig::default()).unwrap();
    seg.compute_segmentation_from_trimap().unwrap();
    assert!(seg.alpha().pixels().all(|(_, _, v)| v == 0 || v == 1));
}

#[test]
fn disk_is_segmented_with_both_neighborhoods() {
    for neighborhood in [Neighborhood::Four, Neighborhood::Eight] {
        let (image, trimap) = disk_scene(48, 36, 10);
        let config = SegConfig {
            neighborhood,
            ..SegConfig::default()
        };
        let mut seg = Segmentation::new(&image, &trimap, config).unwrap();
        seg.compute_segmentation_from_trimap().unwrap();

        assert_eq!(seg.alpha().get(24, 18), 1, "{neighborhood:?}: center");
        assert_eq!(seg.alpha().get(2, 2), 0, "{neighborhood:?}: corner");
        assert_eq!(seg.alpha().get(45, 33), 0, "{neighborhood:?}: corner");
    }
}

#[test]
fn uniform_gray_keeps_hint_connected() {
    // No color evidence at all: a 16x16 hint square inside a uniform gray
    // frame. The smoothness term must not shred the hint; every labeled
    // foreground pixel stays in one eight-connected blob around it.
    let (w, h) = (64, 64);
    let mut image = Image::<Rgba8>::new(w, h);
    image.fill(Rgba8::gray(128));
    let mut trimap = Image::<u8>::new(w, h);
    trimap.fill(TRIMAP_UNKNOWN);
    for y in 24..40 {
        for x in 24..40 {
            trimap.set(x, y, TRIMAP_FOREGROUND);
        }
    }

    let mut seg = Segmentation::new(&image, &trimap, SegConfig::default()).unwrap();
    seg.compute_segmentation_from_trimap().unwrap();

    for y in 24..40 {
        for x in 24..40 {
            assert_eq!(seg.alpha().get(x, y), 1, "hint pixel ({x},{y}) lost");
        }
    }
    let total: usize = seg
        .alpha()
        .pixels()
        .filter(|&(_, _, v)| v != 0)
        .count();
    assert_eq!(connected_count(seg.alpha(), (30, 30)), total);
}

// ===== Warm restarts =====

#[test]
fn warm_pass_is_idempotent() {
    let (image, trimap) = disk_scene(48, 36, 10);
    let mut seg = Segmentation::new(&image, &trimap, SegConfig::default()).unwrap();
    seg.compute_segmentation_from_trimap().unwrap();
    let settled = seg.alpha().clone();

    for _ in 0..3 {
        let report = seg.update_segmentation().unwrap();
        assert_eq!(report.state, SolveState::Converged);
        assert_eq!(report.iterations, 1);
        assert!(planes_equal(&settled, seg.alpha()));
    }
}

#[test]
fn warm_pass_before_solve_is_rejected() {
    let (image, trimap) = disk_scene(48, 36, 10);
    let mut seg = Segmentation::new(&image, &trimap, SegConfig::default()).unwrap();
    assert_eq!(seg.update_segmentation(), Err(SegError::NotReady));
}

#[test]
fn trimap_edit_flows_into_warm_pass() {
    let (image, mut trimap) = disk_scene(48, 36, 10);
    let mut seg = Segmentation::new(&image, &trimap, SegConfig::default()).unwrap();
    seg.compute_segmentation_from_trimap().unwrap();
    assert_eq!(seg.alpha().get(24, 18), 1);

    // Hard-background scribble over the disk center wins over the model.
    for y in 16..21 {
        for x in 22..27 {
            trimap.set(x, y, TRIMAP_BACKGROUND);
        }
    }
    seg.update_trimap(&trimap);
    seg.update_segmentation().unwrap();
    assert_eq!(seg.alpha().get(24, 18), 0);
}

// ===== Frame replacement =====

#[test]
fn update_image_then_solve_tracks_content() {
    let (image, trimap) = disk_scene(48, 36, 10);
    let mut seg = Segmentation::new(&image, &trimap, SegConfig::default()).unwrap();
    seg.compute_segmentation_from_trimap().unwrap();

    // Same dimensions, disk pulled toward the hint from a new frame.
    let (moved, _) = disk_scene(48, 36, 12);
    seg.update_image(&moved);
    let report = seg.compute_segmentation_from_trimap().unwrap();

    assert!(report.iterations >= 1);
    assert_eq!(seg.alpha().get(24, 18), 1);
    assert_eq!(seg.alpha().get(2, 2), 0);
    assert!(seg.alpha().pixels().all(|(_, _, v)| v == 0 || v == 1));
}

// ===== Crop solver =====

#[test]
fn crop_solve_is_isolated_from_full_planes() {
    let (image, trimap) = disk_scene(48, 36, 10);
    let mut seg = Segmentation::new(&image, &trimap, SegConfig::default()).unwrap();
    seg.compute_segmentation_from_trimap().unwrap();
    let before = seg.alpha().clone();

    let crop_image = image.crop_region(12, 9, 24, 18);
    let crop_trimap = trimap.crop_region(12, 9, 24, 18);
    seg.update_image_crop(&crop_image, 12, 9).unwrap();
    seg.update_trimap_crop(&crop_trimap, 12, 9).unwrap();
    let mask = seg.compute_segmentation_crop().unwrap().expect("staged crop");

    assert_eq!((mask.width(), mask.height()), (24, 18));
    assert!(mask.pixels().all(|(_, _, v)| v == 0 || v == 1));
    // Disk center sits at (24, 18) in frame space, (12, 9) in crop space.
    assert_eq!(mask.get(12, 9), 1);

    // The full-resolution planes are untouched by a crop solve.
    assert!(planes_equal(&before, seg.alpha()));
}

#[test]
fn crop_needs_both_planes_and_a_prior_solve() {
    let (image, trimap) = disk_scene(48, 36, 10);
    let mut seg = Segmentation::new(&image, &trimap, SegConfig::default()).unwrap();

    let crop_image = image.crop_region(0, 0, 16, 12);
    let crop_trimap = trimap.crop_region(0, 0, 16, 12);
    seg.update_image_crop(&crop_image, 0, 0).unwrap();
    seg.update_trimap_crop(&crop_trimap, 0, 0).unwrap();

    // Staged but never solved: no model to evaluate against.
    assert!(seg.compute_segmentation_crop().unwrap().is_none());

    seg.compute_segmentation_from_trimap().unwrap();
    assert!(seg.compute_segmentation_crop().unwrap().is_some());
}

#[test]
fn crop_rects_are_validated_against_the_frame() {
    let (image, trimap) = disk_scene(48, 36, 10);
    let mut seg = Segmentation::new(&image, &trimap, SegConfig::default()).unwrap();

    let crop = Image::<Rgba8>::new(16, 12);
    match seg.update_image_crop(&crop, 40, 30) {
        Err(SegError::DimensionMismatch { expected, got }) => {
            assert_eq!(expected, (48, 36));
            assert_eq!(got, (56, 42));
        }
        other => panic!("expected DimensionMismatch, got {other:?}"),
    }

    let empty = Image::<u8>::new(0, 12);
    assert_eq!(seg.update_trimap_crop(&empty, 0, 0), Err(SegError::EmptyInput));
}
