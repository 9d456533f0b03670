// gpu/mod.rs — wgpu compute port of the segmentation pipeline.
//
// The CPU modules in the parent crate are the authoritative reference;
// every kernel here is validated against them pixel for pixel. The split
// of work:
//
//   GPU: plane storage, pyramid downscale, alpha seeding/thresholding,
//        edge-cue construction, data-term evaluation, model accumulation.
//   CPU: model finalization (3x3 covariance inverses over a handful of
//        components), the min-cut itself via the `DeviceMinCut` seam, and
//        orchestration between passes.
//
// The min-cut stays behind a trait because a device-resident solver is a
// project of its own; the bundled `HostGridCut` reads the capacity planes
// back, runs the reference solver, and uploads the labels. Everything
// around it already runs on the device, so swapping in a GPU solver
// touches nothing but the trait implementation.

pub mod buffers;
pub mod device;
pub mod engine;
pub mod kernels;
