// segcut: GPU-accelerated interactive foreground/background segmentation.
//
// A GrabCut-style pipeline: given a color frame and a sparse trimap
// (definite foreground / definite background / unknown), produce a binary
// alpha mask by alternating appearance-model estimation with a global
// min-cut solve over the pixel grid, seeded coarse-to-fine through an
// image pyramid.
//
// The CPU modules in this crate are the authoritative reference
// implementation. The `gpu` module is a wgpu compute port of the same
// pipeline, validated against the CPU results.
//
// Reference: Rother, Kolmogorov, Blake, "GrabCut: Interactive Foreground
// Extraction using Iterated Graph Cuts" (SIGGRAPH 2004).

pub mod image;
pub mod mask;
pub mod pyramid;
pub mod model;
pub mod energy;
pub mod graphcut;
pub mod engine;

pub mod gpu;
