// gpu/buffers.rs — Device plane set for one working resolution.
//
// Every plane is a storage buffer of 4-byte elements (packed RGBA word,
// widened mask word, or i32 capacity) with a 256-byte-aligned row pitch.
// The pitch travels with the plane and is threaded through every kernel
// dispatch; no kernel ever assumes two planes share a pitch.
//
// Allocation is atomic from the caller's view: every size is validated
// against the profile's storage-buffer cap before any buffer is created,
// so a failed allocation leaks nothing. `release()` is idempotent and is
// also called from `Drop`; the `PlaneLedger` counts both directions so
// tests can assert the set stays symmetric under every exit path.
//
// The scratch buffer is shared by the model-accumulation and solver
// stages, sized once for the worst consumer.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::gpu::device::{GpuDevice, GpuError};
use crate::image::{Image, Rgba8};
use crate::model::{COLOR_CLUSTERS, GMM_COMPONENT_FLOATS, HISTOGRAM_BINS};

/// Tile edge for per-block model accumulation. One scratch slot per
/// 32x32 image block.
pub const BLOCK_DIM: u32 = 32;

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}

/// Row pitch in elements for a plane of 4-byte elements: the row byte size
/// rounded up to `COPY_BYTES_PER_ROW_ALIGNMENT` so buffer-to-buffer row
/// copies and readbacks need no repacking.
#[inline]
pub fn aligned_pitch(width: u32) -> u32 {
    align_to(width * 4, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) / 4
}

/// Accumulation blocks covering a plane.
#[inline]
pub fn model_blocks(width: u32, height: u32) -> u64 {
    let bx = (width + BLOCK_DIM - 1) / BLOCK_DIM;
    let by = (height + BLOCK_DIM - 1) / BLOCK_DIM;
    bx as u64 * by as u64
}

/// GMM accumulation scratch: per block, one serialized component slot per
/// component of both classes, plus one count word per block.
pub fn gmm_scratch_bytes(width: u32, height: u32) -> u64 {
    let blocks = model_blocks(width, height);
    let components = 2 * COLOR_CLUSTERS as u64;
    blocks * (GMM_COMPONENT_FLOATS as u64 * 4) * components + blocks * 4
}

/// Histogram accumulation scratch: both classes' bins as u32 counters.
pub fn histogram_scratch_bytes() -> u64 {
    2 * HISTOGRAM_BINS as u64 * 4
}

/// Solver bookkeeping scratch, linear in pixel count (four words per
/// node).
pub fn graphcut_scratch_bytes(width: u32, height: u32) -> u64 {
    width as u64 * height as u64 * 16
}

/// The shared scratch allocation: sized for the worst of its consumers.
pub fn scratch_bytes(width: u32, height: u32) -> u64 {
    gmm_scratch_bytes(width, height)
        .max(histogram_scratch_bytes())
        .max(graphcut_scratch_bytes(width, height))
}

// ---------------------------------------------------------------------------
// PlaneLedger
// ---------------------------------------------------------------------------

static PLANES_ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static PLANES_RELEASED: AtomicUsize = AtomicUsize::new(0);

/// Process-wide allocate/release counters for device planes. Tests assert
/// the two sides stay balanced across solve and crop paths.
pub struct PlaneLedger;

impl PlaneLedger {
    pub fn allocated() -> usize {
        PLANES_ALLOCATED.load(Ordering::SeqCst)
    }

    pub fn released() -> usize {
        PLANES_RELEASED.load(Ordering::SeqCst)
    }

    /// Planes currently live.
    pub fn live() -> usize {
        Self::allocated() - Self::released()
    }

    fn count_allocated(n: usize) {
        PLANES_ALLOCATED.fetch_add(n, Ordering::SeqCst);
    }

    fn count_released(n: usize) {
        PLANES_RELEASED.fetch_add(n, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Plane
// ---------------------------------------------------------------------------

/// One pitched storage buffer of 4-byte elements.
pub struct Plane {
    pub buffer: wgpu::Buffer,
    pub width: u32,
    pub height: u32,
    /// Row stride in elements.
    pub pitch: u32,
}

impl Plane {
    fn create(device: &wgpu::Device, width: u32, height: u32, label: &str) -> Self {
        let pitch = aligned_pitch(width);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: plane_bytes(width, height),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Plane {
            buffer,
            width,
            height,
            pitch,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.pitch as u64 * self.height as u64 * 4
    }
}

/// Byte size of a pitched plane before creating it, for the atomic
/// pre-validation pass.
pub fn plane_bytes(width: u32, height: u32) -> u64 {
    aligned_pitch(width) as u64 * height as u64 * 4
}

// ---------------------------------------------------------------------------
// BufferSet
// ---------------------------------------------------------------------------

/// Every device plane the pipeline needs at one working resolution:
/// the packed color frame, the trimap, both alpha planes, the terminal
/// plane, the six directional capacity planes, the two transposed
/// horizontal planes, and the shared scratch buffer.
pub struct BufferSet {
    pub image: Plane,
    pub trimap: Plane,
    pub alpha: [Plane; 2],
    pub terminals: Plane,
    pub top: Plane,
    pub bottom: Plane,
    pub topleft: Plane,
    pub topright: Plane,
    pub bottomleft: Plane,
    pub bottomright: Plane,
    /// Transposed horizontal planes: height x width, indexed (y, x).
    pub left_t: Plane,
    pub right_t: Plane,
    pub scratch: wgpu::Buffer,
    pub scratch_size: u64,
    pub width: u32,
    pub height: u32,
    released: bool,
}

/// Buffers per set, ledger units: 13 planes plus scratch.
const PLANES_PER_SET: usize = 14;

impl BufferSet {
    /// Allocate the full plane set, validating every size against the
    /// device profile's storage-buffer cap before creating anything.
    pub fn allocate(gpu: &GpuDevice, width: u32, height: u32) -> Result<Self, GpuError> {
        assert!(width > 0 && height > 0, "BufferSet: empty dimensions");
        let max = gpu.max_buffer_bytes();
        let row_major = plane_bytes(width, height);
        let transposed = plane_bytes(height, width);
        let scratch_size = scratch_bytes(width, height);
        for bytes in [row_major, transposed, scratch_size] {
            if bytes > max {
                return Err(GpuError::AllocationTooLarge { bytes, max });
            }
        }

        let d = &gpu.device;
        let set = BufferSet {
            image: Plane::create(d, width, height, "segcut image"),
            trimap: Plane::create(d, width, height, "segcut trimap"),
            alpha: [
                Plane::create(d, width, height, "segcut alpha 0"),
                Plane::create(d, width, height, "segcut alpha 1"),
            ],
            terminals: Plane::create(d, width, height, "segcut terminals"),
            top: Plane::create(d, width, height, "segcut top"),
            bottom: Plane::create(d, width, height, "segcut bottom"),
            topleft: Plane::create(d, width, height, "segcut topleft"),
            topright: Plane::create(d, width, height, "segcut topright"),
            bottomleft: Plane::create(d, width, height, "segcut bottomleft"),
            bottomright: Plane::create(d, width, height, "segcut bottomright"),
            left_t: Plane::create(d, height, width, "segcut left_t"),
            right_t: Plane::create(d, height, width, "segcut right_t"),
            scratch: d.create_buffer(&wgpu::BufferDescriptor {
                label: Some("segcut scratch"),
                size: scratch_size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }),
            scratch_size,
            width,
            height,
            released: false,
        };
        PlaneLedger::count_allocated(PLANES_PER_SET);
        Ok(set)
    }

    /// Free every plane. Safe to call more than once; `Drop` calls it too.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.image.buffer.destroy();
        self.trimap.buffer.destroy();
        self.alpha[0].buffer.destroy();
        self.alpha[1].buffer.destroy();
        self.terminals.buffer.destroy();
        self.top.buffer.destroy();
        self.bottom.buffer.destroy();
        self.topleft.buffer.destroy();
        self.topright.buffer.destroy();
        self.bottomleft.buffer.destroy();
        self.bottomright.buffer.destroy();
        self.left_t.buffer.destroy();
        self.right_t.buffer.destroy();
        self.scratch.destroy();
        PlaneLedger::count_released(PLANES_PER_SET);
        self.released = true;
    }
}

impl Drop for BufferSet {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Uploads and readbacks
// ---------------------------------------------------------------------------

/// Upload a mask plane, widening each u8 label to a u32 word at the
/// plane's pitch.
pub fn upload_mask_plane(gpu: &GpuDevice, plane: &Plane, src: &Image<u8>) {
    assert_eq!(src.width() as u32, plane.width);
    assert_eq!(src.height() as u32, plane.height);
    let mut staging = vec![0u32; (plane.pitch * plane.height) as usize];
    for y in 0..plane.height as usize {
        let dst = y * plane.pitch as usize;
        for (x, &v) in src.row(y).iter().enumerate() {
            staging[dst + x] = v as u32;
        }
    }
    gpu.queue
        .write_buffer(&plane.buffer, 0, bytemuck::cast_slice(&staging));
}

/// Upload the color frame, one packed RGBA word per pixel.
pub fn upload_image_plane(gpu: &GpuDevice, plane: &Plane, src: &Image<Rgba8>) {
    assert_eq!(src.width() as u32, plane.width);
    assert_eq!(src.height() as u32, plane.height);
    let mut staging = vec![0u32; (plane.pitch * plane.height) as usize];
    for y in 0..plane.height as usize {
        let dst = y * plane.pitch as usize;
        let row: &[u32] = bytemuck::cast_slice(src.row(y));
        staging[dst..dst + plane.width as usize].copy_from_slice(row);
    }
    gpu.queue
        .write_buffer(&plane.buffer, 0, bytemuck::cast_slice(&staging));
}

/// Upload an i32 capacity plane at the plane's pitch.
pub fn upload_i32_plane(gpu: &GpuDevice, plane: &Plane, src: &Image<i32>) {
    assert_eq!(src.width() as u32, plane.width);
    assert_eq!(src.height() as u32, plane.height);
    let mut staging = vec![0i32; (plane.pitch * plane.height) as usize];
    for y in 0..plane.height as usize {
        let dst = y * plane.pitch as usize;
        staging[dst..dst + plane.width as usize].copy_from_slice(src.row(y));
    }
    gpu.queue
        .write_buffer(&plane.buffer, 0, bytemuck::cast_slice(&staging));
}

/// Read a whole buffer back to host memory. Expensive and synchronous;
/// used by the host solver seam, model finalization, and tests.
fn readback_bytes(gpu: &GpuDevice, buffer: &wgpu::Buffer, size: u64) -> Vec<u8> {
    let readback = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("segcut readback"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("segcut readback"),
        });
    encoder.copy_buffer_to_buffer(buffer, 0, &readback, 0, size);
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let slice = readback.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        tx.send(r).expect("readback channel closed");
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .expect("readback callback never fired")
        .expect("readback map failed");

    let mapped = slice.get_mapped_range();
    let out = mapped.to_vec();
    drop(mapped);
    readback.unmap();
    out
}

/// Read a mask plane back, narrowing each u32 word to u8 and stripping
/// the pitch.
pub fn readback_mask_plane(gpu: &GpuDevice, plane: &Plane) -> Image<u8> {
    let bytes = readback_bytes(gpu, &plane.buffer, plane.size_bytes());
    let words: &[u32] = bytemuck::cast_slice(&bytes);
    let mut out = Image::<u8>::new(plane.width as usize, plane.height as usize);
    for y in 0..plane.height as usize {
        let src = y * plane.pitch as usize;
        for x in 0..plane.width as usize {
            out.set(x, y, words[src + x] as u8);
        }
    }
    out
}

/// Read an i32 capacity plane back, stripping the pitch.
pub fn readback_i32_plane(gpu: &GpuDevice, plane: &Plane) -> Image<i32> {
    let bytes = readback_bytes(gpu, &plane.buffer, plane.size_bytes());
    let words: &[i32] = bytemuck::cast_slice(&bytes);
    let mut out = Image::<i32>::new(plane.width as usize, plane.height as usize);
    for y in 0..plane.height as usize {
        let src = y * plane.pitch as usize;
        out.row_mut(y)
            .copy_from_slice(&words[src..src + plane.width as usize]);
    }
    out
}

/// Read the first `count` f32 words of the scratch buffer (model
/// accumulation results).
pub fn readback_scratch_f32(gpu: &GpuDevice, set: &BufferSet, count: usize) -> Vec<f32> {
    let bytes = readback_bytes(gpu, &set.scratch, (count * 4) as u64);
    bytemuck::cast_slice(&bytes).to_vec()
}

/// Read the first `count` u32 words of the scratch buffer (histogram
/// counters).
pub fn readback_scratch_u32(gpu: &GpuDevice, set: &BufferSet, count: usize) -> Vec<u32> {
    let bytes = readback_bytes(gpu, &set.scratch, (count * 4) as u64);
    bytemuck::cast_slice(&bytes).to_vec()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_pitch() {
        // 4-byte elements: 64 elements per 256-byte boundary.
        assert_eq!(aligned_pitch(64), 64);
        assert_eq!(aligned_pitch(1), 64);
        assert_eq!(aligned_pitch(65), 128);
        assert_eq!(aligned_pitch(640), 640);
        assert_eq!(aligned_pitch(641), 704);
    }

    #[test]
    fn test_model_blocks_ceiling() {
        assert_eq!(model_blocks(32, 32), 1);
        assert_eq!(model_blocks(33, 32), 2);
        assert_eq!(model_blocks(64, 64), 4);
        assert_eq!(model_blocks(1, 1), 1);
    }

    #[test]
    fn test_gmm_scratch_formula() {
        // One block, four components of 11 floats, one count word.
        let one_block = (GMM_COMPONENT_FLOATS as u64 * 4) * (2 * COLOR_CLUSTERS as u64) + 4;
        assert_eq!(gmm_scratch_bytes(32, 32), one_block);
        assert_eq!(gmm_scratch_bytes(64, 64), 4 * one_block);
    }

    #[test]
    fn test_scratch_covers_every_consumer() {
        for &(w, h) in &[(16u32, 16u32), (64, 64), (640, 480), (1920, 1080)] {
            let s = scratch_bytes(w, h);
            assert!(s >= gmm_scratch_bytes(w, h));
            assert!(s >= histogram_scratch_bytes());
            assert!(s >= graphcut_scratch_bytes(w, h));
        }
        // Tiny planes are still large enough for the histogram.
        assert!(scratch_bytes(2, 2) >= histogram_scratch_bytes());
    }

    #[test]
    fn test_plane_bytes_uses_pitch() {
        // width 1 still pays a full 256-byte row.
        assert_eq!(plane_bytes(1, 4), 256 * 4);
        assert_eq!(plane_bytes(64, 2), 64 * 4 * 2);
    }

    // ---- GPU integration tests (subprocess-isolated) -----------------------

    #[cfg(test)]
    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args([
                "test", "--lib", "--",
                test_name, "--exact", "--ignored", "--nocapture",
            ])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_allocate_release_symmetric() {
        use crate::gpu::device::GpuDevice;
        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        let live_before = PlaneLedger::live();

        let mut set = BufferSet::allocate(&gpu, 100, 60).expect("allocate");
        assert_eq!(PlaneLedger::live(), live_before + 14);

        // release() is idempotent; Drop must not double count.
        set.release();
        set.release();
        assert_eq!(PlaneLedger::live(), live_before);
        drop(set);
        assert_eq!(PlaneLedger::live(), live_before);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_allocation_too_large_leaks_nothing() {
        use crate::gpu::device::{DeviceProfile, GpuDevice};
        let gpu = GpuDevice::new_with_profile(DeviceProfile::Embedded).expect("need Vulkan GPU");
        let live_before = PlaneLedger::live();
        // 16k x 16k: one i32 plane alone is 1 GiB, past the 128 MiB cap.
        let err = match BufferSet::allocate(&gpu, 16384, 16384) {
            Ok(_) => panic!("allocation past the cap must fail"),
            Err(e) => e,
        };
        assert!(matches!(err, GpuError::AllocationTooLarge { .. }));
        assert_eq!(PlaneLedger::live(), live_before);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_plane_upload_round_trip() {
        use crate::gpu::device::GpuDevice;
        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        let set = BufferSet::allocate(&gpu, 33, 7).expect("allocate");

        // Mask plane with a stride on the CPU side too.
        let mut mask = Image::<u8>::new_with_stride(33, 7, 40);
        for y in 0..7 {
            for x in 0..33 {
                mask.set(x, y, ((x * 7 + y * 3) % 251) as u8);
            }
        }
        upload_mask_plane(&gpu, &set.alpha[0], &mask);
        let back = readback_mask_plane(&gpu, &set.alpha[0]);
        assert!(crate::mask::planes_equal(&mask, &back));

        let mut caps = Image::<i32>::new(33, 7);
        for y in 0..7 {
            for x in 0..33 {
                caps.set(x, y, (x as i32 - 16) * 1000 + y as i32);
            }
        }
        upload_i32_plane(&gpu, &set.terminals, &caps);
        let back = readback_i32_plane(&gpu, &set.terminals);
        for (x, y, v) in caps.pixels() {
            assert_eq!(back.get(x, y), v);
        }
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_allocate_release_symmetric() {
        let out =
            run_gpu_test_in_subprocess("gpu::buffers::tests::inner_allocate_release_symmetric");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_allocation_too_large_leaks_nothing() {
        let out = run_gpu_test_in_subprocess(
            "gpu::buffers::tests::inner_allocation_too_large_leaks_nothing",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_plane_upload_round_trip() {
        let out =
            run_gpu_test_in_subprocess("gpu::buffers::tests::inner_plane_upload_round_trip");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
