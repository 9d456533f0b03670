// gpu/device.rs — wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and select the first non-CPU one.
//   - Expose a `DeviceProfile` for simulating embedded-target limits on a
//     development machine.
//   - Provide `WorkgroupSize` and ceiling-division dispatch sizing for 2D
//     image kernels.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics that
// may grab llvmpipe/softpipe on WSL2 (where the software renderer appears
// as a valid Vulkan device). We enumerate explicitly and prefer real
// hardware, falling back tier by tier.
//
// DEVICE LIMITS:
// Under a non-Native profile we request *lower* limits than the hardware
// supports. wgpu validates every dispatch and allocation against the
// requested limits, so a frame size that would fail on the embedded target
// fails on the development machine too.

use std::fmt;

/// Hardware profile controlling device limits and default workgroup sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// Use the adapter's actual hardware limits. No artificial caps.
    Native,
    /// Simulate an embedded Vulkan target (Jetson/mobile class): 256
    /// invocations per workgroup and a 128 MiB storage-buffer cap. Frames
    /// whose plane set exceeds the cap are rejected at allocation time
    /// instead of failing on the target.
    Embedded,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::Embedded => write!(f, "Embedded (simulated limits)"),
        }
    }
}

/// A workgroup size configuration for 2D compute dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Validated default for the given profile. 16x8 = 128 invocations on
    /// desktop hardware (4 NVIDIA warps, 2 AMD waves, x dimension on the
    /// cache line for row-major planes); 8x8 = 64 under the embedded cap.
    fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8 },
            DeviceProfile::Embedded => WorkgroupSize { x: 8, y: 8 },
        }
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {:?})",
            self.name, self.backend, self.device_type
        )
    }
}

/// The core GPU context: adapter, device, queue, and active profile.
///
/// Create once and hold for the lifetime of the application — Vulkan
/// instance and device initialization are expensive; every `Segmentation`
/// construction reuses the same context.
///
/// # Field drop order
/// Rust drops struct fields in declaration order. `_instance` is declared
/// last so the `wgpu::Instance` outlives `device` and `queue`; dzn (the
/// D3D12-to-Vulkan layer on WSL2) crashes if the Vulkan instance dies while
/// device-level objects still reference it.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    /// Keeps the `wgpu::Instance` alive until `device` and `queue` are
    /// dropped. Never accessed directly.
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// First non-CPU Vulkan adapter, `DeviceProfile::Native` limits.
    pub fn new() -> Result<Self, GpuError> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    /// Create a `GpuDevice` with an explicit hardware profile.
    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(profile))
    }

    async fn init_async(profile: DeviceProfile) -> Result<Self, GpuError> {
        // Vulkan only — no DX12, no Metal, no WebGPU. The noncompliant
        // flag lets wgpu enumerate dzn on WSL2, which is fine for
        // compute-only storage-buffer work.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let all_adapters: Vec<wgpu::Adapter> = instance
            .enumerate_adapters(wgpu::Backends::VULKAN)
            .into_iter()
            .collect();

        if all_adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }

        for a in &all_adapters {
            let info = a.get_info();
            eprintln!(
                "[segcut] Vulkan adapter: {} ({:?}, {:?})",
                info.name, info.backend, info.device_type
            );
        }

        // Tier 1: real hardware (or dzn/VM pass-through, which report as
        // Other/VirtualGpu). Tier 2: take whatever exists — the adapter
        // name was logged above so the fallback is visible.
        let adapter = all_adapters
            .into_iter()
            .find(|a| {
                matches!(
                    a.get_info().device_type,
                    wgpu::DeviceType::DiscreteGpu
                        | wgpu::DeviceType::IntegratedGpu
                        | wgpu::DeviceType::VirtualGpu
                        | wgpu::DeviceType::Other
                )
            })
            .or_else(|| {
                instance
                    .enumerate_adapters(wgpu::Backends::VULKAN)
                    .into_iter()
                    .next()
            })
            .ok_or(GpuError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        let limits = limits_for_profile(profile);

        // wgpu 22: request_device returns (Device, Queue) directly; the
        // tuple type must be spelled out to help the type inferencer.
        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("segcut"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        let workgroup_size = WorkgroupSize::for_profile(profile);

        Ok(GpuDevice {
            device,
            queue,
            profile,
            adapter_info,
            workgroup_size,
            _instance: instance,
        })
    }

    /// Override the default workgroup size, validated against the active
    /// profile's invocation limit.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<(), GpuError> {
        let total = x * y;
        let max = max_invocations_for_profile(self.profile);
        if total > max {
            return Err(GpuError::WorkgroupTooLarge { total, max });
        }
        self.workgroup_size = WorkgroupSize { x, y };
        Ok(())
    }

    /// The storage-buffer size cap enforced by the active profile.
    pub fn max_buffer_bytes(&self) -> u64 {
        limits_for_profile(self.profile).max_storage_buffer_binding_size as u64
    }

    /// Workgroup counts covering an image of the given size, ceiling
    /// division so partial edge workgroups are included. Shaders guard
    /// against out-of-bounds global IDs.
    pub fn dispatch_size(&self, img_w: u32, img_h: u32) -> (u32, u32) {
        let dx = (img_w + self.workgroup_size.x - 1) / self.workgroup_size.x;
        let dy = (img_h + self.workgroup_size.y - 1) / self.workgroup_size.y;
        (dx, dy)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, profile: {}, workgroup: {} }}",
            self.adapter_info, self.profile, self.workgroup_size
        )
    }
}

// ============================================================
// Limits helpers
// ============================================================

fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),

        DeviceProfile::Embedded => wgpu::Limits {
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            // 128 MiB of storage buffers: a 4K frame's full plane set fits,
            // 8K does not, matching embedded memory budgets.
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

fn max_invocations_for_profile(profile: DeviceProfile) -> u32 {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default().max_compute_invocations_per_workgroup,
        DeviceProfile::Embedded => 256,
    }
}

// ============================================================
// Error type
// ============================================================

/// Errors from GPU device initialization, configuration, and allocation.
#[derive(Debug)]
pub enum GpuError {
    /// No Vulkan adapter found. On WSL2: check that `vulkaninfo` shows a
    /// real GPU and not only llvmpipe.
    NoSuitableAdapter,
    /// wgpu device request failed (driver issue, unsupported limits).
    DeviceRequest(wgpu::RequestDeviceError),
    /// Requested workgroup size exceeds the profile's invocation limit.
    WorkgroupTooLarge { total: u32, max: u32 },
    /// A plane or scratch buffer exceeds the profile's storage-buffer cap.
    AllocationTooLarge { bytes: u64, max: u64 },
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::NoSuitableAdapter => write!(
                f,
                "no suitable Vulkan adapter found (only CPU/software renderers visible)"
            ),
            GpuError::DeviceRequest(e) => write!(f, "device request failed: {e}"),
            GpuError::WorkgroupTooLarge { total, max } => write!(
                f,
                "workgroup size {total} exceeds profile limit of {max} invocations"
            ),
            GpuError::AllocationTooLarge { bytes, max } => write!(
                f,
                "buffer of {bytes} bytes exceeds profile limit of {max} bytes"
            ),
        }
    }
}

impl std::error::Error for GpuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuError::DeviceRequest(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that require an actual GPU are behind `#[ignore]` so that
    // `cargo test` passes in CI without Vulkan. Run with:
    //   cargo test -- --include-ignored

    #[test]
    fn test_workgroup_defaults_per_profile() {
        let native = WorkgroupSize::for_profile(DeviceProfile::Native);
        assert_eq!((native.x, native.y), (16, 8));
        assert_eq!(native.total(), 128);

        let embedded = WorkgroupSize::for_profile(DeviceProfile::Embedded);
        assert_eq!((embedded.x, embedded.y), (8, 8));
        assert!(embedded.total() <= 256);
    }

    #[test]
    fn test_dispatch_size_ceiling() {
        let gpu = GpuDeviceStub::new(DeviceProfile::Native);
        // 16x8 workgroups over 640x480: exact multiples.
        assert_eq!(gpu.dispatch_size(640, 480), (40, 60));
        // 100x100: ceil(100/16) = 7, ceil(100/8) = 13. The last workgroups
        // run partially out of bounds; shaders guard on width/height.
        assert_eq!(gpu.dispatch_size(100, 100), (7, 13));
        // One pixel still gets one workgroup.
        assert_eq!(gpu.dispatch_size(1, 1), (1, 1));
    }

    #[test]
    fn test_embedded_limits_cap_resources() {
        let limits = limits_for_profile(DeviceProfile::Embedded);
        assert_eq!(limits.max_compute_invocations_per_workgroup, 256);
        assert_eq!(limits.max_storage_buffer_binding_size, 128 << 20);
    }

    #[test]
    fn test_native_limits_are_default() {
        let limits = limits_for_profile(DeviceProfile::Native);
        assert_eq!(limits, wgpu::Limits::default());
    }

    // ---- GPU integration tests (subprocess isolation) ----------------------
    //
    // dzn (D3D12-to-Vulkan on WSL2) SIGSEGVs in its own atexit cleanup when
    // a Vulkan device existed in the process, regardless of our drop order.
    // Each GPU test therefore runs in a child `cargo test` process; the
    // parent checks for the "GPU_TEST_OK" token in the output instead of
    // the exit status.

    #[cfg(test)]
    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args([
                "test",
                "--lib",
                "--",
                test_name,
                "--exact",
                "--ignored",
                "--nocapture",
            ])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    // Inner tests: the real assertions, run only inside the child process.

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_device_init_native() {
        let gpu = GpuDevice::new().expect("should initialise a Vulkan device");
        println!("{gpu}");
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_device_init_embedded_profile() {
        let gpu = GpuDevice::new_with_profile(DeviceProfile::Embedded)
            .expect("embedded profile should work on any Vulkan device");
        assert_eq!(gpu.profile, DeviceProfile::Embedded);
        assert_eq!(gpu.workgroup_size, WorkgroupSize { x: 8, y: 8 });
        assert_eq!(gpu.max_buffer_bytes(), 128 << 20);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_set_workgroup_size_too_large() {
        let mut gpu = GpuDevice::new_with_profile(DeviceProfile::Embedded).unwrap();
        let err = gpu.set_workgroup_size(16, 17).unwrap_err();
        assert!(matches!(
            err,
            GpuError::WorkgroupTooLarge { total: 272, max: 256 }
        ));
        println!("GPU_TEST_OK");
    }

    // Outer wrappers: run by default under --ignored, one subprocess each.

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_device_init_native() {
        let out = run_gpu_test_in_subprocess("gpu::device::tests::inner_device_init_native");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_device_init_embedded_profile() {
        let out =
            run_gpu_test_in_subprocess("gpu::device::tests::inner_device_init_embedded_profile");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_set_workgroup_size_too_large() {
        let out =
            run_gpu_test_in_subprocess("gpu::device::tests::inner_set_workgroup_size_too_large");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    // Stub: dispatch_size is a pure function of WorkgroupSize, no GPU
    // needed for the sizing tests.
    struct GpuDeviceStub {
        workgroup_size: WorkgroupSize,
    }

    impl GpuDeviceStub {
        fn new(profile: DeviceProfile) -> Self {
            GpuDeviceStub {
                workgroup_size: WorkgroupSize::for_profile(profile),
            }
        }

        fn dispatch_size(&self, img_w: u32, img_h: u32) -> (u32, u32) {
            let dx = (img_w + self.workgroup_size.x - 1) / self.workgroup_size.x;
            let dy = (img_h + self.workgroup_size.y - 1) / self.workgroup_size.y;
            (dx, dy)
        }
    }
}
