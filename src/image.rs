// image.rs — Runtime-sized image container, generic over pixel type.
//
// Row-major, contiguous buffer with explicit stride. The stride (row pitch
// in elements, not bytes) may exceed the width: GPU allocators pad rows for
// alignment, and the CPU reference mirrors that layout so pitch handling is
// exercised on both paths.
//
// Memory layout (stride = 5, width = 4):
//
//   data index:  0  1  2  3 [4]  5  6  7  8 [9] 10 11 12 13 [14]
//   pixel:       ■  ■  ■  ■  ·   ■  ■  ■  ■  ·   ■  ■  ■  ■  ·
//   row:         |--- row 0 ---|  |--- row 1 ---|  |--- row 2 ---|
//
//   [4], [9], [14] are padding elements, never touched by pixel ops.

use std::fmt;

// ---------------------------------------------------------------------------
// Pixel trait
// ---------------------------------------------------------------------------

/// Trait for types that can serve as pixel values in an `Image`.
///
/// Bounds: `Copy` (trivially copyable), `Default` (zero value for `new()`),
/// `PartialEq` (plane comparison for the convergence check), `Send + Sync +
/// 'static` (planes cross no thread boundary today, but the bounds cost
/// nothing and keep the container future-proof).
pub trait Pixel: Copy + Default + PartialEq + Send + Sync + 'static {}

impl Pixel for u8 {}
impl Pixel for i32 {}
impl Pixel for u32 {}
impl Pixel for f32 {}

/// A 4-channel 8-bit color sample, the frame element type.
///
/// Channel order is RGBA. The alpha channel is carried but ignored by the
/// segmentation math (the reference engine works on `uchar4` the same way).
#[repr(C)]
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Rgba8(pub [u8; 4]);

impl Pixel for Rgba8 {}

impl Rgba8 {
    #[inline]
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Rgba8([r, g, b, 255])
    }

    /// Gray pixel, all three color channels equal.
    #[inline]
    pub fn gray(v: u8) -> Self {
        Rgba8([v, v, v, 255])
    }

    #[inline]
    pub fn r(self) -> f32 {
        self.0[0] as f32
    }

    #[inline]
    pub fn g(self) -> f32 {
        self.0[1] as f32
    }

    #[inline]
    pub fn b(self) -> f32 {
        self.0[2] as f32
    }

    /// Squared Euclidean distance in RGB space (alpha ignored).
    #[inline]
    pub fn dist_sq(self, other: Rgba8) -> f32 {
        let dr = self.r() - other.r();
        let dg = self.g() - other.g();
        let db = self.b() - other.b();
        dr * dr + dg * dg + db * db
    }

    /// Rec. 601 luma, used for deterministic component seeding.
    #[inline]
    pub fn luma(self) -> f32 {
        0.299 * self.r() + 0.587 * self.g() + 0.114 * self.b()
    }
}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// A 2D image with runtime dimensions, generic over pixel type `T`.
pub struct Image<T: Pixel> {
    /// Pixel data in row-major order. Length = height * stride.
    data: Vec<T>,
    width: usize,
    height: usize,
    /// Row stride in *elements* (not bytes). stride >= width.
    stride: usize,
}

// Deep copy of heap data; implemented manually to make the cost explicit.
impl<T: Pixel> Clone for Image<T> {
    fn clone(&self) -> Self {
        Image {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
            stride: self.stride,
        }
    }
}

impl<T: Pixel> Image<T> {
    // --- Constructors ---

    /// Zero-initialized image, stride equal to width (no padding).
    pub fn new(width: usize, height: usize) -> Self {
        Self::new_with_stride(width, height, width)
    }

    /// Zero-initialized image with an explicit stride.
    ///
    /// # Panics
    /// Panics if `stride < width`.
    pub fn new_with_stride(width: usize, height: usize, stride: usize) -> Self {
        assert!(
            stride >= width,
            "stride ({stride}) must be >= width ({width})"
        );
        Image {
            data: vec![T::default(); height * stride],
            width,
            height,
            stride,
        }
    }

    /// Image from an existing pixel vector, stride equal to width.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image {
            data,
            width,
            height,
            stride: width,
        }
    }

    /// Image from raw data with an explicit stride.
    ///
    /// # Panics
    /// Panics if `data.len() != height * stride` or `stride < width`.
    pub fn from_vec_with_stride(
        width: usize,
        height: usize,
        stride: usize,
        data: Vec<T>,
    ) -> Self {
        assert!(stride >= width, "stride ({stride}) must be >= width ({width})");
        assert_eq!(
            data.len(),
            height * stride,
            "data length ({}) must equal height * stride ({})",
            data.len(),
            height * stride,
        );
        Image {
            data,
            width,
            height,
            stride,
        }
    }

    // --- Accessors ---

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Pixel value at (x, y). x is column, y is row.
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.bounds_check(x, y);
        self.data[y * self.stride + x]
    }

    /// Set the pixel at (x, y).
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        self.bounds_check(x, y);
        let idx = y * self.stride + x;
        self.data[idx] = value;
    }

    /// Borrow a single row as a slice (valid pixels only, no padding).
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    /// Mutable borrow of a single row.
    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.stride;
        &mut self.data[start..start + self.width]
    }

    /// Iterate over all pixels as `(x, y, value)` tuples, skipping padding.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.height).flat_map(move |y| {
            (0..self.width).map(move |x| (x, y, self.data[y * self.stride + x]))
        })
    }

    /// The underlying buffer, padding included.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Mutable access to the underlying buffer.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    // --- Bulk operations ---

    /// Overwrite this image's pixel content from another image of identical
    /// dimensions. Strides may differ; only valid pixels are copied. This is
    /// the in-place refresh used by `update_image`/`update_trimap`, which
    /// must never reallocate.
    ///
    /// # Panics
    /// Panics if dimensions differ (a hard precondition of the engine
    /// contract, checked on every call).
    pub fn copy_from(&mut self, src: &Image<T>) {
        assert_eq!(self.width, src.width, "copy_from: width mismatch");
        assert_eq!(self.height, src.height, "copy_from: height mismatch");
        for y in 0..self.height {
            let dst_start = y * self.stride;
            let src_start = y * src.stride;
            self.data[dst_start..dst_start + self.width]
                .copy_from_slice(&src.data[src_start..src_start + self.width]);
        }
    }

    /// Extract an owned copy of a rectangular sub-region. The crop solver
    /// works on independent short-lived copies, never on views into the
    /// full-resolution planes.
    ///
    /// # Panics
    /// Panics if the region exceeds the image bounds.
    pub fn crop_region(&self, x: usize, y: usize, w: usize, h: usize) -> Image<T> {
        assert!(
            x + w <= self.width && y + h <= self.height,
            "crop region ({x},{y},{w},{h}) exceeds image bounds ({},{})",
            self.width,
            self.height,
        );
        let mut out = Image::new(w, h);
        for row in 0..h {
            let src_start = (y + row) * self.stride + x;
            out.row_mut(row)
                .copy_from_slice(&self.data[src_start..src_start + w]);
        }
        out
    }

    /// Fill every valid pixel with the given value (padding untouched).
    pub fn fill(&mut self, value: T) {
        for y in 0..self.height {
            let start = y * self.stride;
            self.data[start..start + self.width].fill(value);
        }
    }

    // --- Internal helpers ---

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}x{}",
            self.width,
            self.height,
        );
    }
}

impl<T: Pixel + fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Image<{}> {{ {}x{}, stride={} }}",
            std::any::type_name::<T>(),
            self.width,
            self.height,
            self.stride,
        )?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(16) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}", self.get(x, y))?;
            }
            if self.width > 16 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
