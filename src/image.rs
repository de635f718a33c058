// image.rs — host-side disparity map container.
//
// Row-major, 16-bit single-channel samples with an explicit element stride.
// 16-bit mono is a fixed precondition of the whole pipeline: every device
// buffer is sized as `2 * width * height` bytes, and both the GPU kernel and
// the CPU reference path assume one u16 per pixel.
//
// Memory layout (stride = 5, width = 4):
//
//   data index:  0  1  2  3 [4]  5  6  7  8 [9] 10 11 12 13 [14]
//   pixel:       #  #  #  #  .   #  #  #  #  .   #  #  #  #  .
//   row:         |--- row 0 ---|  |--- row 1 ---|  |--- row 2 ---|
//
// Stride padding only exists on the host (e.g. images decoded with aligned
// rows); the engine compacts rows before uploading, so device buffers are
// always packed.

use std::fmt;

/// A 16-bit single-channel disparity map with runtime dimensions.
pub struct DisparityImage {
    /// Sample data in row-major order. Length = height * stride.
    data: Vec<u16>,
    /// Width in pixels.
    width: usize,
    /// Height in pixels.
    height: usize,
    /// Row stride in *elements* (not bytes). stride >= width.
    stride: usize,
}

impl Clone for DisparityImage {
    // Manual impl to make the deep copy of heap data explicit.
    fn clone(&self) -> Self {
        DisparityImage {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
            stride: self.stride,
        }
    }
}

impl DisparityImage {
    // --- Constructors ---

    /// Create a zero-initialized map. Stride equals width (no padding).
    pub fn new(width: usize, height: usize) -> Self {
        Self::new_with_stride(width, height, width)
    }

    /// Create a zero-initialized map with an explicit stride.
    ///
    /// # Panics
    /// Panics if `stride < width`.
    pub fn new_with_stride(width: usize, height: usize, stride: usize) -> Self {
        assert!(
            stride >= width,
            "stride ({stride}) must be >= width ({width})"
        );
        DisparityImage {
            data: vec![0u16; height * stride],
            width,
            height,
            stride,
        }
    }

    /// Create a map filled with a constant disparity.
    pub fn filled(width: usize, height: usize, value: u16) -> Self {
        DisparityImage {
            data: vec![value; height * width],
            width,
            height,
            stride: width,
        }
    }

    /// Create a map from an existing sample vector (no stride padding).
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<u16>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        DisparityImage {
            data,
            width,
            height,
            stride: width,
        }
    }

    /// Create a map from raw data with an explicit stride.
    ///
    /// # Panics
    /// Panics if `data.len() != height * stride` or `stride < width`.
    pub fn from_vec_with_stride(
        width: usize,
        height: usize,
        stride: usize,
        data: Vec<u16>,
    ) -> Self {
        assert!(stride >= width, "stride ({stride}) must be >= width ({width})");
        assert_eq!(
            data.len(),
            height * stride,
            "data length ({}) must equal height * stride ({})",
            data.len(),
            height * stride,
        );
        DisparityImage {
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

    /// Get the disparity at (x, y). x is column, y is row.
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u16 {
        self.bounds_check(x, y);
        self.data[y * self.stride + x]
    }

    /// Set the disparity at (x, y).
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: u16) {
        self.bounds_check(x, y);
        let idx = y * self.stride + x;
        self.data[idx] = value;
    }

    /// Borrow a single row (valid pixels only, stride padding excluded).
    #[inline]
    pub fn row(&self, y: usize) -> &[u16] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    /// Mutable borrow of a single row.
    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [u16] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.stride;
        &mut self.data[start..start + self.width]
    }

    /// Iterate over all pixels as `(x, y, value)` tuples, skipping padding.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, u16)> + '_ {
        (0..self.height).flat_map(move |y| {
            (0..self.width).map(move |x| (x, y, self.data[y * self.stride + x]))
        })
    }

    /// The underlying buffer, including stride padding.
    pub fn as_slice(&self) -> &[u16] {
        &self.data
    }

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

impl fmt::Debug for DisparityImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "DisparityImage {{ {}x{}, stride={} }}",
            self.width, self.height, self.stride,
        )?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(16) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", self.get(x, y))?;
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

impl std::ops::Index<(usize, usize)> for DisparityImage {
    type Output = u16;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &u16 {
        self.bounds_check(x, y);
        &self.data[y * self.stride + x]
    }
}

impl std::ops::IndexMut<(usize, usize)> for DisparityImage {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut u16 {
        self.bounds_check(x, y);
        let idx = y * self.stride + x;
        &mut self.data[idx]
    }
}
