//! Convolution geometry and im2col patch extraction
//!
//! Layout is NHWC. A rank-3 input `[batch, width, channels]` is a 1-D
//! convolution and is handled as an image of height 1. Patch entries are
//! ordered `(i * kw + j) * cin + c`, the row-major flattening of the first
//! three kernel dimensions, so a kernel reshaped to `[-1, cout]` lines up
//! with the patch vector.

use ndarray::{Array3, ArrayD, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{KfacError, Result};

/// Padding mode with TensorFlow semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Padding {
    /// Pad so that `out = ceil(in / stride)`; the odd extra pad goes at the end
    Same,
    /// No padding; `out = (in - k) / stride + 1`
    Valid,
}

/// Spatial output size and leading pads along one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AxisPlan {
    out: usize,
    pad_before: usize,
}

fn plan_axis(input: usize, kernel: usize, stride: usize, padding: Padding) -> Result<AxisPlan> {
    match padding {
        Padding::Same => {
            let out = input.div_ceil(stride);
            let needed = (out.saturating_sub(1)) * stride + kernel;
            let total = needed.saturating_sub(input);
            Ok(AxisPlan {
                out,
                pad_before: total / 2,
            })
        }
        Padding::Valid => {
            if input < kernel {
                return Err(KfacError::invalid_argument(
                    "input",
                    format!("spatial size {input} smaller than kernel {kernel} with VALID padding"),
                ));
            }
            Ok(AxisPlan {
                out: (input - kernel) / stride + 1,
                pad_before: 0,
            })
        }
    }
}

/// Kernel size, strides and padding of a 2-D (or 1-D) convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvGeometry {
    /// Kernel `[height, width]`
    pub kernel: [usize; 2],
    /// Strides `[height, width]`
    pub strides: [usize; 2],
    /// Padding mode
    pub padding: Padding,
}

impl ConvGeometry {
    /// Geometry with unit strides
    pub fn new(kernel: [usize; 2], padding: Padding) -> Result<Self> {
        if kernel.contains(&0) {
            return Err(KfacError::invalid_argument("kernel", "kernel sizes must be > 0"));
        }
        Ok(Self {
            kernel,
            strides: [1, 1],
            padding,
        })
    }

    /// Geometry of a kernel tensor: `[kh, kw, cin, cout]`, or `[kw, cin, cout]`
    /// for a 1-D convolution.
    pub fn from_kernel_shape(shape: &[usize], padding: Padding) -> Result<Self> {
        match shape {
            [kh, kw, _, _] => Self::new([*kh, *kw], padding),
            [kw, _, _] => Self::new([1, *kw], padding),
            _ => Err(KfacError::invalid_argument(
                "params",
                format!("expected a rank 3 or 4 kernel, got shape {shape:?}"),
            )),
        }
    }

    /// Set strides `[height, width]`
    pub fn with_strides(mut self, strides: [usize; 2]) -> Result<Self> {
        if strides.contains(&0) {
            return Err(KfacError::invalid_argument("strides", "strides must be > 0"));
        }
        self.strides = strides;
        Ok(self)
    }

    /// Length of one patch for `in_channels` input channels
    pub fn patch_dim(&self, in_channels: usize) -> usize {
        self.kernel[0] * self.kernel[1] * in_channels
    }

    /// Output `(height, width)` for an input of `(height, width)`
    pub fn output_size(&self, height: usize, width: usize) -> Result<(usize, usize)> {
        let rows = plan_axis(height, self.kernel[0], self.strides[0], self.padding)?;
        let cols = plan_axis(width, self.kernel[1], self.strides[1], self.padding)?;
        Ok((rows.out, cols.out))
    }

    /// Number of output locations for an input of the given shape
    pub fn num_locations(&self, input_shape: &[usize]) -> Result<usize> {
        let (h, w, _) = spatial_dims(input_shape)?;
        let (oh, ow) = self.output_size(h, w)?;
        Ok(oh * ow)
    }

    /// Extract patches, `[batch, out_h * out_w, kh * kw * cin]`.
    pub fn extract_patches(&self, input: &ArrayD<f64>) -> Result<Array3<f64>> {
        let images = as_images(input)?;
        let (batch, height, width, channels) = images.dim();
        let [kh, kw] = self.kernel;
        let [sh, sw] = self.strides;
        let rows = plan_axis(height, kh, sh, self.padding)?;
        let cols = plan_axis(width, kw, sw, self.padding)?;

        let mut patches =
            Array3::<f64>::zeros((batch, rows.out * cols.out, self.patch_dim(channels)));
        for n in 0..batch {
            for oi in 0..rows.out {
                for oj in 0..cols.out {
                    let loc = oi * cols.out + oj;
                    for i in 0..kh {
                        let y = (oi * sh + i).checked_sub(rows.pad_before);
                        let Some(y) = y.filter(|&y| y < height) else {
                            continue;
                        };
                        for j in 0..kw {
                            let x = (oj * sw + j).checked_sub(cols.pad_before);
                            let Some(x) = x.filter(|&x| x < width) else {
                                continue;
                            };
                            let offset = (i * kw + j) * channels;
                            for c in 0..channels {
                                patches[[n, loc, offset + c]] = images[[n, y, x, c]];
                            }
                        }
                    }
                }
            }
        }
        Ok(patches)
    }
}

/// `(height, width, channels)` of an NHWC or NWC input shape
pub(crate) fn spatial_dims(shape: &[usize]) -> Result<(usize, usize, usize)> {
    match shape {
        [_, h, w, c] => Ok((*h, *w, *c)),
        [_, w, c] => Ok((1, *w, *c)),
        _ => Err(KfacError::invalid_argument(
            "inputs",
            format!("convolution inputs must have rank 3 or 4, got shape {shape:?}"),
        )),
    }
}

fn as_images(input: &ArrayD<f64>) -> Result<ArrayView4<'_, f64>> {
    match input.ndim() {
        4 => input
            .view()
            .into_dimensionality()
            .map_err(|e| KfacError::invalid_argument("inputs", e.to_string())),
        3 => input
            .view()
            .insert_axis(Axis(1))
            .into_dimensionality()
            .map_err(|e| KfacError::invalid_argument("inputs", e.to_string())),
        _ => Err(KfacError::invalid_argument(
            "inputs",
            format!(
                "convolution inputs must have rank 3 or 4, got shape {:?}",
                input.shape()
            ),
        )),
    }
}
