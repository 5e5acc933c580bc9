//! Convolution problem description.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TensorLayout {
    #[default]
    Nchw,
    Nhwc,
}

/// Capabilities of the device a problem will run on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub assembler_available: bool,
    pub max_compute_units: u32,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, max_compute_units: u32) -> Self {
        Self {
            name: name.into(),
            assembler_available: true,
            max_compute_units,
        }
    }

    pub fn without_assembler(mut self) -> Self {
        self.assembler_available = false;
        self
    }
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self::new("gfx900", 64)
    }
}

/// A backward-weights convolution problem as seen by the 3x3 WrW kernel.
///
/// Backward convolutions swap the channel roles: `n_outputs` holds the image
/// channel count (C) and `n_inputs` holds the filter count (K).
/// `out_height`/`out_width` are the image extents the kernel walks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvProblem {
    pub batch_size: usize,
    pub n_inputs: usize,
    pub n_outputs: usize,
    pub out_height: usize,
    pub out_width: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub bias: bool,
    pub layout: TensorLayout,
    pub device: DeviceInfo,
}

impl ConvProblem {
    /// A 3x3, pad 1, unit-stride problem on the default device.
    pub fn new(
        batch_size: usize,
        n_inputs: usize,
        n_outputs: usize,
        out_height: usize,
        out_width: usize,
    ) -> Self {
        Self {
            batch_size,
            n_inputs,
            n_outputs,
            out_height,
            out_width,
            kernel_h: 3,
            kernel_w: 3,
            pad_h: 1,
            pad_w: 1,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            bias: false,
            layout: TensorLayout::Nchw,
            device: DeviceInfo::default(),
        }
    }

    pub fn with_kernel(mut self, kernel_h: usize, kernel_w: usize) -> Self {
        self.kernel_h = kernel_h;
        self.kernel_w = kernel_w;
        self
    }

    pub fn with_padding(mut self, pad_h: usize, pad_w: usize) -> Self {
        self.pad_h = pad_h;
        self.pad_w = pad_w;
        self
    }

    pub fn with_stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride_h = stride_h;
        self.stride_w = stride_w;
        self
    }

    pub fn with_dilation(mut self, dilation_h: usize, dilation_w: usize) -> Self {
        self.dilation_h = dilation_h;
        self.dilation_w = dilation_w;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.device = device;
        self
    }

    pub fn is_unit_stride(&self) -> bool {
        self.stride_h == 1 && self.stride_w == 1
    }

    /// Height of the output-gradient tensor.
    pub fn grad_height(&self) -> usize {
        conv_extent(self.out_height, self.pad_h, self.kernel_h, self.stride_h, self.dilation_h)
    }

    /// Width of the output-gradient tensor.
    pub fn grad_width(&self) -> usize {
        conv_extent(self.out_width, self.pad_w, self.kernel_w, self.stride_w, self.dilation_w)
    }

    /// N x C x H x W
    pub fn image_shape(&self) -> [usize; 4] {
        [self.batch_size, self.n_outputs, self.out_height, self.out_width]
    }

    /// N x K x Ho x Wo
    pub fn grad_output_shape(&self) -> [usize; 4] {
        [self.batch_size, self.n_inputs, self.grad_height(), self.grad_width()]
    }

    /// K x C x R x S
    pub fn weight_shape(&self) -> [usize; 4] {
        [self.n_inputs, self.n_outputs, self.kernel_h, self.kernel_w]
    }

    pub fn image_bytes(&self) -> usize {
        self.image_shape().iter().product::<usize>() * std::mem::size_of::<f32>()
    }

    pub fn grad_output_bytes(&self) -> usize {
        self.grad_output_shape().iter().product::<usize>() * std::mem::size_of::<f32>()
    }

    pub fn weight_bytes(&self) -> usize {
        self.weight_shape().iter().product::<usize>() * std::mem::size_of::<f32>()
    }

    /// Multiply-accumulates performed by one backward-weights pass.
    pub fn flops(&self) -> f64 {
        let [n, k, ho, wo] = self.grad_output_shape();
        2.0 * (n * k * ho * wo) as f64 * (self.n_outputs * self.kernel_h * self.kernel_w) as f64
    }

    /// Stable key for persisted tuning results.
    pub fn cache_key(&self) -> String {
        format!(
            "{}-n{}-c{}-k{}-{}x{}-r{}x{}-p{}x{}-s{}x{}-d{}x{}-{:?}{}",
            self.device.name,
            self.batch_size,
            self.n_outputs,
            self.n_inputs,
            self.out_height,
            self.out_width,
            self.kernel_h,
            self.kernel_w,
            self.pad_h,
            self.pad_w,
            self.stride_h,
            self.stride_w,
            self.dilation_h,
            self.dilation_w,
            self.layout,
            if self.bias { "-bias" } else { "" }
        )
    }
}

fn conv_extent(size: usize, pad: usize, kernel: usize, stride: usize, dilation: usize) -> usize {
    let span = dilation * kernel.saturating_sub(1) + 1;
    let padded = size + 2 * pad;
    if padded < span || stride == 0 {
        return 0;
    }
    (padded - span) / stride + 1
}
