use anyhow::{Result, anyhow};
use candle_core::{DType, Tensor};
use candle_nn::{
    BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig,
    Init, LayerNorm, Linear, VarBuilder, batch_norm,
};

/// Truncated normal with std 0.02, cut at +-2. With this std the cut never triggers,
/// so a plain normal draws the same distribution.
pub const TRUNC_NORMAL_002: Init = Init::Randn {
    mean: 0.0,
    stdev: 0.02,
};

pub const ZEROS: Init = Init::Const(0.0);
pub const ONES: Init = Init::Const(1.0);

/// Normal init with `std = sqrt(2 / fan_out)`, `fan_out = k * k * out_c / groups`.
pub fn conv_fan_out_init(kernel_size: usize, out_c: usize, groups: usize) -> Init {
    let fan_out = (kernel_size * kernel_size * out_c / groups).max(1);
    Init::Randn {
        mean: 0.0,
        stdev: (2.0 / fan_out as f64).sqrt(),
    }
}

pub fn xavier_uniform_init(fan_in: usize, fan_out: usize) -> Init {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

pub fn get_conv2d(
    vb: VarBuilder,
    in_c: usize,
    out_c: usize,
    kernel_size: usize,
    padding: usize,
    stride: usize,
    dilation: usize,
    groups: usize,
    bias: bool,
    init: Init,
) -> Result<Conv2d> {
    if in_c % groups != 0 || out_c % groups != 0 {
        return Err(anyhow!(
            "conv2d channels ({in_c} -> {out_c}) must be divisible by groups {groups}"
        ));
    }
    let cfg = Conv2dConfig {
        padding,
        stride,
        dilation,
        groups,
        cudnn_fwd_algo: None,
    };
    let weight = vb.get_with_hints(
        (out_c, in_c / groups, kernel_size, kernel_size),
        "weight",
        init,
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_c, "bias", ZEROS)?)
    } else {
        None
    };
    Ok(Conv2d::new(weight, bias, cfg))
}

pub fn get_conv_transpose2d(
    vb: VarBuilder,
    in_c: usize,
    out_c: usize,
    kernel_size: usize,
    padding: usize,
    output_padding: usize,
    stride: usize,
    bias: bool,
    init: Init,
) -> Result<ConvTranspose2d> {
    let cfg = ConvTranspose2dConfig {
        padding,
        output_padding,
        stride,
        dilation: 1,
    };
    // torch layout: (in, out, kh, kw)
    let weight = vb.get_with_hints((in_c, out_c, kernel_size, kernel_size), "weight", init)?;
    let bias = if bias {
        Some(vb.get_with_hints(out_c, "bias", ZEROS)?)
    } else {
        None
    };
    Ok(ConvTranspose2d::new(weight, bias, cfg))
}

pub fn get_linear(
    vb: VarBuilder,
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    init: Init,
) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", ZEROS)?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

pub fn get_layer_norm(vb: VarBuilder, eps: f64, dim: usize) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(dim, "weight", ONES)?;
    let bias = vb.get_with_hints(dim, "bias", ZEROS)?;
    Ok(LayerNorm::new(weight, bias, eps))
}

pub fn get_batch_norm(vb: VarBuilder, eps: f64, dim: usize, affine: bool) -> Result<BatchNorm> {
    let bn_config = BatchNormConfig {
        eps,
        remove_mean: true,
        affine,
        momentum: 0.1,
    };
    let norm = batch_norm(dim, bn_config, vb)?;
    Ok(norm)
}

/// (b, h*w, c) -> (b, c, h, w)
pub fn nlc_to_nchw(xs: &Tensor, hw_shape: (usize, usize)) -> Result<Tensor> {
    let (b, l, c) = xs.dims3()?;
    let (h, w) = hw_shape;
    if l != h * w {
        return Err(anyhow!(
            "token count {l} does not match hw_shape {h}x{w}"
        ));
    }
    let xs = xs.transpose(1, 2)?.reshape((b, c, h, w))?;
    Ok(xs)
}

/// (b, c, h, w) -> (b, h*w, c)
pub fn nchw_to_nlc(xs: &Tensor) -> Result<Tensor> {
    let xs = xs.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
    Ok(xs)
}

/// Stochastic depth on a residual branch, sampled once per batch element.
#[derive(Debug, Clone, Copy)]
pub struct DropPath {
    drop_prob: f64,
}

impl DropPath {
    pub fn new(drop_prob: f64) -> Self {
        Self { drop_prob }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.drop_prob <= 0.0 {
            return Ok(xs.clone());
        }
        let keep_prob = 1.0 - self.drop_prob;
        let mut mask_shape = vec![1usize; xs.rank()];
        mask_shape[0] = xs.dim(0)?;
        let mask = Tensor::rand(0f32, 1f32, mask_shape, xs.device())?
            .affine(1.0, keep_prob)?
            .floor()?
            .to_dtype(xs.dtype())?;
        let xs = xs.broadcast_mul(&mask)?.affine(1.0 / keep_prob, 0.0)?;
        Ok(xs)
    }
}

pub fn is_float(dtype: DType) -> bool {
    matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
}
