use anyhow::{Result, anyhow};
use candle_core::{D, Tensor};
use candle_nn::{
    BatchNorm, Conv2d, ConvTranspose2d, Dropout, Init, LayerNorm, Linear, Module, ModuleT,
    VarBuilder,
};

use crate::{
    models::{
        common::{
            DropPath, TRUNC_NORMAL_002, conv_fan_out_init, get_batch_norm, get_conv_transpose2d,
            get_conv2d, get_layer_norm, get_linear, nchw_to_nlc, nlc_to_nchw,
            xavier_uniform_init,
        },
        pose_pvt::config::{PoseHeadConfig, PosePvtConfig, PvtConfig, deconv_cfg},
    },
    utils::tensor_utils::interpolate_bilinear,
};

const HEAD_INIT_STD: f64 = 0.001;

/// Overlapping (v2) or non-overlapping (v1) patch embedding.
pub struct PatchEmbed {
    projection: Conv2d,
    norm: LayerNorm,
    kernel_size: usize,
    padding: usize,
}

impl PatchEmbed {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        embed_dims: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        eps: f64,
    ) -> Result<Self> {
        let projection = get_conv2d(
            vb.pp("projection"),
            in_channels,
            embed_dims,
            kernel_size,
            padding,
            stride,
            1,
            1,
            true,
            conv_fan_out_init(kernel_size, embed_dims, 1),
        )?;
        let norm = get_layer_norm(vb.pp("norm"), eps, embed_dims)?;
        Ok(Self {
            projection,
            norm,
            kernel_size,
            padding,
        })
    }

    /// Returns NLC tokens and the (h, w) grid they came from.
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, (usize, usize))> {
        let (_, _, in_h, in_w) = xs.dims4()?;
        if in_h.min(in_w) + 2 * self.padding < self.kernel_size {
            return Err(anyhow!(
                "input {in_h}x{in_w} is too small for a {k}x{k} patch embedding",
                k = self.kernel_size
            ));
        }
        let xs = self.projection.forward(xs)?;
        let (_, _, h, w) = xs.dims4()?;
        let xs = nchw_to_nlc(&xs)?;
        let xs = self.norm.forward(&xs)?;
        Ok((xs, (h, w)))
    }
}

pub struct AbsolutePositionEmbedding {
    pos_embed: Tensor,
    pos_shape: (usize, usize),
    pos_dim: usize,
    drop: Dropout,
}

impl AbsolutePositionEmbedding {
    pub fn new(
        vb: VarBuilder,
        pos_shape: (usize, usize),
        pos_dim: usize,
        drop_rate: f64,
    ) -> Result<Self> {
        if pos_shape.0 == 0 || pos_shape.1 == 0 {
            return Err(anyhow!(
                "position embedding grid {pos_shape:?} is empty, pretrain_img_size too small"
            ));
        }
        let pos_embed = vb.get_with_hints(
            (1, pos_shape.0 * pos_shape.1, pos_dim),
            "pos_embed",
            TRUNC_NORMAL_002,
        )?;
        Ok(Self {
            pos_embed,
            pos_shape,
            pos_dim,
            drop: Dropout::new(drop_rate as f32),
        })
    }

    /// Bilinearly resamples the learned grid to `input_shape`, returns (1, h*w, c).
    pub fn resize_pos_embed(&self, input_shape: (usize, usize)) -> Result<Tensor> {
        let (pos_h, pos_w) = self.pos_shape;
        let num_pos = self.pos_embed.dim(1)?;
        let weight = self
            .pos_embed
            .narrow(1, num_pos - pos_h * pos_w, pos_h * pos_w)?
            .reshape((1, pos_h, pos_w, self.pos_dim))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        let weight = interpolate_bilinear(&weight, input_shape, Some(false))?;
        nchw_to_nlc(&weight)
    }

    pub fn forward_t(&self, xs: &Tensor, hw_shape: (usize, usize), train: bool) -> Result<Tensor> {
        let pos_embed = self.resize_pos_embed(hw_shape)?;
        let xs = xs.broadcast_add(&pos_embed)?;
        Ok(self.drop.forward_t(&xs, train)?)
    }
}

/// Multi-head attention whose keys/values come from a strided-conv downsampled token map.
pub struct SpatialReductionAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    sr: Option<(Conv2d, LayerNorm)>,
    sr_ratio: usize,
    num_heads: usize,
    head_dim: usize,
    scaling: f64,
    attn_drop: Dropout,
    proj_drop: Dropout,
    drop_path: DropPath,
}

impl SpatialReductionAttention {
    pub fn new(
        vb: VarBuilder,
        embed_dims: usize,
        num_heads: usize,
        qkv_bias: bool,
        sr_ratio: usize,
        norm_eps: f64,
        attn_drop: f64,
        proj_drop: f64,
        drop_path: f64,
    ) -> Result<Self> {
        if embed_dims % num_heads != 0 {
            return Err(anyhow!(
                "embed_dims {embed_dims} must be divisible by num_heads {num_heads}"
            ));
        }
        let head_dim = embed_dims / num_heads;
        // packed q/k/v, torch MultiheadAttention layout
        let vb_attn = vb.pp("attn");
        let in_proj_weight = vb_attn.get_with_hints(
            (3 * embed_dims, embed_dims),
            "in_proj_weight",
            xavier_uniform_init(embed_dims, 3 * embed_dims),
        )?;
        let in_proj_bias = if qkv_bias {
            Some(vb_attn.get_with_hints(3 * embed_dims, "in_proj_bias", Init::Const(0.0))?)
        } else {
            None
        };
        let split = |i: usize| -> Result<Linear> {
            let w = in_proj_weight.narrow(0, i * embed_dims, embed_dims)?;
            let b = match &in_proj_bias {
                Some(b) => Some(b.narrow(0, i * embed_dims, embed_dims)?),
                None => None,
            };
            Ok(Linear::new(w, b))
        };
        let q_proj = split(0)?;
        let k_proj = split(1)?;
        let v_proj = split(2)?;
        let out_proj = get_linear(
            vb_attn.pp("out_proj"),
            embed_dims,
            embed_dims,
            qkv_bias,
            TRUNC_NORMAL_002,
        )?;
        let sr = if sr_ratio > 1 {
            let conv = get_conv2d(
                vb.pp("sr"),
                embed_dims,
                embed_dims,
                sr_ratio,
                0,
                sr_ratio,
                1,
                1,
                true,
                conv_fan_out_init(sr_ratio, embed_dims, 1),
            )?;
            let norm = get_layer_norm(vb.pp("norm"), norm_eps, embed_dims)?;
            Some((conv, norm))
        } else {
            None
        };
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            sr,
            sr_ratio,
            num_heads,
            head_dim,
            scaling: 1.0 / (head_dim as f64).sqrt(),
            attn_drop: Dropout::new(attn_drop as f32),
            proj_drop: Dropout::new(proj_drop as f32),
            drop_path: DropPath::new(drop_path),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, _) = xs.dims3()?;
        let xs = xs
            .reshape((b, n, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        Ok(xs)
    }

    pub fn forward_t(
        &self,
        xs: &Tensor,
        hw_shape: (usize, usize),
        identity: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let x_kv = match &self.sr {
            Some(_) if hw_shape.0 < self.sr_ratio || hw_shape.1 < self.sr_ratio => {
                return Err(anyhow!(
                    "token grid {}x{} is too small for sr_ratio {}",
                    hw_shape.0,
                    hw_shape.1,
                    self.sr_ratio
                ));
            }
            Some((conv, norm)) => {
                let x_kv = nlc_to_nchw(xs, hw_shape)?;
                let x_kv = conv.forward(&x_kv)?;
                let x_kv = nchw_to_nlc(&x_kv)?;
                norm.forward(&x_kv)?
            }
            None => xs.clone(),
        };
        let (b, n_q, c) = xs.dims3()?;
        let query_states = self.split_heads(&self.q_proj.forward(xs)?)?;
        let key_states = self.split_heads(&self.k_proj.forward(&x_kv)?)?;
        let value_states = self.split_heads(&self.v_proj.forward(&x_kv)?)?;

        let query_states = (query_states * self.scaling)?;
        let attn_weights = query_states.matmul(&key_states.transpose(D::Minus2, D::Minus1)?)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_weights = self.attn_drop.forward_t(&attn_weights, train)?;
        // (b, n_head, n_q, head_dim) -> (b, n_q, c)
        let attn_output = attn_weights
            .matmul(&value_states)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, n_q, c))?;
        let out = self.out_proj.forward(&attn_output)?;
        let out = self.proj_drop.forward_t(&out, train)?;
        let out = self.drop_path.forward_t(&out, train)?;
        Ok(identity.add(&out)?)
    }
}

/// Feed-forward built from 1x1 convs, with an optional 3x3 depth-wise conv that
/// injects positional information.
pub struct MixFFN {
    fc1: Conv2d,
    dw_conv: Option<Conv2d>,
    fc2: Conv2d,
    drop: Dropout,
    drop_path: DropPath,
}

impl MixFFN {
    pub fn new(
        vb: VarBuilder,
        embed_dims: usize,
        feedforward_channels: usize,
        ffn_drop: f64,
        drop_path: f64,
        use_conv: bool,
    ) -> Result<Self> {
        let vb_layers = vb.pp("layers");
        let fc1 = get_conv2d(
            vb_layers.pp(0),
            embed_dims,
            feedforward_channels,
            1,
            0,
            1,
            1,
            1,
            true,
            conv_fan_out_init(1, feedforward_channels, 1),
        )?;
        let dw_conv = if use_conv {
            Some(get_conv2d(
                vb_layers.pp(1),
                feedforward_channels,
                feedforward_channels,
                3,
                1,
                1,
                1,
                feedforward_channels,
                true,
                conv_fan_out_init(3, feedforward_channels, feedforward_channels),
            )?)
        } else {
            None
        };
        // [fc1, (dw), act, drop, fc2, drop]
        let fc2_idx = if use_conv { 4 } else { 3 };
        let fc2 = get_conv2d(
            vb_layers.pp(fc2_idx),
            feedforward_channels,
            embed_dims,
            1,
            0,
            1,
            1,
            1,
            true,
            conv_fan_out_init(1, embed_dims, 1),
        )?;
        Ok(Self {
            fc1,
            dw_conv,
            fc2,
            drop: Dropout::new(ffn_drop as f32),
            drop_path: DropPath::new(drop_path),
        })
    }

    pub fn forward_t(
        &self,
        xs: &Tensor,
        hw_shape: (usize, usize),
        identity: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let out = nlc_to_nchw(xs, hw_shape)?;
        let mut out = self.fc1.forward(&out)?;
        if let Some(dw_conv) = &self.dw_conv {
            out = dw_conv.forward(&out)?;
        }
        let out = out.gelu_erf()?;
        let out = self.drop.forward_t(&out, train)?;
        let out = self.fc2.forward(&out)?;
        let out = self.drop.forward_t(&out, train)?;
        let out = nchw_to_nlc(&out)?;
        let out = self.drop_path.forward_t(&out, train)?;
        Ok(identity.add(&out)?)
    }
}

pub struct PvtEncoderLayer {
    norm1: LayerNorm,
    attn: SpatialReductionAttention,
    norm2: LayerNorm,
    ffn: MixFFN,
}

impl PvtEncoderLayer {
    pub fn new(
        vb: VarBuilder,
        cfg: &PvtConfig,
        stage: usize,
        drop_path_rate: f64,
    ) -> Result<Self> {
        let embed_dims = cfg.stage_dims(stage);
        let norm1 = get_layer_norm(vb.pp("norm1"), cfg.norm_eps, embed_dims)?;
        let attn = SpatialReductionAttention::new(
            vb.pp("attn"),
            embed_dims,
            cfg.num_heads[stage],
            cfg.qkv_bias,
            cfg.sr_ratios[stage],
            cfg.norm_eps,
            cfg.attn_drop_rate,
            cfg.drop_rate,
            drop_path_rate,
        )?;
        let norm2 = get_layer_norm(vb.pp("norm2"), cfg.norm_eps, embed_dims)?;
        let ffn = MixFFN::new(
            vb.pp("ffn"),
            embed_dims,
            cfg.mlp_ratios[stage] * embed_dims,
            cfg.drop_rate,
            drop_path_rate,
            cfg.use_conv_ffn,
        )?;
        Ok(Self {
            norm1,
            attn,
            norm2,
            ffn,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, hw_shape: (usize, usize), train: bool) -> Result<Tensor> {
        let xs = self
            .attn
            .forward_t(&self.norm1.forward(xs)?, hw_shape, xs, train)?;
        let xs = self
            .ffn
            .forward_t(&self.norm2.forward(&xs)?, hw_shape, &xs, train)?;
        Ok(xs)
    }
}

/// One pyramid level: `layers.{i}.0` patch embed, `layers.{i}.1.*` blocks
/// (position embedding first when present), `layers.{i}.2` norm.
pub struct PvtStage {
    patch_embed: PatchEmbed,
    pos_embed: Option<AbsolutePositionEmbedding>,
    blocks: Vec<PvtEncoderLayer>,
    norm: Option<LayerNorm>,
}

impl PvtStage {
    pub fn new(
        vb: VarBuilder,
        cfg: &PvtConfig,
        stage: usize,
        in_channels: usize,
        drop_path_rates: &[f32],
    ) -> Result<Self> {
        let embed_dims = cfg.stage_dims(stage);
        let patch_embed = PatchEmbed::new(
            vb.pp(0),
            in_channels,
            embed_dims,
            cfg.patch_sizes[stage],
            cfg.strides[stage],
            cfg.paddings[stage],
            cfg.norm_eps,
        )?;
        let vb_layers = vb.pp(1);
        let mut offset = 0usize;
        let pos_embed = if cfg.use_abs_pos_embed {
            offset = 1;
            Some(AbsolutePositionEmbedding::new(
                vb_layers.pp(0),
                cfg.pos_shape(stage),
                embed_dims,
                cfg.drop_rate,
            )?)
        } else {
            None
        };
        let mut blocks = Vec::with_capacity(cfg.num_layers[stage]);
        for (idx, &dpr) in drop_path_rates.iter().enumerate() {
            blocks.push(PvtEncoderLayer::new(
                vb_layers.pp(idx + offset),
                cfg,
                stage,
                dpr as f64,
            )?);
        }
        let norm = if cfg.norm_after_stage {
            Some(get_layer_norm(vb.pp(2), cfg.norm_eps, embed_dims)?)
        } else {
            None
        };
        Ok(Self {
            patch_embed,
            pos_embed,
            blocks,
            norm,
        })
    }

    /// NCHW in, NCHW out.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (mut xs, hw_shape) = self.patch_embed.forward(xs)?;
        if let Some(pos_embed) = &self.pos_embed {
            xs = pos_embed.forward_t(&xs, hw_shape, train)?;
        }
        for block in &self.blocks {
            xs = block.forward_t(&xs, hw_shape, train)?;
        }
        if let Some(norm) = &self.norm {
            xs = norm.forward(&xs)?;
        }
        nlc_to_nchw(&xs, hw_shape)
    }
}

pub struct PyramidVisionTransformer {
    stages: Vec<PvtStage>,
    out_indices: Vec<usize>,
    in_channels: usize,
}

impl PyramidVisionTransformer {
    pub fn new(vb: VarBuilder, cfg: &PvtConfig) -> Result<Self> {
        cfg.validate()?;
        let dpr = cfg.drop_path_schedule();
        let vb_layers = vb.pp("layers");
        let mut stages = Vec::with_capacity(cfg.num_stages);
        let mut in_channels = cfg.in_channels;
        let mut cur = 0usize;
        for stage in 0..cfg.num_stages {
            let num_layer = cfg.num_layers[stage];
            stages.push(PvtStage::new(
                vb_layers.pp(stage),
                cfg,
                stage,
                in_channels,
                &dpr[cur..cur + num_layer],
            )?);
            in_channels = cfg.stage_dims(stage);
            cur += num_layer;
        }
        Ok(Self {
            stages,
            out_indices: cfg.out_indices.clone(),
            in_channels: cfg.in_channels,
        })
    }

    /// Runs every stage; returns the last stage map and the maps listed in `out_indices`.
    pub fn forward_stages_t(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Vec<Tensor>)> {
        let (_, c, _, _) = xs.dims4()?;
        if c != self.in_channels {
            return Err(anyhow!(
                "expected {} input channels, got {c}",
                self.in_channels
            ));
        }
        let mut outs = vec![];
        let mut xs = xs.clone();
        for (i, stage) in self.stages.iter().enumerate() {
            xs = stage.forward_t(&xs, train)?;
            if self.out_indices.contains(&i) {
                outs.push(xs.clone());
            }
        }
        Ok((xs, outs))
    }

    /// Multi-scale NCHW features for `out_indices`.
    pub fn forward_features(&self, xs: &Tensor) -> Result<Vec<Tensor>> {
        let (_, outs) = self.forward_stages_t(xs, false)?;
        Ok(outs)
    }
}

/// Simple-baseline head: stride-2 transposed convs with BN + ReLU, then a conv to heatmaps.
pub struct DeconvHead {
    deconv_layers: Vec<(ConvTranspose2d, BatchNorm)>,
    final_layer: Conv2d,
}

impl DeconvHead {
    pub fn new(
        vb: VarBuilder,
        cfg: &PoseHeadConfig,
        in_channels: usize,
        num_joints: usize,
    ) -> Result<Self> {
        cfg.validate()?;
        let vb_deconv = vb.pp("deconv_layers");
        let mut inplanes = in_channels;
        let mut deconv_layers = Vec::with_capacity(cfg.num_deconv_layers);
        for i in 0..cfg.num_deconv_layers {
            let (kernel, padding, output_padding) = deconv_cfg(cfg.num_deconv_kernels[i])?;
            let planes = cfg.num_deconv_filters[i];
            let deconv = get_conv_transpose2d(
                vb_deconv.pp(3 * i),
                inplanes,
                planes,
                kernel,
                padding,
                output_padding,
                2,
                cfg.deconv_with_bias,
                Init::Randn {
                    mean: 0.0,
                    stdev: HEAD_INIT_STD,
                },
            )?;
            let bn = get_batch_norm(vb_deconv.pp(3 * i + 1), 1e-5, planes, true)?;
            deconv_layers.push((deconv, bn));
            inplanes = planes;
        }
        let final_layer = get_conv2d(
            vb.pp("final_layer"),
            inplanes,
            num_joints,
            cfg.final_conv_kernel,
            cfg.final_conv_padding(),
            1,
            1,
            1,
            true,
            Init::Randn {
                mean: 0.0,
                stdev: HEAD_INIT_STD,
            },
        )?;
        Ok(Self {
            deconv_layers,
            final_layer,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (deconv, bn) in &self.deconv_layers {
            xs = deconv.forward(&xs)?;
            xs = bn.forward_t(&xs, train)?;
            xs = xs.relu()?;
        }
        Ok(self.final_layer.forward(&xs)?)
    }
}

/// PVT backbone + deconvolution head producing one heatmap per joint.
pub struct PosePvt {
    backbone: PyramidVisionTransformer,
    head: DeconvHead,
    num_joints: usize,
}

impl PosePvt {
    pub fn new(vb: VarBuilder, cfg: &PosePvtConfig) -> Result<Self> {
        cfg.validate()?;
        let backbone = PyramidVisionTransformer::new(vb.clone(), &cfg.backbone)?;
        let head = DeconvHead::new(vb, &cfg.head, cfg.head_in_channels(), cfg.num_joints)?;
        Ok(Self {
            backbone,
            head,
            num_joints: cfg.num_joints,
        })
    }

    pub fn num_joints(&self) -> usize {
        self.num_joints
    }

    /// (b, c, h, w) image batch -> (b, num_joints, h', w') heatmaps.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (xs, _) = self.backbone.forward_stages_t(xs, train)?;
        self.head.forward_t(&xs, train)
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_t(xs, false)
    }
}
