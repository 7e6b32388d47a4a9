use anyhow::{Result, anyhow};

use crate::utils::tensor_utils::linspace;

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct PvtConfig {
    pub pretrain_img_size: usize,
    pub in_channels: usize,
    pub embed_dims: usize,
    pub num_stages: usize,
    pub num_layers: Vec<usize>,
    pub num_heads: Vec<usize>,
    pub patch_sizes: Vec<usize>,
    pub strides: Vec<usize>,
    pub paddings: Vec<usize>,
    pub sr_ratios: Vec<usize>,
    pub out_indices: Vec<usize>,
    pub mlp_ratios: Vec<usize>,
    pub qkv_bias: bool,
    pub drop_rate: f64,
    pub attn_drop_rate: f64,
    pub drop_path_rate: f64,
    pub use_abs_pos_embed: bool,
    pub norm_after_stage: bool,
    pub use_conv_ffn: bool,
    pub norm_eps: f64,
}

impl Default for PvtConfig {
    fn default() -> Self {
        Self {
            pretrain_img_size: 224,
            in_channels: 3,
            embed_dims: 64,
            num_stages: 4,
            num_layers: vec![3, 4, 6, 3],
            num_heads: vec![1, 2, 5, 8],
            patch_sizes: vec![4, 2, 2, 2],
            strides: vec![4, 2, 2, 2],
            paddings: vec![0, 0, 0, 0],
            sr_ratios: vec![8, 4, 2, 1],
            out_indices: vec![0, 1, 2, 3],
            mlp_ratios: vec![8, 8, 4, 4],
            qkv_bias: true,
            drop_rate: 0.0,
            attn_drop_rate: 0.0,
            drop_path_rate: 0.1,
            use_abs_pos_embed: true,
            norm_after_stage: false,
            use_conv_ffn: false,
            norm_eps: 1e-6,
        }
    }
}

impl PvtConfig {
    /// PVT v1 small.
    pub fn pvt_v1() -> Self {
        Self::default()
    }

    /// PVTv2-b2: overlapping patch embedding, conv FFN, per-stage norm, no absolute
    /// position embedding.
    pub fn pvt_v2() -> Self {
        Self {
            patch_sizes: vec![7, 3, 3, 3],
            paddings: vec![3, 1, 1, 1],
            use_abs_pos_embed: false,
            norm_after_stage: true,
            use_conv_ffn: true,
            embed_dims: 64,
            num_layers: vec![3, 4, 6, 3],
            ..Self::default()
        }
    }

    pub fn stage_dims(&self, stage: usize) -> usize {
        self.embed_dims * self.num_heads[stage]
    }

    pub fn out_channels(&self) -> usize {
        self.stage_dims(self.num_stages - 1)
    }

    /// Stochastic depth rate for every encoder layer, increasing linearly.
    pub fn drop_path_schedule(&self) -> Vec<f32> {
        let total: usize = self.num_layers.iter().sum();
        linspace(0.0, self.drop_path_rate as f32, total)
    }

    /// Grid of the absolute position embedding of a stage at pretraining resolution.
    pub fn pos_shape(&self, stage: usize) -> (usize, usize) {
        let reduction: usize = self.patch_sizes[..=stage].iter().product();
        let side = self.pretrain_img_size / reduction.max(1);
        (side, side)
    }

    /// Token grid (h, w) after every stage for an `(height, width)` input. Errors when a
    /// patch embedding kernel or a spatial-reduction conv does not fit its input.
    pub fn stage_grids(&self, input_hw: (usize, usize)) -> Result<Vec<(usize, usize)>> {
        self.validate()?;
        let conv_out = |size: usize, stage: usize| -> Option<usize> {
            (size + 2 * self.paddings[stage])
                .checked_sub(self.patch_sizes[stage])
                .map(|span| span / self.strides[stage] + 1)
        };
        let (mut h, mut w) = input_hw;
        let mut grids = Vec::with_capacity(self.num_stages);
        for stage in 0..self.num_stages {
            let (Some(oh), Some(ow)) = (conv_out(h, stage), conv_out(w, stage)) else {
                return Err(anyhow!(
                    "input {h}x{w} is too small for the stage {stage} patch embedding (kernel {})",
                    self.patch_sizes[stage]
                ));
            };
            let sr = self.sr_ratios[stage];
            if oh < sr || ow < sr {
                return Err(anyhow!(
                    "stage {stage} grid {oh}x{ow} is too small for sr_ratio {sr}"
                ));
            }
            grids.push((oh, ow));
            (h, w) = (oh, ow);
        }
        Ok(grids)
    }

    pub fn validate(&self) -> Result<()> {
        let per_stage = [
            ("num_layers", self.num_layers.len()),
            ("num_heads", self.num_heads.len()),
            ("patch_sizes", self.patch_sizes.len()),
            ("strides", self.strides.len()),
            ("paddings", self.paddings.len()),
            ("sr_ratios", self.sr_ratios.len()),
            ("mlp_ratios", self.mlp_ratios.len()),
        ];
        if self.num_stages == 0 {
            return Err(anyhow!("num_stages must be at least 1"));
        }
        for (name, len) in per_stage {
            if len != self.num_stages {
                return Err(anyhow!(
                    "{name} has {len} entries, expected num_stages = {}",
                    self.num_stages
                ));
            }
        }
        if let Some(&max_idx) = self.out_indices.iter().max()
            && max_idx >= self.num_stages
        {
            return Err(anyhow!(
                "out_indices {:?} out of range for {} stages",
                self.out_indices,
                self.num_stages
            ));
        }
        if self.num_heads.contains(&0)
            || self.patch_sizes.contains(&0)
            || self.strides.contains(&0)
            || self.sr_ratios.contains(&0)
        {
            return Err(anyhow!(
                "num_heads, patch_sizes, strides and sr_ratios must be positive"
            ));
        }
        if self.embed_dims == 0 || self.in_channels == 0 {
            return Err(anyhow!("embed_dims and in_channels must be positive"));
        }
        for rate in [self.drop_rate, self.attn_drop_rate, self.drop_path_rate] {
            if !(0.0..1.0).contains(&rate) {
                return Err(anyhow!("drop rates must be in [0, 1), got {rate}"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct PoseHeadConfig {
    #[serde(alias = "DECONV_WITH_BIAS")]
    pub deconv_with_bias: bool,
    #[serde(alias = "NUM_DECONV_LAYERS")]
    pub num_deconv_layers: usize,
    #[serde(alias = "NUM_DECONV_FILTERS")]
    pub num_deconv_filters: Vec<usize>,
    #[serde(alias = "NUM_DECONV_KERNELS")]
    pub num_deconv_kernels: Vec<usize>,
    #[serde(alias = "FINAL_CONV_KERNEL")]
    pub final_conv_kernel: usize,
}

impl Default for PoseHeadConfig {
    fn default() -> Self {
        Self {
            deconv_with_bias: false,
            num_deconv_layers: 3,
            num_deconv_filters: vec![256, 256, 256],
            num_deconv_kernels: vec![4, 4, 4],
            final_conv_kernel: 1,
        }
    }
}

/// Transposed conv geometry for a stride-2 upsampling layer: (kernel, padding, output_padding).
pub fn deconv_cfg(deconv_kernel: usize) -> Result<(usize, usize, usize)> {
    match deconv_kernel {
        4 => Ok((4, 1, 0)),
        3 => Ok((3, 1, 1)),
        2 => Ok((2, 0, 0)),
        k => Err(anyhow!("unsupported deconv kernel size {k}, expected 2, 3 or 4")),
    }
}

impl PoseHeadConfig {
    pub fn final_conv_padding(&self) -> usize {
        if self.final_conv_kernel == 3 { 1 } else { 0 }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_deconv_layers != self.num_deconv_filters.len() {
            return Err(anyhow!(
                "ERROR: num_deconv_layers is different len(num_deconv_filters)"
            ));
        }
        if self.num_deconv_layers != self.num_deconv_kernels.len() {
            return Err(anyhow!(
                "ERROR: num_deconv_layers is different len(num_deconv_kernels)"
            ));
        }
        for &k in &self.num_deconv_kernels {
            deconv_cfg(k)?;
        }
        if self.num_deconv_filters.contains(&0) {
            return Err(anyhow!("num_deconv_filters must be positive"));
        }
        if !matches!(self.final_conv_kernel, 1 | 3) {
            return Err(anyhow!(
                "final_conv_kernel must be 1 or 3, got {}",
                self.final_conv_kernel
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct PosePvtConfig {
    pub backbone: PvtConfig,
    #[serde(alias = "extra")]
    pub head: PoseHeadConfig,
    pub num_joints: usize,
    /// Network input as (width, height).
    pub image_size: [usize; 2],
    /// Heatmap resolution as (width, height).
    pub heatmap_size: [usize; 2],
}

impl Default for PosePvtConfig {
    fn default() -> Self {
        Self::pvt_v2()
    }
}

impl PosePvtConfig {
    pub fn pvt_v1() -> Self {
        Self {
            backbone: PvtConfig::pvt_v1(),
            head: PoseHeadConfig::default(),
            num_joints: 17,
            image_size: [192, 256],
            heatmap_size: [48, 64],
        }
    }

    pub fn pvt_v2() -> Self {
        Self {
            backbone: PvtConfig::pvt_v2(),
            ..Self::pvt_v1()
        }
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow!("read config {} failed: {e}", path.display()))?;
        let cfg: Self = serde_json::from_slice(&bytes)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Channels entering the deconvolution head: the width of the last stage.
    pub fn head_in_channels(&self) -> usize {
        self.backbone.out_channels()
    }

    pub fn validate(&self) -> Result<()> {
        self.backbone.validate()?;
        self.head.validate()?;
        if self.num_joints == 0 {
            return Err(anyhow!("num_joints must be positive"));
        }
        if self.image_size.contains(&0) {
            return Err(anyhow!("image_size must be positive"));
        }
        let [width, height] = self.image_size;
        self.backbone
            .stage_grids((height, width))
            .map_err(|e| anyhow!("image_size {width}x{height}: {e}"))?;
        Ok(())
    }
}
