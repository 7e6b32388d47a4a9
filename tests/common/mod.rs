#![allow(dead_code)]

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{Device, Tensor};
use pose_pvt::models::pose_pvt::config::{PoseHeadConfig, PosePvtConfig, PvtConfig};

/// Two-stage PVTv2-style backbone small enough for cpu tests.
pub fn tiny_v2() -> PosePvtConfig {
    PosePvtConfig {
        backbone: PvtConfig {
            pretrain_img_size: 32,
            embed_dims: 8,
            num_stages: 2,
            num_layers: vec![1, 2],
            num_heads: vec![1, 2],
            patch_sizes: vec![7, 3],
            strides: vec![4, 2],
            paddings: vec![3, 1],
            sr_ratios: vec![2, 1],
            out_indices: vec![0, 1],
            mlp_ratios: vec![2, 2],
            use_abs_pos_embed: false,
            norm_after_stage: true,
            use_conv_ffn: true,
            ..PvtConfig::default()
        },
        head: PoseHeadConfig {
            deconv_with_bias: false,
            num_deconv_layers: 1,
            num_deconv_filters: vec![16],
            num_deconv_kernels: vec![4],
            final_conv_kernel: 1,
        },
        num_joints: 3,
        image_size: [32, 32],
        heatmap_size: [8, 8],
    }
}

/// Two-stage PVT v1-style backbone: absolute position embedding, plain FFN.
pub fn tiny_v1() -> PosePvtConfig {
    PosePvtConfig {
        backbone: PvtConfig {
            pretrain_img_size: 32,
            embed_dims: 8,
            num_stages: 2,
            num_layers: vec![1, 1],
            num_heads: vec![1, 2],
            patch_sizes: vec![4, 2],
            strides: vec![4, 2],
            paddings: vec![0, 0],
            sr_ratios: vec![2, 1],
            out_indices: vec![0, 1],
            mlp_ratios: vec![2, 2],
            ..PvtConfig::default()
        },
        head: PoseHeadConfig {
            deconv_with_bias: true,
            num_deconv_layers: 2,
            num_deconv_filters: vec![8, 8],
            num_deconv_kernels: vec![4, 3],
            final_conv_kernel: 3,
        },
        num_joints: 3,
        image_size: [48, 64],
        heatmap_size: [24, 32],
    }
}

fn randn(shape: &[usize], device: &Device) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 0.02f32, shape, device)?)
}

/// Backbone weights named the way the upstream PVT / PVTv2 repositories name them.
pub fn upstream_checkpoint(cfg: &PvtConfig, device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut ckpt = HashMap::new();
    let mut in_c = cfg.in_channels;
    for stage in 0..cfg.num_stages {
        let s = stage + 1;
        let c = cfg.stage_dims(stage);
        let hidden = cfg.mlp_ratios[stage] * c;
        let k = cfg.patch_sizes[stage];
        ckpt.insert(
            format!("patch_embed{s}.proj.weight"),
            randn(&[c, in_c, k, k], device)?,
        );
        ckpt.insert(format!("patch_embed{s}.proj.bias"), randn(&[c], device)?);
        ckpt.insert(format!("patch_embed{s}.norm.weight"), randn(&[c], device)?);
        ckpt.insert(format!("patch_embed{s}.norm.bias"), randn(&[c], device)?);
        if cfg.use_abs_pos_embed {
            let (ph, pw) = cfg.pos_shape(stage);
            ckpt.insert(format!("pos_embed{s}"), randn(&[1, ph * pw, c], device)?);
        }
        for j in 0..cfg.num_layers[stage] {
            let p = format!("block{s}.{j}");
            for norm in ["norm1", "norm2"] {
                ckpt.insert(format!("{p}.{norm}.weight"), randn(&[c], device)?);
                ckpt.insert(format!("{p}.{norm}.bias"), randn(&[c], device)?);
            }
            ckpt.insert(format!("{p}.attn.q.weight"), randn(&[c, c], device)?);
            ckpt.insert(format!("{p}.attn.q.bias"), randn(&[c], device)?);
            ckpt.insert(format!("{p}.attn.kv.weight"), randn(&[2 * c, c], device)?);
            ckpt.insert(format!("{p}.attn.kv.bias"), randn(&[2 * c], device)?);
            ckpt.insert(format!("{p}.attn.proj.weight"), randn(&[c, c], device)?);
            ckpt.insert(format!("{p}.attn.proj.bias"), randn(&[c], device)?);
            let sr = cfg.sr_ratios[stage];
            if sr > 1 {
                ckpt.insert(format!("{p}.attn.sr.weight"), randn(&[c, c, sr, sr], device)?);
                ckpt.insert(format!("{p}.attn.sr.bias"), randn(&[c], device)?);
                ckpt.insert(format!("{p}.attn.norm.weight"), randn(&[c], device)?);
                ckpt.insert(format!("{p}.attn.norm.bias"), randn(&[c], device)?);
            }
            ckpt.insert(format!("{p}.mlp.fc1.weight"), randn(&[hidden, c], device)?);
            ckpt.insert(format!("{p}.mlp.fc1.bias"), randn(&[hidden], device)?);
            if cfg.use_conv_ffn {
                ckpt.insert(
                    format!("{p}.mlp.dwconv.dwconv.weight"),
                    randn(&[hidden, 1, 3, 3], device)?,
                );
                ckpt.insert(format!("{p}.mlp.dwconv.dwconv.bias"), randn(&[hidden], device)?);
            }
            ckpt.insert(format!("{p}.mlp.fc2.weight"), randn(&[c, hidden], device)?);
            ckpt.insert(format!("{p}.mlp.fc2.bias"), randn(&[c], device)?);
        }
        if cfg.norm_after_stage {
            ckpt.insert(format!("norm{s}.weight"), randn(&[c], device)?);
            ckpt.insert(format!("norm{s}.bias"), randn(&[c], device)?);
        }
        in_c = c;
    }
    let last = cfg.out_channels();
    ckpt.insert("head.weight".to_string(), randn(&[10, last], device)?);
    ckpt.insert("head.bias".to_string(), randn(&[10], device)?);
    if cfg.use_abs_pos_embed {
        ckpt.insert("cls_token".to_string(), randn(&[1, 1, last], device)?);
        ckpt.insert("norm.weight".to_string(), randn(&[last], device)?);
        ckpt.insert("norm.bias".to_string(), randn(&[last], device)?);
    }
    Ok(ckpt)
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}
