mod common;

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use pose_pvt::models::pose_pvt::convert::{is_upstream_pvt, pvt_convert};
use pose_pvt::models::pose_pvt::model::PyramidVisionTransformer;

use common::{max_abs_diff, tiny_v1, tiny_v2, upstream_checkpoint};

#[test]
fn converts_pvt_v2_checkpoint() -> Result<()> {
    let device = Device::Cpu;
    let cfg = tiny_v2().backbone;
    let ckpt = upstream_checkpoint(&cfg, &device)?;
    assert!(is_upstream_pvt(&ckpt));
    let converted = pvt_convert(&ckpt)?;
    assert!(!is_upstream_pvt(&converted));

    let proj = &converted["layers.0.0.projection.weight"];
    assert_eq!(proj.dims(), &[8, 3, 7, 7]);
    assert!(converted.contains_key("layers.0.0.norm.bias"));

    // no absolute position embedding: blocks start at index 0
    let in_proj = &converted["layers.1.1.1.attn.attn.in_proj_weight"];
    assert_eq!(in_proj.dims(), &[48, 16]);
    assert_eq!(converted["layers.1.1.1.attn.attn.in_proj_bias"].dims(), &[48]);
    assert_eq!(converted["layers.1.1.0.attn.attn.out_proj.weight"].dims(), &[16, 16]);
    assert_eq!(converted["layers.0.1.0.attn.sr.weight"].dims(), &[8, 8, 2, 2]);
    assert!(converted.contains_key("layers.0.1.0.attn.norm.weight"));

    assert_eq!(converted["layers.0.1.0.ffn.layers.0.weight"].dims(), &[16, 8, 1, 1]);
    assert_eq!(converted["layers.0.1.0.ffn.layers.1.weight"].dims(), &[16, 1, 3, 3]);
    assert_eq!(converted["layers.0.1.0.ffn.layers.4.weight"].dims(), &[8, 16, 1, 1]);
    assert!(converted.contains_key("layers.1.2.weight"));

    assert!(!converted.keys().any(|k| k.contains(".kv.")));
    assert!(!converted.keys().any(|k| k.starts_with("head")));
    Ok(())
}

#[test]
fn packed_projection_is_q_then_kv() -> Result<()> {
    let device = Device::Cpu;
    let cfg = tiny_v2().backbone;
    let ckpt = upstream_checkpoint(&cfg, &device)?;
    let converted = pvt_convert(&ckpt)?;
    let in_proj = &converted["layers.0.1.0.attn.attn.in_proj_weight"];
    let q = &ckpt["block1.0.attn.q.weight"];
    let kv = &ckpt["block1.0.attn.kv.weight"];
    assert_eq!(max_abs_diff(&in_proj.narrow(0, 0, 8)?, q)?, 0.0);
    assert_eq!(max_abs_diff(&in_proj.narrow(0, 8, 16)?, kv)?, 0.0);
    Ok(())
}

#[test]
fn converts_pvt_v1_checkpoint() -> Result<()> {
    let device = Device::Cpu;
    let cfg = tiny_v1().backbone;
    let ckpt = upstream_checkpoint(&cfg, &device)?;
    let converted = pvt_convert(&ckpt)?;

    assert_eq!(converted["layers.0.1.0.pos_embed"].dims(), &[1, 64, 8]);
    assert_eq!(converted["layers.1.1.0.pos_embed"].dims(), &[1, 16, 16]);
    // position embedding shifts the blocks by one
    assert!(converted.contains_key("layers.0.1.1.norm1.weight"));
    assert!(!converted.contains_key("layers.0.1.0.norm1.weight"));
    // plain FFN puts fc2 at index 3
    assert!(converted.contains_key("layers.0.1.1.ffn.layers.3.weight"));
    assert!(!converted.keys().any(|k| k.contains("ffn.layers.4")));
    assert!(!converted.contains_key("cls_token"));
    assert!(!converted.contains_key("norm.weight"));
    Ok(())
}

#[test]
fn converted_weights_build_a_backbone() -> Result<()> {
    let device = Device::Cpu;
    for cfg in [tiny_v1().backbone, tiny_v2().backbone] {
        let converted = pvt_convert(&upstream_checkpoint(&cfg, &device)?)?;
        let vb = VarBuilder::from_tensors(converted, DType::F32, &device);
        let backbone = PyramidVisionTransformer::new(vb, &cfg)?;
        let xs = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &device)?;
        let feats = backbone.forward_features(&xs)?;
        assert_eq!(feats.len(), 2);
        assert_eq!(feats[1].dim(1)?, 16);
    }
    Ok(())
}

#[test]
fn strips_cls_token_from_stage4_pos_embed() -> Result<()> {
    let device = Device::Cpu;
    let pos = Tensor::arange(0f32, 50. * 4., &device)?.reshape((1, 50, 4))?;
    let mut ckpt = HashMap::new();
    ckpt.insert("pos_embed4".to_string(), pos.clone());
    ckpt.insert("pos_embed1".to_string(), Tensor::zeros((1, 50, 4), DType::F32, &device)?);
    let converted = pvt_convert(&ckpt)?;
    let stage4 = &converted["layers.3.1.0.pos_embed"];
    assert_eq!(stage4.dims(), &[1, 49, 4]);
    assert_eq!(max_abs_diff(stage4, &pos.narrow(1, 1, 49)?)?, 0.0);
    // only stage 4 carries the extra token
    assert_eq!(converted["layers.0.1.0.pos_embed"].dims(), &[1, 50, 4]);
    Ok(())
}

#[test]
fn q_without_kv_is_an_error() -> Result<()> {
    let device = Device::Cpu;
    let mut ckpt = HashMap::new();
    ckpt.insert(
        "block1.0.attn.q.weight".to_string(),
        Tensor::zeros((4, 4), DType::F32, &device)?,
    );
    let err = pvt_convert(&ckpt).unwrap_err().to_string();
    assert!(err.contains("block1.0.attn.kv.weight"), "{err}");
    Ok(())
}

#[test]
fn malformed_keys_are_errors() -> Result<()> {
    let device = Device::Cpu;
    let t = Tensor::zeros(4, DType::F32, &device)?;
    for key in ["blockX.0.norm1.weight", "block0.0.norm1.weight", "patch_embed", "pos_embedA"] {
        let mut ckpt = HashMap::new();
        ckpt.insert(key.to_string(), t.clone());
        assert!(pvt_convert(&ckpt).is_err(), "{key}");
    }
    Ok(())
}

#[test]
fn unknown_keys_pass_through() -> Result<()> {
    let device = Device::Cpu;
    let t = Tensor::ones(3, DType::F32, &device)?;
    let mut ckpt = HashMap::new();
    ckpt.insert("final_layer.bias".to_string(), t.clone());
    ckpt.insert("head.weight".to_string(), t.clone());
    let converted = pvt_convert(&ckpt)?;
    assert_eq!(converted.len(), 1);
    assert!(converted.contains_key("final_layer.bias"));
    assert!(!is_upstream_pvt(&ckpt));
    Ok(())
}
