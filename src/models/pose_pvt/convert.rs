//! Key remapping for checkpoints published with the upstream PVT / PVTv2 code
//! (`patch_embed1.*`, `block1.0.attn.q.*`, `norm1.*`, ...) into the
//! `layers.{stage}.{0|1|2}` layout used by [`PyramidVisionTransformer`].
//!
//! [`PyramidVisionTransformer`]: crate::models::pose_pvt::model::PyramidVisionTransformer

use std::collections::HashMap;

use anyhow::{Result, anyhow};
use candle_core::Tensor;

/// Tokens of a 7x7 stage-4 grid plus the classification token.
const STAGE4_TOKENS_WITH_CLS: usize = 50;

fn parse_index(s: &str, key: &str) -> Result<usize> {
    s.parse::<usize>()
        .map_err(|_| anyhow!("malformed checkpoint key {key}: expected an index, got {s:?}"))
}

fn parse_stage(s: &str, key: &str) -> Result<usize> {
    let stage = parse_index(s, key)?;
    if stage == 0 {
        return Err(anyhow!("malformed checkpoint key {key}: stages are numbered from 1"));
    }
    Ok(stage)
}

/// True when the map looks like an upstream PVT checkpoint rather than one already in
/// this crate's layout.
pub fn is_upstream_pvt(ckpt: &HashMap<String, Tensor>) -> bool {
    ckpt.keys()
        .any(|k| k.starts_with("patch_embed1.") || k.starts_with("block1."))
}

pub fn pvt_convert(ckpt: &HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
    let use_abs_pos_embed = ckpt.keys().any(|k| k.starts_with("pos_embed"));
    let use_conv_ffn = ckpt.keys().any(|k| k.contains("dwconv"));
    let layer_offset = usize::from(use_abs_pos_embed);

    let mut new_ckpt = HashMap::with_capacity(ckpt.len());
    for (k, v) in ckpt {
        if k.starts_with("head") || k.starts_with("norm.") || k.starts_with("cls_token") {
            continue;
        }
        let (new_k, new_v) = if let Some(rest) = k.strip_prefix("pos_embed") {
            let stage = parse_stage(rest, k)?;
            let new_v = if stage == 4 && v.dim(1)? == STAGE4_TOKENS_WITH_CLS {
                v.narrow(1, 1, STAGE4_TOKENS_WITH_CLS - 1)?
            } else {
                v.clone()
            };
            (format!("layers.{}.1.0.pos_embed", stage - 1), new_v)
        } else if let Some(rest) = k.strip_prefix("patch_embed") {
            let (stage, tail) = rest
                .split_once('.')
                .ok_or_else(|| anyhow!("malformed checkpoint key {k}"))?;
            let stage = parse_stage(stage, k)?;
            let tail = tail.replace("proj.", "projection.");
            (format!("layers.{}.0.{tail}", stage - 1), v.clone())
        } else if let Some(rest) = k.strip_prefix("block") {
            let mut parts = rest.splitn(3, '.');
            let (stage, layer, tail) = match (parts.next(), parts.next(), parts.next()) {
                (Some(s), Some(l), Some(t)) => (parse_stage(s, k)?, parse_index(l, k)?, t),
                _ => return Err(anyhow!("malformed checkpoint key {k}")),
            };
            let prefix = format!("layers.{}.1.{}", stage - 1, layer + layer_offset);
            if let Some(param) = tail.strip_prefix("attn.q.") {
                let kv_key = format!("block{stage}.{layer}.attn.kv.{param}");
                let kv = ckpt
                    .get(&kv_key)
                    .ok_or_else(|| anyhow!("checkpoint has {k} but no matching {kv_key}"))?;
                let new_v = Tensor::cat(&[v, kv], 0)?;
                (format!("{prefix}.attn.attn.in_proj_{param}"), new_v)
            } else if tail.starts_with("attn.kv.") {
                continue;
            } else if let Some(param) = tail.strip_prefix("attn.proj.") {
                (format!("{prefix}.attn.attn.out_proj.{param}"), v.clone())
            } else if let Some(param) = tail.strip_prefix("mlp.") {
                let new_v = if param == "fc1.weight" || param == "fc2.weight" {
                    let (o, i) = v.dims2()?;
                    v.reshape((o, i, 1, 1))?
                } else {
                    v.clone()
                };
                let fc2_idx = if use_conv_ffn { "4." } else { "3." };
                let param = param
                    .replace("fc1.", "0.")
                    .replace("dwconv.dwconv.", "1.")
                    .replace("fc2.", fc2_idx);
                (format!("{prefix}.ffn.layers.{param}"), new_v)
            } else {
                (format!("{prefix}.{tail}"), v.clone())
            }
        } else if let Some(rest) = k.strip_prefix("norm") {
            let (stage, tail) = rest
                .split_once('.')
                .ok_or_else(|| anyhow!("malformed checkpoint key {k}"))?;
            let stage = parse_stage(stage, k)?;
            (format!("layers.{}.2.{tail}", stage - 1), v.clone())
        } else {
            (k.clone(), v.clone())
        };
        new_ckpt.insert(new_k, new_v);
    }
    tracing::debug!(
        "converted {} upstream tensors into {} (abs_pos_embed={}, conv_ffn={})",
        ckpt.len(),
        new_ckpt.len(),
        use_abs_pos_embed,
        use_conv_ffn
    );
    Ok(new_ckpt)
}
