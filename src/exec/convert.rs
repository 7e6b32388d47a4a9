//! Upstream PVT checkpoint -> safetensors in this crate's key layout

use std::path::Path;

use anyhow::{Result, anyhow};
use candle_core::Device;

use crate::models::pose_pvt::convert::{is_upstream_pvt, pvt_convert};
use crate::models::pose_pvt::weights::read_checkpoint;

pub fn run_convert(input: &str, output: &str, key: Option<&str>) -> Result<usize> {
    if Path::new(output).extension().and_then(|e| e.to_str()) != Some("safetensors") {
        return Err(anyhow!("output must be a .safetensors file, got {output}"));
    }
    let tensors = read_checkpoint(input, key, &Device::Cpu)?;
    let tensors = if is_upstream_pvt(&tensors) {
        pvt_convert(&tensors)?
    } else {
        tracing::warn!("{input} does not look like an upstream PVT checkpoint, saving keys as-is");
        tensors
    };
    // safetensors needs contiguous buffers, narrowed pos embeds are views
    let tensors = tensors
        .into_iter()
        .map(|(k, v)| Ok((k, v.contiguous()?)))
        .collect::<Result<std::collections::HashMap<_, _>>>()?;
    candle_core::safetensors::save(&tensors, output)?;
    println!("Saved {} tensors to: {}", tensors.len(), output);
    Ok(tensors.len())
}
