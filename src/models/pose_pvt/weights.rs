use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Result, anyhow};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::models::{
    common::is_float,
    pose_pvt::{
        config::PosePvtConfig,
        convert::{is_upstream_pvt, pvt_convert},
        model::PosePvt,
    },
};

/// Outcome of a non-strict load into a [`VarMap`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Dict keys training checkpoints commonly nest their weights under.
const NESTED_STATE_DICT_KEYS: [&str; 2] = ["state_dict", "model"];

fn read_pickle(path: &Path, key: Option<&str>) -> Result<Vec<(String, Tensor)>> {
    let tensors = candle_core::pickle::read_all_with_key(path, key)?;
    if key.is_some() || !tensors.is_empty() {
        return Ok(tensors);
    }
    for nested in NESTED_STATE_DICT_KEYS {
        match candle_core::pickle::read_all_with_key(path, Some(nested)) {
            Ok(tensors) if !tensors.is_empty() => {
                tracing::info!(
                    "no tensors at the top level of {}, using {nested:?}",
                    path.display()
                );
                return Ok(tensors);
            }
            _ => {}
        }
    }
    Ok(tensors)
}

/// Reads a `.safetensors` file or a PyTorch pickle (`.pth`, `.pt`, `.bin`, `.ckpt`).
/// `key` selects a nested dict in pickles such as `state_dict`. Without a key, a pickle
/// holding no top-level tensors is searched under `state_dict` and then `model`.
pub fn read_checkpoint(
    path: impl AsRef<Path>,
    key: Option<&str>,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let tensors = match extension {
        "safetensors" => candle_core::safetensors::load(path, device)?,
        "pth" | "pt" | "bin" | "ckpt" => {
            let mut tensors = HashMap::new();
            for (k, v) in read_pickle(path, key)? {
                tensors.insert(k, v.to_device(device)?);
            }
            tensors
        }
        other => {
            return Err(anyhow!(
                "unsupported checkpoint extension {other:?} for {}",
                path.display()
            ));
        }
    };
    tracing::info!("read {} tensors from {}", tensors.len(), path.display());
    Ok(tensors)
}

/// Reads a checkpoint and remaps upstream PVT keys when needed.
pub fn load_state_dict(
    path: impl AsRef<Path>,
    key: Option<&str>,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let tensors = read_checkpoint(path, key, device)?;
    if is_upstream_pvt(&tensors) {
        tracing::info!("upstream PVT checkpoint detected, remapping keys");
        return pvt_convert(&tensors);
    }
    Ok(tensors)
}

/// Copies every tensor whose name exists in `varmap`; like a non-strict
/// `load_state_dict`, absent or extra names are reported, mismatched shapes are errors.
/// Shapes are checked before anything is copied, so a failed load leaves `varmap` as it was.
pub fn load_pretrained(varmap: &VarMap, tensors: &HashMap<String, Tensor>) -> Result<LoadReport> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| anyhow!("varmap lock poisoned: {e}"))?;
    let mut report = LoadReport::default();
    let mut matched = Vec::new();
    for (name, var) in data.iter() {
        let Some(src) = tensors.get(name) else {
            report.missing.push(name.clone());
            continue;
        };
        if src.shape() != var.shape() {
            return Err(anyhow!(
                "size mismatch for {name}: checkpoint {:?}, model {:?}",
                src.shape(),
                var.shape()
            ));
        }
        matched.push((name, var, src));
    }
    for (name, var, src) in matched {
        let src = if is_float(src.dtype()) {
            src.to_dtype(var.dtype())?
        } else {
            src.clone()
        };
        var.set(&src.to_device(var.device())?)?;
        report.loaded.push(name.clone());
    }
    let known: HashSet<&String> = data.keys().collect();
    report.unexpected = tensors
        .keys()
        .filter(|k| !known.contains(k))
        .cloned()
        .collect();
    report.loaded.sort();
    report.missing.sort();
    report.unexpected.sort();
    for name in &report.missing {
        tracing::debug!("=> {name} not in checkpoint, keeps its initialisation");
    }
    tracing::info!(
        "loaded {} tensors, {} missing, {} unexpected",
        report.loaded.len(),
        report.missing.len(),
        report.unexpected.len()
    );
    Ok(report)
}

impl PosePvt {
    /// Trainable model: parameters live in the returned [`VarMap`], freshly initialised
    /// (head weights normal(0, 0.001), batch norms 1/0, linears trunc-normal(0.02), ...)
    /// and then overwritten by `pretrained` where names match.
    pub fn for_training(
        cfg: &PosePvtConfig,
        pretrained: Option<&Path>,
        device: &Device,
        dtype: DType,
    ) -> Result<(Self, VarMap, Option<LoadReport>)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let model = PosePvt::new(vb, cfg)?;
        let report = match pretrained {
            Some(path) if path.is_file() => {
                tracing::info!("=> loading pretrained model {}", path.display());
                let tensors = load_state_dict(path, None, device)?;
                Some(load_pretrained(&varmap, &tensors)?)
            }
            Some(path) => {
                tracing::warn!(
                    "pretrained checkpoint {} not found, init weights from normal distribution",
                    path.display()
                );
                None
            }
            None => {
                tracing::info!("=> init weights from normal distribution");
                None
            }
        };
        Ok((model, varmap, report))
    }
}
