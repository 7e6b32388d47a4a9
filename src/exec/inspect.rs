//! Checkpoint summary for the CLI `inspect` subcommand

use std::collections::BTreeMap;

use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use crate::models::{
    WhichModel,
    pose_pvt::{
        convert::{is_upstream_pvt, pvt_convert},
        model::PosePvt,
        weights::{LoadReport, load_pretrained, load_state_dict, read_checkpoint},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub num_tensors: usize,
    pub num_params: usize,
    pub upstream_layout: bool,
    /// Parameter count per top-level prefix (`layers.0`, `deconv_layers`, ...).
    pub groups: BTreeMap<String, usize>,
}

fn group_of(name: &str) -> String {
    let mut parts = name.split('.');
    match (parts.next(), parts.next()) {
        (Some(head), Some(idx)) if head == "layers" => format!("{head}.{idx}"),
        (Some(head), _) => head.to_string(),
        _ => name.to_string(),
    }
}

pub fn summarize(input: &str, key: Option<&str>) -> Result<CheckpointSummary> {
    let raw = read_checkpoint(input, key, &Device::Cpu)?;
    let upstream_layout = is_upstream_pvt(&raw);
    let tensors = if upstream_layout {
        pvt_convert(&raw)?
    } else {
        raw
    };
    let mut groups = BTreeMap::new();
    let mut num_params = 0;
    for (name, t) in &tensors {
        let n = t.elem_count();
        num_params += n;
        *groups.entry(group_of(name)).or_insert(0) += n;
    }
    Ok(CheckpointSummary {
        num_tensors: tensors.len(),
        num_params,
        upstream_layout,
        groups,
    })
}

/// Dry-run load of the checkpoint into a freshly built model of the given preset.
pub fn check_against(model: WhichModel, input: &str, key: Option<&str>) -> Result<LoadReport> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let _model = PosePvt::new(vb, &model.config())?;
    let tensors = load_state_dict(input, key, &device)?;
    load_pretrained(&varmap, &tensors)
}

pub fn run_inspect(input: &str, key: Option<&str>, model: Option<WhichModel>) -> Result<()> {
    let summary = summarize(input, key)?;
    println!(
        "{input}: {} tensors, {} parameters{}",
        summary.num_tensors,
        summary.num_params,
        if summary.upstream_layout {
            " (upstream PVT layout, remapped)"
        } else {
            ""
        }
    );
    for (group, n) in &summary.groups {
        println!("  {group:<16} {n}");
    }
    if let Some(model) = model {
        let report = check_against(model, input, key)?;
        println!(
            "against {model:?}: {} loaded, {} missing, {} unexpected",
            report.loaded.len(),
            report.missing.len(),
            report.unexpected.len()
        );
        for name in &report.missing {
            println!("  missing    {name}");
        }
        for name in &report.unexpected {
            println!("  unexpected {name}");
        }
    }
    Ok(())
}
