pub mod common;
pub mod pose_pvt;

use anyhow::Result;

use crate::models::pose_pvt::{config::PosePvtConfig, generate::PosePvtModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WhichModel {
    #[value(name = "pvt-v1")]
    PvtV1,
    #[value(name = "pvt-v2")]
    PvtV2,
}

impl WhichModel {
    pub fn config(&self) -> PosePvtConfig {
        match self {
            WhichModel::PvtV1 => PosePvtConfig::pvt_v1(),
            WhichModel::PvtV2 => PosePvtConfig::pvt_v2(),
        }
    }
}

/// A `config.json` next to the weights takes precedence over the preset.
pub fn load_model(model_type: WhichModel, path: &str) -> Result<PosePvtModel> {
    let config_path = std::path::Path::new(path).join("config.json");
    let cfg = if config_path.is_file() {
        PosePvtConfig::from_file(&config_path)?
    } else {
        model_type.config()
    };
    PosePvtModel::init_with_config(path, cfg, None, None)
}
