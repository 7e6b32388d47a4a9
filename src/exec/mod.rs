//! CLI exec module for direct model inference
//!
//! Implementations behind the `run`, `convert` and `inspect` subcommands.

pub mod convert;
pub mod inspect;
pub mod pose_pvt;

use anyhow::Result;

use crate::models::WhichModel;

/// Trait for model exec implementations
pub trait ExecModel {
    /// Run inference with the given input and output parameters
    ///
    /// # Arguments
    /// * `model` - Preset used when the weight directory has no `config.json`
    /// * `input` - Image path, `file://` / `http(s)://` url or base64 data uri
    /// * `output` - Optional output file path (if None, a timestamped name is used)
    /// * `weight_path` - Directory holding the model weights
    fn run(model: WhichModel, input: &str, output: Option<&str>, weight_path: &str) -> Result<()>;
}
