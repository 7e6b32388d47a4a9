//! Pose estimation exec implementation for CLI `run` subcommand

use std::time::Instant;

use anyhow::Result;

use crate::exec::ExecModel;
use crate::models::{WhichModel, load_model};
use crate::utils::img_utils::get_image;

pub struct PosePvtExec;

impl ExecModel for PosePvtExec {
    fn run(model: WhichModel, input: &str, output: Option<&str>, weight_path: &str) -> Result<()> {
        let i_start = Instant::now();
        let pose_model = load_model(model, weight_path)?;
        let i_duration = i_start.elapsed();
        println!("Time elapsed in load model is: {:?}", i_duration);

        let img = get_image(input)?;

        let i_start = Instant::now();
        let result = pose_model.inference(std::slice::from_ref(&img))?;
        let i_duration = i_start.elapsed();
        println!("Time elapsed in inference is: {:?}", i_duration);

        let output_path = match output {
            Some(out) => out.to_string(),
            None => {
                let timestamp = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)?
                    .as_secs();
                format!("pose_{}.json", timestamp)
            }
        };
        let body = serde_json::json!({
            "model": pose_model.model_name(),
            "image_size": [img.width(), img.height()],
            "keypoints": result[0],
        });
        std::fs::write(&output_path, serde_json::to_string_pretty(&body)?)?;
        println!("Output saved to: {}", output_path);

        Ok(())
    }
}
