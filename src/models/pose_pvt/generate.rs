use std::collections::HashMap;
use std::path::Path;

use anyhow::{Result, anyhow};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use image::DynamicImage;

use crate::{
    models::pose_pvt::{
        config::PosePvtConfig,
        model::PosePvt,
        weights::load_state_dict,
    },
    utils::{
        find_type_files, get_device, get_dtype,
        heatmap_utils::{Keypoint, get_final_preds},
        img_utils::{IMAGENET_MEAN, IMAGENET_STD, img_transform_with_resize},
    },
};

pub struct PosePvtModel {
    model: PosePvt,
    cfg: PosePvtConfig,
    img_mean: Tensor,
    img_std: Tensor,
    device: Device,
    dtype: DType,
    model_name: String,
}

impl PosePvtModel {
    /// Loads `config.json` from `path` when present, otherwise the PVTv2 preset.
    pub fn init(path: &str, device: Option<&Device>, dtype: Option<DType>) -> Result<Self> {
        let config_path = Path::new(path).join("config.json");
        let cfg = if config_path.is_file() {
            PosePvtConfig::from_file(&config_path)?
        } else {
            tracing::info!("no config.json in {path}, using the pvt-v2 preset");
            PosePvtConfig::pvt_v2()
        };
        Self::init_with_config(path, cfg, device, dtype)
    }

    pub fn init_with_config(
        path: &str,
        cfg: PosePvtConfig,
        device: Option<&Device>,
        dtype: Option<DType>,
    ) -> Result<Self> {
        cfg.validate()?;
        let device = get_device(device);
        let dtype = get_dtype(dtype, "float32");
        let safetensors = find_type_files(path, "safetensors")?;
        let vb = if !safetensors.is_empty() {
            unsafe { VarBuilder::from_mmaped_safetensors(&safetensors, dtype, &device)? }
        } else {
            let mut pickles = find_type_files(path, "pth")?;
            pickles.extend(find_type_files(path, "pt")?);
            if pickles.is_empty() {
                return Err(anyhow!("no .safetensors or .pth weights found in {path}"));
            }
            let mut tensors = HashMap::new();
            for file in pickles {
                tensors.extend(load_state_dict(&file, None, &device)?);
            }
            VarBuilder::from_tensors(tensors, dtype, &device)
        };
        Self::from_var_builder(vb, cfg)
    }

    pub fn from_var_builder(vb: VarBuilder, cfg: PosePvtConfig) -> Result<Self> {
        let device = vb.device().clone();
        let dtype = vb.dtype();
        let model = PosePvt::new(vb, &cfg)?;
        let img_mean = Tensor::from_slice(&IMAGENET_MEAN, (3, 1, 1), &device)?.to_dtype(dtype)?;
        let img_std = Tensor::from_slice(&IMAGENET_STD, (3, 1, 1), &device)?.to_dtype(dtype)?;
        let model_name = if cfg.backbone.use_conv_ffn {
            "pose-pvt-v2"
        } else {
            "pose-pvt-v1"
        };
        Ok(Self {
            model,
            cfg,
            img_mean,
            img_std,
            device,
            dtype,
            model_name: model_name.to_string(),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn config(&self) -> &PosePvtConfig {
        &self.cfg
    }

    fn preprocess(&self, img: &DynamicImage) -> Result<Tensor> {
        let [width, height] = self.cfg.image_size;
        img_transform_with_resize(
            img,
            width as u32,
            height as u32,
            &self.img_mean,
            &self.img_std,
            &self.device,
            self.dtype,
        )
    }

    /// Raw (n, num_joints, h, w) heatmaps for a batch of images.
    pub fn heatmaps(&self, imgs: &[DynamicImage]) -> Result<Tensor> {
        if imgs.is_empty() {
            return Err(anyhow!("no image to estimate pose on"));
        }
        let batch = imgs
            .iter()
            .map(|img| self.preprocess(img))
            .collect::<Result<Vec<_>>>()?;
        let batch = Tensor::stack(&batch, 0)?;
        let heatmaps = self.model.forward(&batch)?;
        let (_, _, h, w) = heatmaps.dims4()?;
        if [w, h] != self.cfg.heatmap_size {
            tracing::warn!(
                "network produced {w}x{h} heatmaps, config says {:?}",
                self.cfg.heatmap_size
            );
        }
        Ok(heatmaps)
    }

    /// Keypoints in source-image pixel coordinates, one list per image.
    pub fn inference(&self, imgs: &[DynamicImage]) -> Result<Vec<Vec<Keypoint>>> {
        let heatmaps = self.heatmaps(imgs)?;
        let mut preds = Vec::with_capacity(imgs.len());
        for (i, img) in imgs.iter().enumerate() {
            let hm = heatmaps.narrow(0, i, 1)?;
            let mut kps = get_final_preds(&hm, (img.width(), img.height()))?;
            preds.push(kps.remove(0));
        }
        Ok(preds)
    }
}
