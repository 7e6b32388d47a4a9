use std::io::Cursor;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use base64::{Engine, engine::general_purpose};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, ImageReader, imageops::FilterType};
use tokio::runtime::RuntimeFlavor;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

fn decode_image_bytes(bytes: impl AsRef<[u8]>) -> Result<DynamicImage> {
    let cursor = Cursor::new(bytes.as_ref());
    let img = ImageReader::new(cursor)
        .with_guessed_format()
        .map_err(|e| anyhow!(format!("Failed to read image format: {}", e)))?
        .decode()
        .map_err(|e| anyhow!(format!("Failed to decode image: {}", e)))?;
    Ok(img)
}

pub fn load_image_from_url(url: &str) -> Result<DynamicImage> {
    let fetch = || -> Result<DynamicImage> {
        let response = reqwest::blocking::get(url)
            .map_err(|e| anyhow!(format!("Failed to fetch image from url: {}", e)))?;
        let bytes = response
            .bytes()
            .map_err(|e| anyhow!(format!("Failed to get image bytes: {}", e)))?;
        decode_image_bytes(bytes)
    };
    // blocking reqwest must not run directly on a tokio worker
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(fetch)
        }
        // block_in_place is unavailable on a current-thread runtime
        Ok(_) => std::thread::scope(|s| {
            s.spawn(fetch)
                .join()
                .map_err(|_| anyhow!("image fetch thread panicked"))?
        }),
        Err(_) => fetch(),
    }
}

pub fn load_image_from_base64(base64_data: &str) -> Result<DynamicImage> {
    let image_data = general_purpose::STANDARD
        .decode(base64_data.trim())
        .map_err(|e| anyhow!(format!("Failed to decode image: {}", e)))?;
    decode_image_bytes(image_data)
}

pub fn get_file_path(file: &str) -> Result<PathBuf> {
    let path = url::Url::parse(file)?;
    let path = match path.to_file_path() {
        Ok(path) => path,
        Err(_) => PathBuf::from(file.trim_start_matches("file://")),
    };
    Ok(path)
}

/// Accepts `http(s)://` urls, `file://` urls, `data:image/...;base64,` uris and plain paths.
pub fn get_image(file: &str) -> Result<DynamicImage> {
    if file.starts_with("http://") || file.starts_with("https://") {
        return load_image_from_url(file);
    }
    if file.starts_with("data:image") {
        let (_, data) = file
            .split_once("base64,")
            .ok_or_else(|| anyhow!("data uri without base64 payload"))?;
        return load_image_from_base64(data);
    }
    let path = if file.starts_with("file://") {
        get_file_path(file)?
    } else {
        PathBuf::from(file)
    };
    let img = ImageReader::open(&path)
        .map_err(|e| anyhow!(format!("Failed to open file {}: {}", path.display(), e)))?
        .decode()
        .map_err(|e| anyhow!(format!("Failed to decode image: {}", e)))?;
    Ok(img)
}

/// Resizes to `(width, height)` and returns a normalised (3, h, w) tensor.
pub fn img_transform_with_resize(
    img: &DynamicImage,
    width: u32,
    height: u32,
    mean: &Tensor,
    std: &Tensor,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let img = if img.width() != width || img.height() != height {
        img.resize_exact(width, height, FilterType::Triangle)
    } else {
        img.clone()
    };
    img_transform(&img, mean, std, device, dtype)
}

pub fn img_transform(
    img: &DynamicImage,
    mean: &Tensor,
    std: &Tensor,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let img_h = img.height();
    let img_w = img.width();
    let img_vec = img.to_rgb8().into_raw();
    // (h, w, c) => (c, h, w)
    let img_tensor = Tensor::from_vec(img_vec, (img_h as usize, img_w as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    let img_tensor = img_tensor.affine(1.0 / 255.0, 0.)?;
    let img_tensor = img_tensor
        .broadcast_sub(&mean.to_dtype(DType::F32)?)?
        .broadcast_div(&std.to_dtype(DType::F32)?)?
        .to_dtype(dtype)?;
    Ok(img_tensor)
}
