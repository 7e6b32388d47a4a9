mod common;

use std::io::{Read, Write};

use anyhow::Result;
use base64::{Engine, engine::general_purpose};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use pose_pvt::models::pose_pvt::generate::PosePvtModel;
use pose_pvt::utils::img_utils::{IMAGENET_MEAN, get_image};

use common::tiny_v2;

fn test_image(width: u32, height: u32) -> DynamicImage {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 7 % 256) as u8, (y * 11 % 256) as u8, 128])
    });
    DynamicImage::ImageRgb8(img)
}

fn tiny_model() -> Result<PosePvtModel> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    PosePvtModel::from_var_builder(vb, tiny_v2())
}

#[test]
fn keypoints_per_image_in_source_pixels() -> Result<()> {
    let model = tiny_model()?;
    assert_eq!(model.model_name(), "pose-pvt-v2");
    let imgs = [test_image(40, 60), test_image(32, 32)];
    let heatmaps = model.heatmaps(&imgs)?;
    assert_eq!(heatmaps.dims(), &[2, 3, 8, 8]);

    let preds = model.inference(&imgs)?;
    assert_eq!(preds.len(), 2);
    for (kps, img) in preds.iter().zip(imgs.iter()) {
        assert_eq!(kps.len(), 3);
        for kp in kps {
            assert!(kp.x >= 0.0 && kp.x <= img.width() as f32, "{kp:?}");
            assert!(kp.y >= 0.0 && kp.y <= img.height() as f32, "{kp:?}");
        }
    }
    Ok(())
}

#[test]
fn empty_batch_is_an_error() -> Result<()> {
    let model = tiny_model()?;
    assert!(model.inference(&[]).is_err());
    Ok(())
}

#[test]
fn keypoints_serialize_as_json() -> Result<()> {
    let model = tiny_model()?;
    let preds = model.inference(&[test_image(16, 16)])?;
    let json = serde_json::to_value(&preds[0])?;
    let first = &json[0];
    assert!(first["x"].is_number() && first["y"].is_number() && first["score"].is_number());
    Ok(())
}

#[test]
fn weight_dir_without_weights_fails() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("pose_pvt_empty_{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let res = PosePvtModel::init(&dir.to_string_lossy(), Some(&Device::Cpu), None);
    assert!(res.is_err());
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn loads_images_from_path_and_data_uri() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("pose_pvt_img_{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("person.png");
    let img = test_image(20, 10);
    img.save(&path)?;

    let from_path = get_image(&path.to_string_lossy())?;
    assert_eq!((from_path.width(), from_path.height()), (20, 10));
    let from_url = get_image(&format!("file://{}", path.display()))?;
    assert_eq!(from_url.to_rgb8(), img.to_rgb8());

    let mut png = std::io::Cursor::new(Vec::new());
    img.write_to(&mut png, ImageFormat::Png)?;
    let uri = format!(
        "data:image/png;base64,{}",
        general_purpose::STANDARD.encode(png.into_inner())
    );
    let from_uri = get_image(&uri)?;
    assert_eq!(from_uri.to_rgb8(), img.to_rgb8());

    assert!(get_image("data:image/png;nothing").is_err());
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn preprocessing_normalises_with_imagenet_stats() -> Result<()> {
    use pose_pvt::utils::img_utils::{IMAGENET_STD, img_transform_with_resize};

    let device = Device::Cpu;
    let mean = candle_core::Tensor::from_slice(&IMAGENET_MEAN, (3, 1, 1), &device)?;
    let std = candle_core::Tensor::from_slice(&IMAGENET_STD, (3, 1, 1), &device)?;
    let black = DynamicImage::ImageRgb8(RgbImage::new(10, 6));
    let t = img_transform_with_resize(&black, 8, 4, &mean, &std, &device, DType::F32)?;
    assert_eq!(t.dims(), &[3, 4, 8]);
    let red_plane = t.get(0)?.flatten_all()?.to_vec1::<f32>()?;
    let expected = -IMAGENET_MEAN[0] / IMAGENET_STD[0];
    assert!(red_plane.iter().all(|v| (v - expected).abs() < 1e-5));
    Ok(())
}

/// Answers a single GET with `body` as a png, returns the url to fetch.
fn serve_png_once(body: Vec<u8>) -> Result<String> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request);
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(header.as_bytes());
            let _ = stream.write_all(&body);
        }
    });
    Ok(format!("http://{addr}/person.png"))
}

fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut png = std::io::Cursor::new(Vec::new());
    img.write_to(&mut png, ImageFormat::Png)?;
    Ok(png.into_inner())
}

#[tokio::test]
async fn http_image_on_current_thread_runtime() -> Result<()> {
    let img = test_image(12, 9);
    let url = serve_png_once(png_bytes(&img)?)?;
    let fetched = get_image(&url)?;
    assert_eq!(fetched.to_rgb8(), img.to_rgb8());

    // nothing listens on port 1
    assert!(get_image("http://127.0.0.1:1/person.png").is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn http_image_on_multi_thread_runtime() -> Result<()> {
    let img = test_image(7, 5);
    let url = serve_png_once(png_bytes(&img)?)?;
    let fetched = get_image(&url)?;
    assert_eq!(fetched.to_rgb8(), img.to_rgb8());
    Ok(())
}
