use anyhow::{Result, anyhow};
use candle_core::{D, DType, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

/// Per-joint argmax of (b, j, h, w) heatmaps.
/// Returns coords `[x, y]` in heatmap pixels and the peak values; joints whose
/// peak is not positive get coords (0, 0).
pub fn get_max_preds(heatmaps: &Tensor) -> Result<(Vec<Vec<[f32; 2]>>, Vec<Vec<f32>>)> {
    if heatmaps.rank() != 4 {
        return Err(anyhow!(
            "heatmaps should be 4-ndim (b, j, h, w), got {:?}",
            heatmaps.shape()
        ));
    }
    let (b, j, _, w) = heatmaps.dims4()?;
    let flat = heatmaps.to_dtype(DType::F32)?.reshape((b, j, ()))?;
    let idx = flat.argmax(D::Minus1)?.to_vec2::<u32>()?;
    let maxvals = flat.max(D::Minus1)?.to_vec2::<f32>()?;
    let coords = idx
        .iter()
        .zip(maxvals.iter())
        .map(|(idx_b, max_b)| {
            idx_b
                .iter()
                .zip(max_b.iter())
                .map(|(&i, &m)| {
                    if m > 0.0 {
                        [(i as usize % w) as f32, (i as usize / w) as f32]
                    } else {
                        [0.0, 0.0]
                    }
                })
                .collect()
        })
        .collect();
    Ok((coords, maxvals))
}

/// Argmax decoding with the usual quarter-pixel shift toward the higher neighbour,
/// rescaled from heatmap pixels to a `(width, height)` source image.
pub fn get_final_preds(heatmaps: &Tensor, src_size: (u32, u32)) -> Result<Vec<Vec<Keypoint>>> {
    let (coords, maxvals) = get_max_preds(heatmaps)?;
    let (b, _, h, w) = heatmaps.dims4()?;
    let hm = heatmaps.to_dtype(DType::F32)?;
    let scale_x = src_size.0 as f32 / w as f32;
    let scale_y = src_size.1 as f32 / h as f32;
    let mut preds = Vec::with_capacity(b);
    for (bi, (coords_b, max_b)) in coords.into_iter().zip(maxvals.into_iter()).enumerate() {
        let hm_b = hm.get(bi)?.to_vec3::<f32>()?;
        let mut keypoints = Vec::with_capacity(coords_b.len());
        for (ji, ([mut x, mut y], score)) in coords_b.into_iter().zip(max_b).enumerate() {
            let px = (x + 0.5).floor() as usize;
            let py = (y + 0.5).floor() as usize;
            if 1 < px && px < w - 1 && 1 < py && py < h - 1 {
                let hm_j = &hm_b[ji];
                let dx = hm_j[py][px + 1] - hm_j[py][px - 1];
                let dy = hm_j[py + 1][px] - hm_j[py - 1][px];
                x += signum(dx) * 0.25;
                y += signum(dy) * 0.25;
            }
            keypoints.push(Keypoint {
                x: x * scale_x,
                y: y * scale_y,
                score,
            });
        }
        preds.push(keypoints);
    }
    Ok(preds)
}

fn signum(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}
