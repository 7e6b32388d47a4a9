use anyhow::{Result, anyhow};
use candle_core::{Device, Tensor};

pub fn compute_1d_coords(
    input_size: usize,
    output_size: usize,
    align_corner: Option<bool>,
) -> Vec<f32> {
    if input_size == 1 {
        vec![0f32; output_size]
    } else if let Some(align_) = align_corner
        && align_
        && output_size > 1
    {
        (0..output_size)
            .map(|i| i as f32 * (input_size - 1) as f32 / (output_size - 1) as f32)
            .collect()
    } else {
        (0..output_size)
            .map(|i| (i as f32 + 0.5) * (input_size as f32 / output_size as f32) - 0.5)
            .collect()
    }
}

/// Linear resampling matrix of shape (output_size, input_size).
pub fn linear_resample_matrix(
    input_size: usize,
    output_size: usize,
    align_corner: Option<bool>,
    device: &Device,
) -> Result<Tensor> {
    let coords = compute_1d_coords(input_size, output_size, align_corner);
    let mut weights = vec![0f32; output_size * input_size];
    for (i, &coord) in coords.iter().enumerate() {
        let coord = coord.clamp(0.0, (input_size - 1) as f32);
        let x0 = coord.floor() as usize;
        let x1 = std::cmp::min(x0 + 1, input_size - 1);
        let l1 = coord - x0 as f32;
        weights[i * input_size + x0] += 1.0 - l1;
        weights[i * input_size + x1] += l1;
    }
    let t = Tensor::from_vec(weights, (output_size, input_size), device)?;
    Ok(t)
}

/// Bilinear resize of a (b, c, h, w) tensor, expressed as two matmuls so it
/// stays on device and keeps gradients.
pub fn interpolate_bilinear(
    input: &Tensor,
    target_size: (usize, usize),
    align_corner: Option<bool>,
) -> Result<Tensor> {
    if input.rank() != 4 {
        return Err(anyhow!(
            "Input rank must have equal to 4 dimensions [b, c, h, w]"
        ));
    }
    let (_, _, input_height, input_width) = input.dims4()?;
    let (target_height, target_width) = target_size;
    if input_height == target_height && input_width == target_width {
        return Ok(input.clone());
    }
    if target_height == 0 || target_width == 0 {
        return Err(anyhow!("interpolate target size must be non-zero"));
    }
    let rh = linear_resample_matrix(input_height, target_height, align_corner, input.device())?
        .to_dtype(input.dtype())?;
    let rw = linear_resample_matrix(input_width, target_width, align_corner, input.device())?
        .to_dtype(input.dtype())?;
    // (th, ih) x (b, c, ih, iw) x (iw, tw)
    let output = rh
        .broadcast_matmul(&input.contiguous()?)?
        .broadcast_matmul(&rw.t()?.contiguous()?)?;
    Ok(output.contiguous()?)
}

pub fn linspace(start: f32, end: f32, steps: usize) -> Vec<f32> {
    match steps {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step_size = (end - start) / (steps - 1) as f32;
            (0..steps).map(|i| start + i as f32 * step_size).collect()
        }
    }
}
