//! Ground-truth instance masks from polygon annotations
//!
//! Images in a batch share one padded canvas but each has its own true size,
//! read off the padding mask. Polygons are rasterized at the true size and
//! pasted into the top-left corner of a zero canvas.

use candle_core::{DType, Device, Result, Tensor};
use cocotools::mask::{Polygon, Rle};
use tracing::debug;

/// All polygon parts of one object
pub type ObjectPolygons = Vec<Polygon>;

/// All objects of one image
pub type ImagePolygons = Vec<ObjectPolygons>;

/// Rasterize per-image polygon annotations into padded mask tensors.
///
/// # Arguments
/// * `gt_poly` - Polygons per image, per object, per part
/// * `pad_mask` - Validity mask [B, H_pad, W_pad], 1 inside the image and 0 in the padding
///
/// # Returns
/// One f32 tensor [N_i, H_pad, W_pad] per image; an image without objects gets [0, H_pad, W_pad]
pub fn gt_masks_from_polygons(gt_poly: &[ImagePolygons], pad_mask: &Tensor) -> Result<Vec<Tensor>> {
    let (bs, pad_h, pad_w) = pad_mask.dims3()?;
    if gt_poly.len() != bs {
        candle_core::bail!(
            "got polygons for {} images but the padding mask covers {}",
            gt_poly.len(),
            bs
        );
    }
    let pad_mask = pad_mask.to_dtype(DType::F32)?;
    let device = pad_mask.device();

    let mut out = Vec::with_capacity(bs);
    for (i, objects) in gt_poly.iter().enumerate() {
        let padding = pad_mask.get(i)?;
        let height = marginal_sum(&padding.narrow(1, 0, 1)?)?;
        let width = marginal_sum(&padding.narrow(0, 0, 1)?)?;
        if height > pad_h || width > pad_w {
            candle_core::bail!(
                "image {} has size {}x{} beyond the padded canvas {}x{}",
                i,
                height,
                width,
                pad_h,
                pad_w
            );
        }
        debug!(image = i, objects = objects.len(), height, width, "rasterizing gt masks");
        out.push(rasterize_image(objects, height, width, pad_h, pad_w, device)?);
    }
    Ok(out)
}

fn marginal_sum(line: &Tensor) -> Result<usize> {
    let total = line.sum_all()?.to_scalar::<f32>()?;
    Ok(total.round().max(0.0) as usize)
}

fn rasterize_image(
    objects: &[ObjectPolygons],
    height: usize,
    width: usize,
    pad_h: usize,
    pad_w: usize,
    device: &Device,
) -> Result<Tensor> {
    let num_objects = objects.len();
    if num_objects == 0 || height == 0 || width == 0 {
        return Tensor::zeros((num_objects, pad_h, pad_w), DType::F32, device);
    }

    let mut data = Vec::with_capacity(num_objects * height * width);
    for polygons in objects {
        let rle = Rle::from_object(polygons, height, width).map_err(candle_core::Error::wrap)?;
        data.extend(rle.decode().into_iter().map(f32::from));
    }

    Tensor::from_vec(data, (num_objects, height, width), device)?
        .pad_with_zeros(1, 0, pad_h - height)?
        .pad_with_zeros(2, 0, pad_w - width)
}
