//! Rasterize subcommand: polygon annotations to a color-coded mask image.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use cocotools::mask::Rle;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use tracing::info;

use candle_detr_head::gt_mask::ImagePolygons;

/// Arguments for the rasterize subcommand
#[derive(Args, Debug)]
pub struct RasterizeArgs {
    /// JSON file holding a list of objects, each a list of flat [x0, y0, x1, y1, ...] polygons.
    pub polygons: PathBuf,

    #[arg(long)]
    pub height: usize,

    #[arg(long)]
    pub width: usize,

    /// Output image.
    #[arg(long, short, default_value = "masks.png")]
    pub output: PathBuf,

    /// Also write the run-length encodings as JSON.
    #[arg(long)]
    pub rle_output: Option<PathBuf>,

    /// Draw each object's bounding box.
    #[arg(long)]
    pub boxes: bool,
}

/// Color palette for objects
const OBJECT_COLORS: [[u8; 3]; 10] = [
    [255, 64, 64],
    [255, 161, 54],
    [255, 221, 51],
    [170, 255, 50],
    [50, 255, 170],
    [50, 255, 255],
    [50, 170, 255],
    [161, 50, 255],
    [255, 50, 255],
    [192, 192, 192],
];

fn object_color(index: usize) -> Rgb<u8> {
    Rgb(OBJECT_COLORS[index % OBJECT_COLORS.len()])
}

/// Run the rasterize subcommand
pub fn run(args: &RasterizeArgs) -> anyhow::Result<()> {
    if args.height == 0 || args.width == 0 {
        anyhow::bail!("canvas must be non-empty, got {}x{}", args.height, args.width);
    }

    let file = std::fs::File::open(&args.polygons)
        .with_context(|| format!("opening {:?}", args.polygons))?;
    let objects: ImagePolygons = serde_json::from_reader(file)
        .with_context(|| format!("parsing polygons from {:?}", args.polygons))?;
    info!("Rasterizing {} objects at {}x{}", objects.len(), args.height, args.width);

    let rles = objects
        .iter()
        .map(|polygons| Rle::from_object(polygons, args.height, args.width))
        .collect::<Result<Vec<_>, _>>()?;

    let mut img = RgbImage::new(args.width as u32, args.height as u32);
    for (i, rle) in rles.iter().enumerate() {
        let color = object_color(i);
        for (idx, value) in rle.decode().into_iter().enumerate() {
            if value == 0 {
                continue;
            }
            let (y, x) = (idx / args.width, idx % args.width);
            img.put_pixel(x as u32, y as u32, color);
        }
        info!("object {}: area {} bbox {:?}", i, rle.area(), rle.to_bbox());
    }

    if args.boxes {
        for (i, rle) in rles.iter().enumerate() {
            let [x, y, w, h] = rle.to_bbox();
            if w > 0.0 && h > 0.0 {
                draw_hollow_rect_mut(
                    &mut img,
                    Rect::at(x as i32, y as i32).of_size(w as u32, h as u32),
                    object_color(i),
                );
            }
        }
    }

    img.save(&args.output)
        .with_context(|| format!("writing {:?}", args.output))?;
    info!("Mask image saved to: {:?}", args.output);

    if let Some(path) = &args.rle_output {
        let file =
            std::fs::File::create(path).with_context(|| format!("creating {:?}", path))?;
        serde_json::to_writer(file, &rles)?;
        info!("Run-length encodings saved to: {:?}", path);
    }

    Ok(())
}
