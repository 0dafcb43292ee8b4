//! COCO annotation tooling.
//!
//! Polygon rasterization and run-length mask encoding compatible with the
//! COCO `segmentation` format.

pub mod mask;

pub use mask::{MaskError, Polygon, Rle};
