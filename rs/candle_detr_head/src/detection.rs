//! Detection output structure

use std::fmt;

use cocotools::mask::Rle;

/// A single post-processed detection in pixel coordinates.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Bounding box in [x1, y1, x2, y2] format
    pub bbox: [f32; 4],

    /// Confidence score (0.0 to 1.0)
    pub score: f32,

    /// Index into the configured categories; the background class never appears here
    pub class_id: usize,

    /// Instance mask at image resolution, when the head has a mask branch
    pub mask: Option<Rle>,
}

impl Detection {
    pub fn new(bbox: [f32; 4], score: f32, class_id: usize) -> Self {
        Self {
            bbox,
            score,
            class_id,
            mask: None,
        }
    }

    /// Create a detection from a [cx, cy, w, h] box
    pub fn from_cxcywh(cxcywh: [f32; 4], score: f32, class_id: usize) -> Self {
        let [cx, cy, w, h] = cxcywh;
        Self::new(
            [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            score,
            class_id,
        )
    }

    pub fn with_mask(mut self, mask: Rle) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Clamp the box to a `width` x `height` image
    pub fn clamp(mut self, width: usize, height: usize) -> Self {
        let (w, h) = (width as f32, height as f32);
        let [x1, y1, x2, y2] = self.bbox;
        self.bbox = [x1.clamp(0.0, w), y1.clamp(0.0, h), x2.clamp(0.0, w), y2.clamp(0.0, h)];
        self
    }

    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "class {:>3} score {:.3} box [{:.1}, {:.1}, {:.1}, {:.1}]",
            self.class_id, self.score, self.bbox[0], self.bbox[1], self.bbox[2], self.bbox[3]
        )?;
        if let Some(mask) = &self.mask {
            write!(f, " mask area {}", mask.area())?;
        }
        Ok(())
    }
}
