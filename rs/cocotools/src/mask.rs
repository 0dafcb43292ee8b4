//! Run-length encoded binary masks.
//!
//! Masks follow the COCO layout: `counts` alternate between runs of 0s and
//! runs of 1s, always starting with a (possibly empty) run of 0s, over the
//! pixels in column-major order. Bitmaps handed in and out of this module are
//! row-major `height * width` buffers, which is what image and tensor code
//! expects.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Polygon vertices as a flat `[x0, y0, x1, y1, ...]` list in pixel coordinates.
pub type Polygon = Vec<f64>;

/// Errors produced while building or combining masks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MaskError {
    #[error("cannot merge an empty list of masks")]
    EmptyMerge,

    #[error("mask size mismatch: expected {expected_height}x{expected_width}, got {height}x{width}")]
    SizeMismatch {
        expected_height: usize,
        expected_width: usize,
        height: usize,
        width: usize,
    },

    #[error("bitmap has {len} pixels, expected {height}x{width}")]
    BitmapSize {
        len: usize,
        height: usize,
        width: usize,
    },

    #[error("polygon has an odd number of coordinates ({0})")]
    OddPolygon(usize),

    #[error("run lengths cover {got} pixels, expected {expected}")]
    CountsMismatch { expected: u64, got: u64 },
}

/// Upsampling factor used when walking polygon edges.
const POLY_SCALE: f64 = 5.0;

/// A binary mask in COCO run-length encoding.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rle {
    pub height: usize,
    pub width: usize,
    pub counts: Vec<u32>,
}

impl Rle {
    /// An all-background mask.
    pub fn zeros(height: usize, width: usize) -> Self {
        let counts = if height * width == 0 {
            Vec::new()
        } else {
            vec![(height * width) as u32]
        };
        Self {
            height,
            width,
            counts,
        }
    }

    /// Rasterize a single polygon.
    ///
    /// The boundary is walked on a grid upsampled by 5, the crossings with
    /// pixel columns are collected and turned into run lengths. A pixel is
    /// foreground when its center lies inside the polygon, so the rectangle
    /// `[x0, y0, x1, y0, x1, y1, x0, y1]` with integer corners covers exactly
    /// columns `x0..x1` and rows `y0..y1`.
    pub fn from_polygon(xy: &[f64], height: usize, width: usize) -> Result<Self, MaskError> {
        if xy.len() % 2 != 0 {
            return Err(MaskError::OddPolygon(xy.len()));
        }
        let k = xy.len() / 2;
        if k == 0 || height * width == 0 {
            return Ok(Self::zeros(height, width));
        }

        // Scaled, closed vertex list. `as i64` truncates towards zero.
        let mut x: Vec<i64> = (0..k)
            .map(|j| (POLY_SCALE * xy[2 * j] + 0.5) as i64)
            .collect();
        let mut y: Vec<i64> = (0..k)
            .map(|j| (POLY_SCALE * xy[2 * j + 1] + 0.5) as i64)
            .collect();
        x.push(x[0]);
        y.push(y[0]);

        // Dense boundary points
        let mut u = Vec::new();
        let mut v = Vec::new();
        for j in 0..k {
            let (mut xs, mut xe, mut ys, mut ye) = (x[j], x[j + 1], y[j], y[j + 1]);
            let dx = (xe - xs).abs();
            let dy = (ys - ye).abs();
            let flip = (dx >= dy && xs > xe) || (dx < dy && ys > ye);
            if flip {
                std::mem::swap(&mut xs, &mut xe);
                std::mem::swap(&mut ys, &mut ye);
            }
            if dx >= dy {
                let s = if dx == 0 {
                    0.0
                } else {
                    (ye - ys) as f64 / dx as f64
                };
                for d in 0..=dx {
                    let t = if flip { dx - d } else { d };
                    u.push(t + xs);
                    v.push((ys as f64 + s * t as f64 + 0.5) as i64);
                }
            } else {
                let s = (xe - xs) as f64 / dy as f64;
                for d in 0..=dy {
                    let t = if flip { dy - d } else { d };
                    v.push(t + ys);
                    u.push((xs as f64 + s * t as f64 + 0.5) as i64);
                }
            }
        }

        // Downsample to the column crossings of the boundary.
        let h = height as i64;
        let mut crossings: Vec<u64> = Vec::with_capacity(u.len() + 1);
        for j in 1..u.len() {
            if u[j] == u[j - 1] {
                continue;
            }
            let xd = (if u[j] < u[j - 1] { u[j] } else { u[j] - 1 }) as f64;
            let xd = (xd + 0.5) / POLY_SCALE - 0.5;
            if xd.floor() != xd || xd < 0.0 || xd > (width - 1) as f64 {
                continue;
            }
            let yd = v[j].min(v[j - 1]) as f64;
            let yd = ((yd + 0.5) / POLY_SCALE - 0.5).clamp(0.0, height as f64).ceil();
            crossings.push((xd as i64 * h + yd as i64) as u64);
        }
        crossings.push((height * width) as u64);
        crossings.sort_unstable();

        let mut prev = 0;
        for c in crossings.iter_mut() {
            let t = *c;
            *c -= prev;
            prev = t;
        }

        // Two crossings at the same pixel cancel out.
        let mut counts = vec![crossings[0] as u32];
        let mut j = 1;
        while j < crossings.len() {
            if crossings[j] > 0 {
                counts.push(crossings[j] as u32);
                j += 1;
            } else {
                j += 1;
                if j < crossings.len() {
                    if let Some(last) = counts.last_mut() {
                        *last += crossings[j] as u32;
                    }
                    j += 1;
                }
            }
        }

        Ok(Self {
            height,
            width,
            counts,
        })
    }

    /// Rasterize every part of a multi-part polygon separately.
    pub fn from_polygons(
        polygons: &[Polygon],
        height: usize,
        width: usize,
    ) -> Result<Vec<Self>, MaskError> {
        polygons
            .iter()
            .map(|p| Self::from_polygon(p, height, width))
            .collect()
    }

    /// Rasterize one object given as a list of polygon parts, unioning the parts.
    ///
    /// An object without parts yields an empty mask.
    pub fn from_object(polygons: &[Polygon], height: usize, width: usize) -> Result<Self, MaskError> {
        if polygons.is_empty() {
            return Ok(Self::zeros(height, width));
        }
        let parts = Self::from_polygons(polygons, height, width)?;
        Self::merge(&parts, false)
    }

    /// Union (or intersection when `intersect` is set) of several masks of the same size.
    pub fn merge(rles: &[Rle], intersect: bool) -> Result<Self, MaskError> {
        let (first, rest) = rles.split_first().ok_or(MaskError::EmptyMerge)?;
        first.check_counts()?;
        let mut counts = first.counts.clone();
        for other in rest {
            if other.height != first.height || other.width != first.width {
                return Err(MaskError::SizeMismatch {
                    expected_height: first.height,
                    expected_width: first.width,
                    height: other.height,
                    width: other.width,
                });
            }
            other.check_counts()?;
            if counts.is_empty() || other.counts.is_empty() {
                continue;
            }
            counts = merge_counts(&counts, &other.counts, intersect);
        }
        Ok(Self {
            height: first.height,
            width: first.width,
            counts,
        })
    }

    /// Run lengths must cover exactly `height * width` pixels.
    fn check_counts(&self) -> Result<(), MaskError> {
        let expected = (self.height * self.width) as u64;
        let got: u64 = self.counts.iter().map(|&c| c as u64).sum();
        if got != expected {
            return Err(MaskError::CountsMismatch { expected, got });
        }
        Ok(())
    }

    /// Encode a row-major bitmap; any non-zero byte is foreground.
    pub fn encode(bitmap: &[u8], height: usize, width: usize) -> Result<Self, MaskError> {
        if bitmap.len() != height * width {
            return Err(MaskError::BitmapSize {
                len: bitmap.len(),
                height,
                width,
            });
        }
        if bitmap.is_empty() {
            return Ok(Self::zeros(height, width));
        }

        let mut counts = Vec::new();
        let mut current = false;
        let mut run = 0u32;
        for x in 0..width {
            for y in 0..height {
                let pixel = bitmap[y * width + x] != 0;
                if pixel != current {
                    counts.push(run);
                    run = 0;
                    current = pixel;
                }
                run += 1;
            }
        }
        counts.push(run);

        Ok(Self {
            height,
            width,
            counts,
        })
    }

    /// Decode into a row-major bitmap of 0s and 1s.
    pub fn decode(&self) -> Vec<u8> {
        let total = self.height * self.width;
        let mut bitmap = vec![0u8; total];
        let mut idx = 0usize;
        let mut value = 0u8;
        for &count in &self.counts {
            let end = (idx + count as usize).min(total);
            if value == 1 {
                for i in idx..end {
                    let (x, y) = (i / self.height, i % self.height);
                    bitmap[y * self.width + x] = 1;
                }
            }
            idx = end;
            value ^= 1;
        }
        bitmap
    }

    /// Number of foreground pixels.
    pub fn area(&self) -> u64 {
        self.counts.iter().skip(1).step_by(2).map(|&c| c as u64).sum()
    }

    /// Tight bounding box `[x, y, w, h]` of the foreground, all zeros for an empty mask.
    pub fn to_bbox(&self) -> [f32; 4] {
        let h = self.height;
        let (mut xmin, mut ymin, mut xmax, mut ymax) = (usize::MAX, usize::MAX, 0, 0);
        let mut found = false;
        let mut idx = 0usize;
        for (i, &count) in self.counts.iter().enumerate() {
            let count = count as usize;
            if i % 2 == 1 && count > 0 {
                let (start, end) = (idx, idx + count - 1);
                let (xs, ys) = (start / h, start % h);
                let (xe, ye) = (end / h, end % h);
                xmin = xmin.min(xs);
                xmax = xmax.max(xe);
                if xs == xe {
                    ymin = ymin.min(ys);
                    ymax = ymax.max(ye);
                } else {
                    // Run wraps over at least one column boundary
                    ymin = 0;
                    ymax = h - 1;
                }
                found = true;
            }
            idx += count;
        }
        if !found {
            return [0.0; 4];
        }
        [
            xmin as f32,
            ymin as f32,
            (xmax - xmin + 1) as f32,
            (ymax - ymin + 1) as f32,
        ]
    }
}

/// Walk two run-length sequences of equal total length in lockstep.
fn merge_counts(a: &[u32], b: &[u32], intersect: bool) -> Vec<u32> {
    let (mut ca, mut cb) = (a[0], b[0]);
    let (mut ia, mut ib) = (1, 1);
    let (mut va, mut vb, mut v) = (false, false, false);
    let mut run = 0u32;
    let mut out = Vec::with_capacity(a.len() + b.len());

    loop {
        let c = ca.min(cb);
        run += c;

        ca -= c;
        if ca == 0 && ia < a.len() {
            ca = a[ia];
            ia += 1;
            va = !va;
        }
        cb -= c;
        if cb == 0 && ib < b.len() {
            cb = b[ib];
            ib += 1;
            vb = !vb;
        }

        let remaining = ca + cb;
        let prev = v;
        v = if intersect { va && vb } else { va || vb };
        if prev != v || remaining == 0 {
            out.push(run);
            run = 0;
        }
        if remaining == 0 {
            break;
        }
    }
    out
}
