//! Post-processing of head predictions into per-image detections
//!
//! Boxes come out of the head as normalized (cx, cy, w, h); detections are
//! reported as pixel (x1, y1, x2, y2) clamped to the image. Masks are
//! resized to the image and stored as run-length encodings.

use candle_core::{Result, Tensor, D};
use candle_nn::ops::{sigmoid, softmax_last_dim};
use cocotools::mask::Rle;
use tracing::debug;

use crate::config::DetrHeadConfig;
use crate::detection::Detection;
use crate::model::Predictions;

/// Scoring and thresholding policy
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessor {
    /// Sigmoid per class with top-k over query x class, instead of softmax with background
    pub use_focal_loss: bool,
    /// Maximum number of detections per image
    pub num_top_queries: usize,
    /// Detections scoring below this are dropped
    pub score_threshold: f32,
    /// Mask probability at or above which a pixel is foreground
    pub mask_threshold: f32,
}

impl Default for PostProcessor {
    fn default() -> Self {
        Self {
            use_focal_loss: false,
            num_top_queries: 100,
            score_threshold: 0.0,
            mask_threshold: 0.5,
        }
    }
}

/// (score, class, query)
type Candidate = (f32, usize, usize);

impl PostProcessor {
    /// Policy matching the classification mode of a head configuration
    pub fn for_config(config: &DetrHeadConfig) -> Self {
        Self {
            use_focal_loss: config.use_focal_loss,
            ..Default::default()
        }
    }

    /// Turn predictions into detections, sorted by descending score
    ///
    /// # Arguments
    /// * `predictions` - Last-layer head outputs for a batch
    /// * `image_sizes` - (height, width) in pixels of every image of the batch
    pub fn process(
        &self,
        predictions: &Predictions,
        image_sizes: &[(usize, usize)],
    ) -> Result<Vec<Vec<Detection>>> {
        let (bs, num_queries, num_logits) = predictions.logits.dims3()?;
        if image_sizes.len() != bs {
            candle_core::bail!(
                "got {} image sizes for a batch of {}",
                image_sizes.len(),
                bs
            );
        }

        let candidates = self.candidates(&predictions.logits)?;
        let boxes: Vec<Vec<Vec<f32>>> = predictions.boxes.to_vec3()?;
        let mask_probs = match &predictions.masks {
            Some(masks) => Some(sigmoid(masks)?),
            None => None,
        };

        let mut out = Vec::with_capacity(bs);
        for (b, image_candidates) in candidates.into_iter().enumerate() {
            let (height, width) = image_sizes[b];
            let masks = match &mask_probs {
                Some(probs) => Some(self.binary_masks(&probs.get(b)?, height, width)?),
                None => None,
            };

            let mut detections = Vec::new();
            for (score, class_id, query) in image_candidates {
                if score < self.score_threshold {
                    continue;
                }
                let [cx, cy, w, h] = match boxes[b][query][..] {
                    [cx, cy, w, h] => [cx, cy, w, h],
                    _ => candle_core::bail!("boxes must have 4 coordinates"),
                };
                let scaled = [
                    cx * width as f32,
                    cy * height as f32,
                    w * width as f32,
                    h * height as f32,
                ];
                let mut det = Detection::from_cxcywh(scaled, score, class_id).clamp(width, height);
                if let Some(masks) = &masks {
                    det = det.with_mask(masks[query].clone());
                }
                detections.push(det);
            }
            debug!(
                image = b,
                queries = num_queries,
                logits = num_logits,
                kept = detections.len(),
                "post-processed"
            );
            out.push(detections);
        }
        Ok(out)
    }

    /// Top candidates of every image, best first
    fn candidates(&self, logits: &Tensor) -> Result<Vec<Vec<Candidate>>> {
        let (_, _, num_logits) = logits.dims3()?;
        let mut per_image = if self.use_focal_loss {
            let probs: Vec<Vec<Vec<f32>>> = sigmoid(logits)?.to_vec3()?;
            probs
                .into_iter()
                .map(|queries| {
                    queries
                        .into_iter()
                        .enumerate()
                        .flat_map(|(q, classes)| {
                            classes.into_iter().enumerate().map(move |(c, s)| (s, c, q))
                        })
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        } else {
            if num_logits < 2 {
                candle_core::bail!("softmax scoring needs at least one class plus background");
            }
            // Trailing column is "no object"
            let probs = softmax_last_dim(&logits.contiguous()?)?.narrow(D::Minus1, 0, num_logits - 1)?;
            let scores: Vec<Vec<f32>> = probs.max(D::Minus1)?.to_vec2()?;
            let labels: Vec<Vec<u32>> = probs.argmax(D::Minus1)?.to_vec2()?;
            scores
                .into_iter()
                .zip(labels)
                .map(|(scores, labels)| {
                    scores
                        .into_iter()
                        .zip(labels)
                        .enumerate()
                        .map(|(q, (s, c))| (s, c as usize, q))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        };

        for candidates in per_image.iter_mut() {
            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
            candidates.truncate(self.num_top_queries);
        }
        Ok(per_image)
    }

    /// Resize one image's mask probabilities [Q, h, w] to the image and threshold them
    fn binary_masks(&self, probs: &Tensor, height: usize, width: usize) -> Result<Vec<Rle>> {
        let resized = probs
            .unsqueeze(0)?
            .upsample_nearest2d(height, width)?
            .squeeze(0)?
            .ge(self.mask_threshold as f64)?;
        let bitmaps: Vec<Vec<u8>> = resized.flatten_from(1)?.to_vec2()?;
        bitmaps
            .iter()
            .map(|bitmap| Rle::encode(bitmap, height, width).map_err(candle_core::Error::wrap))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn predictions(logits: Vec<f32>, num_classes: usize, boxes: Vec<f32>) -> Predictions {
        let device = Device::Cpu;
        let num_queries = boxes.len() / 4;
        Predictions {
            boxes: Tensor::from_vec(boxes, (1, num_queries, 4), &device).unwrap(),
            logits: Tensor::from_vec(logits, (1, num_queries, num_classes), &device).unwrap(),
            masks: None,
        }
    }

    #[test]
    fn test_background_column_dropped() {
        // Query 0 is confidently background, query 1 is class 1.
        let preds = predictions(
            vec![0.0, 0.0, 10.0, 0.0, 5.0, 0.0],
            3,
            vec![0.5, 0.5, 0.2, 0.2, 0.25, 0.5, 0.5, 1.0],
        );
        let processor = PostProcessor::default();
        let detections = processor.process(&preds, &[(100, 200)]).unwrap();
        let detections = &detections[0];

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_id, 1);
        assert!(detections[0].score > 0.9);
        assert!(detections[1].score < 0.01);
        assert!(detections.iter().all(|d| d.class_id < 2));
    }

    #[test]
    fn test_boxes_scaled_and_clamped() {
        let preds = predictions(
            vec![5.0, 0.0, 0.0, 0.0, 4.0, 0.0],
            3,
            vec![0.5, 0.5, 0.2, 0.4, 0.1, 0.5, 0.4, 0.2],
        );
        let detections = PostProcessor::default()
            .process(&preds, &[(100, 200)])
            .unwrap();
        let detections = &detections[0];

        let first = &detections[0];
        assert_eq!(first.class_id, 0);
        assert!((first.bbox[0] - 80.0).abs() < 1e-3);
        assert!((first.bbox[1] - 30.0).abs() < 1e-3);
        assert!((first.bbox[2] - 120.0).abs() < 1e-3);
        assert!((first.bbox[3] - 70.0).abs() < 1e-3);

        // cx 20px, w 80px: left edge at -20 is clamped to 0
        let second = &detections[1];
        assert_eq!(second.bbox[0], 0.0);
        assert!((second.bbox[2] - 60.0).abs() < 1e-3);
    }

    #[test]
    fn test_score_threshold_and_order() {
        let preds = predictions(
            vec![1.0, 0.0, 3.0, 0.0, 3.0, 0.0, 2.0, 0.0, 0.0],
            3,
            vec![0.5; 12],
        );
        let processor = PostProcessor {
            score_threshold: 0.3,
            ..Default::default()
        };
        let detections = processor.process(&preds, &[(10, 10)]).unwrap();
        let scores: Vec<f32> = detections[0].iter().map(|d| d.score).collect();
        assert_eq!(scores.len(), 2);
        assert!(scores[0] >= scores[1]);
        assert!(scores.iter().all(|&s| s >= 0.3));
    }

    #[test]
    fn test_focal_top_k_over_query_and_class() {
        // Both classes of query 1 outrank everything in query 0.
        let preds = predictions(vec![-4.0, -3.0, 2.0, 1.0], 2, vec![0.5; 8]);
        let processor = PostProcessor {
            use_focal_loss: true,
            num_top_queries: 2,
            ..Default::default()
        };
        let detections = processor.process(&preds, &[(10, 10)]).unwrap();
        let classes: Vec<usize> = detections[0].iter().map(|d| d.class_id).collect();
        assert_eq!(classes, vec![0, 1]);
        assert!((detections[0][0].score - 0.880797).abs() < 1e-5);
    }

    #[test]
    fn test_masks_resized_to_image() {
        let device = Device::Cpu;
        let mut preds = predictions(vec![5.0, 0.0], 2, vec![0.5, 0.5, 1.0, 1.0]);
        // 2x2 logits, only the top-left cell is foreground
        preds.masks = Some(
            Tensor::from_vec(vec![4f32, -4.0, -4.0, -4.0], (1, 1, 2, 2), &device).unwrap(),
        );
        let detections = PostProcessor::default()
            .process(&preds, &[(4, 4)])
            .unwrap();

        let mask = detections[0][0].mask.as_ref().unwrap();
        assert_eq!((mask.height, mask.width), (4, 4));
        assert_eq!(mask.area(), 4);
        assert_eq!(mask.to_bbox(), [0.0, 0.0, 2.0, 2.0]);
    }

    #[test]
    fn test_image_count_must_match() {
        let preds = predictions(vec![0.0, 0.0], 2, vec![0.5; 4]);
        assert!(PostProcessor::default().process(&preds, &[]).is_err());
    }
}
